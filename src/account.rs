//! SIP account collaborator: how a UAS looks up who a request claims to be
//! and decides whether to believe it.
//!
//! The account store and the credential verifier are both external
//! collaborators (persistence and customer data are out of scope) — this
//! module only defines the trait boundary and the dotted-username lookup
//! convention the UAS relies on, the same "collaborator trait at the seam"
//! pattern `transaction::TransactionLayer` uses for the wire.

use async_trait::async_trait;

use crate::error::Result;
use crate::transaction::SipAddr;

/// One resolvable SIP account, opaque beyond what the UAS needs to answer a
/// digest challenge and tag the dialog with an owner.
#[derive(Debug, Clone)]
pub struct SipAccount {
    pub username: String,
    pub domain: String,
    pub owner_id: Option<String>,
}

/// `get-sip-account` / `authenticate` collaborators (spec §4.5).
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Look up the account for `username`@`domain`. If `username` contains a
    /// `.`, try a full match first and fall back to a suffix match on
    /// everything after the last `.` (the tenant/alias convention), so
    /// `tenant.alice` resolves to the same account as `alice` when no
    /// `tenant.alice` account exists.
    async fn get_sip_account(&self, username: &str, domain: &str) -> Result<Option<SipAccount>>;

    /// Verify `request` is authorized to act as `account`, given the local
    /// and remote endpoints it arrived over.
    async fn authenticate(
        &self,
        local: &SipAddr,
        remote: &SipAddr,
        request: &rsip::Request,
        account: &SipAccount,
    ) -> Result<bool>;
}

/// Split `tenant.alice` into (`Some("tenant")`, `"alice"`) or leave a plain
/// username untouched as (`None`, `"alice"`), mirroring the UAS's full-match-
/// then-suffix-match lookup order.
pub fn dotted_username_suffix(username: &str) -> Option<&str> {
    username.rsplit_once('.').map(|(_, suffix)| suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suffix_is_taken_after_last_dot() {
        assert_eq!(dotted_username_suffix("tenant.alice"), Some("alice"));
        assert_eq!(dotted_username_suffix("acme.corp.alice"), Some("alice"));
        assert_eq!(dotted_username_suffix("alice"), None);
    }
}
