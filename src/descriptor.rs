//! `CallDescriptor` (C4): immutable configuration for one outgoing call.
//!
//! Grounded on `rsipstack`'s `InviteOption` (`examples/DasWolke-rsipstack/src/dialog/invitation.rs`)
//! for the shape of "the options struct an INVITE is built from" — caller,
//! callee, contact, content-type, offer, credential, extra headers — widened
//! with the enumerated options a production dialer exposes (delay, redirect
//! mode, duration cap, SDP mangling, transfer mode, account/rate codes,
//! reinvite delay, PRACK support, route-set/proxy hints).

use std::net::IpAddr;
use std::time::Duration;

use crate::auth::Credential;
use crate::dialog::TransferMode;

pub const MAX_REINVITE_DELAY: u32 = 5;
const DEFAULT_REINVITE_DELAY: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectMode {
    None,
    NewDialPlan,
    Manual,
}

/// One opaque "Name: value" custom header supplied by the application.
#[derive(Debug, Clone)]
pub struct CustomHeader {
    pub name: String,
    pub value: String,
}

impl CustomHeader {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Header names the core silently drops from any custom-header list because
/// it already generates and owns them.
const RESTRICTED_HEADERS: &[&str] = &[
    "via",
    "from",
    "contact",
    "cseq",
    "call-id",
    "max-forwards",
    "content-length",
];

/// `true` if `name` is one of the headers the core always owns and a
/// custom-header entry for it must be dropped.
pub fn is_restricted_header(name: &str) -> bool {
    RESTRICTED_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

/// Filter a custom-header list down to the ones the core will actually
/// attach, per the passthrough rule: drop restricted names, case-insensitive.
pub fn filter_custom_headers(headers: &[CustomHeader]) -> Vec<CustomHeader> {
    headers
        .iter()
        .filter(|h| !is_restricted_header(&h.name))
        .cloned()
        .collect()
}

/// Immutable per-call configuration. Build with `CallDescriptor::new` then
/// the `with_*` builders; nothing on this type is mutated once a UAC starts
/// using it.
#[derive(Debug, Clone)]
pub struct CallDescriptor {
    pub target: rsip::Uri,
    pub contact: rsip::Uri,

    pub delay_seconds: u32,
    pub redirect_mode: RedirectMode,
    pub call_duration_limit: Option<Duration>,
    pub mangle_response_sdp: bool,
    pub mangle_ip_address: Option<IpAddr>,

    pub from_display_name: Option<String>,
    pub from_uri_user: Option<String>,
    pub from_uri_host: Option<String>,
    pub to_header_override: Option<rsip::Uri>,

    pub transfer_mode: TransferMode,
    pub request_caller_details: bool,
    pub account_code: Option<String>,
    pub rate_code: Option<String>,
    pub reinvite_delay: u32,
    pub prack_supported: bool,

    pub route_set: Vec<rsip::headers::Route>,
    pub proxy_send_from: Option<rsip::Uri>,
    pub custom_headers: Vec<CustomHeader>,

    pub auth_username: Option<String>,
    pub auth_password: Option<String>,

    pub content_type: Option<String>,
    pub body: Option<Vec<u8>>,

    pub crm: Vec<(String, String)>,

    pub branch_id: Option<String>,
    pub call_id: Option<String>,
}

impl CallDescriptor {
    pub fn new(target: rsip::Uri, contact: rsip::Uri) -> Self {
        Self {
            target,
            contact,
            delay_seconds: 0,
            redirect_mode: RedirectMode::None,
            call_duration_limit: None,
            mangle_response_sdp: true,
            mangle_ip_address: None,
            from_display_name: None,
            from_uri_user: None,
            from_uri_host: None,
            to_header_override: None,
            transfer_mode: TransferMode::Default,
            request_caller_details: false,
            account_code: None,
            rate_code: None,
            reinvite_delay: DEFAULT_REINVITE_DELAY,
            prack_supported: false,
            route_set: Vec::new(),
            proxy_send_from: None,
            custom_headers: Vec::new(),
            auth_username: None,
            auth_password: None,
            content_type: None,
            body: None,
            crm: Vec::new(),
            branch_id: None,
            call_id: None,
        }
    }

    /// `Some(Credential)` when both username and password are configured.
    pub fn credential(&self) -> Option<Credential> {
        match (&self.auth_username, &self.auth_password) {
            (Some(u), Some(p)) => Some(Credential::new(u.clone(), p.clone())),
            _ => None,
        }
    }

    /// Clamp a `reinvite-delay` value to `[0, MAX_REINVITE_DELAY]`, used both
    /// when constructing a descriptor directly and when parsing a dial
    /// string's `dr` key.
    pub fn clamp_reinvite_delay(seconds: u32) -> u32 {
        seconds.min(MAX_REINVITE_DELAY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uri(s: &str) -> rsip::Uri {
        rsip::Uri::try_from(s).unwrap()
    }

    #[test]
    fn restricted_headers_are_dropped_case_insensitively() {
        let headers = vec![
            CustomHeader::new("VIA", "bogus"),
            CustomHeader::new("X-Trace-Id", "abc123"),
            CustomHeader::new("call-id", "bogus"),
        ];
        let filtered = filter_custom_headers(&headers);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].name, "X-Trace-Id");
    }

    #[test]
    fn descriptors_with_identical_inputs_are_observably_equal() {
        let a = CallDescriptor::new(uri("sip:bob@example.net"), uri("sip:alice@192.0.2.1:5060"));
        let b = a.clone();
        assert_eq!(a.target, b.target);
        assert_eq!(a.reinvite_delay, b.reinvite_delay);
        assert_eq!(a.mangle_response_sdp, b.mangle_response_sdp);
    }

    #[test]
    fn reinvite_delay_clamps_to_max() {
        assert_eq!(CallDescriptor::clamp_reinvite_delay(100), MAX_REINVITE_DELAY);
        assert_eq!(CallDescriptor::clamp_reinvite_delay(3), 3);
    }
}
