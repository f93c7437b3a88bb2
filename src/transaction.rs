//! Collaborator boundary: the wire transport/transaction substrate.
//!
//! Everything in this module is an *interface*, not an implementation.
//! T1/T2 retransmission, 100 Trying absorption, ACK of non-2xx finals, and
//! transaction matching all live one layer down, in a transaction/transport
//! stack this crate only calls into. `src/mock.rs` provides an in-memory
//! implementation used by this crate's own tests; a real application wires
//! in its own transaction layer by implementing `TransactionLayer`.

use async_trait::async_trait;
use rand::Rng;
use rsip::Param;
use std::fmt;

use crate::error::Result;

/// A resolved network endpoint a request can be sent to.
///
/// Value type, deliberately independent of any particular transport crate so
/// that `TransactionLayer` implementors can be backed by UDP, TCP, TLS or
/// WS/WSS sockets without this crate caring.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SipAddr {
    pub transport: rsip::Transport,
    pub host_with_port: rsip::HostWithPort,
}

impl fmt::Display for SipAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.host_with_port, self.transport)
    }
}

impl SipAddr {
    pub fn new(transport: rsip::Transport, host_with_port: rsip::HostWithPort) -> Self {
        Self {
            transport,
            host_with_port,
        }
    }

    /// A sentinel endpoint with no wire meaning, used by the B2BUA for the
    /// intra-process leg where "local/remote address" isn't a real socket.
    pub fn black_hole() -> Self {
        Self {
            transport: rsip::Transport::Udp,
            host_with_port: rsip::HostWithPort {
                host: rsip::Host::Domain("b2bua.invalid".into()),
                port: None,
            },
        }
    }
}

/// Client vs. server side of a transaction, mirrors RFC 3261 §17.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionRole {
    Client,
    Server,
}

/// Identifies an in-flight request/response exchange.
///
/// Keyed the way RFC 3261 §17.2.3 matches server transactions: top Via
/// branch plus method (CANCEL matches its INVITE's branch but is a distinct
/// transaction by method).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionKey {
    pub branch: String,
    pub method: rsip::Method,
    pub role: TransactionRole,
}

impl TransactionKey {
    pub fn from_request(request: &rsip::Request, role: TransactionRole) -> Result<Self> {
        use rsip::prelude::HeadersExt;
        let via = request.via_header()?.typed()?;
        let branch = via
            .params
            .iter()
            .find_map(|p| match p {
                Param::Branch(b) => Some(b.value().to_string()),
                _ => None,
            })
            .ok_or_else(|| crate::error::Error::ProtocolError("request has no Via branch".into()))?;
        Ok(Self {
            branch,
            method: request.method,
            role,
        })
    }
}

impl fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:?}-{:?}", self.branch, self.method, self.role)
    }
}

/// Generate a new Via branch with the RFC 3261 magic cookie `z9hG4bK`.
pub fn make_branch() -> String {
    format!("z9hG4bK{}", uuid::Uuid::new_v4().simple())
}

/// Generate a new From/To tag.
pub fn make_tag() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Generate a new Call-ID.
pub fn make_call_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Generate an initial CSeq per RFC 3261 §8.1.1.5 (recommended to start below
/// 2**31; need not start at 1).
pub fn generate_random_cseq() -> u32 {
    rand::rng().random_range(1..=100_000)
}

/// Events a client transaction delivers as the wire responds.
#[derive(Debug, Clone)]
pub enum TransactionEvent {
    /// A 1xx provisional response.
    Provisional(rsip::Response),
    /// The one and only final response this transaction will ever deliver.
    Final(rsip::Response),
    /// The transaction layer gave up waiting (Timer B/F expired).
    Timeout,
    /// A transport-level send/connect failure.
    TransportFailure(String),
}

/// A single in-flight client transaction (INVITE or non-INVITE).
#[async_trait]
pub trait ClientTransaction: Send + Sync {
    fn key(&self) -> &TransactionKey;

    /// Await the next event. Returns `None` once the transaction has reached
    /// a terminal state and been torn down.
    ///
    /// Takes `&self`, not `&mut self`, so a handle can be shared (typically
    /// via `Arc`) between the task driving this loop and a concurrent caller
    /// of `cancel()` — implementations hold their event queue behind their
    /// own interior mutability.
    async fn recv(&self) -> Option<TransactionEvent>;

    /// For INVITE transactions only: send the ACK for a 2xx final response.
    /// Per §6.1, ACK of *non*-2xx finals is the transaction layer's own
    /// responsibility and never reaches this trait.
    async fn send_ack(&self, ack: rsip::Request) -> Result<()>;

    /// Abort an in-flight INVITE transaction by sending the given CANCEL
    /// request. No-op if this transaction already reached a terminal state.
    /// The caller builds `cancel` (same From/To/Call-ID/CSeq as the INVITE,
    /// new branch, re-authenticated if the INVITE was) — this trait only
    /// ships it onto the wire against the right transaction.
    async fn cancel(&self, cancel: rsip::Request) -> Result<()>;
}

/// A single in-flight server transaction (one received request, its
/// provisional/final responses, and — for INVITE — the ACK/CANCEL race).
#[async_trait]
pub trait ServerTransaction: Send + Sync {
    fn key(&self) -> &TransactionKey;

    async fn send_provisional(&self, response: rsip::Response) -> Result<()>;

    /// Send the one final response this transaction will ever send.
    async fn send_final(&self, response: rsip::Response) -> Result<()>;

    /// Resolves once the ACK for a previously sent 2xx arrives. Returns
    /// `None` if the transaction was torn down (e.g. on CANCEL) first.
    async fn recv_ack(&self) -> Option<rsip::Request>;

    /// Resolves once a CANCEL matching this INVITE transaction arrives.
    /// The UAS does not itself answer the CANCEL with 487 — that remains
    /// the transaction layer's contract — this is purely a notification so
    /// the UAS can surface `CallCancelled`.
    async fn recv_cancel(&self) -> Option<()>;
}

/// The substrate this crate is built on top of.
#[async_trait]
pub trait TransactionLayer: Send + Sync {
    async fn send_uac_invite(
        &self,
        request: rsip::Request,
        outbound_proxy: Option<SipAddr>,
    ) -> Result<Box<dyn ClientTransaction>>;

    async fn send_non_invite(
        &self,
        request: rsip::Request,
        outbound_proxy: Option<SipAddr>,
    ) -> Result<Box<dyn ClientTransaction>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_has_magic_cookie() {
        assert!(make_branch().starts_with("z9hG4bK"));
    }

    #[test]
    fn tags_are_unique() {
        assert_ne!(make_tag(), make_tag());
    }
}
