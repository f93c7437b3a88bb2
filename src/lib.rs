//! A SIP (RFC 3261) user-agent core: client and server INVITE state
//! machines, a back-to-back user agent, a non-INVITE client/server, a
//! subscription (RFC 3265) client, a SIP-aware DNS resolver, digest
//! authentication (RFC 2617), and SDP mangling for NAT traversal.
//!
//! This crate does not own a transaction/transport stack — `transaction`
//! defines the collaborator boundary (`TransactionLayer`) a real
//! application wires its own transaction/transport layer into; `mock`
//! provides an in-memory implementation this crate's own tests are built on
//! and downstream crates can reuse the same way.

pub mod account;
pub mod auth;
pub mod b2bua;
pub mod descriptor;
pub mod dial_string;
pub mod dialog;
pub mod error;
pub mod events;
pub mod mock;
pub mod non_invite;
pub mod resolver;
pub mod sdp;
pub mod subscription;
pub mod transaction;
pub mod uac;
pub mod uas;

pub use error::{Error, Result};

/// Default `User-Agent` header value stamped on outgoing requests and
/// responses that don't carry an application-supplied override.
pub const DEFAULT_USER_AGENT: &str = concat!("sip-ua-core/", env!("CARGO_PKG_VERSION"));
