use crate::dialog::DialogId;
use std::fmt;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that cross the public API boundary.
///
/// Most protocol-level failures (unresolvable destinations, authentication
/// rejections, cancellation races) are caught inside the UAC/UAS/subscription
/// state machines and re-expressed as `CallEvent::CallFailed` /
/// `SubscriptionEvent::SubscriptionFailed` — they never reach here. `Error`
/// is reserved for malformed input and collaborator contract violations.
#[derive(Debug, Clone)]
pub enum Error {
    /// A descriptor or dial-string was malformed (e.g. empty destination URI).
    InvalidDescriptor(String),
    /// A `rsip::Uri` failed to parse or convert.
    InvalidUri(String),
    /// DNS/SRV resolution could not produce an endpoint.
    DnsResolutionError(String),
    /// A digest challenge or credential was invalid or missing.
    AuthenticationFailed(String),
    /// An operation was attempted against a dialog/transaction in the wrong
    /// state (e.g. `hangup()` with no confirmed dialog).
    ProtocolError(String),
    /// A dialog-scoped error, carrying the dialog identity for correlation.
    DialogError(String, DialogId),
    /// A required collaborator (SIP account store, transaction layer) was
    /// missing or returned an unexpected shape.
    MissingCollaborator(String),
    /// Escape hatch for anything else.
    Error(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidDescriptor(s) => write!(f, "invalid call descriptor: {}", s),
            Error::InvalidUri(s) => write!(f, "invalid SIP URI: {}", s),
            Error::DnsResolutionError(s) => write!(f, "DNS resolution error: {}", s),
            Error::AuthenticationFailed(s) => write!(f, "authentication failed: {}", s),
            Error::ProtocolError(s) => write!(f, "protocol error: {}", s),
            Error::DialogError(s, id) => write!(f, "dialog error on {}: {}", id, s),
            Error::MissingCollaborator(s) => write!(f, "missing collaborator: {}", s),
            Error::Error(s) => write!(f, "{}", s),
        }
    }
}

impl std::error::Error for Error {}

impl From<rsip::Error> for Error {
    fn from(e: rsip::Error) -> Self {
        Error::InvalidUri(e.to_string())
    }
}

impl From<std::net::AddrParseError> for Error {
    fn from(e: std::net::AddrParseError) -> Self {
        Error::DnsResolutionError(e.to_string())
    }
}
