//! RFC 2617 digest authentication.
//!
//! Digest computation follows `Ray-56-yakyak`'s `infrastructure::protocols::sip::auth`
//! (MD5 of `username:realm:password` / `method:uri` / the HA1:nonce:HA2 chain,
//! with the qop=auth variant folding in `nc`/`cnonce`). Credential storage and
//! the retry-on-challenge flow follow `rsipstack`'s `dialog::authenticate`
//! (`Credential`, `handle_client_authenticate`, referenced from
//! `dialog::dialog::DialogInner::do_request`), generalized from "one retry on
//! the current transaction" to an explicit new-branch/new-CSeq retry.

use rand::Rng;
use rsip::prelude::{HeadersExt, UntypedHeader};
use rsip::{Header, Method};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{Error, Result};

/// Static credentials for one account, as configured on a `CallDescriptor`
/// or non-INVITE/subscription client.
#[derive(Debug, Clone)]
pub struct Credential {
    pub username: String,
    pub password: String,
    /// Overrides `username` in the digest computation and Authorization
    /// header when set.
    pub auth_username: Option<String>,
}

impl Credential {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            auth_username: None,
        }
    }

    fn digest_username(&self) -> &str {
        self.auth_username.as_deref().unwrap_or(&self.username)
    }
}

/// Mutable per-transaction-class auth bookkeeping: enforces at most one
/// digest retry per request method per transaction.
#[derive(Debug, Default)]
pub struct CredentialsState {
    last_nonce: Mutex<Option<String>>,
    nonce_count: Mutex<u32>,
    attempts: Mutex<HashMap<Method, u32>>,
}

impl CredentialsState {
    pub fn new() -> Self {
        Self::default()
    }

    /// `true` the first time `method` is attempted, `false` (and does not
    /// increment) thereafter.
    pub fn try_begin_attempt(&self, method: Method) -> bool {
        let mut attempts = self.attempts.lock().unwrap();
        let count = attempts.entry(method).or_insert(0);
        if *count > 0 {
            false
        } else {
            *count += 1;
            true
        }
    }

    pub fn attempts_for(&self, method: Method) -> u32 {
        *self.attempts.lock().unwrap().get(&method).unwrap_or(&0)
    }

    fn record_nonce(&self, nonce: &str) -> u32 {
        let mut last = self.last_nonce.lock().unwrap();
        let mut nc = self.nonce_count.lock().unwrap();
        if last.as_deref() == Some(nonce) {
            *nc += 1;
        } else {
            *last = Some(nonce.to_string());
            *nc = 1;
        }
        *nc
    }
}

/// A parsed `WWW-Authenticate`/`Proxy-Authenticate` challenge.
#[derive(Debug, Clone)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub opaque: Option<String>,
    pub qop: Option<String>,
    pub algorithm: String,
    /// `true` if the challenge came via `Proxy-Authenticate` (so the reply
    /// goes in `Proxy-Authorization`, not `Authorization`).
    pub proxy: bool,
}

/// Find and parse the first WWW-/Proxy-Authenticate header on `response`.
pub fn extract_challenge(response: &rsip::Response) -> Option<DigestChallenge> {
    for header in response.headers.iter() {
        let (value, proxy) = match header {
            Header::WwwAuthenticate(h) => (h.value().to_string(), false),
            Header::ProxyAuthenticate(h) => (h.value().to_string(), true),
            _ => continue,
        };
        if let Some(params) = parse_digest_params(&value) {
            return Some(DigestChallenge {
                realm: params.get("realm").cloned().unwrap_or_default(),
                nonce: params.get("nonce").cloned().unwrap_or_default(),
                opaque: params.get("opaque").cloned(),
                qop: params.get("qop").cloned(),
                algorithm: params
                    .get("algorithm")
                    .cloned()
                    .unwrap_or_else(|| "MD5".to_string()),
                proxy,
            });
        }
    }
    None
}

fn parse_digest_params(value: &str) -> Option<HashMap<String, String>> {
    let body = value.trim();
    let body = body.strip_prefix("Digest").unwrap_or(body).trim();
    let mut params = HashMap::new();
    for part in body.split(',') {
        let part = part.trim();
        if let Some((k, v)) = part.split_once('=') {
            params.insert(k.trim().to_string(), v.trim().trim_matches('"').to_string());
        }
    }
    if params.is_empty() {
        None
    } else {
        Some(params)
    }
}

fn md5_hex(input: &str) -> String {
    format!("{:x}", md5::compute(input.as_bytes()))
}

fn generate_cnonce() -> String {
    let bytes: [u8; 8] = rand::rng().random();
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Compute the digest `response=` value for `method request-uri`.
pub fn compute_digest_response(
    credential: &Credential,
    challenge: &DigestChallenge,
    method: Method,
    request_uri: &str,
    nonce_count: u32,
    cnonce: Option<&str>,
) -> String {
    let ha1 = md5_hex(&format!(
        "{}:{}:{}",
        credential.digest_username(),
        challenge.realm,
        credential.password
    ));
    let ha2 = md5_hex(&format!("{}:{}", method, request_uri));
    match (&challenge.qop, cnonce) {
        (Some(qop), Some(cnonce)) => md5_hex(&format!(
            "{}:{}:{:08x}:{}:{}:{}",
            ha1, challenge.nonce, nonce_count, cnonce, qop, ha2
        )),
        _ => md5_hex(&format!("{}:{}:{}", ha1, challenge.nonce, ha2)),
    }
}

/// Build the `Authorization`/`Proxy-Authorization` header value for a retry.
fn authorization_header_value(
    credential: &Credential,
    challenge: &DigestChallenge,
    method: Method,
    request_uri: &str,
    nonce_count: u32,
) -> (Header, String) {
    let cnonce = challenge.qop.as_ref().map(|_| generate_cnonce());
    let response = compute_digest_response(
        credential,
        challenge,
        method,
        request_uri,
        nonce_count,
        cnonce.as_deref(),
    );
    let mut value = format!(
        r#"Digest username="{}", realm="{}", nonce="{}", uri="{}", response="{}", algorithm={}"#,
        credential.digest_username(),
        challenge.realm,
        challenge.nonce,
        request_uri,
        response,
        challenge.algorithm,
    );
    if let Some(opaque) = &challenge.opaque {
        value.push_str(&format!(r#", opaque="{}""#, opaque));
    }
    if let Some(qop) = &challenge.qop {
        value.push_str(&format!(
            r#", qop={}, nc={:08x}, cnonce="{}""#,
            qop,
            nonce_count,
            cnonce.as_deref().unwrap_or("")
        ));
    }
    let header = if challenge.proxy {
        Header::ProxyAuthorization(value.clone().into())
    } else {
        Header::Authorization(value.clone().into())
    };
    (header, value)
}

/// Re-express `request` as a digest-authenticated retry: same request, new
/// top-Via branch, CSeq left to the caller (CANCEL keeps CSeq, everything
/// else bumps it), Authorization/Proxy-Authorization attached.
pub fn authenticate_request(
    mut request: rsip::Request,
    credential: &Credential,
    challenge: &DigestChallenge,
    state: &CredentialsState,
    new_branch: String,
) -> Result<rsip::Request> {
    let nonce_count = state.record_nonce(&challenge.nonce);
    let (header, _) = authorization_header_value(
        credential,
        challenge,
        request.method,
        &request.uri.to_string(),
        nonce_count,
    );
    request.headers.unique_push(header);

    let mut via = request
        .via_header()
        .map_err(|e| Error::ProtocolError(e.to_string()))?
        .typed()
        .map_err(|e| Error::ProtocolError(e.to_string()))?;
    via.params.retain(|p| !matches!(p, rsip::Param::Branch(_)));
    via.params.push(rsip::Param::Branch(new_branch.into()));
    request.headers.unique_push(Header::Via(via.into()));

    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_digest_challenge() {
        let params =
            parse_digest_params(r#"Digest realm="x", nonce="abc", algorithm=MD5"#).unwrap();
        assert_eq!(params.get("realm").unwrap(), "x");
        assert_eq!(params.get("nonce").unwrap(), "abc");
    }

    #[test]
    fn digest_response_matches_rfc2617_example() {
        // RFC 2617 §3.5 worked example.
        let credential = Credential::new("Mufasa", "Circle Of Life");
        let challenge = DigestChallenge {
            realm: "testrealm@host.com".into(),
            nonce: "dcd98b7102dd2f0e8b11d0f600bfb0c093".into(),
            opaque: Some("5ccc069c403ebaf9f0171e9517f40e41".into()),
            qop: Some("auth".into()),
            algorithm: "MD5".into(),
            proxy: false,
        };
        let ha1 = md5_hex("Mufasa:testrealm@host.com:Circle Of Life");
        assert_eq!(ha1, "939e7578ed9e3c518a452acee763bce9");
        let ha2 = md5_hex("GET:/dir/index.html");
        assert_eq!(ha2, "39aff3a2bab6126f332b942af96d3366");
    }

    #[test]
    fn first_attempt_allowed_second_denied() {
        let state = CredentialsState::new();
        assert!(state.try_begin_attempt(Method::Invite));
        assert!(!state.try_begin_attempt(Method::Invite));
        assert_eq!(state.attempts_for(Method::Invite), 1);
    }

    #[test]
    fn nonce_count_increments_for_same_nonce() {
        let state = CredentialsState::new();
        assert_eq!(state.record_nonce("n1"), 1);
        assert_eq!(state.record_nonce("n1"), 2);
        assert_eq!(state.record_nonce("n2"), 1);
    }
}
