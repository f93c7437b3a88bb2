//! Non-INVITE client/server (C8): a single request/response exchange with
//! at most one digest retry.
//!
//! Grounded on `rsipstack`'s `DialogInner::do_request`
//! (`examples/DasWolke-rsipstack/src/dialog/dialog.rs`, the
//! `StatusCode::ProxyAuthenticationRequired | StatusCode::Unauthorized`
//! branch) for the "resend once with credentials" shape, and on
//! `uas::Uas`'s response-skeleton/authenticate-call pattern for the server
//! side, narrowed to a single send-then-done lifecycle instead of a whole
//! dialog state machine.

use rsip::prelude::{HeadersExt, ToTypedHeader, UntypedHeader};
use rsip::{Header, Method, Param, StatusCode};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::account::{dotted_username_suffix, AccountStore, SipAccount};
use crate::auth::{self, Credential, CredentialsState};
use crate::descriptor::CustomHeader;
use crate::error::{Error, Result};
use crate::transaction::{make_branch, make_tag, ServerTransaction, SipAddr, TransactionEvent, TransactionLayer};

/// Outcome of a non-INVITE client exchange.
#[derive(Debug, Clone)]
pub enum NonInviteOutcome {
    Response(rsip::Response),
    Timeout,
}

/// Sends one non-INVITE request, retrying exactly once with digest
/// credentials if challenged.
pub struct NonInviteClient {
    transaction_layer: Arc<dyn TransactionLayer>,
    credential: Option<Credential>,
    credentials_state: CredentialsState,
}

impl NonInviteClient {
    pub fn new(transaction_layer: Arc<dyn TransactionLayer>, credential: Option<Credential>) -> Self {
        Self {
            transaction_layer,
            credential,
            credentials_state: CredentialsState::new(),
        }
    }

    pub async fn send(&self, request: rsip::Request, endpoint: Option<SipAddr>) -> Result<NonInviteOutcome> {
        let mut current = request;
        loop {
            let tx = self
                .transaction_layer
                .send_non_invite(current.clone(), endpoint.clone())
                .await?;
            loop {
                match tx.recv().await {
                    Some(TransactionEvent::Provisional(_)) => continue,
                    Some(TransactionEvent::Final(response)) => {
                        if matches!(
                            response.status_code,
                            StatusCode::Unauthorized | StatusCode::ProxyAuthenticationRequired
                        ) {
                            if let Some(retried) = self.try_authenticate(&current, &response)? {
                                current = retried;
                                break;
                            }
                        }
                        return Ok(NonInviteOutcome::Response(response));
                    }
                    Some(TransactionEvent::Timeout) | None => return Ok(NonInviteOutcome::Timeout),
                    Some(TransactionEvent::TransportFailure(reason)) => {
                        return Err(Error::ProtocolError(reason));
                    }
                }
            }
        }
    }

    /// Preserve identity (Call-ID, request URI, body) but regenerate the
    /// top-Via branch, From-tag, and CSeq — exactly one retry per method.
    fn try_authenticate(&self, request: &rsip::Request, response: &rsip::Response) -> Result<Option<rsip::Request>> {
        let Some(credential) = &self.credential else {
            return Ok(None);
        };
        if !self.credentials_state.try_begin_attempt(request.method) {
            return Ok(None);
        }
        let Some(challenge) = auth::extract_challenge(response) else {
            return Ok(None);
        };
        let mut retried = auth::authenticate_request(
            request.clone(),
            credential,
            &challenge,
            &self.credentials_state,
            make_branch(),
        )?;

        let mut from = retried.from_header()?.typed()?;
        from.params.retain(|p| !matches!(p, Param::Tag(_)));
        from.params.push(Param::Tag(make_tag().into()));
        retried.headers.unique_push(Header::From(from.into()));

        let mut cseq = retried.cseq_header()?.typed()?;
        cseq.seq += 1;
        retried.headers.unique_push(Header::CSeq(cseq.into()));

        Ok(Some(retried))
    }
}

/// Copy Via/From/To(+tag)/Call-Id/CSeq off `request` for a response skeleton
/// — the non-dialog analogue of `uas::Uas::response_skeleton`.
fn response_skeleton(request: &rsip::Request, to_tag: Option<&str>) -> Result<Vec<Header>> {
    let mut headers = Vec::new();
    for h in request.headers.iter() {
        if matches!(h, Header::Via(_) | Header::From(_) | Header::CallId(_) | Header::CSeq(_)) {
            headers.push(h.clone());
        }
    }
    let mut to = request.to_header()?.typed()?;
    if let Some(tag) = to_tag {
        to.params.retain(|p| !matches!(p, Param::Tag(_)));
        to.params.push(Param::Tag(tag.to_string().into()));
    }
    headers.push(Header::To(to.into()));
    Ok(headers)
}

/// Server side of a single non-INVITE transaction: optional account
/// authentication, then `answer`/`reject` exactly once.
pub struct NonInviteServer {
    request: rsip::Request,
    server_tx: Arc<dyn ServerTransaction>,
    account_store: Option<Arc<dyn AccountStore>>,
    local_endpoint: SipAddr,
    remote_endpoint: SipAddr,
    sent_final: AtomicBool,
}

impl NonInviteServer {
    pub fn new(
        request: rsip::Request,
        server_tx: Arc<dyn ServerTransaction>,
        account_store: Option<Arc<dyn AccountStore>>,
        local_endpoint: SipAddr,
        remote_endpoint: SipAddr,
    ) -> Self {
        Self {
            request,
            server_tx,
            account_store,
            local_endpoint,
            remote_endpoint,
            sent_final: AtomicBool::new(false),
        }
    }

    pub fn request(&self) -> &rsip::Request {
        &self.request
    }

    fn from_identity(&self) -> Result<(String, String)> {
        let from = self.request.from_header()?.typed()?;
        let username = from.uri.auth.as_ref().map(|a| a.user.clone()).unwrap_or_default();
        let domain = from.uri.host_with_port.host.to_string();
        Ok((username, domain))
    }

    async fn load_sip_account(&self) -> Result<Option<SipAccount>> {
        let Some(store) = &self.account_store else {
            return Ok(None);
        };
        let (username, domain) = self.from_identity()?;
        if let Some(account) = store.get_sip_account(&username, &domain).await? {
            return Ok(Some(account));
        }
        match dotted_username_suffix(&username) {
            Some(suffix) => store.get_sip_account(suffix, &domain).await,
            None => Ok(None),
        }
    }

    /// Same account resolution as the UAS's `authenticate-call`: success
    /// returns `true`; failure sends a final 401 carrying `www_authenticate`
    /// and returns `false`.
    pub async fn authenticate(&self, www_authenticate: &str) -> Result<bool> {
        let Some(store) = self.account_store.clone() else {
            return Ok(false);
        };
        let Some(account) = self.load_sip_account().await? else {
            self.reject_unauthenticated(www_authenticate).await?;
            return Ok(false);
        };
        let ok = store
            .authenticate(&self.local_endpoint, &self.remote_endpoint, &self.request, &account)
            .await?;
        if !ok {
            self.reject_unauthenticated(www_authenticate).await?;
        }
        Ok(ok)
    }

    async fn reject_unauthenticated(&self, www_authenticate: &str) -> Result<()> {
        if self.sent_final.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut headers = response_skeleton(&self.request, None)?;
        headers.push(Header::WwwAuthenticate(www_authenticate.to_string().into()));
        headers.push(Header::UserAgent(crate::DEFAULT_USER_AGENT.to_string().into()));
        headers.push(Header::ContentLength(0.into()));
        let response = rsip::Response {
            status_code: StatusCode::Unauthorized,
            version: rsip::Version::V2,
            headers: headers.into(),
            body: vec![],
        };
        self.server_tx.send_final(response).await
    }

    pub async fn answer(
        &self,
        status: StatusCode,
        content_type: Option<String>,
        body: Option<Vec<u8>>,
        custom_headers: Vec<CustomHeader>,
    ) -> Result<()> {
        self.send_final(status, content_type, body, custom_headers).await
    }

    pub async fn reject(&self, status: StatusCode, custom_headers: Vec<CustomHeader>) -> Result<()> {
        self.send_final(status, None, None, custom_headers).await
    }

    async fn send_final(
        &self,
        status: StatusCode,
        content_type: Option<String>,
        body: Option<Vec<u8>>,
        custom_headers: Vec<CustomHeader>,
    ) -> Result<()> {
        if self.sent_final.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut headers = response_skeleton(&self.request, None)?;
        let custom_headers = crate::descriptor::filter_custom_headers(&custom_headers);
        if !custom_headers.iter().any(|h| h.name.eq_ignore_ascii_case("user-agent")) {
            headers.push(Header::UserAgent(crate::DEFAULT_USER_AGENT.to_string().into()));
        }
        for header in custom_headers {
            headers.push(Header::Other(header.name.clone(), header.value.as_bytes().to_vec()));
        }
        let body = body.unwrap_or_default();
        if !body.is_empty() {
            headers.push(Header::ContentType(
                content_type.unwrap_or_else(|| "application/sdp".to_string()).into(),
            ));
        }
        headers.push(Header::ContentLength((body.len() as u32).into()));
        let response = rsip::Response {
            status_code: status,
            version: rsip::Version::V2,
            headers: headers.into(),
            body,
        };
        self.server_tx.send_final(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockServerTransaction, MockTransactionLayer};
    use crate::transaction::{make_call_id, TransactionEvent, TransactionKey, TransactionRole};

    fn uri(s: &str) -> rsip::Uri {
        rsip::Uri::try_from(s).unwrap()
    }

    fn request(method: Method) -> rsip::Request {
        rsip::Request {
            method,
            uri: uri("sip:bob@example.net"),
            headers: vec![
                Header::Via(
                    rsip::typed::Via {
                        version: rsip::Version::V2,
                        transport: rsip::Transport::Udp,
                        uri: uri("sip:alice@192.0.2.1:5060"),
                        params: vec![Param::Branch(make_branch().into())],
                    }
                    .into(),
                ),
                Header::CallId(make_call_id().into()),
                Header::From(
                    rsip::typed::From {
                        display_name: None,
                        uri: uri("sip:alice@example.com"),
                        params: vec![Param::Tag(make_tag().into())],
                    }
                    .into(),
                ),
                Header::To(
                    rsip::typed::To {
                        display_name: None,
                        uri: uri("sip:bob@example.net"),
                        params: vec![],
                    }
                    .into(),
                ),
                Header::CSeq(rsip::typed::CSeq { seq: 1, method }.into()),
            ]
            .into(),
            body: vec![],
            version: rsip::Version::V2,
        }
    }

    #[tokio::test]
    async fn retries_once_on_challenge_then_gives_up() {
        let layer = Arc::new(MockTransactionLayer::new());
        let challenge = rsip::Response {
            status_code: StatusCode::Unauthorized,
            version: rsip::Version::V2,
            headers: vec![Header::WwwAuthenticate(
                r#"Digest realm="x", nonce="abc""#.to_string().into(),
            )]
            .into(),
            body: vec![],
        };
        layer.script_non_invite(vec![TransactionEvent::Final(challenge.clone())]);
        layer.script_non_invite(vec![TransactionEvent::Final(challenge)]);

        let client = NonInviteClient::new(layer.clone(), Some(Credential::new("alice", "secret")));
        let outcome = client.send(request(Method::Message), None).await.unwrap();
        match outcome {
            NonInviteOutcome::Response(r) => assert_eq!(r.status_code, StatusCode::Unauthorized),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(layer.sent_non_invites().len(), 2);
    }

    #[tokio::test]
    async fn server_rejects_unauthenticated_request_with_challenge() {
        let req = request(Method::Message);
        let key = TransactionKey::from_request(&req, TransactionRole::Server).unwrap();
        let (server_tx, sent) = MockServerTransaction::new(key, vec![], vec![]);
        let server = NonInviteServer::new(
            req,
            Arc::new(server_tx),
            None,
            SipAddr::black_hole(),
            SipAddr::black_hole(),
        );
        let authenticated = server.authenticate(r#"Digest realm="x", nonce="abc""#).await.unwrap();
        assert!(!authenticated);
        assert_eq!(sent.lock().unwrap().len(), 1);
        assert_eq!(sent.lock().unwrap()[0].status_code, StatusCode::Unauthorized);
    }
}
