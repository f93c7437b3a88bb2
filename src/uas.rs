//! UAS (C6): the server INVITE state machine.
//!
//! Grounded on `rsipstack`'s `DialogInner::make_response`
//! (`examples/DasWolke-rsipstack/src/dialog/dialog.rs`) for response
//! construction — copy Via/From/To(+tag)/CSeq/Call-Id/Record-Route off the
//! original request, attach Contact and any extra headers, stamp
//! Content-Length — generalized into the full
//! Received→Authenticated→Proceeding→{Answered|Rejected|Redirected|Cancelled}
//! machine with the offer/answer-in-ACK deferral and account-store
//! authentication the original request/response builder never had to do.

use rsip::prelude::{HeadersExt, ToTypedHeader, UntypedHeader};
use rsip::{Header, Param, StatusCode};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

use crate::account::{dotted_username_suffix, AccountStore, SipAccount};
use crate::auth::{self, Credential, CredentialsState};
use crate::descriptor::CustomHeader;
use crate::dialog::{Dialog, DialogState, TerminatedReason, TransferMode};
use crate::error::{Error, Result};
use crate::events::{CallEvent, CallRecordSink, EventSender, UasState};
use crate::transaction::{make_branch, make_tag, ServerTransaction, SipAddr, TransactionEvent, TransactionLayer};

/// Server INVITE state machine for one incoming call.
///
/// One `Uas` is built from a single received INVITE and its `ServerTransaction`
/// handle; `progress`/`answer`/`reject`/`redirect` each send at most the
/// responses their names describe, guarded by `sent_final` so a late or
/// duplicate call is a silent no-op rather than a protocol violation.
pub struct Uas {
    invite: rsip::Request,
    server_tx: Arc<dyn ServerTransaction>,
    transaction_layer: Arc<dyn TransactionLayer>,
    account_store: Option<Arc<dyn AccountStore>>,
    local_contact: rsip::Uri,
    local_endpoint: SipAddr,
    remote_endpoint: SipAddr,
    call_duration_limit: Option<Duration>,
    events: EventSender<CallEvent>,
    cdr: Option<Arc<dyn CallRecordSink>>,

    phase: Mutex<UasState>,
    dialog: Mutex<Option<Arc<Dialog>>>,
    to_tag: Mutex<Option<String>>,
    last_progress: Mutex<Option<StatusCode>>,
    sent_final: AtomicBool,
    is_authenticated: AtomicBool,
    prack_negotiated: AtomicBool,
    no_cdr: AtomicBool,
    owner: Mutex<Option<String>>,
    dial_plan_context_id: Mutex<Option<String>>,
    /// Credentials for the account this INVITE was authenticated against, if
    /// any — reused to retry a locally-initiated BYE challenged by the peer.
    credential: Option<Credential>,
    credentials_state: CredentialsState,
}

impl Uas {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        invite: rsip::Request,
        server_tx: Arc<dyn ServerTransaction>,
        transaction_layer: Arc<dyn TransactionLayer>,
        local_contact: rsip::Uri,
        local_endpoint: SipAddr,
        remote_endpoint: SipAddr,
        call_duration_limit: Option<Duration>,
        events: EventSender<CallEvent>,
        account_store: Option<Arc<dyn AccountStore>>,
        credential: Option<Credential>,
        cdr: Option<Arc<dyn CallRecordSink>>,
    ) -> Self {
        Self {
            invite,
            server_tx,
            transaction_layer,
            account_store,
            local_contact,
            local_endpoint,
            remote_endpoint,
            call_duration_limit,
            events,
            cdr,
            phase: Mutex::new(UasState::Received),
            dialog: Mutex::new(None),
            to_tag: Mutex::new(None),
            last_progress: Mutex::new(None),
            sent_final: AtomicBool::new(false),
            is_authenticated: AtomicBool::new(false),
            prack_negotiated: AtomicBool::new(false),
            no_cdr: AtomicBool::new(false),
            owner: Mutex::new(None),
            dial_plan_context_id: Mutex::new(None),
            credential,
            credentials_state: CredentialsState::new(),
        }
    }

    pub fn invite(&self) -> &rsip::Request {
        &self.invite
    }

    pub fn phase(&self) -> UasState {
        *self.phase.lock().unwrap()
    }

    pub fn dialog(&self) -> Option<Arc<Dialog>> {
        self.dialog.lock().unwrap().clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.is_authenticated.load(Ordering::SeqCst)
    }

    pub fn owner(&self) -> Option<String> {
        self.owner.lock().unwrap().clone()
    }

    pub fn set_owner(&self, owner: impl Into<String>) {
        *self.owner.lock().unwrap() = Some(owner.into());
    }

    pub fn dial_plan_context_id(&self) -> Option<String> {
        self.dial_plan_context_id.lock().unwrap().clone()
    }

    pub fn set_dial_plan_context_id(&self, id: impl Into<String>) {
        *self.dial_plan_context_id.lock().unwrap() = Some(id.into());
    }

    /// Suppress the CDR hook for the rest of this call's lifetime.
    pub fn no_cdr(&self) {
        self.no_cdr.store(true, Ordering::SeqCst);
    }

    fn transition(&self, state: UasState) {
        *self.phase.lock().unwrap() = state;
    }

    fn emit(&self, event: CallEvent) {
        let _ = self.events.send(event);
    }

    fn ensure_to_tag(&self) -> String {
        let mut tag = self.to_tag.lock().unwrap();
        if let Some(existing) = tag.as_ref() {
            return existing.clone();
        }
        let fresh = make_tag();
        *tag = Some(fresh.clone());
        fresh
    }

    fn from_identity(&self) -> Result<(String, String)> {
        let from = self.invite.from_header()?.typed()?;
        let username = from
            .uri
            .auth
            .as_ref()
            .map(|a| a.user.clone())
            .unwrap_or_default();
        let domain = from.uri.host_with_port.host.to_string();
        Ok((username, domain))
    }

    fn invite_supports_100rel(&self) -> bool {
        self.invite
            .headers
            .iter()
            .any(|h| matches!(h, Header::Supported(s) if s.value().contains("100rel")))
    }

    /// `get-sip-account`, full-match-then-dotted-suffix-match, for the
    /// identity claimed by the INVITE's From header.
    pub async fn load_sip_account(&self) -> Result<Option<SipAccount>> {
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

    /// Resolve and verify the caller's identity. On success marks
    /// `is_authenticated` and adopts the account's owner metadata. On
    /// failure (account not found, or `authenticate` rejects) sends a final
    /// 401 carrying `www_authenticate` as the challenge and returns `false`.
    pub async fn authenticate_call(&self, www_authenticate: &str) -> Result<bool> {
        let Some(store) = self.account_store.clone() else {
            return Ok(false);
        };
        let Some(account) = self.load_sip_account().await? else {
            self.send_auth_challenge(www_authenticate).await?;
            return Ok(false);
        };
        let ok = store
            .authenticate(&self.local_endpoint, &self.remote_endpoint, &self.invite, &account)
            .await?;
        if ok {
            self.is_authenticated.store(true, Ordering::SeqCst);
            if let Some(owner) = &account.owner_id {
                *self.owner.lock().unwrap() = Some(owner.clone());
            }
            self.transition(UasState::Authenticated);
            self.emit(CallEvent::UasStateChanged(UasState::Authenticated));
            Ok(true)
        } else {
            self.send_auth_challenge(www_authenticate).await?;
            Ok(false)
        }
    }

    async fn send_auth_challenge(&self, www_authenticate: &str) -> Result<()> {
        if self.sent_final.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let to_tag = self.ensure_to_tag();
        let mut headers = self.response_skeleton(Some(&to_tag))?;
        headers.push(Header::WwwAuthenticate(www_authenticate.to_string().into()));
        headers.push(Header::ContentLength(0.into()));
        let response = rsip::Response {
            status_code: StatusCode::Unauthorized,
            version: rsip::Version::V2,
            headers: headers.into(),
            body: vec![],
        };
        self.server_tx.send_final(response).await?;
        self.transition(UasState::Rejected);
        self.emit(CallEvent::UasStateChanged(UasState::Rejected));
        Ok(())
    }

    /// Copy Via/From/To(+tag)/CSeq/Call-Id/Record-Route from the original
    /// INVITE. `to_tag` is omitted for 100 Trying, stamped on everything else.
    fn response_skeleton(&self, to_tag: Option<&str>) -> Result<Vec<Header>> {
        let mut headers = Vec::new();
        for h in self.invite.headers.iter() {
            match h {
                Header::Via(_) | Header::From(_) | Header::CallId(_) | Header::CSeq(_)
                | Header::RecordRoute(_) => headers.push(h.clone()),
                _ => {}
            }
        }
        let mut to = self.invite.to_header()?.typed()?;
        if let Some(tag) = to_tag {
            to.params.retain(|p| !matches!(p, Param::Tag(_)));
            to.params.push(Param::Tag(tag.to_string().into()));
        }
        headers.push(Header::To(to.into()));
        Ok(headers)
    }

    #[allow(clippy::too_many_arguments)]
    fn build_response(
        &self,
        status: StatusCode,
        to_tag: Option<&str>,
        contact: Option<rsip::Uri>,
        custom_headers: &[CustomHeader],
        content_type: Option<String>,
        body: Option<Vec<u8>>,
        require_100rel: bool,
    ) -> Result<rsip::Response> {
        let mut headers = self.response_skeleton(to_tag)?;
        if let Some(uri) = contact {
            headers.push(Header::Contact(
                rsip::typed::Contact {
                    display_name: None,
                    uri,
                    params: vec![],
                }
                .into(),
            ));
        }
        if require_100rel {
            headers.push(Header::Require("100rel".to_string().into()));
        }
        let custom_headers = crate::descriptor::filter_custom_headers(custom_headers);
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
        Ok(rsip::Response {
            status_code: status,
            version: rsip::Version::V2,
            headers: headers.into(),
            body,
        })
    }

    /// Send a provisional response. Non-1xx statuses are rejected (logged,
    /// no wire action). Once in `Proceeding`, further 100 Trying are dropped;
    /// 183 Session Progress with a body always goes through; any other
    /// provisional must move the negotiation forward (never backward).
    pub async fn progress(
        &self,
        status: StatusCode,
        reason: Option<String>,
        custom_headers: Vec<CustomHeader>,
        content_type: Option<String>,
        body: Option<Vec<u8>>,
    ) -> Result<()> {
        if !is_provisional(&status) {
            tracing::warn!("progress() called with non-provisional status {:?}; ignored", status);
            return Ok(());
        }
        if reason.is_some() {
            debug!("progress() reason-phrase override has no wire representation; ignored");
        }
        let has_body = body.as_ref().map(|b| !b.is_empty()).unwrap_or(false);
        {
            let mut last = self.last_progress.lock().unwrap();
            if let Some(prev) = last.clone() {
                if status == StatusCode::Trying {
                    return Ok(());
                }
                let bypass = status == StatusCode::SessionProgress && has_body;
                if !bypass && provisional_rank(&status) < provisional_rank(&prev) {
                    return Ok(());
                }
            }
            *last = Some(status.clone());
        }

        self.transition(UasState::Proceeding);
        self.emit(CallEvent::UasStateChanged(UasState::Proceeding));

        let to_tag = if status == StatusCode::Trying {
            None
        } else {
            Some(self.ensure_to_tag())
        };
        let contact = if status == StatusCode::Trying {
            None
        } else {
            Some(self.local_contact.clone())
        };
        let require_100rel = status == StatusCode::SessionProgress && has_body && self.invite_supports_100rel();
        if require_100rel {
            self.prack_negotiated.store(true, Ordering::SeqCst);
        }

        let response = self.build_response(
            status,
            to_tag.as_deref(),
            contact,
            &custom_headers,
            content_type,
            body,
            require_100rel,
        )?;
        self.server_tx.send_provisional(response).await?;
        Ok(())
    }

    /// Send the final 2xx. No-op if a final response already went out. For
    /// an offerless INVITE, dialog construction is deferred until the ACK
    /// carries the answer.
    pub async fn answer(
        &self,
        content_type: Option<String>,
        body: Option<Vec<u8>>,
        to_tag_override: Option<String>,
        transfer_mode: TransferMode,
        custom_headers: Vec<CustomHeader>,
    ) -> Result<()> {
        if self.sent_final.swap(true, Ordering::SeqCst) {
            debug!("answer() called after a final response was already sent; ignored");
            return Ok(());
        }
        let to_tag = to_tag_override.unwrap_or_else(|| self.ensure_to_tag());
        let response = self.build_response(
            StatusCode::OK,
            Some(&to_tag),
            Some(self.local_contact.clone()),
            &custom_headers,
            content_type,
            body,
            false,
        )?;
        self.server_tx.send_final(response).await?;
        self.transition(UasState::Answered);
        self.emit(CallEvent::UasStateChanged(UasState::Answered));

        let had_offer = !self.invite.body.is_empty();
        let dialog = if had_offer {
            Some(self.build_confirmed_dialog(&to_tag, transfer_mode)?)
        } else if self.server_tx.recv_ack().await.is_some() {
            Some(self.build_confirmed_dialog(&to_tag, transfer_mode)?)
        } else {
            None
        };

        if let Some(dialog) = dialog {
            let dialog = Arc::new(dialog);
            *self.dialog.lock().unwrap() = Some(dialog.clone());
            if !self.no_cdr.load(Ordering::SeqCst) {
                if let Some(cdr) = &self.cdr {
                    cdr.on_answered(&self.invite.call_id_header()?.value().to_string()).await;
                }
            }
            self.emit(CallEvent::OnDialogueCreated(dialog));
        }
        Ok(())
    }

    fn build_confirmed_dialog(&self, to_tag: &str, transfer_mode: TransferMode) -> Result<Dialog> {
        let dialog = Dialog::from_uas_2xx(
            &self.invite,
            to_tag,
            self.local_contact.clone(),
            transfer_mode,
            self.call_duration_limit,
        )?;
        if self.prack_negotiated.load(Ordering::SeqCst) {
            dialog.set_prack_required(true);
        }
        dialog.transition(DialogState::Confirmed);
        Ok(dialog)
    }

    /// Send a final error response. Only statuses other than the 1xx/2xx
    /// family this state machine otherwise sends are accepted.
    pub async fn reject(
        &self,
        status: StatusCode,
        reason: Option<String>,
        custom_headers: Vec<CustomHeader>,
    ) -> Result<()> {
        if !is_rejectable(&status) {
            return Err(Error::InvalidDescriptor(format!(
                "reject() called with non-error status {:?}",
                status
            )));
        }
        if self.sent_final.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if reason.is_some() {
            debug!("reject() reason-phrase override has no wire representation; ignored");
        }
        let to_tag = self.ensure_to_tag();
        let response = self.build_response(status.clone(), Some(&to_tag), None, &custom_headers, None, None, false)?;
        self.server_tx.send_final(response).await?;
        self.transition(UasState::Rejected);
        self.emit(CallEvent::UasStateChanged(UasState::Rejected));
        if !self.no_cdr.load(Ordering::SeqCst) {
            if let Some(cdr) = &self.cdr {
                cdr.on_terminated(
                    &self.invite.call_id_header()?.value().to_string(),
                    &format!("{:?}", status),
                )
                .await;
            }
        }
        Ok(())
    }

    /// Send a 3xx redirect with `target` as the Contact.
    pub async fn redirect(
        &self,
        status: StatusCode,
        target: rsip::Uri,
        custom_headers: Vec<CustomHeader>,
    ) -> Result<()> {
        if !is_redirect(&status) {
            return Err(Error::InvalidDescriptor(format!(
                "redirect() called with non-3xx status {:?}",
                status
            )));
        }
        if self.sent_final.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let to_tag = self.ensure_to_tag();
        let response = self.build_response(status, Some(&to_tag), Some(target), &custom_headers, None, None, false)?;
        self.server_tx.send_final(response).await?;
        self.transition(UasState::Redirected);
        self.emit(CallEvent::UasStateChanged(UasState::Redirected));
        if !self.no_cdr.load(Ordering::SeqCst) {
            if let Some(cdr) = &self.cdr {
                cdr.on_terminated(&self.invite.call_id_header()?.value().to_string(), "redirected").await;
            }
        }
        Ok(())
    }

    /// Tear down the confirmed dialog. `client_hungup` is `true` when the
    /// remote party's BYE already arrived (no BYE of our own to send), `false`
    /// when the local application is hanging up an answered call.
    pub async fn hangup(&self, client_hungup: bool) -> Result<()> {
        let Some(dialog) = self.dialog() else {
            return Err(Error::ProtocolError("no confirmed dialog".into()));
        };
        if !client_hungup {
            let bye = dialog.make_request(rsip::Method::Bye, None, vec![], None)?;
            let tx = self.transaction_layer.send_non_invite(bye.clone(), None).await?;
            if let Some(TransactionEvent::Final(response)) = tx.recv().await {
                if matches!(
                    response.status_code,
                    StatusCode::Unauthorized | StatusCode::ProxyAuthenticationRequired
                ) {
                    self.retry_bye_with_auth(&bye, &response).await?;
                }
            }
        }
        let reason = if client_hungup {
            TerminatedReason::UacBye
        } else {
            TerminatedReason::UasBye
        };
        dialog.transition(DialogState::Terminated(reason));
        if !self.no_cdr.load(Ordering::SeqCst) {
            if let Some(cdr) = &self.cdr {
                cdr.on_terminated(&dialog.id.call_id, "bye").await;
            }
        }
        Ok(())
    }

    /// Retry a locally-initiated BYE once with digest credentials after the
    /// peer challenged it with 401/407, mirroring `Uac::retry_bye_with_auth`.
    /// No-op if this call has no credentials on file or already retried.
    async fn retry_bye_with_auth(&self, bye: &rsip::Request, response: &rsip::Response) -> Result<()> {
        if !self.credentials_state.try_begin_attempt(rsip::Method::Bye) {
            return Ok(());
        }
        let Some(credential) = &self.credential else {
            tracing::warn!("peer challenged our BYE; no credentials to retry with");
            return Ok(());
        };
        let Some(challenge) = auth::extract_challenge(response) else {
            return Ok(());
        };
        debug!("retrying BYE with digest authentication");
        let retried = auth::authenticate_request(
            bye.clone(),
            credential,
            &challenge,
            &self.credentials_state,
            make_branch(),
        )?;
        self.transaction_layer.send_non_invite(retried, None).await?;
        Ok(())
    }

    /// Await a CANCEL for this transaction. Resolves once the transaction
    /// layer surfaces one (it answers the CANCEL itself with 487; this is
    /// purely the `CallCancelled` notification), or once a final response
    /// wins the race and there is nothing left to cancel.
    pub async fn watch_cancel(&self) {
        if self.server_tx.recv_cancel().await.is_some() && !self.sent_final.swap(true, Ordering::SeqCst) {
            self.transition(UasState::Cancelled);
            self.emit(CallEvent::UasStateChanged(UasState::Cancelled));
            self.emit(CallEvent::CallCancelled);
        }
    }
}

fn is_provisional(status: &StatusCode) -> bool {
    matches!(status, StatusCode::Trying | StatusCode::Ringing | StatusCode::SessionProgress)
}

fn provisional_rank(status: &StatusCode) -> u8 {
    match status {
        StatusCode::Trying => 0,
        StatusCode::Ringing | StatusCode::SessionProgress => 1,
        _ => 2,
    }
}

fn is_rejectable(status: &StatusCode) -> bool {
    !matches!(
        status,
        StatusCode::Trying | StatusCode::Ringing | StatusCode::SessionProgress | StatusCode::OK | StatusCode::Accepted
    )
}

fn is_redirect(status: &StatusCode) -> bool {
    matches!(
        status,
        StatusCode::MultipleChoices
            | StatusCode::MovedPermanently
            | StatusCode::MovedTemporarily
            | StatusCode::UseProxy
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockServerTransaction;
    use crate::transaction::{make_branch, make_call_id, make_tag as make_remote_tag, TransactionKey, TransactionRole};

    fn uri(s: &str) -> rsip::Uri {
        rsip::Uri::try_from(s).unwrap()
    }

    fn invite_request(with_offer: bool) -> rsip::Request {
        let branch = make_branch();
        let mut headers: Vec<Header> = vec![
            Header::Via(
                rsip::typed::Via {
                    version: rsip::Version::V2,
                    transport: rsip::Transport::Udp,
                    uri: uri("sip:alice@192.0.2.1:5060"),
                    params: vec![Param::Branch(branch.into())],
                }
                .into(),
            ),
            Header::CallId(make_call_id().into()),
            Header::From(
                rsip::typed::From {
                    display_name: None,
                    uri: uri("sip:alice@example.com"),
                    params: vec![Param::Tag(make_remote_tag().into())],
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
            Header::CSeq(
                rsip::typed::CSeq {
                    seq: 1,
                    method: rsip::Method::Invite,
                }
                .into(),
            ),
            Header::MaxForwards(70.into()),
            Header::Contact(
                rsip::typed::Contact {
                    display_name: None,
                    uri: uri("sip:alice@192.0.2.1:5060"),
                    params: vec![],
                }
                .into(),
            ),
        ];
        let body = if with_offer { b"v=0\r\n".to_vec() } else { vec![] };
        headers.push(Header::ContentLength((body.len() as u32).into()));
        rsip::Request {
            method: rsip::Method::Invite,
            uri: uri("sip:bob@example.net"),
            headers: headers.into(),
            body,
            version: rsip::Version::V2,
        }
    }

    fn new_uas(
        invite: rsip::Request,
        acks: Vec<rsip::Request>,
    ) -> (Arc<Uas>, crate::events::EventReceiver<CallEvent>, Arc<Mutex<Vec<rsip::Response>>>) {
        let key = TransactionKey::from_request(&invite, TransactionRole::Server).unwrap();
        let (server_tx, sent) = MockServerTransaction::new(key, acks, vec![]);
        let (tx, rx) = crate::events::channel();
        let uas = Arc::new(Uas::new(
            invite,
            Arc::new(server_tx),
            Arc::new(crate::mock::MockTransactionLayer::new()),
            uri("sip:bob@192.0.2.9:5060"),
            SipAddr::black_hole(),
            SipAddr::black_hole(),
            None,
            tx,
            None,
            None,
            None,
        ));
        (uas, rx, sent)
    }

    #[tokio::test]
    async fn answer_with_offer_creates_dialog_immediately() {
        let (uas, mut rx, sent) = new_uas(invite_request(true), vec![]);
        uas.answer(None, Some(b"v=0\r\n".to_vec()), None, TransferMode::Default, vec![])
            .await
            .unwrap();
        assert!(matches!(rx.recv().await, Some(CallEvent::UasStateChanged(UasState::Answered))));
        assert!(matches!(rx.recv().await, Some(CallEvent::OnDialogueCreated(_))));
        assert!(uas.dialog().unwrap().is_confirmed());
        assert_eq!(sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn answer_without_offer_waits_for_ack() {
        let ack = rsip::Request {
            method: rsip::Method::Ack,
            uri: uri("sip:alice@192.0.2.1:5060"),
            headers: vec![].into(),
            body: b"v=0\r\n".to_vec(),
            version: rsip::Version::V2,
        };
        let (uas, mut rx, _sent) = new_uas(invite_request(false), vec![ack]);
        uas.answer(None, Some(b"v=0\r\n".to_vec()), None, TransferMode::Default, vec![])
            .await
            .unwrap();
        assert!(matches!(rx.recv().await, Some(CallEvent::UasStateChanged(UasState::Answered))));
        assert!(matches!(rx.recv().await, Some(CallEvent::OnDialogueCreated(_))));
        assert!(uas.dialog().is_some());
    }

    #[tokio::test]
    async fn reject_rejects_ok_and_provisional_statuses() {
        let (uas, _rx, _sent) = new_uas(invite_request(true), vec![]);
        assert!(uas.reject(StatusCode::OK, None, vec![]).await.is_err());
        assert!(uas.reject(StatusCode::Ringing, None, vec![]).await.is_err());
    }

    #[tokio::test]
    async fn second_final_response_is_a_no_op() {
        let (uas, _rx, sent) = new_uas(invite_request(true), vec![]);
        uas.reject(StatusCode::BusyHere, None, vec![]).await.unwrap();
        uas.reject(StatusCode::Decline, None, vec![]).await.unwrap();
        assert_eq!(sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn progress_drops_repeated_trying_but_keeps_forward_progress() {
        let (uas, _rx, sent) = new_uas(invite_request(true), vec![]);
        uas.progress(StatusCode::Trying, None, vec![], None, None).await.unwrap();
        uas.progress(StatusCode::Trying, None, vec![], None, None).await.unwrap();
        uas.progress(StatusCode::Ringing, None, vec![], None, None).await.unwrap();
        assert_eq!(sent.lock().unwrap().len(), 2);
    }
}
