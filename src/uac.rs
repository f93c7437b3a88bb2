//! UAC (C5): the client INVITE state machine.
//!
//! Grounded on `rsipstack`'s `DialogLayer::do_invite`/`make_invite_request`
//! (`examples/DasWolke-rsipstack/src/dialog/invitation.rs`) for request
//! construction and the overall "build request, send, drive responses"
//! shape, generalized from a single happy-path send into the full
//! Idle→Calling→Proceeding→{Authenticating→Calling'}→Completed machine, with
//! the cancel-latch and digest-retry rules spelled out explicitly.

use rsip::prelude::{HeadersExt, ToTypedHeader, UntypedHeader};
use rsip::{Header, Method, Param, StatusCode};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::auth::{self, CredentialsState};
use crate::descriptor::CallDescriptor;
use crate::dialog::{make_via, tagged_from, untagged_to, Dialog};
use crate::error::{Error, Result};
use crate::events::{CallEvent, CallRecordSink, EventSender};
use crate::resolver::Resolver;
use crate::sdp;
use crate::transaction::{
    make_branch, make_call_id, make_tag, ClientTransaction, TransactionEvent, TransactionLayer,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UacPhase {
    Idle,
    Calling,
    Proceeding,
    Authenticating,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CancelState {
    NotRequested,
    Requested,
    Completed,
}

/// Client INVITE state machine for a single call attempt.
///
/// One `Uac` drives exactly one `call()`; `cancel()`/`hangup()`/`update()`
/// may be invoked concurrently with the in-flight `call()` future (typically
/// from a different task), synchronized through the `Mutex`-guarded fields
/// below rather than requiring `call()`'s caller to hold anything.
pub struct Uac {
    transaction_layer: Arc<dyn TransactionLayer>,
    resolver: Arc<Resolver>,
    cdr: Option<Arc<dyn CallRecordSink>>,
    events: EventSender<CallEvent>,
    local_contact: rsip::Uri,

    credentials_state: CredentialsState,
    phase: Mutex<UacPhase>,
    dialog: Mutex<Option<Arc<Dialog>>>,
    invite_tx: Mutex<Option<Arc<dyn ClientTransaction>>>,
    cancel_state: Mutex<CancelState>,
    /// I5: a 2xx that slips through after `cancel()` triggers exactly one
    /// BYE, never more, even on a retransmitted 2xx.
    hungup_on_cancel: AtomicBool,
    /// The descriptor's credential, kept around so an authenticated BYE can
    /// retry with it after the call itself has completed.
    credential: Mutex<Option<auth::Credential>>,
    /// The resolved destination, reused for the digest-retry transaction.
    endpoint: Mutex<Option<crate::transaction::SipAddr>>,
    /// The currently in-flight INVITE (pre- or post-auth-retry), the
    /// template `build_cancel` builds CANCEL from.
    current_invite: Mutex<Option<rsip::Request>>,
    /// The last digest challenge the INVITE transaction received, reused to
    /// re-authenticate CANCEL when the INVITE itself was authenticated.
    last_challenge: Mutex<Option<auth::DigestChallenge>>,
}

impl Uac {
    pub fn new(
        transaction_layer: Arc<dyn TransactionLayer>,
        resolver: Arc<Resolver>,
        local_contact: rsip::Uri,
        events: EventSender<CallEvent>,
        cdr: Option<Arc<dyn CallRecordSink>>,
    ) -> Self {
        Self {
            transaction_layer,
            resolver,
            cdr,
            events,
            local_contact,
            credentials_state: CredentialsState::new(),
            phase: Mutex::new(UacPhase::Idle),
            dialog: Mutex::new(None),
            invite_tx: Mutex::new(None),
            cancel_state: Mutex::new(CancelState::NotRequested),
            hungup_on_cancel: AtomicBool::new(false),
            credential: Mutex::new(None),
            endpoint: Mutex::new(None),
            current_invite: Mutex::new(None),
            last_challenge: Mutex::new(None),
        }
    }

    pub fn phase(&self) -> UacPhase {
        *self.phase.lock().unwrap()
    }

    pub fn dialog(&self) -> Option<Arc<Dialog>> {
        self.dialog.lock().unwrap().clone()
    }

    /// `true` once a 2xx final response has been observed for this call.
    pub fn is_answered(&self) -> bool {
        self.dialog()
            .map(|d| d.is_confirmed())
            .unwrap_or(false)
    }

    fn transition(&self, phase: UacPhase) {
        *self.phase.lock().unwrap() = phase;
    }

    fn emit(&self, event: CallEvent) {
        let _ = self.events.send(event);
    }

    fn is_empty_target(desc: &CallDescriptor) -> bool {
        matches!(&desc.target.host_with_port.host, rsip::Host::Domain(d) if d.to_string().is_empty())
    }

    /// Build the initial INVITE per the Idle → Calling transition: fresh
    /// Call-ID/branch/From-tag unless pinned, Contact installed, `Supported`
    /// advertised, custom headers filtered through the restricted-header
    /// denylist.
    fn build_invite(&self, desc: &CallDescriptor) -> Result<rsip::Request> {
        let call_id = desc.call_id.clone().unwrap_or_else(make_call_id);
        let branch = desc.branch_id.clone().unwrap_or_else(make_branch);
        let from_tag = make_tag();

        let mut from_uri = self.local_contact.clone();
        if let Some(user) = &desc.from_uri_user {
            from_uri.auth = Some(rsip::Auth {
                user: user.clone(),
                password: None,
            });
        }
        if let Some(host) = &desc.from_uri_host {
            if let Ok(parsed) = host.parse() {
                from_uri.host_with_port.host = parsed;
            }
        }

        let from = tagged_from(from_uri, from_tag).with_display_name_opt(desc.from_display_name.clone());
        let to = desc
            .to_header_override
            .clone()
            .map(untagged_to)
            .unwrap_or_else(|| untagged_to(desc.target.clone()));

        let via = make_via(None, Some(branch));
        let cseq = crate::transaction::generate_random_cseq();

        let mut headers: Vec<Header> = vec![
            Header::Via(via.into()),
            Header::CallId(call_id.into()),
            Header::From(from.into()),
            Header::To(to.into()),
            Header::CSeq(rsip::typed::CSeq {
                seq: cseq,
                method: Method::Invite,
            }
            .into()),
            Header::MaxForwards(70.into()),
            Header::Contact(
                rsip::typed::Contact {
                    display_name: None,
                    uri: self.local_contact.clone(),
                    params: vec![],
                }
                .into(),
            ),
        ];

        let mut supported = vec!["replaces".to_string(), "norefersub".to_string()];
        if desc.prack_supported {
            supported.push("100rel".to_string());
        }
        headers.push(Header::Supported(supported.join(", ").into()));

        let custom_headers = crate::descriptor::filter_custom_headers(&desc.custom_headers);
        if !custom_headers.iter().any(|h| h.name.eq_ignore_ascii_case("user-agent")) {
            headers.push(Header::UserAgent(crate::DEFAULT_USER_AGENT.to_string().into()));
        }

        for route in &desc.route_set {
            headers.push(Header::Route(route.clone()));
        }

        for header in custom_headers {
            headers.push(raw_header(&header.name, &header.value));
        }

        let body = desc.body.clone().unwrap_or_default();
        if !body.is_empty() {
            headers.push(Header::ContentType(
                desc.content_type
                    .clone()
                    .unwrap_or_else(|| "application/sdp".to_string())
                    .into(),
            ));
        }
        headers.push(Header::ContentLength((body.len() as u32).into()));

        Ok(rsip::Request {
            method: Method::Invite,
            uri: desc.target.clone(),
            headers: headers.into(),
            body,
            version: rsip::Version::V2,
        })
    }

    /// Initiate the call. Runs the full state machine to completion,
    /// delivering events as the transaction layer responds; does not return
    /// until the attempt reaches `Completed`.
    pub async fn call(self: &Arc<Self>, desc: CallDescriptor) -> Result<()> {
        if Self::is_empty_target(&desc) {
            return Err(Error::InvalidDescriptor("empty destination URI".into()));
        }
        *self.credential.lock().unwrap() = desc.credential();
        self.transition(UacPhase::Calling);

        if desc.delay_seconds > 0 {
            tokio::time::sleep(Duration::from_secs(desc.delay_seconds as u64)).await;
        }

        if self.check_pre_transaction_cancel() {
            return Ok(());
        }

        let endpoint = match self.resolver.resolve(&desc.target).await {
            Ok(ep) => ep,
            Err(_) => {
                self.transition(UacPhase::Completed);
                self.emit(CallEvent::CallFailed {
                    reason: format!(
                        "unresolvable destination `{}`",
                        desc.target.host_with_port
                    ),
                });
                return Ok(());
            }
        };

        *self.endpoint.lock().unwrap() = Some(endpoint.clone());
        let request = self.build_invite(&desc)?;
        *self.current_invite.lock().unwrap() = Some(request.clone());
        if let Some(cdr) = &self.cdr {
            cdr.on_trying(&request.call_id_header()?.value().to_string()).await;
        }

        let tx: Arc<dyn ClientTransaction> = self
            .transaction_layer
            .send_uac_invite(request.clone(), Some(endpoint))
            .await?
            .into();
        *self.invite_tx.lock().unwrap() = Some(tx.clone());

        if *self.cancel_state.lock().unwrap() == CancelState::Requested {
            if let Some(cancel) = self.build_cancel_request() {
                let _ = tx.cancel(cancel).await;
            }
        }

        self.drive(tx, request, desc).await
    }

    fn check_pre_transaction_cancel(&self) -> bool {
        let mut state = self.cancel_state.lock().unwrap();
        if *state == CancelState::Requested {
            *state = CancelState::Completed;
            drop(state);
            self.transition(UacPhase::Completed);
            self.emit(CallEvent::CallFailed {
                reason: "Call cancelled by user.".to_string(),
            });
            true
        } else {
            false
        }
    }

    async fn drive(
        self: &Arc<Self>,
        mut tx: Arc<dyn ClientTransaction>,
        mut request: rsip::Request,
        desc: CallDescriptor,
    ) -> Result<()> {
        self.transition(UacPhase::Proceeding);
        loop {
            let event = tx.recv().await;
            match event {
                Some(TransactionEvent::Provisional(response)) => {
                    self.handle_provisional(&response, &desc);
                }
                Some(TransactionEvent::Final(response)) => {
                    match self
                        .handle_final(tx.clone(), request.clone(), &desc, response)
                        .await?
                    {
                        FinalOutcome::Done => return Ok(()),
                        FinalOutcome::Retry(new_tx, new_request) => {
                            tx = new_tx;
                            request = new_request;
                            continue;
                        }
                    }
                }
                Some(TransactionEvent::Timeout) => {
                    self.transition(UacPhase::Completed);
                    if *self.cancel_state.lock().unwrap() != CancelState::Completed {
                        self.emit(CallEvent::CallFailed {
                            reason: "Timeout, no response from server".to_string(),
                        });
                    }
                    return Ok(());
                }
                Some(TransactionEvent::TransportFailure(reason)) => {
                    self.transition(UacPhase::Completed);
                    self.emit(CallEvent::CallFailed { reason });
                    return Ok(());
                }
                None => return Ok(()),
            }
        }
    }

    fn handle_provisional(&self, response: &rsip::Response, desc: &CallDescriptor) {
        match response.status_code {
            StatusCode::Trying => {
                self.emit(CallEvent::CallTrying {
                    status: response.status_code.clone(),
                });
            }
            _ => {
                let (body, content_type) = if desc.mangle_response_sdp && !response.body.is_empty()
                {
                    let mangled = sdp::mangle_sdp(&response.body, desc.mangle_ip_address);
                    (Some(mangled.body), Some("application/sdp".to_string()))
                } else if !response.body.is_empty() {
                    (Some(response.body.clone()), Some("application/sdp".to_string()))
                } else {
                    (None, None)
                };
                self.emit(CallEvent::CallRinging {
                    status: response.status_code.clone(),
                    body,
                    content_type,
                });
            }
        }
    }

    async fn handle_final(
        self: &Arc<Self>,
        tx: Arc<dyn ClientTransaction>,
        request: rsip::Request,
        desc: &CallDescriptor,
        response: rsip::Response,
    ) -> Result<FinalOutcome> {
        let status = response.status_code.clone();

        if matches!(status, StatusCode::Unauthorized | StatusCode::ProxyAuthenticationRequired) {
            if let Some(outcome) = self.try_authenticate(&request, desc, &response).await? {
                return Ok(outcome);
            }
            self.transition(UacPhase::Completed);
            self.emit(CallEvent::CallFailed {
                reason: if desc.credential().is_none() {
                    "Authentication requested when no credentials available".to_string()
                } else {
                    "Authentication with provided credentials failed".to_string()
                },
            });
            return Ok(FinalOutcome::Done);
        }

        if matches!(status, StatusCode::OK | StatusCode::Accepted) {
            self.on_success(&request, desc, &response).await?;
            let _ = tx.send_ack(self.build_ack(&request, &response, desc)?).await;
            return Ok(FinalOutcome::Done);
        }

        // RequestTerminated after our own CANCEL is silently absorbed.
        if status == StatusCode::RequestTerminated
            && *self.cancel_state.lock().unwrap() != CancelState::NotRequested
        {
            self.transition(UacPhase::Completed);
            return Ok(FinalOutcome::Done);
        }

        self.transition(UacPhase::Completed);
        self.emit(CallEvent::CallAnswered { response });
        Ok(FinalOutcome::Done)
    }

    async fn try_authenticate(
        self: &Arc<Self>,
        request: &rsip::Request,
        desc: &CallDescriptor,
        response: &rsip::Response,
    ) -> Result<Option<FinalOutcome>> {
        let Some(credential) = desc.credential() else {
            return Ok(None);
        };
        if !self.credentials_state.try_begin_attempt(Method::Invite) {
            return Ok(None);
        }
        let Some(challenge) = auth::extract_challenge(response) else {
            return Ok(None);
        };
        *self.last_challenge.lock().unwrap() = Some(challenge.clone());

        self.transition(UacPhase::Authenticating);
        let new_branch = make_branch();
        let mut retried = auth::authenticate_request(
            request.clone(),
            &credential,
            &challenge,
            &self.credentials_state,
            new_branch.clone(),
        )?;
        bump_cseq(&mut retried)?;

        let old_branch = via_branch(request).unwrap_or_default();
        if let Some(cdr) = &self.cdr {
            cdr.on_reallocated(
                &request.call_id_header()?.value().to_string(),
                &old_branch,
                &new_branch,
            )
            .await;
        }

        self.transition(UacPhase::Calling);
        let endpoint = self.endpoint.lock().unwrap().clone();
        let new_tx: Arc<dyn ClientTransaction> = self
            .transaction_layer
            .send_uac_invite(retried.clone(), endpoint)
            .await?
            .into();
        *self.invite_tx.lock().unwrap() = Some(new_tx.clone());
        *self.current_invite.lock().unwrap() = Some(retried.clone());
        self.transition(UacPhase::Proceeding);
        Ok(Some(FinalOutcome::Retry(new_tx, retried)))
    }

    async fn on_success(
        self: &Arc<Self>,
        invite: &rsip::Request,
        desc: &CallDescriptor,
        response: &rsip::Response,
    ) -> Result<()> {
        let dialog = Dialog::from_uac_2xx(
            invite,
            response,
            self.local_contact.clone(),
            desc.transfer_mode,
            desc.call_duration_limit,
        )?;
        if desc.prack_supported && response.headers.iter().any(is_100rel_require) {
            dialog.set_prack_required(true);
        }
        let dialog = Arc::new(dialog);
        dialog.transition(crate::dialog::DialogState::Confirmed);
        *self.dialog.lock().unwrap() = Some(dialog.clone());

        if let Some(cdr) = &self.cdr {
            cdr.on_answered(&invite.call_id_header()?.value().to_string()).await;
        }
        self.transition(UacPhase::Completed);
        self.emit(CallEvent::OnDialogueCreated(dialog.clone()));

        let mangled_response = if desc.mangle_response_sdp && !response.body.is_empty() {
            let mangled = sdp::mangle_sdp(&response.body, desc.mangle_ip_address);
            let mut r = response.clone();
            r.body = mangled.body;
            r
        } else {
            response.clone()
        };
        self.emit(CallEvent::CallAnswered {
            response: mangled_response,
        });

        // I5: cancel() raced a 2xx through — hang up exactly once.
        if *self.cancel_state.lock().unwrap() != CancelState::NotRequested
            && !self.hungup_on_cancel.swap(true, Ordering::SeqCst)
        {
            let dialog = dialog.clone();
            let bye = dialog.make_request(Method::Bye, None, vec![], None)?;
            let _ = self
                .transaction_layer
                .send_non_invite(bye, None)
                .await;
        }
        Ok(())
    }

    fn build_ack(
        &self,
        invite: &rsip::Request,
        response: &rsip::Response,
        _desc: &CallDescriptor,
    ) -> Result<rsip::Request> {
        let to = response.to_header()?.clone();
        let mut headers: Vec<Header> = vec![
            invite.via_header()?.clone().into(),
            Header::From(invite.from_header()?.clone().into()),
            Header::To(to),
            Header::CallId(invite.call_id_header()?.clone().into()),
            Header::CSeq(
                rsip::typed::CSeq {
                    seq: invite.cseq_header()?.seq()?,
                    method: Method::Ack,
                }
                .into(),
            ),
            Header::MaxForwards(70.into()),
        ];
        headers.push(Header::ContentLength(0.into()));
        Ok(rsip::Request {
            method: Method::Ack,
            uri: invite.uri.clone(),
            headers: headers.into(),
            body: vec![],
            version: rsip::Version::V2,
        })
    }

    /// Abort the call. No-op if no transaction exists yet (but the attempt
    /// is still marked cancelled, producing `CallFailed`), retransmits the
    /// existing CANCEL if one is outstanding, no-op if CANCEL already
    /// completed.
    pub async fn cancel(&self) {
        let mut state = self.cancel_state.lock().unwrap();
        match *state {
            CancelState::Completed => return,
            CancelState::Requested => {
                drop(state);
                if let Some(tx) = self.invite_tx.lock().unwrap().clone() {
                    if let Some(cancel) = self.build_cancel_request() {
                        let _ = tx.cancel(cancel).await;
                    }
                }
                return;
            }
            CancelState::NotRequested => *state = CancelState::Requested,
        }
        drop(state);

        let tx = self.invite_tx.lock().unwrap().clone();
        match tx {
            Some(tx) => {
                if let Some(cancel) = self.build_cancel_request() {
                    let _ = tx.cancel(cancel).await;
                }
            }
            None => {
                *self.cancel_state.lock().unwrap() = CancelState::Completed;
                self.transition(UacPhase::Completed);
                self.emit(CallEvent::CallFailed {
                    reason: "Call cancelled by user.".to_string(),
                });
            }
        }
    }

    fn build_cancel_request(&self) -> Option<rsip::Request> {
        let invite = self.current_invite.lock().unwrap().clone()?;
        match self.build_cancel(&invite) {
            Ok(cancel) => Some(cancel),
            Err(e) => {
                warn!("failed to build CANCEL: {}", e);
                None
            }
        }
    }

    /// Build a CANCEL for the given in-flight INVITE per RFC 3261 §9.1 and
    /// spec's own CANCEL-building rule: same From/To/Call-ID/CSeq number,
    /// fresh Via branch (Via sent-by otherwise unchanged), any Route headers
    /// the INVITE carried. If the INVITE carried Authorization or
    /// Proxy-Authorization, re-authenticate with the last challenge seen,
    /// incrementing the nonce-count but leaving CSeq untouched.
    fn build_cancel(&self, invite: &rsip::Request) -> Result<rsip::Request> {
        let mut via = invite
            .via_header()
            .map_err(|e| Error::ProtocolError(e.to_string()))?
            .typed()
            .map_err(|e| Error::ProtocolError(e.to_string()))?;
        via.params.retain(|p| !matches!(p, Param::Branch(_)));
        via.params.push(Param::Branch(make_branch().into()));

        let mut headers: Vec<Header> = vec![
            Header::Via(via.into()),
            Header::From(invite.from_header()?.clone().into()),
            Header::To(invite.to_header()?.clone().into()),
            Header::CallId(invite.call_id_header()?.clone().into()),
            Header::CSeq(
                rsip::typed::CSeq {
                    seq: invite.cseq_header()?.seq()?,
                    method: Method::Cancel,
                }
                .into(),
            ),
            Header::MaxForwards(70.into()),
        ];
        for header in invite.headers.iter() {
            if let Header::Route(route) = header {
                headers.push(Header::Route(route.clone()));
            }
        }
        headers.push(Header::ContentLength(0.into()));

        let mut cancel = rsip::Request {
            method: Method::Cancel,
            uri: invite.uri.clone(),
            headers: headers.into(),
            body: vec![],
            version: rsip::Version::V2,
        };

        let invite_authenticated = invite
            .headers
            .iter()
            .any(|h| matches!(h, Header::Authorization(_) | Header::ProxyAuthorization(_)));
        if invite_authenticated {
            if let (Some(credential), Some(challenge)) = (
                self.credential.lock().unwrap().clone(),
                self.last_challenge.lock().unwrap().clone(),
            ) {
                let branch = via_branch(&cancel).unwrap_or_default();
                cancel = auth::authenticate_request(
                    cancel,
                    &credential,
                    &challenge,
                    &self.credentials_state,
                    branch,
                )?;
            }
        }

        Ok(cancel)
    }

    /// Send BYE against the confirmed dialog, one digest retry on 401/407.
    pub async fn hangup(&self) -> Result<()> {
        let Some(dialog) = self.dialog() else {
            warn!("hangup() called with no confirmed dialog");
            return Err(Error::ProtocolError("no confirmed dialog".into()));
        };
        let bye = dialog.make_request(Method::Bye, None, vec![], None)?;
        let tx = self
            .transaction_layer
            .send_non_invite(bye.clone(), None)
            .await?;
        if let Some(TransactionEvent::Final(response)) = tx.recv().await {
            if matches!(
                response.status_code,
                StatusCode::Unauthorized | StatusCode::ProxyAuthenticationRequired
            ) {
                self.retry_bye_with_auth(&dialog, &bye, &response).await?;
            }
        }
        dialog.transition(crate::dialog::DialogState::Terminated(
            crate::dialog::TerminatedReason::UacBye,
        ));
        info!("dialog {} terminated by local BYE", dialog.id);
        Ok(())
    }

    async fn retry_bye_with_auth(
        &self,
        _dialog: &Dialog,
        bye: &rsip::Request,
        response: &rsip::Response,
    ) -> Result<()> {
        if !self.credentials_state.try_begin_attempt(Method::Bye) {
            return Ok(());
        }
        let Some(credential) = self.credential.lock().unwrap().clone() else {
            return Ok(());
        };
        let Some(challenge) = auth::extract_challenge(response) else {
            return Ok(());
        };
        debug!("retrying BYE with digest authentication");
        let retried = auth::authenticate_request(
            bye.clone(),
            &credential,
            &challenge,
            &self.credentials_state,
            make_branch(),
        )?;
        self.transaction_layer.send_non_invite(retried, None).await?;
        Ok(())
    }

    /// Send an in-dialog REFER asking the remote party to place a call to
    /// `target`. Progress arrives asynchronously as `sipfrag` NOTIFYs; feed
    /// each one to `handle_refer_notify`.
    pub async fn refer(&self, target: rsip::Uri) -> Result<()> {
        let Some(dialog) = self.dialog() else {
            return Err(Error::ProtocolError("no confirmed dialog".into()));
        };
        let refer = dialog.refer(target)?;
        self.transaction_layer.send_non_invite(refer, None).await?;
        Ok(())
    }

    /// Dispatch a received in-dialog NOTIFY carrying REFER progress. Always
    /// replies `200 OK`; emits `CallEvent::ReferNotify` only when the body is
    /// a recognizable `message/sipfrag` status line for our own dialog.
    pub fn handle_refer_notify(&self, request: &rsip::Request) -> Result<StatusCode> {
        let Some(dialog) = self.dialog() else {
            return Ok(StatusCode::CallTransactionDoesNotExist);
        };
        if request.call_id_header()?.value().to_string() != dialog.id.call_id {
            return Ok(StatusCode::CallTransactionDoesNotExist);
        }
        let content_type = request
            .headers
            .iter()
            .find_map(|h| match h {
                Header::ContentType(ct) => Some(ct.value().to_string()),
                _ => None,
            })
            .unwrap_or_default();
        if let Some(status_line) = Dialog::parse_refer_notify(&content_type, &request.body) {
            self.emit(CallEvent::ReferNotify { status_line });
        }
        Ok(StatusCode::OK)
    }

    /// Send an out-of-band UPDATE carrying CRM header deltas. Does not
    /// couple to call state; fire-and-forget from the caller's perspective.
    pub async fn update(&self, crm: &[(String, String)]) -> Result<()> {
        let Some(dialog) = self.dialog() else {
            return Err(Error::ProtocolError("no confirmed dialog".into()));
        };
        let extra_headers: Vec<Header> = crm
            .iter()
            .map(|(k, v)| raw_header(k, v))
            .collect();
        let update = dialog.make_request(Method::Update, None, extra_headers, None)?;
        self.transaction_layer.send_non_invite(update, None).await?;
        Ok(())
    }
}

enum FinalOutcome {
    Done,
    Retry(Arc<dyn ClientTransaction>, rsip::Request),
}

fn raw_header(name: &str, value: &str) -> Header {
    Header::Other(name.to_string(), value.as_bytes().to_vec())
}

fn bump_cseq(request: &mut rsip::Request) -> Result<()> {
    let mut cseq = request.cseq_header()?.typed()?;
    cseq.seq += 1;
    request.headers.unique_push(Header::CSeq(cseq.into()));
    Ok(())
}

fn via_branch(request: &rsip::Request) -> Option<String> {
    let via = request.via_header().ok()?.typed().ok()?;
    via.params.iter().find_map(|p| match p {
        Param::Branch(b) => Some(b.value().to_string()),
        _ => None,
    })
}

fn is_100rel_require(header: &Header) -> bool {
    matches!(header, Header::Require(r) if r.value().contains("100rel"))
}

trait FromDisplayName {
    fn with_display_name_opt(self, display_name: Option<String>) -> Self;
}

impl FromDisplayName for rsip::typed::From {
    fn with_display_name_opt(mut self, display_name: Option<String>) -> Self {
        self.display_name = display_name;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockTransactionLayer;

    fn uri(s: &str) -> rsip::Uri {
        rsip::Uri::try_from(s).unwrap()
    }

    fn response(status: StatusCode, body: Vec<u8>, to_tag: &str) -> rsip::Response {
        rsip::Response {
            status_code: status,
            version: rsip::Version::V2,
            headers: vec![
                Header::CallId("test-call-id".to_string().into()),
                Header::To(
                    rsip::typed::To {
                        display_name: None,
                        uri: uri("sip:bob@example.net"),
                        params: vec![Param::Tag(to_tag.to_string().into())],
                    }
                    .into(),
                ),
                Header::Contact(
                    rsip::typed::Contact {
                        display_name: None,
                        uri: uri("sip:bob@192.0.2.9:5060"),
                        params: vec![],
                    }
                    .into(),
                ),
            ]
            .into(),
            body,
        }
    }

    fn new_uac(layer: Arc<MockTransactionLayer>) -> (Arc<Uac>, crate::events::EventReceiver<CallEvent>) {
        let (tx, rx) = crate::events::channel();
        let uac = Arc::new(Uac::new(
            layer,
            Arc::new(Resolver::new(false)),
            uri("sip:alice@192.0.2.1:5060"),
            tx,
            None,
        ));
        (uac, rx)
    }

    #[tokio::test]
    async fn unauthenticated_call_succeeds() {
        let layer = Arc::new(MockTransactionLayer::new());
        let trying = rsip::Response {
            status_code: StatusCode::Trying,
            version: rsip::Version::V2,
            headers: vec![].into(),
            body: vec![],
        };
        let ringing = rsip::Response {
            status_code: StatusCode::Ringing,
            version: rsip::Version::V2,
            headers: vec![].into(),
            body: vec![],
        };
        let ok = response(StatusCode::OK, b"v=0\r\n".to_vec(), "totag1");
        layer.script_invite(vec![
            TransactionEvent::Provisional(trying),
            TransactionEvent::Provisional(ringing),
            TransactionEvent::Final(ok),
        ]);

        let (uac, mut rx) = new_uac(layer.clone());
        let desc = CallDescriptor::new(uri("sip:bob@192.0.2.9:5060"), uri("sip:alice@192.0.2.1:5060"));
        uac.call(desc).await.unwrap();

        assert!(matches!(rx.recv().await, Some(CallEvent::CallTrying { .. })));
        assert!(matches!(rx.recv().await, Some(CallEvent::CallRinging { .. })));
        assert!(matches!(rx.recv().await, Some(CallEvent::OnDialogueCreated(_))));
        assert!(matches!(rx.recv().await, Some(CallEvent::CallAnswered { .. })));
        assert!(uac.is_answered());
        assert_eq!(layer.sent_acks().len(), 1);
    }

    #[tokio::test]
    async fn cancel_before_any_response_fails_without_wire_cancel() {
        let layer = Arc::new(MockTransactionLayer::new());
        layer.script_invite(vec![]);
        let (uac, mut rx) = new_uac(layer.clone());
        uac.cancel().await;
        let desc = CallDescriptor::new(uri("sip:bob@192.0.2.9:5060"), uri("sip:alice@192.0.2.1:5060"));
        uac.call(desc).await.unwrap();
        match rx.recv().await {
            Some(CallEvent::CallFailed { reason }) => {
                assert_eq!(reason, "Call cancelled by user.")
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn empty_target_is_rejected_before_any_resolution() {
        let layer = Arc::new(MockTransactionLayer::new());
        let (uac, _rx) = new_uac(layer);
        let empty = rsip::Uri {
            scheme: Some(rsip::Scheme::Sip),
            auth: None,
            host_with_port: rsip::HostWithPort {
                host: rsip::Host::Domain("".into()),
                port: None,
            },
            params: vec![],
            headers: vec![],
        };
        let desc = CallDescriptor::new(empty, uri("sip:alice@192.0.2.1:5060"));
        assert!(uac.call(desc).await.is_err());
    }
}
