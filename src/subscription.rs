//! Subscription client (C9): SUBSCRIBE/NOTIFY lifecycle (RFC 6665).
//!
//! Grounded on `rsipstack`'s `dialog::registration::Registration` state
//! machine (`examples/DasWolke-rsipstack/src/dialog/registration.rs`) for
//! the overall shape — send, branch on status, schedule a refresh timer at
//! `expiry - margin`, retry once with digest on challenge — generalized from
//! REGISTER's single retry to SUBSCRIBE's richer response matrix (423
//! renegotiation, 403/489/481 permanent failure, up to
//! `MAX_SUBSCRIBE_ATTEMPTS` digest attempts) plus the NOTIFY half Registration
//! never has to handle.

use rsip::headers::Route;
use rsip::prelude::{HeadersExt, ToTypedHeader, UntypedHeader};
use rsip::{Header, Method, Param, StatusCode};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::warn;

use crate::auth::{self, Credential, CredentialsState};
use crate::dialog::{make_via, tagged_from, tagged_to, untagged_to, Dialog, DialogId, TransferMode};
use crate::error::Result;
use crate::events::{EventSender, SubscriptionEvent};
use crate::transaction::{
    generate_random_cseq, make_branch, make_call_id, make_tag, TransactionEvent, TransactionLayer,
    TransactionRole,
};

pub const DEFAULT_SUBSCRIBE_EXPIRY: u32 = 300;
const REFRESH_MARGIN_SECONDS: u32 = 10;
const MAX_SUBSCRIBE_ATTEMPTS: u32 = 4;

/// Immutable per-subscription configuration.
#[derive(Debug, Clone)]
pub struct SubscriptionParams {
    pub resource_uri: rsip::Uri,
    pub event_package: String,
    pub credential: Option<Credential>,
    pub expiry: u32,
    pub filter_body: Option<Vec<u8>>,
    pub filter_content_type: Option<String>,
    pub contact: Option<rsip::Uri>,
}

impl SubscriptionParams {
    pub fn new(resource_uri: rsip::Uri, event_package: impl Into<String>) -> Self {
        Self {
            resource_uri,
            event_package: event_package.into(),
            credential: None,
            expiry: DEFAULT_SUBSCRIBE_EXPIRY,
            filter_body: None,
            filter_content_type: None,
            contact: None,
        }
    }
}

enum SubscribeAttempt {
    Response(rsip::Response),
    Timeout,
}

/// Drives one SUBSCRIBE dialog's lifecycle: initial send, expiry
/// renegotiation, periodic refresh, and inbound NOTIFY bookkeeping.
pub struct SubscriptionClient {
    transaction_layer: Arc<dyn TransactionLayer>,
    local_contact: rsip::Uri,
    params: SubscriptionParams,
    events: EventSender<SubscriptionEvent>,
    credentials_state: CredentialsState,

    call_id: String,
    local_tag: Mutex<String>,
    remote_tag: Mutex<Option<String>>,
    remote_target: Mutex<rsip::Uri>,
    route_set: Mutex<Vec<Route>>,
    local_cseq: AtomicU32,
    dialog: Mutex<Option<Arc<Dialog>>>,
    exiting: AtomicBool,
    exit_notify: tokio::sync::Notify,
}

impl SubscriptionClient {
    pub fn new(
        transaction_layer: Arc<dyn TransactionLayer>,
        local_contact: rsip::Uri,
        params: SubscriptionParams,
        events: EventSender<SubscriptionEvent>,
    ) -> Self {
        let remote_target = params.resource_uri.clone();
        Self {
            transaction_layer,
            local_contact,
            call_id: make_call_id(),
            local_tag: Mutex::new(make_tag()),
            remote_tag: Mutex::new(None),
            remote_target: Mutex::new(remote_target),
            route_set: Mutex::new(Vec::new()),
            local_cseq: AtomicU32::new(generate_random_cseq()),
            dialog: Mutex::new(None),
            exiting: AtomicBool::new(false),
            exit_notify: tokio::sync::Notify::new(),
            credentials_state: CredentialsState::new(),
            events,
            params,
        }
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn dialog(&self) -> Option<Arc<Dialog>> {
        self.dialog.lock().unwrap().clone()
    }

    fn emit(&self, event: SubscriptionEvent) {
        let _ = self.events.send(event);
    }

    fn build_subscribe(&self, expiry: u32) -> Result<rsip::Request> {
        let branch = make_branch();
        let seq = self.local_cseq.fetch_add(1, Ordering::SeqCst) + 1;
        let local_tag = self.local_tag.lock().unwrap().clone();
        let remote_tag = self.remote_tag.lock().unwrap().clone();
        let target = self.remote_target.lock().unwrap().clone();

        let from = tagged_from(self.local_contact.clone(), local_tag);
        let to = match remote_tag {
            Some(tag) => tagged_to(self.params.resource_uri.clone(), tag),
            None => untagged_to(self.params.resource_uri.clone()),
        };

        let mut headers: Vec<Header> = vec![
            Header::Via(make_via(None, Some(branch)).into()),
            Header::CallId(self.call_id.clone().into()),
            Header::From(from.into()),
            Header::To(to.into()),
            Header::CSeq(
                rsip::typed::CSeq {
                    seq,
                    method: Method::Subscribe,
                }
                .into(),
            ),
            Header::MaxForwards(70.into()),
            Header::Contact(
                rsip::typed::Contact {
                    display_name: None,
                    uri: self.params.contact.clone().unwrap_or_else(|| self.local_contact.clone()),
                    params: vec![],
                }
                .into(),
            ),
            Header::Expires(expiry.into()),
            Header::Other("Event".to_string(), self.params.event_package.as_bytes().to_vec()),
            Header::UserAgent(crate::DEFAULT_USER_AGENT.to_string().into()),
        ];
        for route in self.route_set.lock().unwrap().iter() {
            headers.push(Header::Route(route.clone()));
        }

        let body = self.params.filter_body.clone().unwrap_or_default();
        if !body.is_empty() {
            headers.push(Header::ContentType(
                self.params
                    .filter_content_type
                    .clone()
                    .unwrap_or_else(|| "application/sdp".to_string())
                    .into(),
            ));
        }
        headers.push(Header::ContentLength((body.len() as u32).into()));

        Ok(rsip::Request {
            method: Method::Subscribe,
            uri: target,
            headers: headers.into(),
            body,
            version: rsip::Version::V2,
        })
    }

    /// Send one SUBSCRIBE, retrying with digest credentials up to
    /// `MAX_SUBSCRIBE_ATTEMPTS` times on 401/407.
    async fn send_subscribe(&self, expiry: u32) -> Result<SubscribeAttempt> {
        let mut request = self.build_subscribe(expiry)?;
        let mut attempts = 0u32;
        loop {
            let tx = self.transaction_layer.send_non_invite(request.clone(), None).await?;
            loop {
                match tx.recv().await {
                    Some(TransactionEvent::Provisional(_)) => continue,
                    Some(TransactionEvent::Final(response)) => {
                        if matches!(
                            response.status_code,
                            StatusCode::Unauthorized | StatusCode::ProxyAuthenticationRequired
                        ) && attempts < MAX_SUBSCRIBE_ATTEMPTS
                        {
                            if let Some(retried) = self.authenticate_subscribe(&request, &response)? {
                                attempts += 1;
                                request = retried;
                                break;
                            }
                        }
                        return Ok(SubscribeAttempt::Response(response));
                    }
                    Some(TransactionEvent::Timeout) | None => return Ok(SubscribeAttempt::Timeout),
                    Some(TransactionEvent::TransportFailure(_)) => return Ok(SubscribeAttempt::Timeout),
                }
            }
        }
    }

    /// Call-ID is preserved; branch, CSeq, and From-tag are all regenerated.
    fn authenticate_subscribe(
        &self,
        request: &rsip::Request,
        response: &rsip::Response,
    ) -> Result<Option<rsip::Request>> {
        let Some(credential) = &self.params.credential else {
            return Ok(None);
        };
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

        let new_tag = make_tag();
        *self.local_tag.lock().unwrap() = new_tag.clone();
        let mut from = retried.from_header()?.typed()?;
        from.params.retain(|p| !matches!(p, Param::Tag(_)));
        from.params.push(Param::Tag(new_tag.into()));
        retried.headers.unique_push(Header::From(from.into()));

        let seq = self.local_cseq.fetch_add(1, Ordering::SeqCst) + 1;
        let mut cseq = retried.cseq_header()?.typed()?;
        cseq.seq = seq;
        retried.headers.unique_push(Header::CSeq(cseq.into()));

        Ok(Some(retried))
    }

    fn install_dialog(&self, response: &rsip::Response) -> Result<()> {
        let to_tag = response
            .to_header()?
            .typed()?
            .params
            .iter()
            .find_map(|p| match p {
                Param::Tag(t) => Some(t.value().to_string()),
                _ => None,
            });
        if let Some(tag) = &to_tag {
            *self.remote_tag.lock().unwrap() = Some(tag.clone());
        }
        if let Ok(contact) = response.contact_header().and_then(|c| c.typed()) {
            *self.remote_target.lock().unwrap() = contact.uri;
        }
        *self.route_set.lock().unwrap() = record_route_reversed(response);

        let id = DialogId {
            call_id: self.call_id.clone(),
            local_tag: self.local_tag.lock().unwrap().clone(),
            remote_tag: to_tag.unwrap_or_default(),
        };
        let dialog = Dialog::new(
            TransactionRole::Client,
            id,
            self.local_contact.clone(),
            self.local_contact.clone(),
            self.params.resource_uri.clone(),
            self.remote_target.lock().unwrap().clone(),
            self.local_cseq.load(Ordering::SeqCst),
            self.route_set.lock().unwrap().clone(),
            TransferMode::Default,
            None,
        );
        *self.dialog.lock().unwrap() = Some(Arc::new(dialog));
        Ok(())
    }

    /// Run the subscribe/refresh loop until `stop()` is called or the
    /// subscription is permanently rejected. Intended to be spawned as its
    /// own task.
    pub async fn run(self: Arc<Self>) {
        let mut expiry = self.params.expiry.max(1);
        loop {
            if self.exiting.load(Ordering::SeqCst) {
                return;
            }
            let attempt = match self.send_subscribe(expiry).await {
                Ok(a) => a,
                Err(e) => {
                    self.emit(SubscriptionEvent::SubscriptionFailed {
                        status: StatusCode::ServerInternalError,
                        reason: e.to_string(),
                    });
                    return;
                }
            };
            let response = match attempt {
                SubscribeAttempt::Timeout => {
                    self.emit(SubscriptionEvent::SubscriptionFailed {
                        status: StatusCode::RequestTimeout,
                        reason: "no response to SUBSCRIBE".to_string(),
                    });
                    return;
                }
                SubscribeAttempt::Response(r) => r,
            };
            match response.status_code {
                StatusCode::OK | StatusCode::Accepted => {
                    if let Err(e) = self.install_dialog(&response) {
                        warn!("failed to install subscription dialog: {}", e);
                    }
                    self.emit(SubscriptionEvent::SubscriptionSuccessful);
                    let refresh_in = expiry.saturating_sub(REFRESH_MARGIN_SECONDS).max(1);
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(refresh_in as u64)) => continue,
                        _ = self.exit_notify.notified() => return,
                    }
                }
                StatusCode::IntervalTooBrief => {
                    expiry = min_expires_or_double(&response, expiry);
                    continue;
                }
                StatusCode::Forbidden | StatusCode::BadEvent | StatusCode::CallTransactionDoesNotExist => {
                    self.emit(SubscriptionEvent::SubscriptionFailed {
                        status: response.status_code.clone(),
                        reason: "subscription permanently rejected".to_string(),
                    });
                    return;
                }
                _ => {
                    self.emit(SubscriptionEvent::SubscriptionFailed {
                        status: response.status_code.clone(),
                        reason: "unexpected final response to SUBSCRIBE".to_string(),
                    });
                    return;
                }
            }
        }
    }

    /// Idempotent: sets the exit flag, fires a best-effort `expiry=0`
    /// un-SUBSCRIBE, and wakes a sleeping `run()` loop.
    pub async fn stop(&self) {
        if self.exiting.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(request) = self.build_subscribe(0) {
            let _ = self.transaction_layer.send_non_invite(request, None).await;
        }
        self.exit_notify.notify_waiters();
    }

    /// Dispatch a received NOTIFY for this subscription. Always returns
    /// `200 OK` to send back; internally drops anything that doesn't match
    /// this subscription's Call-ID/Event or carries no body, and drops
    /// duplicate/out-of-order CSeqs once a dialog has been established.
    pub fn handle_notify(&self, request: &rsip::Request) -> Result<StatusCode> {
        let call_id = request.call_id_header()?.value().to_string();
        let event_matches = request.headers.iter().any(|h| {
            matches!(h, Header::Other(name, value)
                if name.eq_ignore_ascii_case("Event")
                    && String::from_utf8_lossy(value).starts_with(&self.params.event_package))
        });
        if call_id == self.call_id && event_matches && !request.body.is_empty() {
            let seq = request.cseq_header()?.seq()?;
            let accept = match self.dialog() {
                Some(dialog) => dialog.observe_remote_seq(seq),
                None => true,
            };
            if accept {
                self.emit(SubscriptionEvent::NotificationReceived {
                    event_package: self.params.event_package.clone(),
                    body: request.body.clone(),
                });
            } else {
                warn!("dropping duplicate/out-of-order NOTIFY for subscription {}", self.call_id);
            }
        }
        Ok(StatusCode::OK)
    }
}

fn record_route_reversed(response: &rsip::Response) -> Vec<Route> {
    let mut routes: Vec<Route> = response
        .headers
        .iter()
        .filter_map(|h| match h {
            Header::RecordRoute(rr) => Some(Route::from(rr.value())),
            _ => None,
        })
        .collect();
    routes.reverse();
    routes
}

/// `Min-Expires` wins if the notifier supplied one and it's stricter than
/// what we already asked for; otherwise fall back to doubling, so a 423
/// loop without `Min-Expires` still converges upward instead of looping at
/// the same rejected value.
fn min_expires_or_double(response: &rsip::Response, current: u32) -> u32 {
    let min_expires = response.headers.iter().find_map(|h| match h {
        Header::Other(name, value) if name.eq_ignore_ascii_case("Min-Expires") => {
            String::from_utf8_lossy(value).trim().parse::<u32>().ok()
        }
        _ => None,
    });
    match min_expires {
        Some(min) => min.max(current),
        None => current.saturating_mul(2),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockTransactionLayer;

    fn uri(s: &str) -> rsip::Uri {
        rsip::Uri::try_from(s).unwrap()
    }

    fn final_response(status: StatusCode, to_tag: Option<&str>) -> rsip::Response {
        let mut headers = vec![];
        let mut to = rsip::typed::To {
            display_name: None,
            uri: uri("sip:presence@example.net"),
            params: vec![],
        };
        if let Some(tag) = to_tag {
            to.params.push(Param::Tag(tag.to_string().into()));
        }
        headers.push(Header::To(to.into()));
        rsip::Response {
            status_code: status,
            version: rsip::Version::V2,
            headers: headers.into(),
            body: vec![],
        }
    }

    fn new_client(layer: Arc<MockTransactionLayer>) -> (Arc<SubscriptionClient>, crate::events::EventReceiver<SubscriptionEvent>) {
        let (tx, rx) = crate::events::channel();
        let params = SubscriptionParams::new(uri("sip:presence@example.net"), "presence");
        let client = Arc::new(SubscriptionClient::new(layer, uri("sip:alice@192.0.2.1:5060"), params, tx));
        (client, rx)
    }

    #[tokio::test]
    async fn interval_too_brief_doubles_expiry_on_retry() {
        let layer = Arc::new(MockTransactionLayer::new());
        layer.script_non_invite(vec![TransactionEvent::Final(final_response(StatusCode::IntervalTooBrief, None))]);
        layer.script_non_invite(vec![TransactionEvent::Final(final_response(StatusCode::OK, Some("tag1")))]);

        let (client, mut rx) = new_client(layer.clone());
        client.clone().run().await;
        assert!(matches!(rx.recv().await, Some(SubscriptionEvent::SubscriptionSuccessful)));

        let sent = layer.sent_non_invites();
        assert_eq!(sent.len(), 2);
        let first_expires = sent[0].headers.iter().find_map(|h| match h {
            Header::Expires(e) => Some(e.to_string()),
            _ => None,
        });
        let second_expires = sent[1].headers.iter().find_map(|h| match h {
            Header::Expires(e) => Some(e.to_string()),
            _ => None,
        });
        assert_ne!(first_expires, second_expires);
    }

    #[tokio::test]
    async fn forbidden_terminates_permanently() {
        let layer = Arc::new(MockTransactionLayer::new());
        layer.script_non_invite(vec![TransactionEvent::Final(final_response(StatusCode::Forbidden, None))]);
        let (client, mut rx) = new_client(layer);
        client.clone().run().await;
        assert!(matches!(
            rx.recv().await,
            Some(SubscriptionEvent::SubscriptionFailed { status: StatusCode::Forbidden, .. })
        ));
    }

    #[tokio::test]
    async fn notify_with_matching_event_and_body_is_accepted() {
        let layer = Arc::new(MockTransactionLayer::new());
        let (client, mut rx) = new_client(layer);
        let notify = rsip::Request {
            method: Method::Notify,
            uri: uri("sip:alice@192.0.2.1:5060"),
            headers: vec![
                Header::CallId(client.call_id().to_string().into()),
                Header::Other("Event".to_string(), b"presence".to_vec()),
                Header::CSeq(rsip::typed::CSeq { seq: 1, method: Method::Notify }.into()),
            ]
            .into(),
            body: b"<presence/>".to_vec(),
            version: rsip::Version::V2,
        };
        let status = client.handle_notify(&notify).unwrap();
        assert_eq!(status, StatusCode::OK);
        assert!(matches!(rx.recv().await, Some(SubscriptionEvent::NotificationReceived { .. })));
    }
}
