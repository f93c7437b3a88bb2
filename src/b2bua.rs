//! Back-to-back user agent (C7): couples one UAS leg to one UAC leg.
//!
//! The original couples the two legs through a pair of delegate
//! cross-references (`B2BUserAgent` implementing both a client and a server
//! interface at once, per REDESIGN FLAGS). That doesn't translate to
//! ownership-checked Rust, so this bridges by message passing instead: the
//! UAC leg is driven in its own task, and its `CallEvent`s are read off the
//! channel and turned into calls on the UAS leg, mirroring the event-bus
//! plumbing `uac.rs`/`uas.rs` already use rather than introducing a new
//! back-reference between the two.

use std::sync::Arc;

use rsip::StatusCode;
use tracing::warn;

use crate::descriptor::CallDescriptor;
use crate::dialog::TransferMode;
use crate::events::{CallEvent, EventReceiver};
use crate::uac::Uac;
use crate::uas::Uas;

/// Owns one `Uas` (the incoming leg, already constructed from the received
/// INVITE) and one `Uac` (the outgoing leg, not yet placed). `run()` places
/// the outgoing call and mirrors its progress onto the incoming leg until
/// the call completes.
pub struct B2bua {
    uas: Arc<Uas>,
    uac: Arc<Uac>,
}

impl B2bua {
    pub fn new(uas: Arc<Uas>, uac: Arc<Uac>) -> Arc<Self> {
        Arc::new(Self { uas, uac })
    }

    pub fn uas(&self) -> &Arc<Uas> {
        &self.uas
    }

    pub fn uac(&self) -> &Arc<Uac> {
        &self.uac
    }

    /// Place the outgoing call and bridge its events onto the incoming leg
    /// until the call reaches a terminal state. `uac_events` is the receiver
    /// half of the channel the `Uac` was constructed with — owned by the
    /// caller so it can also observe the raw UAC events if it wants to.
    pub async fn run(self: Arc<Self>, desc: CallDescriptor, mut uac_events: EventReceiver<CallEvent>) {
        let cancel_watch = {
            let b2bua = self.clone();
            tokio::spawn(async move { b2bua.watch_uas_cancel().await })
        };

        let uac = self.uac.clone();
        let call = tokio::spawn(async move { uac.call(desc).await });

        while let Some(event) = uac_events.recv().await {
            if self.bridge_event(event).await {
                break;
            }
        }

        cancel_watch.abort();
        if let Ok(Err(e)) = call.await {
            warn!("outgoing leg of b2bua call failed: {}", e);
        }
    }

    /// Translate one UAC event into the matching UAS call. Returns `true`
    /// once the bridge has reached a terminal outcome and `run()` should
    /// stop reading further events.
    async fn bridge_event(&self, event: CallEvent) -> bool {
        match event {
            CallEvent::CallTrying { status } => {
                let _ = self.uas.progress(status, None, vec![], None, None).await;
                false
            }
            CallEvent::CallRinging { status, body, content_type } => {
                let _ = self.uas.progress(status, None, vec![], content_type, body).await;
                false
            }
            CallEvent::CallAnswered { response } => {
                if matches!(response.status_code, StatusCode::OK | StatusCode::Accepted) {
                    let (content_type, body) = if response.body.is_empty() {
                        (None, None)
                    } else {
                        (Some("application/sdp".to_string()), Some(response.body.clone()))
                    };
                    let _ = self
                        .uas
                        .answer(content_type, body, None, TransferMode::NotAllowed, vec![])
                        .await;
                } else {
                    let _ = self.uas.reject(response.status_code.clone(), None, vec![]).await;
                }
                true
            }
            CallEvent::CallFailed { reason } => {
                warn!("outgoing leg failed: {}", reason);
                let _ = self.uas.reject(StatusCode::ServerInternalError, None, vec![]).await;
                true
            }
            CallEvent::NoRingTimeout => {
                let _ = self.uas.reject(StatusCode::RequestTimeout, None, vec![]).await;
                true
            }
            CallEvent::TransactionComplete => true,
            CallEvent::OnDialogueCreated(_)
            | CallEvent::CallCancelled
            | CallEvent::UasStateChanged(_)
            | CallEvent::ReferNotify { .. } => false,
        }
    }

    async fn watch_uas_cancel(self: Arc<Self>) {
        self.uas.watch_cancel().await;
        if matches!(self.uas.phase(), crate::events::UasState::Cancelled) {
            self.uac.cancel().await;
        }
    }

    /// User-initiated cancellation of the whole bridge: cancel the outgoing
    /// leg and complete the incoming one with 486 Busy Here. A straight 487
    /// Request Terminated would read more naturally for a cancellation, but
    /// this mirrors the status the coupled legacy implementation always
    /// sent here.
    pub async fn cancel(&self) {
        self.uac.cancel().await;
        let _ = self.uas.reject(StatusCode::BusyHere, None, vec![]).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockServerTransaction, MockTransactionLayer};
    use crate::resolver::Resolver;
    use crate::transaction::{
        make_branch, make_call_id, make_tag, SipAddr, TransactionEvent, TransactionKey, TransactionRole,
    };
    use rsip::prelude::UntypedHeader;
    use rsip::{Header, Param};

    fn uri(s: &str) -> rsip::Uri {
        rsip::Uri::try_from(s).unwrap()
    }

    fn invite_request() -> rsip::Request {
        let branch = make_branch();
        let headers: Vec<Header> = vec![
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
            Header::CSeq(
                rsip::typed::CSeq { seq: 1, method: rsip::Method::Invite }.into(),
            ),
            Header::MaxForwards(70.into()),
            Header::ContentLength(5.into()),
        ];
        rsip::Request {
            method: rsip::Method::Invite,
            uri: uri("sip:bob@example.net"),
            headers: headers.into(),
            body: b"v=0\r\n".to_vec(),
            version: rsip::Version::V2,
        }
    }

    fn response(status: rsip::StatusCode, body: Vec<u8>) -> rsip::Response {
        rsip::Response {
            status_code: status,
            version: rsip::Version::V2,
            headers: vec![
                Header::CallId("leg2".to_string().into()),
                Header::To(
                    rsip::typed::To {
                        display_name: None,
                        uri: uri("sip:carol@192.0.2.20:5060"),
                        params: vec![Param::Tag(make_tag().into())],
                    }
                    .into(),
                ),
                Header::Contact(
                    rsip::typed::Contact {
                        display_name: None,
                        uri: uri("sip:carol@192.0.2.20:5060"),
                        params: vec![],
                    }
                    .into(),
                ),
            ]
            .into(),
            body,
        }
    }

    #[tokio::test]
    async fn answered_outgoing_leg_answers_the_incoming_one() {
        let uas_layer = Arc::new(MockTransactionLayer::new());
        let key = TransactionKey::from_request(&invite_request(), TransactionRole::Server).unwrap();
        let (server_tx, sent) = MockServerTransaction::new(key, vec![], vec![]);
        let (uas_events, _uas_rx) = crate::events::channel();
        let uas = Arc::new(Uas::new(
            invite_request(),
            Arc::new(server_tx),
            uas_layer,
            uri("sip:bob@192.0.2.9:5060"),
            SipAddr::black_hole(),
            SipAddr::black_hole(),
            None,
            uas_events,
            None,
            None,
            None,
        ));

        let uac_layer = Arc::new(MockTransactionLayer::new());
        uac_layer.script_invite(vec![TransactionEvent::Final(response(rsip::StatusCode::OK, b"v=0\r\n".to_vec()))]);
        let (uac_events_tx, uac_events_rx) = crate::events::channel();
        let uac = Arc::new(Uac::new(
            uac_layer,
            Arc::new(Resolver::new(false)),
            uri("sip:bob@192.0.2.9:5060"),
            uac_events_tx,
            None,
        ));

        let b2bua = B2bua::new(uas.clone(), uac);
        let desc = CallDescriptor::new(uri("sip:carol@192.0.2.20:5060"), uri("sip:bob@192.0.2.9:5060"));
        b2bua.run(desc, uac_events_rx).await;

        assert!(sent.lock().unwrap().iter().any(|r| r.status_code == rsip::StatusCode::OK));
        assert!(uas.dialog().is_some());
    }

    #[tokio::test]
    async fn non_2xx_final_rejects_the_incoming_leg_with_same_status() {
        let uas_layer = Arc::new(MockTransactionLayer::new());
        let key = TransactionKey::from_request(&invite_request(), TransactionRole::Server).unwrap();
        let (server_tx, sent) = MockServerTransaction::new(key, vec![], vec![]);
        let (uas_events, _uas_rx) = crate::events::channel();
        let uas = Arc::new(Uas::new(
            invite_request(),
            Arc::new(server_tx),
            uas_layer,
            uri("sip:bob@192.0.2.9:5060"),
            SipAddr::black_hole(),
            SipAddr::black_hole(),
            None,
            uas_events,
            None,
            None,
            None,
        ));

        let uac_layer = Arc::new(MockTransactionLayer::new());
        uac_layer.script_invite(vec![TransactionEvent::Final(response(rsip::StatusCode::BusyHere, vec![]))]);
        let (uac_events_tx, uac_events_rx) = crate::events::channel();
        let uac = Arc::new(Uac::new(
            uac_layer,
            Arc::new(Resolver::new(false)),
            uri("sip:bob@192.0.2.9:5060"),
            uac_events_tx,
            None,
        ));

        let b2bua = B2bua::new(uas, uac);
        let desc = CallDescriptor::new(uri("sip:carol@192.0.2.20:5060"), uri("sip:bob@192.0.2.9:5060"));
        b2bua.run(desc, uac_events_rx).await;

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].status_code, rsip::StatusCode::BusyHere);
    }
}
