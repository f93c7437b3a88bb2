//! In-memory `TransactionLayer` double.
//!
//! Exercises the UAC/UAS/B2BUA/subscription state machines against scripted
//! wire events instead of a live transaction/transport stack, the same way a
//! downstream consumer of `rsipstack`'s `TransactionLayer`/`Endpoint` would
//! swap in a test transport. A test scripts the event sequence a
//! transaction should replay before making the call that triggers it, then
//! inspects `sent_invites`/`sent_acks`/`cancellations` afterward.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::error::Result;
use crate::transaction::{
    ClientTransaction, ServerTransaction, SipAddr, TransactionEvent, TransactionKey,
    TransactionLayer, TransactionRole,
};

#[derive(Default)]
struct Recorded {
    invites: Vec<rsip::Request>,
    non_invites: Vec<rsip::Request>,
    acks: Vec<rsip::Request>,
    cancellations: Vec<rsip::Request>,
}

/// Scripted `TransactionLayer` test double.
///
/// Script responses before triggering the call that consumes them:
/// `layer.script_invite(vec![TransactionEvent::Provisional(trying), ...])`
/// followed by `uac.call(...)`.
pub struct MockTransactionLayer {
    scripted_invite: Mutex<VecDeque<Vec<TransactionEvent>>>,
    scripted_non_invite: Mutex<VecDeque<Vec<TransactionEvent>>>,
    recorded: Arc<Mutex<Recorded>>,
}

impl Default for MockTransactionLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransactionLayer {
    pub fn new() -> Self {
        Self {
            scripted_invite: Mutex::new(VecDeque::new()),
            scripted_non_invite: Mutex::new(VecDeque::new()),
            recorded: Arc::new(Mutex::new(Recorded::default())),
        }
    }

    pub fn script_invite(&self, events: Vec<TransactionEvent>) {
        self.scripted_invite.lock().unwrap().push_back(events);
    }

    pub fn script_non_invite(&self, events: Vec<TransactionEvent>) {
        self.scripted_non_invite.lock().unwrap().push_back(events);
    }

    pub fn sent_invites(&self) -> Vec<rsip::Request> {
        self.recorded.lock().unwrap().invites.clone()
    }

    pub fn sent_non_invites(&self) -> Vec<rsip::Request> {
        self.recorded.lock().unwrap().non_invites.clone()
    }

    pub fn sent_acks(&self) -> Vec<rsip::Request> {
        self.recorded.lock().unwrap().acks.clone()
    }

    /// The CANCEL requests actually built and sent through `cancel()`, in
    /// the order they were sent.
    pub fn cancellations(&self) -> Vec<rsip::Request> {
        self.recorded.lock().unwrap().cancellations.clone()
    }
}

#[async_trait]
impl TransactionLayer for MockTransactionLayer {
    async fn send_uac_invite(
        &self,
        request: rsip::Request,
        _outbound_proxy: Option<SipAddr>,
    ) -> Result<Box<dyn ClientTransaction>> {
        let key = TransactionKey::from_request(&request, TransactionRole::Client)?;
        let events = self
            .scripted_invite
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default();
        self.recorded.lock().unwrap().invites.push(request);
        Ok(Box::new(MockClientTransaction {
            key,
            events: Mutex::new(events.into()),
            recorded: self.recorded.clone(),
        }))
    }

    async fn send_non_invite(
        &self,
        request: rsip::Request,
        _outbound_proxy: Option<SipAddr>,
    ) -> Result<Box<dyn ClientTransaction>> {
        let key = TransactionKey::from_request(&request, TransactionRole::Client)?;
        let events = self
            .scripted_non_invite
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default();
        self.recorded.lock().unwrap().non_invites.push(request);
        Ok(Box::new(MockClientTransaction {
            key,
            events: Mutex::new(events.into()),
            recorded: self.recorded.clone(),
        }))
    }
}

struct MockClientTransaction {
    key: TransactionKey,
    events: Mutex<VecDeque<TransactionEvent>>,
    recorded: Arc<Mutex<Recorded>>,
}

#[async_trait]
impl ClientTransaction for MockClientTransaction {
    fn key(&self) -> &TransactionKey {
        &self.key
    }

    async fn recv(&self) -> Option<TransactionEvent> {
        self.events.lock().unwrap().pop_front()
    }

    async fn send_ack(&self, ack: rsip::Request) -> Result<()> {
        self.recorded.lock().unwrap().acks.push(ack);
        Ok(())
    }

    async fn cancel(&self, cancel: rsip::Request) -> Result<()> {
        self.recorded.lock().unwrap().cancellations.push(cancel);
        Ok(())
    }
}

/// A scripted server transaction: provisional/final sends are recorded for
/// assertion, ACK/CANCEL delivery replays a scripted sequence.
pub struct MockServerTransaction {
    key: TransactionKey,
    sent: Arc<Mutex<Vec<rsip::Response>>>,
    acks: Mutex<VecDeque<rsip::Request>>,
    cancels: Mutex<VecDeque<()>>,
}

impl MockServerTransaction {
    /// Returns the transaction plus a handle to its recorded outgoing
    /// responses, so a test can assert on them after driving the UAS.
    pub fn new(
        key: TransactionKey,
        acks: Vec<rsip::Request>,
        cancels: Vec<()>,
    ) -> (Self, Arc<Mutex<Vec<rsip::Response>>>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                key,
                sent: sent.clone(),
                acks: Mutex::new(acks.into()),
                cancels: Mutex::new(cancels.into()),
            },
            sent,
        )
    }
}

#[async_trait]
impl ServerTransaction for MockServerTransaction {
    fn key(&self) -> &TransactionKey {
        &self.key
    }

    async fn send_provisional(&self, response: rsip::Response) -> Result<()> {
        self.sent.lock().unwrap().push(response);
        Ok(())
    }

    async fn send_final(&self, response: rsip::Response) -> Result<()> {
        self.sent.lock().unwrap().push(response);
        Ok(())
    }

    async fn recv_ack(&self) -> Option<rsip::Request> {
        self.acks.lock().unwrap().pop_front()
    }

    async fn recv_cancel(&self) -> Option<()> {
        self.cancels.lock().unwrap().pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::make_branch;

    fn request(method: rsip::Method, branch: &str) -> rsip::Request {
        rsip::Request {
            method,
            uri: rsip::Uri::try_from("sip:bob@example.net").unwrap(),
            headers: vec![rsip::Header::Via(
                rsip::typed::Via {
                    version: rsip::Version::V2,
                    transport: rsip::Transport::Udp,
                    uri: rsip::Uri::try_from("sip:alice@192.0.2.1:5060").unwrap(),
                    params: vec![rsip::Param::Branch(branch.to_string().into())],
                }
                .into(),
            )]
            .into(),
            body: vec![],
            version: rsip::Version::V2,
        }
    }

    #[tokio::test]
    async fn replays_scripted_events_in_order() {
        let layer = MockTransactionLayer::new();
        let trying = rsip::Response {
            status_code: rsip::StatusCode::Trying,
            version: rsip::Version::V2,
            headers: vec![].into(),
            body: vec![],
        };
        layer.script_invite(vec![TransactionEvent::Provisional(trying.clone())]);

        let branch = make_branch();
        let tx = layer
            .send_uac_invite(request(rsip::Method::Invite, &branch), None)
            .await
            .unwrap();
        match tx.recv().await {
            Some(TransactionEvent::Provisional(r)) => {
                assert_eq!(r.status_code, rsip::StatusCode::Trying)
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(tx.recv().await.is_none());
        assert_eq!(layer.sent_invites().len(), 1);
    }
}
