//! The SIP dialog and its state machine.
//!
//! Grounded on `rsipstack`'s `DialogInner` (`examples/DasWolke-rsipstack/src/dialog/dialog.rs`):
//! the same split of immutable identity (Call-ID + both tags) from mutable
//! CSeq/route-set/remote-target, the same `Mutex`-per-field shape rather than
//! one big lock, and the same `make_request`/state-transition helpers — but
//! with no direct transport/transaction ownership, which stays one layer
//! down at the collaborator boundary.

use rsip::headers::Route;
use rsip::prelude::{HeadersExt, ToTypedHeader, UntypedHeader};
use rsip::{Header, Param};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::transaction::{make_branch, make_call_id, make_tag, SipAddr, TransactionRole};

/// Immutable dialog identity: Call-ID plus both tags.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DialogId {
    pub call_id: String,
    pub local_tag: String,
    pub remote_tag: String,
}

impl fmt::Display for DialogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.call_id, self.local_tag, self.remote_tag)
    }
}

/// Governs how an incoming REFER is handled for a given call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferMode {
    #[default]
    Default,
    NotAllowed,
    PassThrough,
    BlindPlaceCall,
}

/// Why a dialog reached `Terminated`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminatedReason {
    Timeout,
    UacCancel,
    UacBye,
    UasBye,
    UacBusy,
    UasBusy,
    UasDecline,
    ProxyError(rsip::StatusCode),
    ProxyAuthRequired,
    UacOther(Option<rsip::StatusCode>),
    UasOther(Option<rsip::StatusCode>),
}

/// Dialog-level state machine: `NoDialog → Early → Confirmed → Terminated`.
#[derive(Debug, Clone)]
pub enum DialogState {
    NoDialog,
    Early,
    Confirmed,
    Terminated(TerminatedReason),
}

impl DialogState {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, DialogState::Confirmed)
    }
    pub fn is_terminated(&self) -> bool {
        matches!(self, DialogState::Terminated(_))
    }
}

/// A confirmed (or confirming) SIP dialog, shared between the owning UAC/UAS
/// and the application.
///
/// Only the owning UA mutates `local_cseq`/`remote_target`/`route_set`; the
/// application reads through the accessor methods.
pub struct Dialog {
    pub id: DialogId,
    pub role: TransactionRole,

    state: Mutex<DialogState>,

    pub local_uri: rsip::Uri,
    pub local_contact: rsip::Uri,
    remote_uri: Mutex<rsip::Uri>,
    remote_target: Mutex<rsip::Uri>,

    local_cseq: AtomicU32,
    remote_cseq: AtomicU32,

    route_set: Mutex<Vec<Route>>,

    pub call_duration_limit: Option<std::time::Duration>,
    pub transfer_mode: TransferMode,
    crm: Mutex<HashMap<String, String>>,

    /// Set when a 1xx carried `Require: 100rel` — bookkeeping only, no
    /// PRACK transactions are run.
    prack_required: Mutex<bool>,
}

impl Dialog {
    /// Build the dialog from the initial INVITE/200 pair, with role-dependent
    /// CSeq seeding (a UAS starts its own CSeq counter independently of the
    /// request that created the dialog).
    pub fn new(
        role: TransactionRole,
        id: DialogId,
        local_uri: rsip::Uri,
        local_contact: rsip::Uri,
        remote_uri: rsip::Uri,
        remote_target: rsip::Uri,
        initial_cseq: u32,
        route_set: Vec<Route>,
        transfer_mode: TransferMode,
        call_duration_limit: Option<std::time::Duration>,
    ) -> Self {
        let (local_cseq, remote_cseq) = match role {
            TransactionRole::Client => (initial_cseq, initial_cseq),
            TransactionRole::Server => {
                (crate::transaction::generate_random_cseq(), initial_cseq)
            }
        };
        Self {
            id,
            role,
            state: Mutex::new(DialogState::NoDialog),
            local_uri,
            local_contact,
            remote_uri: Mutex::new(remote_uri),
            remote_target: Mutex::new(remote_target),
            local_cseq: AtomicU32::new(local_cseq),
            remote_cseq: AtomicU32::new(remote_cseq),
            route_set: Mutex::new(route_set),
            call_duration_limit,
            transfer_mode,
            crm: Mutex::new(HashMap::new()),
            prack_required: Mutex::new(false),
        }
    }

    pub fn state(&self) -> DialogState {
        self.state.lock().unwrap().clone()
    }

    pub fn is_confirmed(&self) -> bool {
        self.state.lock().unwrap().is_confirmed()
    }

    pub fn transition(&self, state: DialogState) {
        *self.state.lock().unwrap() = state;
    }

    pub fn local_seq(&self) -> u32 {
        self.local_cseq.load(Ordering::SeqCst)
    }

    pub fn increment_local_seq(&self) -> u32 {
        self.local_cseq.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn remote_seq(&self) -> u32 {
        self.remote_cseq.load(Ordering::SeqCst)
    }

    /// `true` if `seq` is strictly newer than what we've already seen — used
    /// by the subscription client to drop out-of-order or duplicate NOTIFYs.
    pub fn observe_remote_seq(&self, seq: u32) -> bool {
        let prev = self.remote_cseq.swap(seq, Ordering::SeqCst);
        seq > prev
    }

    pub fn remote_target(&self) -> rsip::Uri {
        self.remote_target.lock().unwrap().clone()
    }

    pub fn set_remote_target(&self, target: rsip::Uri) {
        *self.remote_target.lock().unwrap() = target;
    }

    pub fn remote_uri(&self) -> rsip::Uri {
        self.remote_uri.lock().unwrap().clone()
    }

    pub fn route_set(&self) -> Vec<Route> {
        self.route_set.lock().unwrap().clone()
    }

    pub fn set_route_set(&self, routes: Vec<Route>) {
        *self.route_set.lock().unwrap() = routes;
    }

    pub fn set_prack_required(&self, value: bool) {
        *self.prack_required.lock().unwrap() = value;
    }

    pub fn prack_required(&self) -> bool {
        *self.prack_required.lock().unwrap()
    }

    pub fn set_crm(&self, key: impl Into<String>, value: impl Into<String>) {
        self.crm.lock().unwrap().insert(key.into(), value.into());
    }

    pub fn crm(&self) -> HashMap<String, String> {
        self.crm.lock().unwrap().clone()
    }

    /// Build an in-dialog request template (CSeq+1, new top-Via branch,
    /// Route set, Contact) — used for re-INVITE/UPDATE/BYE/REFER.
    pub fn make_request(
        &self,
        method: rsip::Method,
        via_addr: Option<SipAddr>,
        extra_headers: Vec<rsip::Header>,
        body: Option<Vec<u8>>,
    ) -> Result<rsip::Request> {
        let seq = self.increment_local_seq();
        let mut headers: Vec<rsip::Header> = Vec::new();

        headers.push(make_via(via_addr, None).into());
        headers.push(Header::CallId(self.id.call_id.clone().into()));

        let (from_uri, from_tag, to_uri, to_tag) = match self.role {
            TransactionRole::Client => (
                self.local_uri.clone(),
                self.id.local_tag.clone(),
                self.remote_uri(),
                self.id.remote_tag.clone(),
            ),
            TransactionRole::Server => (
                self.local_uri.clone(),
                self.id.local_tag.clone(),
                self.remote_uri(),
                self.id.remote_tag.clone(),
            ),
        };
        headers.push(tagged_from(from_uri, from_tag).into());
        headers.push(tagged_to(to_uri, to_tag).into());
        headers.push(Header::CSeq(rsip::typed::CSeq { seq, method }.into()));
        headers.push(Header::MaxForwards(70.into()));
        headers.push(
            rsip::typed::Contact {
                display_name: None,
                uri: self.local_contact.clone(),
                params: vec![],
            }
            .into(),
        );
        headers.push(Header::UserAgent(crate::DEFAULT_USER_AGENT.to_string().into()));
        for route in self.route_set() {
            headers.push(Header::Route(route));
        }
        for h in extra_headers {
            headers.push(h);
        }
        if let Some(b) = &body {
            headers.push(Header::ContentLength((b.len() as u32).into()));
        }

        Ok(rsip::Request {
            method,
            uri: self.remote_target(),
            headers: headers.into(),
            body: body.unwrap_or_default(),
            version: rsip::Version::V2,
        })
    }

    /// Build an in-dialog REFER (RFC 3515) asking the remote party to place
    /// a new call to `target`. The caller is responsible for submitting the
    /// request through the transaction layer and routing the resulting
    /// `sipfrag` NOTIFYs (matched by Call-ID via the non-INVITE server side)
    /// back as a transfer-progress event.
    pub fn refer(&self, target: rsip::Uri) -> Result<rsip::Request> {
        let refer_to = Header::Other("Refer-To".to_string(), target.to_string().into_bytes());
        self.make_request(rsip::Method::Refer, None, vec![refer_to], None)
    }

    /// `true` if `body` is a `message/sipfrag` NOTIFY reporting the outcome
    /// of a REFER this dialog sent, and the status line it carries.
    pub fn parse_refer_notify(content_type: &str, body: &[u8]) -> Option<String> {
        if !content_type.eq_ignore_ascii_case("message/sipfrag") {
            return None;
        }
        String::from_utf8(body.to_vec())
            .ok()
            .map(|s| s.lines().next().unwrap_or("").trim().to_string())
    }

    /// Construct a `Dialog` from a 2xx response to an INVITE the UAC sent.
    pub fn from_uac_2xx(
        invite: &rsip::Request,
        response: &rsip::Response,
        local_contact: rsip::Uri,
        transfer_mode: TransferMode,
        call_duration_limit: Option<std::time::Duration>,
    ) -> Result<Self> {
        let call_id = response.call_id_header()?.value().to_string();
        let from_tag = tag_of(invite.from_header()?.typed()?.params.iter())
            .ok_or_else(|| Error::ProtocolError("INVITE From has no tag".into()))?;
        let to_tag = tag_of(response.to_header()?.typed()?.params.iter())
            .ok_or_else(|| Error::ProtocolError("2xx To has no tag".into()))?;
        let id = DialogId {
            call_id,
            local_tag: from_tag,
            remote_tag: to_tag,
        };
        let remote_target = contact_uri(response)?;
        let route_set = record_route_reversed(response);
        let cseq = invite.cseq_header()?.seq()?;
        Ok(Self::new(
            TransactionRole::Client,
            id,
            invite.from_header()?.typed()?.uri,
            local_contact,
            invite.to_header()?.typed()?.uri,
            remote_target,
            cseq,
            route_set,
            transfer_mode,
            call_duration_limit,
        ))
    }

    /// Construct a `Dialog` from the UAS side once a final 2xx has been sent
    /// (and, for an offerless INVITE, its ACK has arrived).
    pub fn from_uas_2xx(
        invite: &rsip::Request,
        to_tag: &str,
        local_contact: rsip::Uri,
        transfer_mode: TransferMode,
        call_duration_limit: Option<std::time::Duration>,
    ) -> Result<Self> {
        let call_id = invite.call_id_header()?.value().to_string();
        let from_tag = tag_of(invite.from_header()?.typed()?.params.iter())
            .ok_or_else(|| Error::ProtocolError("INVITE From has no tag".into()))?;
        let id = DialogId {
            call_id,
            local_tag: to_tag.to_string(),
            remote_tag: from_tag,
        };
        let remote_target = contact_uri_from_request(invite)?;
        let mut route_set = Vec::new();
        for h in invite.headers.iter() {
            if let Header::RecordRoute(rr) = h {
                route_set.push(Route::from(rr.value()));
            }
        }
        let cseq = invite.cseq_header()?.seq()?;
        Ok(Self::new(
            TransactionRole::Server,
            id,
            invite.to_header()?.typed()?.uri,
            local_contact,
            invite.from_header()?.typed()?.uri,
            remote_target,
            cseq,
            route_set,
            transfer_mode,
            call_duration_limit,
        ))
    }
}

fn tag_of<'a>(params: impl Iterator<Item = &'a Param>) -> Option<String> {
    params.into_iter().find_map(|p| match p {
        Param::Tag(t) => Some(t.value().to_string()),
        _ => None,
    })
}

pub(crate) fn tagged_from(uri: rsip::Uri, tag: String) -> rsip::typed::From {
    rsip::typed::From {
        display_name: None,
        uri,
        params: vec![Param::Tag(tag.into())],
    }
}

pub(crate) fn tagged_to(uri: rsip::Uri, tag: String) -> rsip::typed::To {
    rsip::typed::To {
        display_name: None,
        uri,
        params: vec![Param::Tag(tag.into())],
    }
}

/// A bare (untagged) To, for the initial request of a dialog-establishing
/// transaction where the remote party hasn't assigned a tag yet.
pub(crate) fn untagged_to(uri: rsip::Uri) -> rsip::typed::To {
    rsip::typed::To {
        display_name: None,
        uri,
        params: vec![],
    }
}

pub(crate) fn tag_of_response_to(response: &rsip::Response) -> Result<Option<String>> {
    Ok(tag_of(response.to_header()?.typed()?.params.iter()))
}

/// Build a Via header with a fresh branch over the given sent-by address.
/// `branch` lets digest-retry callers pass a caller-chosen branch instead.
pub fn make_via(addr: Option<SipAddr>, branch: Option<String>) -> rsip::typed::Via {
    let addr = addr.unwrap_or_else(|| {
        SipAddr::new(
            rsip::Transport::Udp,
            rsip::HostWithPort {
                host: rsip::Host::Domain("0.0.0.0".into()),
                port: None,
            },
        )
    });
    rsip::typed::Via {
        version: rsip::Version::V2,
        transport: addr.transport,
        uri: rsip::Uri {
            scheme: None,
            auth: None,
            host_with_port: addr.host_with_port,
            params: vec![],
            headers: vec![],
        },
        params: vec![Param::Branch(branch.unwrap_or_else(make_branch).into())],
    }
}

fn contact_uri(response: &rsip::Response) -> Result<rsip::Uri> {
    let contact = response.contact_header()?.typed()?;
    Ok(contact.uri)
}

fn contact_uri_from_request(request: &rsip::Request) -> Result<rsip::Uri> {
    let contact = request.contact_header()?.typed()?;
    Ok(contact.uri)
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
    // UAC route set is the Record-Route set in reverse order (RFC 3261
    // §12.1.2) — the UAS direction keeps Record-Route order as-is.
    routes.reverse();
    routes
}

/// Fresh Call-ID / From-tag pair for a brand-new dialog-establishing request,
/// unless the descriptor pins either value.
pub fn new_identity(pinned_call_id: Option<String>) -> (String, String) {
    (pinned_call_id.unwrap_or_else(make_call_id), make_tag())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dialog_id_display_is_stable() {
        let id = DialogId {
            call_id: "abc".into(),
            local_tag: "l".into(),
            remote_tag: "r".into(),
        };
        assert_eq!(id.to_string(), "abc:l:r");
    }

    #[test]
    fn increment_local_seq_monotonic() {
        let dialog = Dialog::new(
            TransactionRole::Client,
            DialogId {
                call_id: "c".into(),
                local_tag: "l".into(),
                remote_tag: "r".into(),
            },
            rsip::Uri::try_from("sip:alice@example.com").unwrap(),
            rsip::Uri::try_from("sip:alice@192.0.2.1:5060").unwrap(),
            rsip::Uri::try_from("sip:bob@example.com").unwrap(),
            rsip::Uri::try_from("sip:bob@192.0.2.2:5060").unwrap(),
            1,
            vec![],
            TransferMode::Default,
            None,
        );
        assert_eq!(dialog.local_seq(), 1);
        assert_eq!(dialog.increment_local_seq(), 2);
        assert_eq!(dialog.increment_local_seq(), 3);
    }

    #[test]
    fn observe_remote_seq_rejects_non_increasing() {
        let dialog = Dialog::new(
            TransactionRole::Server,
            DialogId {
                call_id: "c".into(),
                local_tag: "l".into(),
                remote_tag: "r".into(),
            },
            rsip::Uri::try_from("sip:bob@example.com").unwrap(),
            rsip::Uri::try_from("sip:bob@192.0.2.2:5060").unwrap(),
            rsip::Uri::try_from("sip:alice@example.com").unwrap(),
            rsip::Uri::try_from("sip:alice@192.0.2.1:5060").unwrap(),
            5,
            vec![],
            TransferMode::Default,
            None,
        );
        assert!(dialog.observe_remote_seq(6));
        assert!(!dialog.observe_remote_seq(6));
        assert!(!dialog.observe_remote_seq(4));
        assert!(dialog.observe_remote_seq(7));
    }
}
