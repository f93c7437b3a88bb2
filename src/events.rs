//! Event bus: the state-change notifications a UAC/UAS/subscription client
//! delivers to the application.
//!
//! Grounded on `rsipstack`'s `DialogStateSender`/`DialogStateReceiver`
//! (`examples/DasWolke-rsipstack/src/dialog/dialog.rs`) — an unbounded mpsc
//! channel carrying an enum of state changes, handed to the UA at
//! construction time rather than a callback-registration API. We widen that
//! one channel into two purpose-built enums, one per spec component that
//! produces events.

use async_trait::async_trait;
use std::sync::Arc;

use crate::dialog::Dialog;

pub type EventSender<T> = tokio::sync::mpsc::UnboundedSender<T>;
pub type EventReceiver<T> = tokio::sync::mpsc::UnboundedReceiver<T>;

pub fn channel<T>() -> (EventSender<T>, EventReceiver<T>) {
    tokio::sync::mpsc::unbounded_channel()
}

/// Delivered by a UAC, a UAS, or a B2BUA's two halves. Not every variant
/// applies to every role: a UAC never emits `UasStateChanged`, a UAS never
/// emits `CallRinging`.
#[derive(Debug, Clone)]
pub enum CallEvent {
    CallTrying {
        status: rsip::StatusCode,
    },
    CallRinging {
        status: rsip::StatusCode,
        body: Option<Vec<u8>>,
        content_type: Option<String>,
    },
    CallAnswered {
        response: rsip::Response,
    },
    CallFailed {
        reason: String,
    },
    CallCancelled,
    NoRingTimeout,
    TransactionComplete,
    UasStateChanged(UasState),
    OnDialogueCreated(Arc<Dialog>),
    /// A `message/sipfrag` NOTIFY reporting progress of a REFER this dialog
    /// sent, carrying the status line (e.g. `SIP/2.0 200 OK`).
    ReferNotify {
        status_line: String,
    },
}

/// Mirrors the UAS operations in the server INVITE state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UasState {
    Received,
    Authenticated,
    Proceeding,
    Answered,
    Rejected,
    Redirected,
    Cancelled,
    TimedOut,
}

/// Call-detail-record collaborator, invoked at well-defined lifecycle points
/// by the UAC/UAS/B2BUA. Billing and storage stay an external concern; this
/// trait only defines the hook points, including the CDR reallocation that
/// happens when a digest retry opens a new transaction for the same logical
/// call attempt.
#[async_trait]
pub trait CallRecordSink: Send + Sync {
    async fn on_trying(&self, call_id: &str);
    async fn on_answered(&self, call_id: &str);
    async fn on_terminated(&self, call_id: &str, reason: &str);
    /// A digest retry replaced `old_branch`'s transaction with a new one on
    /// the same Call-ID; move any per-transaction CDR state across.
    async fn on_reallocated(&self, call_id: &str, old_branch: &str, new_branch: &str);
}

/// Delivered by the subscription client.
#[derive(Debug, Clone)]
pub enum SubscriptionEvent {
    NotificationReceived {
        event_package: String,
        body: Vec<u8>,
    },
    SubscriptionSuccessful,
    SubscriptionFailed {
        status: rsip::StatusCode,
        reason: String,
    },
}
