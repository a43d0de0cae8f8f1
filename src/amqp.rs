//! Abstraction over the underlying AMQP 1.0 library
//!
//! The messenger does not own a protocol implementation. This module defines
//! the seam a real AMQP library adapts to: a [`Session`] that opens links,
//! a [`MessageSender`] and a [`MessageReceiver`] bound to those links, and
//! the owned message/disposition values that cross the boundary.
//!
//! State changes and send outcomes are surfaced by polling: the messenger
//! observes [`MessageSender::state`] / [`MessageReceiver::state`] on every
//! tick and drains completions with [`MessageSender::poll_outcome`] and
//! deliveries with [`MessageReceiver::try_next`]. Implementations queue
//! events internally between ticks; nothing here blocks.

use std::collections::BTreeMap;
use thiserror::Error;

/// Errors reported by the AMQP library adapter.
#[derive(Debug, Error)]
pub enum AmqpError {
    #[error("link operation failed: {0}")]
    Link(String),
    #[error("send rejected by the library: {0}")]
    Send(String),
    #[error("no delivery is currently being settled")]
    NoCurrentDelivery,
    #[error("disposition failed: {0}")]
    Disposition(String),
}

/// Sub-state of a sender or receiver, mirrored from the library.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Opening,
    Open,
    Closing,
    Error,
}

/// Role requested when opening a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    Sender,
    Receiver,
}

/// Receiver settle mode negotiated on attach.
///
/// `First` means the receiver settles as soon as it sends the disposition;
/// there is no second disposition exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverSettleMode {
    First,
    Second,
}

/// Everything the session needs to attach one link.
#[derive(Debug, Clone)]
pub struct LinkRequest {
    pub name: String,
    pub source: String,
    pub target: String,
    pub role: LinkRole,
    /// `None` means unbounded.
    pub max_message_size: Option<u64>,
    pub rcv_settle_mode: Option<ReceiverSettleMode>,
    pub attach_properties: BTreeMap<String, String>,
}

/// Value of a single message annotation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnnotationValue {
    Str(String),
    Null,
}

/// An owned AMQP message: annotations plus an opaque data body.
///
/// The core never interprets the body bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AmqpMessage {
    annotations: BTreeMap<String, AnnotationValue>,
    body: Vec<u8>,
}

impl AmqpMessage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_annotation(&mut self, name: impl Into<String>, value: AnnotationValue) {
        self.annotations.insert(name.into(), value);
    }

    pub fn annotation(&self, name: &str) -> Option<&AnnotationValue> {
        self.annotations.get(name)
    }

    pub fn annotations(&self) -> &BTreeMap<String, AnnotationValue> {
        &self.annotations
    }

    pub fn set_body(&mut self, body: Vec<u8>) {
        self.body = body;
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }
}

/// Wire-level verdict returned to the sender of a received delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireDisposition {
    Accepted,
    Released,
    Rejected { condition: String, description: String },
}

/// Library-reported outcome of a single transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Ok,
    Error(String),
}

/// Correlates a dispatched transfer with its asynchronous outcome.
pub type DeliveryTag = u64;

/// Outgoing half of a link pair. The sender owns its underlying link;
/// dropping the sender detaches both.
pub trait MessageSender {
    fn state(&self) -> LinkState;

    /// Hands one message to the link. The returned tag identifies the
    /// outcome later reported by [`poll_outcome`](Self::poll_outcome).
    fn send(&mut self, message: AmqpMessage) -> Result<DeliveryTag, AmqpError>;

    /// Drains the next completed transfer, if any.
    fn poll_outcome(&mut self) -> Option<(DeliveryTag, SendOutcome)>;
}

/// Incoming half of a link pair.
///
/// After [`try_next`](Self::try_next) yields a message, the delivery being
/// settled is the "current" one: [`received_delivery_id`](Self::received_delivery_id)
/// and [`received_link_name`](Self::received_link_name) describe it until the
/// next delivery is drained.
pub trait MessageReceiver {
    fn state(&self) -> LinkState;

    fn try_next(&mut self) -> Option<AmqpMessage>;

    fn received_delivery_id(&self) -> Result<u64, AmqpError>;

    fn received_link_name(&self) -> Result<String, AmqpError>;

    fn dispose(
        &mut self,
        link_name: &str,
        delivery_id: u64,
        disposition: WireDisposition,
    ) -> Result<(), AmqpError>;

    /// Releases the delivery currently being settled. Used when its
    /// identifiers cannot be read and no addressed disposition is possible.
    fn release_current(&mut self) -> Result<(), AmqpError>;

    /// Detaches the link. Close errors are reported but the receiver is
    /// considered unusable afterwards either way.
    fn close(&mut self) -> Result<(), AmqpError>;
}

/// A caller-owned AMQP session handle.
///
/// The messenger borrows the session for the span between `start` and
/// `stop`; implementations are expected to be cheap handles to a session
/// whose lifetime the caller controls. Nothing in this trait can end the
/// session itself.
pub trait Session {
    type Sender: MessageSender;
    type Receiver: MessageReceiver;

    fn open_sender(&mut self, request: &LinkRequest) -> Result<Self::Sender, AmqpError>;

    fn open_receiver(&mut self, request: &LinkRequest) -> Result<Self::Receiver, AmqpError>;
}
