//! hublink — device-to-cloud AMQP 1.0 messaging core
//!
//! A tick-driven messaging module that runs atop a caller-owned AMQP 1.0
//! session and exposes two layered services:
//! - [`AmqpMessenger`]: a generic bidirectional messenger owning a send
//!   link and a receive link, with a queued send path (retry, age
//!   timeouts) and explicit-disposition inbound delivery
//! - [`TwinMessenger`]: a thin device-twin adapter that frames
//!   reported-state requests with the twin-required message annotations
//!
//! The crate does not implement AMQP itself: the [`amqp`] module defines
//! the seam (`Session`, `MessageSender`, `MessageReceiver`) a protocol
//! library adapts to, and [`testing`] provides deterministic fakes.
//!
//! # Quick start
//!
//! ```rust
//! use hublink::testing::FakeSession;
//! use hublink::TwinMessenger;
//! use std::time::Instant;
//!
//! let mut twin: TwinMessenger<FakeSession> =
//!     TwinMessenger::new("my-device", "hub.example.net").unwrap();
//!
//! let session = FakeSession::new();
//! twin.start(session.clone()).unwrap();
//!
//! twin.report_state_async(br#"{"temperature": 21}"#, |result| {
//!     println!("reported: {result:?}");
//! })
//! .unwrap();
//!
//! // The embedding transport pumps the messenger from its event loop.
//! twin.tick(Instant::now());
//! ```
//!
//! All operations and callbacks run on the pump thread; `tick(now)` takes
//! the clock as a parameter, so time is simulable in tests and no call
//! ever blocks on I/O.

pub mod amqp;
pub mod config;
pub mod error;
pub mod link;
pub mod messenger;
pub mod queue;
pub mod testing;
pub mod twin;

pub use amqp::{
    AmqpError, AmqpMessage, AnnotationValue, LinkRequest, LinkRole, LinkState, MessageReceiver,
    MessageSender, ReceiverSettleMode, SendOutcome, Session, WireDisposition,
};
pub use config::{AttachProperties, DeviceIdentity, MessengerConfig};
pub use error::{MessengerError, MessengerResult};
pub use messenger::{
    AmqpMessenger, DispositionTicket, MessageDisposition, MessengerState, SendResult, SendStatus,
};
pub use queue::{MessageQueue, QueueOptions};
pub use twin::{ReportStateResult, TwinMessenger, TwinOperation};
