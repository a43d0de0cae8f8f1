//! Test doubles for the AMQP library seam
//!
//! Deterministic in-memory fakes used by the crate's own tests and by
//! embedders that want to exercise messenger behavior without a broker.

pub mod fakes;

pub use fakes::{FakeReceiver, FakeSender, FakeSession};
