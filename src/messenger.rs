//! Bidirectional AMQP messenger
//!
//! Owns a send link and, while subscribed, a receive link over a borrowed
//! session. Outbound messages flow through a [`MessageQueue`] with retry
//! and age timeouts; inbound messages are handed to the subscriber together
//! with a [`DispositionTicket`] that must be settled exactly once.
//!
//! All lifecycle work happens inside [`tick`](AmqpMessenger::tick):
//! `start` only records the session, `subscribe_for_messages` only flips
//! the subscription on, and `send_async` only enqueues. The caller drives
//! `tick(now)` periodically from a single thread and supplies the
//! monotonic clock, which keeps the core free of I/O and makes time
//! simulable in tests.

use crate::amqp::{
    AmqpError, AmqpMessage, DeliveryTag, LinkState, MessageReceiver, MessageSender, SendOutcome,
    Session, WireDisposition,
};
use crate::config::MessengerConfig;
use crate::error::{MessengerError, MessengerResult};
use crate::link::LinkFactory;
use crate::queue::{Completion, DispatchOutcome, ItemId, MessageQueue, ProcessResult, QueueOptions};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Default total time a message may wait for a send before timing out.
pub const DEFAULT_EVENT_SEND_TIMEOUT_SECS: u64 = 600;
/// Default per-message retry budget (try once, never retry).
pub const DEFAULT_SEND_RETRY_LIMIT: u32 = 0;
/// Consecutive terminal send failures tolerated before the messenger
/// transitions to `Error`.
pub const DEFAULT_MAX_SEND_ERROR_COUNT: u32 = 10;
/// How long a sender or receiver may sit in `Opening` before the messenger
/// gives up on it.
pub const LINK_STATE_CHANGE_TIMEOUT: Duration = Duration::from_secs(300);

/// Option name: unsigned integer, forwards to the queue's enqueued-time cap.
pub const OPTION_EVENT_SEND_TIMEOUT_SECS: &str = "amqp_event_send_timeout_secs";
/// Option name: opaque queue-options blob produced by `retrieve_options`.
pub const OPTION_SAVED_QUEUE_OPTIONS: &str = "amqp_message_queue_options";

/// Condition and description reported on a rejected disposition.
pub const REJECTED_BY_APPLICATION: &str = "Rejected by application";

/// Top-level messenger lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessengerState {
    Stopped,
    Starting,
    Started,
    Stopping,
    /// Persists until an explicit `stop` followed by `start`.
    Error,
}

/// Terminal outcome reported to the caller for one sent message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendResult {
    Ok,
    Timeout,
    FailSending,
    MessengerDestroyed,
    /// Reserved for adapters that decode payloads.
    CannotParse,
}

/// Whether the send queue currently holds work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Idle,
    Busy,
}

/// Verdict returned by the subscriber for a received message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDisposition {
    Accepted,
    Released,
    Rejected,
    /// No response yet; the subscriber keeps the ticket and settles later
    /// through [`AmqpMessenger::send_message_disposition`].
    Deferred,
}

/// Identifies one received delivery for later settlement.
///
/// Moved into the subscriber with the message; consumed exactly once —
/// either by `send_message_disposition` or by dropping it (which abandons
/// the delivery without a response).
#[derive(Debug)]
pub struct DispositionTicket {
    link_name: String,
    delivery_id: u64,
}

impl DispositionTicket {
    pub(crate) fn new(link_name: String, delivery_id: u64) -> Self {
        Self {
            link_name,
            delivery_id,
        }
    }

    pub fn link_name(&self) -> &str {
        &self.link_name
    }

    pub fn delivery_id(&self) -> u64 {
        self.delivery_id
    }
}

/// Completion callback for one outbound message.
pub type SendCompleteCallback = Box<dyn FnOnce(SendResult)>;
/// Subscriber callback for inbound messages.
pub type ReceivedCallback = Box<dyn FnMut(AmqpMessage, DispositionTicket) -> MessageDisposition>;
/// Observer for messenger state transitions `(previous, current)`.
pub type StateChangedCallback = Box<dyn FnMut(MessengerState, MessengerState)>;

/// Tracks one sub-state (sender or receiver) as reported by the library.
#[derive(Debug)]
struct SubStateTracker {
    current: LinkState,
    previous: LinkState,
    /// `None` until the first change is observed.
    last_change: Option<Instant>,
}

impl SubStateTracker {
    fn new() -> Self {
        Self {
            current: LinkState::Idle,
            previous: LinkState::Idle,
            last_change: None,
        }
    }

    fn observe(&mut self, state: LinkState, now: Instant) {
        if state != self.current {
            self.previous = self.current;
            self.current = state;
            self.last_change = Some(now);
        }
    }

    fn reset(&mut self) {
        *self = Self::new();
    }

    fn opening_timed_out(&self, now: Instant) -> bool {
        self.last_change
            .is_some_and(|at| now.saturating_duration_since(at) >= LINK_STATE_CHANGE_TIMEOUT)
    }
}

/// The generic bidirectional messenger.
pub struct AmqpMessenger<S: Session> {
    config: MessengerConfig,
    state: MessengerState,
    on_state_changed: Option<StateChangedCallback>,

    session: Option<S>,
    sender: Option<S::Sender>,
    sender_track: SubStateTracker,
    receiver: Option<S::Receiver>,
    receiver_track: SubStateTracker,

    subscription: Option<ReceivedCallback>,

    queue: MessageQueue<AmqpMessage, SendCompleteCallback>,
    in_flight_tags: HashMap<DeliveryTag, ItemId>,

    send_error_count: u32,
    max_send_error_count: u32,
}

impl<S: Session> AmqpMessenger<S> {
    /// Validates the configuration and builds a stopped messenger.
    pub fn new(config: MessengerConfig) -> MessengerResult<Self> {
        config.validate()?;

        Ok(Self {
            config,
            state: MessengerState::Stopped,
            on_state_changed: None,
            session: None,
            sender: None,
            sender_track: SubStateTracker::new(),
            receiver: None,
            receiver_track: SubStateTracker::new(),
            subscription: None,
            queue: MessageQueue::new(QueueOptions {
                max_retry_count: DEFAULT_SEND_RETRY_LIMIT,
                max_message_enqueued_time_secs: DEFAULT_EVENT_SEND_TIMEOUT_SECS,
                max_message_processing_time_secs: 0,
            }),
            in_flight_tags: HashMap::new(),
            send_error_count: 0,
            max_send_error_count: DEFAULT_MAX_SEND_ERROR_COUNT,
        })
    }

    /// Registers an observer for state transitions.
    ///
    /// The callback fires synchronously from inside the operation that
    /// transitions the state (usually `tick`); it receives only the state
    /// pair and cannot reach back into the messenger, which rules out
    /// reentrant `start`/`stop` by construction.
    pub fn with_state_changed(
        mut self,
        callback: impl FnMut(MessengerState, MessengerState) + 'static,
    ) -> Self {
        self.on_state_changed = Some(Box::new(callback));
        self
    }

    pub fn state(&self) -> MessengerState {
        self.state
    }

    /// Consecutive terminal send failures since the last success.
    pub fn consecutive_send_failures(&self) -> u32 {
        self.send_error_count
    }

    pub fn set_max_send_error_count(&mut self, count: u32) {
        self.max_send_error_count = count;
    }

    /// Stores the session and begins starting up. Link and sender creation
    /// happen on the next `tick`.
    pub fn start(&mut self, session: S) -> MessengerResult<()> {
        if self.state != MessengerState::Stopped {
            return Err(MessengerError::WrongState { state: self.state });
        }

        self.session = Some(session);
        // A fresh session starts a fresh failure streak, so a stop/start
        // cycle can actually recover from the error state.
        self.send_error_count = 0;
        self.update_state(MessengerState::Starting);
        Ok(())
    }

    /// Tears down the sender and receiver and returns every in-flight item
    /// to the head of the pending queue, preserving FIFO order. No user
    /// completions fire; the items are dispatched again after the next
    /// `start`.
    pub fn stop(&mut self) -> MessengerResult<()> {
        if self.state == MessengerState::Stopped {
            return Err(MessengerError::WrongState { state: self.state });
        }

        self.update_state(MessengerState::Stopping);

        self.destroy_sender();
        self.destroy_receiver();
        self.session = None;

        self.queue.move_all_in_flight_back_to_pending();
        self.update_state(MessengerState::Stopped);
        Ok(())
    }

    /// Clones the message into the send queue. The completion callback is
    /// invoked exactly once with the terminal result, from a later `tick`
    /// (or from teardown with [`SendResult::MessengerDestroyed`]).
    pub fn send_async(
        &mut self,
        message: &AmqpMessage,
        on_complete: impl FnOnce(SendResult) + 'static,
    ) -> MessengerResult<()> {
        self.queue.enqueue(message.clone(), Box::new(on_complete));
        Ok(())
    }

    /// `Idle` iff the send queue is empty.
    pub fn send_status(&self) -> SendStatus {
        if self.queue.is_empty() {
            SendStatus::Idle
        } else {
            SendStatus::Busy
        }
    }

    /// Registers the inbound subscriber. The receiver is created on the
    /// next `tick` once the messenger is started.
    pub fn subscribe_for_messages(
        &mut self,
        on_message: impl FnMut(AmqpMessage, DispositionTicket) -> MessageDisposition + 'static,
    ) -> MessengerResult<()> {
        if self.subscription.is_some() {
            return Err(MessengerError::AlreadySubscribed);
        }

        self.subscription = Some(Box::new(on_message));
        Ok(())
    }

    /// Clears the subscriber; the receiver is torn down on the next `tick`.
    pub fn unsubscribe_for_messages(&mut self) -> MessengerResult<()> {
        if self.subscription.is_none() {
            return Err(MessengerError::NotSubscribed);
        }

        self.subscription = None;
        Ok(())
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscription.is_some()
    }

    /// Settles a deferred delivery. Consumes the ticket whether or not the
    /// underlying call succeeds.
    pub fn send_message_disposition(
        &mut self,
        ticket: DispositionTicket,
        disposition: MessageDisposition,
    ) -> MessengerResult<()> {
        let receiver = self.receiver.as_mut().ok_or(MessengerError::NoReceiver)?;
        let wire = wire_disposition(disposition).ok_or_else(|| {
            MessengerError::Amqp(AmqpError::Disposition(
                "a deferred verdict carries no wire disposition".to_string(),
            ))
        })?;

        receiver.dispose(&ticket.link_name, ticket.delivery_id, wire)?;
        Ok(())
    }

    /// One cooperative turn: reconcile sub-states, create missing links,
    /// pump inbound deliveries and the send queue.
    pub fn tick(&mut self, now: Instant) {
        self.process_state_changes(now);

        match self.state {
            MessengerState::Starting => {
                if self.sender.is_none() {
                    self.create_sender(now);
                }
            }
            MessengerState::Started => {
                self.manage_receiver(now);
                self.pump_inbound();
                self.pump_sends(now);

                if self.send_error_count >= self.max_send_error_count {
                    error!(
                        failures = self.send_error_count,
                        "reached max number of consecutive send failures"
                    );
                    self.update_state(MessengerState::Error);
                }
            }
            _ => {}
        }
    }

    /// Stops if needed, then fails every queued message with
    /// [`SendResult::MessengerDestroyed`] before the callbacks are dropped.
    pub fn shutdown(mut self) {
        self.teardown();
    }

    /// Sets one recognized option by name.
    pub fn set_option(&mut self, name: &str, value: &serde_json::Value) -> MessengerResult<()> {
        match name {
            OPTION_EVENT_SEND_TIMEOUT_SECS => {
                let secs = value.as_u64().ok_or_else(|| MessengerError::SetOptionFailed {
                    name: name.to_string(),
                    reason: "value must be an unsigned integer".to_string(),
                })?;
                self.queue.set_max_enqueued_time(secs);
                Ok(())
            }
            OPTION_SAVED_QUEUE_OPTIONS => {
                let options: QueueOptions = serde_json::from_value(value.clone()).map_err(|e| {
                    MessengerError::SetOptionFailed {
                        name: name.to_string(),
                        reason: e.to_string(),
                    }
                })?;
                self.queue.set_options(options);
                Ok(())
            }
            _ => Err(MessengerError::UnknownOption(name.to_string())),
        }
    }

    /// Snapshot of the tunables for persistence. Feeding each entry back
    /// through [`set_option`](Self::set_option) on a fresh messenger
    /// reproduces them.
    pub fn retrieve_options(&self) -> MessengerResult<serde_json::Value> {
        let queue_options =
            serde_json::to_value(self.queue.options()).map_err(MessengerError::SerializationFailed)?;
        let mut options = serde_json::Map::new();
        options.insert(OPTION_SAVED_QUEUE_OPTIONS.to_string(), queue_options);
        Ok(serde_json::Value::Object(options))
    }

    fn update_state(&mut self, new_state: MessengerState) {
        if new_state != self.state {
            let previous = self.state;
            self.state = new_state;
            debug!(?previous, current = ?new_state, "messenger state changed");
            if let Some(callback) = self.on_state_changed.as_mut() {
                callback(previous, new_state);
            }
        }
    }

    /// Maps sender/receiver sub-states onto the messenger state.
    fn process_state_changes(&mut self, now: Instant) {
        if let Some(state) = self.sender.as_ref().map(MessageSender::state) {
            self.sender_track.observe(state, now);
        }
        if let Some(state) = self.receiver.as_ref().map(MessageReceiver::state) {
            self.receiver_track.observe(state, now);
        }

        match self.state {
            MessengerState::Started => {
                if self.sender_track.current != LinkState::Open {
                    error!(
                        state = ?self.sender_track.current,
                        previous = ?self.sender_track.previous,
                        "message sender left the open state while the messenger was started"
                    );
                    self.update_state(MessengerState::Error);
                } else if self.receiver.is_some() && self.receiver_track.current != LinkState::Open
                {
                    match self.receiver_track.current {
                        LinkState::Opening => {
                            if self.receiver_track.opening_timed_out(now) {
                                error!(
                                    timeout_secs = LINK_STATE_CHANGE_TIMEOUT.as_secs(),
                                    "message receiver failed to open within the expected timeout"
                                );
                                self.update_state(MessengerState::Error);
                            }
                        }
                        LinkState::Error | LinkState::Idle => {
                            error!(
                                state = ?self.receiver_track.current,
                                "message receiver reported an unexpected state"
                            );
                            self.update_state(MessengerState::Error);
                        }
                        _ => {}
                    }
                }
            }
            MessengerState::Starting => match self.sender_track.current {
                LinkState::Open => self.update_state(MessengerState::Started),
                LinkState::Opening => {
                    if self.sender_track.opening_timed_out(now) {
                        error!(
                            timeout_secs = LINK_STATE_CHANGE_TIMEOUT.as_secs(),
                            "message sender failed to open within the expected timeout"
                        );
                        self.update_state(MessengerState::Error);
                    }
                }
                LinkState::Error | LinkState::Closing => {
                    error!(
                        state = ?self.sender_track.current,
                        "message sender reported an unexpected state while starting"
                    );
                    self.update_state(MessengerState::Error);
                }
                // Idle with a live sender means the library dropped it.
                LinkState::Idle => {
                    if self.sender.is_some() {
                        error!("message sender fell back to idle while starting");
                        self.update_state(MessengerState::Error);
                    }
                }
            },
            _ => {}
        }
    }

    fn create_sender(&mut self, now: Instant) {
        let request = match LinkFactory::sender_request(
            &self.config.identity,
            &self.config.send_link_attach_properties,
        ) {
            Ok(request) => request,
            Err(err) => {
                error!(error = %err, "failed building the sender link request");
                self.update_state(MessengerState::Error);
                return;
            }
        };

        let Some(session) = self.session.as_mut() else {
            error!("no session available while starting");
            self.update_state(MessengerState::Error);
            return;
        };

        let opened = session.open_sender(&request);
        match opened {
            Ok(sender) => {
                debug!(link = %request.name, "message sender created");
                self.sender_track.observe(sender.state(), now);
                self.sender = Some(sender);
            }
            Err(err) => {
                error!(error = %err, "failed creating the message sender");
                self.update_state(MessengerState::Error);
            }
        }
    }

    fn destroy_sender(&mut self) {
        if self.sender.take().is_some() {
            debug!("message sender destroyed");
        }
        self.sender_track.reset();
        self.in_flight_tags.clear();
    }

    /// Creates or tears down the receiver to match the subscription.
    /// Creation failures are retried on the next tick.
    fn manage_receiver(&mut self, now: Instant) {
        if self.subscription.is_some() && self.receiver.is_none() {
            let request = match LinkFactory::receiver_request(
                &self.config.identity,
                &self.config.receive_link_attach_properties,
            ) {
                Ok(request) => request,
                Err(err) => {
                    warn!(error = %err, "failed building the receiver link request");
                    return;
                }
            };

            let Some(session) = self.session.as_mut() else {
                warn!("no session available for the message receiver");
                return;
            };

            let opened = session.open_receiver(&request);
            match opened {
                Ok(receiver) => {
                    debug!(link = %request.name, "message receiver created");
                    self.receiver_track.observe(receiver.state(), now);
                    self.receiver = Some(receiver);
                }
                Err(err) => {
                    warn!(error = %err, "failed creating the message receiver, will retry");
                }
            }
        } else if self.subscription.is_none() && self.receiver.is_some() {
            self.destroy_receiver();
        }
    }

    fn destroy_receiver(&mut self) {
        if let Some(mut receiver) = self.receiver.take() {
            if let Err(err) = receiver.close() {
                warn!(error = %err, "failed closing the message receiver (ignored)");
            }
            debug!("message receiver destroyed");
        }
        self.receiver_track.reset();
    }

    /// Drains inbound deliveries and settles them per the subscriber's
    /// verdict.
    fn pump_inbound(&mut self) {
        let Self {
            receiver,
            subscription,
            ..
        } = self;
        let (Some(receiver), Some(on_message)) = (receiver.as_mut(), subscription.as_mut()) else {
            return;
        };

        while let Some(message) = receiver.try_next() {
            let delivery = receiver
                .received_delivery_id()
                .and_then(|id| receiver.received_link_name().map(|name| (id, name)));
            let (delivery_id, link_name) = match delivery {
                Ok(pair) => pair,
                Err(err) => {
                    warn!(error = %err, "failed reading delivery info, releasing the message");
                    if let Err(err) = receiver.release_current() {
                        warn!(error = %err, "failed releasing the unidentified delivery");
                    }
                    continue;
                }
            };

            let ticket = DispositionTicket::new(link_name.clone(), delivery_id);
            let verdict = on_message(message, ticket);

            let Some(wire) = wire_disposition(verdict) else {
                // Deferred: the subscriber settles later.
                continue;
            };
            if let Err(err) = receiver.dispose(&link_name, delivery_id, wire) {
                warn!(error = %err, delivery_id, "failed sending the message disposition");
            }
        }
    }

    /// Drains send outcomes, then dispatches pending work through the
    /// sender, and finally reports terminal completions to the callers.
    fn pump_sends(&mut self, now: Instant) {
        let completions = {
            let Self {
                queue,
                sender,
                in_flight_tags,
                ..
            } = self;
            let Some(sender) = sender.as_mut() else {
                return;
            };

            let mut completions = Vec::new();
            while let Some((tag, outcome)) = sender.poll_outcome() {
                let Some(id) = in_flight_tags.remove(&tag) else {
                    debug!(tag, "send outcome for an unknown delivery tag (ignored)");
                    continue;
                };
                let result = match outcome {
                    SendOutcome::Ok => ProcessResult::Success,
                    SendOutcome::Error(reason) => {
                        warn!(%reason, "message send failed");
                        ProcessResult::Error
                    }
                };
                if let Some(completion) = queue.complete(id, result) {
                    completions.push(completion);
                }
            }

            completions.extend(queue.tick(now, |id, message| {
                match sender.send(message.clone()) {
                    Ok(tag) => {
                        in_flight_tags.insert(tag, id);
                        DispatchOutcome::Dispatched
                    }
                    Err(err) => {
                        warn!(error = %err, "failed handing the message to the sender");
                        DispatchOutcome::Failed
                    }
                }
            }));
            completions
        };

        for completion in completions {
            self.finish_send(completion);
        }
    }

    /// Maps one terminal queue result to the caller-visible send result and
    /// fires the completion callback.
    fn finish_send(&mut self, completion: Completion<AmqpMessage, SendCompleteCallback>) {
        let result = match completion.result {
            ProcessResult::Success => {
                self.send_error_count = 0;
                SendResult::Ok
            }
            ProcessResult::Timeout => SendResult::Timeout,
            ProcessResult::Cancelled if self.state == MessengerState::Stopped => {
                SendResult::MessengerDestroyed
            }
            _ => {
                self.send_error_count += 1;
                SendResult::FailSending
            }
        };

        (completion.callback)(result);
    }

    fn teardown(&mut self) {
        if self.state != MessengerState::Stopped {
            let _ = self.stop();
        }
        for completion in self.queue.drain(ProcessResult::Cancelled) {
            self.finish_send(completion);
        }
    }
}

impl<S: Session> Drop for AmqpMessenger<S> {
    fn drop(&mut self) {
        // Queued callbacks must observe MessengerDestroyed before they are
        // dropped; shutdown() already emptied the queue on the explicit
        // path.
        if !self.queue.is_empty() {
            self.teardown();
        }
    }
}

fn wire_disposition(disposition: MessageDisposition) -> Option<WireDisposition> {
    match disposition {
        MessageDisposition::Accepted => Some(WireDisposition::Accepted),
        MessageDisposition::Released => Some(WireDisposition::Released),
        MessageDisposition::Rejected => Some(WireDisposition::Rejected {
            condition: REJECTED_BY_APPLICATION.to_string(),
            description: REJECTED_BY_APPLICATION.to_string(),
        }),
        MessageDisposition::Deferred => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sub_state_tracker_records_changes() {
        let mut track = SubStateTracker::new();
        assert_eq!(track.current, LinkState::Idle);
        assert_eq!(track.last_change, None);

        let now = Instant::now();
        track.observe(LinkState::Opening, now);
        assert_eq!(track.current, LinkState::Opening);
        assert_eq!(track.previous, LinkState::Idle);
        assert_eq!(track.last_change, Some(now));

        // Re-observing the same state does not refresh the change time.
        let later = now + Duration::from_secs(5);
        track.observe(LinkState::Opening, later);
        assert_eq!(track.last_change, Some(now));
    }

    #[test]
    fn test_opening_timeout_window() {
        let mut track = SubStateTracker::new();
        let now = Instant::now();
        track.observe(LinkState::Opening, now);

        assert!(!track.opening_timed_out(now + Duration::from_secs(299)));
        assert!(track.opening_timed_out(now + LINK_STATE_CHANGE_TIMEOUT));
    }

    #[test]
    fn test_never_observed_does_not_time_out() {
        let track = SubStateTracker::new();
        assert!(!track.opening_timed_out(Instant::now() + Duration::from_secs(100_000)));
    }

    #[test]
    fn test_wire_disposition_mapping() {
        assert_eq!(
            wire_disposition(MessageDisposition::Accepted),
            Some(WireDisposition::Accepted)
        );
        assert_eq!(
            wire_disposition(MessageDisposition::Released),
            Some(WireDisposition::Released)
        );
        assert_eq!(wire_disposition(MessageDisposition::Deferred), None);

        match wire_disposition(MessageDisposition::Rejected) {
            Some(WireDisposition::Rejected {
                condition,
                description,
            }) => {
                assert_eq!(condition, REJECTED_BY_APPLICATION);
                assert_eq!(description, REJECTED_BY_APPLICATION);
            }
            other => panic!("unexpected mapping: {other:?}"),
        }
    }
}
