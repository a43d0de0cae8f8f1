//! Scriptable fakes for [`Session`], [`MessageSender`] and
//! [`MessageReceiver`]
//!
//! The fakes record everything the messenger does (link requests, sent
//! messages, dispositions) and let tests drive what the library would
//! report back (link states, send outcomes, inbound deliveries). A
//! [`FakeSession`] is a cheap clonable handle: tests keep one clone and
//! hand another to `start`, then steer the opened sender/receiver through
//! the session's control methods.
//!
//! Everything is single-threaded, matching the messenger's cooperative
//! model; the fakes panic with a clear message when a control method is
//! used before the corresponding link exists.

use crate::amqp::{
    AmqpError, AmqpMessage, DeliveryTag, LinkRequest, LinkState, MessageReceiver, MessageSender,
    SendOutcome, Session, WireDisposition,
};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

#[derive(Debug)]
struct SenderInner {
    state: LinkState,
    fail_sends: bool,
    sent: Vec<AmqpMessage>,
    pending_tags: VecDeque<DeliveryTag>,
    outcomes: VecDeque<(DeliveryTag, SendOutcome)>,
    next_tag: DeliveryTag,
}

/// Fake outgoing link handed to the messenger by [`FakeSession`].
#[derive(Debug)]
pub struct FakeSender {
    inner: Rc<RefCell<SenderInner>>,
}

impl MessageSender for FakeSender {
    fn state(&self) -> LinkState {
        self.inner.borrow().state
    }

    fn send(&mut self, message: AmqpMessage) -> Result<DeliveryTag, AmqpError> {
        let mut inner = self.inner.borrow_mut();
        if inner.fail_sends {
            return Err(AmqpError::Send("fake sender configured to fail".to_string()));
        }
        let tag = inner.next_tag;
        inner.next_tag += 1;
        inner.sent.push(message);
        inner.pending_tags.push_back(tag);
        Ok(tag)
    }

    fn poll_outcome(&mut self) -> Option<(DeliveryTag, SendOutcome)> {
        self.inner.borrow_mut().outcomes.pop_front()
    }
}

#[derive(Debug)]
struct ReceiverInner {
    state: LinkState,
    link_name: String,
    fail_delivery_info: bool,
    deliveries: VecDeque<AmqpMessage>,
    current_delivery_id: Option<u64>,
    next_delivery_id: u64,
    dispositions: Vec<(String, u64, WireDisposition)>,
    released_current: u32,
    closed: bool,
}

/// Fake incoming link handed to the messenger by [`FakeSession`].
#[derive(Debug)]
pub struct FakeReceiver {
    inner: Rc<RefCell<ReceiverInner>>,
}

impl MessageReceiver for FakeReceiver {
    fn state(&self) -> LinkState {
        self.inner.borrow().state
    }

    fn try_next(&mut self) -> Option<AmqpMessage> {
        let mut inner = self.inner.borrow_mut();
        let message = inner.deliveries.pop_front()?;
        let id = inner.next_delivery_id;
        inner.next_delivery_id += 1;
        inner.current_delivery_id = Some(id);
        Some(message)
    }

    fn received_delivery_id(&self) -> Result<u64, AmqpError> {
        let inner = self.inner.borrow();
        if inner.fail_delivery_info {
            return Err(AmqpError::Link("fake delivery info failure".to_string()));
        }
        inner.current_delivery_id.ok_or(AmqpError::NoCurrentDelivery)
    }

    fn received_link_name(&self) -> Result<String, AmqpError> {
        let inner = self.inner.borrow();
        if inner.fail_delivery_info {
            return Err(AmqpError::Link("fake delivery info failure".to_string()));
        }
        Ok(inner.link_name.clone())
    }

    fn dispose(
        &mut self,
        link_name: &str,
        delivery_id: u64,
        disposition: WireDisposition,
    ) -> Result<(), AmqpError> {
        self.inner
            .borrow_mut()
            .dispositions
            .push((link_name.to_string(), delivery_id, disposition));
        Ok(())
    }

    fn release_current(&mut self) -> Result<(), AmqpError> {
        self.inner.borrow_mut().released_current += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<(), AmqpError> {
        let mut inner = self.inner.borrow_mut();
        inner.closed = true;
        inner.state = LinkState::Closing;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct SessionInner {
    fail_sender_opens: u32,
    fail_receiver_opens: u32,
    sender_open_calls: u32,
    receiver_open_calls: u32,
    sender_requests: Vec<LinkRequest>,
    receiver_requests: Vec<LinkRequest>,
    sender: Option<Rc<RefCell<SenderInner>>>,
    receiver: Option<Rc<RefCell<ReceiverInner>>>,
}

/// Clonable fake session handle.
#[derive(Debug, Clone, Default)]
pub struct FakeSession {
    inner: Rc<RefCell<SessionInner>>,
}

impl FakeSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` sender opens fail.
    pub fn fail_sender_opens(&self, count: u32) {
        self.inner.borrow_mut().fail_sender_opens = count;
    }

    /// Makes the next `count` receiver opens fail.
    pub fn fail_receiver_opens(&self, count: u32) {
        self.inner.borrow_mut().fail_receiver_opens = count;
    }

    pub fn sender_open_calls(&self) -> u32 {
        self.inner.borrow().sender_open_calls
    }

    pub fn receiver_open_calls(&self) -> u32 {
        self.inner.borrow().receiver_open_calls
    }

    pub fn sender_opened(&self) -> bool {
        self.inner.borrow().sender.is_some()
    }

    pub fn receiver_opened(&self) -> bool {
        self.inner.borrow().receiver.is_some()
    }

    pub fn sender_requests(&self) -> Vec<LinkRequest> {
        self.inner.borrow().sender_requests.clone()
    }

    pub fn receiver_requests(&self) -> Vec<LinkRequest> {
        self.inner.borrow().receiver_requests.clone()
    }

    /// Drives the state the opened sender reports to the messenger.
    pub fn set_sender_state(&self, state: LinkState) {
        self.with_sender(|sender| sender.state = state);
    }

    pub fn set_receiver_state(&self, state: LinkState) {
        self.with_receiver(|receiver| receiver.state = state);
    }

    /// Makes every subsequent `send` on the opened sender fail.
    pub fn set_fail_sends(&self, fail: bool) {
        self.with_sender(|sender| sender.fail_sends = fail);
    }

    pub fn sent_messages(&self) -> Vec<AmqpMessage> {
        self.with_sender(|sender| sender.sent.clone())
    }

    pub fn sent_count(&self) -> usize {
        self.with_sender(|sender| sender.sent.len())
    }

    /// Reports the library outcome for the oldest unanswered transfer.
    /// Panics if nothing is awaiting an outcome.
    pub fn complete_next_send(&self, outcome: SendOutcome) {
        self.with_sender(|sender| {
            let tag = sender
                .pending_tags
                .pop_front()
                .expect("no transfer awaiting an outcome");
            sender.outcomes.push_back((tag, outcome));
        });
    }

    /// Queues an inbound delivery on the opened receiver.
    pub fn deliver(&self, message: AmqpMessage) {
        self.with_receiver(|receiver| receiver.deliveries.push_back(message));
    }

    /// Makes delivery-id/link-name reads on the receiver fail.
    pub fn set_fail_delivery_info(&self, fail: bool) {
        self.with_receiver(|receiver| receiver.fail_delivery_info = fail);
    }

    pub fn dispositions(&self) -> Vec<(String, u64, WireDisposition)> {
        self.with_receiver(|receiver| receiver.dispositions.clone())
    }

    pub fn released_current_count(&self) -> u32 {
        self.with_receiver(|receiver| receiver.released_current)
    }

    pub fn receiver_closed(&self) -> bool {
        self.with_receiver(|receiver| receiver.closed)
    }

    pub fn receiver_link_name(&self) -> String {
        self.with_receiver(|receiver| receiver.link_name.clone())
    }

    fn with_sender<T>(&self, f: impl FnOnce(&mut SenderInner) -> T) -> T {
        let inner = self.inner.borrow();
        let sender = inner.sender.as_ref().expect("no sender has been opened");
        let mut sender = sender.borrow_mut();
        f(&mut sender)
    }

    fn with_receiver<T>(&self, f: impl FnOnce(&mut ReceiverInner) -> T) -> T {
        let inner = self.inner.borrow();
        let receiver = inner.receiver.as_ref().expect("no receiver has been opened");
        let mut receiver = receiver.borrow_mut();
        f(&mut receiver)
    }
}

impl Session for FakeSession {
    type Sender = FakeSender;
    type Receiver = FakeReceiver;

    fn open_sender(&mut self, request: &LinkRequest) -> Result<Self::Sender, AmqpError> {
        let mut inner = self.inner.borrow_mut();
        inner.sender_open_calls += 1;
        inner.sender_requests.push(request.clone());
        if inner.fail_sender_opens > 0 {
            inner.fail_sender_opens -= 1;
            return Err(AmqpError::Link("fake sender open failure".to_string()));
        }

        let sender = Rc::new(RefCell::new(SenderInner {
            state: LinkState::Opening,
            fail_sends: false,
            sent: Vec::new(),
            pending_tags: VecDeque::new(),
            outcomes: VecDeque::new(),
            next_tag: 0,
        }));
        inner.sender = Some(Rc::clone(&sender));
        Ok(FakeSender { inner: sender })
    }

    fn open_receiver(&mut self, request: &LinkRequest) -> Result<Self::Receiver, AmqpError> {
        let mut inner = self.inner.borrow_mut();
        inner.receiver_open_calls += 1;
        inner.receiver_requests.push(request.clone());
        if inner.fail_receiver_opens > 0 {
            inner.fail_receiver_opens -= 1;
            return Err(AmqpError::Link("fake receiver open failure".to_string()));
        }

        let receiver = Rc::new(RefCell::new(ReceiverInner {
            state: LinkState::Opening,
            link_name: request.name.clone(),
            fail_delivery_info: false,
            deliveries: VecDeque::new(),
            current_delivery_id: None,
            next_delivery_id: 0,
            dispositions: Vec::new(),
            released_current: 0,
            closed: false,
        }));
        inner.receiver = Some(Rc::clone(&receiver));
        Ok(FakeReceiver { inner: receiver })
    }
}
