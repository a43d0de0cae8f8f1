//! Lifecycle and state-machine tests for the AMQP messenger
//!
//! Covers the start/stop transitions, the sender/receiver sub-state
//! mapping, open timeouts, and the state-changed observer.

mod test_helpers;

use hublink::testing::FakeSession;
use hublink::{AttachProperties, LinkState, MessengerConfig, MessengerError, MessengerState};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};
use test_helpers::{drive_to_started, test_messenger};

#[test]
fn test_initial_state_is_stopped() {
    let messenger = test_messenger();
    assert_eq!(messenger.state(), MessengerState::Stopped);
}

#[test]
fn test_start_defers_link_creation_to_tick() {
    let session = FakeSession::new();
    let mut messenger = test_messenger();

    messenger.start(session.clone()).unwrap();
    assert_eq!(messenger.state(), MessengerState::Starting);
    assert!(!session.sender_opened(), "start itself must not open links");

    messenger.tick(Instant::now());
    assert!(session.sender_opened());
}

#[test]
fn test_start_rejected_unless_stopped() {
    let session = FakeSession::new();
    let mut messenger = test_messenger();

    messenger.start(session.clone()).unwrap();
    let result = messenger.start(session.clone());
    assert!(matches!(
        result,
        Err(MessengerError::WrongState {
            state: MessengerState::Starting
        })
    ));
}

#[test]
fn test_stop_rejected_when_stopped() {
    let mut messenger = test_messenger();
    assert!(matches!(
        messenger.stop(),
        Err(MessengerError::WrongState { .. })
    ));
}

#[test]
fn test_sender_open_reaches_started() {
    let session = FakeSession::new();
    let mut messenger = test_messenger();
    drive_to_started(&mut messenger, &session, Instant::now());
}

#[test]
fn test_sender_open_failure_is_fatal_while_starting() {
    let session = FakeSession::new();
    session.fail_sender_opens(1);
    let mut messenger = test_messenger();

    messenger.start(session.clone()).unwrap();
    messenger.tick(Instant::now());
    assert_eq!(messenger.state(), MessengerState::Error);
}

#[test]
fn test_sender_error_while_starting_is_fatal() {
    let session = FakeSession::new();
    let mut messenger = test_messenger();
    let now = Instant::now();

    messenger.start(session.clone()).unwrap();
    messenger.tick(now);
    session.set_sender_state(LinkState::Error);
    messenger.tick(now);
    assert_eq!(messenger.state(), MessengerState::Error);
}

#[test]
fn test_sender_open_timeout_while_starting() {
    let session = FakeSession::new();
    let transitions: Rc<RefCell<Vec<(MessengerState, MessengerState)>>> =
        Rc::new(RefCell::new(Vec::new()));
    let observed = Rc::clone(&transitions);
    let mut messenger = test_messenger()
        .with_state_changed(move |previous, current| observed.borrow_mut().push((previous, current)));

    let start = Instant::now();
    messenger.start(session.clone()).unwrap();
    messenger.tick(start); // sender created, reports Opening

    // Just inside the window: still starting.
    messenger.tick(start + Duration::from_secs(299));
    assert_eq!(messenger.state(), MessengerState::Starting);

    messenger.tick(start + Duration::from_secs(300));
    assert_eq!(messenger.state(), MessengerState::Error);
    assert!(transitions
        .borrow()
        .contains(&(MessengerState::Starting, MessengerState::Error)));
}

#[test]
fn test_sender_leaving_open_is_fatal_while_started() {
    let session = FakeSession::new();
    let mut messenger = test_messenger();
    let now = Instant::now();
    drive_to_started(&mut messenger, &session, now);

    session.set_sender_state(LinkState::Closing);
    messenger.tick(now);
    assert_eq!(messenger.state(), MessengerState::Error);
}

#[test]
fn test_stop_from_error_allows_restart() {
    let session = FakeSession::new();
    session.fail_sender_opens(1);
    let mut messenger = test_messenger();

    messenger.start(session.clone()).unwrap();
    messenger.tick(Instant::now());
    assert_eq!(messenger.state(), MessengerState::Error);

    messenger.stop().unwrap();
    assert_eq!(messenger.state(), MessengerState::Stopped);

    drive_to_started(&mut messenger, &session, Instant::now());
}

#[test]
fn test_state_changed_observer_sees_full_startup() {
    let session = FakeSession::new();
    let transitions: Rc<RefCell<Vec<(MessengerState, MessengerState)>>> =
        Rc::new(RefCell::new(Vec::new()));
    let observed = Rc::clone(&transitions);
    let mut messenger = test_messenger()
        .with_state_changed(move |previous, current| observed.borrow_mut().push((previous, current)));

    drive_to_started(&mut messenger, &session, Instant::now());
    messenger.stop().unwrap();

    assert_eq!(
        *transitions.borrow(),
        vec![
            (MessengerState::Stopped, MessengerState::Starting),
            (MessengerState::Starting, MessengerState::Started),
            (MessengerState::Started, MessengerState::Stopping),
            (MessengerState::Stopping, MessengerState::Stopped),
        ]
    );
}

#[test]
fn test_subscription_creates_receiver_on_tick() {
    let session = FakeSession::new();
    let mut messenger = test_messenger();
    let now = Instant::now();
    drive_to_started(&mut messenger, &session, now);

    messenger
        .subscribe_for_messages(|_message, _ticket| hublink::MessageDisposition::Accepted)
        .unwrap();
    assert!(!session.receiver_opened(), "subscribe itself must not open links");

    messenger.tick(now);
    assert!(session.receiver_opened());
}

#[test]
fn test_receiver_open_failure_is_retried() {
    let session = FakeSession::new();
    session.fail_receiver_opens(1);
    let mut messenger = test_messenger();
    let now = Instant::now();
    drive_to_started(&mut messenger, &session, now);

    messenger
        .subscribe_for_messages(|_m, _t| hublink::MessageDisposition::Accepted)
        .unwrap();

    messenger.tick(now);
    assert!(!session.receiver_opened());
    assert_eq!(messenger.state(), MessengerState::Started, "failure is not fatal");

    messenger.tick(now);
    assert!(session.receiver_opened());
    assert_eq!(session.receiver_open_calls(), 2);
}

#[test]
fn test_unsubscribe_tears_receiver_down_on_tick() {
    let session = FakeSession::new();
    let mut messenger = test_messenger();
    let now = Instant::now();
    drive_to_started(&mut messenger, &session, now);

    messenger
        .subscribe_for_messages(|_m, _t| hublink::MessageDisposition::Accepted)
        .unwrap();
    messenger.tick(now);
    session.set_receiver_state(LinkState::Open);
    messenger.tick(now);

    messenger.unsubscribe_for_messages().unwrap();
    messenger.tick(now);
    assert!(session.receiver_closed());
    assert_eq!(messenger.state(), MessengerState::Started);
}

#[test]
fn test_receiver_open_timeout_is_fatal() {
    let session = FakeSession::new();
    let mut messenger = test_messenger();
    let start = Instant::now();
    drive_to_started(&mut messenger, &session, start);

    messenger
        .subscribe_for_messages(|_m, _t| hublink::MessageDisposition::Accepted)
        .unwrap();
    messenger.tick(start); // receiver created, reports Opening

    messenger.tick(start + Duration::from_secs(299));
    assert_eq!(messenger.state(), MessengerState::Started);

    messenger.tick(start + Duration::from_secs(300));
    assert_eq!(messenger.state(), MessengerState::Error);
}

#[test]
fn test_receiver_error_state_is_fatal_while_started() {
    let session = FakeSession::new();
    let mut messenger = test_messenger();
    let now = Instant::now();
    drive_to_started(&mut messenger, &session, now);

    messenger
        .subscribe_for_messages(|_m, _t| hublink::MessageDisposition::Accepted)
        .unwrap();
    messenger.tick(now);
    session.set_receiver_state(LinkState::Open);
    messenger.tick(now);

    session.set_receiver_state(LinkState::Error);
    messenger.tick(now);
    assert_eq!(messenger.state(), MessengerState::Error);
}

#[test]
fn test_subscribe_twice_rejected() {
    let mut messenger = test_messenger();
    messenger
        .subscribe_for_messages(|_m, _t| hublink::MessageDisposition::Accepted)
        .unwrap();
    assert!(matches!(
        messenger.subscribe_for_messages(|_m, _t| hublink::MessageDisposition::Accepted),
        Err(MessengerError::AlreadySubscribed)
    ));
}

#[test]
fn test_unsubscribe_without_subscription_rejected() {
    let mut messenger = test_messenger();
    assert!(matches!(
        messenger.unsubscribe_for_messages(),
        Err(MessengerError::NotSubscribed)
    ));
}

#[test]
fn test_link_requests_carry_attach_properties() {
    let mut send_properties = AttachProperties::new();
    send_properties.insert("com.microsoft:api-version".to_string(), "1.0".to_string());
    let mut receive_properties = AttachProperties::new();
    receive_properties.insert("custom".to_string(), "value".to_string());

    let config = MessengerConfig {
        identity: test_helpers::test_identity(),
        send_link_attach_properties: send_properties,
        receive_link_attach_properties: receive_properties,
    };
    let session = FakeSession::new();
    let mut messenger: hublink::AmqpMessenger<FakeSession> =
        hublink::AmqpMessenger::new(config).unwrap();
    let now = Instant::now();
    drive_to_started(&mut messenger, &session, now);

    messenger
        .subscribe_for_messages(|_m, _t| hublink::MessageDisposition::Accepted)
        .unwrap();
    messenger.tick(now);

    let sender_request = &session.sender_requests()[0];
    assert_eq!(
        sender_request.attach_properties.get("com.microsoft:api-version"),
        Some(&"1.0".to_string())
    );
    assert_eq!(
        sender_request.target,
        "amqps://h.example/devices/dev1/messages/events"
    );

    let receiver_request = &session.receiver_requests()[0];
    assert_eq!(
        receiver_request.attach_properties.get("custom"),
        Some(&"value".to_string())
    );
    assert_eq!(
        receiver_request.source,
        "amqps://h.example/devices/dev1/messages/devicebound"
    );
}

#[test]
fn test_invalid_config_rejected_at_create() {
    let mut identity = test_helpers::test_identity();
    identity.device_id = String::new();

    let result: Result<hublink::AmqpMessenger<FakeSession>, _> =
        hublink::AmqpMessenger::new(MessengerConfig::new(identity));
    assert!(matches!(result, Err(MessengerError::InvalidConfig(_))));
}
