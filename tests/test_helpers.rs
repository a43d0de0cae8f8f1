//! Shared helpers for the messenger integration tests

use hublink::testing::FakeSession;
use hublink::{
    AmqpMessenger, DeviceIdentity, LinkState, MessengerConfig, MessengerState, SendResult,
};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Instant;

#[allow(dead_code)]
pub fn test_identity() -> DeviceIdentity {
    DeviceIdentity {
        device_id: "dev1".to_string(),
        host_fqdn: "h.example".to_string(),
        devices_path_format: "{}/devices/{}".to_string(),
        send_suffix: "messages/events".to_string(),
        receive_suffix: "messages/devicebound".to_string(),
    }
}

#[allow(dead_code)]
pub fn test_messenger() -> AmqpMessenger<FakeSession> {
    AmqpMessenger::new(MessengerConfig::new(test_identity())).expect("valid test config")
}

/// Drives a stopped messenger to `Started`: start, let the first tick open
/// the sender, report the sender open, observe it on the next tick.
#[allow(dead_code)]
pub fn drive_to_started(
    messenger: &mut AmqpMessenger<FakeSession>,
    session: &FakeSession,
    now: Instant,
) {
    messenger.start(session.clone()).expect("start from stopped");
    messenger.tick(now);
    assert!(session.sender_opened(), "first tick should open the sender");

    session.set_sender_state(LinkState::Open);
    messenger.tick(now);
    assert_eq!(messenger.state(), MessengerState::Started);
}

/// Collects send results so tests can assert exactly-once completion.
#[allow(dead_code)]
pub fn result_collector() -> (Rc<RefCell<Vec<SendResult>>>, impl Fn() -> Box<dyn FnOnce(SendResult)>) {
    let results: Rc<RefCell<Vec<SendResult>>> = Rc::new(RefCell::new(Vec::new()));
    let handle = Rc::clone(&results);
    let make = move || {
        let sink = Rc::clone(&handle);
        Box::new(move |result| sink.borrow_mut().push(result)) as Box<dyn FnOnce(SendResult)>
    };
    (results, make)
}
