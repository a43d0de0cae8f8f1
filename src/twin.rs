//! Device-twin messenger
//!
//! Framing adapter over [`AmqpMessenger`]: wraps a reported-state payload
//! into an AMQP message carrying the twin-required annotations and maps
//! completion results back to a twin-level result. Everything else is a
//! pass-through; the adapter keeps no state machine of its own.

use crate::amqp::{AmqpMessage, AnnotationValue, Session};
use crate::config::{AttachProperties, DeviceIdentity, MessengerConfig};
use crate::error::MessengerResult;
use crate::messenger::{
    AmqpMessenger, DispositionTicket, MessageDisposition, MessengerState, SendResult, SendStatus,
};
use std::time::Instant;
use tracing::debug;
use uuid::Uuid;

const TWIN_MESSAGE_ANNOTATION_OPERATION: &str = "operation";
const TWIN_MESSAGE_ANNOTATION_RESOURCE: &str = "resource";
const TWIN_MESSAGE_ANNOTATION_VERSION: &str = "version";

const TWIN_RESOURCE: &str = "/notifications/twin/properties/desired";

const TWIN_CORRELATION_ID_PROPERTY_NAME: &str = "com.microsoft:channel-correlation-id";
const TWIN_API_VERSION_PROPERTY_NAME: &str = "com.microsoft:api-version";
const TWIN_API_VERSION_NUMBER: &str = "1.0";

const TWIN_DEVICES_PATH_FORMAT: &str = "{}/devices/{}";
const TWIN_SEND_LINK_SUFFIX: &str = "twin/";
const TWIN_RECEIVE_LINK_SUFFIX: &str = "twin/";

/// Verb carried in the `operation` annotation of a twin request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TwinOperation {
    Patch,
    Put,
    Delete,
}

impl TwinOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            TwinOperation::Patch => "PATCH",
            TwinOperation::Put => "PUT",
            TwinOperation::Delete => "DELETE",
        }
    }
}

/// Outcome of one reported-state request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportStateResult {
    Success,
    Error,
}

/// Twin-protocol adapter over the generic messenger.
pub struct TwinMessenger<S: Session> {
    amqp: AmqpMessenger<S>,
}

impl<S: Session> TwinMessenger<S> {
    /// Builds the adapter for one device. Generates a fresh channel
    /// correlation id and supplies the twin attach properties to both
    /// links.
    pub fn new(device_id: &str, host_fqdn: &str) -> MessengerResult<Self> {
        let attach_properties = Self::link_attach_properties();
        let identity = DeviceIdentity {
            device_id: device_id.to_string(),
            host_fqdn: host_fqdn.to_string(),
            devices_path_format: TWIN_DEVICES_PATH_FORMAT.to_string(),
            send_suffix: TWIN_SEND_LINK_SUFFIX.to_string(),
            receive_suffix: TWIN_RECEIVE_LINK_SUFFIX.to_string(),
        };
        let config = MessengerConfig {
            identity,
            send_link_attach_properties: attach_properties.clone(),
            receive_link_attach_properties: attach_properties,
        };

        Ok(Self {
            amqp: AmqpMessenger::new(config)?,
        })
    }

    /// Registers an observer for the underlying messenger's state
    /// transitions.
    pub fn with_state_changed(
        mut self,
        callback: impl FnMut(MessengerState, MessengerState) + 'static,
    ) -> Self {
        self.amqp = self.amqp.with_state_changed(callback);
        self
    }

    /// Sends a reported-properties update. The payload bytes are carried
    /// opaquely; encoding is the caller's concern.
    pub fn report_state_async(
        &mut self,
        payload: &[u8],
        on_complete: impl FnOnce(ReportStateResult) + 'static,
    ) -> MessengerResult<()> {
        let message = build_update_message(TwinOperation::Patch, payload);
        self.amqp.send_async(&message, move |result| {
            let report_result = match result {
                SendResult::Ok => ReportStateResult::Success,
                _ => ReportStateResult::Error,
            };
            on_complete(report_result);
        })
    }

    /// Subscribes for twin updates pushed by the service. On failure the
    /// previous subscription (if any) stays in effect.
    pub fn subscribe(
        &mut self,
        on_message: impl FnMut(AmqpMessage, DispositionTicket) -> MessageDisposition + 'static,
    ) -> MessengerResult<()> {
        self.amqp.subscribe_for_messages(on_message)
    }

    pub fn unsubscribe(&mut self) -> MessengerResult<()> {
        self.amqp.unsubscribe_for_messages()
    }

    pub fn start(&mut self, session: S) -> MessengerResult<()> {
        self.amqp.start(session)
    }

    pub fn stop(&mut self) -> MessengerResult<()> {
        self.amqp.stop()
    }

    pub fn tick(&mut self, now: Instant) {
        self.amqp.tick(now);
    }

    pub fn state(&self) -> MessengerState {
        self.amqp.state()
    }

    /// Delegates to the underlying messenger: `Idle` iff no twin request is
    /// queued or in flight.
    pub fn send_status(&self) -> SendStatus {
        self.amqp.send_status()
    }

    pub fn send_message_disposition(
        &mut self,
        ticket: DispositionTicket,
        disposition: MessageDisposition,
    ) -> MessengerResult<()> {
        self.amqp.send_message_disposition(ticket, disposition)
    }

    /// No options are recognized at the twin layer; recognized options
    /// belong to the underlying messenger. Accepts anything and does
    /// nothing, preserving the option API shape.
    pub fn set_option(&mut self, name: &str, _value: &serde_json::Value) -> MessengerResult<()> {
        debug!(name, "twin messenger option ignored");
        Ok(())
    }

    /// The twin layer itself has no tunables; returns an empty blob.
    pub fn retrieve_options(&self) -> serde_json::Value {
        serde_json::Value::Object(serde_json::Map::new())
    }

    pub fn shutdown(self) {
        self.amqp.shutdown();
    }

    fn link_attach_properties() -> AttachProperties {
        let correlation_id = format!("twin:{}", Uuid::new_v4());
        let mut properties = AttachProperties::new();
        properties.insert(TWIN_CORRELATION_ID_PROPERTY_NAME.to_string(), correlation_id);
        properties.insert(
            TWIN_API_VERSION_PROPERTY_NAME.to_string(),
            TWIN_API_VERSION_NUMBER.to_string(),
        );
        properties
    }
}

/// Frames one twin request: resource, operation verb, null version, and
/// the payload as the message body.
fn build_update_message(operation: TwinOperation, payload: &[u8]) -> AmqpMessage {
    let mut message = AmqpMessage::new();
    message.set_annotation(
        TWIN_MESSAGE_ANNOTATION_RESOURCE,
        AnnotationValue::Str(TWIN_RESOURCE.to_string()),
    );
    message.set_annotation(
        TWIN_MESSAGE_ANNOTATION_OPERATION,
        AnnotationValue::Str(operation.as_str().to_string()),
    );
    message.set_annotation(TWIN_MESSAGE_ANNOTATION_VERSION, AnnotationValue::Null);
    message.set_body(payload.to_vec());
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_message_annotations() {
        let message = build_update_message(TwinOperation::Patch, b"{\"reported\":1}");

        assert_eq!(
            message.annotation("resource"),
            Some(&AnnotationValue::Str(
                "/notifications/twin/properties/desired".to_string()
            ))
        );
        assert_eq!(
            message.annotation("operation"),
            Some(&AnnotationValue::Str("PATCH".to_string()))
        );
        assert_eq!(message.annotation("version"), Some(&AnnotationValue::Null));
        assert_eq!(message.body(), b"{\"reported\":1}");
    }

    #[test]
    fn test_operation_wire_strings() {
        assert_eq!(TwinOperation::Patch.as_str(), "PATCH");
        assert_eq!(TwinOperation::Put.as_str(), "PUT");
        assert_eq!(TwinOperation::Delete.as_str(), "DELETE");
    }

    #[test]
    fn test_attach_properties_shape() {
        let properties = TwinMessenger::<crate::testing::FakeSession>::link_attach_properties();

        let correlation = properties
            .get("com.microsoft:channel-correlation-id")
            .expect("correlation id present");
        assert!(correlation.starts_with("twin:"));
        assert_eq!(
            properties.get("com.microsoft:api-version"),
            Some(&"1.0".to_string())
        );

        // Every adapter instance gets a fresh correlation token.
        let other = TwinMessenger::<crate::testing::FakeSession>::link_attach_properties();
        assert_ne!(
            properties.get("com.microsoft:channel-correlation-id"),
            other.get("com.microsoft:channel-correlation-id")
        );
    }
}
