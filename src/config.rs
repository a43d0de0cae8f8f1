//! Messenger configuration
//!
//! Plain validated structs: the identity a messenger speaks for and the
//! attach-property maps applied to its links. There is no file, CLI, or
//! environment surface — a messenger is configured entirely by the caller
//! that embeds it.

use crate::error::{MessengerError, MessengerResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Symbol → string map applied to a link at attach time.
pub type AttachProperties = BTreeMap<String, String>;

/// Identity of the device endpoint a messenger speaks for.
///
/// Immutable for the lifetime of the messenger. `devices_path_format` is a
/// two-placeholder `{}` directive filled with `host_fqdn` and `device_id`,
/// in that order (the default is `"{}/devices/{}"`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub host_fqdn: String,
    pub devices_path_format: String,
    /// Suffix of the outgoing (send) link address.
    pub send_suffix: String,
    /// Suffix of the incoming (receive) link address.
    pub receive_suffix: String,
}

impl DeviceIdentity {
    /// Checks every field is usable before a messenger is built around it.
    pub fn validate(&self) -> MessengerResult<()> {
        if self.device_id.is_empty() {
            return Err(MessengerError::InvalidConfig(
                "device_id must not be empty".to_string(),
            ));
        }
        if !self
            .device_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-')
        {
            return Err(MessengerError::InvalidConfig(format!(
                "device_id '{}' must match pattern [a-zA-Z0-9._-]+",
                self.device_id
            )));
        }
        if self.host_fqdn.is_empty() {
            return Err(MessengerError::InvalidConfig(
                "host_fqdn must not be empty".to_string(),
            ));
        }
        if self.devices_path_format.is_empty() {
            return Err(MessengerError::InvalidConfig(
                "devices_path_format must not be empty".to_string(),
            ));
        }
        if self.devices_path_format.matches("{}").count() != 2 {
            return Err(MessengerError::InvalidConfig(
                "devices_path_format must contain exactly two '{}' placeholders".to_string(),
            ));
        }
        if self.send_suffix.is_empty() || self.receive_suffix.is_empty() {
            return Err(MessengerError::InvalidConfig(
                "link address suffixes must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Full configuration for one messenger instance.
///
/// Attach-property maps are taken by value; the messenger owns its copies
/// and never aliases them back to the caller or between the two links.
#[derive(Debug, Clone)]
pub struct MessengerConfig {
    pub identity: DeviceIdentity,
    pub send_link_attach_properties: AttachProperties,
    pub receive_link_attach_properties: AttachProperties,
}

impl MessengerConfig {
    pub fn new(identity: DeviceIdentity) -> Self {
        Self {
            identity,
            send_link_attach_properties: AttachProperties::new(),
            receive_link_attach_properties: AttachProperties::new(),
        }
    }

    pub fn validate(&self) -> MessengerResult<()> {
        self.identity.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_identity() -> DeviceIdentity {
        DeviceIdentity {
            device_id: "dev1".to_string(),
            host_fqdn: "h.example".to_string(),
            devices_path_format: "{}/devices/{}".to_string(),
            send_suffix: "messages/events".to_string(),
            receive_suffix: "messages/devicebound".to_string(),
        }
    }

    #[test]
    fn test_valid_identity() {
        assert!(test_identity().validate().is_ok());
    }

    #[test]
    fn test_empty_fields_rejected() {
        for field in ["device_id", "host_fqdn", "devices_path_format", "suffix"] {
            let mut identity = test_identity();
            match field {
                "device_id" => identity.device_id.clear(),
                "host_fqdn" => identity.host_fqdn.clear(),
                "devices_path_format" => identity.devices_path_format.clear(),
                _ => identity.send_suffix.clear(),
            }
            assert!(
                matches!(identity.validate(), Err(MessengerError::InvalidConfig(_))),
                "empty {field} should be rejected"
            );
        }
    }

    #[test]
    fn test_invalid_device_id_format() {
        let mut identity = test_identity();
        identity.device_id = "bad@device".to_string();
        assert!(identity.validate().is_err());

        identity.device_id = "ok-device_123.x".to_string();
        assert!(identity.validate().is_ok());
    }

    #[test]
    fn test_path_format_placeholder_count() {
        let mut identity = test_identity();
        identity.devices_path_format = "{}/devices".to_string();
        assert!(identity.validate().is_err());

        identity.devices_path_format = "{}/units/{}".to_string();
        assert!(identity.validate().is_ok());
    }
}
