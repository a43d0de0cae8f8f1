//! Link name and address construction
//!
//! Pure helpers that turn a [`DeviceIdentity`] into the names, addresses,
//! and attach requests for the messenger's two links. No I/O happens here;
//! the produced [`LinkRequest`] values are consumed by the session.

use crate::amqp::{LinkRequest, LinkRole, ReceiverSettleMode};
use crate::config::{AttachProperties, DeviceIdentity};
use crate::error::{MessengerError, MessengerResult};
use url::Url;
use uuid::Uuid;

pub const SENDER_LINK_NAME_PREFIX: &str = "link-snd";
pub const RECEIVER_LINK_NAME_PREFIX: &str = "link-rcv";

/// Receiver links cap incoming transfers; sender links are unbounded.
pub const RECEIVER_MAX_MESSAGE_SIZE: u64 = 65_536;

/// Builds link names and addresses from a device identity.
pub struct LinkFactory;

impl LinkFactory {
    /// Fills the identity's path directive with host and device id, e.g.
    /// `h.example/devices/dev1`.
    pub fn devices_path(identity: &DeviceIdentity) -> String {
        identity
            .devices_path_format
            .replacen("{}", &identity.host_fqdn, 1)
            .replacen("{}", &identity.device_id, 1)
    }

    /// `amqps://<devices_path>/<suffix>`
    pub fn link_address(devices_path: &str, suffix: &str) -> String {
        format!("amqps://{devices_path}/{suffix}")
    }

    /// A link name unique per session: `<prefix>-<device_id>-<uuid>`.
    pub fn link_name(prefix: &str, device_id: &str) -> String {
        format!("{prefix}-{device_id}-{}", Uuid::new_v4())
    }

    pub fn source_name(link_name: &str) -> String {
        format!("{link_name}-source")
    }

    pub fn target_name(link_name: &str) -> String {
        format!("{link_name}-target")
    }

    /// Attach request for the outgoing link: symbolic source, address
    /// target, unbounded message size.
    pub fn sender_request(
        identity: &DeviceIdentity,
        attach_properties: &AttachProperties,
    ) -> MessengerResult<LinkRequest> {
        let devices_path = Self::devices_path(identity);
        let address = Self::checked_address(&devices_path, &identity.send_suffix)?;
        let name = Self::link_name(SENDER_LINK_NAME_PREFIX, &identity.device_id);
        let source = Self::source_name(&name);

        Ok(LinkRequest {
            name,
            source,
            target: address,
            role: LinkRole::Sender,
            max_message_size: None,
            rcv_settle_mode: None,
            attach_properties: attach_properties.clone(),
        })
    }

    /// Attach request for the incoming link: address source, symbolic
    /// target, bounded message size, settle-on-first-disposition.
    pub fn receiver_request(
        identity: &DeviceIdentity,
        attach_properties: &AttachProperties,
    ) -> MessengerResult<LinkRequest> {
        let devices_path = Self::devices_path(identity);
        let address = Self::checked_address(&devices_path, &identity.receive_suffix)?;
        let name = Self::link_name(RECEIVER_LINK_NAME_PREFIX, &identity.device_id);
        let target = Self::target_name(&name);

        Ok(LinkRequest {
            name,
            source: address,
            target,
            role: LinkRole::Receiver,
            max_message_size: Some(RECEIVER_MAX_MESSAGE_SIZE),
            rcv_settle_mode: Some(ReceiverSettleMode::First),
            attach_properties: attach_properties.clone(),
        })
    }

    fn checked_address(devices_path: &str, suffix: &str) -> MessengerResult<String> {
        let address = Self::link_address(devices_path, suffix);
        Url::parse(&address)
            .map_err(|_| MessengerError::InvalidConfig(format!("invalid link address '{address}'")))?;
        Ok(address)
    }
}
