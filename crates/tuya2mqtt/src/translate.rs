//! Status translation between device snapshots and MQTT topics.
//!
//! Outbound, a snapshot becomes an ordered list of topic updates: the
//! availability topic first, then each entity in configured order with its
//! state field before its secondary fields. Inbound, a command topic and
//! payload resolve to a single device write.

use crate::config::BridgeConfig;
use crate::device::Device;
use crate::entity::Command;
use crate::entity::DecodeFailure;
use crate::status::Snapshot;

pub const ONLINE: &str = "online";
pub const OFFLINE: &str = "offline";

/// A message to publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicUpdate {
    pub topic: String,
    pub payload: String,
    pub retain: bool,
}

impl TopicUpdate {
    pub fn state(topic: String, payload: impl Into<String>) -> Self {
        Self {
            topic,
            payload: payload.into(),
            retain: false,
        }
    }
}

/// Topic namespace roots
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicLayout {
    pub topic_prefix: String,
    pub discovery_prefix: String,
}

impl Default for TopicLayout {
    fn default() -> Self {
        Self {
            topic_prefix: "home".to_string(),
            discovery_prefix: "homeassistant".to_string(),
        }
    }
}

impl From<&BridgeConfig> for TopicLayout {
    fn from(config: &BridgeConfig) -> Self {
        Self {
            topic_prefix: config.topic_prefix.clone(),
            discovery_prefix: config.discovery_prefix.clone(),
        }
    }
}

impl TopicLayout {
    /// `<prefix>/<id>/<suffix>`
    pub fn device_topic(&self, device_id: &str, suffix: &str) -> String {
        format!("{}/{}/{}", self.topic_prefix, device_id, suffix)
    }

    pub fn availability_topic(&self, device_id: &str) -> String {
        self.device_topic(device_id, "online")
    }

    pub fn availability(&self, device_id: &str, online: bool) -> TopicUpdate {
        let payload = if online { ONLINE } else { OFFLINE };
        TopicUpdate::state(self.availability_topic(device_id), payload)
    }

    /// Strip `<prefix>/<id>/` from an inbound topic
    fn command_suffix<'a>(&self, device_id: &str, topic: &'a str) -> Option<&'a str> {
        topic
            .strip_prefix(self.topic_prefix.as_str())?
            .strip_prefix('/')?
            .strip_prefix(device_id)?
            .strip_prefix('/')
    }
}

/// Translate a status snapshot into the updates to publish.
///
/// An empty snapshot yields nothing. Entities whose primary state address is
/// missing from the snapshot are skipped; the rest are still reported.
pub fn build_outbound_updates(
    layout: &TopicLayout,
    device: &Device,
    snapshot: &Snapshot,
) -> Vec<TopicUpdate> {
    if snapshot.is_empty() {
        return Vec::new();
    }

    let mut updates = vec![layout.availability(&device.id, true)];

    for entity in &device.entities {
        if !snapshot.contains(entity.primary_address()) {
            tracing::warn!(
                "[{}] Status is missing dps {} for {} entity, skipping it",
                device.id,
                entity.primary_address(),
                entity.kind()
            );
            continue;
        }

        updates.extend(
            entity
                .decode_status(snapshot)
                .into_iter()
                .map(|(suffix, payload)| {
                    TopicUpdate::state(layout.device_topic(&device.id, &suffix), payload)
                }),
        );
    }

    updates
}

/// Resolve an inbound command to a device write.
///
/// Entities are tried fan, light, then climate; the first entity that owns
/// the topic decides the result.
pub fn resolve_inbound_command(
    layout: &TopicLayout,
    device: &Device,
    topic: &str,
    payload: &str,
) -> Result<Command, DecodeFailure> {
    let suffix = layout
        .command_suffix(&device.id, topic)
        .ok_or_else(|| DecodeFailure::UnrecognizedTopic(topic.to_string()))?;

    device
        .entities_by_kind()
        .into_iter()
        .find_map(|entity| entity.encode_command(suffix, payload))
        .unwrap_or_else(|| Err(DecodeFailure::UnrecognizedTopic(topic.to_string())))
}
