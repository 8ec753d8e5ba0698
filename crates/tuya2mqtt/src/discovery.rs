//! Home Assistant MQTT discovery descriptors.
//!
//! Each entity is announced on `<discovery prefix>/<component>/<device id>/config`
//! with a retained JSON payload. Republishing the same descriptor is harmless,
//! so workers announce on every start.

use serde::Serialize;

use crate::device::Device;
use crate::entity::Climate;
use crate::entity::Entity;
use crate::entity::Fan;
use crate::entity::Light;
use crate::translate::TopicLayout;
use crate::translate::TopicUpdate;

/// Discovery payload. Keys that do not apply to a component are omitted.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DiscoveryMessage {
    pub name: String,

    pub unique_id: String,

    pub availability_topic: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_topic: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_topic: Option<String>,

    /// Fan speed, as a percentage
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percentage_state_topic: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub percentage_command_topic: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub brightness_scale: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub brightness_state_topic: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub brightness_command_topic: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub color_temp_state_topic: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub color_temp_command_topic: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode_state_topic: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode_command_topic: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_topic: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_temperature_topic: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature_state_topic: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature_command_topic: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp_step: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub modes: Option<Vec<String>>,

    pub device: DeviceInfo,
}

/// Device block shared by every entity of one device
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeviceInfo {
    /// Device id and MAC address
    pub identifiers: Vec<String>,

    pub name: String,

    pub manufacturer: String,

    pub model: String,

    pub sw_version: String,
}

impl DeviceInfo {
    fn for_device(device: &Device) -> Self {
        Self {
            identifiers: vec![device.id.clone(), device.mac.clone()],
            name: device.name.clone(),
            manufacturer: device.manufacturer.clone(),
            model: device.model.clone(),
            sw_version: format!("tuya2mqtt {}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// A discovery message and the topic it is announced on
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryDescriptor {
    pub topic: String,
    pub message: DiscoveryMessage,
}

impl DiscoveryDescriptor {
    /// Serialize into a retained update
    pub fn to_update(&self) -> Result<TopicUpdate, serde_json::Error> {
        Ok(TopicUpdate {
            topic: self.topic.clone(),
            payload: serde_json::to_string(&self.message)?,
            retain: true,
        })
    }
}

/// Home Assistant platform name for an entity
fn component(entity: &Entity) -> &'static str {
    match entity {
        Entity::Fan(_) => "fan",
        Entity::Light(_) => "light",
        Entity::Climate(_) => "climate",
    }
}

/// One descriptor per entity, in configured order
pub fn discovery_messages(layout: &TopicLayout, device: &Device) -> Vec<DiscoveryDescriptor> {
    device
        .entities
        .iter()
        .map(|entity| DiscoveryDescriptor {
            topic: format!(
                "{}/{}/{}/config",
                layout.discovery_prefix,
                component(entity),
                device.id
            ),
            message: message(layout, device, entity),
        })
        .collect()
}

fn message(layout: &TopicLayout, device: &Device, entity: &Entity) -> DiscoveryMessage {
    let topic = |suffix: &str| Some(layout.device_topic(&device.id, suffix));

    let base = DiscoveryMessage {
        name: device.name.clone(),
        unique_id: device.id.clone(),
        availability_topic: layout.availability_topic(&device.id),
        device: DeviceInfo::for_device(device),
        ..Default::default()
    };

    match entity {
        Entity::Fan(Fan { speed, .. }) => {
            let has_speed = speed.is_some();
            DiscoveryMessage {
                state_topic: topic("fan/state"),
                command_topic: topic("fan/command"),
                percentage_state_topic: topic("fan/speed/state").filter(|_| has_speed),
                percentage_command_topic: topic("fan/speed/command").filter(|_| has_speed),
                ..base
            }
        }
        Entity::Light(Light {
            brightness,
            temperature,
            ..
        }) => {
            let has_brightness = brightness.is_some();
            let has_temperature = temperature.is_some();
            DiscoveryMessage {
                name: format!("{} Light", device.name),
                state_topic: topic("light/state"),
                command_topic: topic("light/command"),
                brightness_scale: Some(100).filter(|_| has_brightness),
                brightness_state_topic: topic("light/brightness/state").filter(|_| has_brightness),
                brightness_command_topic: topic("light/brightness/command")
                    .filter(|_| has_brightness),
                color_temp_state_topic: topic("light/temperature/state")
                    .filter(|_| has_temperature),
                color_temp_command_topic: topic("light/temperature/command")
                    .filter(|_| has_temperature),
                ..base
            }
        }
        Entity::Climate(Climate {
            set_temperature,
            current_temperature,
            action,
            ..
        }) => DiscoveryMessage {
            mode_state_topic: topic("climate/mode/state"),
            mode_command_topic: topic("climate/mode/command"),
            action_topic: topic("climate/action").filter(|_| action.is_some()),
            current_temperature_topic: topic("climate/current_temperature")
                .filter(|_| current_temperature.is_some()),
            temperature_state_topic: topic("climate/temperature/state")
                .filter(|_| set_temperature.is_some()),
            temperature_command_topic: topic("climate/temperature/command")
                .filter(|_| set_temperature.is_some()),
            temp_step: Some(0.1),
            modes: Some(vec!["off".to_string(), "heat".to_string()]),
            ..base
        },
    }
}

/// Every topic the device worker subscribes to for commands
pub fn command_topics(layout: &TopicLayout, device: &Device) -> Vec<String> {
    device
        .entities
        .iter()
        .flat_map(|entity| entity.command_suffixes())
        .map(|suffix| layout.device_topic(&device.id, suffix))
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::entity::Ranged;
    use crate::entity::Steps;
    use crate::status::addr;
    use crate::translate::tests::device;
    use crate::translate::tests::fan;
    use crate::translate::tests::light;

    fn payload(descriptor: &DiscoveryDescriptor) -> serde_json::Value {
        let update = descriptor.to_update().unwrap();
        assert!(update.retain);
        serde_json::from_str(&update.payload).unwrap()
    }

    fn device_block() -> serde_json::Value {
        json!({
            "identifiers": ["bf01", "aa:bb:cc:dd:ee:01"],
            "name": "Bedroom Fan",
            "manufacturer": "Fanco",
            "model": "Infinity iD DC",
            "sw_version": format!("tuya2mqtt {}", env!("CARGO_PKG_VERSION")),
        })
    }

    #[test]
    fn test_fan_and_light_descriptors() {
        let device = device(vec![fan(), light()]);
        let descriptors = discovery_messages(&TopicLayout::default(), &device);

        assert_eq!(descriptors.len(), 2);
        assert_eq!(descriptors[0].topic, "homeassistant/fan/bf01/config");
        assert_eq!(descriptors[1].topic, "homeassistant/light/bf01/config");

        assert_eq!(
            payload(&descriptors[0]),
            json!({
                "name": "Bedroom Fan",
                "unique_id": "bf01",
                "availability_topic": "home/bf01/online",
                "state_topic": "home/bf01/fan/state",
                "command_topic": "home/bf01/fan/command",
                "percentage_state_topic": "home/bf01/fan/speed/state",
                "percentage_command_topic": "home/bf01/fan/speed/command",
                "device": device_block(),
            })
        );

        assert_eq!(
            payload(&descriptors[1]),
            json!({
                "name": "Bedroom Fan Light",
                "unique_id": "bf01",
                "availability_topic": "home/bf01/online",
                "state_topic": "home/bf01/light/state",
                "command_topic": "home/bf01/light/command",
                "brightness_scale": 100,
                "brightness_state_topic": "home/bf01/light/brightness/state",
                "brightness_command_topic": "home/bf01/light/brightness/command",
                "device": device_block(),
            })
        );
    }

    #[test]
    fn test_fan_without_speed() {
        let device = device(vec![Entity::Fan(Fan {
            state: addr(1),
            speed: None,
        })]);
        let value = payload(&discovery_messages(&TopicLayout::default(), &device)[0]);

        assert!(value.get("percentage_state_topic").is_none());
        assert!(value.get("percentage_command_topic").is_none());
        assert_eq!(value["command_topic"], "home/bf01/fan/command");
    }

    #[test]
    fn test_light_temperature_and_climate() {
        let device = device(vec![
            Entity::Light(Light {
                state: addr(20),
                brightness: Some(Ranged {
                    address: addr(22),
                    steps: Steps::new(vec![10, 1000]).unwrap(),
                }),
                temperature: Some(addr(23)),
            }),
            Entity::Climate(Climate {
                mode: addr(1),
                set_temperature: Some(addr(2)),
                current_temperature: Some(addr(3)),
                action: None,
            }),
        ]);
        let descriptors = discovery_messages(&TopicLayout::default(), &device);

        let light = payload(&descriptors[0]);
        assert_eq!(light["color_temp_state_topic"], "home/bf01/light/temperature/state");
        assert_eq!(light["color_temp_command_topic"], "home/bf01/light/temperature/command");

        assert_eq!(descriptors[1].topic, "homeassistant/climate/bf01/config");
        let climate = payload(&descriptors[1]);
        assert_eq!(climate["mode_command_topic"], "home/bf01/climate/mode/command");
        assert_eq!(climate["temperature_command_topic"], "home/bf01/climate/temperature/command");
        assert_eq!(climate["current_temperature_topic"], "home/bf01/climate/current_temperature");
        assert_eq!(climate["temp_step"], 0.1);
        assert_eq!(climate["modes"], json!(["off", "heat"]));
        assert!(climate.get("action_topic").is_none());
        assert!(climate.get("state_topic").is_none());
    }

    #[test]
    fn test_discovery_is_idempotent() {
        let device = device(vec![fan(), light()]);
        let layout = TopicLayout::default();
        assert_eq!(
            discovery_messages(&layout, &device),
            discovery_messages(&layout, &device)
        );
    }

    #[test]
    fn test_custom_discovery_prefix() {
        let layout = TopicLayout {
            discovery_prefix: "ha".to_string(),
            ..TopicLayout::default()
        };
        let device = device(vec![fan()]);

        assert_eq!(
            discovery_messages(&layout, &device)[0].topic,
            "ha/fan/bf01/config"
        );
    }

    #[test]
    fn test_command_topics() {
        let device = device(vec![fan(), light()]);

        assert_eq!(
            command_topics(&TopicLayout::default(), &device),
            vec![
                "home/bf01/fan/command",
                "home/bf01/fan/speed/command",
                "home/bf01/light/command",
                "home/bf01/light/brightness/command",
            ]
        );
    }

    #[test]
    fn test_zero_entities() {
        let device = device(vec![]);
        assert!(discovery_messages(&TopicLayout::default(), &device).is_empty());
        assert!(command_topics(&TopicLayout::default(), &device).is_empty());
    }
}
