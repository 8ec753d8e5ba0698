//! Entity model: the capabilities a device exposes and the data points
//! backing them.

use serde::Deserialize;
use serde::Serialize;

use crate::config::ValidationError;
use crate::convert;
use crate::convert::ConversionError;
use crate::status::Address;
use crate::status::Snapshot;

/// Capability kind. Declaration order is the order inbound command topics
/// are matched in.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    strum::Display,
    strum::AsRefStr,
)]
#[strum(serialize_all = "snake_case")]
pub enum EntityKind {
    Fan,
    Light,
    Climate,
}

/// Raw step table of a ranged data point (fan speed, light brightness).
///
/// Only the last (maximum) element takes part in conversions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Steps(Vec<u32>);

impl Steps {
    /// Validate a step table: non-empty, strictly increasing, positive maximum
    pub fn new(values: Vec<u32>) -> Result<Self, String> {
        if values.is_empty() {
            return Err("must not be empty".to_string());
        }
        if values.windows(2).any(|w| w[0] >= w[1]) {
            return Err("must be strictly increasing".to_string());
        }
        if values.last() == Some(&0) {
            return Err("maximum must be positive".to_string());
        }
        Ok(Self(values))
    }

    pub fn max(&self) -> u32 {
        self.0.last().copied().unwrap_or_default()
    }
}

/// A data point scaled to a percentage through its step table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ranged {
    pub address: Address,
    pub steps: Steps,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fan {
    pub state: Address,
    pub speed: Option<Ranged>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Light {
    pub state: Address,
    pub brightness: Option<Ranged>,
    /// Colour temperature, passed through unscaled
    pub temperature: Option<Address>,
}

/// Thermostat. Temperatures are reported and written in tenths of a degree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Climate {
    pub mode: Address,
    pub set_temperature: Option<Address>,
    pub current_temperature: Option<Address>,
    pub action: Option<Address>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entity {
    Fan(Fan),
    Light(Light),
    Climate(Climate),
}

/// Value written to a data point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum WriteValue {
    Bool(bool),
    Int(i64),
}

impl std::fmt::Display for WriteValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WriteValue::Bool(b) => write!(f, "{}", b),
            WriteValue::Int(i) => write!(f, "{}", i),
        }
    }
}

/// A resolved device write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    pub address: Address,
    pub value: WriteValue,
}

/// Why an inbound command was dropped
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeFailure {
    #[error("unrecognized topic {0}")]
    UnrecognizedTopic(String),

    #[error("payload '{payload}' on {topic} is not a number")]
    InvalidNumber { topic: String, payload: String },

    #[error(transparent)]
    Conversion(#[from] ConversionError),
}

fn on_off(value: bool) -> &'static str {
    if value {
        "ON"
    } else {
        "OFF"
    }
}

fn tenths(raw: i64) -> String {
    format!("{:.1}", raw as f64 / 10.0)
}

/// Parse a numeric command payload (integer or decimal, finite)
fn parse_number(suffix: &str, payload: &str) -> Result<f64, DecodeFailure> {
    payload
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| DecodeFailure::InvalidNumber {
            topic: suffix.to_string(),
            payload: payload.to_string(),
        })
}

impl Ranged {
    fn decode(&self, snapshot: &Snapshot, suffix: &str, out: &mut Vec<(String, String)>) {
        let Some(value) = snapshot.get(self.address) else {
            return;
        };
        let Some(raw) = value.as_i64() else {
            tracing::warn!("Non-numeric value {:?} at dps {}", value, self.address);
            return;
        };
        match convert::raw_to_percent(raw, self.steps.max()) {
            Ok(percent) => out.push((suffix.to_string(), percent.to_string())),
            Err(e) => tracing::warn!("Cannot convert dps {}: {}", self.address, e),
        }
    }

    fn encode(&self, suffix: &str, payload: &str) -> Result<Command, DecodeFailure> {
        let percent = parse_number(suffix, payload)?;
        let raw = convert::percent_to_raw(percent, self.steps.max())?;
        Ok(Command {
            address: self.address,
            value: WriteValue::Int(raw),
        })
    }
}

impl Entity {
    pub fn kind(&self) -> EntityKind {
        match self {
            Entity::Fan(_) => EntityKind::Fan,
            Entity::Light(_) => EntityKind::Light,
            Entity::Climate(_) => EntityKind::Climate,
        }
    }

    /// The data point whose absence means the entity has nothing to report
    pub fn primary_address(&self) -> Address {
        match self {
            Entity::Fan(fan) => fan.state,
            Entity::Light(light) => light.state,
            Entity::Climate(climate) => climate.mode,
        }
    }

    /// Every data point this entity maps
    pub fn addresses(&self) -> Vec<Address> {
        match self {
            Entity::Fan(fan) => std::iter::once(fan.state)
                .chain(fan.speed.as_ref().map(|s| s.address))
                .collect(),
            Entity::Light(light) => std::iter::once(light.state)
                .chain(light.brightness.as_ref().map(|b| b.address))
                .chain(light.temperature)
                .collect(),
            Entity::Climate(climate) => std::iter::once(climate.mode)
                .chain(climate.action)
                .chain(climate.current_temperature)
                .chain(climate.set_temperature)
                .collect(),
        }
    }

    /// Topic suffixes (relative to the device root) this entity accepts
    /// commands on
    pub fn command_suffixes(&self) -> Vec<&'static str> {
        match self {
            Entity::Fan(fan) => {
                let mut suffixes = vec!["fan/command"];
                if fan.speed.is_some() {
                    suffixes.push("fan/speed/command");
                }
                suffixes
            }
            Entity::Light(light) => {
                let mut suffixes = vec!["light/command"];
                if light.brightness.is_some() {
                    suffixes.push("light/brightness/command");
                }
                if light.temperature.is_some() {
                    suffixes.push("light/temperature/command");
                }
                suffixes
            }
            Entity::Climate(climate) => {
                let mut suffixes = vec!["climate/mode/command"];
                if climate.set_temperature.is_some() {
                    suffixes.push("climate/temperature/command");
                }
                suffixes
            }
        }
    }

    /// Translate the fields of this entity present in `snapshot` into
    /// `(topic suffix, payload)` pairs: state first, then secondary fields.
    ///
    /// Returns nothing when the primary state address is absent.
    pub fn decode_status(&self, snapshot: &Snapshot) -> Vec<(String, String)> {
        let mut out = Vec::new();

        let Some(primary) = snapshot.get(self.primary_address()) else {
            return out;
        };

        match self {
            Entity::Fan(fan) => {
                out.push(("fan/state".to_string(), on_off(primary.is_truthy()).to_string()));
                if let Some(speed) = &fan.speed {
                    speed.decode(snapshot, "fan/speed/state", &mut out);
                }
            }
            Entity::Light(light) => {
                out.push(("light/state".to_string(), on_off(primary.is_truthy()).to_string()));
                if let Some(brightness) = &light.brightness {
                    brightness.decode(snapshot, "light/brightness/state", &mut out);
                }
                if let Some(raw) = light
                    .temperature
                    .and_then(|a| snapshot.get(a))
                    .and_then(|v| v.as_i64())
                {
                    out.push(("light/temperature/state".to_string(), raw.to_string()));
                }
            }
            Entity::Climate(climate) => {
                let mode = if primary.is_truthy() { "heat" } else { "off" };
                out.push(("climate/mode/state".to_string(), mode.to_string()));

                if let Some(action) = climate.action.and_then(|a| snapshot.get(a)) {
                    let heating = action.as_i64().map(|v| v != 0).unwrap_or(false);
                    let action = if heating { "heating" } else { "off" };
                    out.push(("climate/action".to_string(), action.to_string()));
                }
                if let Some(raw) = climate
                    .current_temperature
                    .and_then(|a| snapshot.get(a))
                    .and_then(|v| v.as_i64())
                {
                    out.push(("climate/current_temperature".to_string(), tenths(raw)));
                }
                if let Some(raw) = climate
                    .set_temperature
                    .and_then(|a| snapshot.get(a))
                    .and_then(|v| v.as_i64())
                {
                    out.push(("climate/temperature/state".to_string(), tenths(raw)));
                }
            }
        }

        out
    }

    /// Resolve a command addressed to `suffix`.
    ///
    /// Returns `None` when the suffix does not belong to this entity. On/off
    /// style commands never fail: anything but the exact "on" payload means
    /// off.
    pub fn encode_command(
        &self,
        suffix: &str,
        payload: &str,
    ) -> Option<Result<Command, DecodeFailure>> {
        let command = match (self, suffix) {
            (Entity::Fan(fan), "fan/command") => Ok(Command {
                address: fan.state,
                value: WriteValue::Bool(payload == "ON"),
            }),
            (Entity::Fan(Fan { speed: Some(speed), .. }), "fan/speed/command") => {
                speed.encode(suffix, payload)
            }
            (Entity::Light(light), "light/command") => Ok(Command {
                address: light.state,
                value: WriteValue::Bool(payload == "ON"),
            }),
            (
                Entity::Light(Light {
                    brightness: Some(brightness),
                    ..
                }),
                "light/brightness/command",
            ) => brightness.encode(suffix, payload),
            (
                Entity::Light(Light {
                    temperature: Some(address),
                    ..
                }),
                "light/temperature/command",
            ) => parse_number(suffix, payload).map(|v| Command {
                address: *address,
                value: WriteValue::Int(v.round() as i64),
            }),
            (Entity::Climate(climate), "climate/mode/command") => Ok(Command {
                address: climate.mode,
                value: WriteValue::Bool(payload == "heat"),
            }),
            (
                Entity::Climate(Climate {
                    set_temperature: Some(address),
                    ..
                }),
                "climate/temperature/command",
            ) => parse_number(suffix, payload).map(|v| Command {
                address: *address,
                value: WriteValue::Int((v * 10.0).round() as i64),
            }),
            _ => return None,
        };

        Some(command)
    }
}

/// Entity mapping as written in the bridge configuration.
///
/// Addresses are optional here so that validation can report every missing
/// field by name instead of failing on the first one.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntityConfig {
    Fan {
        state: Option<u32>,
        speed: Option<u32>,
        speed_steps: Option<Vec<u32>>,
    },
    Light {
        state: Option<u32>,
        brightness: Option<u32>,
        brightness_steps: Option<Vec<u32>>,
        temperature: Option<u32>,
    },
    Climate {
        mode: Option<u32>,
        set_temperature: Option<u32>,
        current_temperature: Option<u32>,
        action: Option<u32>,
    },
}

struct FieldCheck<'a> {
    path: &'a str,
    errors: Vec<ValidationError>,
}

impl FieldCheck<'_> {
    fn error(&mut self, field: &str, message: impl Into<String>) {
        self.errors.push(ValidationError {
            field_path: format!("{}.{}", self.path, field),
            message: message.into(),
        });
    }

    fn required(&mut self, field: &str, value: Option<u32>) -> Option<Address> {
        match value {
            None => {
                self.error(field, "is required");
                None
            }
            Some(v) => self.optional(field, Some(v)),
        }
    }

    fn optional(&mut self, field: &str, value: Option<u32>) -> Option<Address> {
        let value = value?;
        let address = Address::new(value);
        if address.is_none() {
            self.error(field, "address 0 is not a valid data point");
        }
        address
    }

    fn ranged(
        &mut self,
        field: &str,
        value: Option<u32>,
        steps_field: &str,
        steps: &Option<Vec<u32>>,
    ) -> Option<Ranged> {
        let address = self.optional(field, value);
        match (value, steps) {
            (None, None) => None,
            (None, Some(_)) => {
                self.error(steps_field, format!("is set but {} is not", field));
                None
            }
            (Some(_), None) => {
                self.error(steps_field, format!("is required when {} is set", field));
                None
            }
            (Some(_), Some(steps)) => match Steps::new(steps.clone()) {
                Ok(steps) => address.map(|address| Ranged { address, steps }),
                Err(message) => {
                    self.error(steps_field, message);
                    None
                }
            },
        }
    }
}

impl EntityConfig {
    pub fn kind(&self) -> EntityKind {
        match self {
            EntityConfig::Fan { .. } => EntityKind::Fan,
            EntityConfig::Light { .. } => EntityKind::Light,
            EntityConfig::Climate { .. } => EntityKind::Climate,
        }
    }

    /// Validate into an [`Entity`]. `path` prefixes reported field names,
    /// e.g. `device.bf1234.entity[0]`.
    pub fn validate(&self, path: &str) -> Result<Entity, Vec<ValidationError>> {
        let mut check = FieldCheck {
            path,
            errors: Vec::new(),
        };

        let entity = match self {
            EntityConfig::Fan {
                state,
                speed,
                speed_steps,
            } => {
                let state = check.required("state", *state);
                let speed = check.ranged("speed", *speed, "speed_steps", speed_steps);
                state.map(|state| Entity::Fan(Fan { state, speed }))
            }
            EntityConfig::Light {
                state,
                brightness,
                brightness_steps,
                temperature,
            } => {
                let state = check.required("state", *state);
                let brightness =
                    check.ranged("brightness", *brightness, "brightness_steps", brightness_steps);
                let temperature = check.optional("temperature", *temperature);
                state.map(|state| {
                    Entity::Light(Light {
                        state,
                        brightness,
                        temperature,
                    })
                })
            }
            EntityConfig::Climate {
                mode,
                set_temperature,
                current_temperature,
                action,
            } => {
                let mode = check.required("mode", *mode);
                let set_temperature = check.optional("set_temperature", *set_temperature);
                let current_temperature =
                    check.optional("current_temperature", *current_temperature);
                let action = check.optional("action", *action);
                mode.map(|mode| {
                    Entity::Climate(Climate {
                        mode,
                        set_temperature,
                        current_temperature,
                        action,
                    })
                })
            }
        };

        match entity {
            Some(entity) if check.errors.is_empty() => Ok(entity),
            _ => Err(check.errors),
        }
    }
}

/// Address layouts of the device models the bridge was first written for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Preset {
    Fan,
    FanWithLight,
    Climate,
}

impl Preset {
    pub fn entities(self) -> Vec<EntityConfig> {
        let fan = EntityConfig::Fan {
            state: Some(1),
            speed: Some(3),
            speed_steps: Some(vec![1, 2, 3, 4, 5, 6]),
        };

        match self {
            Preset::Fan => vec![fan],
            Preset::FanWithLight => vec![
                fan,
                EntityConfig::Light {
                    state: Some(15),
                    brightness: Some(16),
                    brightness_steps: Some(vec![25, 125, 275, 425, 575, 725, 900, 1000]),
                    temperature: None,
                },
            ],
            Preset::Climate => vec![EntityConfig::Climate {
                mode: Some(1),
                set_temperature: Some(2),
                current_temperature: Some(3),
                action: Some(5),
            }],
        }
    }

    pub fn manufacturer(self) -> &'static str {
        match self {
            Preset::Fan | Preset::FanWithLight => "Fanco",
            Preset::Climate => "Beok",
        }
    }

    pub fn model(self) -> &'static str {
        match self {
            Preset::Fan | Preset::FanWithLight => "Infinity iD DC",
            Preset::Climate => "Thermostat",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::addr;

    fn fan() -> Entity {
        Entity::Fan(Fan {
            state: addr(1),
            speed: Some(Ranged {
                address: addr(3),
                steps: Steps::new((1..=10).map(|i| i * 100).collect()).unwrap(),
            }),
        })
    }

    fn climate() -> Entity {
        Entity::Climate(Climate {
            mode: addr(1),
            set_temperature: Some(addr(2)),
            current_temperature: Some(addr(3)),
            action: Some(addr(5)),
        })
    }

    #[test]
    fn test_steps_validation() {
        assert!(Steps::new(vec![]).is_err());
        assert!(Steps::new(vec![1, 1]).is_err());
        assert!(Steps::new(vec![3, 2]).is_err());
        assert!(Steps::new(vec![0]).is_err());
        assert_eq!(Steps::new(vec![0, 10]).unwrap().max(), 10);
    }

    #[test]
    fn test_fan_decode() {
        let mut snapshot = Snapshot::new();
        snapshot.insert(addr(1), true);
        snapshot.insert(addr(3), 600);

        assert_eq!(
            fan().decode_status(&snapshot),
            vec![
                ("fan/state".to_string(), "ON".to_string()),
                ("fan/speed/state".to_string(), "60".to_string()),
            ]
        );
    }

    #[test]
    fn test_secondary_field_is_optional() {
        let mut snapshot = Snapshot::new();
        snapshot.insert(addr(1), false);

        assert_eq!(
            fan().decode_status(&snapshot),
            vec![("fan/state".to_string(), "OFF".to_string())]
        );
    }

    #[test]
    fn test_missing_primary_yields_nothing() {
        let mut snapshot = Snapshot::new();
        snapshot.insert(addr(3), 600);

        assert!(fan().decode_status(&snapshot).is_empty());
    }

    #[test]
    fn test_climate_decode() {
        let mut snapshot = Snapshot::new();
        snapshot.insert(addr(1), true);
        snapshot.insert(addr(2), 215);
        snapshot.insert(addr(3), 198);
        snapshot.insert(addr(5), "1");

        assert_eq!(
            climate().decode_status(&snapshot),
            vec![
                ("climate/mode/state".to_string(), "heat".to_string()),
                ("climate/action".to_string(), "heating".to_string()),
                ("climate/current_temperature".to_string(), "19.8".to_string()),
                ("climate/temperature/state".to_string(), "21.5".to_string()),
            ]
        );
    }

    #[test]
    fn test_fan_commands() {
        let fan = fan();

        assert_eq!(
            fan.encode_command("fan/speed/command", "75"),
            Some(Ok(Command {
                address: addr(3),
                value: WriteValue::Int(750)
            }))
        );
        assert_eq!(
            fan.encode_command("fan/command", "ON"),
            Some(Ok(Command {
                address: addr(1),
                value: WriteValue::Bool(true)
            }))
        );
        for payload in ["OFF", "on", "garbage", ""] {
            assert_eq!(
                fan.encode_command("fan/command", payload),
                Some(Ok(Command {
                    address: addr(1),
                    value: WriteValue::Bool(false)
                })),
                "payload {payload:?}"
            );
        }
        assert_eq!(fan.encode_command("light/command", "ON"), None);
    }

    #[test]
    fn test_numeric_command_failures() {
        let fan = fan();

        for payload in ["fast", "NaN", "inf", ""] {
            assert!(
                matches!(
                    fan.encode_command("fan/speed/command", payload),
                    Some(Err(DecodeFailure::InvalidNumber { .. }))
                ),
                "payload {payload:?}"
            );
        }
        assert_eq!(
            fan.encode_command("fan/speed/command", "12.5"),
            Some(Ok(Command {
                address: addr(3),
                value: WriteValue::Int(125)
            }))
        );
    }

    #[test]
    fn test_climate_commands() {
        let climate = climate();

        assert_eq!(
            climate.encode_command("climate/temperature/command", "22.5"),
            Some(Ok(Command {
                address: addr(2),
                value: WriteValue::Int(225)
            }))
        );
        assert_eq!(
            climate.encode_command("climate/mode/command", "heat"),
            Some(Ok(Command {
                address: addr(1),
                value: WriteValue::Bool(true)
            }))
        );
        assert_eq!(
            climate.encode_command("climate/mode/command", "off"),
            Some(Ok(Command {
                address: addr(1),
                value: WriteValue::Bool(false)
            }))
        );
    }

    #[test]
    fn test_validate_reports_every_field() {
        let config = EntityConfig::Fan {
            state: None,
            speed: Some(0),
            speed_steps: Some(vec![5, 3]),
        };

        let errors = config.validate("device.abc.entity[0]").unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field_path.as_str()).collect();
        assert_eq!(
            fields,
            vec![
                "device.abc.entity[0].state",
                "device.abc.entity[0].speed",
                "device.abc.entity[0].speed_steps",
            ]
        );
    }

    #[test]
    fn test_validate_requires_steps_with_speed() {
        let config = EntityConfig::Light {
            state: Some(15),
            brightness: Some(16),
            brightness_steps: None,
            temperature: None,
        };

        let errors = config.validate("device.abc.entity[1]").unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field_path, "device.abc.entity[1].brightness_steps");
    }

    #[test]
    fn test_presets_are_valid() {
        for preset in [Preset::Fan, Preset::FanWithLight, Preset::Climate] {
            for (i, config) in preset.entities().iter().enumerate() {
                assert!(config.validate(&format!("preset[{i}]")).is_ok(), "{preset:?}");
            }
        }
    }

    #[test]
    fn test_kind_order_and_names() {
        assert!(EntityKind::Fan < EntityKind::Light);
        assert!(EntityKind::Light < EntityKind::Climate);
        assert_eq!(EntityKind::Climate.to_string(), "climate");
        assert_eq!(EntityKind::Light.as_ref(), "light");
    }
}
