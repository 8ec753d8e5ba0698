//! Configuration file parsing and structures.
//!
//! The bridge reads two sources at startup:
//! - the bridge configuration (TOML): broker, polling, transport, logging and
//!   one `[device.<id>]` section per bridged device describing its entities
//! - the device inventory (JSON): identities and credentials as exported by
//!   the Tuya wizard tooling
//!
//! Both are joined by device id in [`crate::registry`].

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;
use tracing_subscriber::filter::LevelFilter;

use crate::entity::EntityConfig;
use crate::entity::Preset;

/// Default search locations for the bridge configuration
pub const CONFIG_CANDIDATES: &[&str] = &["tuya2mqtt.toml", "/tuya2mqtt.toml"];

/// Default search locations for the device inventory
pub const INVENTORY_CANDIDATES: &[&str] = &["devices.json", "/devices.json"];

/// Top-level bridge configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub broker: BrokerConfig,

    #[serde(default)]
    pub bridge: BridgeConfig,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Per-device entity mappings, keyed by device id
    #[serde(default, rename = "device")]
    pub devices: BTreeMap<String, DeviceSection>,
}

#[derive(Debug, Default, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("invalid log level '{}'", other)),
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default)]
    pub level: LogLevel,
}

fn default_port() -> u16 {
    1883
}

fn default_client_id_prefix() -> String {
    "tuya2mqtt".to_string()
}

fn default_keep_alive_secs() -> u64 {
    30
}

/// MQTT broker connection settings
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// MQTT broker hostname or IP address
    pub hostname: String,

    /// MQTT broker port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Optional username for authentication
    #[serde(default)]
    pub username: Option<String>,

    /// Optional password for authentication
    #[serde(default)]
    pub password: Option<String>,

    /// Each device worker connects as `<prefix>-<device id>`
    #[serde(default = "default_client_id_prefix")]
    pub client_id_prefix: String,

    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_topic_prefix() -> String {
    "home".to_string()
}

fn default_discovery_prefix() -> String {
    "homeassistant".to_string()
}

/// Topic layout and polling cadence
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Root of the state and command topics (default: "home")
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,

    /// Home Assistant discovery prefix (default: "homeassistant")
    #[serde(default = "default_discovery_prefix")]
    pub discovery_prefix: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            topic_prefix: default_topic_prefix(),
            discovery_prefix: default_discovery_prefix(),
        }
    }
}

fn default_transport_command() -> PathBuf {
    PathBuf::from("tuya-helper")
}

fn default_protocol_version() -> String {
    "3.3".to_string()
}

fn default_timeout_secs() -> u64 {
    5
}

/// Which implementation opens device sessions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TransportBackend {
    /// Tuya local protocol spoken in-process
    #[default]
    Native,
    /// An external helper process owning the session
    Helper,
}

/// How the bridge reaches devices
#[derive(Debug, Clone, Deserialize)]
pub struct TransportConfig {
    #[serde(default)]
    pub backend: TransportBackend,

    /// Helper program, for the helper backend
    #[serde(default = "default_transport_command")]
    pub command: PathBuf,

    #[serde(default)]
    pub args: Vec<String>,

    /// Tuya local protocol version for devices whose inventory entry has none
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,

    /// Timeout applied to each device exchange
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            backend: TransportBackend::default(),
            command: default_transport_command(),
            args: Vec::new(),
            protocol_version: default_protocol_version(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Entity mapping for one device
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeviceSection {
    /// Built-in address layout for a known device model
    #[serde(default)]
    pub preset: Option<Preset>,

    #[serde(default)]
    pub manufacturer: Option<String>,

    #[serde(default)]
    pub model: Option<String>,

    /// Explicit entity list, in publishing order
    #[serde(default, rename = "entity")]
    pub entities: Vec<EntityConfig>,
}

/// One device identity from the inventory
#[derive(Debug, Clone, Deserialize)]
pub struct InventoryEntry {
    pub id: String,

    pub name: String,

    #[serde(default)]
    pub mac: String,

    #[serde(alias = "address")]
    pub ip: String,

    pub key: String,

    /// Protocol version override for this device
    #[serde(default, alias = "ver")]
    pub version: Option<String>,
}

/// Which of the two configuration sources an error refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Mapping,
    Inventory,
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Mapping => f.write_str("bridge configuration"),
            Source::Inventory => f.write_str("device inventory"),
        }
    }
}

/// A single invalid or missing field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field_path: String,
    pub message: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field_path, self.message)
    }
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing {origin}: none of {candidates} found")]
    Missing { origin: Source, candidates: String },

    #[error("Failed to read {origin} {}: {error}", .path.display())]
    Io {
        origin: Source,
        path: PathBuf,
        #[source]
        error: std::io::Error,
    },

    #[error("Malformed {origin} {}: {message}", .path.display())]
    Malformed {
        origin: Source,
        path: PathBuf,
        message: String,
    },

    #[error("Malformed section [{section}] in {}: {}", .path.display(), join_errors(.errors))]
    InvalidSection {
        path: PathBuf,
        section: String,
        errors: Vec<ValidationError>,
    },

    #[error(
        "Section [device.{id}] in {} references a device missing from {}",
        .path.display(),
        .inventory.display()
    )]
    UnknownDevice {
        id: String,
        path: PathBuf,
        inventory: PathBuf,
    },
}

impl ConfigError {
    /// Process exit status for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            ConfigError::Missing { origin: Source::Mapping, .. }
            | ConfigError::Io { origin: Source::Mapping, .. } => 2,
            ConfigError::Malformed { .. } | ConfigError::InvalidSection { .. } => 3,
            ConfigError::Missing { origin: Source::Inventory, .. }
            | ConfigError::Io { origin: Source::Inventory, .. } => 4,
            ConfigError::UnknownDevice { .. } => 5,
        }
    }
}

/// Pick the explicit path if given, otherwise the first candidate that exists
pub fn locate(
    explicit: Option<&Path>,
    candidates: &[&str],
    origin: Source,
) -> Result<PathBuf, ConfigError> {
    if let Some(path) = explicit {
        return if path.exists() {
            Ok(path.to_path_buf())
        } else {
            Err(ConfigError::Missing {
                origin,
                candidates: path.display().to_string(),
            })
        };
    }

    candidates
        .iter()
        .map(PathBuf::from)
        .find(|p| p.exists())
        .ok_or_else(|| ConfigError::Missing {
            origin,
            candidates: candidates.join(", "),
        })
}

fn read(path: &Path, origin: Source) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|error| {
        if error.kind() == std::io::ErrorKind::NotFound {
            ConfigError::Missing {
                origin,
                candidates: path.display().to_string(),
            }
        } else {
            ConfigError::Io {
                origin,
                path: path.to_path_buf(),
                error,
            }
        }
    })
}

impl Config {
    /// Load the bridge configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = read(path, Source::Mapping)?;

        toml::from_str(&contents).map_err(|e| {
            // Keep the diagnostic on one line: position plus message, no snippet
            let message = match e.span() {
                Some(span) => {
                    let line = contents[..span.start].matches('\n').count() + 1;
                    format!("line {}: {}", line, e.message())
                }
                None => e.message().to_string(),
            };
            ConfigError::Malformed {
                origin: Source::Mapping,
                path: path.to_path_buf(),
                message,
            }
        })
    }
}

/// Load the device inventory from a JSON file
pub fn load_inventory(path: impl AsRef<Path>) -> Result<Vec<InventoryEntry>, ConfigError> {
    let path = path.as_ref();
    let contents = read(path, Source::Inventory)?;

    serde_json::from_str(&contents).map_err(|e| ConfigError::Malformed {
        origin: Source::Inventory,
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}
