pub mod bridge;
pub mod config;
pub mod convert;
pub mod device;
pub mod discovery;
pub mod entity;
pub mod mqtt;
pub mod poll;
pub mod registry;
pub mod status;
pub mod translate;
pub mod transport;

pub use config::Config;
pub use config::ConfigError;
pub use device::Device;
