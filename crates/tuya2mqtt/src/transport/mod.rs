//! Device transport: how the bridge reaches a device.
//!
//! Sessions are either spoken in-process ([`NativeConnector`]) or owned by an
//! external helper process ([`HelperConnector`]).

mod helper;
mod native;
mod protocol;

use std::time::Duration;

use async_trait::async_trait;

pub use helper::HelperConnector;
pub use native::NativeConnector;

use crate::device::DeviceIdentity;
use crate::status::Address;
use crate::status::Snapshot;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Failed to start transport helper {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Device session closed")]
    Closed,

    #[error("Device error: {0}")]
    Device(String),

    #[error("Device did not answer within {0:?}")]
    Timeout(Duration),

    #[error("Unexpected response from device: {0}")]
    UnexpectedResponse(String),
}

/// An open session with one device
#[async_trait]
pub trait DeviceTransport: Send {
    /// Read the current value of every data point
    async fn request_status(&mut self) -> Result<Snapshot, TransportError>;

    async fn write_boolean(&mut self, address: Address, value: bool) -> Result<(), TransportError>;

    async fn write_value(&mut self, address: Address, value: i64) -> Result<(), TransportError>;

    /// Release the session. The transport must not be used afterwards.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Opens device sessions
#[async_trait]
pub trait TransportConnector: Send + Sync {
    type Transport: DeviceTransport + 'static;

    async fn connect(&self, identity: &DeviceIdentity) -> Result<Self::Transport, TransportError>;
}
