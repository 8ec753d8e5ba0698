//! In-process transport speaking the Tuya local protocol through `rustuya`.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::DeviceTransport;
use super::TransportConnector;
use super::TransportError;
use crate::config::TransportConfig;
use crate::device::DeviceIdentity;
use crate::entity::WriteValue;
use crate::status::Address;
use crate::status::Snapshot;
use crate::status::StatusValue;

/// Opens a persistent local session per device
#[derive(Debug, Clone)]
pub struct NativeConnector {
    timeout: Duration,
    debug: bool,
}

impl NativeConnector {
    /// `debug` logs every raw device reply
    pub fn new(config: &TransportConfig, debug: bool) -> Self {
        Self {
            timeout: Duration::from_secs(config.timeout_secs.max(1)),
            debug,
        }
    }
}

#[async_trait]
impl TransportConnector for NativeConnector {
    type Transport = NativeTransport;

    async fn connect(&self, identity: &DeviceIdentity) -> Result<NativeTransport, TransportError> {
        tracing::debug!(
            "[{}] Opening Tuya {} session with {}",
            identity.id,
            identity.version,
            identity.address
        );

        let device = rustuya::Device::new(
            identity.id.as_str(),
            identity.address.as_str(),
            identity.key.expose(),
            identity.version.as_str(),
        );

        Ok(NativeTransport {
            device_id: identity.id.clone(),
            device: Some(device),
            timeout: self.timeout,
            debug: self.debug,
        })
    }
}

pub struct NativeTransport {
    device_id: String,
    /// Taken on close; the session ends when the device is dropped
    device: Option<rustuya::Device>,
    timeout: Duration,
    debug: bool,
}

impl NativeTransport {
    fn device(&self) -> Result<&rustuya::Device, TransportError> {
        self.device.as_ref().ok_or(TransportError::Closed)
    }

    async fn bounded<T, E: std::fmt::Display>(
        &self,
        exchange: impl Future<Output = Result<T, E>>,
    ) -> Result<T, TransportError> {
        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(e)) => Err(TransportError::Device(e.to_string())),
            Err(_) => Err(TransportError::Timeout(self.timeout)),
        }
    }

    async fn set(&mut self, address: Address, value: WriteValue) -> Result<(), TransportError> {
        if self.debug {
            tracing::info!("[{}] set {} -> {}", self.device_id, address, value);
        }
        let value = serde_json::to_value(value)?;
        self.bounded(self.device()?.set_value(address.get(), value)).await?;
        Ok(())
    }
}

#[async_trait]
impl DeviceTransport for NativeTransport {
    async fn request_status(&mut self) -> Result<Snapshot, TransportError> {
        let Some(reply) = self.bounded(self.device()?.status()).await? else {
            return Err(TransportError::UnexpectedResponse("empty status reply".to_string()));
        };

        if self.debug {
            tracing::info!("[{}] status <- {}", self.device_id, reply);
        }

        let (snapshot, rejected) = Snapshot::from_dps(parse_dps(&reply)?);
        if !rejected.is_empty() {
            tracing::debug!(
                "[{}] Ignoring non-numeric dps keys {:?}",
                self.device_id,
                rejected
            );
        }
        Ok(snapshot)
    }

    async fn write_boolean(&mut self, address: Address, value: bool) -> Result<(), TransportError> {
        self.set(address, WriteValue::Bool(value)).await
    }

    async fn write_value(&mut self, address: Address, value: i64) -> Result<(), TransportError> {
        self.set(address, WriteValue::Int(value)).await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.device.take().is_some() {
            tracing::debug!("[{}] Closed Tuya session", self.device_id);
        }
        Ok(())
    }
}

/// Extract the data point map from a status reply.
///
/// Devices answer either `{"dps": {...}, ...}` or the bare map. Values that
/// are neither boolean, number nor string are dropped.
fn parse_dps(reply: &str) -> Result<BTreeMap<String, StatusValue>, TransportError> {
    let mut root: Value = serde_json::from_str(reply)?;

    let dps = match root.get_mut("dps") {
        Some(dps) => dps.take(),
        None => root,
    };
    let Value::Object(map) = dps else {
        return Err(TransportError::UnexpectedResponse(format!(
            "status without a dps map: {}",
            reply
        )));
    };

    Ok(map
        .into_iter()
        .filter_map(|(key, value)| {
            serde_json::from_value::<StatusValue>(value)
                .ok()
                .map(|value| (key, value))
        })
        .collect())
}
