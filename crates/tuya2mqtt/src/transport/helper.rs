//! Transport backed by a helper process, one per device session.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::io::Lines;
use tokio::process::Child;
use tokio::process::ChildStdin;
use tokio::process::ChildStdout;
use tokio::process::Command;

use super::protocol::Request;
use super::protocol::Response;
use super::DeviceTransport;
use super::TransportConnector;
use super::TransportError;
use crate::config::TransportConfig;
use crate::device::DeviceIdentity;
use crate::entity::WriteValue;
use crate::status::Address;
use crate::status::Snapshot;

/// Spawns the configured helper for each device session
#[derive(Debug, Clone)]
pub struct HelperConnector {
    config: TransportConfig,
    debug: bool,
}

impl HelperConnector {
    /// `debug` asks the helper to log protocol traffic on its stderr
    pub fn new(config: TransportConfig, debug: bool) -> Self {
        Self { config, debug }
    }
}

#[async_trait]
impl TransportConnector for HelperConnector {
    type Transport = HelperTransport;

    async fn connect(&self, identity: &DeviceIdentity) -> Result<HelperTransport, TransportError> {
        let command = self.config.command.display().to_string();

        let mut child = Command::new(&self.config.command)
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| TransportError::Spawn {
                command: command.clone(),
                source,
            })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(TransportError::Closed);
        };

        let mut transport = HelperTransport {
            device_id: identity.id.clone(),
            child,
            stdin: Some(stdin),
            stdout: BufReader::new(stdout).lines(),
            grace: Duration::from_secs(self.config.timeout_secs),
        };

        let response = transport
            .exchange(&Request::Connect {
                id: &identity.id,
                address: &identity.address,
                key: identity.key.expose(),
                version: &identity.version,
                timeout_secs: self.config.timeout_secs,
                debug: self.debug,
            })
            .await?;

        match response {
            Response::Ready => {
                tracing::debug!("[{}] Transport helper {} ready", identity.id, command);
                Ok(transport)
            }
            other => Err(unexpected(other)),
        }
    }
}

/// A running helper process holding one device session
pub struct HelperTransport {
    device_id: String,
    child: Child,
    /// Dropped on close so the helper sees end of input
    stdin: Option<ChildStdin>,
    stdout: Lines<BufReader<ChildStdout>>,
    /// How long the helper gets to exit after close
    grace: Duration,
}

fn unexpected(response: Response) -> TransportError {
    match response {
        Response::Error { message } => TransportError::Device(message),
        other => TransportError::UnexpectedResponse(format!("{:?}", other)),
    }
}

impl HelperTransport {
    async fn exchange(&mut self, request: &Request<'_>) -> Result<Response, TransportError> {
        let stdin = self.stdin.as_mut().ok_or(TransportError::Closed)?;

        let mut line = serde_json::to_string(request)?;
        line.push('\n');
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;

        let reply = self.stdout.next_line().await?.ok_or(TransportError::Closed)?;
        Ok(serde_json::from_str(&reply)?)
    }

    async fn set(&mut self, address: Address, value: WriteValue) -> Result<(), TransportError> {
        match self.exchange(&Request::Set { address, value }).await? {
            Response::Ok => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}

#[async_trait]
impl DeviceTransport for HelperTransport {
    async fn request_status(&mut self) -> Result<Snapshot, TransportError> {
        match self.exchange(&Request::Status).await? {
            Response::Status { dps } => {
                let (snapshot, rejected) = Snapshot::from_dps(dps);
                if !rejected.is_empty() {
                    tracing::debug!(
                        "[{}] Ignoring non-numeric dps keys {:?}",
                        self.device_id,
                        rejected
                    );
                }
                Ok(snapshot)
            }
            other => Err(unexpected(other)),
        }
    }

    async fn write_boolean(&mut self, address: Address, value: bool) -> Result<(), TransportError> {
        self.set(address, WriteValue::Bool(value)).await
    }

    async fn write_value(&mut self, address: Address, value: i64) -> Result<(), TransportError> {
        self.set(address, WriteValue::Int(value)).await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.stdin.is_none() {
            return Ok(());
        }

        let result = match self.exchange(&Request::Close).await {
            Ok(Response::Ok) => Ok(()),
            Ok(other) => Err(unexpected(other)),
            Err(e) => Err(e),
        };
        self.stdin = None;

        match tokio::time::timeout(self.grace, self.child.wait()).await {
            Ok(Ok(status)) if !status.success() => {
                tracing::debug!("[{}] Transport helper exited with {}", self.device_id, status);
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                tracing::warn!("[{}] Transport helper did not exit, killing it", self.device_id);
                self.child.kill().await?;
            }
        }

        result
    }
}
