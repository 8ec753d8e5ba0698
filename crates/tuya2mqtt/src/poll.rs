//! Per-device worker: polls the device, publishes its state and relays
//! commands back to it.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::device::Device;
use crate::discovery;
use crate::entity::WriteValue;
use crate::mqtt::MqttClient;
use crate::mqtt::MqttError;
use crate::mqtt::MqttMessage;
use crate::translate;
use crate::translate::TopicLayout;
use crate::translate::TopicUpdate;
use crate::transport::DeviceTransport;
use crate::transport::TransportConnector;
use crate::transport::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum WorkerState {
    Connecting,
    Polling,
    Stopped,
    Faulted,
}

/// Why a worker gave up on its device
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Failed to connect to device: {0}")]
    Transport(#[from] TransportError),

    #[error("Failed to set up MQTT: {0}")]
    Mqtt(#[from] MqttError),
}

pub struct PollWorker<C: TransportConnector, M: MqttClient> {
    device: Device,
    layout: TopicLayout,
    interval: Duration,
    connector: C,
    mqtt: M,
    state: WorkerState,
}

impl<C: TransportConnector, M: MqttClient> PollWorker<C, M> {
    pub fn new(
        device: Device,
        layout: TopicLayout,
        interval: Duration,
        connector: C,
        mqtt: M,
    ) -> Self {
        Self {
            device,
            layout,
            interval,
            connector,
            mqtt,
            state: WorkerState::Connecting,
        }
    }

    fn set_state(&mut self, state: WorkerState) {
        debug!("[{}] {} -> {}", self.device.id, self.state, state);
        self.state = state;
    }

    /// Run until `shutdown` turns true or the sender is dropped.
    ///
    /// Failing to open the device session is fatal for this worker only. Once
    /// the session is open, the device is released on every exit path.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), WorkerError> {
        info!(
            "[{}] Connecting to {} ({}) at {}",
            self.device.id, self.device.name, self.device.model, self.device.address
        );

        let mut transport = match self.connector.connect(&self.device.identity()).await {
            Ok(transport) => transport,
            Err(e) => {
                self.set_state(WorkerState::Faulted);
                return Err(e.into());
            }
        };

        let result = self.serve(&mut transport, &mut shutdown).await;
        self.release(&mut transport).await;

        match &result {
            Ok(()) => self.set_state(WorkerState::Stopped),
            Err(_) => self.set_state(WorkerState::Faulted),
        }
        result
    }

    async fn serve(
        &mut self,
        transport: &mut C::Transport,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), WorkerError> {
        self.mqtt.connect().await?;

        for descriptor in discovery::discovery_messages(&self.layout, &self.device) {
            match descriptor.to_update() {
                Ok(update) => self.publish(&update).await,
                Err(e) => warn!(
                    "[{}] Failed to encode {}: {}",
                    self.device.id, descriptor.topic, e
                ),
            }
        }

        for topic in discovery::command_topics(&self.layout, &self.device) {
            self.mqtt.subscribe(&topic).await?;
        }

        self.set_state(WorkerState::Polling);

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut messages_open = true;

        loop {
            tokio::select! {
                biased;

                // The borrow returned by wait_for is not Send, so drop it here
                _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => {
                    info!("[{}] Shutting down", self.device.id);
                    return Ok(());
                }

                _ = ticker.tick() => {
                    self.poll_once(transport).await;
                }

                message = self.mqtt.poll_message(), if messages_open => match message {
                    Some(message) => self.handle_message(transport, message).await,
                    None => {
                        warn!(
                            "[{}] MQTT message stream closed, no longer accepting commands",
                            self.device.id
                        );
                        messages_open = false;
                    }
                },
            }
        }
    }

    /// Read the device once and publish what it reports
    async fn poll_once(&mut self, transport: &mut C::Transport) {
        match transport.request_status().await {
            Ok(snapshot) => {
                let updates =
                    translate::build_outbound_updates(&self.layout, &self.device, &snapshot);
                if updates.is_empty() {
                    debug!("[{}] Empty status, nothing to publish", self.device.id);
                }
                for update in &updates {
                    self.publish(update).await;
                }
            }
            Err(e) => warn!("[{}] Failed to read status: {}", self.device.id, e),
        }
    }

    async fn handle_message(&mut self, transport: &mut C::Transport, message: MqttMessage) {
        let payload = String::from_utf8_lossy(&message.payload);
        if payload.is_empty() {
            debug!("[{}] Ignoring empty payload on {}", self.device.id, message.topic);
            return;
        }

        let command = match translate::resolve_inbound_command(
            &self.layout,
            &self.device,
            &message.topic,
            &payload,
        ) {
            Ok(command) => command,
            Err(e) => {
                warn!("[{}] Dropping command: {}", self.device.id, e);
                return;
            }
        };

        info!(
            "[{}] {} -> dps {} = {}",
            self.device.id, message.topic, command.address, command.value
        );

        let written = match command.value {
            WriteValue::Bool(value) => transport.write_boolean(command.address, value).await,
            WriteValue::Int(value) => transport.write_value(command.address, value).await,
        };

        match written {
            Ok(()) => self.poll_once(transport).await,
            Err(e) => warn!("[{}] Failed to write dps {}: {}", self.device.id, command.address, e),
        }
    }

    /// Publish one update; failures are logged and do not stop the batch
    async fn publish(&mut self, update: &TopicUpdate) {
        if let Err(e) = self
            .mqtt
            .publish(&update.topic, update.payload.as_bytes(), update.retain)
            .await
        {
            warn!("[{}] Failed to publish {}: {}", self.device.id, update.topic, e);
        }
    }

    async fn release(&mut self, transport: &mut C::Transport) {
        let offline = self.layout.availability(&self.device.id, false);
        self.publish(&offline).await;

        for topic in discovery::command_topics(&self.layout, &self.device) {
            if let Err(e) = self.mqtt.unsubscribe(&topic).await {
                warn!("[{}] Failed to unsubscribe from {}: {}", self.device.id, topic, e);
            }
        }

        if let Err(e) = transport.close().await {
            warn!("[{}] Failed to close device session: {}", self.device.id, e);
        }

        if let Err(e) = self.mqtt.disconnect().await {
            warn!("[{}] Failed to disconnect from broker: {}", self.device.id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::Mutex;

    use tokio::sync::mpsc;

    use super::*;
    use crate::mqtt::MockMqttClient;
    use crate::status::addr;
    use crate::status::Snapshot;
    use crate::translate::tests::device;
    use crate::translate::tests::fan;
    use crate::transport::mock::MockConnector;

    type Published = Vec<(String, String, bool)>;

    fn fan_snapshot() -> Snapshot {
        let mut snapshot = Snapshot::new();
        snapshot.insert(addr(1), false);
        snapshot.insert(addr(3), 100);
        snapshot
    }

    fn worker(
        connector: MockConnector,
        mqtt: MockMqttClient,
    ) -> PollWorker<MockConnector, MockMqttClient> {
        PollWorker::new(
            device(vec![fan()]),
            TopicLayout::default(),
            Duration::from_secs(3600),
            connector,
            mqtt,
        )
    }

    fn message(topic: &str, payload: &str) -> MqttMessage {
        MqttMessage {
            topic: topic.to_string(),
            payload: payload.as_bytes().to_vec(),
            retain: false,
        }
    }

    /// Wait until `condition` holds, for at most two seconds
    async fn eventually<T>(state: &Arc<Mutex<T>>, condition: impl Fn(&T) -> bool) {
        for _ in 0..400 {
            {
                let guard = state.lock().unwrap();
                if condition(&*guard) {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    fn contains(published: &Published, topic: &str, payload: &str) -> bool {
        published.iter().any(|(t, p, _)| t == topic && p == payload)
    }

    #[tokio::test]
    async fn test_connect_failure_faults_without_publishing() {
        let connector = MockConnector::new(fan_snapshot());
        connector.device.lock().unwrap().unreachable.push("bf01".to_string());
        let (mqtt, _tx) = MockMqttClient::pair();
        let mqtt_state = mqtt.state();
        let (_shutdown_tx, shutdown) = watch::channel(false);

        let result = worker(connector.clone(), mqtt).run(shutdown).await;

        assert!(matches!(result, Err(WorkerError::Transport(_))));
        let mqtt_state = mqtt_state.lock().unwrap();
        assert!(!mqtt_state.is_connected);
        assert!(mqtt_state.published.is_empty());
        assert!(mqtt_state.subscriptions.is_empty());
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let connector = MockConnector::new(fan_snapshot());
        let (mqtt, _tx) = MockMqttClient::pair();
        let mqtt_state = mqtt.state();
        let (shutdown_tx, shutdown) = watch::channel(false);

        let handle = tokio::spawn(worker(connector.clone(), mqtt).run(shutdown));

        eventually(&mqtt_state, |s| contains(&s.published, "home/bf01/fan/state", "OFF")).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();

        let mqtt_state = mqtt_state.lock().unwrap();
        let (first_topic, _, retained) = &mqtt_state.published[0];
        assert_eq!(first_topic, "homeassistant/fan/bf01/config");
        assert!(*retained);

        assert_eq!(
            mqtt_state.subscriptions,
            vec!["home/bf01/fan/command", "home/bf01/fan/speed/command"]
        );
        assert_eq!(mqtt_state.unsubscribed, mqtt_state.subscriptions);

        let last = mqtt_state.published.last().unwrap();
        assert_eq!(last, &("home/bf01/online".to_string(), "offline".to_string(), false));
        assert!(mqtt_state.disconnected);
        assert!(connector.device.lock().unwrap().closed);
    }

    #[tokio::test]
    async fn test_setup_failure_releases_device() {
        let connector = MockConnector::new(fan_snapshot());
        let (mqtt, _tx) = MockMqttClient::pair();
        let mqtt_state = mqtt.state();
        mqtt_state.lock().unwrap().fail_subscribe = true;
        let (_shutdown_tx, shutdown) = watch::channel(false);

        let result = worker(connector.clone(), mqtt).run(shutdown).await;

        assert!(matches!(result, Err(WorkerError::Mqtt(_))));
        let device = connector.device.lock().unwrap();
        assert!(device.closed);
        assert_eq!(device.polls, 0);

        let mqtt_state = mqtt_state.lock().unwrap();
        let last = mqtt_state.published.last().unwrap();
        assert_eq!(last, &("home/bf01/online".to_string(), "offline".to_string(), false));
        assert_eq!(
            mqtt_state.unsubscribed,
            vec!["home/bf01/fan/command", "home/bf01/fan/speed/command"]
        );
        assert!(mqtt_state.disconnected);
    }

    #[tokio::test]
    async fn test_command_writes_and_republishes() {
        let connector = MockConnector::new(fan_snapshot());
        let (mqtt, tx) = MockMqttClient::pair();
        let mqtt_state = mqtt.state();
        let (shutdown_tx, shutdown) = watch::channel(false);

        let handle = tokio::spawn(worker(connector.clone(), mqtt).run(shutdown));
        eventually(&mqtt_state, |s| contains(&s.published, "home/bf01/fan/state", "OFF")).await;

        tx.send(message("home/bf01/fan/speed/command", "")).unwrap();
        tx.send(message("home/bf01/fan/direction/command", "forward")).unwrap();
        tx.send(message("home/bf01/fan/speed/command", "fast")).unwrap();
        tx.send(message("home/bf01/fan/command", "ON")).unwrap();

        eventually(&mqtt_state, |s| contains(&s.published, "home/bf01/fan/state", "ON")).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();

        let device = connector.device.lock().unwrap();
        assert_eq!(device.writes, vec![(addr(1), WriteValue::Bool(true))]);
        assert_eq!(device.polls, 2);
    }

    #[tokio::test]
    async fn test_status_failure_skips_cycle() {
        let connector = MockConnector::new(fan_snapshot());
        connector.device.lock().unwrap().failing_polls = 1;
        let (mqtt, _tx) = MockMqttClient::pair();
        let mqtt_state = mqtt.state();

        let mut worker = worker(connector.clone(), mqtt);
        let mut transport = connector.connect(&worker.device.identity()).await.unwrap();

        worker.poll_once(&mut transport).await;
        assert!(mqtt_state.lock().unwrap().published.is_empty());

        worker.poll_once(&mut transport).await;
        assert_eq!(mqtt_state.lock().unwrap().published.len(), 3);
    }

    #[tokio::test]
    async fn test_publish_failure_does_not_stop_batch() {
        let connector = MockConnector::new(fan_snapshot());
        let (mqtt, _tx) = MockMqttClient::pair();
        let mqtt_state = mqtt.state();
        mqtt_state
            .lock()
            .unwrap()
            .fail_topics
            .push("home/bf01/fan/state".to_string());

        let mut worker = worker(connector.clone(), mqtt);
        let mut transport = connector.connect(&worker.device.identity()).await.unwrap();
        worker.poll_once(&mut transport).await;

        let topics: Vec<_> = mqtt_state
            .lock()
            .unwrap()
            .published
            .iter()
            .map(|(t, _, _)| t.clone())
            .collect();
        assert_eq!(topics, vec!["home/bf01/online", "home/bf01/fan/speed/state"]);
    }

    #[tokio::test]
    async fn test_closed_message_stream_keeps_polling() {
        let connector = MockConnector::new(fan_snapshot());
        let (mqtt, tx) = MockMqttClient::pair();
        drop(tx);
        let mqtt_state = mqtt.state();
        let (shutdown_tx, shutdown) = watch::channel(false);

        let handle = tokio::spawn(worker(connector.clone(), mqtt).run(shutdown));
        eventually(&mqtt_state, |s| contains(&s.published, "home/bf01/fan/state", "OFF")).await;

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
        assert!(connector.device.lock().unwrap().closed);
    }

    #[tokio::test]
    async fn test_dropped_shutdown_sender_stops_worker() {
        let connector = MockConnector::new(fan_snapshot());
        let (mqtt, _tx) = MockMqttClient::pair();
        let (shutdown_tx, shutdown) = watch::channel(false);
        drop(shutdown_tx);

        let (done_tx, mut done_rx) = mpsc::channel(1);
        tokio::spawn(async move {
            let result = worker(connector, mqtt).run(shutdown).await;
            let _ = done_tx.send(result.is_ok()).await;
        });

        let finished = tokio::time::timeout(Duration::from_secs(2), done_rx.recv()).await;
        assert_eq!(finished.unwrap(), Some(true));
    }
}
