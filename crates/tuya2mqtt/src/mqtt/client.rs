use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::AsyncClient;
use rumqttc::Event;
use rumqttc::LastWill;
use rumqttc::MqttOptions;
use rumqttc::Outgoing;
use rumqttc::Packet;
use rumqttc::QoS;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::BrokerConfig;

/// MQTT message received from a subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum MqttError {
    #[error("MQTT client not connected, call connect() first")]
    NotConnected,

    #[error("MQTT client error: {0}")]
    Client(#[from] rumqttc::ClientError),
}

/// Trait for MQTT client operations
///
/// This trait allows for mocking the MQTT client for testing purposes
#[async_trait]
pub trait MqttClient: Send {
    /// Connect to the MQTT broker
    async fn connect(&mut self) -> Result<(), MqttError>;

    /// Subscribe to an MQTT topic. Subscriptions are restored after a reconnect.
    async fn subscribe(&mut self, topic: &str) -> Result<(), MqttError>;

    async fn unsubscribe(&mut self, topic: &str) -> Result<(), MqttError>;

    /// Publish a message to an MQTT topic
    async fn publish(&mut self, topic: &str, payload: &[u8], retain: bool)
        -> Result<(), MqttError>;

    /// Wait for the next message from subscribed topics
    ///
    /// Returns None once the client can no longer deliver messages
    async fn poll_message(&mut self) -> Option<MqttMessage>;

    /// Flush queued requests and close the connection
    async fn disconnect(&mut self) -> Result<(), MqttError>;
}

/// MQTT client implementation using rumqttc
pub struct RumqttcClient {
    /// MQTT connection options (stored for lazy initialization)
    mqtt_options: MqttOptions,

    /// AsyncClient (created in connect())
    client: Option<AsyncClient>,

    /// Topics to restore on every ConnAck
    subscriptions: Arc<Mutex<Vec<String>>>,

    /// Message receiver (created in connect())
    message_rx: Option<mpsc::UnboundedReceiver<MqttMessage>>,

    /// Background event loop task handle
    event_loop_task: Option<JoinHandle<()>>,
}

impl RumqttcClient {
    /// Create a client for one device worker.
    ///
    /// The broker publishes `will_payload` to `will_topic` if the connection
    /// drops without a clean disconnect.
    pub fn new(
        config: &BrokerConfig,
        client_id: String,
        will_topic: &str,
        will_payload: &str,
    ) -> Self {
        let mut mqtt_options = MqttOptions::new(client_id, config.hostname.clone(), config.port);

        mqtt_options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
        mqtt_options.set_last_will(LastWill::new(
            will_topic,
            will_payload.as_bytes().to_vec(),
            QoS::AtLeastOnce,
            false,
        ));

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            mqtt_options.set_credentials(username, password);
        }

        Self {
            mqtt_options,
            client: None,
            subscriptions: Arc::new(Mutex::new(Vec::new())),
            message_rx: None,
            event_loop_task: None,
        }
    }

    fn client(&self) -> Result<&AsyncClient, MqttError> {
        self.client.as_ref().ok_or(MqttError::NotConnected)
    }
}

#[async_trait]
impl MqttClient for RumqttcClient {
    async fn connect(&mut self) -> Result<(), MqttError> {
        let (client, mut event_loop) = AsyncClient::new(self.mqtt_options.clone(), 10);
        let (message_tx, message_rx) = mpsc::unbounded_channel();

        let resubscribe_client = client.clone();
        let subscriptions = self.subscriptions.clone();
        let client_id = self.mqtt_options.client_id();

        let task = tokio::spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let msg = MqttMessage {
                            topic: publish.topic.to_string(),
                            payload: publish.payload.to_vec(),
                            retain: publish.retain,
                        };

                        if message_tx.send(msg).is_err() {
                            break;
                        }
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        tracing::debug!("[{}] Connected to broker", client_id);
                        // try_subscribe: the event loop must not wait on its own request queue
                        for topic in subscriptions.lock().await.iter() {
                            if let Err(e) =
                                resubscribe_client.try_subscribe(topic, QoS::AtMostOnce)
                            {
                                tracing::warn!(
                                    "[{}] Failed to resubscribe to {}: {}",
                                    client_id,
                                    topic,
                                    e
                                );
                            }
                        }
                    }
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!("[{}] MQTT event loop error: {}", client_id, e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
            tracing::debug!("[{}] MQTT event loop task exiting", client_id);
        });

        self.client = Some(client);
        self.message_rx = Some(message_rx);
        self.event_loop_task = Some(task);

        Ok(())
    }

    async fn subscribe(&mut self, topic: &str) -> Result<(), MqttError> {
        self.client()?.subscribe(topic, QoS::AtMostOnce).await?;

        let mut subscriptions = self.subscriptions.lock().await;
        if !subscriptions.iter().any(|t| t == topic) {
            subscriptions.push(topic.to_string());
        }

        Ok(())
    }

    async fn unsubscribe(&mut self, topic: &str) -> Result<(), MqttError> {
        self.subscriptions.lock().await.retain(|t| t != topic);
        self.client()?.unsubscribe(topic).await?;
        Ok(())
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        retain: bool,
    ) -> Result<(), MqttError> {
        self.client()?
            .publish(topic, QoS::AtLeastOnce, retain, payload)
            .await?;
        Ok(())
    }

    async fn poll_message(&mut self) -> Option<MqttMessage> {
        match &mut self.message_rx {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    async fn disconnect(&mut self) -> Result<(), MqttError> {
        let Some(client) = self.client.take() else {
            return Ok(());
        };
        client.disconnect().await?;

        // Let the event loop flush what is queued ahead of the disconnect
        if let Some(mut task) = self.event_loop_task.take() {
            if tokio::time::timeout(Duration::from_secs(2), &mut task).await.is_err() {
                tracing::warn!("MQTT event loop did not exit after disconnect");
                task.abort();
            }
        }

        Ok(())
    }
}

impl Drop for RumqttcClient {
    fn drop(&mut self) {
        if let Some(task) = self.event_loop_task.take() {
            task.abort();
        }
    }
}

/// Calls recorded by [`MockMqttClient`]
#[cfg(test)]
#[derive(Debug, Default)]
pub struct MockMqttState {
    pub is_connected: bool,
    pub subscriptions: Vec<String>,
    pub unsubscribed: Vec<String>,
    pub published: Vec<(String, String, bool)>,
    /// Topics whose publish fails
    pub fail_topics: Vec<String>,
    /// Every subscribe fails
    pub fail_subscribe: bool,
    pub disconnected: bool,
}

/// Mock MQTT client for testing
///
/// State is shared with the test through [`MockMqttClient::state`], so it can
/// be inspected after a worker has consumed the client.
#[cfg(test)]
pub struct MockMqttClient {
    state: Arc<std::sync::Mutex<MockMqttState>>,
    incoming: mpsc::UnboundedReceiver<MqttMessage>,
}

#[cfg(test)]
impl MockMqttClient {
    /// Create a mock client and the sender used to inject inbound messages
    pub fn pair() -> (Self, mpsc::UnboundedSender<MqttMessage>) {
        let (tx, incoming) = mpsc::unbounded_channel();
        let client = Self {
            state: Arc::default(),
            incoming,
        };
        (client, tx)
    }

    pub fn state(&self) -> Arc<std::sync::Mutex<MockMqttState>> {
        self.state.clone()
    }
}

#[cfg(test)]
#[async_trait]
impl MqttClient for MockMqttClient {
    async fn connect(&mut self) -> Result<(), MqttError> {
        self.state.lock().unwrap().is_connected = true;
        Ok(())
    }

    async fn subscribe(&mut self, topic: &str) -> Result<(), MqttError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_subscribe {
            return Err(MqttError::NotConnected);
        }
        state.subscriptions.push(topic.to_string());
        Ok(())
    }

    async fn unsubscribe(&mut self, topic: &str) -> Result<(), MqttError> {
        self.state.lock().unwrap().unsubscribed.push(topic.to_string());
        Ok(())
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        retain: bool,
    ) -> Result<(), MqttError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_topics.iter().any(|t| t == topic) {
            return Err(MqttError::NotConnected);
        }
        state.published.push((
            topic.to_string(),
            String::from_utf8_lossy(payload).into_owned(),
            retain,
        ));
        Ok(())
    }

    async fn poll_message(&mut self) -> Option<MqttMessage> {
        self.incoming.recv().await
    }

    async fn disconnect(&mut self) -> Result<(), MqttError> {
        let mut state = self.state.lock().unwrap();
        state.is_connected = false;
        state.disconnected = true;
        Ok(())
    }
}
