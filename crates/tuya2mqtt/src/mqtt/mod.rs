mod client;

#[cfg(test)]
pub use client::MockMqttClient;
pub use client::MqttClient;
pub use client::MqttError;
pub use client::MqttMessage;
pub use client::RumqttcClient;
