use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::BrokerError;

pub mod mqtt;
pub use mqtt::MqttBroker;

#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Publishes `payload` on `topic`, returning once the broker client
    /// has accepted the message.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError>;

    /// Subscribes to `topic`. Payloads received on it are delivered on the
    /// returned channel.
    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<Vec<u8>>, BrokerError>;
}
