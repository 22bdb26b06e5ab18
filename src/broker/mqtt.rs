use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use super::MessageBroker;
use crate::error::BrokerError;

const REQUEST_CAPACITY: usize = 16;
const SUBSCRIBER_BUFFER: usize = 16;
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

type Subscribers = Arc<Mutex<HashMap<String, mpsc::Sender<Vec<u8>>>>>;

/// MQTT broker connection. Messages are exchanged with QoS 0.
pub struct MqttBroker {
    client: AsyncClient,
    subscribers: Subscribers,
}

impl MqttBroker {
    /// Creates the client and spawns the task driving its event loop. The
    /// task stops when `cancel` fires.
    pub fn connect(
        client_id: &str,
        host: &str,
        port: u16,
        user: &str,
        password: &str,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let mut opts = MqttOptions::new(client_id, host, port);
        opts.set_credentials(user, password);
        opts.set_keep_alive(Duration::from_secs(30));

        let (client, eventloop) = AsyncClient::new(opts, REQUEST_CAPACITY);
        let subscribers: Subscribers = Arc::new(Mutex::new(HashMap::new()));
        info!("MQTT client {} connecting to {}:{}", client_id, host, port);

        let driver = tokio::spawn(drive(eventloop, Arc::clone(&subscribers), cancel));
        (
            Self {
                client,
                subscribers,
            },
            driver,
        )
    }

    /// Queues a DISCONNECT. The event loop task flushes it and then stops,
    /// so it must still be running when this is called.
    pub async fn disconnect(&self) -> Result<(), BrokerError> {
        self.client
            .disconnect()
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))
    }
}

#[async_trait]
impl MessageBroker for MqttBroker {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        self.client
            .publish(topic, QoS::AtMostOnce, false, payload)
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))
    }

    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<Vec<u8>>, BrokerError> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.subscribers
            .lock()
            .map_err(|_| BrokerError::Closed)?
            .insert(topic.to_string(), tx);
        self.client
            .subscribe(topic, QoS::AtMostOnce)
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))?;
        Ok(rx)
    }
}

async fn drive(mut eventloop: EventLoop, subscribers: Subscribers, cancel: CancellationToken) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = eventloop.poll() => event,
        };
        match event {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                deliver(&subscribers, &publish.topic, publish.payload.to_vec());
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => info!("Connected to MQTT broker"),
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                info!("Disconnected from MQTT broker");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                error!(
                    "MQTT connection error: {}. Reconnecting in {:?}...",
                    e, RECONNECT_DELAY
                );
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sleep(RECONNECT_DELAY) => {}
                }
            }
        }
    }
    warn!("MQTT event loop stopped");
}

/// Hands an incoming payload to the subscriber of `topic` without waiting,
/// so a slow subscriber never stalls the event loop.
fn deliver(subscribers: &Subscribers, topic: &str, payload: Vec<u8>) {
    let Ok(mut subs) = subscribers.lock() else {
        return;
    };
    let Some(sender) = subs.get(topic) else {
        debug!("Received message on unsubscribed topic {}", topic);
        return;
    };
    match sender.try_send(payload) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => {
            warn!("Subscriber for {} is not keeping up, dropping message", topic);
        }
        Err(TrySendError::Closed(_)) => {
            debug!("Subscriber for {} went away", topic);
            subs.remove(topic);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subscribers_with(topic: &str, capacity: usize) -> (Subscribers, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(capacity);
        let subscribers: Subscribers = Arc::new(Mutex::new(HashMap::new()));
        subscribers.lock().unwrap().insert(topic.to_string(), tx);
        (subscribers, rx)
    }

    #[test]
    fn full_subscriber_drops_instead_of_blocking() {
        let (subscribers, mut rx) = subscribers_with("a/register", 2);
        for i in 0..5u8 {
            deliver(&subscribers, "a/register", vec![i]);
        }
        assert_eq!(rx.try_recv().unwrap(), vec![0]);
        assert_eq!(rx.try_recv().unwrap(), vec![1]);
        assert!(rx.try_recv().is_err());
        assert!(subscribers.lock().unwrap().contains_key("a/register"));
    }

    #[test]
    fn closed_subscriber_is_removed() {
        let (subscribers, rx) = subscribers_with("a/register", 2);
        drop(rx);
        deliver(&subscribers, "a/register", b"{}".to_vec());
        assert!(subscribers.lock().unwrap().is_empty());
    }

    #[test]
    fn unknown_topic_is_ignored() {
        let (subscribers, mut rx) = subscribers_with("a/register", 2);
        deliver(&subscribers, "b/register", b"{}".to_vec());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn disconnect_needs_a_running_event_loop() {
        let cancel = CancellationToken::new();
        let (broker, driver) =
            MqttBroker::connect("test-client", "127.0.0.1", 1, "user", "pass", cancel.clone());
        assert!(broker.disconnect().await.is_ok());

        cancel.cancel();
        driver.await.unwrap();
        assert!(broker.disconnect().await.is_err());
    }
}
