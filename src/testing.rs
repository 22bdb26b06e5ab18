//! Mock collaborators for tests.
//!
//! Both mocks queue canned responses, allow injecting failures and capture
//! what the bridge did for later assertions.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::broker::MessageBroker;
use crate::cluster::{ClusterClient, NodeInfo, Signal, Subscription, UnitInfo, NODE_PATH_PREFIX};
use crate::error::{BrokerError, ClusterError};

pub const MONITOR_PATH: &str = "/org/eclipse/bluechi/monitor/1";

#[derive(Debug, Default)]
struct MockClusterInner {
    nodes: Vec<NodeInfo>,
    units: HashMap<String, Vec<UnitInfo>>,
    failing_units: HashSet<String>,
    last_seen: HashMap<String, DateTime<Utc>>,
    fail_list_nodes: Option<String>,
    during_list_nodes: Vec<Signal>,
    signals: Option<mpsc::Sender<Signal>>,
}

#[derive(Debug, Default)]
pub struct MockCluster {
    inner: Mutex<MockClusterInner>,
}

impl MockCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node_path(name: &str) -> String {
        format!("{}{}", NODE_PATH_PREFIX, name)
    }

    pub fn monitor_path(&self) -> String {
        MONITOR_PATH.to_string()
    }

    pub fn add_node(&self, name: &str, status: &str) {
        self.inner.lock().unwrap().nodes.push(NodeInfo {
            name: name.into(),
            path: Self::node_path(name),
            status: status.into(),
        });
    }

    /// Sets the units reported for `node` as `(name, active, sub)` triples.
    pub fn set_units(&self, node: &str, units: &[(&str, &str, &str)]) {
        let units = units
            .iter()
            .map(|(name, active, sub)| UnitInfo {
                name: name.to_string(),
                active_state: active.to_string(),
                sub_state: sub.to_string(),
            })
            .collect();
        let mut inner = self.inner.lock().unwrap();
        inner.failing_units.remove(node);
        inner.units.insert(node.into(), units);
    }

    pub fn fail_units(&self, node: &str) {
        self.inner.lock().unwrap().failing_units.insert(node.into());
    }

    pub fn set_last_seen(&self, node: &str, ts: DateTime<Utc>) {
        self.inner
            .lock()
            .unwrap()
            .last_seen
            .insert(Self::node_path(node), ts);
    }

    /// Emits `signal` on the subscription while `list_nodes` is running.
    pub fn emit_during_list_nodes(&self, signal: Signal) {
        self.inner.lock().unwrap().during_list_nodes.push(signal);
    }

    pub fn fail_list_nodes(&self, error: &str) {
        self.inner.lock().unwrap().fail_list_nodes = Some(error.into());
    }

    /// Delivers `signal` on the active subscription.
    pub async fn emit(&self, signal: Signal) {
        let sender = self
            .inner
            .lock()
            .unwrap()
            .signals
            .clone()
            .expect("no active subscription");
        sender.send(signal).await.expect("subscription closed");
    }

    /// Closes the signal channel as if the bus connection dropped.
    pub fn close_signals(&self) {
        self.inner.lock().unwrap().signals = None;
    }
}

#[async_trait]
impl ClusterClient for MockCluster {
    async fn list_nodes(&self) -> Result<Vec<NodeInfo>, ClusterError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(error) = &inner.fail_list_nodes {
            return Err(ClusterError::Transport(error.clone()));
        }
        let pending: Vec<Signal> = inner.during_list_nodes.drain(..).collect();
        if let Some(tx) = &inner.signals {
            for signal in pending {
                tx.try_send(signal).expect("subscription full or closed");
            }
        }
        Ok(inner.nodes.clone())
    }

    async fn list_units_on(&self, node: &str) -> Result<Vec<UnitInfo>, ClusterError> {
        let inner = self.inner.lock().unwrap();
        if inner.failing_units.contains(node) {
            return Err(ClusterError::Transport(format!("no reply from '{}'", node)));
        }
        Ok(inner.units.get(node).cloned().unwrap_or_default())
    }

    async fn last_seen_timestamp(&self, node_path: &str) -> Result<DateTime<Utc>, ClusterError> {
        self.inner
            .lock()
            .unwrap()
            .last_seen
            .get(node_path)
            .copied()
            .ok_or_else(|| ClusterError::NotFound(node_path.into()))
    }

    async fn subscribe(&self) -> Result<Subscription, ClusterError> {
        let (tx, rx) = mpsc::channel(64);
        self.inner.lock().unwrap().signals = Some(tx);
        Ok(Subscription {
            id: 7,
            monitor_path: MONITOR_PATH.into(),
            signals: rx,
        })
    }
}

/// A message accepted by [`MockBroker::publish`].
#[derive(Debug, Clone)]
pub struct Published {
    pub topic: String,
    pub payload: Vec<u8>,
    pub at: Instant,
}

#[derive(Debug, Default)]
struct MockBrokerInner {
    subscribers: HashMap<String, mpsc::Sender<Vec<u8>>>,
    reply: Option<(String, String, Vec<u8>)>,
    fail_publish: bool,
    failed_publishes: usize,
}

#[derive(Debug)]
pub struct MockBroker {
    inner: Mutex<MockBrokerInner>,
    published: watch::Sender<Vec<Published>>,
}

impl Default for MockBroker {
    fn default() -> Self {
        Self {
            inner: Mutex::default(),
            published: watch::Sender::new(Vec::new()),
        }
    }
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers every publish on `request_topic` with `payload` on `reply_topic`.
    pub fn reply_to(&self, request_topic: &str, reply_topic: &str, payload: Vec<u8>) {
        self.inner.lock().unwrap().reply =
            Some((request_topic.into(), reply_topic.into(), payload));
    }

    /// Makes every publish fail until reset.
    pub fn fail_publishes(&self, fail: bool) {
        self.inner.lock().unwrap().fail_publish = fail;
    }

    pub fn failed_publishes(&self) -> usize {
        self.inner.lock().unwrap().failed_publishes
    }

    /// Whether the subscriber of `topic` dropped its receiver.
    pub fn subscriber_closed(&self, topic: &str) -> bool {
        self.inner
            .lock()
            .unwrap()
            .subscribers
            .get(topic)
            .map_or(true, |tx| tx.is_closed())
    }

    pub fn published_on(&self, topic: &str) -> Vec<Published> {
        self.published
            .borrow()
            .iter()
            .filter(|p| p.topic == topic)
            .cloned()
            .collect()
    }

    /// Waits until at least `count` messages were published on `topic`.
    pub async fn wait_for(&self, topic: &str, count: usize) -> Vec<Published> {
        let mut rx = self.published.subscribe();
        rx.wait_for(|published| published.iter().filter(|p| p.topic == topic).count() >= count)
            .await
            .expect("mock broker dropped");
        self.published_on(topic)
    }
}

#[async_trait]
impl MessageBroker for MockBroker {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        let reply = {
            let mut inner = self.inner.lock().unwrap();
            if inner.fail_publish {
                inner.failed_publishes += 1;
                return Err(BrokerError::Transport("broker unreachable".into()));
            }
            inner.reply.as_ref().and_then(|(request, reply_topic, reply)| {
                (request == topic)
                    .then(|| inner.subscribers.get(reply_topic).cloned())
                    .flatten()
                    .map(|tx| (tx, reply.clone()))
            })
        };

        self.published.send_modify(|published| {
            published.push(Published {
                topic: topic.into(),
                payload,
                at: Instant::now(),
            })
        });
        if let Some((tx, reply)) = reply {
            let _ = tx.try_send(reply);
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<Vec<u8>>, BrokerError> {
        let (tx, rx) = mpsc::channel(16);
        self.inner
            .lock()
            .unwrap()
            .subscribers
            .insert(topic.into(), tx);
        Ok(rx)
    }
}
