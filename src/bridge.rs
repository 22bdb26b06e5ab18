//! The bridge between the cluster manager and the device's broker topics.
//!
//! After a successful registration handshake the bridge runs two tasks:
//!
//! * the [`EventRouter`] loop, whose handlers decode signals into
//!   [`ClusterEvent`]s and forward them over a channel, and
//! * the tracker loop, which owns the [`ClusterMirror`], applies those
//!   events, and performs every publish (event driven or periodic).
//!
//! Keeping the mirror inside a single task serializes all
//! mutate-then-clear sequences without a lock.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use log::{debug, error, info, warn};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::broker::MessageBroker;
use crate::cluster::event::ClusterEvent;
use crate::cluster::{
    ClusterClient, Signal, UnitInfo, NODE_PATH_PREFIX, SIGNAL_UNIT_STATE_CHANGED,
};
use crate::error::{BridgeError, ClusterError, DecodeError, SyncFailure};
use crate::router::{EventRouter, MatchKey, SignalHandler};
use crate::state::{ClusterMirror, LastSeen, Node, NodeStatus, ServiceUnit};
use crate::types::{RegisterRequest, RegisterResponse};

const EVENT_BUFFER: usize = 128;
const FAILURE_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgePhase {
    Created,
    Registering,
    Tracking,
    ShuttingDown,
}

#[derive(Debug, Clone)]
pub struct BridgeSettings {
    pub device_id: String,
    pub device_type: String,
    pub topic_base: String,
    /// Debounce window for unit updates and period of the flush loop.
    pub min_update_interval: Duration,
}

/// Broker topics of one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    pub register: String,
    pub ack: String,
    pub update: String,
}

impl Topics {
    pub fn new(base: &str, device_id: &str) -> Self {
        Self {
            register: format!("{}/register", base),
            ack: format!("{}/{}/register", base, device_id),
            update: format!("{}/{}/update", base, device_id),
        }
    }
}

pub struct Bridge {
    cluster: Arc<dyn ClusterClient>,
    broker: Arc<dyn MessageBroker>,
    settings: BridgeSettings,
    topics: Topics,
    phase: watch::Sender<BridgePhase>,
    failures: broadcast::Sender<SyncFailure>,
}

impl Bridge {
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        broker: Arc<dyn MessageBroker>,
        settings: BridgeSettings,
    ) -> Self {
        let topics = Topics::new(&settings.topic_base, &settings.device_id);
        let (failures, _) = broadcast::channel(FAILURE_BUFFER);
        Self {
            cluster,
            broker,
            settings,
            topics,
            phase: watch::Sender::new(BridgePhase::Created),
            failures,
        }
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    pub fn phase(&self) -> watch::Receiver<BridgePhase> {
        self.phase.subscribe()
    }

    /// Recoverable failures: dropped signals, failed enumerations and
    /// failed publishes.
    pub fn failures(&self) -> broadcast::Receiver<SyncFailure> {
        self.failures.subscribe()
    }

    /// Registers the device and tracks the cluster until `cancel` fires.
    ///
    /// Returns an error without publishing any update if registration is
    /// not acknowledged with `success`.
    pub async fn start(&self, cancel: CancellationToken) -> Result<(), BridgeError> {
        let result = self.run(&cancel).await;
        self.phase.send_replace(BridgePhase::ShuttingDown);
        match &result {
            Ok(()) => info!("Bridge shut down"),
            Err(e) => error!("Bridge stopped: {}", e),
        }
        result
    }

    async fn run(&self, cancel: &CancellationToken) -> Result<(), BridgeError> {
        self.phase.send_replace(BridgePhase::Registering);
        let mut acks = self.broker.subscribe(&self.topics.ack).await?;

        let request = serde_json::to_vec(&RegisterRequest {
            device_id: self.settings.device_id.clone(),
            device_type: self.settings.device_type.clone(),
        })
        .map_err(BridgeError::Encode)?;
        self.broker.publish(&self.topics.register, request).await?;
        info!("Registering device {}", self.settings.device_id);

        let ack = tokio::select! {
            _ = cancel.cancelled() => {
                info!("Cancelled while waiting for registration");
                return Ok(());
            }
            ack = acks.recv() => ack.ok_or(BridgeError::AckChannelClosed)?,
        };
        // Only the first acknowledgment matters; later ones must not pile up
        // in a receiver nobody reads.
        drop(acks);
        let response: RegisterResponse =
            serde_json::from_slice(&ack).map_err(BridgeError::AckDecode)?;
        if !response.is_success() {
            return Err(BridgeError::Rejected(response.result));
        }
        info!("Successfully registered");
        self.phase.send_replace(BridgePhase::Tracking);

        self.track(cancel).await
    }

    async fn track(&self, cancel: &CancellationToken) -> Result<(), BridgeError> {
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);

        let mut router = EventRouter::new();
        router.register(
            MatchKey::PathPrefix(NODE_PATH_PREFIX.to_string()),
            EventForwarder {
                decode: ClusterEvent::node_status,
                events: events_tx.clone(),
                failures: self.failures.clone(),
            },
        )?;
        router.register(
            MatchKey::Signal(SIGNAL_UNIT_STATE_CHANGED.to_string()),
            EventForwarder {
                decode: |signal| ClusterEvent::unit_state(signal).map(Some),
                events: events_tx,
                failures: self.failures.clone(),
            },
        )?;
        // Signals arriving during the initial sync queue up in the subscription.
        router.subscribe(self.cluster.as_ref()).await?;

        let mut tracker = Tracker::new(
            Arc::clone(&self.cluster),
            Arc::clone(&self.broker),
            &self.settings,
            self.topics.update.clone(),
            self.failures.clone(),
        );
        tracker
            .initial_sync()
            .await
            .map_err(BridgeError::InitialSync)?;
        tracker.publish().await;

        let router_cancel = cancel.child_token();
        let router_task = tokio::spawn(async move { router.run(router_cancel).await });
        let tracker_task = tokio::spawn(tracker.run(events_rx, cancel.child_token()));

        let (routed, tracked) = tokio::join!(router_task, tracker_task);
        routed??;
        tracked?;

        if cancel.is_cancelled() {
            Ok(())
        } else {
            Err(BridgeError::EventStreamClosed)
        }
    }
}

type Decoder = fn(&Signal) -> Result<Option<ClusterEvent>, DecodeError>;

/// Router handler that decodes a signal and hands it to the tracker.
struct EventForwarder {
    decode: Decoder,
    events: mpsc::Sender<ClusterEvent>,
    failures: broadcast::Sender<SyncFailure>,
}

#[async_trait]
impl SignalHandler for EventForwarder {
    async fn handle(&self, signal: &Signal) {
        match (self.decode)(signal) {
            Ok(Some(event)) => {
                if self.events.send(event).await.is_err() {
                    debug!("Tracker stopped, dropping {}", signal.name);
                }
            }
            Ok(None) => debug!("Ignoring {} at {}", signal.name, signal.path),
            Err(e) => {
                warn!("Dropping {} at {}: {}", signal.name, signal.path, e);
                let _ = self.failures.send(SyncFailure::Decode {
                    signal: signal.name.clone(),
                    source: e,
                });
            }
        }
    }
}

/// Single owner of the mirror.
struct Tracker {
    cluster: Arc<dyn ClusterClient>,
    broker: Arc<dyn MessageBroker>,
    device_id: String,
    update_topic: String,
    min_update_interval: Duration,
    mirror: ClusterMirror,
    last_publish: Option<Instant>,
    next_flush: Instant,
    failures: broadcast::Sender<SyncFailure>,
}

impl Tracker {
    fn new(
        cluster: Arc<dyn ClusterClient>,
        broker: Arc<dyn MessageBroker>,
        settings: &BridgeSettings,
        update_topic: String,
        failures: broadcast::Sender<SyncFailure>,
    ) -> Self {
        Self {
            cluster,
            broker,
            device_id: settings.device_id.clone(),
            update_topic,
            min_update_interval: settings.min_update_interval,
            mirror: ClusterMirror::new(),
            last_publish: None,
            next_flush: Instant::now() + settings.min_update_interval,
            failures,
        }
    }

    async fn run(mut self, mut events: mpsc::Receiver<ClusterEvent>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep_until(self.next_flush) => {
                    self.next_flush = Instant::now() + self.min_update_interval;
                    if !self.mirror.is_empty() {
                        debug!("Mirror not empty, pushing changes");
                        self.publish().await;
                    }
                }
                event = events.recv() => match event {
                    Some(event) => self.apply(event).await,
                    None => break,
                },
            }
        }
        debug!("Tracker stopped");
    }

    /// Populates the mirror with every node known to the cluster manager.
    async fn initial_sync(&mut self) -> Result<(), ClusterError> {
        let nodes = self.cluster.list_nodes().await?;
        for info in nodes {
            let status = NodeStatus::parse(&info.status);
            let node = if status == NodeStatus::Online {
                match self.cluster.list_units_on(&info.name).await {
                    Ok(units) => {
                        let mut node = Node::new(&info.name, status, LastSeen::Now);
                        node.replace_services(units.into_iter().map(service_unit));
                        node
                    }
                    Err(e) => {
                        self.list_units_failed(&info.name, e);
                        continue;
                    }
                }
            } else {
                let last_seen = match self.cluster.last_seen_timestamp(&info.path).await {
                    Ok(ts) => LastSeen::Absolute(ts),
                    Err(e) => {
                        debug!("No last seen timestamp for {}: {}", info.name, e);
                        LastSeen::Never
                    }
                };
                Node::new(&info.name, status, last_seen)
            };
            self.mirror.insert(node);
        }
        info!("Initial sync found {} nodes", self.mirror.nodes.len());
        Ok(())
    }

    async fn apply(&mut self, event: ClusterEvent) {
        match event {
            ClusterEvent::NodeStatusChanged { node, status } => {
                let (last_seen, units) = if status == NodeStatus::Online {
                    match self.cluster.list_units_on(&node).await {
                        Ok(units) => (LastSeen::Now, Some(units)),
                        Err(e) => {
                            self.list_units_failed(&node, e);
                            return;
                        }
                    }
                } else {
                    (LastSeen::Absolute(Utc::now()), None)
                };

                let entry = self
                    .mirror
                    .node_entry(&node, || Node::new(&node, status, last_seen));
                entry.status = status;
                entry.last_seen = last_seen;
                if let Some(units) = units {
                    entry.replace_services(units.into_iter().map(service_unit));
                }
                info!("Node {} is {}, publishing right away", node, status);
                self.publish().await;
            }
            ClusterEvent::UnitStateChanged {
                node,
                unit,
                active_state,
                sub_state,
            } => {
                debug!(
                    "Unit {} on {} is {}/{}",
                    unit, node, active_state, sub_state
                );
                // A unit event implies the node is reachable.
                self.mirror
                    .node_entry(&node, || Node::new(&node, NodeStatus::Online, LastSeen::Now))
                    .upsert_service(&unit, &active_state, &sub_state);

                if self.debounce_elapsed() {
                    self.publish().await;
                }
            }
        }
    }

    fn debounce_elapsed(&self) -> bool {
        self.last_publish
            .map_or(true, |at| at.elapsed() >= self.min_update_interval)
    }

    /// Publishes the mirror and clears it, whether or not the broker
    /// accepted the update.
    async fn publish(&mut self) {
        if self.mirror.is_empty() {
            return;
        }
        let update = self.mirror.to_update(&self.device_id);
        match serde_json::to_vec(&update) {
            Ok(payload) => {
                debug!("Publishing update: {}", String::from_utf8_lossy(&payload));
                match self.broker.publish(&self.update_topic, payload).await {
                    Ok(()) => {
                        let now = Instant::now();
                        self.last_publish = Some(now);
                        self.next_flush = now + self.min_update_interval;
                    }
                    Err(e) => {
                        error!("Failed to publish device update: {}", e);
                        self.report(SyncFailure::Publish(e.to_string()));
                    }
                }
            }
            Err(e) => {
                error!("Failed to encode device update: {}", e);
                self.report(SyncFailure::Encode(e.to_string()));
            }
        }
        self.mirror.clear();
    }

    fn list_units_failed(&self, node: &str, err: ClusterError) {
        warn!("Failed to list units on '{}': {}. Skipping...", node, err);
        self.report(SyncFailure::ListUnits {
            node: node.to_string(),
            reason: err.to_string(),
        });
    }

    fn report(&self, failure: SyncFailure) {
        let _ = self.failures.send(failure);
    }
}

fn service_unit(unit: UnitInfo) -> ServiceUnit {
    ServiceUnit {
        name: unit.name,
        state: unit.active_state,
        substate: unit.sub_state,
    }
}
