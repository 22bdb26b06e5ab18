use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::error::ClusterError;

pub mod bluechi;
pub mod event;
pub use bluechi::BlueChiClient;

/// Object path prefix of every node object; the node name follows it.
pub const NODE_PATH_PREFIX: &str = "/org/eclipse/bluechi/node/";
pub const NODE_INTERFACE: &str = "org.eclipse.bluechi.Node";
pub const MONITOR_INTERFACE: &str = "org.eclipse.bluechi.Monitor";
pub const SIGNAL_UNIT_STATE_CHANGED: &str = "org.eclipse.bluechi.Monitor.UnitStateChanged";
pub const SIGNAL_PROPERTIES_CHANGED: &str = "org.freedesktop.DBus.Properties.PropertiesChanged";

/// A node as returned by [`ClusterClient::list_nodes`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub name: String,
    /// Opaque object path used for per-node lookups.
    pub path: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitInfo {
    pub name: String,
    pub active_state: String,
    pub sub_state: String,
}

/// A changed property value, reduced to what the bridge inspects.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Text(String),
    Number(u64),
    Other(String),
}

/// Signal body, decoded once by the client.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalPayload {
    PropertiesChanged {
        interface: String,
        changed: HashMap<String, PropertyValue>,
    },
    UnitStateChanged {
        node: String,
        unit: String,
        active_state: String,
        sub_state: String,
    },
    /// The body did not match the layout expected for the signal name.
    Malformed(String),
}

impl SignalPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            SignalPayload::PropertiesChanged { .. } => "PropertiesChanged",
            SignalPayload::UnitStateChanged { .. } => "UnitStateChanged",
            SignalPayload::Malformed(_) => "malformed",
        }
    }
}

/// One asynchronous event from the cluster manager.
#[derive(Debug, Clone, PartialEq)]
pub struct Signal {
    /// Fully qualified name, `interface.member`.
    pub name: String,
    pub path: String,
    pub payload: SignalPayload,
}

/// A live server-side monitor subscription.
#[derive(Debug)]
pub struct Subscription {
    pub id: u32,
    /// Object path of the monitor; unit signals are emitted from here.
    pub monitor_path: String,
    pub signals: mpsc::Receiver<Signal>,
}

#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn list_nodes(&self) -> Result<Vec<NodeInfo>, ClusterError>;

    async fn list_units_on(&self, node: &str) -> Result<Vec<UnitInfo>, ClusterError>;

    /// Fails if the node has no recorded timestamp.
    async fn last_seen_timestamp(&self, node_path: &str) -> Result<DateTime<Utc>, ClusterError>;

    /// Creates a monitor subscribed to all nodes and units and starts
    /// forwarding its signals.
    async fn subscribe(&self) -> Result<Subscription, ClusterError>;
}
