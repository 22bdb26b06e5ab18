//! In-memory mirror of node and service-unit state.
//!
//! The mirror is a diff accumulator: after the initial full sync it only
//! holds what changed since the last publish and is cleared after every
//! publish attempt.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::types::{DeviceUpdate, NodeUpdate, Workload};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Online,
    Offline,
    Unknown,
}

impl NodeStatus {
    /// Parses a status as reported by the cluster manager. Anything other
    /// than `online`/`offline` is `Unknown`.
    pub fn parse(raw: &str) -> Self {
        match raw {
            "online" => NodeStatus::Online,
            "offline" => NodeStatus::Offline,
            _ => NodeStatus::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Online => "online",
            NodeStatus::Offline => "offline",
            NodeStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// When a node was last seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LastSeen {
    /// The node is connected right now.
    Now,
    Absolute(DateTime<Utc>),
    /// The cluster manager has no record of the node ever connecting.
    Never,
}

impl LastSeen {
    /// Wire representation: `"now"`, `"never"` or an RFC3339 timestamp.
    pub fn to_wire(&self) -> String {
        match self {
            LastSeen::Now => "now".to_string(),
            LastSeen::Never => "never".to_string(),
            LastSeen::Absolute(ts) => ts.to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceUnit {
    pub name: String,
    pub state: String,
    pub substate: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub name: String,
    pub status: NodeStatus,
    pub last_seen: LastSeen,
    pub services: BTreeMap<String, ServiceUnit>,
}

impl Node {
    pub fn new(name: impl Into<String>, status: NodeStatus, last_seen: LastSeen) -> Self {
        Self {
            name: name.into(),
            status,
            last_seen,
            services: BTreeMap::new(),
        }
    }

    /// Inserts or overwrites the state of a single unit.
    pub fn upsert_service(&mut self, name: &str, state: &str, substate: &str) {
        let service = self
            .services
            .entry(name.to_string())
            .or_insert_with(|| ServiceUnit {
                name: name.to_string(),
                state: String::new(),
                substate: String::new(),
            });
        service.state = state.to_string();
        service.substate = substate.to_string();
    }

    /// Replaces the whole service map with a fresh enumeration.
    pub fn replace_services(&mut self, services: impl IntoIterator<Item = ServiceUnit>) {
        self.services = services
            .into_iter()
            .map(|s| (s.name.clone(), s))
            .collect();
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ClusterMirror {
    pub nodes: BTreeMap<String, Node>,
}

impl ClusterMirror {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn insert(&mut self, node: Node) {
        self.nodes.insert(node.name.clone(), node);
    }

    /// Returns the node entry, creating it with `default` if absent.
    pub fn node_entry(&mut self, name: &str, default: impl FnOnce() -> Node) -> &mut Node {
        self.nodes.entry(name.to_string()).or_insert_with(default)
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
    }

    /// Builds the update message for everything currently in the mirror.
    pub fn to_update(&self, device_id: &str) -> DeviceUpdate {
        DeviceUpdate {
            id: device_id.to_string(),
            nodes: self
                .nodes
                .values()
                .map(|node| NodeUpdate {
                    name: node.name.clone(),
                    status: node.status.as_str().to_string(),
                    last_seen_timestamp: node.last_seen.to_wire(),
                    workloads: node
                        .services
                        .values()
                        .map(|s| Workload {
                            name: s.name.clone(),
                            state: s.state.clone(),
                            substate: s.substate.clone(),
                        })
                        .collect(),
                })
                .collect(),
        }
    }
}
