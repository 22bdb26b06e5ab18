//! Wire messages exchanged with the broker-side backend.
//!
//! These types are serialised as JSON using [`serde`](https://serde.rs/).
//! Every field is omitted when empty so that diff updates stay small.

use serde::{Deserialize, Serialize};

/// Registration request published once on startup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegisterRequest {
    #[serde(rename = "device-id", default, skip_serializing_if = "String::is_empty")]
    pub device_id: String,
    #[serde(rename = "device-type", default, skip_serializing_if = "String::is_empty")]
    pub device_type: String,
}

/// Acknowledgment of a [`RegisterRequest`]. Only `"success"` lets the
/// bridge start tracking.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegisterResponse {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub result: String,
}

impl RegisterResponse {
    pub fn is_success(&self) -> bool {
        self.result == "success"
    }
}

/// A single service unit as reported to the backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Workload {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub state: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub substate: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeUpdate {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status: String,
    #[serde(
        rename = "lastSeenTimestamp",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub last_seen_timestamp: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub workloads: Vec<Workload>,
}

/// Diff update published to the device's update topic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceUpdate {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<NodeUpdate>,
}
