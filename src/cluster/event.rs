//! Typed cluster events, decoded from routed [`Signal`]s by the bridge's
//! handlers.

use super::{PropertyValue, Signal, SignalPayload, NODE_INTERFACE, NODE_PATH_PREFIX};
use crate::error::DecodeError;
use crate::state::NodeStatus;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    NodeStatusChanged {
        node: String,
        status: NodeStatus,
    },
    UnitStateChanged {
        node: String,
        unit: String,
        active_state: String,
        sub_state: String,
    },
}

impl ClusterEvent {
    /// Decodes a node `PropertiesChanged` signal.
    ///
    /// Returns `Ok(None)` for changes on other interfaces or changes that
    /// do not touch `Status`.
    pub fn node_status(signal: &Signal) -> Result<Option<Self>, DecodeError> {
        let (interface, changed) = match &signal.payload {
            SignalPayload::PropertiesChanged { interface, changed } => (interface, changed),
            SignalPayload::Malformed(reason) => return Err(DecodeError::Malformed(reason.clone())),
            other => {
                return Err(DecodeError::UnexpectedPayload {
                    expected: "PropertiesChanged",
                    actual: other.kind(),
                })
            }
        };
        if interface != NODE_INTERFACE {
            return Ok(None);
        }
        let status = match changed.get("Status") {
            None => return Ok(None),
            Some(PropertyValue::Text(s)) => s.trim_matches('"'),
            Some(_) => return Err(DecodeError::NotText("Status".into())),
        };
        let node = signal
            .path
            .strip_prefix(NODE_PATH_PREFIX)
            .unwrap_or(&signal.path)
            .to_string();

        Ok(Some(ClusterEvent::NodeStatusChanged {
            node,
            status: NodeStatus::parse(status),
        }))
    }

    pub fn unit_state(signal: &Signal) -> Result<Self, DecodeError> {
        match &signal.payload {
            SignalPayload::UnitStateChanged {
                node,
                unit,
                active_state,
                sub_state,
            } => Ok(ClusterEvent::UnitStateChanged {
                node: node.clone(),
                unit: unit.clone(),
                active_state: active_state.clone(),
                sub_state: sub_state.clone(),
            }),
            SignalPayload::Malformed(reason) => Err(DecodeError::Malformed(reason.clone())),
            other => Err(DecodeError::UnexpectedPayload {
                expected: "UnitStateChanged",
                actual: other.kind(),
            }),
        }
    }
}
