use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use log::{debug, error, info};
use tokio::sync::mpsc;
use zbus::message::Type as MessageType;
use zbus::zvariant::{DynamicType, OwnedObjectPath, OwnedValue, Value};
use zbus::{Connection, MatchRule, Message, MessageStream};

use super::{
    ClusterClient, NodeInfo, PropertyValue, Signal, SignalPayload, Subscription, UnitInfo,
    MONITOR_INTERFACE, NODE_INTERFACE, NODE_PATH_PREFIX,
};
use crate::error::ClusterError;

const BLUECHI_SERVICE: &str = "org.eclipse.bluechi";
const CONTROLLER_PATH: &str = "/org/eclipse/bluechi";
const CONTROLLER_INTERFACE: &str = "org.eclipse.bluechi.Controller";
const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";

/// Signals buffered between the bus and the router.
const SIGNAL_BUFFER: usize = 64;

// ListUnits reply: name, description, load, active, sub, following,
// unit path, job id, job type, job path.
type UnitRecord = (
    String,
    String,
    String,
    String,
    String,
    String,
    OwnedObjectPath,
    u32,
    String,
    OwnedObjectPath,
);

/// BlueChi controller client on the D-Bus system bus.
pub struct BlueChiClient {
    conn: Connection,
}

impl BlueChiClient {
    pub async fn connect() -> Result<Self, ClusterError> {
        let conn = Connection::system().await?;
        info!("Connected to system bus");
        Ok(Self { conn })
    }

    async fn call<B>(
        &self,
        path: &str,
        interface: &str,
        method: &str,
        body: &B,
    ) -> Result<Message, ClusterError>
    where
        B: serde::Serialize + DynamicType,
    {
        self.conn
            .call_method(Some(BLUECHI_SERVICE), path, Some(interface), method, body)
            .await
            .map_err(|e| ClusterError::Transport(format!("{}.{} on {}: {}", interface, method, path, e)))
    }
}

#[async_trait]
impl ClusterClient for BlueChiClient {
    async fn list_nodes(&self) -> Result<Vec<NodeInfo>, ClusterError> {
        let reply = self
            .call(CONTROLLER_PATH, CONTROLLER_INTERFACE, "ListNodes", &())
            .await?;
        let body = reply.body();

        // Newer controllers append the peer IP to every entry.
        if let Ok(nodes) = body.deserialize::<Vec<(String, OwnedObjectPath, String, String)>>() {
            return Ok(nodes
                .into_iter()
                .map(|(name, path, status, _)| NodeInfo {
                    name,
                    path: path.as_str().to_string(),
                    status,
                })
                .collect());
        }
        let nodes = body
            .deserialize::<Vec<(String, OwnedObjectPath, String)>>()
            .map_err(|e| ClusterError::InvalidReply(format!("ListNodes: {}", e)))?;
        Ok(nodes
            .into_iter()
            .map(|(name, path, status)| NodeInfo {
                name,
                path: path.as_str().to_string(),
                status,
            })
            .collect())
    }

    async fn list_units_on(&self, node: &str) -> Result<Vec<UnitInfo>, ClusterError> {
        let path = format!("{}{}", NODE_PATH_PREFIX, node);
        let reply = self.call(&path, NODE_INTERFACE, "ListUnits", &()).await?;
        let units = reply
            .body()
            .deserialize::<Vec<UnitRecord>>()
            .map_err(|e| ClusterError::InvalidReply(format!("ListUnits on '{}': {}", node, e)))?;

        Ok(units
            .into_iter()
            .map(|unit| UnitInfo {
                name: unit.0,
                active_state: unit.3,
                sub_state: unit.4,
            })
            .collect())
    }

    async fn last_seen_timestamp(&self, node_path: &str) -> Result<DateTime<Utc>, ClusterError> {
        let reply = self
            .call(
                node_path,
                PROPERTIES_INTERFACE,
                "Get",
                &(NODE_INTERFACE, "LastSeenTimestamp"),
            )
            .await?;
        let body = reply.body();
        let value: Value<'_> = body
            .deserialize()
            .map_err(|e| ClusterError::InvalidReply(format!("LastSeenTimestamp: {}", e)))?;

        let secs = match value {
            Value::U64(secs) => secs,
            other => {
                return Err(ClusterError::InvalidReply(format!(
                    "LastSeenTimestamp is not a u64: {:?}",
                    other
                )))
            }
        };
        if secs == 0 {
            return Err(ClusterError::NotFound(format!(
                "no last seen timestamp for '{}'",
                node_path
            )));
        }
        i64::try_from(secs)
            .ok()
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .ok_or_else(|| ClusterError::InvalidReply(format!("timestamp {} out of range", secs)))
    }

    async fn subscribe(&self) -> Result<Subscription, ClusterError> {
        let reply = self
            .call(CONTROLLER_PATH, CONTROLLER_INTERFACE, "CreateMonitor", &())
            .await?;
        let monitor_path: OwnedObjectPath = reply
            .body()
            .deserialize()
            .map_err(|e| ClusterError::InvalidReply(format!("CreateMonitor: {}", e)))?;
        let monitor_path = monitor_path.as_str().to_string();

        let unit_rule = MatchRule::builder()
            .msg_type(MessageType::Signal)
            .interface(MONITOR_INTERFACE)?
            .path(monitor_path.as_str())?
            .build();
        let props_rule = MatchRule::builder()
            .msg_type(MessageType::Signal)
            .interface(PROPERTIES_INTERFACE)?
            .member("PropertiesChanged")?
            .path_namespace(CONTROLLER_PATH)?
            .build();
        let unit_stream =
            MessageStream::for_match_rule(unit_rule, &self.conn, Some(SIGNAL_BUFFER)).await?;
        let props_stream =
            MessageStream::for_match_rule(props_rule, &self.conn, Some(SIGNAL_BUFFER)).await?;

        // Match rules are in place before subscribing so no early signal is lost.
        let reply = self
            .call(&monitor_path, MONITOR_INTERFACE, "Subscribe", &("*", "*"))
            .await?;
        let id: u32 = reply
            .body()
            .deserialize()
            .map_err(|e| ClusterError::InvalidReply(format!("Subscribe: {}", e)))?;
        info!("Created monitor {} with subscription {}", monitor_path, id);

        let (tx, rx) = mpsc::channel(SIGNAL_BUFFER);
        tokio::spawn(async move {
            let mut messages = Box::pin(stream::select(unit_stream, props_stream));
            loop {
                let msg = tokio::select! {
                    _ = tx.closed() => break,
                    msg = messages.next() => msg,
                };
                let msg = match msg {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        error!("Error in BlueChi signal stream: {}", e);
                        continue;
                    }
                    None => break,
                };
                if let Some(signal) = to_signal(&msg) {
                    if tx.send(signal).await.is_err() {
                        break;
                    }
                }
            }
            debug!("BlueChi signal forwarding stopped");
        });

        Ok(Subscription {
            id,
            monitor_path,
            signals: rx,
        })
    }
}

fn to_signal(msg: &Message) -> Option<Signal> {
    let header = msg.header();
    let interface = header.interface()?;
    let member = header.member()?;
    let path = header.path()?;
    let body = msg.body();

    let payload = match member.as_str() {
        "UnitStateChanged" => match body.deserialize::<(String, String, String, String, String)>() {
            Ok((node, unit, active_state, sub_state, _reason)) => SignalPayload::UnitStateChanged {
                node,
                unit,
                active_state,
                sub_state,
            },
            Err(e) => SignalPayload::Malformed(e.to_string()),
        },
        "PropertiesChanged" => {
            match body.deserialize::<(String, HashMap<String, OwnedValue>, Vec<String>)>() {
                Ok((interface, changed, _invalidated)) => SignalPayload::PropertiesChanged {
                    interface,
                    changed: changed
                        .iter()
                        .map(|(name, value)| (name.clone(), property_value(value)))
                        .collect(),
                },
                Err(e) => SignalPayload::Malformed(e.to_string()),
            }
        }
        other => SignalPayload::Malformed(format!("unsupported member '{}'", other)),
    };

    Some(Signal {
        name: format!("{}.{}", interface, member),
        path: path.as_str().to_string(),
        payload,
    })
}

fn property_value(value: &OwnedValue) -> PropertyValue {
    match &**value {
        Value::Str(s) => PropertyValue::Text(s.as_str().to_string()),
        Value::U64(n) => PropertyValue::Number(*n),
        Value::U32(n) => PropertyValue::Number(u64::from(*n)),
        other => PropertyValue::Other(format!("{:?}", other)),
    }
}
