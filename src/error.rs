//! Error types for the bridge and its collaborators.

use thiserror::Error;

/// Errors reported by a [`ClusterClient`](crate::cluster::ClusterClient).
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unexpected reply: {0}")]
    InvalidReply(String),
}

impl From<zbus::Error> for ClusterError {
    fn from(err: zbus::Error) -> Self {
        ClusterError::Transport(err.to_string())
    }
}

/// Errors reported by a [`MessageBroker`](crate::broker::MessageBroker).
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker transport error: {0}")]
    Transport(String),

    #[error("broker connection closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("duplicate handler for {0}")]
    DuplicateHandler(String),

    #[error("router already subscribed")]
    AlreadySubscribed,

    #[error("router has no subscription")]
    NotSubscribed,

    #[error("handlers can only be registered before the router runs")]
    AlreadyRunning,

    #[error("failed to subscribe to cluster events: {0}")]
    Subscribe(#[from] ClusterError),
}

/// A signal payload that does not have the shape its handler expects.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("expected {expected} payload, got {actual}")]
    UnexpectedPayload {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("property '{0}' is not a string")]
    NotText(String),

    #[error("malformed payload: {0}")]
    Malformed(String),
}

/// Errors that end [`Bridge::start`](crate::bridge::Bridge::start).
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode registration acknowledgment: {0}")]
    AckDecode(#[source] serde_json::Error),

    #[error("registration rejected with result '{0}'")]
    Rejected(String),

    #[error("registration acknowledgment channel closed")]
    AckChannelClosed,

    #[error("initial sync failed: {0}")]
    InitialSync(#[source] ClusterError),

    #[error("event router error: {0}")]
    Router(#[from] RouterError),

    #[error("cluster event stream closed")]
    EventStreamClosed,

    #[error("bridge task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// A recoverable failure, reported on [`Bridge::failures`](crate::bridge::Bridge::failures)
/// after being logged. Nothing is retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncFailure {
    #[error("dropped {signal} signal: {source}")]
    Decode {
        signal: String,
        #[source]
        source: DecodeError,
    },

    #[error("failed to list units on node '{node}': {reason}")]
    ListUnits { node: String, reason: String },

    #[error("failed to encode update: {0}")]
    Encode(String),

    #[error("failed to publish update: {0}")]
    Publish(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_human_readable() {
        let err = RouterError::DuplicateHandler("signal X".into());
        assert_eq!(err.to_string(), "duplicate handler for signal X");

        let err = BridgeError::Rejected("failure".into());
        assert_eq!(err.to_string(), "registration rejected with result 'failure'");

        let err = SyncFailure::ListUnits {
            node: "n1".into(),
            reason: "timeout".into(),
        };
        assert_eq!(err.to_string(), "failed to list units on node 'n1': timeout");
    }

    #[test]
    fn cluster_error_converts_into_router_error() {
        let err: RouterError = ClusterError::Transport("bus gone".into()).into();
        assert!(matches!(err, RouterError::Subscribe(_)));
        assert!(err.to_string().contains("bus gone"));
    }
}
