//! Routing of cluster signals to handlers.
//!
//! The router owns the single consumer of the monitor subscription.
//! Signals are dispatched one at a time in arrival order and every handler
//! is awaited before the next signal is read, so handlers never run
//! concurrently with each other.

use std::fmt;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;

use crate::cluster::{ClusterClient, Signal, Subscription, SIGNAL_PROPERTIES_CHANGED};
use crate::error::RouterError;

#[async_trait]
pub trait SignalHandler: Send + Sync {
    async fn handle(&self, signal: &Signal);
}

/// What a handler is registered for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchKey {
    /// Exact signal name, emitted from the monitor's own object path.
    Signal(String),
    /// `PropertiesChanged` on any object path starting with the prefix.
    PathPrefix(String),
}

impl MatchKey {
    fn matches(&self, signal: &Signal, monitor_path: &str) -> bool {
        match self {
            MatchKey::Signal(name) => signal.name == *name && signal.path == monitor_path,
            MatchKey::PathPrefix(prefix) => {
                signal.path.starts_with(prefix.as_str()) && signal.name == SIGNAL_PROPERTIES_CHANGED
            }
        }
    }
}

impl fmt::Display for MatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchKey::Signal(name) => write!(f, "signal {}", name),
            MatchKey::PathPrefix(prefix) => write!(f, "path prefix {}", prefix),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterState {
    Created,
    Subscribed,
    Running,
    Closed,
}

pub struct EventRouter {
    handlers: Vec<(MatchKey, Box<dyn SignalHandler>)>,
    subscription: Option<Subscription>,
    state: RouterState,
}

impl Default for EventRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl EventRouter {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
            subscription: None,
            state: RouterState::Created,
        }
    }

    pub fn state(&self) -> RouterState {
        self.state
    }

    /// Registers `handler` for `key`. A key can only be registered once.
    pub fn register(
        &mut self,
        key: MatchKey,
        handler: impl SignalHandler + 'static,
    ) -> Result<(), RouterError> {
        if matches!(self.state, RouterState::Running | RouterState::Closed) {
            return Err(RouterError::AlreadyRunning);
        }
        if self.handlers.iter().any(|(k, _)| *k == key) {
            return Err(RouterError::DuplicateHandler(key.to_string()));
        }
        debug!("Registered handler for {}", key);
        self.handlers.push((key, Box::new(handler)));
        Ok(())
    }

    /// Creates the server-side subscription.
    pub async fn subscribe<C>(&mut self, client: &C) -> Result<u32, RouterError>
    where
        C: ClusterClient + ?Sized,
    {
        if self.state != RouterState::Created {
            return Err(RouterError::AlreadySubscribed);
        }
        let subscription = client.subscribe().await?;
        let id = subscription.id;
        self.subscription = Some(subscription);
        self.state = RouterState::Subscribed;
        Ok(id)
    }

    /// Dispatches signals until the subscription closes or `cancel` fires.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<(), RouterError> {
        let Subscription {
            id,
            monitor_path,
            mut signals,
        } = self.subscription.take().ok_or(RouterError::NotSubscribed)?;
        self.state = RouterState::Running;
        info!("Dispatching signals of subscription {} ({})", id, monitor_path);

        loop {
            let signal = tokio::select! {
                _ = cancel.cancelled() => break,
                signal = signals.recv() => match signal {
                    Some(signal) => signal,
                    None => {
                        info!("Cluster signal channel closed");
                        break;
                    }
                },
            };
            self.dispatch(&signal, &monitor_path).await;
        }

        self.state = RouterState::Closed;
        Ok(())
    }

    /// Hands `signal` to the first matching handler. Returns whether one
    /// matched.
    pub async fn dispatch(&self, signal: &Signal, monitor_path: &str) -> bool {
        match self
            .handlers
            .iter()
            .find(|(key, _)| key.matches(signal, monitor_path))
        {
            Some((key, handler)) => {
                debug!("Routing {} at {} to {}", signal.name, signal.path, key);
                handler.handle(signal).await;
                true
            }
            None => {
                warn!("Unexpected signal: {} at {}", signal.name, signal.path);
                false
            }
        }
    }
}
