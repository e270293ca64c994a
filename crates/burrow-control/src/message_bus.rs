//! Fan-out of protocol messages to connected agents
//!
//! Control-plane logic addresses agents by id and never cares which process
//! holds the live connection. [`LocalMessageBus`] covers the single-process
//! case by keeping one outbound channel per connected agent; a distributed
//! bus implements the same trait on top of pub/sub.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use burrow_proto::AgentMessage;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Deliver to one agent; `false` when that agent is not connected anywhere
    async fn publish(&self, agent_id: &str, message: AgentMessage) -> bool;

    /// Deliver to every connected agent, returning how many received it
    async fn broadcast(&self, message: AgentMessage) -> usize;

    /// Close an agent's live connection after its queued messages drain
    ///
    /// Returns `false` when the agent was not connected.
    async fn disconnect(&self, agent_id: &str) -> bool;
}

/// In-process bus backed by one unbounded channel per connected agent
pub struct LocalMessageBus {
    connections: Arc<RwLock<HashMap<String, mpsc::UnboundedSender<AgentMessage>>>>,
}

impl LocalMessageBus {
    pub fn new() -> Self {
        Self {
            connections: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a connected agent and return the receiving half of its outbox
    ///
    /// A second registration for the same agent replaces the first; the old
    /// receiver sees its channel close.
    pub async fn register(&self, agent_id: &str) -> mpsc::UnboundedReceiver<AgentMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        if self
            .connections
            .write()
            .await
            .insert(agent_id.to_string(), tx)
            .is_some()
        {
            debug!(agent_id, "Replaced existing agent connection");
        }
        rx
    }

    /// Drop an agent whose outbox receiver is gone
    ///
    /// A live channel belongs to a newer connection and is left in place.
    pub async fn unregister(&self, agent_id: &str) {
        let mut connections = self.connections.write().await;
        if connections.get(agent_id).is_some_and(|tx| tx.is_closed()) {
            connections.remove(agent_id);
        }
    }

    pub async fn is_connected(&self, agent_id: &str) -> bool {
        self.connections.read().await.contains_key(agent_id)
    }

    pub async fn connected_agents(&self) -> Vec<String> {
        self.connections.read().await.keys().cloned().collect()
    }
}

impl Default for LocalMessageBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBus for LocalMessageBus {
    async fn publish(&self, agent_id: &str, message: AgentMessage) -> bool {
        let sender = self.connections.read().await.get(agent_id).cloned();

        match sender {
            Some(tx) => {
                if tx.send(message).is_ok() {
                    true
                } else {
                    warn!(agent_id, "Agent outbox closed, dropping connection");
                    self.connections.write().await.remove(agent_id);
                    false
                }
            }
            None => {
                debug!(agent_id, message_type = %message.message_type, "Agent not connected");
                false
            }
        }
    }

    async fn broadcast(&self, message: AgentMessage) -> usize {
        let connections = self.connections.read().await;
        connections
            .values()
            .filter(|tx| tx.send(message.clone()).is_ok())
            .count()
    }

    async fn disconnect(&self, agent_id: &str) -> bool {
        // Dropping the sender ends the outbox once its buffer is drained
        let removed = self.connections.write().await.remove(agent_id).is_some();
        if removed {
            debug!(agent_id, "Disconnected agent");
        }
        removed
    }
}
