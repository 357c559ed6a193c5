#![forbid(unsafe_code)]

// Relay module - connection directory for addressed signal forwarding

use crate::signaling::protocol::ServerMessage;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Directory of live connections keyed by connection ID.
///
/// Offers, answers and ICE candidates are addressed to a single connection
/// rather than a room, so the relay keeps its own index of outbound senders.
/// Delivery is best-effort: a missing, full or closed target costs the
/// message, never the sender's session.
#[derive(Default)]
pub struct ConnectionTable {
    inner: StdRwLock<HashMap<String, mpsc::Sender<Arc<String>>>>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, connection_id: &str, sender: mpsc::Sender<Arc<String>>) {
        let mut table = self.inner.write().unwrap_or_else(|e| e.into_inner());
        table.insert(connection_id.to_string(), sender);
    }

    pub fn deregister(&self, connection_id: &str) {
        let mut table = self.inner.write().unwrap_or_else(|e| e.into_inner());
        table.remove(connection_id);
    }

    /// Forward one message to one connection. Returns whether it was queued.
    pub fn send_to(&self, connection_id: &str, message: &ServerMessage) -> bool {
        let sender = {
            let table = self.inner.read().unwrap_or_else(|e| e.into_inner());
            table.get(connection_id).cloned()
        };
        let Some(sender) = sender else {
            debug!("Signal target {} not connected, dropping", connection_id);
            return false;
        };

        let json = match serde_json::to_string(message) {
            Ok(json) => Arc::new(json),
            Err(e) => {
                warn!("Failed to serialize signal for {}: {}", connection_id, e);
                return false;
            }
        };
        match sender.try_send(json) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Channel full for {}, dropping signal", connection_id);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Channel closed for {} (disconnected)", connection_id);
                false
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
