//! Session manager for tracking all connected clients

use super::connection::SessionHandle;
use crate::transport::{CallerAddress, EndpointError};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Manages all active client sessions
pub struct SessionManager {
    /// Map of caller address -> session handle
    sessions: Arc<RwLock<HashMap<CallerAddress, SessionHandle>>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a new client session
    pub async fn register(&self, handle: SessionHandle) {
        let mut sessions = self.sessions.write().await;
        sessions.insert(handle.caller, handle);
    }

    /// Unregister a client session
    pub async fn unregister(&self, caller: CallerAddress) -> Option<SessionHandle> {
        let mut sessions = self.sessions.write().await;
        sessions.remove(&caller)
    }

    /// Get a session handle for a specific client
    pub async fn get(&self, caller: CallerAddress) -> Option<SessionHandle> {
        let sessions = self.sessions.read().await;
        sessions.get(&caller).cloned()
    }

    /// Send a framed buffer to a specific client
    pub async fn send_to(&self, caller: CallerAddress, frame: Bytes) -> Result<(), EndpointError> {
        let handle = self
            .get(caller)
            .await
            .ok_or(EndpointError::UnknownCaller(caller))?;
        handle.send(frame)
    }

    /// Get list of all connected callers
    #[cfg(test)]
    pub async fn connected_callers(&self) -> Vec<CallerAddress> {
        let sessions = self.sessions.read().await;
        sessions.keys().copied().collect()
    }

    /// Drop every session; their writer tasks finish once the handles are gone
    pub async fn clear(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let count = sessions.len();
        sessions.clear();
        count
    }

    /// Get the number of connected clients
    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}
