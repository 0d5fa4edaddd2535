//! TCP router socket
//!
//! Accepts any number of client connections and merges their request frames
//! into one inbound queue. Each connection is assigned a fresh
//! [`CallerAddress`]; replies are framed and routed back to the session that
//! owns that address.

use super::{CallerAddress, Endpoint, EndpointError, RoutedFrame};
use crate::session::{ClientSession, SessionManager};
use async_trait::async_trait;
use cmdbroker_shared::codec;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Frames buffered between connection readers and the dispatcher
const INBOUND_QUEUE: usize = 1024;

pub struct RouterSocket {
    local_addr: SocketAddr,
    inbound: mpsc::Receiver<RoutedFrame>,
    sessions: Arc<SessionManager>,
    accept_task: Option<JoinHandle<()>>,
}

impl RouterSocket {
    /// Bind the listener and start accepting connections
    pub async fn bind(addr: impl ToSocketAddrs, max_frame_size: u32) -> Result<Self, EndpointError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (inbound_tx, inbound) = mpsc::channel(INBOUND_QUEUE);
        let sessions = Arc::new(SessionManager::new());

        let accept_task = tokio::spawn(accept_loop(
            listener,
            sessions.clone(),
            inbound_tx,
            max_frame_size,
        ));

        Ok(Self {
            local_addr,
            inbound,
            sessions,
            accept_task: Some(accept_task),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of currently connected clients
    #[cfg(test)]
    pub async fn connected(&self) -> usize {
        self.sessions.count().await
    }
}

#[async_trait]
impl Endpoint for RouterSocket {
    async fn receive(&mut self) -> Option<RoutedFrame> {
        self.inbound.recv().await
    }

    async fn send(&mut self, frame: RoutedFrame) -> Result<(), EndpointError> {
        let encoded = codec::encode(&frame.payload)?;
        self.sessions.send_to(frame.caller, encoded).await
    }

    async fn stop_receiving(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
        self.inbound.close();
    }

    async fn close(&mut self) {
        self.stop_receiving().await;
        let dropped = self.sessions.clear().await;
        info!(addr = %self.local_addr, sessions = dropped, "Router socket closed");
    }
}

impl Drop for RouterSocket {
    fn drop(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    sessions: Arc<SessionManager>,
    inbound: mpsc::Sender<RoutedFrame>,
    max_frame_size: u32,
) {
    let next_caller = AtomicU64::new(0);

    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                // Typically EMFILE; keep serving the connections we have
                warn!(error = %e, "Accept failed");
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                continue;
            }
        };

        let caller = CallerAddress::new(next_caller.fetch_add(1, Ordering::SeqCst) + 1);
        let session = ClientSession::start(stream, addr, caller, max_frame_size);
        sessions.register(session.get_handle()).await;
        let connected = sessions.count().await;
        debug!(caller = %caller, addr = %addr, sessions = connected, "Client connected");

        tokio::spawn(serve_connection(session, sessions.clone(), inbound.clone()));
    }
}

async fn serve_connection(
    mut session: ClientSession,
    sessions: Arc<SessionManager>,
    inbound: mpsc::Sender<RoutedFrame>,
) {
    let caller = session.caller();

    while let Some(payload) = session.recv().await {
        if inbound.send(RoutedFrame { caller, payload }).await.is_err() {
            // Dispatcher is gone
            break;
        }
    }

    if let Some(handle) = sessions.unregister(caller).await {
        debug!(
            caller = %caller,
            addr = %session.addr(),
            connected_ms = handle.connected_at.elapsed().as_millis() as u64,
            "Client disconnected"
        );
    }
}
