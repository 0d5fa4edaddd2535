//! In-memory endpoint used to drive the dispatcher in tests

use super::{CallerAddress, Endpoint, EndpointError, RoutedFrame};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Dispatcher-facing half
pub struct MemoryEndpoint {
    inbound: mpsc::UnboundedReceiver<RoutedFrame>,
    outbound: mpsc::UnboundedSender<RoutedFrame>,
    disconnected: Arc<Mutex<HashSet<CallerAddress>>>,
}

/// Test-facing half: plays every simulated caller at once
pub struct MemoryPeer {
    inbound: Option<mpsc::UnboundedSender<RoutedFrame>>,
    outbound: mpsc::UnboundedReceiver<RoutedFrame>,
    disconnected: Arc<Mutex<HashSet<CallerAddress>>>,
}

pub fn pair() -> (MemoryEndpoint, MemoryPeer) {
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let disconnected = Arc::new(Mutex::new(HashSet::new()));

    (
        MemoryEndpoint {
            inbound: inbound_rx,
            outbound: outbound_tx,
            disconnected: disconnected.clone(),
        },
        MemoryPeer {
            inbound: Some(inbound_tx),
            outbound: outbound_rx,
            disconnected,
        },
    )
}

#[async_trait]
impl Endpoint for MemoryEndpoint {
    async fn receive(&mut self) -> Option<RoutedFrame> {
        self.inbound.recv().await
    }

    async fn send(&mut self, frame: RoutedFrame) -> Result<(), EndpointError> {
        if self.disconnected.lock().unwrap().contains(&frame.caller) {
            return Err(EndpointError::Disconnected(frame.caller));
        }
        let caller = frame.caller;
        self.outbound
            .send(frame)
            .map_err(|_| EndpointError::Disconnected(caller))
    }

    async fn stop_receiving(&mut self) {
        self.inbound.close();
    }

    async fn close(&mut self) {
        self.inbound.close();
    }
}

impl MemoryPeer {
    /// Submit a raw payload as `caller`
    pub fn send(&self, caller: u64, payload: impl Into<Bytes>) {
        self.inbound
            .as_ref()
            .expect("peer already hung up")
            .send(RoutedFrame::new(CallerAddress::new(caller), payload))
            .expect("dispatcher stopped");
    }

    /// Submit a JSON request as `caller`
    pub fn send_json(&self, caller: u64, request: &serde_json::Value) {
        self.send(caller, serde_json::to_vec(request).unwrap());
    }

    /// Next response, parsed as JSON
    pub async fn recv(&mut self) -> (CallerAddress, serde_json::Value) {
        let frame = tokio::time::timeout(Duration::from_secs(10), self.outbound.recv())
            .await
            .expect("timed out waiting for a response")
            .expect("endpoint dropped");
        let value = serde_json::from_slice(&frame.payload).expect("response is JSON");
        (frame.caller, value)
    }

    /// Remaining response, if one is already queued
    pub fn try_recv(&mut self) -> Option<RoutedFrame> {
        self.outbound.try_recv().ok()
    }

    /// Make every later write to `caller` fail
    pub fn disconnect(&self, caller: u64) {
        self.disconnected
            .lock()
            .unwrap()
            .insert(CallerAddress::new(caller));
    }

    /// Close the inbound side; the dispatcher sees the endpoint as closed
    pub fn hang_up(&mut self) {
        self.inbound.take();
    }
}
