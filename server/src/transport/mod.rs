//! Multiplexed network endpoint
//!
//! The dispatcher sees a single stream of [`RoutedFrame`]s, each tagged with
//! the [`CallerAddress`] of the peer that sent it, and replies by handing a
//! frame with the same address back to [`Endpoint::send`].

#[cfg(test)]
pub mod memory;
mod router;

pub use router::RouterSocket;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Opaque routing token identifying one connected peer
///
/// Assigned by the endpoint; the dispatcher only copies it from a request to
/// the matching response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallerAddress(u64);

impl CallerAddress {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for CallerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "caller-{}", self.0)
    }
}

/// One unframed payload together with its routing address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutedFrame {
    pub caller: CallerAddress,
    pub payload: Bytes,
}

impl RoutedFrame {
    pub fn new(caller: CallerAddress, payload: impl Into<Bytes>) -> Self {
        Self {
            caller,
            payload: payload.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum EndpointError {
    #[error("No connected peer for {0}")]
    UnknownCaller(CallerAddress),

    #[error("Peer {0} disconnected")]
    Disconnected(CallerAddress),

    #[error("Outbound queue full for {0}")]
    Backlogged(CallerAddress),

    #[error("Codec error: {0}")]
    Codec(#[from] cmdbroker_shared::codec::CodecError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A network endpoint carrying frames from many logical peers
#[async_trait]
pub trait Endpoint: Send {
    /// Wait for the next inbound frame. `None` means the endpoint is closed.
    ///
    /// Must be cancel-safe: the dispatcher polls it inside `select!`.
    async fn receive(&mut self) -> Option<RoutedFrame>;

    /// Deliver a frame to the peer named by `frame.caller`
    async fn send(&mut self, frame: RoutedFrame) -> Result<(), EndpointError>;

    /// Stop taking new frames
    ///
    /// Frames already queued are still handed out by `receive`, which then
    /// returns `None` without waiting. Peers stay reachable through `send`.
    async fn stop_receiving(&mut self);

    /// Stop accepting peers and release network resources
    async fn close(&mut self);
}
