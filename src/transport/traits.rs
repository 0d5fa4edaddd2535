//! Transport abstraction for reaching the broker

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

/// A byte stream to the broker
#[async_trait]
pub trait TransportStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    /// Close the stream gracefully
    async fn shutdown(&mut self) -> Result<()>;
}

/// Factory for broker connections
#[async_trait]
pub trait TransportConnector: Send + Sync {
    type Stream: TransportStream;

    async fn connect(&self) -> Result<Self::Stream>;

    /// Where this connector points, for logs and errors
    fn target(&self) -> &str;
}
