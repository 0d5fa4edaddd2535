//! Request/reply client for the broker
//!
//! One connection carries one request at a time: a frame goes out and the
//! next frame back is its result.

use crate::transport::{TcpConnector, TransportConnector, TransportStream};
use anyhow::{anyhow, bail, Context, Result};
use bytes::Bytes;
use cmdbroker_shared::codec::{self, FrameDecoder};
use cmdbroker_shared::{limits, CommandRequest, CommandResult};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

/// Client connection settings
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Broker address, `host:port`
    pub server: String,
    pub connect_timeout: Duration,
    /// How long to wait for a reply; longer than the server's command timeout
    pub reply_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: format!("127.0.0.1:{}", limits::DEFAULT_PORT),
            connect_timeout: Duration::from_secs(5),
            reply_timeout: limits::DEFAULT_REPLY_TIMEOUT,
        }
    }
}

pub struct Client<S: TransportStream = TcpStream> {
    stream: S,
    decoder: FrameDecoder,
    read_buf: Vec<u8>,
    reply_timeout: Duration,
    target: String,
}

impl Client {
    /// Connect over TCP
    pub async fn connect(config: &ClientConfig) -> Result<Self> {
        let connector = TcpConnector::new(config.server.clone(), config.connect_timeout);
        Self::connect_with(&connector, config.reply_timeout).await
    }
}

impl<S: TransportStream> Client<S> {
    pub async fn connect_with<C>(connector: &C, reply_timeout: Duration) -> Result<Self>
    where
        C: TransportConnector<Stream = S>,
    {
        let stream = connector.connect().await?;
        debug!("Connected to {}", connector.target());
        Ok(Self {
            stream,
            decoder: FrameDecoder::new(),
            read_buf: vec![0u8; 4096],
            reply_timeout,
            target: connector.target().to_string(),
        })
    }

    /// Send a request and wait for its result
    pub async fn send_command(&mut self, request: &CommandRequest) -> Result<CommandResult> {
        let payload = serde_json::to_vec(request)?;
        self.send_raw(&payload).await
    }

    /// Send an arbitrary payload, valid JSON or not, and wait for the result
    pub async fn send_raw(&mut self, payload: &[u8]) -> Result<CommandResult> {
        let frame = codec::encode(payload)?;
        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;

        let reply = tokio::time::timeout(self.reply_timeout, self.read_frame())
            .await
            .map_err(|_| anyhow!("No reply from {} within {:?}", self.target, self.reply_timeout))??;

        serde_json::from_slice(&reply).context("Malformed reply from server")
    }

    async fn read_frame(&mut self) -> Result<Bytes> {
        loop {
            if let Some(frame) = self.decoder.decode_next()? {
                return Ok(frame);
            }
            let n = self.stream.read(&mut self.read_buf).await?;
            if n == 0 {
                bail!("Server {} closed the connection", self.target);
            }
            self.decoder.extend(&self.read_buf[..n]);
        }
    }

    pub async fn close(mut self) -> Result<()> {
        TransportStream::shutdown(&mut self.stream).await
    }
}
