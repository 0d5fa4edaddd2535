//! Individual client connection handling

use crate::transport::{CallerAddress, EndpointError};
use bytes::Bytes;
use cmdbroker_shared::codec::FrameDecoder;
use std::net::SocketAddr;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Frames queued for a single peer before `send` reports it as backlogged
const OUTBOUND_QUEUE: usize = 64;

/// Handle to send frames to a specific client
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub caller: CallerAddress,
    pub addr: SocketAddr,
    pub connected_at: Instant,
    outbound: mpsc::Sender<Bytes>,
}

impl SessionHandle {
    /// Queue an already-framed buffer for this client without waiting
    pub fn send(&self, frame: Bytes) -> Result<(), EndpointError> {
        self.outbound.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => EndpointError::Backlogged(self.caller),
            mpsc::error::TrySendError::Closed(_) => EndpointError::Disconnected(self.caller),
        })
    }
}

/// Read side of an active client connection
///
/// Writes go through the [`SessionHandle`], which feeds a dedicated writer
/// task so a slow peer never stalls whoever is sending to it.
pub struct ClientSession {
    handle: SessionHandle,
    reader: OwnedReadHalf,
    decoder: FrameDecoder,
    read_buf: Vec<u8>,
}

impl ClientSession {
    /// Wrap an accepted stream and start its writer task
    pub fn start(stream: TcpStream, addr: SocketAddr, caller: CallerAddress, max_frame_size: u32) -> Self {
        let (reader, writer) = stream.into_split();
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);

        tokio::spawn(write_loop(writer, outbound_rx, caller));

        Self {
            handle: SessionHandle {
                caller,
                addr,
                connected_at: Instant::now(),
                outbound,
            },
            reader,
            decoder: FrameDecoder::with_max_len(max_frame_size),
            read_buf: vec![0u8; 4096],
        }
    }

    /// Get a cloneable handle for sending frames
    pub fn get_handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    /// Read the next request payload from this client
    /// Returns None if the connection is closed or the framing is broken
    pub async fn recv(&mut self) -> Option<Bytes> {
        loop {
            match self.decoder.decode_next() {
                Ok(Some(payload)) => return Some(payload),
                Ok(None) => {
                    // Need more data
                }
                Err(e) => {
                    warn!(caller = %self.handle.caller, addr = %self.handle.addr, error = %e, "Frame decode error, closing connection");
                    return None;
                }
            }

            match self.reader.read(&mut self.read_buf).await {
                Ok(0) => return None,
                Ok(n) => self.decoder.extend(&self.read_buf[..n]),
                Err(e) => {
                    debug!(caller = %self.handle.caller, error = %e, "Read error");
                    return None;
                }
            }
        }
    }

    pub fn caller(&self) -> CallerAddress {
        self.handle.caller
    }

    pub fn addr(&self) -> SocketAddr {
        self.handle.addr
    }
}

async fn write_loop(mut writer: OwnedWriteHalf, mut outbound: mpsc::Receiver<Bytes>, caller: CallerAddress) {
    while let Some(frame) = outbound.recv().await {
        if let Err(e) = writer.write_all(&frame).await {
            warn!(caller = %caller, error = %e, "Write failed, dropping connection");
            return;
        }
    }
    let _ = writer.shutdown().await;
}
