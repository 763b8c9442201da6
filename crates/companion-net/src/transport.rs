//! Transport seam: opens a link and moves opaque frames.
//!
//! The engine never interprets framing. It only sees whether a link could be
//! opened and the byte frames flowing over it. [`TcpTransport`] is the
//! production implementation using length-prefixed frames over TCP.

use std::io;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use crate::framing::{FrameConfig, FrameError, read_frame, write_frame};

/// Errors raised by a transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The endpoint actively refused the connection.
    #[error("connection refused by {address}")]
    Refused {
        address: String,
        #[source]
        source: io::Error,
    },

    /// Any other connection failure.
    #[error("failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: io::Error,
    },

    /// The link is closed.
    #[error("transport closed")]
    Closed,

    #[error(transparent)]
    Frame(#[from] FrameError),
}

impl TransportError {
    /// Whether the failure looks like "server unreachable".
    pub fn is_refusal(&self) -> bool {
        matches!(self, TransportError::Refused { .. })
    }
}

/// Outgoing half of an open link.
#[async_trait]
pub trait FrameSender: Send {
    async fn send(&mut self, frame: &[u8]) -> Result<(), TransportError>;
    async fn close(&mut self);
}

/// Incoming half of an open link. The frame sequence cannot be restarted.
#[async_trait]
pub trait FrameReceiver: Send {
    async fn receive(&mut self) -> Result<Vec<u8>, TransportError>;
}

/// Both halves of an open link.
pub struct TransportLink {
    pub sender: Box<dyn FrameSender>,
    pub receiver: Box<dyn FrameReceiver>,
}

/// Opens links to an address.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, address: &str) -> Result<TransportLink, TransportError>;
}

/// Length-prefixed frames over TCP.
#[derive(Debug, Clone, Default)]
pub struct TcpTransport {
    frame_config: FrameConfig,
}

impl TcpTransport {
    pub fn new(frame_config: FrameConfig) -> Self {
        Self { frame_config }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn open(&self, address: &str) -> Result<TransportLink, TransportError> {
        let stream = TcpStream::connect(address).await.map_err(|source| {
            if source.kind() == io::ErrorKind::ConnectionRefused {
                TransportError::Refused {
                    address: address.to_string(),
                    source,
                }
            } else {
                TransportError::Connect {
                    address: address.to_string(),
                    source,
                }
            }
        })?;
        stream.set_nodelay(true).map_err(FrameError::Io)?;

        let (reader, writer) = stream.into_split();
        Ok(TransportLink {
            sender: Box::new(TcpFrameSender {
                writer,
                config: self.frame_config.clone(),
            }),
            receiver: Box::new(TcpFrameReceiver {
                reader,
                config: self.frame_config.clone(),
            }),
        })
    }
}

struct TcpFrameSender {
    writer: OwnedWriteHalf,
    config: FrameConfig,
}

#[async_trait]
impl FrameSender for TcpFrameSender {
    async fn send(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        write_frame(&mut self.writer, frame, &self.config).await?;
        Ok(())
    }

    async fn close(&mut self) {
        use tokio::io::AsyncWriteExt;
        let _ = self.writer.shutdown().await;
    }
}

struct TcpFrameReceiver {
    reader: OwnedReadHalf,
    config: FrameConfig,
}

#[async_trait]
impl FrameReceiver for TcpFrameReceiver {
    async fn receive(&mut self) -> Result<Vec<u8>, TransportError> {
        match read_frame(&mut self.reader, &self.config).await {
            Ok(frame) => Ok(frame),
            Err(FrameError::ConnectionClosed) => Err(TransportError::Closed),
            Err(e) => Err(e.into()),
        }
    }
}
