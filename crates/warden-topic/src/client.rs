//! Short-lived request/reply client for the Topic channel.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::{TopicError, wire};

/// Independent timeouts for each phase of a topic exchange. The hosted
/// engine services one request at a time, so these stay short.
#[derive(Debug, Clone, Copy)]
pub struct TopicTimeouts {
    pub connect: Duration,
    pub send: Duration,
    pub receive: Duration,
}

impl Default for TopicTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(5),
            send: Duration::from_secs(5),
            receive: Duration::from_secs(10),
        }
    }
}

/// Default bound on reply bytes read before the handshake negotiates
/// real caps.
pub const DEFAULT_RESPONSE_CAP: usize = u16::MAX as usize;

/// Sends one command frame per fresh loopback connection and reads one
/// reply. No pooling: the engine only accepts a single in-flight
/// request.
#[derive(Debug, Clone)]
pub struct TopicClient {
    timeouts: TopicTimeouts,
    response_cap: usize,
}

impl Default for TopicClient {
    fn default() -> Self {
        Self::new(TopicTimeouts::default())
    }
}

impl TopicClient {
    pub fn new(timeouts: TopicTimeouts) -> Self {
        Self {
            timeouts,
            response_cap: DEFAULT_RESPONSE_CAP,
        }
    }

    /// Apply a negotiated reply cap (handshake result).
    pub fn with_response_cap(mut self, cap: usize) -> Self {
        self.response_cap = cap.max(wire::REPLY_HEADER_LEN + 1);
        self
    }

    pub fn response_cap(&self) -> usize {
        self.response_cap
    }

    /// One command out, one reply back. Encoding errors surface before
    /// any socket I/O; socket failures come back as typed errors.
    pub async fn send(&self, port: u16, command: &str) -> Result<String, TopicError> {
        let frame = wire::encode_command(command)?;

        let mut stream = tokio::time::timeout(
            self.timeouts.connect,
            TcpStream::connect(("127.0.0.1", port)),
        )
        .await
        .map_err(|_| TopicError::ConnectTimeout)??;

        tokio::time::timeout(self.timeouts.send, async {
            stream.write_all(&frame).await?;
            stream.flush().await
        })
        .await
        .map_err(|_| TopicError::SendTimeout)??;

        let raw = tokio::time::timeout(self.timeouts.receive, async {
            let mut buf = Vec::with_capacity(1024);
            let mut scratch = [0u8; 1024];
            loop {
                let n = stream.read(&mut scratch).await?;
                if n == 0 {
                    break;
                }
                let take = n.min(self.response_cap - buf.len());
                buf.extend_from_slice(&scratch[..take]);
                if buf.len() >= self.response_cap {
                    break;
                }
            }
            Ok::<_, std::io::Error>(buf)
        })
        .await
        .map_err(|_| TopicError::ReceiveTimeout)??;

        wire::parse_reply(&raw)
    }

    /// Transient-I/O policy: one retry for socket-level failures, then
    /// surface. Protocol errors are never retried.
    pub async fn send_with_retry(&self, port: u16, command: &str) -> Result<String, TopicError> {
        match self.send(port, command).await {
            Ok(reply) => Ok(reply),
            Err(err) if err.is_transient() => {
                tracing::debug!(%err, "topic send failed, retrying once");
                self.send(port, command).await
            }
            Err(err) => Err(err),
        }
    }
}
