//! Topic control protocol: framing, query strings, request/reply
//! client, and the chunking extension used by the interop channel.

pub mod chunk;
pub mod client;
pub mod query;
pub mod wire;

pub use chunk::{Chunk, ChunkAssembler};
pub use client::{TopicClient, TopicTimeouts};
pub use query::TopicQuery;

/// Failure modes of the raw Topic channel.
#[derive(Debug, thiserror::Error)]
pub enum TopicError {
    #[error("command exceeds wire limit: {len} bytes")]
    CommandTooLong { len: usize },
    #[error("frame preamble is not all zero")]
    BadPreamble,
    #[error("unexpected marker byte 0x{0:02x}")]
    BadMarker(u8),
    #[error("unexpected packet tag 0x{0:02x}")]
    BadTag(u8),
    #[error("frame truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("payload missing query delimiter")]
    MissingDelimiter,
    #[error("payload is not valid utf-8")]
    InvalidUtf8,
    #[error("malformed percent escape in value")]
    BadEscape,
    #[error("reply shorter than its fixed header")]
    EmptyReply,
    #[error("connect timed out")]
    ConnectTimeout,
    #[error("send timed out")]
    SendTimeout,
    #[error("receive timed out")]
    ReceiveTimeout,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TopicError {
    /// Socket-level conditions worth a single retry; everything else is
    /// a protocol error and retrying would just repeat it.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TopicError::ConnectTimeout
                | TopicError::SendTimeout
                | TopicError::ReceiveTimeout
                | TopicError::Io(_)
        )
    }
}

/// Failure modes of chunked reassembly on the interop channel.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ChunkError {
    #[error("chunk set declares zero total chunks")]
    ZeroTotal,
    #[error("chunk sequence gap: expected {expected}, got {got}")]
    SequenceGap { expected: u32, got: u32 },
    #[error("chunk total changed mid-set: expected {expected}, got {got}")]
    TotalMismatch { expected: u32, got: u32 },
    #[error("reassembled payload would exceed {limit} bytes")]
    Oversize { limit: usize },
}
