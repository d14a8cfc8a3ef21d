use crate::types::{ErrorType, StreamId};
use std::io;

/// Coarse classification used to route a failure to the right recovery
/// action (§4.6, §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorScope {
    /// Recovered locally: RST_STREAM is sent, only the owning awaiter fails.
    Stream,
    /// Fatal to the whole connection: GOAWAY is sent, every awaiter fails.
    Connection,
}

/// The error taxonomy from spec §7. Each variant carries enough detail for a
/// caller (or a circuit breaker built on top of this crate) to decide whether
/// a retry is sensible.
#[derive(thiserror::Error, Debug)]
pub enum H2Error {
    #[error("frame format error: {0}")]
    FrameFormat(&'static str),

    #[error("protocol error: {0}")]
    Protocol(&'static str),

    #[error("hpack compression error: {0}")]
    Compression(&'static str),

    /// `connection_scoped` is true for violations against the
    /// connection-level window (§4.4): those are connection-fatal
    /// (GOAWAY/FLOW_CONTROL_ERROR) rather than recoverable per-stream.
    #[error("flow control error: {reason}")]
    FlowControl {
        reason: &'static str,
        connection_scoped: bool,
    },

    #[error("stream {stream} is in an illegal state for this frame: {reason}")]
    StreamState { stream: StreamId, reason: &'static str },

    #[error("request on stream {stream} was cancelled: {reason}")]
    Cancelled { stream: StreamId, reason: &'static str },

    #[error("peer refused stream {stream} with code {code:?}")]
    RemoteRefusal { stream: StreamId, code: ErrorType },

    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    #[error("connection is going away, last processed stream {last_stream_id}; retryable={retryable}")]
    Graceful {
        last_stream_id: StreamId,
        retryable: bool,
    },

    #[error("connection closed")]
    Closed,
}

impl H2Error {
    /// Scope used to decide whether to emit RST_STREAM (stream) or GOAWAY
    /// (connection) and whether every pending awaiter must be failed.
    #[must_use]
    pub fn scope(&self) -> ErrorScope {
        match self {
            H2Error::FrameFormat(_)
            | H2Error::Protocol(_)
            | H2Error::Compression(_)
            | H2Error::Transport(_)
            | H2Error::Closed => ErrorScope::Connection,
            H2Error::FlowControl { connection_scoped, .. } => {
                if *connection_scoped {
                    ErrorScope::Connection
                } else {
                    ErrorScope::Stream
                }
            }
            H2Error::StreamState { .. }
            | H2Error::Cancelled { .. }
            | H2Error::RemoteRefusal { .. } => ErrorScope::Stream,
            H2Error::Graceful { .. } => ErrorScope::Stream,
        }
    }

    /// A flow-control error raised while debiting connection-scoped windows
    /// is connection-fatal; the per-stream case is handled by the caller
    /// passing `connection_scoped = true` when constructing it.
    #[must_use]
    pub fn flow_control(connection_scoped: bool, reason: &'static str) -> Self {
        H2Error::FlowControl { reason, connection_scoped }
    }

    /// Maps this error to the wire error code carried by GOAWAY/RST_STREAM.
    #[must_use]
    pub fn wire_code(&self) -> ErrorType {
        match self {
            H2Error::FrameFormat(_) => ErrorType::FrameSizeError,
            H2Error::Protocol(_) => ErrorType::ProtocolError,
            H2Error::Compression(_) => ErrorType::CompressionError,
            H2Error::FlowControl { .. } => ErrorType::FlowControlError,
            H2Error::StreamState { .. } => ErrorType::StreamClosed,
            H2Error::Cancelled { .. } => ErrorType::Cancel,
            H2Error::RemoteRefusal { code, .. } => *code,
            H2Error::Transport(_) | H2Error::Closed => ErrorType::InternalError,
            H2Error::Graceful { .. } => ErrorType::NoError,
        }
    }

    /// Whether a circuit breaker built on this crate may safely retry.
    /// Protocol violations attributable to the local side are never
    /// retryable (§7).
    #[must_use]
    pub fn retryable(&self) -> bool {
        match self {
            H2Error::Graceful { retryable, .. } => *retryable,
            H2Error::RemoteRefusal { .. } | H2Error::Transport(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, H2Error>;
