//! Error Types
//!
//! Errors surfaced by the streaming layer. A write that races the peer
//! closing the connection is *not* represented here: the outbound channel's
//! closed-send result is the tag for that case, and sends that hit it are
//! dropped silently inside the session.

use thiserror::Error;

/// Errors surfaced by [`StreamSession::send`](crate::StreamSession::send).
#[derive(Debug, Error)]
pub enum StreamError {
    /// The message encoded to JSON `null` or a bare scalar. Every line on
    /// the wire must be a structured value, so this is rejected before
    /// anything is written.
    #[error("message must encode to a JSON object or array")]
    InvalidMessage,

    /// The message could not be encoded as JSON at all.
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Errors from binding and running the server.
#[derive(Debug, Error)]
pub enum ServeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
