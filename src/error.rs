// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error taxonomy for the connection core (spec §7).
//!
//! `DriverError` is the closed set of error kinds the core itself raises.
//! Callers that need richer context (I/O errors, config parse failures)
//! see those wrapped in `anyhow::Error` at the boundary, the way the rest
//! of this crate propagates errors.

use serde_json::Value;

/// The kind of server-reported error, decoded from the response envelope's
/// `t` field when it is one of the error response types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerErrorKind {
    Client,
    Compile,
    Runtime,
}

impl std::fmt::Display for ServerErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ServerErrorKind::Client => "client",
            ServerErrorKind::Compile => "compile",
            ServerErrorKind::Runtime => "runtime",
        })
    }
}

/// Driver error taxonomy (spec §7).
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// Malformed option, wrong arity, unknown keys.
    #[error("argument error: {0}")]
    Argument(String),

    /// Raised when operating on a closed connection, or a stale cursor.
    #[error("connection closed")]
    ConnectionClosed,

    /// Raised from timed waits.
    #[error("operation timed out")]
    Timeout,

    /// Invariant violation: duplicate token, unknown token in the response
    /// table, unrecognized waiter kind. Indicates a driver bug.
    #[error("driver internal error: {0}")]
    Internal(String),

    /// CLIENT_ERROR / COMPILE_ERROR / RUNTIME_ERROR responses.
    #[error("{kind} error: {message}")]
    Server {
        kind: ServerErrorKind,
        message: String,
        backtrace: Option<Value>,
    },

    /// Non-SUCCESS handshake reply.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Raised by `Cursor::next` once a cursor is exhausted.
    #[error("stop iteration")]
    StopIteration,

    /// A blocking `wait` was interrupted by caller-side cancellation (spec
    /// §5 "interactive abort" / §9 design note). The connection has
    /// already been reconnected with `noreply_wait=false` by the time this
    /// is returned to the caller.
    #[error("operation was cancelled")]
    Cancelled,
}

impl DriverError {
    pub fn argument(msg: impl Into<String>) -> Self {
        DriverError::Argument(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        DriverError::Internal(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, DriverError>;
