//! Error taxonomy for the driver.
//!
//! Failures fall into two groups. Connection-level failures ([`ConnectionError`], wrapping
//! [`FramingError`] and [`TransportError`]) mean the byte stream can no longer be trusted and are
//! reported through the connection's error handler. Per-query failures ([`QueryError`]) belong to
//! exactly one token and are delivered to that token's cursor through the same channel a result
//! would have used; they never disturb other queries on the connection.
//!
//! # Key Components
//!
//! - [`classify`]: maps an error response (status code, message, backtrace) to a [`QueryError`].
//!
//! # See Also
//!
//! - [`protocol::codec`](crate::protocol::codec): produces [`FramingError`].
//! - [`Connection`](crate::Connection): routes [`QueryError`] to cursors.
use thiserror::Error;

use crate::protocol::{ResponseKind, TransportError};

/// Errors raised while splitting or parsing frames.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FramingError {
    #[error("length mismatch: frame declares {declared} bytes but carries {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("length mismatch: frame header needs 4 bytes, received {0}")]
    TruncatedHeader(usize),

    #[error("frame of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },

    #[error("schema violation: {0}")]
    SchemaViolation(String),

    #[error("failed to encode message: {0}")]
    Encode(String),
}

/// A failure that belongs to a single query.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueryError {
    /// The server could not make sense of the request the driver sent.
    #[error("broken client: {message}")]
    BrokenClient {
        message: String,
        backtrace: Vec<String>,
    },

    /// The compiled query is invalid, e.g. a type error in a sub-term.
    #[error("bad query: {message}")]
    BadQuery {
        message: String,
        backtrace: Vec<String>,
    },

    /// The query was well formed but failed while executing.
    #[error("runtime error: {message}")]
    Runtime {
        message: String,
        backtrace: Vec<String>,
    },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("connection lost: {0}")]
    ConnectionLost(String),
}

impl QueryError {
    /// Server-supplied backtrace frames locating the offending sub-term, if any.
    pub fn backtrace(&self) -> &[String] {
        match self {
            QueryError::BrokenClient { backtrace, .. }
            | QueryError::BadQuery { backtrace, .. }
            | QueryError::Runtime { backtrace, .. } => backtrace,
            QueryError::Protocol(_) | QueryError::ConnectionLost(_) => &[],
        }
    }
}

/// Connection-level failures.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Framing(#[from] FramingError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("connection is closed")]
    Closed,

    #[error("connection is broken: {0}")]
    Broken(String),
}

/// Classify an error response. Pure; known success codes passed here are reported as a
/// protocol error since they never describe a failure.
pub fn classify(status: u32, message: Option<String>, backtrace: Option<Vec<String>>) -> QueryError {
    let message = message.unwrap_or_else(|| String::from("no message provided"));
    let backtrace = backtrace.unwrap_or_default();

    match ResponseKind::try_from(status) {
        Ok(ResponseKind::BrokenClient) => QueryError::BrokenClient { message, backtrace },
        Ok(ResponseKind::BadQuery) => QueryError::BadQuery { message, backtrace },
        Ok(ResponseKind::RuntimeError) => QueryError::Runtime { message, backtrace },
        Ok(kind) => QueryError::Protocol(format!("{kind:?} is not an error status")),
        Err(code) => QueryError::Protocol(format!("unknown status {code}")),
    }
}
