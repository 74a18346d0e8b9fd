//! Error types for usenet-engine
//!
//! Two layers of errors exist in the crate:
//! - [`NntpError`] covers a single NNTP session (socket, protocol,
//!   authentication, cancellation) and is what `Connection` returns.
//! - [`Error`] is the engine-level type returned by the public API.
//!
//! Per-article download outcomes are deliberately *not* errors: the
//! downloader reports a coarse [`crate::types::ArticleOutcome`] status that
//! the failover state machine consumes.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for usenet-engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for usenet-engine
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "servers")
        key: Option<String>,
    },

    /// NNTP session error
    #[error("NNTP error: {0}")]
    Nntp(#[from] NntpError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Queue entry not found
    #[error("queue entry not found: {0}")]
    NotFound(String),

    /// Shutdown in progress - not accepting new work
    #[error("shutdown in progress: not accepting new downloads")]
    ShuttingDown,

    /// Queue snapshot could not be serialized or deserialized
    #[error("persistence error: {0}")]
    Persistence(#[from] serde_json::Error),

    /// Par verification or repair failed
    #[error("par-check failed for {nzb}: {reason}")]
    ParCheck {
        /// Name of the bundle being checked
        nzb: String,
        /// Why verification or repair failed
        reason: String,
    },

    /// Local file could not be created or written
    #[error("cannot write {path}: {source}")]
    FileWrite {
        /// The path that could not be written
        path: PathBuf,
        /// The underlying I/O error
        source: std::io::Error,
    },

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Errors raised by a single NNTP connection
#[derive(Debug, Error)]
pub enum NntpError {
    /// TCP connect failed
    #[error("connection to {host}:{port} failed: {source}")]
    ConnectFailed {
        /// Server host name
        host: String,
        /// Server port
        port: u16,
        /// The underlying I/O error
        source: std::io::Error,
    },

    /// TLS handshake failed
    #[error("TLS handshake failed: {0}")]
    Tls(String),

    /// Operation did not complete within the configured timeout
    #[error("timed out after {seconds}s")]
    Timeout {
        /// The timeout that expired, in seconds
        seconds: u64,
    },

    /// Server rejected AUTHINFO
    #[error("authentication failed ({response})")]
    AuthFailed {
        /// Leading response code (the rest is withheld, it may echo credentials)
        response: String,
    },

    /// Server greeting or response violated the protocol
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The connection was cancelled by the engine
    #[error("connection cancelled")]
    Cancelled,

    /// Read or write on an established session failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Command issued on a connection in the wrong state
    #[error("connection is {state}, cannot {operation}")]
    BadState {
        /// Current connection state
        state: &'static str,
        /// The operation that was attempted
        operation: &'static str,
    },
}

impl NntpError {
    /// True when the failure happened before any article data was exchanged
    /// (socket, TLS, authentication, timeout) — the failover machine treats
    /// these as connect-level and retries the same server.
    pub fn is_connect_level(&self) -> bool {
        matches!(
            self,
            NntpError::ConnectFailed { .. }
                | NntpError::Tls(_)
                | NntpError::Timeout { .. }
                | NntpError::AuthFailed { .. }
                | NntpError::Cancelled
        )
    }
}
