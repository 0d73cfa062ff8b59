// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the replication relay.
//!
//! Errors are categorized by where they occur on the replication path
//! (source link, target link, wire codec) and by whether the engine can
//! recover from them locally.
//!
//! # Error Categories
//!
//! | Error Type | Recoverable | Description |
//! |------------|-------------|-------------|
//! | `Network` | Sometimes | Dial/read/write failure on source or target |
//! | `Protocol` | No | Malformed negotiation reply from the source |
//! | `Auth` | No | Authentication rejected |
//! | `Parse` | No | Corrupt snapshot record or command stream |
//! | `TargetRejection` | No | Target answered a forwarded command with an error |
//! | `InvariantViolation` | No | Pipeline bookkeeping broke (e.g. reply id ran ahead) |
//! | `Config` | No | Configuration invalid |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Recovery Behavior
//!
//! A source-side `Network` error during the incremental phase is absorbed by
//! the reopen loop (resume at the current offset). The same error before
//! snapshot completion is fatal: a half-restored snapshot cannot be resumed.
//! Everything else marked non-recoverable terminates the syncer; the engine
//! surfaces the first such error from [`Engine::run()`](crate::Engine::run).

use thiserror::Error;

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Errors that can occur while relaying replication traffic.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Network failure on the source or target link.
    ///
    /// `endpoint` names the peer (role plus address) for log context.
    /// Recoverable only on the source link after snapshot completion,
    /// where the reopen loop resumes at the current offset.
    #[error("network error ({endpoint}): {message}")]
    Network {
        endpoint: String,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// The source answered the replication handshake with something
    /// the negotiation state machine cannot accept.
    ///
    /// Not recoverable: restarting the handshake from scratch is the
    /// supervisor's job.
    #[error("protocol error ({stage}): {message}")]
    Protocol { stage: String, message: String },

    /// Authentication rejected by source or target.
    #[error("auth rejected by {endpoint}: {message}")]
    Auth { endpoint: String, message: String },

    /// Corrupt snapshot payload or command stream.
    ///
    /// The replication stream has no resync point below a full snapshot,
    /// so parse failures are never retried.
    #[error("parse error: {0}")]
    Parse(String),

    /// The target returned an error reply to a restore or forwarded command.
    #[error("target rejected command: {0}")]
    TargetRejection(String),

    /// Pipeline bookkeeping violated an ordering invariant.
    ///
    /// Indicates a bug or a misbehaving target (replies out of order).
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Invalid or missing configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Unexpected internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl RelayError {
    /// Create a network error with an I/O source.
    pub fn network(endpoint: impl Into<String>, source: std::io::Error) -> Self {
        Self::Network {
            endpoint: endpoint.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a network error without an I/O source.
    pub fn network_msg(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Network {
            endpoint: endpoint.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a protocol error for a named handshake stage.
    pub fn protocol(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Protocol {
            stage: stage.into(),
            message: message.into(),
        }
    }

    /// Whether this error must tear the syncer down.
    ///
    /// Source-side network errors are the one locally recoverable kind,
    /// and only once the snapshot has fully transferred: the reopen loop
    /// resumes the stream at the current offset. The same error before
    /// snapshot completion, and every other kind, is fatal.
    pub fn is_fatal(&self, snapshot_complete: bool) -> bool {
        match self {
            Self::Network { .. } => !snapshot_complete,
            _ => true,
        }
    }
}
