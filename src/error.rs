//! Error types for veribridge.
//!
//! All engine failures are carried by a single tagged enum so that
//! callers can match on the kind discriminant instead of an
//! exception hierarchy.

use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type for engine communication.
#[derive(Debug, Error)]
pub enum EngineError {
    /// No connection could be obtained for the engine and no new one
    /// could be started (ports or connection slots exhausted).
    #[error("no available engine connection for '{engine}'")]
    NoConnection {
        /// Name of the engine whose pool was exhausted.
        engine: String,
    },

    /// Launching a local engine binary failed at the OS level.
    #[error("unable to start local engine '{}': {cause}", binary.display())]
    ProcessStart {
        /// Path of the binary that failed to launch.
        binary: PathBuf,
        /// Underlying I/O error.
        #[source]
        cause: std::io::Error,
    },

    /// The engine did not answer within the per-call deadline.
    #[error("engine '{engine}' did not answer in time")]
    Timeout {
        /// Name of the engine that timed out.
        engine: String,
    },

    /// Any other RPC-level failure reported by the engine.
    #[error("query execution failed: {message}")]
    Protocol {
        /// Status message reported by the RPC layer.
        message: String,
    },

    /// One or more connections failed to close during shutdown.
    ///
    /// Every underlying cause is retained; one failing connection never
    /// prevents closing the others.
    #[error("failed to close {} engine connection(s) for '{engine}'", causes.len())]
    Shutdown {
        /// Name of the engine whose pool failed to shut down cleanly.
        engine: String,
        /// The individual close failures.
        causes: Vec<EngineError>,
    },

    /// The query was rejected before dispatch.
    #[error("query syntax error: {message}")]
    Syntax {
        /// Reason the query text was rejected.
        message: String,
    },

    /// The engine's request queue is full.
    #[error("request queue for '{engine}' is full (capacity {capacity})")]
    QueueFull {
        /// Name of the engine whose queue rejected the request.
        engine: String,
        /// Capacity of the bounded queue.
        capacity: usize,
    },

    /// The connection was closed before or while the request ran.
    #[error("engine connection is closed")]
    ConnectionClosed,
}

impl EngineError {
    /// Returns true if this is a no-connection-available error.
    #[must_use]
    pub const fn is_no_connection(&self) -> bool {
        matches!(self, Self::NoConnection { .. })
    }

    /// Returns true if this is a per-call deadline expiry.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Returns true if this is an aggregate shutdown failure.
    #[must_use]
    pub const fn is_shutdown(&self) -> bool {
        matches!(self, Self::Shutdown { .. })
    }

    /// Returns true if this error is retryable.
    ///
    /// Only transient resource exhaustion is retried locally; protocol
    /// and process errors are surfaced to the caller instead.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::NoConnection { .. })
    }
}

/// Result type alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;
