//! Error types for the shaper engine.
//!
//! This module defines the error taxonomy used throughout the shaper
//! crates. All errors implement `std::error::Error` via `thiserror`.
//!
//! The split that matters operationally is `TransportUnavailable`
//! (connection/auth/timeout trouble — retry after reconnect) versus
//! `RemoteCommandFailed` (the router rejected the command — surfaced,
//! transition aborted). "Already applied" remote errors are not errors
//! at all; the executor converts them to success before they reach
//! this taxonomy.

use std::io;
use thiserror::Error;

/// Result type alias for shaper operations.
pub type ShaperResult<T> = Result<T, ShaperError>;

/// Errors that can occur during shaper operations.
#[derive(Debug, Error)]
pub enum ShaperError {
    /// The remote-execution channel could not be reached (connect,
    /// auth, spawn, or timeout). Retryable after reconnect.
    #[error("Transport unavailable for router '{router}': {message}")]
    TransportUnavailable {
        /// The router identifier.
        router: String,
        /// What went wrong at the channel level.
        message: String,
    },

    /// Failed to spawn the remote-shell client process.
    #[error("Failed to spawn remote shell for '{command}': {source}")]
    ShellSpawn {
        /// The command that failed to spawn.
        command: String,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// The router executed the command and rejected it.
    #[error("Remote command failed: '{command}' (exit code {exit_code}): {output}")]
    RemoteCommandFailed {
        /// The command that failed.
        command: String,
        /// The remote exit code.
        exit_code: i32,
        /// Combined stdout/stderr output.
        output: String,
    },

    /// No session with the given identifier is active.
    #[error("Session '{session_id}' not found")]
    SessionNotFound {
        /// The session identifier.
        session_id: String,
    },

    /// A session with the given identifier is already active.
    #[error("Session '{session_id}' is already active")]
    SessionAlreadyActive {
        /// The session identifier.
        session_id: String,
    },

    /// No router with the given identifier is configured.
    #[error("Router '{router}' is not configured")]
    RouterNotFound {
        /// The router identifier.
        router: String,
    },

    /// Policy input failed validation; no remote command was issued.
    #[error("Invalid policy for {field}: {message}")]
    InvalidPolicy {
        /// The policy field that failed validation.
        field: String,
        /// Error message.
        message: String,
    },

    /// Configuration file could not be loaded or was malformed.
    #[error("Configuration error: {message}")]
    Config {
        /// Error message.
        message: String,
    },

    /// Internal error (unexpected state).
    #[error("Internal error: {message}")]
    Internal {
        /// Error message.
        message: String,
    },
}

impl ShaperError {
    /// Creates a transport-unavailable error.
    pub fn transport_unavailable(router: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TransportUnavailable {
            router: router.into(),
            message: message.into(),
        }
    }

    /// Creates a session-not-found error.
    pub fn session_not_found(session_id: impl Into<String>) -> Self {
        Self::SessionNotFound {
            session_id: session_id.into(),
        }
    }

    /// Creates a session-already-active error.
    pub fn session_already_active(session_id: impl Into<String>) -> Self {
        Self::SessionAlreadyActive {
            session_id: session_id.into(),
        }
    }

    /// Creates a router-not-found error.
    pub fn router_not_found(router: impl Into<String>) -> Self {
        Self::RouterNotFound {
            router: router.into(),
        }
    }

    /// Creates an invalid-policy error.
    pub fn invalid_policy(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidPolicy {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this error indicates a transient channel
    /// condition that may succeed after a reconnect.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ShaperError::TransportUnavailable { .. } | ShaperError::ShellSpawn { .. }
        )
    }

    /// Returns true if this error is a client usage error rather than
    /// a router-side failure.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ShaperError::SessionNotFound { .. }
                | ShaperError::SessionAlreadyActive { .. }
                | ShaperError::RouterNotFound { .. }
                | ShaperError::InvalidPolicy { .. }
        )
    }
}
