//! Error types for agent operations.
//!
//! All errors implement `std::error::Error` via `thiserror`.

use std::io;
use thiserror::Error;

/// Result type alias for agent operations.
pub type AgentResult<T> = Result<T, AgentError>;

/// Errors that can occur while driving the switch and the VDP daemon.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Failed to spawn a command.
    #[error("Failed to execute command '{command}': {source}")]
    ShellExec {
        /// The command that failed to execute.
        command: String,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// Command returned non-zero exit code.
    #[error("Command failed: '{command}' (exit code {exit_code}): {output}")]
    CommandFailed {
        /// The command that failed.
        command: String,
        /// The exit code.
        exit_code: i32,
        /// Combined stdout/stderr output.
        output: String,
    },

    /// A required OVS bridge does not exist.
    #[error("Bridge '{bridge}' does not exist")]
    BridgeNotFound {
        /// The bridge name.
        bridge: String,
    },

    /// Port/interface not found on a bridge.
    #[error("Port '{port}' not found: {detail}")]
    PortNotFound {
        /// The port or interface name.
        port: String,
        /// What was being looked up.
        detail: String,
    },

    /// Uplink bridge setup did not complete.
    #[error("Setup of uplink '{uplink}' failed: {reason}")]
    BridgeSetup {
        /// The physical uplink.
        uplink: String,
        /// Why setup stopped.
        reason: String,
    },

    /// A queued message failed validation.
    #[error("Invalid message field {field}: {message}")]
    InvalidMessage {
        /// The offending field.
        field: String,
        /// Error message.
        message: String,
    },

    /// Configuration validation error.
    #[error("Invalid configuration for {field}: {message}")]
    InvalidConfig {
        /// The field that failed validation.
        field: String,
        /// Error message.
        message: String,
    },

    /// No usable uplink for a request.
    #[error("Uplink not ready: {reason}")]
    UplinkNotReady {
        /// Why the uplink cannot serve the request.
        reason: String,
    },

    /// Internal error (unexpected state).
    #[error("Internal error: {message}")]
    Internal {
        /// Error message.
        message: String,
    },
}

impl AgentError {
    /// Creates a bridge not found error.
    pub fn bridge_not_found(bridge: impl Into<String>) -> Self {
        Self::BridgeNotFound {
            bridge: bridge.into(),
        }
    }

    /// Creates a port not found error.
    pub fn port_not_found(port: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::PortNotFound {
            port: port.into(),
            detail: detail.into(),
        }
    }

    /// Creates a bridge setup error.
    pub fn bridge_setup(uplink: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::BridgeSetup {
            uplink: uplink.into(),
            reason: reason.into(),
        }
    }

    /// Creates an invalid message error.
    pub fn invalid_message(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidMessage {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Creates an invalid configuration error.
    pub fn invalid_config(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Creates an uplink not ready error.
    pub fn uplink_not_ready(reason: impl Into<String>) -> Self {
        Self::UplinkNotReady {
            reason: reason.into(),
        }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns the exit code when this is a [`CommandFailed`](Self::CommandFailed).
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            AgentError::CommandFailed { exit_code, .. } => Some(*exit_code),
            _ => None,
        }
    }

    /// Returns true if this error indicates a transient condition
    /// that may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AgentError::ShellExec { .. }
                | AgentError::CommandFailed { .. }
                | AgentError::BridgeNotFound { .. }
                | AgentError::PortNotFound { .. }
                | AgentError::BridgeSetup { .. }
                | AgentError::UplinkNotReady { .. }
        )
    }
}
