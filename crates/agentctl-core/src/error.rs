//! Error classification for the orchestration engine.
//!
//! Modules that own a failure domain define their own `thiserror` enums
//! (`QueueError`, `RpcError`, `LauncherError`, `PermissionError`). This
//! module defines the process-wide classification used when a failure is
//! surfaced to the user: `agent.failed` payloads and execution records
//! carry `{kind, message}` derived from the error chain.

use std::fmt;

use crate::launcher::LauncherError;
use crate::protocol::jsonrpc::RpcError;
use crate::queue::QueueError;

/// Coarse error kind carried in `agent.failed` events and persisted on the
/// execution record. The scheduler uses the kind to decide retry vs
/// surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid profile, missing binary. Surfaced at start; the execution
    /// never enters `starting`.
    Configuration,
    /// Stdio closed, TCP broken. Terminates the read loop.
    Transport,
    /// Malformed JSON, unknown method. Per-message skip unless bursting.
    Protocol,
    /// The agent returned a JSON-RPC error.
    Remote,
    /// Port in use after fallback, cannot allocate workspace. Retried up
    /// to the limit.
    Resource,
    /// Permission timeout. The session continues with a `cancelled`
    /// outcome.
    User,
    /// Cancellation propagated from a stop request. Not counted as a
    /// failure.
    Cancelled,
    /// Anything that resists classification.
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Configuration => "configuration",
            Self::Transport => "transport",
            Self::Protocol => "protocol",
            Self::Remote => "remote",
            Self::Resource => "resource",
            Self::User => "user",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        }
    }

    /// Whether the scheduler should retry a failure of this kind.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport | Self::Resource | Self::Internal)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify an error chain into an [`ErrorKind`] by downcasting through
/// the module-level error types.
pub fn classify(err: &anyhow::Error) -> ErrorKind {
    for cause in err.chain() {
        if let Some(launcher) = cause.downcast_ref::<LauncherError>() {
            return match launcher {
                LauncherError::BinaryNotFound { .. } => ErrorKind::Configuration,
                LauncherError::PortUnavailable { .. } => ErrorKind::Resource,
                LauncherError::ExitedDuringStartup { .. }
                | LauncherError::HealthTimeout { .. } => ErrorKind::Resource,
                LauncherError::Spawn { .. } => ErrorKind::Configuration,
                LauncherError::Io(_) => ErrorKind::Transport,
            };
        }
        if let Some(rpc) = cause.downcast_ref::<RpcError>() {
            return match rpc {
                RpcError::Transport(_) | RpcError::Closed => ErrorKind::Transport,
                RpcError::Malformed { .. } | RpcError::OversizedMessage { .. } => {
                    ErrorKind::Protocol
                }
                RpcError::Remote { .. } => ErrorKind::Remote,
            };
        }
        if cause.downcast_ref::<QueueError>().is_some() {
            return ErrorKind::Resource;
        }
        if cause.downcast_ref::<tokio::task::JoinError>().is_some() {
            return ErrorKind::Internal;
        }
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            return match io.kind() {
                std::io::ErrorKind::NotFound => ErrorKind::Configuration,
                std::io::ErrorKind::AddrInUse => ErrorKind::Resource,
                _ => ErrorKind::Transport,
            };
        }
    }
    ErrorKind::Internal
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn classify_launcher_binary_not_found() {
        let err = anyhow::Error::new(LauncherError::BinaryNotFound {
            binary: "mock-agent".to_string(),
        });
        assert_eq!(classify(&err), ErrorKind::Configuration);
    }

    #[test]
    fn classify_wrapped_rpc_remote() {
        let err = anyhow::Error::new(RpcError::Remote {
            code: -32601,
            message: "method not found".to_string(),
            data: None,
        })
        .context("prompt failed");
        assert_eq!(classify(&err), ErrorKind::Remote);
    }

    #[test]
    fn classify_io_not_found_is_configuration() {
        let err = anyhow::Error::new(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "no such file",
        ));
        assert_eq!(classify(&err), ErrorKind::Configuration);
    }

    #[test]
    fn classify_unknown_is_internal() {
        let err = anyhow!("something odd");
        assert_eq!(classify(&err), ErrorKind::Internal);
    }

    #[test]
    fn retryable_kinds() {
        assert!(ErrorKind::Transport.is_retryable());
        assert!(ErrorKind::Resource.is_retryable());
        assert!(!ErrorKind::Configuration.is_retryable());
        assert!(!ErrorKind::Cancelled.is_retryable());
        assert!(!ErrorKind::User.is_retryable());
    }

    #[test]
    fn kind_display_matches_as_str() {
        assert_eq!(ErrorKind::Resource.to_string(), "resource");
        assert_eq!(ErrorKind::Cancelled.to_string(), "cancelled");
    }
}
