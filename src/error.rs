//! Error types for tunnel sessions

use thiserror::Error;

/// Errors that can end a tunnel session.
///
/// A non-zero exit from the client program is not an error; it is carried by
/// [`crate::runner::ProcessOutcome`].
#[derive(Debug, Error)]
pub enum TunnelError {
    /// A dependency the backend needs (binary on PATH, cluster config) is missing
    #[error("Tunnel backend unavailable: {message}")]
    BackendUnavailable { message: String },

    /// The transport or the client process could not be started
    #[error("Failed to start: {message}")]
    SpawnFailed { message: String },

    /// The local bind address never accepted a connection
    #[error("Tunnel at {address} did not open after {attempts} attempt(s)")]
    ReadinessTimeout { address: String, attempts: u32 },

    /// The backend reported a failure while the tunnel was being established
    #[error("Tunnel backend failed: {cause}")]
    BackendFailed { cause: String },

    /// The client program is not on PATH
    #[error("{program} binary is not available in PATH")]
    ExecutableNotFound { program: String },

    /// The tunnel spec does not fit the selected backend
    #[error("Invalid tunnel spec: {message}")]
    InvalidSpec { message: String },

    /// The session was stopped by a termination signal
    #[error("Interrupted by signal {signal}")]
    Interrupted { signal: i32 },

    /// Tearing the tunnel down did not complete cleanly
    #[error("Failed to close tunnel: {message}")]
    CloseFailed { message: String },
}

impl TunnelError {
    pub fn backend_unavailable(message: impl Into<String>) -> Self {
        Self::BackendUnavailable {
            message: message.into(),
        }
    }

    pub fn spawn_failed(message: impl Into<String>) -> Self {
        Self::SpawnFailed {
            message: message.into(),
        }
    }

    pub fn backend_failed(cause: impl Into<String>) -> Self {
        Self::BackendFailed {
            cause: cause.into(),
        }
    }

    pub fn invalid_spec(message: impl Into<String>) -> Self {
        Self::InvalidSpec {
            message: message.into(),
        }
    }

    pub fn close_failed(message: impl Into<String>) -> Self {
        Self::CloseFailed {
            message: message.into(),
        }
    }

    /// Exit status the command line reports for this error.
    ///
    /// Interruptions follow the shell convention of 128 + signal number.
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Interrupted { signal } => u8::try_from(128 + signal).unwrap_or(1),
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, TunnelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TunnelError::ReadinessTimeout {
            address: "127.0.0.1:5432".into(),
            attempts: 10,
        };
        assert_eq!(
            err.to_string(),
            "Tunnel at 127.0.0.1:5432 did not open after 10 attempt(s)"
        );

        let err = TunnelError::ExecutableNotFound {
            program: "psql".into(),
        };
        assert_eq!(err.to_string(), "psql binary is not available in PATH");
    }

    #[test]
    fn test_exit_code() {
        assert_eq!(TunnelError::Interrupted { signal: 15 }.exit_code(), 143);
        assert_eq!(TunnelError::Interrupted { signal: 2 }.exit_code(), 130);
        assert_eq!(TunnelError::backend_failed("boom").exit_code(), 1);
        assert_eq!(TunnelError::spawn_failed("nope").exit_code(), 1);
    }
}
