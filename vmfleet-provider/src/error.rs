//! Error types for the provider layer.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur during provider operations.
#[derive(Error, Debug)]
pub enum ProviderError {
    /// The backend does not implement the requested operation.
    #[error("{operation} is not supported by the {backend} provider")]
    Unsupported {
        backend: &'static str,
        operation: &'static str,
    },

    /// A named resource could not be resolved.
    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    /// An external command exited unsuccessfully.
    ///
    /// `output` carries the command's combined stdout and stderr.
    #[error("command `{command}` failed ({status}): {output}")]
    CommandFailed {
        command: String,
        status: String,
        output: String,
    },

    /// An external command could not be launched at all.
    #[error("failed to launch `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// A cloud API call failed or returned something unparseable.
    #[error("{service} request failed: {message}")]
    Api {
        service: &'static str,
        message: String,
    },

    /// Cloud credentials are missing or were rejected.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The provider name is not registered.
    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Filesystem error on a specific path.
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The user interrupted a long-running step.
    #[error(transparent)]
    Interrupted(#[from] vmfleet_common::progress::Interrupted),
}

impl ProviderError {
    pub fn unsupported(backend: &'static str, operation: &'static str) -> Self {
        Self::Unsupported { backend, operation }
    }

    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn api(service: &'static str, message: impl Into<String>) -> Self {
        Self::Api {
            service,
            message: message.into(),
        }
    }

    /// True for errors a caller may treat as a capability gap.
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::Unsupported { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Result type alias for provider operations.
pub type Result<T> = std::result::Result<T, ProviderError>;
