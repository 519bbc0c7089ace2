use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Lifecycle preconditions that an operation found violated
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("postgres cluster already initialized")]
    AlreadyInitialized,

    #[error("postgres cluster not initialized")]
    NotInitialized,

    #[error("postgres cluster already running")]
    AlreadyRunning,

    #[error("server has not been started")]
    NotStarted,

    #[error("postgres cluster not running")]
    NotRunning,

    #[error("cannot clone a running cluster")]
    CloneRunning,

    #[error("cluster must be initialized before cloning")]
    CloneUninitialized,

    #[error("cannot clone into an existing directory: {0:?}")]
    DestinationExists(PathBuf),

    #[error("cannot create a template from a running cluster")]
    FreezeRunning,
}

/// Main error type for ghostgres operations
#[derive(Debug, Error)]
pub enum GhostgresError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("{program:?} failed: {reason}: {output}")]
    ExternalProcess {
        program: PathBuf,
        reason: String,
        output: String,
    },

    #[error("Timed out after {timeout:?} waiting for {path:?}")]
    Timeout { path: PathBuf, timeout: Duration },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GhostgresError {
    /// True when the underlying cause is a missing file or directory
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Io(e) if e.kind() == std::io::ErrorKind::NotFound)
    }

    /// True when an operation was called in the wrong lifecycle state
    pub fn is_state(&self) -> bool {
        matches!(self, Self::State(_))
    }

    /// The violated precondition, if this is a state error
    pub fn as_state(&self) -> Option<&StateError> {
        match self {
            Self::State(e) => Some(e),
            _ => None,
        }
    }
}

impl From<walkdir::Error> for GhostgresError {
    fn from(e: walkdir::Error) -> Self {
        GhostgresError::Io(e.into())
    }
}

impl From<nix::Error> for GhostgresError {
    fn from(e: nix::Error) -> Self {
        GhostgresError::Io(e.into())
    }
}

/// Result type alias for ghostgres operations
pub type Result<T> = std::result::Result<T, GhostgresError>;
