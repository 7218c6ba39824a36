use std::collections::TryReserveError;
use std::io;

use dronesync_core::TransportError;
use thiserror::Error;

use super::paths::PathError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("already initialized")]
    AlreadyInitialized,
    #[error("not initialized")]
    NotInitialized,
    #[error("worker is already running")]
    AlreadyRunning,
    #[error("worker is still processing; cancel and join it first")]
    ThreadProcessing,
    #[error("allocation failed: {0}")]
    AllocationFailure(#[from] TryReserveError),
    #[error("system error: {0}")]
    System(#[from] io::Error),
    #[error("transport error: {0}")]
    Transport(#[source] TransportError),
    #[error("operation canceled")]
    Canceled,
    #[error("media not found: {0}")]
    MediaNotFound(String),
}

impl EngineError {
    pub fn is_canceled(&self) -> bool {
        matches!(self, EngineError::Canceled)
    }
}

impl From<TransportError> for EngineError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Canceled => EngineError::Canceled,
            other => EngineError::Transport(other),
        }
    }
}

impl From<PathError> for EngineError {
    fn from(err: PathError) -> Self {
        EngineError::InvalidArgument(err.to_string())
    }
}

impl From<walkdir::Error> for EngineError {
    fn from(err: walkdir::Error) -> Self {
        EngineError::System(err.into())
    }
}

impl From<tokio::task::JoinError> for EngineError {
    fn from(err: tokio::task::JoinError) -> Self {
        EngineError::System(io::Error::other(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_cancel_is_distinguished_from_failure() {
        assert!(EngineError::from(TransportError::Canceled).is_canceled());
        let err = EngineError::from(TransportError::NotFound("/a".into()));
        assert!(matches!(err, EngineError::Transport(TransportError::NotFound(_))));
    }

    #[test]
    fn path_errors_are_invalid_arguments() {
        let err = EngineError::from(PathError::Empty);
        assert!(matches!(err, EngineError::InvalidArgument(msg) if msg == "name is empty"));
    }
}
