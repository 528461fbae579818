//! Error types for the coordinator

use meshcoord_proto::CodecError;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Errors returned by coordinator entry points
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("Coordinator is closed")]
    Closed,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Write to peer timed out after {0:?}")]
    WriteTimeout(Duration),

    #[error("Session task failed: {0}")]
    TaskFailed(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl From<CodecError> for CoordinatorError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Io(e) => CoordinatorError::Io(e),
            other => CoordinatorError::Protocol(format!("malformed frame: {}", other)),
        }
    }
}

/// Whether an I/O error means the remote end went away
pub(crate) fn is_transport_closure(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
    )
}

/// Fold a codec failure into a session result.
///
/// Transport closure is the normal way a session ends and maps to `Ok(())`.
pub(crate) fn fold_codec_error(err: CodecError) -> Result<(), CoordinatorError> {
    match err {
        CodecError::Io(ref e) if is_transport_closure(e) => Ok(()),
        other => Err(other.into()),
    }
}
