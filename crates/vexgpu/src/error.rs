//! Error kinds surfaced by the public API.

use thiserror::Error;

/// Failure kinds returned by every public operation.
///
/// Transient conditions (`Busy`, `Timeout`) are retryable; `Hardware` after a
/// failed recovery means the device instance is dead and will not accept new
/// work.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum GpuError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("out of memory")]
    OutOfMemory,
    #[error("device busy")]
    Busy,
    #[error("timed out")]
    Timeout,
    #[error("hardware error")]
    Hardware,
    #[error("permission denied")]
    PermissionDenied,
    #[error("cancelled")]
    Cancelled,
    #[error("not found")]
    NotFound,
    #[error("already in progress")]
    AlreadyInProgress,
}

pub type Result<T> = std::result::Result<T, GpuError>;
