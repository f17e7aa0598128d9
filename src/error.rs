//! Crate-wide error type.
//!
//! Engine functions never terminate the process; every failure surfaces as a
//! `DtError`. Worker threads capture errors into the running job and the
//! earliest one is rethrown on the caller after join.

use thiserror::Error;

pub type DtResult<T> = Result<T, DtError>;

#[derive(Debug, Error)]
pub enum DtError {
    /// An argument's type does not fit the declared parameter.
    #[error("TypeError: {0}")]
    TypeError(String),

    /// A value outside the allowed set or range.
    #[error("ValueError: {0}")]
    ValueError(String),

    /// File, process or decoding failure.
    #[error("IOError: {0}")]
    IoError(#[from] std::io::Error),

    /// A numeric conversion would lose magnitude.
    #[error("OverflowError: {0}")]
    OverflowError(String),

    /// Allocation failure.
    #[error("MemoryError: cannot allocate {0} bytes")]
    MemoryError(usize),

    /// Deliberately unsupported path.
    #[error("NotImplementedError: {0}")]
    NotImplemented(String),

    /// Cooperative cancellation (SIGINT).
    #[error("KeyboardInterrupt")]
    KeyboardInterrupt,

    /// Corrupt or truncated binary input.
    #[error("InvalidFormat: {0}")]
    InvalidFormat(String),
}

impl DtError {
    pub fn type_error(msg: impl Into<String>) -> Self {
        DtError::TypeError(msg.into())
    }

    pub fn value_error(msg: impl Into<String>) -> Self {
        DtError::ValueError(msg.into())
    }

    pub fn is_interrupt(&self) -> bool {
        matches!(self, DtError::KeyboardInterrupt)
    }
}

impl Clone for DtError {
    fn clone(&self) -> Self {
        match self {
            DtError::TypeError(s) => DtError::TypeError(s.clone()),
            DtError::ValueError(s) => DtError::ValueError(s.clone()),
            DtError::IoError(e) => {
                DtError::IoError(std::io::Error::new(e.kind(), e.to_string()))
            }
            DtError::OverflowError(s) => DtError::OverflowError(s.clone()),
            DtError::MemoryError(n) => DtError::MemoryError(*n),
            DtError::NotImplemented(s) => DtError::NotImplemented(s.clone()),
            DtError::KeyboardInterrupt => DtError::KeyboardInterrupt,
            DtError::InvalidFormat(s) => DtError::InvalidFormat(s.clone()),
        }
    }
}
