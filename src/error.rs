use thiserror::Error;

/// Errors surfaced by channel, ring, and event operations.
///
/// Each variant corresponds to one failure class of the wire-level
/// contract and maps to a stable negative integer via [`ShmError::code`],
/// for callers that ferry status codes across FFI or process boundaries.
#[derive(Debug, Error)]
pub enum ShmError {
    /// An argument violated a documented precondition (zero-length record,
    /// oversize record, undersized receive buffer, malformed name, ...).
    #[error("invalid parameter: {0}")]
    InvalidParam(&'static str),

    /// Mapping, allocation, or thread creation failed.
    #[error("memory mapping or allocation failed")]
    Memory(#[source] std::io::Error),

    /// A blocking wait expired with no event.
    #[error("wait timed out")]
    Timeout,

    /// A non-blocking read found no data.
    #[error("ring is empty")]
    Empty,

    /// A creator collided with an existing named object.
    #[error("shared object already exists")]
    Exists,

    /// An opener could not find a named object.
    #[error("shared object not found")]
    NotFound,

    /// A kernel-level wait or signal failed (closed handle, permissions).
    #[error("kernel wait or signal failed")]
    Access(#[source] std::io::Error),
}

impl ShmError {
    /// The channel's numeric status code for this error.
    ///
    /// Success is `0`; every failure class is a distinct small negative
    /// integer. The assignment is part of the external interface and must
    /// not be reordered.
    pub fn code(&self) -> i32 {
        match self {
            ShmError::InvalidParam(_) => -1,
            ShmError::Memory(_) => -2,
            ShmError::Timeout => -3,
            ShmError::Empty => -4,
            ShmError::Exists => -5,
            ShmError::NotFound => -6,
            ShmError::Access(_) => -7,
        }
    }
}

pub type Result<T> = std::result::Result<T, ShmError>;
