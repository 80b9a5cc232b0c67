use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Errors surfaced by the allocator to the protocol layer
#[derive(Debug, Error)]
pub enum AllocatorError {
    /// The tuple does not map to exactly one live allocation: it already
    /// exists on create, or is missing on lookup.
    #[error("allocation mismatch")]
    AllocationMismatch,

    /// Allocation exists but has no live permission for the peer IP
    #[error("permission not found")]
    PermissionNotFound,

    /// Relayed address could not be obtained
    #[error("relayed address allocation failed: {0}")]
    Port(#[from] PortError),

    /// Relay socket write failed
    #[error("relay transport error: {0}")]
    Transport(#[source] io::Error),

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(String),
}

/// Port allocation failures.
///
/// Non-transient bind failures are carried as [`PortError::Io`] with the
/// original `io::Error` untouched.
#[derive(Debug, Error)]
pub enum PortError {
    #[error(transparent)]
    Io(#[from] io::Error),

    /// Every candidate port in the retry budget was taken
    #[error("no free relay port after {attempts} attempts starting at {start}")]
    Exhausted {
        attempts: u32,
        start: SocketAddr,
        #[source]
        last: io::Error,
    },

    #[error("invalid port range: base {base} must be below max {max}")]
    InvalidRange { base: u16, max: u16 },
}

impl PortError {
    /// Underlying I/O cause, if any
    pub fn io_cause(&self) -> Option<&io::Error> {
        match self {
            PortError::Io(e) => Some(e),
            PortError::Exhausted { last, .. } => Some(last),
            PortError::InvalidRange { .. } => None,
        }
    }
}

impl AllocatorError {
    /// Underlying I/O cause for port and transport failures
    pub fn io_cause(&self) -> Option<&io::Error> {
        match self {
            AllocatorError::Port(e) => e.io_cause(),
            AllocatorError::Transport(e) => Some(e),
            _ => None,
        }
    }
}

/// Result type for allocator operations
pub type AllocatorResult<T> = Result<T, AllocatorError>;

/// Result type for port allocation
pub type PortResult<T> = Result<T, PortError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_io_cause_preserved_through_wrapping() {
        let err: AllocatorError =
            PortError::from(io::Error::new(io::ErrorKind::InvalidInput, "invalid")).into();

        let cause = err.io_cause().unwrap();
        assert_eq!(cause.kind(), io::ErrorKind::InvalidInput);
        assert_eq!(cause.to_string(), "invalid");
        assert!(err.to_string().contains("invalid"));
    }

    #[test]
    fn test_exhausted_exposes_last_bind_error_as_source() {
        let err = PortError::Exhausted {
            attempts: 3,
            start: "127.0.0.1:5000".parse().unwrap(),
            last: io::Error::from(io::ErrorKind::AddrInUse),
        };

        let source = err.source().unwrap().downcast_ref::<io::Error>().unwrap();
        assert_eq!(source.kind(), io::ErrorKind::AddrInUse);
    }
}
