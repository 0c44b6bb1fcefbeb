//! Error types for packet buffer operations

use std::fmt;

/// Errors raised by the packet buffer provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformError {
    /// Not enough head room in the first segment
    NoHeadroom {
        /// Bytes requested
        required: usize,
        /// Bytes available
        available: usize,
    },

    /// Not enough tail room in the last segment
    NoTailroom {
        /// Bytes requested
        required: usize,
        /// Bytes available
        available: usize,
    },

    /// Access outside of the packet (or of its last segment's tail room)
    OutOfBounds {
        /// Packet offset of the access
        offset: usize,
        /// Length of the access
        len: usize,
        /// Bytes addressable at the time of the access
        limit: usize,
    },

    /// A byte shift would move data outside of the addressed buffer
    InvalidShift {
        /// Start of the shifted range
        start: usize,
        /// End of the shifted range
        end: usize,
        /// Signed displacement
        delta: isize,
    },

    /// Segment construction parameters are inconsistent
    InvalidSegment(String),
}

impl fmt::Display for PlatformError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlatformError::NoHeadroom {
                required,
                available,
            } => write!(
                f,
                "No head room: need {} bytes, have {}",
                required, available
            ),
            PlatformError::NoTailroom {
                required,
                available,
            } => write!(
                f,
                "No tail room: need {} bytes, have {}",
                required, available
            ),
            PlatformError::OutOfBounds { offset, len, limit } => write!(
                f,
                "Access out of bounds: {} bytes at offset {} (limit {})",
                len, offset, limit
            ),
            PlatformError::InvalidShift { start, end, delta } => {
                write!(f, "Invalid shift of [{}, {}) by {}", start, end, delta)
            }
            PlatformError::InvalidSegment(msg) => write!(f, "Invalid segment: {}", msg),
        }
    }
}

impl std::error::Error for PlatformError {}

/// Result type for packet buffer operations
pub type PlatformResult<T> = Result<T, PlatformError>;
