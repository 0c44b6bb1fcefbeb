//! Error types for ESP transform operations
//!
//! Every per-packet failure maps to one [`ErrorClass`], the errno-style
//! category reported to callers alongside the accepted count of a batch.

use corvid_platform::PlatformError;
use std::fmt;

/// Result type for ESP operations
pub type Result<T> = std::result::Result<T, Error>;

/// ESP engine errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// SA or session parameters rejected at construction
    InvalidParameter(String),

    /// Feature or algorithm combination not provided
    NotSupported(String),

    /// Operation not valid in the current state
    InvalidState(String),

    /// Cryptographic backend failure
    CryptoError(String),

    /// Key has the wrong size for the algorithm
    InvalidKeyLength {
        /// Expected key length
        expected: usize,
        /// Actual key length
        actual: usize,
    },

    /// Memory handed to SA init is smaller than required
    InsufficientMemory {
        /// Bytes required
        required: usize,
        /// Bytes provided
        provided: usize,
    },

    /// Sequence number already seen inside the replay window
    ReplayDetected(u64),

    /// Sequence number below the replay window (or zero)
    StaleSequence(u64),

    /// Outbound sequence space exhausted
    SequenceOverflow(u64),

    /// Packet length does not fit the SA layout
    InvalidLength {
        /// Expected length (or alignment)
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Not enough room in the buffer
    BufferTooShort {
        /// Bytes required
        required: usize,
        /// Bytes available
        available: usize,
    },

    /// Padding bytes do not match the ESP padding pattern
    InvalidPadding {
        /// Index of the first mismatching pad byte
        index: usize,
    },

    /// ESP trailer next header does not match the SA
    InvalidNextHeader {
        /// Protocol configured on the SA
        expected: u8,
        /// Protocol found in the trailer
        actual: u8,
    },

    /// L3 header could not be parsed
    MalformedHeader(&'static str),

    /// Crypto or protocol offload flagged the packet as failed
    OffloadFailed,

    /// Packet buffer operation failed
    Platform(PlatformError),
}

/// Errno-style error category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Malformed or policy-violating packet (`EBADMSG`)
    BadMessage,
    /// Invalid argument or configuration (`EINVAL`)
    Invalid,
    /// Sequence space exhausted (`EOVERFLOW`)
    Overflow,
    /// No room in the packet buffer (`ENOSPC`)
    NoSpace,
    /// Not enough memory (`ENOMEM`)
    NoMemory,
    /// Not supported (`ENOTSUP`)
    NotSupported,
}

impl ErrorClass {
    /// Conventional Linux errno value
    pub fn errno(self) -> i32 {
        match self {
            ErrorClass::BadMessage => 74,
            ErrorClass::Invalid => 22,
            ErrorClass::Overflow => 75,
            ErrorClass::NoSpace => 28,
            ErrorClass::NoMemory => 12,
            ErrorClass::NotSupported => 95,
        }
    }
}

impl Error {
    /// Error category
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::InvalidParameter(_)
            | Error::InvalidState(_)
            | Error::CryptoError(_)
            | Error::InvalidKeyLength { .. }
            | Error::MalformedHeader(_) => ErrorClass::Invalid,
            Error::NotSupported(_) => ErrorClass::NotSupported,
            Error::InsufficientMemory { .. } => ErrorClass::NoMemory,
            Error::ReplayDetected(_)
            | Error::StaleSequence(_)
            | Error::InvalidLength { .. }
            | Error::InvalidPadding { .. }
            | Error::InvalidNextHeader { .. }
            | Error::OffloadFailed => ErrorClass::BadMessage,
            Error::SequenceOverflow(_) => ErrorClass::Overflow,
            Error::BufferTooShort { .. } => ErrorClass::NoSpace,
            Error::Platform(err) => match err {
                PlatformError::NoHeadroom { .. } | PlatformError::NoTailroom { .. } => {
                    ErrorClass::NoSpace
                }
                PlatformError::OutOfBounds { .. } | PlatformError::InvalidShift { .. } => {
                    ErrorClass::BadMessage
                }
                PlatformError::InvalidSegment(_) => ErrorClass::Invalid,
            },
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidParameter(msg) => write!(f, "Invalid parameter: {}", msg),
            Error::NotSupported(msg) => write!(f, "Not supported: {}", msg),
            Error::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            Error::CryptoError(msg) => write!(f, "Cryptographic error: {}", msg),
            Error::InvalidKeyLength { expected, actual } => {
                write!(
                    f,
                    "Invalid key length: expected {}, got {}",
                    expected, actual
                )
            }
            Error::InsufficientMemory { required, provided } => {
                write!(
                    f,
                    "Insufficient SA memory: need {} bytes, have {}",
                    required, provided
                )
            }
            Error::ReplayDetected(seq) => {
                write!(f, "Replay attack detected (sequence: {})", seq)
            }
            Error::StaleSequence(seq) => {
                write!(f, "Sequence number outside replay window: {}", seq)
            }
            Error::SequenceOverflow(seq) => {
                write!(f, "Sequence number space exhausted at {}", seq)
            }
            Error::InvalidLength { expected, actual } => {
                write!(
                    f,
                    "Invalid length: expected {}, got {}",
                    expected, actual
                )
            }
            Error::BufferTooShort {
                required,
                available,
            } => {
                write!(
                    f,
                    "Buffer too short: need {} bytes, have {}",
                    required, available
                )
            }
            Error::InvalidPadding { index } => {
                write!(f, "Invalid ESP padding at pad byte {}", index)
            }
            Error::InvalidNextHeader { expected, actual } => {
                write!(
                    f,
                    "Invalid ESP next header: expected {}, got {}",
                    expected, actual
                )
            }
            Error::MalformedHeader(what) => write!(f, "Malformed header: {}", what),
            Error::OffloadFailed => write!(f, "Security offload failed"),
            Error::Platform(err) => write!(f, "Packet buffer error: {}", err),
        }
    }
}

impl std::error::Error for Error {}

impl From<PlatformError> for Error {
    fn from(err: PlatformError) -> Self {
        Error::Platform(err)
    }
}
