//! Error types for conversion jobs

use thiserror::Error;

/// Main error type for conversion operations
#[derive(Error, Debug)]
pub enum ConvertError {
    #[error("Malformed input: {0}")]
    MalformedInput(String),

    #[error("Missing metadata: {0}")]
    MissingMetadata(String),

    #[error("Unsupported axis convention: {0}")]
    UnsupportedAxisConvention(String),

    #[error("Failed to write chunk {chunk:?} of level {level}: {reason}")]
    ChunkWriteFailure {
        level: usize,
        chunk: Vec<usize>,
        reason: String,
    },

    #[error("Failed to write store metadata: {0}")]
    MetadataWriteFailure(String),

    #[error("Conversion cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse classification of a [`ConvertError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    MalformedInput,
    MissingMetadata,
    UnsupportedAxisConvention,
    ChunkWriteFailure,
    MetadataWriteFailure,
    Cancelled,
    Io,
    Codec,
    InvalidConfig,
    Internal,
}

/// Process exit code for a successful conversion
pub const EXIT_SUCCESS: u8 = 0;
/// Process exit code for usage-level failures (bad input, metadata, configuration)
pub const EXIT_USAGE: u8 = 2;
/// Process exit code for I/O-level failures while writing the store
pub const EXIT_IO: u8 = 3;
/// Process exit code for a cancelled conversion
pub const EXIT_CANCELLED: u8 = 130;

impl ConvertError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConvertError::MalformedInput(_) => ErrorKind::MalformedInput,
            ConvertError::MissingMetadata(_) => ErrorKind::MissingMetadata,
            ConvertError::UnsupportedAxisConvention(_) => ErrorKind::UnsupportedAxisConvention,
            ConvertError::ChunkWriteFailure { .. } => ErrorKind::ChunkWriteFailure,
            ConvertError::MetadataWriteFailure(_) => ErrorKind::MetadataWriteFailure,
            ConvertError::Cancelled => ErrorKind::Cancelled,
            ConvertError::Io(_) => ErrorKind::Io,
            ConvertError::Codec(_) => ErrorKind::Codec,
            ConvertError::InvalidConfig(_) => ErrorKind::InvalidConfig,
            ConvertError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Errors caused by the input or the invocation rather than by storage
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::MalformedInput
                | ErrorKind::MissingMetadata
                | ErrorKind::UnsupportedAxisConvention
                | ErrorKind::InvalidConfig
        )
    }

    /// Exit code reported by the command line tool
    pub fn exit_code(&self) -> u8 {
        if self.is_usage_error() {
            EXIT_USAGE
        } else if self.kind() == ErrorKind::Cancelled {
            EXIT_CANCELLED
        } else {
            EXIT_IO
        }
    }

    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        ConvertError::MalformedInput(msg.into())
    }
}

/// Specialized Result type for conversion operations
pub type Result<T> = std::result::Result<T, ConvertError>;

impl From<serde_json::Error> for ConvertError {
    fn from(err: serde_json::Error) -> Self {
        ConvertError::MalformedInput(format!("invalid JSON: {}", err))
    }
}

impl From<tokio::task::JoinError> for ConvertError {
    fn from(err: tokio::task::JoinError) -> Self {
        ConvertError::Internal(format!("worker task failed: {}", err))
    }
}
