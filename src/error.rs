//! Error types for sutura operations.

use thiserror::Error;

/// Broad classification of a [`SuturaError`].
///
/// Orchestrators use the category to decide between aborting and routing the
/// failure through a wound policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// The artifact is not what it claims to be, or is corrupt.
    Format,
    /// The underlying reader, writer or filesystem failed.
    Io,
    /// Content on disk does not match its signature.
    Integrity,
    /// The caller asked for an invalid combination of options.
    Usage,
    /// The operation was cancelled because a peer task failed.
    Cancelled,
}

/// Errors that can occur during sutura operations.
#[derive(Error, Debug)]
pub enum SuturaError {
    /// I/O error during read/write operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Artifact starts with the wrong magic number.
    #[error("Unrecognized format: expected magic {expected:#x}, got {actual:#x}")]
    UnrecognizedFormat {
        /// Magic number the reader was looking for
        expected: u32,
        /// Magic number actually found
        actual: u32,
    },

    /// Header names a compression algorithm this build does not know.
    #[error("Unknown compression algorithm: {0}")]
    UnknownCompression(u8),

    /// Artifact is structurally invalid.
    #[error("Malformed artifact: {0}")]
    Malformed(String),

    /// Artifact ended before all expected messages were read.
    #[error("Truncated artifact: {0}")]
    Truncated(String),

    /// Message could not be serialized or deserialized.
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// A byte range failed verification and no wound policy was configured.
    #[error("Integrity error: {path} is corrupted in range [{start}, {end})")]
    Integrity {
        /// Container path of the wounded file
        path: String,
        /// First corrupted byte
        start: u64,
        /// One past the last corrupted byte
        end: u64,
    },

    /// Invalid configuration, rejected before any I/O happens.
    #[error("Invalid usage: {0}")]
    Usage(String),

    /// A peer in a producer/consumer pipeline went away.
    #[error("Operation cancelled")]
    Cancelled,
}

impl SuturaError {
    /// Classify this error.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::Io(_) => ErrorCategory::Io,
            Self::UnrecognizedFormat { .. }
            | Self::UnknownCompression(_)
            | Self::Malformed(_)
            | Self::Truncated(_)
            | Self::Encoding(_) => ErrorCategory::Format,
            Self::Integrity { .. } => ErrorCategory::Integrity,
            Self::Usage(_) => ErrorCategory::Usage,
            Self::Cancelled => ErrorCategory::Cancelled,
        }
    }

    /// Whether retrying at a higher level (e.g. re-fetching) may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}

impl From<bincode::Error> for SuturaError {
    fn from(err: bincode::Error) -> Self {
        match *err {
            bincode::ErrorKind::Io(io) => Self::Io(io),
            other => Self::Encoding(other.to_string()),
        }
    }
}

/// Result type for sutura operations.
pub type Result<T> = std::result::Result<T, SuturaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = SuturaError::Io(io_err);
        assert!(err.to_string().contains("I/O error"));
    }

    #[test]
    fn error_display_unrecognized_format() {
        let err = SuturaError::UnrecognizedFormat {
            expected: 0x0FEF_5F00,
            actual: 0x1234,
        };
        let msg = err.to_string();
        assert!(msg.contains("0xfef5f00"));
        assert!(msg.contains("0x1234"));
    }

    #[test]
    fn error_display_integrity() {
        let err = SuturaError::Integrity {
            path: "bin/game".to_string(),
            start: 65536,
            end: 131_072,
        };
        let msg = err.to_string();
        assert!(msg.contains("bin/game"));
        assert!(msg.contains("[65536, 131072)"));
    }

    #[test]
    fn categories() {
        assert_eq!(SuturaError::UnknownCompression(9).category(), ErrorCategory::Format);
        assert_eq!(SuturaError::Truncated(String::new()).category(), ErrorCategory::Format);
        assert_eq!(SuturaError::Usage(String::new()).category(), ErrorCategory::Usage);
        assert_eq!(SuturaError::Cancelled.category(), ErrorCategory::Cancelled);
        let io = SuturaError::Io(std::io::Error::other("boom"));
        assert_eq!(io.category(), ErrorCategory::Io);
    }

    #[test]
    fn only_io_is_retryable() {
        assert!(SuturaError::Io(std::io::Error::other("net")).is_retryable());
        assert!(!SuturaError::Malformed("bad".into()).is_retryable());
        assert!(!SuturaError::Cancelled.is_retryable());
    }

    #[test]
    fn bincode_io_error_maps_to_io() {
        let result: std::result::Result<u64, _> = bincode::deserialize_from(&[1u8, 2][..]);
        let err: SuturaError = result.unwrap_err().into();
        assert_eq!(err.category(), ErrorCategory::Io);
    }
}
