use std::io;

use thiserror::Error;

/// Failure kinds of the image and header subsystems.
///
/// None of these are retried internally. A heap that fails one of the
/// integrity checks is not trusted any further by the operation that
/// detected it.
#[derive(Debug, Error)]
pub enum Error {
    /// Pointer bits were left in an oop map after every ancestor had its turn.
    #[error("{remaining} unrelocated pointer(s) left in oop map of `{uri}`")]
    IntegrityViolation { uri: String, remaining: usize },

    /// The live backing object changed identity while it was being walked.
    #[error("backing object moved during relocation (expected {expected:#x}, found {found:#x})")]
    ConcurrentMutation { expected: u64, found: u64 },

    #[error("address {address:#x} is outside every known image")]
    OutOfRange { address: u64 },

    /// Corrupted method metadata or image layout.
    #[error("format error: {0}")]
    Format(String),

    #[error(
        "parent mismatch: image expects `{expected_uri}` ({expected_hash:#010x}), \
         got `{found_uri}` ({found_hash:#010x})"
    )]
    ParentMismatch {
        expected_uri: String,
        expected_hash: u32,
        found_uri: String,
        found_hash: u32,
    },

    #[error("no image registered under `{uri}`")]
    UnknownImage { uri: String },

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn format(msg: impl Into<String>) -> Self {
        Self::Format(msg.into())
    }

    /// Whether the heap that produced this error must be considered corrupt.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Error::Io(_) | Error::ParentMismatch { .. } | Error::UnknownImage { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_are_not_heap_fatal() {
        let err: Error = io::Error::new(io::ErrorKind::UnexpectedEof, "eof").into();
        assert!(!err.is_fatal());
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn integrity_violation_mentions_uri_and_count() {
        let err = Error::IntegrityViolation {
            uri: "file://app.img".into(),
            remaining: 3,
        };
        assert!(err.is_fatal());
        let text = err.to_string();
        assert!(text.contains("file://app.img"));
        assert!(text.contains('3'));
    }
}
