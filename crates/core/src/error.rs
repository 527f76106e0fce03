//! Error types for bfs-core
//!
//! One taxonomy is shared by the client, the tree builder and the data
//! pipeline. Only [`Error::Transient`] is ever retried.

use thiserror::Error;

/// Result type alias for bfs-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for bfs-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed input, e.g. a bucket name that is too short
    #[error("Invalid input: {0}")]
    Validation(String),

    /// Bucket or object does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Bucket or object already exists
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Retryable backend or network fault
    #[error("Transient error: {0}")]
    Transient(String),

    /// Unexpected or inconsistent backend response
    #[error("Fatal error: {0}")]
    Fatal(String),

    /// Operation aborted through its cancellation context
    #[error("Operation cancelled")]
    Cancelled,

    /// File handle used after close
    #[error("Handle closed: {0}")]
    Closed(String),

    /// Configuration file error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// TOML serialization error
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// URL parsing error
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

impl Error {
    /// Whether the client may retry the failed call
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Error::Transient(_))
    }

    /// Get the appropriate exit code for this error
    pub const fn exit_code(&self) -> i32 {
        match self {
            Error::Validation(_) | Error::Config(_) | Error::InvalidUrl(_) => 2, // UsageError
            Error::Transient(_) => 3,                                            // NetworkError
            Error::NotFound(_) => 5,                                             // NotFound
            Error::AlreadyExists(_) => 6,                                        // Conflict
            Error::Cancelled => 130,                                             // Interrupted
            _ => 1,                                                              // GeneralError
        }
    }

    /// Convert into an `std::io::Error`, keeping the original as the source.
    ///
    /// Used where the pipeline has to travel through `AsyncRead`.
    pub fn into_io(self) -> std::io::Error {
        match self {
            Error::Io(e) => e,
            Error::Cancelled => std::io::Error::new(std::io::ErrorKind::Interrupted, Error::Cancelled),
            Error::NotFound(_) => std::io::Error::new(std::io::ErrorKind::NotFound, self),
            other => std::io::Error::other(other),
        }
    }

    /// Recover a bfs error that was carried inside an `std::io::Error`.
    pub fn from_io(err: std::io::Error) -> Self {
        if err.get_ref().is_some_and(|inner| inner.is::<Error>()) {
            if let Some(inner) = err.into_inner() {
                if let Ok(e) = inner.downcast::<Error>() {
                    return *e;
                }
            }
            return Error::Fatal("unrecoverable io error".into());
        }
        Error::Io(err)
    }

    /// Classify a failure while reading an object body from the backend.
    ///
    /// A carried bfs error comes back unchanged. Anything else is a broken
    /// transfer and may be retried.
    pub fn from_body_io(err: std::io::Error) -> Self {
        match Error::from_io(err) {
            Error::Io(e) => Error::Transient(format!("reading object body: {e}")),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_exit_codes() {
        assert_eq!(Error::Validation("test".into()).exit_code(), 2);
        assert_eq!(Error::Config("test".into()).exit_code(), 2);
        assert_eq!(Error::Transient("test".into()).exit_code(), 3);
        assert_eq!(Error::NotFound("test".into()).exit_code(), 5);
        assert_eq!(Error::AlreadyExists("test".into()).exit_code(), 6);
        assert_eq!(Error::Cancelled.exit_code(), 130);
        assert_eq!(Error::Fatal("test".into()).exit_code(), 1);
        assert_eq!(Error::Closed("test".into()).exit_code(), 1);
    }

    #[test]
    fn test_only_transient_is_retryable() {
        assert!(Error::Transient("503".into()).is_retryable());
        assert!(!Error::Fatal("bad".into()).is_retryable());
        assert!(!Error::NotFound("x".into()).is_retryable());
        assert!(!Error::Validation("x".into()).is_retryable());
        assert!(!Error::AlreadyExists("x".into()).is_retryable());
        assert!(!Error::Cancelled.is_retryable());
    }

    #[test]
    fn test_io_round_trip_keeps_kind() {
        let io = Error::Cancelled.into_io();
        assert_eq!(io.kind(), std::io::ErrorKind::Interrupted);
        assert!(matches!(Error::from_io(io), Error::Cancelled));

        let io = Error::NotFound("bucket/key".into()).into_io();
        assert!(matches!(Error::from_io(io), Error::NotFound(k) if k == "bucket/key"));

        let plain = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        assert!(matches!(Error::from_io(plain), Error::Io(_)));
    }

    #[test]
    fn test_body_read_failures_are_transient() {
        let reset = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(matches!(Error::from_body_io(reset), Error::Transient(m) if m.contains("reset")));

        let eof = std::io::Error::from(std::io::ErrorKind::UnexpectedEof);
        assert!(Error::from_body_io(eof).is_retryable());

        assert!(matches!(Error::from_body_io(Error::Cancelled.into_io()), Error::Cancelled));
        let fatal = Error::Fatal("bad".into()).into_io();
        assert!(matches!(Error::from_body_io(fatal), Error::Fatal(_)));
    }

    #[test]
    fn test_error_display() {
        let err = Error::Validation("bucket name too short: ab".into());
        assert_eq!(err.to_string(), "Invalid input: bucket name too short: ab");

        let err = Error::Closed("a/b.txt".into());
        assert_eq!(err.to_string(), "Handle closed: a/b.txt");
    }
}
