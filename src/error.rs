use std::io;

use thiserror::Error;

/// Unit-only mirror of [`Error`], for callers that want to branch on error
/// kind without matching on payload-carrying variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    PathInvalid,
    NotExist,
    HashMismatch,
    Decompression,
    SizeOverflow,
    TooManyFiles,
    RangeUnsupported,
    PreconditionFailed,
    CacheIo,
    Policy,
    Cancelled,
    Network,
    Protocol,
    Io,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("path invalid: {0}")]
    PathInvalid(String),

    #[error("path not found: {0}")]
    NotExist(String),

    #[error("hash mismatch for {path}: expected {expected}, got {actual}")]
    HashMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("decompression failed: {0}")]
    Decompression(String),

    #[error("size overflow: {0}")]
    SizeOverflow(String),

    #[error("too many files: {count} exceeds cap of {max}")]
    TooManyFiles { count: usize, max: usize },

    #[error("server does not support range requests: {0}")]
    RangeUnsupported(String),

    #[error("precondition failed after retry: {0}")]
    PreconditionFailed(String),

    #[error("cache I/O error: {0}")]
    CacheIo(#[source] Box<Error>),

    #[error("policy rejected manifest: {0}")]
    Policy(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("network error: {0}")]
    Network(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::PathInvalid(_) => ErrorKind::PathInvalid,
            Error::NotExist(_) => ErrorKind::NotExist,
            Error::HashMismatch { .. } => ErrorKind::HashMismatch,
            Error::Decompression(_) => ErrorKind::Decompression,
            Error::SizeOverflow(_) => ErrorKind::SizeOverflow,
            Error::TooManyFiles { .. } => ErrorKind::TooManyFiles,
            Error::RangeUnsupported(_) => ErrorKind::RangeUnsupported,
            Error::PreconditionFailed(_) => ErrorKind::PreconditionFailed,
            Error::CacheIo(_) => ErrorKind::CacheIo,
            Error::Policy(_) => ErrorKind::Policy,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Network(_) => ErrorKind::Network,
            Error::Protocol(_) => ErrorKind::Protocol,
            Error::Io(_) => ErrorKind::Io,
        }
    }

    pub fn cache_io(inner: Error) -> Error {
        Error::CacheIo(Box::new(inner))
    }

    pub fn not_exist(path: impl Into<String>) -> Error {
        Error::NotExist(path.into())
    }

    pub fn path_invalid(path: impl Into<String>) -> Error {
        Error::PathInvalid(path.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
