use std::time::Duration;

use thiserror::Error;

/// Malformed or unexpected bytes in a patch stream. Never retried.
#[derive(Debug, Error)]
pub enum FormatError {
    #[error("invalid patch file: missing magic header")]
    BadMagic,

    #[error("truncated {what} record")]
    Truncated { what: &'static str },

    #[error("malformed {what} record: {reason}")]
    Malformed { what: &'static str, reason: String },

    #[error("{what} record too large: {len} bytes")]
    RecordTooLarge { what: &'static str, len: u64 },

    #[error("sync header index mismatch: expected {expected}, got {actual}")]
    IndexMismatch { expected: u64, actual: u64 },

    #[error("file index {index} out of range ({count} files in container)")]
    FileIndexOutOfRange { index: u64, count: usize },

    #[error("block range {block_index}+{block_span} out of bounds for {path} ({size} bytes)")]
    BlockOutOfBounds {
        path: String,
        size: u64,
        block_index: u64,
        block_span: u64,
    },

    #[error("block range with zero span in target file {file_index}")]
    ZeroSpan { file_index: u64 },

    #[error("reconstructed {path} is {actual} bytes, container says {expected}")]
    SizeMismatch {
        path: String,
        expected: u64,
        actual: u64,
    },

    #[error("file path escapes the output directory: {path}")]
    UnsafePath { path: String },
}

/// Failure of a block transport.
#[derive(Debug, Error, Clone)]
pub enum NetworkError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("remote request failed with HTTP status {status}")]
    Status { status: u16 },

    #[error("expected {expected} bytes for {address}, got {actual}")]
    ShortBody {
        address: String,
        expected: u64,
        actual: u64,
    },

    #[error("invalid block address: {0}")]
    BadAddress(String),

    #[error("fetch cancelled")]
    Cancelled,
}

impl NetworkError {
    /// Whether a later attempt could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            NetworkError::Transport(_) | NetworkError::Timeout(_) => true,
            NetworkError::Status { status } => {
                (500..=599).contains(status) || *status == 408 || *status == 429
            }
            NetworkError::ShortBody { .. }
            | NetworkError::BadAddress(_)
            | NetworkError::Cancelled => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed patch: {0}")]
    Format(#[from] FormatError),

    #[error("no address known for block {block_index} of target file {file_index}")]
    Consistency { file_index: usize, block_index: u64 },

    #[error("read of {len} bytes at {offset} exceeds file {file_index} ({size} bytes)")]
    Range {
        file_index: usize,
        offset: u64,
        len: u64,
        size: u64,
    },

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("apply cancelled")]
    Cancelled,
}

impl Error {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
