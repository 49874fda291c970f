use std::time::Duration;

use lanchat_shared::CodecError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Connection closed by peer")]
    Closed,

    #[error("Timed out after {0:?}")]
    TimedOut(Duration),
}

#[derive(Error, Debug)]
pub enum FileTransferError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timed out after {0:?}")]
    TimedOut(Duration),

    #[error("Transfer rejected: {0}")]
    Rejected(String),

    #[error("Hash mismatch: expected {expected}, got {actual}")]
    IntegrityMismatch { expected: String, actual: String },

    #[error("Connection closed after {received} of {expected} bytes")]
    Incomplete { received: u64, expected: u64 },

    #[error("Invalid file info: {0}")]
    InvalidInfo(String),

    #[error("File name too long: {len} bytes (max {max})")]
    FileNameTooLong { len: usize, max: usize },
}
