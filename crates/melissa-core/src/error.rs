//! Error types for the Melissa wire protocol

use thiserror::Error;

/// Result type for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors raised while encoding, decoding or transporting messages
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Truncated message: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("Unknown message tag: {0}")]
    UnknownTag(i32),

    #[error("Unknown status code: {0}")]
    UnknownStatus(i32),

    #[error("Invalid UTF-8 in message string")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    #[error("Field name too long: {0} bytes")]
    FieldNameTooLong(usize),

    #[error("Unexpected message: {0}")]
    Unexpected(String),

    #[error("Channel closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
