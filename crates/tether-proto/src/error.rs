use thiserror::Error;

/// Errors produced while decoding values out of a frame body.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireError {
    #[error("buffer too small: needed {needed} more bytes, {have} available")]
    TooShort { needed: usize, have: usize },
    #[error("invalid utf-8 in string field")]
    Utf8,
}

/// Violations of the framing preconditions. These indicate a programming
/// error on the sending side, not a recoverable condition.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingError {
    #[error("zero-length frame bodies are not allowed")]
    EmptyBody,
    #[error("payload of {0} bytes exceeds the maximum frame body")]
    BodyTooLarge(usize),
    #[error("buffer carries no reserved header prefix")]
    MissingPrefix,
}
