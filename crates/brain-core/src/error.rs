//! Error types for the brain overlay wire format

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// Wire decoding errors
#[derive(Debug, Error)]
pub enum Error {
    /// Control message carried a command we do not understand
    #[error("invalid command: {0}")]
    InvalidCommand(String),

    /// Missing required field
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    /// Field present but of the wrong shape
    #[error("field {field} is not a {expected}")]
    WrongType {
        field: &'static str,
        expected: &'static str,
    },

    /// Message body is not a JSON object
    #[error("message body is not an object")]
    NotAnObject,
}
