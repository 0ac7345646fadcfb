//! Error types.

pub type Result<T> = core::result::Result<T, Error>;

/// Crate-wide error type.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Frames that don't follow the request layout.
    #[error("parsing error: {0}")]
    ParseError(String),
    #[error("failed serializing: {0}")]
    SerializationError(String),
    /// Bytes that can't be decoded into the expected value shape.
    #[error("failed deserializing: {0}")]
    DeserializationError(String),
    #[error("failed parsing encoding from string: {0}")]
    InvalidEncoding(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
}
