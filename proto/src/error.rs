use thiserror::Error;

/// Failure modes for decoding a branded identifier from its external representation.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid base64: {0}")]
    InvalidBase64(#[from] base64::DecodeError),
    #[error("decoded id has the wrong length")]
    InvalidLength,
}
