use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("empty record")]
    EmptyRecord,

    #[error("multiloop header too short: expected at least {expected} tokens, got {actual}")]
    ShortHeader { expected: usize, actual: usize },

    #[error("invalid hex sequence number: {0}")]
    InvalidSequence(String),
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;
