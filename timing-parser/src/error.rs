use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("protocol error: {0}")]
    Protocol(#[from] timing_protocol::ProtocolError),

    #[error("malformed {record_kind} record, missing field {field}")]
    MissingField {
        record_kind: &'static str,
        field: &'static str,
    },

    #[error("unrecognized opcode: {0}")]
    UnknownOpcode(String),
}

pub type ParseResult<T> = Result<T, ParseError>;
