//! Tokenizing primitives for the Multiloop delimited timing protocol:
//! `\x02`-separated fields, a fixed three-field header in front of each
//! opcode-specific payload.

use crate::error::{ProtocolError, ProtocolResult};

/// The field separator used throughout the Multiloop wire format.
pub const FIELD_SEP: char = '\u{2}';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    /// Brand new record (first time this entity has been reported).
    New,
    /// Unchanged repeat of a previously reported record.
    Repeat,
    /// An update to a previously reported record.
    Update,
}

impl RecordType {
    pub fn from_code(code: &str) -> Option<RecordType> {
        match code {
            "N" => Some(RecordType::New),
            "R" => Some(RecordType::Repeat),
            "U" => Some(RecordType::Update),
            _ => None,
        }
    }

    /// `$F`/`$R` records are only acted on when "dirty" — i.e. not a
    /// verbatim repeat of what was last reported.
    pub fn is_dirty(self) -> bool {
        !matches!(self, RecordType::Repeat)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiloopHeader {
    pub opcode: String,
    pub record_type: Option<RecordType>,
    pub sequence: u32,
}

/// Splits a raw multiloop record into its `\x02`-delimited fields.
pub fn tokenize_record(record: &str) -> Vec<&str> {
    record.split(FIELD_SEP).collect()
}

/// Parses the fixed three-field header (`op, recordType, sequence`) off
/// the front of a tokenized record, returning the header and the
/// remaining opcode-specific fields.
pub fn parse_header<'a>(
    fields: &'a [&'a str],
) -> ProtocolResult<(MultiloopHeader, &'a [&'a str])> {
    if fields.len() < 3 {
        return Err(ProtocolError::ShortHeader {
            expected: 3,
            actual: fields.len(),
        });
    }

    let sequence = u32::from_str_radix(fields[2].trim(), 16)
        .map_err(|_| ProtocolError::InvalidSequence(fields[2].to_string()))?;

    let header = MultiloopHeader {
        opcode: fields[0].to_string(),
        record_type: RecordType::from_code(fields[1]),
        sequence,
    };

    Ok((header, &fields[3..]))
}
