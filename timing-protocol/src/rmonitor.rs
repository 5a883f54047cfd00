//! Tokenizing primitives for the RMonitor ASCII timing protocol: quoted,
//! comma-separated records, one per line.

use crate::error::{ProtocolError, ProtocolResult};

/// Splits a raw RMonitor payload (possibly several records batched into
/// one message) into individual record lines.
pub fn split_records(payload: &str) -> Vec<&str> {
    payload
        .split(['\r', '\n'])
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect()
}

/// Tokenizes one comma-separated, optionally double-quoted RMonitor
/// record into its raw field strings (quotes stripped). Best-effort: an
/// unterminated quote simply consumes the rest of the line rather than
/// erroring, since the decoder is expected to keep going past a
/// malformed record.
pub fn tokenize_record(line: &str) -> ProtocolResult<Vec<String>> {
    if line.is_empty() {
        return Err(ProtocolError::EmptyRecord);
    }

    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for c in line.chars() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => fields.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    fields.push(current);

    Ok(fields)
}

/// Returns the unquoted leading token (`$A`, `$COMP`, `$F`, ...) used to
/// dispatch decoding, without tokenizing the rest of the record.
pub fn leading_token(line: &str) -> Option<&str> {
    line.split(',').next().map(|s| s.trim_matches('"').trim())
}
