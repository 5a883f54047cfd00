//! Decoder for the Multiloop delimited timing protocol.
//!
//! Every record starts with the shared `op, recordType, sequence`
//! header handled by [`timing_protocol::multiloop::parse_header`]. The
//! fields after the header are opcode-specific:
//!
//! - `$H` heartbeat: `runType, flag, timeToGo, lapsToGo`
//! - `$E` entry: `number, name, class`
//! - `$C` completed lap: `number, lapNumber, lapTimeMs, totalTimeMs`
//! - `$S` completed section: `number, sectionId, sectionName, elapsedMs`
//! - `$L` line crossing: `loopId, loopName, number, timeOfDay`
//! - `$I` invalidated lap: `number, lapNumber`
//! - `$F` flag metrics: `flag, startTime, endTime`
//! - `$R` practice/qualifying run type: `runType`
//! - `$N` new leader: `number`
//! - `$T` track info: `name`
//! - `$A` announcement: `text`
//! - `$V` version: `version`
//!
//! `$F`/`$R` repeats (`RecordType::Repeat`) are filtered out before they
//! reach [`MultiloopUpdate`] — a verbatim repeat carries no new
//! information and the core should never have to re-derive that.

use timing_protocol::multiloop::{parse_header, tokenize_record};
use timing_protocol::Flag;

use crate::error::{ParseError, ParseResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunType {
    Practice,
    Qualifying,
    Set,
    Race,
}

impl RunType {
    pub fn from_code(code: &str) -> Option<RunType> {
        match code {
            "P" => Some(RunType::Practice),
            "Q" => Some(RunType::Qualifying),
            "S" => Some(RunType::Set),
            "R" => Some(RunType::Race),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MultiloopUpdate {
    Heartbeat {
        run_type: Option<RunType>,
        flag: Flag,
        time_to_go: String,
        laps_to_go: Option<u32>,
    },
    Entry {
        number: String,
        name: String,
        class: String,
    },
    CompletedLap {
        number: String,
        lap_number: Option<u32>,
        lap_time_ms: Option<u64>,
        total_time_ms: Option<u64>,
    },
    CompletedSection {
        number: String,
        section_id: String,
        section_name: String,
        elapsed_ms: Option<u64>,
    },
    LineCrossing {
        loop_id: String,
        loop_name: String,
        number: String,
        time_of_day: String,
    },
    InvalidatedLap {
        number: String,
        lap_number: Option<u32>,
    },
    FlagMetrics {
        flag: Flag,
        start_time: String,
        end_time: Option<String>,
    },
    PracticeQualifying {
        run_type: Option<RunType>,
    },
    NewLeader {
        number: String,
    },
    TrackInfo {
        name: String,
    },
    Announcement {
        text: String,
    },
    Version {
        version: String,
    },
}

fn field(fields: &[&str], idx: usize) -> String {
    fields.get(idx).map(|s| s.to_string()).unwrap_or_default()
}

fn field_opt(fields: &[&str], idx: usize) -> Option<String> {
    fields
        .get(idx)
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

/// Decodes a single `\x02`-delimited multiloop record.
///
/// Returns `Ok(None)` for a record that is well-formed but carries no
/// actionable update — a `Repeat` of `$F`/`$R`, or an unrecognized
/// opcode. Returns `Err` only when the shared header itself cannot be
/// parsed (spec: malformed headers are logged and the record dropped,
/// never fatal to the feed).
pub fn decode_record(record: &str) -> ParseResult<Option<MultiloopUpdate>> {
    let tokens = tokenize_record(record);
    let (header, rest) = parse_header(&tokens).map_err(ParseError::Protocol)?;

    let is_dirty = header.record_type.map(|rt| rt.is_dirty()).unwrap_or(true);

    let update = match header.opcode.as_str() {
        "$H" => Some(MultiloopUpdate::Heartbeat {
            run_type: RunType::from_code(&field(rest, 0)),
            flag: Flag::from_rmonitor_code(&field(rest, 1)),
            time_to_go: field(rest, 2),
            laps_to_go: field_opt(rest, 3).and_then(|s| s.parse().ok()),
        }),
        "$E" => Some(MultiloopUpdate::Entry {
            number: field(rest, 0),
            name: field(rest, 1),
            class: field(rest, 2),
        }),
        "$C" => Some(MultiloopUpdate::CompletedLap {
            number: field(rest, 0),
            lap_number: field_opt(rest, 1).and_then(|s| s.parse().ok()),
            lap_time_ms: field_opt(rest, 2).and_then(|s| s.parse().ok()),
            total_time_ms: field_opt(rest, 3).and_then(|s| s.parse().ok()),
        }),
        "$S" => Some(MultiloopUpdate::CompletedSection {
            number: field(rest, 0),
            section_id: field(rest, 1),
            section_name: field(rest, 2),
            elapsed_ms: field_opt(rest, 3).and_then(|s| s.parse().ok()),
        }),
        "$L" => Some(MultiloopUpdate::LineCrossing {
            loop_id: field(rest, 0),
            loop_name: field(rest, 1),
            number: field(rest, 2),
            time_of_day: field(rest, 3),
        }),
        "$I" => Some(MultiloopUpdate::InvalidatedLap {
            number: field(rest, 0),
            lap_number: field_opt(rest, 1).and_then(|s| s.parse().ok()),
        }),
        "$F" if is_dirty => Some(MultiloopUpdate::FlagMetrics {
            flag: Flag::from_rmonitor_code(&field(rest, 0)),
            start_time: field(rest, 1),
            end_time: field_opt(rest, 2),
        }),
        "$F" => None,
        "$R" if is_dirty => Some(MultiloopUpdate::PracticeQualifying {
            run_type: RunType::from_code(&field(rest, 0)),
        }),
        "$R" => None,
        "$N" => Some(MultiloopUpdate::NewLeader {
            number: field(rest, 0),
        }),
        "$T" => Some(MultiloopUpdate::TrackInfo {
            name: field(rest, 0),
        }),
        "$A" => Some(MultiloopUpdate::Announcement {
            text: field(rest, 0),
        }),
        "$V" => Some(MultiloopUpdate::Version {
            version: field(rest, 0),
        }),
        _ => None,
    };

    Ok(update)
}
