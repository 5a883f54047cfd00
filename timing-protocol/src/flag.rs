use serde::{Deserialize, Serialize};

/// Global track state. Mirrors the session-wide `currentFlag` and the
/// per-segment flag carried in `flagDurations`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Flag {
    #[default]
    Unknown,
    Green,
    Yellow,
    Red,
    White,
    Checkered,
    /// Purple flag used for 35+ masters classes on some RMonitor feeds.
    Purple35,
}

impl Flag {
    /// Maps an RMonitor `$F` heartbeat flag-state single-character code.
    /// Unrecognized codes map to `Unknown` rather than erroring, since a
    /// bad flag token should never stop the heartbeat from updating the
    /// clock fields.
    pub fn from_rmonitor_code(code: &str) -> Flag {
        match code.trim() {
            "G" => Flag::Green,
            "Y" => Flag::Yellow,
            "R" => Flag::Red,
            "W" => Flag::White,
            "C" => Flag::Checkered,
            "P" => Flag::Purple35,
            _ => Flag::Unknown,
        }
    }

    /// True for flags under which the track is considered "live" for the
    /// purposes of session-monitor phase transitions (Idle→Live) and
    /// starting-position inference.
    pub fn is_track_active(self) -> bool {
        matches!(
            self,
            Flag::Green | Flag::Yellow | Flag::White | Flag::Purple35
        )
    }
}
