//! Decoder for the RMonitor ASCII timing protocol.
//!
//! Record layouts (positional fields after the leading token, the
//! quoting stripped by [`timing_protocol::rmonitor::tokenize_record`]):
//!
//! - `$A,"num","number","name","classId"` — competitor, no team
//! - `$COMP,"num","number","name","team","classId"` — competitor w/ team
//! - `$B,"sessionId","sessionName"` — event/run info
//! - `$C,"classId","className"` — class id → name
//! - `$F,"seq","flag","localTimeOfDay","timeToGo","lapsToGo"` — heartbeat
//! - `$G,"number","overallPosition","laps","raceTime"` — race info
//! - `$H,"number","laps","lapTime"` — practice/qualifying lap
//!
//! Unrecognized leading tokens are ignored. A record with too few
//! fields for its token is parsed best-effort: present fields are used,
//! absent ones default, and the record is never allowed to abort
//! decoding of the rest of the payload.

use std::collections::HashMap;

use timing_protocol::rmonitor::{split_records, tokenize_record};
use timing_protocol::Flag;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompetitorRecord {
    pub number: String,
    pub name: String,
    pub team: String,
    pub class: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RMonitorUpdate {
    /// A rebuilt roster snapshot (spec: "rebuilds eventEntries").
    CompetitorState { entries: Vec<CompetitorRecord> },
    Heartbeat {
        flag: Flag,
        local_time_of_day: String,
        time_to_go: String,
        laps_to_go: Option<u32>,
    },
    CarLap {
        number: String,
        overall_position: Option<u32>,
        laps: Option<u32>,
        race_time: String,
        track_flag: Flag,
    },
    PracticeLap {
        number: String,
        laps: Option<u32>,
        lap_time: String,
    },
    SessionChanged {
        session_id: String,
        session_name: String,
    },
}

fn get(fields: &[String], idx: usize) -> String {
    fields.get(idx).cloned().unwrap_or_default()
}

fn get_opt(fields: &[String], idx: usize) -> Option<String> {
    fields.get(idx).filter(|s| !s.is_empty()).cloned()
}

/// Stateful across calls within one process: the class-id → name map
/// and the current roster persist so `$A`/`$COMP` records resolve class
/// names regardless of whether `$C` arrived before or after them, and
/// so a later heartbeat's flag can be mirrored onto `$G` car-lap
/// updates without the caller threading it through.
#[derive(Debug, Default)]
pub struct RMonitorDecoder {
    class_map: HashMap<String, String>,
    roster: Vec<CompetitorRecord>,
    current_flag: Flag,
}

impl RMonitorDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes every record in `payload`, returning the updates produced
    /// in record order. Malformed individual records are skipped; they
    /// never abort decoding of the rest of the payload.
    pub fn decode(&mut self, payload: &str) -> Vec<RMonitorUpdate> {
        let mut updates = Vec::new();
        let mut roster_changed = false;

        for line in split_records(payload) {
            let fields = match tokenize_record(line) {
                Ok(f) => f,
                Err(_) => continue,
            };
            if fields.is_empty() {
                continue;
            }

            match fields[0].as_str() {
                "$A" => {
                    self.upsert_roster(CompetitorRecord {
                        number: get(&fields, 1),
                        name: get(&fields, 2),
                        team: String::new(),
                        class: self.resolve_class(&get(&fields, 3)),
                    });
                    roster_changed = true;
                }
                "$COMP" => {
                    self.upsert_roster(CompetitorRecord {
                        number: get(&fields, 1),
                        name: get(&fields, 2),
                        team: get(&fields, 3),
                        class: self.resolve_class(&get(&fields, 4)),
                    });
                    roster_changed = true;
                }
                "$C" => {
                    let class_id = get(&fields, 1);
                    let class_name = get(&fields, 2);
                    if !class_id.is_empty() {
                        self.class_map.insert(class_id, class_name);
                    }
                }
                "$F" => {
                    // fields[1] is a sequence/heartbeat id, not modeled.
                    let flag = Flag::from_rmonitor_code(&get(&fields, 2));
                    self.current_flag = flag;
                    updates.push(RMonitorUpdate::Heartbeat {
                        flag,
                        local_time_of_day: get(&fields, 3),
                        time_to_go: get(&fields, 4),
                        laps_to_go: get_opt(&fields, 5).and_then(|s| s.parse().ok()),
                    });
                }
                "$G" => {
                    updates.push(RMonitorUpdate::CarLap {
                        number: get(&fields, 1),
                        overall_position: get_opt(&fields, 2).and_then(|s| s.parse().ok()),
                        laps: get_opt(&fields, 3).and_then(|s| s.parse().ok()),
                        race_time: get(&fields, 4),
                        track_flag: self.current_flag,
                    });
                }
                "$H" => {
                    updates.push(RMonitorUpdate::PracticeLap {
                        number: get(&fields, 1),
                        laps: get_opt(&fields, 2).and_then(|s| s.parse().ok()),
                        lap_time: get(&fields, 3),
                    });
                }
                "$B" => {
                    updates.push(RMonitorUpdate::SessionChanged {
                        session_id: get(&fields, 1),
                        session_name: get(&fields, 2),
                    });
                }
                _ => {}
            }
        }

        if roster_changed {
            updates.insert(
                0,
                RMonitorUpdate::CompetitorState {
                    entries: self.roster.clone(),
                },
            );
        }

        updates
    }

    fn resolve_class(&self, class_id: &str) -> String {
        self.class_map
            .get(class_id)
            .cloned()
            .unwrap_or_else(|| class_id.to_string())
    }

    fn upsert_roster(&mut self, record: CompetitorRecord) {
        if let Some(existing) = self.roster.iter_mut().find(|c| c.number == record.number) {
            *existing = record;
        } else {
            self.roster.push(record);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_competitor_and_class() {
        let mut decoder = RMonitorDecoder::new();
        let updates = decoder.decode("$C,\"1\",\"GT3\"\n$A,\"1\",\"42\",\"Alice Smith\",\"1\"");
        assert_eq!(updates.len(), 1);
        match &updates[0] {
            RMonitorUpdate::CompetitorState { entries } => {
                assert_eq!(entries.len(), 1);
                assert_eq!(entries[0].number, "42");
                assert_eq!(entries[0].class, "GT3");
            }
            other => panic!("unexpected update: {other:?}"),
        }
    }

    #[test]
    fn class_can_resolve_after_competitor_in_a_later_call() {
        let mut decoder = RMonitorDecoder::new();
        decoder.decode("$A,\"1\",\"42\",\"Alice Smith\",\"1\"");
        decoder.decode("$C,\"1\",\"GT3\"");
        let updates = decoder.decode("$A,\"1\",\"42\",\"Alice Smith\",\"1\"");
        match &updates[0] {
            RMonitorUpdate::CompetitorState { entries } => {
                assert_eq!(entries[0].class, "GT3");
            }
            other => panic!("unexpected update: {other:?}"),
        }
    }

    #[test]
    fn reprocessing_same_a_record_is_a_noop_on_roster_shape() {
        let mut decoder = RMonitorDecoder::new();
        let first = decoder.decode("$A,\"1\",\"42\",\"Alice Smith\",\"1\"");
        let second = decoder.decode("$A,\"1\",\"42\",\"Alice Smith\",\"1\"");
        assert_eq!(first, second);
    }

    #[test]
    fn heartbeat_flag_mirrors_onto_car_lap() {
        let mut decoder = RMonitorDecoder::new();
        let updates = decoder.decode("$F,\"1\",\"G\",\"00:12:34.567\",\"00:05:00\",\"5\"\n$G,\"42\",\"1\",\"10\",\"00:12:30.000\"");
        let car_lap = updates
            .iter()
            .find_map(|u| match u {
                RMonitorUpdate::CarLap { track_flag, .. } => Some(*track_flag),
                _ => None,
            })
            .unwrap();
        assert_eq!(car_lap, Flag::Green);
    }

    #[test]
    fn malformed_record_is_skipped_not_fatal() {
        let mut decoder = RMonitorDecoder::new();
        // Empty line between two valid records must not stop decoding.
        let updates = decoder.decode("$F,\"1\",\"Y\",\"00:00:01.000\",\"\",\"\"\n\n$G,\"7\",\"2\",\"3\",\"00:00:02.000\"");
        assert_eq!(updates.len(), 2);
    }

    #[test]
    fn session_changed_record() {
        let mut decoder = RMonitorDecoder::new();
        let updates = decoder.decode("$B,\"7\",\"Race 1\"");
        assert_eq!(
            updates[0],
            RMonitorUpdate::SessionChanged {
                session_id: "7".to_string(),
                session_name: "Race 1".to_string()
            }
        );
    }
}
