//! The authoritative in-memory state: `SessionState` and `CarPosition`,
//! plus the flag-segment and lifecycle types they carry.
//!
//! Exactly one `SessionState` is live per process. Mutation only ever
//! happens under [`crate::context::SessionContext`]'s write lock.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use timing_contracts::patch::{CompletedSection, FlagDuration, PenaltyCounts, PositionsGained};
use timing_protocol::Flag;

/// Roster entry carried in `eventEntries[]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEntry {
    pub number: String,
    pub name: String,
    pub team: String,
    pub class: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CarPosition {
    pub number: String,
    pub transponder_id: Option<String>,
    pub driver_name: String,
    pub class: String,

    pub overall_position: u32,
    pub class_position: u32,
    pub last_lap_completed: u32,
    pub total_time: String,
    pub last_lap_time: String,
    pub best_time: String,
    pub track_flag: Flag,

    pub overall_gap: String,
    pub overall_difference: String,
    pub in_class_gap: String,
    pub in_class_difference: String,
    pub is_best_time: bool,
    pub is_best_time_class: bool,
    pub overall_starting_position: u32,
    pub in_class_starting_position: u32,
    pub overall_positions_gained: Option<PositionsGained>,
    pub in_class_positions_gained: Option<PositionsGained>,
    pub is_overall_most_positions_gained: bool,
    pub is_class_most_positions_gained: bool,

    pub is_in_pit: bool,
    pub is_entered_pit: bool,
    pub is_exited_pit: bool,
    pub is_pit_start_finish: bool,
    pub last_loop_name: String,
    pub pit_stop_count: u32,
    /// Lap number the car was last pitted on, `0` if never.
    pub last_lap_pitted: u32,
    pub lap_included_pit: bool,

    pub completed_sections: Vec<CompletedSection>,

    pub current_status: String,
    pub projected_lap_time: String,
    pub is_fastest_pace: bool,
    pub penalties: PenaltyCounts,
}

impl CarPosition {
    /// A freshly seen car: every enrichable field starts at its
    /// "not yet computed" value.
    pub fn new(number: impl Into<String>) -> Self {
        Self {
            number: number.into(),
            transponder_id: None,
            driver_name: String::new(),
            class: String::new(),
            overall_position: 0,
            class_position: 0,
            last_lap_completed: 0,
            total_time: String::new(),
            last_lap_time: String::new(),
            best_time: String::new(),
            track_flag: Flag::Unknown,
            overall_gap: String::new(),
            overall_difference: String::new(),
            in_class_gap: String::new(),
            in_class_difference: String::new(),
            is_best_time: false,
            is_best_time_class: false,
            overall_starting_position: 0,
            in_class_starting_position: 0,
            overall_positions_gained: None,
            in_class_positions_gained: None,
            is_overall_most_positions_gained: false,
            is_class_most_positions_gained: false,
            is_in_pit: false,
            is_entered_pit: false,
            is_exited_pit: false,
            is_pit_start_finish: false,
            last_loop_name: String::new(),
            pit_stop_count: 0,
            last_lap_pitted: 0,
            lap_included_pit: false,
            completed_sections: Vec::new(),
            current_status: String::new(),
            projected_lap_time: String::new(),
            is_fastest_pace: false,
            penalties: PenaltyCounts::default(),
        }
    }
}

/// The session-wide state, authoritative and singular per process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub event_id: String,
    pub session_id: String,
    pub session_name: String,

    pub local_time_of_day: String,
    pub running_race_time: String,
    pub time_to_go: String,
    pub laps_to_go: u32,

    pub current_flag: Flag,
    pub flag_durations: Vec<FlagDuration>,
    pub green_time_ms: u64,
    pub yellow_time_ms: u64,
    pub red_time_ms: u64,
    pub yellow_laps: u32,
    pub yellow_count: u32,
    pub average_race_speed: f64,
    pub lead_changes: u32,

    pub event_entries: Vec<EventEntry>,
    pub car_positions: HashMap<String, CarPosition>,

    /// Set true the first time a multiloop record is decoded for this
    /// session; enrichers prefer multiloop ground truth once set.
    pub is_multiloop_active: bool,
}

impl SessionState {
    pub fn new(event_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            event_id: event_id.into(),
            session_id: session_id.into(),
            session_name: String::new(),
            local_time_of_day: String::new(),
            running_race_time: String::new(),
            time_to_go: String::new(),
            laps_to_go: 0,
            current_flag: Flag::Unknown,
            flag_durations: Vec::new(),
            green_time_ms: 0,
            yellow_time_ms: 0,
            red_time_ms: 0,
            yellow_laps: 0,
            yellow_count: 0,
            average_race_speed: 0.0,
            lead_changes: 0,
            event_entries: Vec::new(),
            car_positions: HashMap::new(),
            is_multiloop_active: false,
        }
    }

    /// (I1) `car_positions[*].number` is already guaranteed unique by
    /// the map key; this just returns a sorted view for display/tests.
    pub fn cars_sorted_by_overall_position(&self) -> Vec<&CarPosition> {
        let mut cars: Vec<&CarPosition> = self.car_positions.values().collect();
        cars.sort_by_key(|c| if c.overall_position == 0 { u32::MAX } else { c.overall_position });
        cars
    }

    /// (I2) dense 1..N class ranking check, used by tests.
    pub fn class_positions_are_dense(&self, class: &str) -> bool {
        let mut positions: Vec<u32> = self
            .car_positions
            .values()
            .filter(|c| c.class == class)
            .map(|c| c.class_position)
            .collect();
        positions.sort_unstable();
        positions.iter().enumerate().all(|(i, &p)| p == (i as u32 + 1))
    }

    /// (I5) flag segments are time-ordered, non-overlapping, and at
    /// most one is open.
    pub fn flag_durations_are_valid(&self) -> bool {
        let open_count = self
            .flag_durations
            .iter()
            .filter(|d| d.end_time.is_none())
            .count();
        if open_count > 1 {
            return false;
        }
        self.flag_durations
            .windows(2)
            .all(|pair| pair[0].start_time <= pair[1].start_time)
    }
}
