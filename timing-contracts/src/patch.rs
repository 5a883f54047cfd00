//! `SessionStatePatch` / `CarPositionPatch`: sparse deltas whose present
//! fields denote a change. Merging two patches is field-last-wins;
//! missing fields preserve whatever the accumulated patch already had.

use serde::{Deserialize, Serialize};
use timing_protocol::Flag;

/// One roster entry, mirrored verbatim from the `$A`/`$COMP` competitor
/// records into `SessionState::eventEntries`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEntry {
    pub number: String,
    pub name: String,
    pub team: String,
    pub class: String,
}

/// A single flag segment. `end_time` is `None` while the segment is the
/// open (current) one; at most one segment in `flagDurations` may be
/// open at a time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagDuration {
    pub flag: Flag,
    pub start_time: String,
    pub end_time: Option<String>,
}

/// A car's positions-gained figure, or the `InvalidPosition` sentinel
/// used when either the starting position or the current position is
/// unknown (encoded as `0` upstream). Kept as an explicit enum rather
/// than folding the sentinel into the `i32` range, so a patch can still
/// distinguish "field not touched this update" (the outer `Option`) from
/// "field touched, value is invalid" (`PositionsGained::Invalid`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionsGained {
    Value(i32),
    Invalid,
}

/// A completed track section, used for Multiloop `$S` section timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedSection {
    pub id: String,
    pub name: String,
    pub elapsed_ms: u64,
    pub last_section_time_ms: Option<u64>,
    pub last_lap: u32,
}

/// Penalty counts computed by the control-log enricher for one car.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PenaltyCounts {
    pub warnings: u32,
    pub laps: u32,
}

macro_rules! merge_field {
    ($self:ident, $other:ident, $field:ident) => {
        if $other.$field.is_some() {
            $self.$field = $other.$field;
        }
    };
}

/// Sparse delta over `SessionState`. The identity key (`event_id`,
/// `session_id`) is always present; every other field is `Some` only
/// when that field changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStatePatch {
    pub event_id: String,
    pub session_id: String,

    pub session_name: Option<String>,
    pub local_time_of_day: Option<String>,
    pub running_race_time: Option<String>,
    pub time_to_go: Option<String>,
    pub laps_to_go: Option<u32>,

    pub current_flag: Option<Flag>,
    pub flag_durations: Option<Vec<FlagDuration>>,
    pub green_time_ms: Option<u64>,
    pub yellow_time_ms: Option<u64>,
    pub red_time_ms: Option<u64>,
    pub yellow_laps: Option<u32>,
    pub yellow_count: Option<u32>,
    pub average_race_speed: Option<f64>,
    pub lead_changes: Option<u32>,

    pub event_entries: Option<Vec<EventEntry>>,
    /// Set true once a Multiloop record has been decoded for this
    /// session; enrichers and the pit/loop processor consult it to
    /// prefer Multiloop ground truth over RMonitor.
    pub is_multiloop_active: Option<bool>,
}

impl SessionStatePatch {
    pub fn identity(event_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            event_id: event_id.into(),
            session_id: session_id.into(),
            session_name: None,
            local_time_of_day: None,
            running_race_time: None,
            time_to_go: None,
            laps_to_go: None,
            current_flag: None,
            flag_durations: None,
            green_time_ms: None,
            yellow_time_ms: None,
            red_time_ms: None,
            yellow_laps: None,
            yellow_count: None,
            average_race_speed: None,
            lead_changes: None,
            event_entries: None,
            is_multiloop_active: None,
        }
    }

    /// A patch is "empty" iff it carries only its identity key.
    pub fn is_empty(&self) -> bool {
        self.session_name.is_none()
            && self.local_time_of_day.is_none()
            && self.running_race_time.is_none()
            && self.time_to_go.is_none()
            && self.laps_to_go.is_none()
            && self.current_flag.is_none()
            && self.flag_durations.is_none()
            && self.green_time_ms.is_none()
            && self.yellow_time_ms.is_none()
            && self.red_time_ms.is_none()
            && self.yellow_laps.is_none()
            && self.yellow_count.is_none()
            && self.average_race_speed.is_none()
            && self.lead_changes.is_none()
            && self.event_entries.is_none()
            && self.is_multiloop_active.is_none()
    }

    /// Merges `other` into `self`, field-last-wins. `other` is assumed to
    /// have arrived after `self` (associative on field-present values:
    /// merging three patches in any left-associated order yields the
    /// same result, since each field's final value is simply the last
    /// `Some` seen in arrival order).
    pub fn merge(&mut self, other: SessionStatePatch) {
        merge_field!(self, other, session_name);
        merge_field!(self, other, local_time_of_day);
        merge_field!(self, other, running_race_time);
        merge_field!(self, other, time_to_go);
        merge_field!(self, other, laps_to_go);
        merge_field!(self, other, current_flag);
        merge_field!(self, other, flag_durations);
        merge_field!(self, other, green_time_ms);
        merge_field!(self, other, yellow_time_ms);
        merge_field!(self, other, red_time_ms);
        merge_field!(self, other, yellow_laps);
        merge_field!(self, other, yellow_count);
        merge_field!(self, other, average_race_speed);
        merge_field!(self, other, lead_changes);
        merge_field!(self, other, event_entries);
        merge_field!(self, other, is_multiloop_active);
    }
}

/// Sparse delta over one `CarPosition`, keyed by car `number`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CarPositionPatch {
    pub number: String,

    pub transponder_id: Option<String>,
    pub driver_name: Option<String>,
    pub class: Option<String>,

    pub overall_position: Option<u32>,
    pub class_position: Option<u32>,
    pub last_lap_completed: Option<u32>,
    pub total_time: Option<String>,
    pub last_lap_time: Option<String>,
    pub best_time: Option<String>,
    pub track_flag: Option<Flag>,

    pub overall_gap: Option<String>,
    pub overall_difference: Option<String>,
    pub in_class_gap: Option<String>,
    pub in_class_difference: Option<String>,
    pub is_best_time: Option<bool>,
    pub is_best_time_class: Option<bool>,
    pub overall_starting_position: Option<u32>,
    pub in_class_starting_position: Option<u32>,
    pub overall_positions_gained: Option<PositionsGained>,
    pub in_class_positions_gained: Option<PositionsGained>,
    pub is_overall_most_positions_gained: Option<bool>,
    pub is_class_most_positions_gained: Option<bool>,

    pub is_in_pit: Option<bool>,
    pub is_entered_pit: Option<bool>,
    pub is_exited_pit: Option<bool>,
    pub is_pit_start_finish: Option<bool>,
    pub last_loop_name: Option<String>,
    pub pit_stop_count: Option<u32>,
    pub last_lap_pitted: Option<u32>,
    pub lap_included_pit: Option<bool>,

    pub completed_sections: Option<Vec<CompletedSection>>,
    pub current_status: Option<String>,
    pub projected_lap_time: Option<String>,
    pub is_fastest_pace: Option<bool>,
    pub penalties: Option<PenaltyCounts>,
}

impl CarPositionPatch {
    pub fn identity(number: impl Into<String>) -> Self {
        Self {
            number: number.into(),
            transponder_id: None,
            driver_name: None,
            class: None,
            overall_position: None,
            class_position: None,
            last_lap_completed: None,
            total_time: None,
            last_lap_time: None,
            best_time: None,
            track_flag: None,
            overall_gap: None,
            overall_difference: None,
            in_class_gap: None,
            in_class_difference: None,
            is_best_time: None,
            is_best_time_class: None,
            overall_starting_position: None,
            in_class_starting_position: None,
            overall_positions_gained: None,
            in_class_positions_gained: None,
            is_overall_most_positions_gained: None,
            is_class_most_positions_gained: None,
            is_in_pit: None,
            is_entered_pit: None,
            is_exited_pit: None,
            is_pit_start_finish: None,
            last_loop_name: None,
            pit_stop_count: None,
            last_lap_pitted: None,
            lap_included_pit: None,
            completed_sections: None,
            current_status: None,
            projected_lap_time: None,
            is_fastest_pace: None,
            penalties: None,
        }
    }

    /// A patch is "empty" iff it carries only its identity key (the car
    /// number).
    pub fn is_empty(&self) -> bool {
        self.transponder_id.is_none()
            && self.driver_name.is_none()
            && self.class.is_none()
            && self.overall_position.is_none()
            && self.class_position.is_none()
            && self.last_lap_completed.is_none()
            && self.total_time.is_none()
            && self.last_lap_time.is_none()
            && self.best_time.is_none()
            && self.track_flag.is_none()
            && self.overall_gap.is_none()
            && self.overall_difference.is_none()
            && self.in_class_gap.is_none()
            && self.in_class_difference.is_none()
            && self.is_best_time.is_none()
            && self.is_best_time_class.is_none()
            && self.overall_starting_position.is_none()
            && self.in_class_starting_position.is_none()
            && self.overall_positions_gained.is_none()
            && self.in_class_positions_gained.is_none()
            && self.is_overall_most_positions_gained.is_none()
            && self.is_class_most_positions_gained.is_none()
            && self.is_in_pit.is_none()
            && self.is_entered_pit.is_none()
            && self.is_exited_pit.is_none()
            && self.is_pit_start_finish.is_none()
            && self.last_loop_name.is_none()
            && self.pit_stop_count.is_none()
            && self.last_lap_pitted.is_none()
            && self.lap_included_pit.is_none()
            && self.completed_sections.is_none()
            && self.current_status.is_none()
            && self.projected_lap_time.is_none()
            && self.is_fastest_pace.is_none()
            && self.penalties.is_none()
    }

    pub fn merge(&mut self, other: CarPositionPatch) {
        merge_field!(self, other, transponder_id);
        merge_field!(self, other, driver_name);
        merge_field!(self, other, class);
        merge_field!(self, other, overall_position);
        merge_field!(self, other, class_position);
        merge_field!(self, other, last_lap_completed);
        merge_field!(self, other, total_time);
        merge_field!(self, other, last_lap_time);
        merge_field!(self, other, best_time);
        merge_field!(self, other, track_flag);
        merge_field!(self, other, overall_gap);
        merge_field!(self, other, overall_difference);
        merge_field!(self, other, in_class_gap);
        merge_field!(self, other, in_class_difference);
        merge_field!(self, other, is_best_time);
        merge_field!(self, other, is_best_time_class);
        merge_field!(self, other, overall_starting_position);
        merge_field!(self, other, in_class_starting_position);
        merge_field!(self, other, overall_positions_gained);
        merge_field!(self, other, in_class_positions_gained);
        merge_field!(self, other, is_overall_most_positions_gained);
        merge_field!(self, other, is_class_most_positions_gained);
        merge_field!(self, other, is_in_pit);
        merge_field!(self, other, is_entered_pit);
        merge_field!(self, other, is_exited_pit);
        merge_field!(self, other, is_pit_start_finish);
        merge_field!(self, other, last_loop_name);
        merge_field!(self, other, pit_stop_count);
        merge_field!(self, other, last_lap_pitted);
        merge_field!(self, other, lap_included_pit);
        merge_field!(self, other, completed_sections);
        merge_field!(self, other, current_status);
        merge_field!(self, other, projected_lap_time);
        merge_field!(self, other, is_fastest_pace);
        merge_field!(self, other, penalties);
    }
}
