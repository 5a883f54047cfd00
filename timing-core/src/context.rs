//! `SessionContext` — the single authoritative owner of `SessionState`,
//! wrapped in an `Arc<RwLock<_>>` so background loops can take
//! concurrent read snapshots while the pipeline serializes writes.
//!
//! Grounded on `AppState`'s `Arc<Mutex<RaceEngine>>`, upgraded to a
//! reader/writer lock here since the session monitor, starting-position
//! processor and logger sink all need concurrent read snapshots while
//! the pipeline is the sole writer — `AppState` only ever needed
//! exclusive access from one task at a time.

use std::collections::HashMap;
use std::sync::Arc;

use timing_contracts::patch::{CarPositionPatch, PositionsGained, SessionStatePatch};
use timing_protocol::Flag;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::model::{CarPosition, EventEntry, SessionState};

struct Inner {
    state: SessionState,
    previous_state: Option<SessionState>,
    overall_starting_positions: HashMap<String, u32>,
    in_class_starting_positions: HashMap<String, u32>,
    transponder_to_car: HashMap<String, String>,
}

/// Process-wide authoritative state for one event/session, plus the
/// cancellation token threaded through every awaitable call.
#[derive(Clone)]
pub struct SessionContext {
    inner: Arc<RwLock<Inner>>,
    pub cancellation: CancellationToken,
}

impl SessionContext {
    pub fn new(event_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                state: SessionState::new(event_id, session_id),
                previous_state: None,
                overall_starting_positions: HashMap::new(),
                in_class_starting_positions: HashMap::new(),
                transponder_to_car: HashMap::new(),
            })),
            cancellation: CancellationToken::new(),
        }
    }

    /// Read-only snapshot for enrichers/background loops. Cloning the
    /// whole state is cheap enough at this scale and keeps the lock
    /// held only for the duration of the clone.
    pub async fn snapshot(&self) -> SessionState {
        self.inner.read().await.state.clone()
    }

    pub async fn get_car_by_number(&self, number: &str) -> Option<CarPosition> {
        self.inner.read().await.state.car_positions.get(number).cloned()
    }

    pub async fn get_car_number_for_transponder(&self, transponder_id: &str) -> Option<String> {
        self.inner
            .read()
            .await
            .transponder_to_car
            .get(transponder_id)
            .cloned()
    }

    pub async fn has_starting_positions(&self) -> bool {
        !self.inner.read().await.overall_starting_positions.is_empty()
    }

    /// Returns the current flag and an approximation of "current lap"
    /// — the furthest lap any car has completed — used by the starting
    /// position processor's activity gate (active once lap > 3).
    pub async fn get_current_flag_and_lap(&self) -> (Flag, u32) {
        let guard = self.inner.read().await;
        let lap = guard
            .state
            .car_positions
            .values()
            .map(|c| c.last_lap_completed)
            .max()
            .unwrap_or(0);
        (guard.state.current_flag, lap)
    }

    /// Merges a `SessionStatePatch` into the authoritative state. Only
    /// present fields are applied; absent fields leave the current
    /// value untouched.
    pub async fn apply_session_patch(&self, patch: SessionStatePatch) {
        if patch.is_empty() {
            return;
        }
        let mut guard = self.inner.write().await;
        let state = &mut guard.state;

        if let Some(v) = patch.session_name {
            state.session_name = v;
        }
        if let Some(v) = patch.local_time_of_day {
            state.local_time_of_day = v;
        }
        if let Some(v) = patch.running_race_time {
            state.running_race_time = v;
        }
        if let Some(v) = patch.time_to_go {
            state.time_to_go = v;
        }
        if let Some(v) = patch.laps_to_go {
            state.laps_to_go = v;
        }
        if let Some(v) = patch.current_flag {
            state.current_flag = v;
        }
        if let Some(v) = patch.flag_durations {
            state.flag_durations = v
                .into_iter()
                .map(|d| timing_contracts::patch::FlagDuration {
                    flag: d.flag,
                    start_time: d.start_time,
                    end_time: d.end_time,
                })
                .collect();
        }
        if let Some(v) = patch.green_time_ms {
            state.green_time_ms = v;
        }
        if let Some(v) = patch.yellow_time_ms {
            state.yellow_time_ms = v;
        }
        if let Some(v) = patch.red_time_ms {
            state.red_time_ms = v;
        }
        if let Some(v) = patch.yellow_laps {
            state.yellow_laps = v;
        }
        if let Some(v) = patch.yellow_count {
            state.yellow_count = v;
        }
        if let Some(v) = patch.average_race_speed {
            state.average_race_speed = v;
        }
        if let Some(v) = patch.lead_changes {
            state.lead_changes = v;
        }
        if let Some(v) = patch.is_multiloop_active {
            state.is_multiloop_active = v;
        }
        if let Some(entries) = patch.event_entries {
            state.event_entries = entries
                .iter()
                .map(|e| EventEntry {
                    number: e.number.clone(),
                    name: e.name.clone(),
                    team: e.team.clone(),
                    class: e.class.clone(),
                })
                .collect();
            rebuild_transponder_index(&mut guard.transponder_to_car, &state.car_positions);
        }
    }

    /// Merges a `CarPositionPatch` into the named car, creating the car
    /// if it has never been seen before.
    pub async fn apply_car_patch(&self, patch: CarPositionPatch) {
        if patch.is_empty() {
            debug!(number = %patch.number, "discarding identity-only car patch");
        }
        let mut guard = self.inner.write().await;
        let number = patch.number.clone();
        let car = guard
            .state
            .car_positions
            .entry(number.clone())
            .or_insert_with(|| CarPosition::new(number.clone()));

        if let Some(v) = patch.transponder_id {
            car.transponder_id = Some(v);
        }
        if let Some(v) = patch.driver_name {
            car.driver_name = v;
        }
        if let Some(v) = patch.class {
            car.class = v;
        }
        if let Some(v) = patch.overall_position {
            car.overall_position = v;
        }
        if let Some(v) = patch.class_position {
            car.class_position = v;
        }
        if let Some(v) = patch.last_lap_completed {
            car.last_lap_completed = v;
        }
        if let Some(v) = patch.total_time {
            car.total_time = v;
        }
        if let Some(v) = patch.last_lap_time {
            car.last_lap_time = v;
        }
        if let Some(v) = patch.best_time {
            car.best_time = v;
        }
        if let Some(v) = patch.track_flag {
            car.track_flag = v;
        }
        if let Some(v) = patch.overall_gap {
            car.overall_gap = v;
        }
        if let Some(v) = patch.overall_difference {
            car.overall_difference = v;
        }
        if let Some(v) = patch.in_class_gap {
            car.in_class_gap = v;
        }
        if let Some(v) = patch.in_class_difference {
            car.in_class_difference = v;
        }
        if let Some(v) = patch.is_best_time {
            car.is_best_time = v;
        }
        if let Some(v) = patch.is_best_time_class {
            car.is_best_time_class = v;
        }
        if let Some(v) = patch.overall_starting_position {
            car.overall_starting_position = v;
        }
        if let Some(v) = patch.in_class_starting_position {
            car.in_class_starting_position = v;
        }
        if let Some(v) = patch.overall_positions_gained {
            car.overall_positions_gained = Some(match v {
                PositionsGained::Value(n) => PositionsGained::Value(n),
                PositionsGained::Invalid => PositionsGained::Invalid,
            });
        }
        if let Some(v) = patch.in_class_positions_gained {
            car.in_class_positions_gained = Some(match v {
                PositionsGained::Value(n) => PositionsGained::Value(n),
                PositionsGained::Invalid => PositionsGained::Invalid,
            });
        }
        if let Some(v) = patch.is_overall_most_positions_gained {
            car.is_overall_most_positions_gained = v;
        }
        if let Some(v) = patch.is_class_most_positions_gained {
            car.is_class_most_positions_gained = v;
        }
        if let Some(v) = patch.is_in_pit {
            car.is_in_pit = v;
        }
        if let Some(v) = patch.is_entered_pit {
            car.is_entered_pit = v;
        }
        if let Some(v) = patch.is_exited_pit {
            car.is_exited_pit = v;
        }
        if let Some(v) = patch.is_pit_start_finish {
            car.is_pit_start_finish = v;
        }
        if let Some(v) = patch.last_loop_name {
            car.last_loop_name = v;
        }
        if let Some(v) = patch.pit_stop_count {
            car.pit_stop_count = v;
        }
        if let Some(v) = patch.last_lap_pitted {
            car.last_lap_pitted = v;
        }
        if let Some(v) = patch.lap_included_pit {
            car.lap_included_pit = v;
        }
        if let Some(v) = patch.completed_sections {
            car.completed_sections = v;
        }
        if let Some(v) = patch.current_status {
            car.current_status = v;
        }
        if let Some(v) = patch.projected_lap_time {
            car.projected_lap_time = v;
        }
        if let Some(v) = patch.is_fastest_pace {
            car.is_fastest_pace = v;
        }
        if let Some(v) = patch.penalties {
            car.penalties = v;
        }

        if let Some(transponder) = &car.transponder_id {
            guard
                .transponder_to_car
                .insert(transponder.clone(), number);
        }
    }

    /// (I4) at most once per car per session, gated on the session's
    /// current flag. Activity/lap eligibility is the caller's job.
    pub async fn set_starting_position(&self, number: &str, overall: u32, in_class: u32) {
        let mut guard = self.inner.write().await;
        let flag = guard.state.current_flag;
        if !matches!(flag, Flag::Unknown | Flag::Yellow | Flag::Green) {
            warn!(number, ?flag, "refusing starting position outside the eligible window");
            return;
        }
        if guard.overall_starting_positions.contains_key(number) {
            return;
        }
        guard
            .overall_starting_positions
            .insert(number.to_string(), overall);
        guard
            .in_class_starting_positions
            .insert(number.to_string(), in_class);
        if let Some(car) = guard.state.car_positions.get_mut(number) {
            car.overall_starting_position = overall;
            car.in_class_starting_position = in_class;
        }
    }

    pub async fn overall_starting_position(&self, number: &str) -> Option<u32> {
        self.inner
            .read()
            .await
            .overall_starting_positions
            .get(number)
            .copied()
    }

    /// Snapshots current state to `previous_state` and resets the live
    /// collections while preserving the roster.
    pub async fn new_session(&self, session_id: impl Into<String>, session_name: impl Into<String>) {
        let mut guard = self.inner.write().await;
        let event_id = guard.state.event_id.clone();
        let roster = guard.state.event_entries.clone();
        let previous = std::mem::replace(&mut guard.state, SessionState::new(event_id, session_id));
        guard.state.session_name = session_name.into();
        guard.state.event_entries = roster;
        guard.previous_state = Some(previous);
        guard.overall_starting_positions.clear();
        guard.in_class_starting_positions.clear();
    }

    /// Clears running data but keeps roster and identity.
    pub async fn reset_command(&self) {
        let mut guard = self.inner.write().await;
        let event_id = guard.state.event_id.clone();
        let session_id = guard.state.session_id.clone();
        let roster = guard.state.event_entries.clone();
        guard.state = SessionState::new(event_id, session_id);
        guard.state.event_entries = roster;
        guard.overall_starting_positions.clear();
        guard.in_class_starting_positions.clear();
        guard.transponder_to_car.clear();
    }

    pub async fn set_session_class_metadata(&self, class_by_number: HashMap<String, String>) {
        let mut guard = self.inner.write().await;
        for (number, class) in class_by_number {
            if let Some(car) = guard.state.car_positions.get_mut(&number) {
                car.class = class;
            }
        }
    }
}

fn rebuild_transponder_index(index: &mut HashMap<String, String>, cars: &HashMap<String, CarPosition>) {
    index.clear();
    for car in cars.values() {
        if let Some(transponder) = &car.transponder_id {
            index.insert(transponder.clone(), car.number.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patch_flag(event: &str, session: &str, flag: Flag) -> SessionStatePatch {
        let mut p = SessionStatePatch::identity(event, session);
        p.current_flag = Some(flag);
        p
    }

    #[tokio::test]
    async fn apply_session_patch_updates_current_flag() {
        let ctx = SessionContext::new("42", "1");
        ctx.apply_session_patch(patch_flag("42", "1", Flag::Green)).await;
        let (flag, _) = ctx.get_current_flag_and_lap().await;
        assert_eq!(flag, Flag::Green);
    }

    #[tokio::test]
    async fn apply_car_patch_creates_car_on_first_sight() {
        let ctx = SessionContext::new("42", "1");
        let mut patch = CarPositionPatch::identity("7");
        patch.overall_position = Some(1);
        ctx.apply_car_patch(patch).await;
        let car = ctx.get_car_by_number("7").await.unwrap();
        assert_eq!(car.overall_position, 1);
    }

    #[tokio::test]
    async fn starting_position_is_set_at_most_once() {
        let ctx = SessionContext::new("42", "1");
        ctx.set_starting_position("7", 3, 1).await;
        ctx.set_starting_position("7", 9, 9).await;
        assert_eq!(ctx.overall_starting_position("7").await, Some(3));
    }

    #[tokio::test]
    async fn starting_position_rejected_outside_eligible_window() {
        let ctx = SessionContext::new("42", "1");
        ctx.apply_session_patch(patch_flag("42", "1", Flag::Checkered)).await;
        ctx.set_starting_position("7", 3, 1).await;
        assert_eq!(ctx.overall_starting_position("7").await, None);
    }

    #[tokio::test]
    async fn reset_command_preserves_roster() {
        let ctx = SessionContext::new("42", "1");
        let mut patch = SessionStatePatch::identity("42", "1");
        patch.event_entries = Some(vec![timing_contracts::patch::EventEntry {
            number: "7".into(),
            name: "Alice".into(),
            team: "Team A".into(),
            class: "GT3".into(),
        }]);
        ctx.apply_session_patch(patch).await;
        ctx.reset_command().await;
        let snapshot = ctx.snapshot().await;
        assert_eq!(snapshot.event_entries.len(), 1);
        assert!(snapshot.car_positions.is_empty());
    }

    use proptest::prelude::*;

    fn arb_car_patch() -> impl Strategy<Value = CarPositionPatch> {
        (
            proptest::option::of(1u32..40),
            proptest::option::of(0u32..999),
            proptest::option::of("[a-zA-Z ]{1,12}"),
        )
            .prop_map(|(overall_position, last_lap_completed, driver_name)| {
                let mut p = CarPositionPatch::identity("7");
                p.overall_position = overall_position;
                p.last_lap_completed = last_lap_completed;
                p.driver_name = driver_name;
                p
            })
    }

    proptest! {
        // Applying the same patch to the same starting state twice in a
        // row lands on the same result as applying it once — each field
        // assignment from a patch is idempotent, so there is nothing for
        // a second identical apply to change.
        #[test]
        fn applying_same_patch_twice_is_idempotent(patch in arb_car_patch()) {
            tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
                let once = SessionContext::new("42", "1");
                once.apply_car_patch(patch.clone()).await;
                let after_once = once.get_car_by_number("7").await.unwrap();

                let twice = SessionContext::new("42", "1");
                twice.apply_car_patch(patch.clone()).await;
                twice.apply_car_patch(patch).await;
                let after_twice = twice.get_car_by_number("7").await.unwrap();

                prop_assert_eq!(after_once, after_twice);
                Ok(())
            })?;
        }
    }
}
