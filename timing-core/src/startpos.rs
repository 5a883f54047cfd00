//! Starting Position Processor: background loop that
//! infers starting positions from early recorded laps once a session
//! has been running long enough to trust them.

use timing_protocol::Flag;
use tracing::warn;

use crate::context::SessionContext;
use crate::ports::{LapRecord, Store};

const MIN_LAP_FOR_INFERENCE: u32 = 3;
const MAX_SAVED_LAP: u32 = 4;

fn event_is_active(lap: u32, flag: Flag) -> bool {
    lap > MIN_LAP_FOR_INFERENCE
        && matches!(flag, Flag::Green | Flag::Yellow | Flag::Red | Flag::Purple35)
}

/// Runs one pass of the inference: if the session has no starting
/// positions yet and the event looks active, loads saved laps 0..=4,
/// locates the leader's lap just prior to the first `Green` record, and
/// derives every car's overall + in-class starting position from that
/// lap's ranking. Idempotent per session — a session that already has
/// starting positions is left untouched.
pub async fn run_once<S: Store>(ctx: &SessionContext, store: &S, event_id: &str, session_id: &str) {
    if ctx.has_starting_positions().await {
        return;
    }

    let (flag, lap) = ctx.get_current_flag_and_lap().await;
    if !event_is_active(lap, flag) {
        return;
    }

    let laps = match store.load_recent_laps(event_id, session_id, MAX_SAVED_LAP).await {
        Ok(l) => l,
        Err(e) => {
            warn!(error = %e, "failed to load recent laps for starting position inference");
            return;
        }
    };

    let Some(reference_lap) = find_reference_lap(&laps) else {
        return;
    };

    let mut at_reference: Vec<&LapRecord> = laps
        .iter()
        .filter(|r| r.lap_number == reference_lap)
        .collect();
    at_reference.sort_by_key(|r| if r.overall_position == 0 { u32::MAX } else { r.overall_position });

    // In-class rank needs every car's class grouping before any
    // `set_starting_position` call lands, since that call is one-shot
    // per car — compute both ranks first, then call once each.
    let mut by_class: std::collections::HashMap<String, Vec<&LapRecord>> = std::collections::HashMap::new();
    for record in &at_reference {
        by_class.entry(record.class.clone()).or_default().push(record);
    }
    let mut in_class_rank: std::collections::HashMap<&str, u32> = std::collections::HashMap::new();
    for records in by_class.values_mut() {
        records.sort_by_key(|r| if r.overall_position == 0 { u32::MAX } else { r.overall_position });
        for (rank, record) in records.iter().enumerate() {
            in_class_rank.insert(record.car_number.as_str(), rank as u32 + 1);
        }
    }

    for record in &at_reference {
        let in_class = in_class_rank.get(record.car_number.as_str()).copied().unwrap_or(0);
        ctx.set_starting_position(&record.car_number, record.overall_position, in_class)
            .await;
    }
}

/// Finds the lap number immediately prior to the first lap recorded
/// under a `Green` flag — the leader's grid-formation lap, whose
/// ranking becomes the starting order.
fn find_reference_lap(laps: &[LapRecord]) -> Option<u32> {
    let first_green_lap = laps
        .iter()
        .filter(|r| r.flag == Flag::Green)
        .map(|r| r.lap_number)
        .min()?;
    Some(first_green_lap.saturating_sub(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{
        CarLastLapRow, EventStatusLogRow, LoopMetadata, PortResult, SessionResult,
    };
    use crate::model::{CarPosition, SessionState};
    use std::sync::Mutex;
    use timing_contracts::patch::FlagDuration;

    #[derive(Default)]
    struct FakeStore {
        laps: Mutex<Vec<LapRecord>>,
    }

    impl Store for FakeStore {
        async fn load_session(&self, _e: &str) -> PortResult<Option<SessionState>> {
            Ok(None)
        }
        async fn save_flag_log(&self, _e: &str, _s: &str, _d: &[FlagDuration]) -> PortResult<()> {
            Ok(())
        }
        async fn load_flag_log(&self, _e: &str, _s: &str) -> PortResult<Vec<FlagDuration>> {
            Ok(vec![])
        }
        async fn append_car_lap_log(&self, _e: &str, _s: &str, _c: &str, _l: u32, _snap: &CarPosition) -> PortResult<()> {
            Ok(())
        }
        async fn load_recent_laps(&self, _e: &str, _s: &str, _max_lap: u32) -> PortResult<Vec<LapRecord>> {
            Ok(self.laps.lock().unwrap().clone())
        }
        async fn save_session_result(&self, _result: &SessionResult) -> PortResult<()> {
            Ok(())
        }
        async fn set_session_live(&self, _e: &str, _s: &str, _is_live: bool) -> PortResult<()> {
            Ok(())
        }
        async fn load_loop_metadata(&self, _e: &str) -> PortResult<Vec<LoopMetadata>> {
            Ok(vec![])
        }
        async fn upsert_event_status_log(&self, _row: &EventStatusLogRow) -> PortResult<()> {
            Ok(())
        }
        async fn upsert_car_last_lap(&self, _row: &CarLastLapRow) -> PortResult<()> {
            Ok(())
        }
        async fn upsert_x2_passing(&self, _row: &crate::ports::X2PassingRow) -> PortResult<()> {
            Ok(())
        }
        async fn replace_x2_loops(&self, _event_id: &str, _loops: &[crate::ports::X2LoopRow]) -> PortResult<()> {
            Ok(())
        }
    }

    fn lap(car: &str, lap_number: u32, overall_position: u32, class: &str, flag: Flag) -> LapRecord {
        LapRecord {
            car_number: car.to_string(),
            lap_number,
            overall_position,
            class: class.to_string(),
            flag,
        }
    }

    #[tokio::test]
    async fn skips_inference_when_event_not_yet_active() {
        let ctx = SessionContext::new("42", "1");
        let store = FakeStore::default();
        run_once(&ctx, &store, "42", "1").await;
        assert!(!ctx.has_starting_positions().await);
    }

    #[tokio::test]
    async fn infers_starting_positions_from_lap_before_first_green() {
        let ctx = SessionContext::new("42", "1");

        let mut flag_patch = timing_contracts::patch::SessionStatePatch::identity("42", "1");
        flag_patch.current_flag = Some(Flag::Green);
        ctx.apply_session_patch(flag_patch).await;

        // Both cars under inference have themselves raced well past the
        // activity gate's lap threshold by the time it trips, same as in
        // real operation.
        ctx.apply_car_patch({
            let mut p = timing_contracts::patch::CarPositionPatch::identity("7");
            p.last_lap_completed = Some(5);
            p
        })
        .await;
        ctx.apply_car_patch({
            let mut p = timing_contracts::patch::CarPositionPatch::identity("9");
            p.last_lap_completed = Some(5);
            p
        })
        .await;

        let store = FakeStore::default();
        *store.laps.lock().unwrap() = vec![
            lap("7", 0, 2, "GT3", Flag::Unknown),
            lap("9", 0, 1, "GT3", Flag::Unknown),
            lap("7", 1, 2, "GT3", Flag::Green),
            lap("9", 1, 1, "GT3", Flag::Green),
        ];

        run_once(&ctx, &store, "42", "1").await;

        assert!(ctx.has_starting_positions().await);
        assert_eq!(ctx.overall_starting_position("9").await, Some(1));
        assert_eq!(ctx.overall_starting_position("7").await, Some(2));
    }
}
