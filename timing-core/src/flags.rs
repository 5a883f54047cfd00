//! Flag Processor: keeps the durable flag log and the
//! in-memory `flagDurations`/`currentFlag` in sync.

use timing_contracts::patch::{FlagDuration, SessionStatePatch};
use timing_protocol::Flag;
use tracing::warn;

use crate::context::SessionContext;
use crate::ports::Store;

/// Reconciles an incoming batch of flag durations against the store and
/// emits the patch the consolidator should merge in.
///
/// `incoming` durations with `end_time.is_some()` back-fill a prior open
/// segment sharing its `(flag, start_time)`; durations without an
/// `end_time` are new openings, which auto-close whatever segment was
/// previously open if it started earlier.
pub async fn process_flags<S: Store>(
    ctx: &SessionContext,
    store: &S,
    event_id: &str,
    session_id: &str,
    incoming: Vec<FlagDuration>,
) -> Option<SessionStatePatch> {
    let mut durations = match store.load_flag_log(event_id, session_id).await {
        Ok(d) => d,
        Err(e) => {
            warn!(error = %e, "failed to load flag log, continuing with last known state");
            ctx.snapshot().await.flag_durations
        }
    };

    for d in incoming {
        if d.end_time.is_some() {
            if let Some(existing) = durations
                .iter_mut()
                .find(|e| e.flag == d.flag && e.start_time == d.start_time)
            {
                existing.end_time = d.end_time;
                continue;
            }
            durations.push(d);
            continue;
        }

        if let Some(open) = durations.iter_mut().find(|e| e.end_time.is_none()) {
            if open.start_time < d.start_time {
                open.end_time = Some(d.start_time.clone());
            }
        }

        let already_present = durations
            .iter()
            .any(|e| e.flag == d.flag && e.start_time == d.start_time);
        if !already_present {
            durations.push(d);
        }
    }

    durations.sort_by(|a, b| a.start_time.cmp(&b.start_time));

    if let Err(e) = store.save_flag_log(event_id, session_id, &durations).await {
        warn!(error = %e, "failed to persist flag log");
    }

    let current_flag = durations
        .iter()
        .find(|d| d.end_time.is_none())
        .map(|d| d.flag)
        .unwrap_or(Flag::Unknown);

    let mut patch = SessionStatePatch::identity(event_id, session_id);
    patch.flag_durations = Some(durations);
    patch.current_flag = Some(current_flag);
    Some(patch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{
        CarLastLapRow, EventStatusLogRow, LapRecord, LoopMetadata, PortResult, SessionResult,
    };
    use crate::model::{CarPosition, SessionState};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeStore {
        flag_log: Mutex<Vec<FlagDuration>>,
    }

    impl Store for FakeStore {
        async fn load_session(&self, _event_id: &str) -> PortResult<Option<SessionState>> {
            Ok(None)
        }
        async fn save_flag_log(
            &self,
            _event_id: &str,
            _session_id: &str,
            durations: &[FlagDuration],
        ) -> PortResult<()> {
            *self.flag_log.lock().unwrap() = durations.to_vec();
            Ok(())
        }
        async fn load_flag_log(&self, _event_id: &str, _session_id: &str) -> PortResult<Vec<FlagDuration>> {
            Ok(self.flag_log.lock().unwrap().clone())
        }
        async fn append_car_lap_log(
            &self,
            _event_id: &str,
            _session_id: &str,
            _car_number: &str,
            _lap_number: u32,
            _snapshot: &CarPosition,
        ) -> PortResult<()> {
            Ok(())
        }
        async fn load_recent_laps(
            &self,
            _event_id: &str,
            _session_id: &str,
            _max_lap: u32,
        ) -> PortResult<Vec<LapRecord>> {
            Ok(vec![])
        }
        async fn save_session_result(&self, _result: &SessionResult) -> PortResult<()> {
            Ok(())
        }
        async fn set_session_live(&self, _event_id: &str, _session_id: &str, _is_live: bool) -> PortResult<()> {
            Ok(())
        }
        async fn load_loop_metadata(&self, _event_id: &str) -> PortResult<Vec<LoopMetadata>> {
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

    #[tokio::test]
    async fn three_heartbeats_produce_expected_segments() {
        let ctx = SessionContext::new("42", "1");
        let store = FakeStore::default();

        let patch = process_flags(
            &ctx,
            &store,
            "42",
            "1",
            vec![FlagDuration {
                flag: Flag::Green,
                start_time: "0".into(),
                end_time: None,
            }],
        )
        .await
        .unwrap();
        ctx.apply_session_patch(patch).await;

        let patch = process_flags(
            &ctx,
            &store,
            "42",
            "1",
            vec![FlagDuration {
                flag: Flag::Yellow,
                start_time: "30".into(),
                end_time: None,
            }],
        )
        .await
        .unwrap();
        ctx.apply_session_patch(patch).await;

        let patch = process_flags(
            &ctx,
            &store,
            "42",
            "1",
            vec![FlagDuration {
                flag: Flag::Checkered,
                start_time: "60".into(),
                end_time: None,
            }],
        )
        .await
        .unwrap();
        ctx.apply_session_patch(patch).await;

        let snapshot = ctx.snapshot().await;
        assert_eq!(snapshot.current_flag, Flag::Checkered);
        assert_eq!(
            snapshot.flag_durations,
            vec![
                FlagDuration { flag: Flag::Green, start_time: "0".into(), end_time: Some("30".into()) },
                FlagDuration { flag: Flag::Yellow, start_time: "30".into(), end_time: Some("60".into()) },
                FlagDuration { flag: Flag::Checkered, start_time: "60".into(), end_time: None },
            ]
        );
    }

    #[tokio::test]
    async fn backfills_end_time_on_matching_open_segment() {
        let ctx = SessionContext::new("42", "1");
        let store = FakeStore::default();
        store.flag_log.lock().unwrap().push(FlagDuration {
            flag: Flag::Green,
            start_time: "0".into(),
            end_time: None,
        });

        let patch = process_flags(
            &ctx,
            &store,
            "42",
            "1",
            vec![FlagDuration {
                flag: Flag::Green,
                start_time: "0".into(),
                end_time: Some("45".into()),
            }],
        )
        .await
        .unwrap();

        assert_eq!(patch.flag_durations.unwrap()[0].end_time, Some("45".into()));
    }

    use proptest::prelude::*;

    fn arb_flag() -> impl Strategy<Value = Flag> {
        prop_oneof![
            Just(Flag::Green),
            Just(Flag::Yellow),
            Just(Flag::Red),
            Just(Flag::White),
            Just(Flag::Checkered),
            Just(Flag::Purple35),
        ]
    }

    proptest! {
        // Feeding any sequence of new flag openings (strictly increasing
        // start times, never an explicit end) always leaves flagDurations
        // time-ordered, with each segment's start strictly after the
        // previous one's, and at most one segment left open.
        #[test]
        fn flag_durations_stay_ordered_and_single_open(
            deltas_and_flags in proptest::collection::vec((1u64..100, arb_flag()), 1..15),
        ) {
            tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
                let ctx = SessionContext::new("42", "1");
                let store = FakeStore::default();
                let mut clock = 0u64;

                for (delta, flag) in deltas_and_flags {
                    clock += delta;
                    let patch = process_flags(
                        &ctx,
                        &store,
                        "42",
                        "1",
                        vec![FlagDuration { flag, start_time: clock.to_string(), end_time: None }],
                    )
                    .await
                    .unwrap();
                    ctx.apply_session_patch(patch).await;
                }

                let durations = ctx.snapshot().await.flag_durations;

                let starts: Vec<u64> = durations.iter().map(|d| d.start_time.parse().unwrap()).collect();
                let mut sorted_starts = starts.clone();
                sorted_starts.sort_unstable();
                prop_assert_eq!(&starts, &sorted_starts);
                prop_assert!(starts.windows(2).all(|w| w[0] < w[1]));

                let open_count = durations.iter().filter(|d| d.end_time.is_none()).count();
                prop_assert!(open_count <= 1);

                for d in &durations {
                    if let Some(end) = &d.end_time {
                        let end_ms: u64 = end.parse().unwrap();
                        let start_ms: u64 = d.start_time.parse().unwrap();
                        prop_assert!(end_ms >= start_ms);
                    }
                }
                Ok(())
            })?;
        }
    }
}
