//! Lap Processor & Projections: debounces duplicate lap
//! completions (RMonitor and Multiloop can both report the same lap),
//! commits one `CarLapLog` row per car-lap, and maintains a rolling
//! projected lap time per car.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use timing_contracts::patch::CarPositionPatch;
use timing_protocol::Flag;
use tracing::warn;

use crate::decode::millis_to_clock;
use crate::model::CarPosition;
use crate::ports::Store;

/// Width of the rolling window used for projected lap time and
/// fastest-pace enrichment; five laps matches a typical rolling-average
/// window size for stint pace smoothing.
pub const PROJECTION_WINDOW: usize = 5;

const DEBOUNCE: Duration = Duration::from_millis(150);

/// Sanity bounds on an individual lap time, in milliseconds, before it is
/// folded into a car's rolling window. Laps outside this range (pit
/// stops, red-flag stoppages) skew the average without being a "pace"
/// sample.
const MIN_SANE_LAP_MS: u64 = 10_000;
const MAX_SANE_LAP_MS: u64 = 600_000;

struct PendingLap {
    car_number: String,
    lap_number: u32,
    first_seen: Instant,
}

#[derive(Default)]
pub struct LapProcessor {
    pending: HashMap<String, PendingLap>,
    rolling_windows: HashMap<String, VecDeque<u64>>,
    current_fastest: Option<String>,
}

impl LapProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a lap completion for `car_number`. Returns `true` the
    /// first time this `(car_number, lap_number)` pair is seen; a repeat
    /// within the debounce window is folded in silently and returns
    /// `false` (nothing new to commit).
    pub fn observe(&mut self, car_number: &str, lap_number: u32) -> bool {
        if let Some(existing) = self.pending.get(car_number) {
            if existing.lap_number == lap_number {
                return false;
            }
        }
        self.pending.insert(
            car_number.to_string(),
            PendingLap { car_number: car_number.to_string(), lap_number, first_seen: Instant::now() },
        );
        true
    }

    /// True once `DEBOUNCE` has elapsed since `car_number`'s pending lap
    /// was first observed, or if the pit processor released it early via
    /// [`release`].
    pub fn ready_to_commit(&self, car_number: &str) -> bool {
        self.pending
            .get(car_number)
            .is_some_and(|p| p.first_seen.elapsed() >= DEBOUNCE)
    }

    /// Releases a car's held lap immediately — used when the pit
    /// processor reports a pit-in passing just after a lap completion,
    /// so the commit can carry the correct `lapIncludedPit` flag instead
    /// of racing the debounce window.
    pub fn release(&mut self, car_number: &str) {
        if let Some(p) = self.pending.get_mut(car_number) {
            p.first_seen = Instant::now() - DEBOUNCE;
        }
    }

    /// Commits every car whose pending lap is ready, persisting one
    /// `CarLapLog` row each (snapshot taken after pit/position/flag
    /// enrichment, per the caller). Updates each car's rolling window
    /// with its `last_lap_time` and returns the set of car numbers
    /// committed.
    pub async fn commit_ready<S: Store>(
        &mut self,
        store: &S,
        event_id: &str,
        session_id: &str,
        current_flag: Flag,
        cars: &HashMap<String, CarPosition>,
    ) -> Vec<String> {
        let ready: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, p)| p.first_seen.elapsed() >= DEBOUNCE)
            .map(|(number, _)| number.clone())
            .collect();

        let mut committed = Vec::new();
        for number in ready {
            let Some(pending) = self.pending.remove(&number) else { continue };
            let Some(car) = cars.get(&number) else { continue };

            let mut snapshot = car.clone();
            snapshot.track_flag = current_flag;

            if let Err(e) = store
                .append_car_lap_log(event_id, session_id, &pending.car_number, pending.lap_number, &snapshot)
                .await
            {
                warn!(error = %e, car = %pending.car_number, "failed to persist lap log");
                continue;
            }

            if let Some(ms) = timing_protocol::time::parse_clock_to_millis(&car.last_lap_time) {
                if (MIN_SANE_LAP_MS..=MAX_SANE_LAP_MS).contains(&ms) {
                    let window = self.rolling_windows.entry(number.clone()).or_default();
                    window.push_back(ms);
                    if window.len() > PROJECTION_WINDOW {
                        window.pop_front();
                    }
                }
            }

            committed.push(number);
        }
        committed
    }

    /// Average of the car's rolling window, or `None` if no sane laps
    /// have landed yet.
    pub fn projected_lap_millis(&self, car_number: &str) -> Option<u64> {
        let window = self.rolling_windows.get(car_number)?;
        if window.is_empty() {
            return None;
        }
        Some(window.iter().sum::<u64>() / window.len() as u64)
    }

    /// Car number with the lowest rolling-average lap time among those
    /// with a full window, or `None` if no car has filled its window.
    pub fn fastest_pace_car(&self) -> Option<String> {
        self.rolling_windows
            .iter()
            .filter(|(_, w)| w.len() == PROJECTION_WINDOW)
            .map(|(number, w)| (number.clone(), w.iter().sum::<u64>() / w.len() as u64))
            .min_by_key(|(_, avg)| *avg)
            .map(|(number, _)| number)
    }

    /// Builds the `projectedLapTime`/`isFastestPace` patches implied by
    /// the most recent `commit_ready` call: one patch per car in
    /// `committed` whose rolling window now has an average, plus a
    /// flip of `isFastestPace` off the previous leader and onto the new
    /// one when fastest-pace has changed hands.
    pub fn projection_patches(&mut self, committed: &[String]) -> Vec<CarPositionPatch> {
        let mut patches = Vec::new();

        for number in committed {
            if let Some(ms) = self.projected_lap_millis(number) {
                let mut patch = CarPositionPatch::identity(number.clone());
                patch.projected_lap_time = Some(millis_to_clock(ms));
                patches.push(patch);
            }
        }

        let new_fastest = self.fastest_pace_car();
        if new_fastest != self.current_fastest {
            if let Some(old) = &self.current_fastest {
                let mut patch = CarPositionPatch::identity(old.clone());
                patch.is_fastest_pace = Some(false);
                patches.push(patch);
            }
            if let Some(new) = &new_fastest {
                let mut patch = CarPositionPatch::identity(new.clone());
                patch.is_fastest_pace = Some(true);
                patches.push(patch);
            }
            self.current_fastest = new_fastest;
        }

        patches
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{
        CarLastLapRow, EventStatusLogRow, LapRecord, LoopMetadata, PortResult, SessionResult,
    };
    use crate::model::SessionState;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeStore {
        committed: Mutex<Vec<(String, u32)>>,
    }

    impl Store for FakeStore {
        async fn load_session(&self, _event_id: &str) -> PortResult<Option<SessionState>> {
            Ok(None)
        }
        async fn save_flag_log(
            &self,
            _event_id: &str,
            _session_id: &str,
            _durations: &[timing_contracts::patch::FlagDuration],
        ) -> PortResult<()> {
            Ok(())
        }
        async fn load_flag_log(
            &self,
            _event_id: &str,
            _session_id: &str,
        ) -> PortResult<Vec<timing_contracts::patch::FlagDuration>> {
            Ok(vec![])
        }
        async fn append_car_lap_log(
            &self,
            _event_id: &str,
            _session_id: &str,
            car_number: &str,
            lap_number: u32,
            _snapshot: &CarPosition,
        ) -> PortResult<()> {
            self.committed.lock().unwrap().push((car_number.to_string(), lap_number));
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

    #[test]
    fn repeat_observation_of_same_lap_is_a_noop() {
        let mut processor = LapProcessor::new();
        assert!(processor.observe("7", 3));
        assert!(!processor.observe("7", 3));
    }

    #[test]
    fn new_lap_number_is_not_filtered() {
        let mut processor = LapProcessor::new();
        assert!(processor.observe("7", 3));
        assert!(processor.observe("7", 4));
    }

    #[tokio::test]
    async fn commit_skips_laps_inside_debounce_window() {
        let mut processor = LapProcessor::new();
        let store = FakeStore::default();
        let mut cars = HashMap::new();
        cars.insert("7".to_string(), CarPosition::new("7"));

        processor.observe("7", 3);
        let committed = processor.commit_ready(&store, "42", "1", Flag::Green, &cars).await;
        assert!(committed.is_empty());
        assert!(store.committed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn released_lap_commits_immediately() {
        let mut processor = LapProcessor::new();
        let store = FakeStore::default();
        let mut cars = HashMap::new();
        cars.insert("7".to_string(), CarPosition::new("7"));

        processor.observe("7", 3);
        processor.release("7");
        let committed = processor.commit_ready(&store, "42", "1", Flag::Green, &cars).await;
        assert_eq!(committed, vec!["7".to_string()]);
        assert_eq!(store.committed.lock().unwrap().as_slice(), &[("7".to_string(), 3)]);
    }

    #[tokio::test]
    async fn rolling_window_tracks_last_k_sane_lap_times() {
        let mut processor = LapProcessor::new();
        let store = FakeStore::default();

        for (i, lap_time) in ["1:30.000", "1:31.000", "1:29.000", "1:30.500", "1:30.250", "1:40.000"]
            .iter()
            .enumerate()
        {
            let mut car = CarPosition::new("7");
            car.last_lap_time = lap_time.to_string();
            let mut cars = HashMap::new();
            cars.insert("7".to_string(), car);

            processor.observe("7", i as u32);
            processor.release("7");
            processor.commit_ready(&store, "42", "1", Flag::Green, &cars).await;
        }

        assert!(processor.projected_lap_millis("7").is_some());
        assert_eq!(processor.fastest_pace_car(), Some("7".to_string()));
    }

    #[tokio::test]
    async fn insane_lap_time_is_excluded_from_window() {
        let mut processor = LapProcessor::new();
        let store = FakeStore::default();

        let mut car = CarPosition::new("7");
        car.last_lap_time = "0:02.000".to_string();
        let mut cars = HashMap::new();
        cars.insert("7".to_string(), car);

        processor.observe("7", 0);
        processor.release("7");
        processor.commit_ready(&store, "42", "1", Flag::Green, &cars).await;

        assert_eq!(processor.projected_lap_millis("7"), None);
    }

    #[tokio::test]
    async fn projection_patches_carry_projected_time_and_fastest_pace_flag() {
        let mut processor = LapProcessor::new();
        let store = FakeStore::default();

        let lap_times = ["1:30.000", "1:31.000", "1:29.000", "1:30.500", "1:30.250"];
        let mut committed = Vec::new();
        for (i, lap_time) in lap_times.iter().enumerate() {
            let mut car = CarPosition::new("7");
            car.last_lap_time = lap_time.to_string();
            let mut cars = HashMap::new();
            cars.insert("7".to_string(), car);

            processor.observe("7", i as u32);
            processor.release("7");
            committed = processor.commit_ready(&store, "42", "1", Flag::Green, &cars).await;
        }

        let patches = processor.projection_patches(&committed);
        let car_patch = patches.iter().find(|p| p.number == "7").unwrap();
        assert!(car_patch.projected_lap_time.is_some());
        assert_eq!(
            patches.iter().find(|p| p.is_fastest_pace.is_some()).unwrap().is_fastest_pace,
            Some(true)
        );
    }

    #[tokio::test]
    async fn fastest_pace_flag_moves_when_a_faster_car_fills_its_window() {
        let mut processor = LapProcessor::new();
        let store = FakeStore::default();

        for (i, lap_time) in ["1:30.000", "1:30.000", "1:30.000", "1:30.000", "1:30.000"].iter().enumerate() {
            let mut car = CarPosition::new("7");
            car.last_lap_time = lap_time.to_string();
            let mut cars = HashMap::new();
            cars.insert("7".to_string(), car);

            processor.observe("7", i as u32);
            processor.release("7");
            let committed = processor.commit_ready(&store, "42", "1", Flag::Green, &cars).await;
            processor.projection_patches(&committed);
        }
        assert_eq!(processor.fastest_pace_car(), Some("7".to_string()));

        let mut last_patches = Vec::new();
        for (i, lap_time) in ["1:20.000", "1:20.000", "1:20.000", "1:20.000", "1:20.000"].iter().enumerate() {
            let mut car = CarPosition::new("9");
            car.last_lap_time = lap_time.to_string();
            let mut cars = HashMap::new();
            cars.insert("9".to_string(), car);

            processor.observe("9", i as u32);
            processor.release("9");
            let committed = processor.commit_ready(&store, "42", "1", Flag::Green, &cars).await;
            last_patches = processor.projection_patches(&committed);
        }

        assert_eq!(processor.fastest_pace_car(), Some("9".to_string()));
        assert!(last_patches.iter().any(|p| p.number == "7" && p.is_fastest_pace == Some(false)));
        assert!(last_patches.iter().any(|p| p.number == "9" && p.is_fastest_pace == Some(true)));
    }
}
