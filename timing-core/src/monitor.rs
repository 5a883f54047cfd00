//! Session Monitor: the per-event lifecycle state machine,
//! Idle → Live → Finishing → Finalized.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use timing_protocol::Flag;
use tracing::{info, warn};

use crate::model::SessionState;
use crate::ports::{SessionResult, Store};

const FINISHING_TIMEOUT: Duration = Duration::from_secs(60);
const LAST_UPDATED_DEBOUNCE: Duration = Duration::from_millis(1_500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Live,
    Finishing,
    Finalized,
}

pub struct SessionMonitor {
    phase: SessionPhase,
    finishing_since: Option<Instant>,
    lap_snapshot: HashMap<String, u32>,
    last_lap_increment: Option<Instant>,
    last_wall_clock: Option<String>,
    last_update_written_at: Option<Instant>,
}

impl SessionMonitor {
    pub fn new() -> Self {
        Self {
            phase: SessionPhase::Idle,
            finishing_since: None,
            lap_snapshot: HashMap::new(),
            last_lap_increment: None,
            last_wall_clock: None,
            last_update_written_at: None,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Called on `evtsessionchanged`: unconditional Idle→Live.
    pub fn on_session_changed(&mut self) {
        if self.phase == SessionPhase::Idle {
            self.phase = SessionPhase::Live;
            info!("session monitor: idle -> live (session changed)");
        }
    }

    /// Called on `evt-shutdown-signal` for this event: finalize
    /// regardless of current phase.
    pub async fn on_shutdown_signal<S: Store>(
        &mut self,
        store: &S,
        event_id: &str,
        session_id: &str,
        state: &SessionState,
    ) {
        if self.phase != SessionPhase::Finalized {
            self.finalize(store, event_id, session_id, state).await;
        }
    }

    /// Drives the state machine from one observed tick: current flag,
    /// event wall-clock, and the per-car lap counts.
    pub async fn tick<S: Store>(
        &mut self,
        store: &S,
        event_id: &str,
        session_id: &str,
        state: &SessionState,
    ) {
        if self.phase == SessionPhase::Idle && state.current_flag != Flag::Unknown {
            self.phase = SessionPhase::Live;
            info!("session monitor: idle -> live (non-unknown flag observed)");
        }

        if self.phase == SessionPhase::Live && state.current_flag == Flag::Checkered {
            self.phase = SessionPhase::Finishing;
            self.finishing_since = Some(Instant::now());
            self.lap_snapshot = state
                .car_positions
                .values()
                .map(|c| (c.number.clone(), c.last_lap_completed))
                .collect();
            self.last_lap_increment = Some(Instant::now());
            info!("session monitor: live -> finishing");
        }

        if self.phase == SessionPhase::Finishing {
            let wall_clock_stalled = self
                .last_wall_clock
                .as_deref()
                .is_some_and(|prev| prev == state.running_race_time);
            self.last_wall_clock = Some(state.running_race_time.clone());

            let any_lap_increment = state.car_positions.values().any(|c| {
                self.lap_snapshot
                    .get(&c.number)
                    .is_some_and(|&snapshot_lap| c.last_lap_completed > snapshot_lap)
            });
            if any_lap_increment {
                self.last_lap_increment = Some(Instant::now());
                self.lap_snapshot = state
                    .car_positions
                    .values()
                    .map(|c| (c.number.clone(), c.last_lap_completed))
                    .collect();
            }

            let timed_out = self
                .last_lap_increment
                .is_some_and(|t| t.elapsed() >= FINISHING_TIMEOUT);

            if wall_clock_stalled || timed_out {
                self.finalize(store, event_id, session_id, state).await;
            }
        }
    }

    async fn finalize<S: Store>(&mut self, store: &S, event_id: &str, session_id: &str, state: &SessionState) {
        self.phase = SessionPhase::Finalized;
        info!("session monitor: -> finalized");

        if let Err(e) = store.set_session_live(event_id, session_id, false).await {
            warn!(error = %e, "failed to mark session not live");
        }

        let result = SessionResult {
            event_id: event_id.to_string(),
            session_id: session_id.to_string(),
            entry_count: state.event_entries.len(),
            car_count: state.car_positions.len(),
            flag_count: state.flag_durations.len(),
            state_json: serde_json::to_string(state).unwrap_or_default(),
        };

        if let Err(e) = store.save_session_result(&result).await {
            warn!(error = %e, "failed to save session result");
        }
    }

    /// Whether a "last updated" write is due, given the debounce
    /// interval; marks the write as done if so.
    pub fn should_write_last_updated(&mut self) -> bool {
        let due = self
            .last_update_written_at
            .is_none_or(|t| t.elapsed() >= LAST_UPDATED_DEBOUNCE);
        if due {
            self.last_update_written_at = Some(Instant::now());
        }
        due
    }
}

impl Default for SessionMonitor {
    fn default() -> Self {
        Self::new()
    }
}
