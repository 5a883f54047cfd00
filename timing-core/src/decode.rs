//! Decoder-to-patch mapping: translates a decoded
//! [`RMonitorUpdate`](timing_parser::rmonitor::RMonitorUpdate) or
//! [`MultiloopUpdate`](timing_parser::multiloop::MultiloopUpdate) into
//! the session/car patches the rest of the pipeline already knows how
//! to merge and enrich.
//!
//! Kept pure and synchronous — no locks, no I/O — so `main.rs` can call
//! these functions directly off the ingress loop and hand the resulting
//! [`Effect`]s to `SessionContext`, the flag processor, and the lap
//! processor.

use timing_contracts::patch::{CarPositionPatch, CompletedSection, FlagDuration, SessionStatePatch};
use timing_parser::multiloop::{MultiloopUpdate, RunType};
use timing_parser::rmonitor::RMonitorUpdate;

use crate::model::{CarPosition, SessionState};

/// One unit of pipeline work produced by decoding a single update.
/// `main.rs` dispatches each variant to the component that owns it
/// rather than applying patches itself, so e.g. a `FlagDuration` still
/// goes through the flag processor's reconciliation against the store.
#[derive(Debug, Clone)]
pub enum Effect {
    Session(SessionStatePatch),
    Car(CarPositionPatch),
    /// `$B` / multiloop session boundary: snapshot and reset rather than
    /// a field-level patch.
    NewSession { session_id: String, session_name: String },
    FlagDuration(FlagDuration),
    /// A lap just completed for `car_number`; the caller feeds this
    /// through `LapProcessor::observe` for debounce before committing.
    LapCompleted { car_number: String, lap_number: u32 },
}

/// Formats whole milliseconds as a full `HH:MM:SS.fff` clock string,
/// matching the format `totalTime`/`lastLapTime`/`bestTime` are carried
/// in everywhere else in the pipeline.
pub fn millis_to_clock(ms: u64) -> String {
    let hours = ms / 3_600_000;
    let minutes = (ms % 3_600_000) / 60_000;
    let seconds = (ms % 60_000) / 1_000;
    let millis = ms % 1_000;
    format!("{hours:02}:{minutes:02}:{seconds:02}.{millis:03}")
}

/// Translates one decoded RMonitor update into the effects it implies.
pub fn rmonitor_effects(event_id: &str, session_id: &str, update: RMonitorUpdate) -> Vec<Effect> {
    match update {
        RMonitorUpdate::CompetitorState { entries } => {
            let mut patch = SessionStatePatch::identity(event_id, session_id);
            patch.event_entries = Some(
                entries
                    .into_iter()
                    .map(|e| timing_contracts::patch::EventEntry {
                        number: e.number,
                        name: e.name,
                        team: e.team,
                        class: e.class,
                    })
                    .collect(),
            );
            vec![Effect::Session(patch)]
        }
        RMonitorUpdate::Heartbeat { flag, local_time_of_day, time_to_go, laps_to_go } => {
            let mut patch = SessionStatePatch::identity(event_id, session_id);
            patch.current_flag = Some(flag);
            patch.local_time_of_day = Some(local_time_of_day);
            patch.time_to_go = Some(time_to_go);
            if let Some(laps) = laps_to_go {
                patch.laps_to_go = Some(laps);
            }
            vec![Effect::Session(patch)]
        }
        RMonitorUpdate::CarLap { number, overall_position, laps, race_time, track_flag } => {
            let mut effects = Vec::new();
            let mut patch = CarPositionPatch::identity(&number);
            if let Some(position) = overall_position {
                patch.overall_position = Some(position);
            }
            patch.total_time = Some(race_time);
            patch.track_flag = Some(track_flag);
            if let Some(lap_number) = laps {
                patch.last_lap_completed = Some(lap_number);
                effects.push(Effect::LapCompleted { car_number: number.clone(), lap_number });
            }
            effects.push(Effect::Car(patch));
            effects
        }
        RMonitorUpdate::PracticeLap { number, laps, lap_time } => {
            let mut effects = Vec::new();
            let mut patch = CarPositionPatch::identity(&number);
            patch.last_lap_time = Some(lap_time);
            if let Some(lap_number) = laps {
                patch.last_lap_completed = Some(lap_number);
                effects.push(Effect::LapCompleted { car_number: number.clone(), lap_number });
            }
            effects.push(Effect::Car(patch));
            effects
        }
        RMonitorUpdate::SessionChanged { session_id, session_name } => {
            vec![Effect::NewSession { session_id, session_name }]
        }
    }
}

/// Translates one decoded Multiloop update into the effects it implies.
/// `session` is the current snapshot, consulted for updates that append
/// to or derive from existing state (completed sections, lead changes)
/// rather than replacing a field outright.
pub fn multiloop_effects(event_id: &str, session_id: &str, update: MultiloopUpdate, session: &SessionState) -> Vec<Effect> {
    let mut effects = vec![Effect::Session({
        let mut p = SessionStatePatch::identity(event_id, session_id);
        p.is_multiloop_active = Some(true);
        p
    })];

    match update {
        MultiloopUpdate::Heartbeat { run_type: _, flag, time_to_go, laps_to_go } => {
            let mut patch = SessionStatePatch::identity(event_id, session_id);
            patch.current_flag = Some(flag);
            patch.time_to_go = Some(time_to_go);
            if let Some(laps) = laps_to_go {
                patch.laps_to_go = Some(laps);
            }
            effects.push(Effect::Session(patch));
        }
        MultiloopUpdate::Entry { number, name, class } => {
            let mut patch = CarPositionPatch::identity(&number);
            patch.driver_name = Some(name);
            patch.class = Some(class);
            effects.push(Effect::Car(patch));
        }
        MultiloopUpdate::CompletedLap { number, lap_number, lap_time_ms, total_time_ms } => {
            let mut patch = CarPositionPatch::identity(&number);
            if let Some(ms) = lap_time_ms {
                patch.last_lap_time = Some(millis_to_clock(ms));
            }
            if let Some(ms) = total_time_ms {
                patch.total_time = Some(millis_to_clock(ms));
            }
            // A completed lap clears the accumulated section list for
            // the next lap.
            patch.completed_sections = Some(Vec::new());
            if let Some(lap) = lap_number {
                patch.last_lap_completed = Some(lap);
                effects.push(Effect::LapCompleted { car_number: number.clone(), lap_number: lap });
            }
            effects.push(Effect::Car(patch));
        }
        MultiloopUpdate::CompletedSection { number, section_id, section_name, elapsed_ms } => {
            let car = session.car_positions.get(&number);
            let last_section_time_ms = car
                .and_then(|c| c.completed_sections.iter().find(|s| s.id == section_id))
                .map(|s| s.elapsed_ms);
            let last_lap = car.map(|c| c.last_lap_completed).unwrap_or(0);

            let mut sections = car.map(|c| c.completed_sections.clone()).unwrap_or_default();
            let new_section = CompletedSection {
                id: section_id.clone(),
                name: section_name,
                elapsed_ms: elapsed_ms.unwrap_or(0),
                last_section_time_ms,
                last_lap,
            };
            match sections.iter_mut().find(|s| s.id == section_id) {
                Some(existing) => *existing = new_section,
                None => sections.push(new_section),
            }

            let mut patch = CarPositionPatch::identity(&number);
            patch.completed_sections = Some(sections);
            effects.push(Effect::Car(patch));
        }
        MultiloopUpdate::LineCrossing { loop_id: _, loop_name, number, time_of_day: _ } => {
            // A start/finish crossing; the finer-grained pit-entrance/
            // pit-exit membership comes from x2pass + the pit/loop
            // processor, bypassed while multiloop is active.
            let mut patch = CarPositionPatch::identity(&number);
            patch.is_pit_start_finish = Some(true);
            patch.last_loop_name = Some(loop_name);
            effects.push(Effect::Car(patch));
        }
        MultiloopUpdate::InvalidatedLap { number: _, lap_number: _ } => {
            // CarLapLog is append-only; an
            // invalidated lap is logged upstream via EventStatusLog but
            // has no retraction operation on already-committed rows.
        }
        MultiloopUpdate::FlagMetrics { flag, start_time, end_time } => {
            effects.push(Effect::FlagDuration(FlagDuration { flag, start_time, end_time }));
        }
        MultiloopUpdate::PracticeQualifying { run_type } => {
            let _ = run_type.unwrap_or(RunType::Practice);
        }
        MultiloopUpdate::NewLeader { number: _ } => {
            let mut patch = SessionStatePatch::identity(event_id, session_id);
            patch.lead_changes = Some(session.lead_changes + 1);
            effects.push(Effect::Session(patch));
        }
        MultiloopUpdate::TrackInfo { name: _ } | MultiloopUpdate::Announcement { text: _ } | MultiloopUpdate::Version { version: _ } => {
            // No corresponding SessionState/CarPosition field; informational only.
        }
    }

    effects
}

#[cfg(test)]
mod tests {
    use super::*;
    use timing_parser::rmonitor::CompetitorRecord;
    use timing_protocol::Flag;

    #[test]
    fn millis_to_clock_formats_hms() {
        assert_eq!(millis_to_clock(83_456), "00:01:23.456");
        assert_eq!(millis_to_clock(3_661_000), "01:01:01.000");
    }

    #[test]
    fn competitor_state_rebuilds_event_entries() {
        let effects = rmonitor_effects(
            "42",
            "1",
            RMonitorUpdate::CompetitorState {
                entries: vec![CompetitorRecord {
                    number: "7".into(),
                    name: "Alice".into(),
                    team: "Team A".into(),
                    class: "GT3".into(),
                }],
            },
        );
        match &effects[0] {
            Effect::Session(patch) => assert_eq!(patch.event_entries.as_ref().unwrap().len(), 1),
            other => panic!("unexpected effect: {other:?}"),
        }
    }

    #[test]
    fn car_lap_emits_patch_and_lap_completed() {
        let effects = rmonitor_effects(
            "42",
            "1",
            RMonitorUpdate::CarLap {
                number: "7".into(),
                overall_position: Some(2),
                laps: Some(5),
                race_time: "00:10:00.000".into(),
                track_flag: Flag::Green,
            },
        );
        assert!(effects.iter().any(|e| matches!(e, Effect::LapCompleted { car_number, lap_number } if car_number == "7" && *lap_number == 5)));
        assert!(effects.iter().any(|e| matches!(e, Effect::Car(p) if p.overall_position == Some(2))));
    }

    #[test]
    fn session_changed_is_a_new_session_effect() {
        let effects = rmonitor_effects(
            "42",
            "1",
            RMonitorUpdate::SessionChanged { session_id: "2".into(), session_name: "Race 2".into() },
        );
        assert!(matches!(&effects[0], Effect::NewSession { session_id, .. } if session_id == "2"));
    }

    #[test]
    fn multiloop_update_always_marks_multiloop_active() {
        let session = SessionState::new("42", "1");
        let effects = multiloop_effects(
            "42",
            "1",
            MultiloopUpdate::Version { version: "1.0".into() },
            &session,
        );
        assert!(matches!(&effects[0], Effect::Session(p) if p.is_multiloop_active == Some(true)));
    }

    #[test]
    fn completed_section_appends_new_id_and_replaces_existing() {
        let mut session = SessionState::new("42", "1");
        let mut car = CarPosition::new("7");
        car.last_lap_completed = 3;
        car.completed_sections.push(CompletedSection {
            id: "S1".into(),
            name: "Sector 1".into(),
            elapsed_ms: 10_000,
            last_section_time_ms: None,
            last_lap: 2,
        });
        session.car_positions.insert("7".to_string(), car);

        let effects = multiloop_effects(
            "42",
            "1",
            MultiloopUpdate::CompletedSection {
                number: "7".into(),
                section_id: "S1".into(),
                section_name: "Sector 1".into(),
                elapsed_ms: Some(11_000),
            },
            &session,
        );

        let car_patch = effects
            .iter()
            .find_map(|e| match e {
                Effect::Car(p) => Some(p),
                _ => None,
            })
            .unwrap();
        let sections = car_patch.completed_sections.as_ref().unwrap();
        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].elapsed_ms, 11_000);
        assert_eq!(sections[0].last_section_time_ms, Some(10_000));
    }

    #[test]
    fn completed_lap_clears_sections_and_formats_times() {
        let effects = multiloop_effects(
            "42",
            "1",
            MultiloopUpdate::CompletedLap {
                number: "7".into(),
                lap_number: Some(4),
                lap_time_ms: Some(83_456),
                total_time_ms: Some(3_661_000),
            },
            &SessionState::new("42", "1"),
        );
        let car_patch = effects
            .iter()
            .find_map(|e| match e {
                Effect::Car(p) => Some(p),
                _ => None,
            })
            .unwrap();
        assert_eq!(car_patch.last_lap_time.as_deref(), Some("00:01:23.456"));
        assert_eq!(car_patch.total_time.as_deref(), Some("01:01:01.000"));
        assert_eq!(car_patch.completed_sections, Some(Vec::new()));
        assert!(effects.iter().any(|e| matches!(e, Effect::LapCompleted { lap_number, .. } if *lap_number == 4)));
    }

    #[test]
    fn flag_metrics_becomes_flag_duration_effect() {
        let effects = multiloop_effects(
            "42",
            "1",
            MultiloopUpdate::FlagMetrics { flag: Flag::Yellow, start_time: "10".into(), end_time: None },
            &SessionState::new("42", "1"),
        );
        assert!(effects.iter().any(|e| matches!(e, Effect::FlagDuration(d) if d.flag == Flag::Yellow)));
    }

    #[test]
    fn new_leader_increments_lead_changes_from_snapshot() {
        let mut session = SessionState::new("42", "1");
        session.lead_changes = 2;
        let effects = multiloop_effects("42", "1", MultiloopUpdate::NewLeader { number: "7".into() }, &session);
        assert!(effects.iter().any(|e| matches!(e, Effect::Session(p) if p.lead_changes == Some(3))));
    }

    use proptest::prelude::*;

    fn arb_competitor() -> impl Strategy<Value = CompetitorRecord> {
        ("[A-Z0-9]{1,4}", "[a-zA-Z ]{1,12}", "[a-zA-Z ]{1,12}", "[A-Z0-9]{1,4}").prop_map(
            |(number, name, team, class)| CompetitorRecord { number, name, team, class },
        )
    }

    proptest! {
        // Re-processing the same $A competitor roster twice in a row is a
        // no-op: eventEntries on the second pass is byte-for-byte the same
        // as the first, since CompetitorState always rebuilds the full
        // list rather than appending to it.
        #[test]
        fn reprocessing_same_competitor_state_is_a_no_op(entries in proptest::collection::vec(arb_competitor(), 0..8)) {
            let update = || RMonitorUpdate::CompetitorState { entries: entries.clone() };

            let first = rmonitor_effects("42", "1", update());
            let second = rmonitor_effects("42", "1", update());

            let entries_of = |effects: &[Effect]| match &effects[0] {
                Effect::Session(patch) => patch.event_entries.clone(),
                other => panic!("unexpected effect: {other:?}"),
            };

            prop_assert_eq!(entries_of(&first), entries_of(&second));
        }
    }
}
