//! Pit / Loop Processor: classifies transponder passings
//! against loop metadata into pit-in/out/SF/other membership, and
//! tracks which laps included a pit stop for the lap processor.

use std::collections::{HashMap, HashSet};

use timing_contracts::patch::CarPositionPatch;
use tracing::warn;

use crate::ports::{LoopMetadata, LoopType, Store};

#[derive(Debug, Clone)]
pub struct Passing {
    pub transponder_id: String,
    pub loop_id: String,
    pub is_in_pit: bool,
}

#[derive(Default)]
struct Memberships {
    in_pit: HashSet<String>,
    pit_entrance: HashSet<String>,
    pit_exit: HashSet<String>,
    pit_sf: HashSet<String>,
    pit_other: HashSet<String>,
    other: HashSet<String>,
}

impl Memberships {
    fn clear_transponder(&mut self, transponder_id: &str) {
        self.in_pit.remove(transponder_id);
        self.pit_entrance.remove(transponder_id);
        self.pit_exit.remove(transponder_id);
        self.pit_sf.remove(transponder_id);
        self.pit_other.remove(transponder_id);
        self.other.remove(transponder_id);
    }
}

/// Per-event pit/loop classification state. When the session's
/// multiloop decoder has become active, the caller should stop feeding
/// this processor (spec: "multiloop `$L`/`$C` win").
pub struct PitLoopProcessor {
    loop_metadata: HashMap<String, LoopMetadata>,
    memberships: Memberships,
    /// `carNumber -> lap numbers during which the car was in the pits`,
    /// consulted by the lap processor to set `lapIncludedPit`.
    car_laps_with_pit_stops: HashMap<String, HashSet<u32>>,
    pit_stop_counts: HashMap<String, u32>,
}

impl PitLoopProcessor {
    pub fn new() -> Self {
        Self {
            loop_metadata: HashMap::new(),
            memberships: Memberships::default(),
            car_laps_with_pit_stops: HashMap::new(),
            pit_stop_counts: HashMap::new(),
        }
    }

    pub async fn reload_loop_metadata<S: Store>(&mut self, store: &S, event_id: &str) {
        match store.load_loop_metadata(event_id).await {
            Ok(loops) => {
                self.loop_metadata = loops.into_iter().map(|l| (l.loop_id.clone(), l)).collect();
            }
            Err(e) => warn!(error = %e, "failed to reload loop metadata"),
        }
    }

    /// Classifies one passing and returns the `CarPositionPatch` to
    /// apply to the car the transponder currently maps to, plus whether
    /// this passing is a fresh pit entry (for `pit_stop_count`).
    pub fn process_passing(
        &mut self,
        passing: &Passing,
        car_number: &str,
        current_lap_number: u32,
    ) -> CarPositionPatch {
        self.memberships.clear_transponder(&passing.transponder_id);

        let loop_type = self
            .loop_metadata
            .get(&passing.loop_id)
            .map(|l| l.loop_type)
            .unwrap_or(LoopType::Other);
        let loop_name = self
            .loop_metadata
            .get(&passing.loop_id)
            .map(|l| l.name.clone())
            .unwrap_or_default();

        let was_entering = passing.is_in_pit && loop_type == LoopType::PitIn;

        if passing.is_in_pit {
            self.memberships.in_pit.insert(passing.transponder_id.clone());
            match loop_type {
                LoopType::PitIn => {
                    self.memberships.pit_entrance.insert(passing.transponder_id.clone());
                }
                LoopType::PitStartFinish => {
                    self.memberships.pit_sf.insert(passing.transponder_id.clone());
                }
                LoopType::PitOther => {
                    self.memberships.pit_other.insert(passing.transponder_id.clone());
                }
                _ => {}
            }
        } else {
            match loop_type {
                LoopType::PitExit => {
                    // Still "in pit" on the exit passing itself — only
                    // the next non-pit passing clears membership.
                    self.memberships.in_pit.insert(passing.transponder_id.clone());
                    self.memberships.pit_exit.insert(passing.transponder_id.clone());
                }
                LoopType::PitStartFinish => {
                    self.memberships.pit_sf.insert(passing.transponder_id.clone());
                }
                LoopType::PitOther => {
                    self.memberships.pit_other.insert(passing.transponder_id.clone());
                }
                LoopType::Other => {
                    self.memberships.other.insert(passing.transponder_id.clone());
                }
                LoopType::PitIn => {}
            }
        }

        if was_entering {
            self.car_laps_with_pit_stops
                .entry(car_number.to_string())
                .or_default()
                .insert(current_lap_number);
            *self.pit_stop_counts.entry(car_number.to_string()).or_insert(0) += 1;
        }

        let mut patch = CarPositionPatch::identity(car_number);
        patch.is_in_pit = Some(self.memberships.in_pit.contains(&passing.transponder_id));
        patch.is_entered_pit = Some(self.memberships.pit_entrance.contains(&passing.transponder_id));
        patch.is_exited_pit = Some(self.memberships.pit_exit.contains(&passing.transponder_id));
        patch.is_pit_start_finish = Some(self.memberships.pit_sf.contains(&passing.transponder_id));
        patch.last_loop_name = Some(loop_name);
        if was_entering {
            patch.pit_stop_count = Some(*self.pit_stop_counts.get(car_number).unwrap_or(&0));
        }
        patch
    }

    /// Whether `lap_number` for `car_number` included a pit stop — used
    /// by the lap processor to set `lapIncludedPit` on commit.
    pub fn lap_included_pit(&self, car_number: &str, lap_number: u32) -> bool {
        self.car_laps_with_pit_stops
            .get(car_number)
            .is_some_and(|laps| laps.contains(&lap_number))
    }
}

impl Default for PitLoopProcessor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pit_in_loop() -> LoopMetadata {
        LoopMetadata {
            loop_id: "L1".into(),
            name: "Pit In".into(),
            loop_type: LoopType::PitIn,
        }
    }

    fn pit_exit_loop() -> LoopMetadata {
        LoopMetadata {
            loop_id: "L2".into(),
            name: "Pit Exit".into(),
            loop_type: LoopType::PitExit,
        }
    }

    fn processor_with(loops: Vec<LoopMetadata>) -> PitLoopProcessor {
        let mut p = PitLoopProcessor::new();
        p.loop_metadata = loops.into_iter().map(|l| (l.loop_id.clone(), l)).collect();
        p
    }

    #[test]
    fn pit_in_then_pit_exit_then_next_passing_clears_state() {
        let mut processor = processor_with(vec![pit_in_loop(), pit_exit_loop()]);

        let enter = processor.process_passing(
            &Passing { transponder_id: "T1".into(), loop_id: "L1".into(), is_in_pit: true },
            "7",
            3,
        );
        assert_eq!(enter.is_entered_pit, Some(true));
        assert_eq!(enter.is_in_pit, Some(true));

        let exit = processor.process_passing(
            &Passing { transponder_id: "T1".into(), loop_id: "L2".into(), is_in_pit: false },
            "7",
            3,
        );
        assert_eq!(exit.is_exited_pit, Some(true));
        assert_eq!(exit.is_in_pit, Some(true));

        let next = processor.process_passing(
            &Passing { transponder_id: "T1".into(), loop_id: "L3".into(), is_in_pit: false },
            "7",
            4,
        );
        assert_eq!(next.is_in_pit, Some(false));
        assert_eq!(next.is_exited_pit, Some(false));
    }

    #[test]
    fn lap_included_pit_reflects_entry_lap() {
        let mut processor = processor_with(vec![pit_in_loop()]);
        processor.process_passing(
            &Passing { transponder_id: "T1".into(), loop_id: "L1".into(), is_in_pit: true },
            "7",
            5,
        );
        assert!(processor.lap_included_pit("7", 5));
        assert!(!processor.lap_included_pit("7", 6));
    }
}
