//! Update Consolidator: merges patches from every stage
//! into periodic batches so the aggregator sends whole updates rather
//! than one message per field change.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use timing_contracts::patch::{CarPositionPatch, SessionStatePatch};

const DEBOUNCE: Duration = Duration::from_millis(20);

/// Accumulates patches arriving within a debounce window. The window
/// starts on the first patch after a flush and resets once
/// [`take_batch_if_ready`] fires.
pub struct Consolidator {
    event_id: String,
    session_id: String,
    session_patch: Option<SessionStatePatch>,
    car_patches: HashMap<String, CarPositionPatch>,
    window_started_at: Option<Instant>,
}

/// One consolidated batch, ready to hand to the aggregator. Car patches
/// that reduced to identity-only are never inserted, so every entry
/// here carries a real change.
pub struct Batch {
    pub session: Option<SessionStatePatch>,
    pub cars: Vec<CarPositionPatch>,
}

impl Consolidator {
    pub fn new(event_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            event_id: event_id.into(),
            session_id: session_id.into(),
            session_patch: None,
            car_patches: HashMap::new(),
            window_started_at: None,
        }
    }

    /// Merges an incoming session patch into the accumulated batch,
    /// starting the debounce window if this is the first patch since the
    /// last flush.
    pub fn offer_session(&mut self, patch: SessionStatePatch) {
        self.start_window_if_needed();
        match &mut self.session_patch {
            Some(accumulated) => accumulated.merge(patch),
            None => self.session_patch = Some(patch),
        }
    }

    /// Merges an incoming car patch into the accumulated batch for that
    /// car, field-last-wins, starting the debounce window if needed.
    pub fn offer_car(&mut self, patch: CarPositionPatch) {
        self.start_window_if_needed();
        self.car_patches
            .entry(patch.number.clone())
            .and_modify(|accumulated| accumulated.merge(patch.clone()))
            .or_insert(patch);
    }

    fn start_window_if_needed(&mut self) {
        if self.window_started_at.is_none() {
            self.window_started_at = Some(Instant::now());
        }
    }

    /// True once the debounce window has elapsed and there is something
    /// to flush.
    pub fn is_ready(&self) -> bool {
        self.window_started_at.is_some_and(|t| t.elapsed() >= DEBOUNCE)
    }

    /// Flushes the accumulated batch if the window has elapsed, dropping
    /// car patches that reduced to identity-only. Resets the window.
    pub fn take_batch_if_ready(&mut self) -> Option<Batch> {
        if !self.is_ready() {
            return None;
        }

        self.window_started_at = None;
        let session = self.session_patch.take();
        let cars: Vec<CarPositionPatch> = self
            .car_patches
            .drain()
            .filter(|(_, patch)| !patch.is_empty())
            .map(|(_, patch)| patch)
            .collect();

        if session.is_none() && cars.is_empty() {
            return None;
        }

        Some(Batch { session, cars })
    }

    pub fn identity_session_patch(&self) -> SessionStatePatch {
        SessionStatePatch::identity(self.event_id.clone(), self.session_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use timing_protocol::Flag;

    #[test]
    fn batch_not_ready_before_debounce_elapses() {
        let mut consolidator = Consolidator::new("42", "1");
        let mut patch = consolidator.identity_session_patch();
        patch.current_flag = Some(Flag::Green);
        consolidator.offer_session(patch);

        assert!(consolidator.take_batch_if_ready().is_none());
    }

    #[test]
    fn identity_only_car_patch_is_dropped_from_batch() {
        let mut consolidator = Consolidator::new("42", "1");
        consolidator.offer_car(CarPositionPatch::identity("7"));
        std::thread::sleep(DEBOUNCE + Duration::from_millis(5));

        assert!(consolidator.take_batch_if_ready().is_none());
    }

    #[test]
    fn merge_preserves_last_writer_wins_within_window() {
        let mut consolidator = Consolidator::new("42", "1");

        let mut first = CarPositionPatch::identity("7");
        first.overall_position = Some(3);
        consolidator.offer_car(first);

        let mut second = CarPositionPatch::identity("7");
        second.overall_position = Some(2);
        consolidator.offer_car(second);

        std::thread::sleep(DEBOUNCE + Duration::from_millis(5));
        let batch = consolidator.take_batch_if_ready().unwrap();
        assert_eq!(batch.cars.len(), 1);
        assert_eq!(batch.cars[0].overall_position, Some(2));
    }

    #[test]
    fn session_and_car_patches_both_flush_together() {
        let mut consolidator = Consolidator::new("42", "1");
        let mut session = consolidator.identity_session_patch();
        session.laps_to_go = Some(10);
        consolidator.offer_session(session);

        let mut car = CarPositionPatch::identity("7");
        car.overall_position = Some(1);
        consolidator.offer_car(car);

        std::thread::sleep(DEBOUNCE + Duration::from_millis(5));
        let batch = consolidator.take_batch_if_ready().unwrap();
        assert_eq!(batch.session.unwrap().laps_to_go, Some(10));
        assert_eq!(batch.cars.len(), 1);
    }

    use proptest::prelude::*;

    proptest! {
        // Whatever interleaving of car patches arrives within one debounce
        // window, the field the batch reports is whichever offer last set
        // a value for it — the rest of the sequence must never leak back
        // through a later merge.
        #[test]
        fn car_patch_merge_is_last_writer_wins(positions in proptest::collection::vec(0u32..50, 1..10)) {
            let mut consolidator = Consolidator::new("42", "1");
            for &pos in &positions {
                let mut patch = CarPositionPatch::identity("7");
                patch.overall_position = Some(pos);
                consolidator.offer_car(patch);
            }
            std::thread::sleep(DEBOUNCE + Duration::from_millis(5));

            let batch = consolidator.take_batch_if_ready().unwrap();
            prop_assert_eq!(batch.cars.len(), 1);
            prop_assert_eq!(batch.cars[0].overall_position, Some(*positions.last().unwrap()));
        }
    }
}
