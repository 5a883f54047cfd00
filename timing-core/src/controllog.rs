//! Control-Log Enricher: periodically re-fetches control
//! log entries, indexes them per car, derives penalty counts, and
//! publishes the cars whose entries actually changed.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use timing_contracts::hub::{ControlLogEntryView, ControlLogUpdate, HubMessage};
use timing_contracts::patch::PenaltyCounts;
use tracing::warn;

use crate::ports::{ControlLogEntry, ControlLogSource, Hub, PortResult};

fn warning_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)warning").unwrap())
}

fn lap_count_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)(\d+)\s+laps?").unwrap())
}

/// Lower-cases `car1`/`car2`/`highlighted_car`; entries with neither car
/// set land in the empty-key bucket, mirroring unassigned entries.
fn index_by_car(entries: &[ControlLogEntry]) -> HashMap<String, Vec<ControlLogEntry>> {
    let mut index: HashMap<String, Vec<ControlLogEntry>> = HashMap::new();
    for entry in entries {
        let key = entry.car1.to_lowercase();
        index.entry(key).or_default().push(entry.clone());
        if let Some(car2) = &entry.car2 {
            let key = car2.to_lowercase();
            index.entry(key).or_default().push(entry.clone());
        }
    }
    index
}

fn penalties_for(entries: &[ControlLogEntry]) -> PenaltyCounts {
    let mut warnings = 0;
    let mut laps = 0;
    for entry in entries {
        if warning_re().is_match(&entry.penalty_action) {
            warnings += 1;
        }
        if let Some(captures) = lap_count_re().captures(&entry.penalty_action) {
            if let Some(n) = captures.get(1).and_then(|m| m.as_str().parse::<u32>().ok()) {
                laps += n;
            }
        }
    }
    PenaltyCounts { warnings, laps }
}

/// Which car an entry's penalty applies to: the highlighted car if set,
/// otherwise `car1`.
fn penalty_target(entry: &ControlLogEntry) -> &str {
    if entry.car2.is_some() {
        entry.highlighted_car.as_deref().unwrap_or(&entry.car1)
    } else {
        &entry.car1
    }
}

fn to_view(entry: &ControlLogEntry) -> ControlLogEntryView {
    ControlLogEntryView {
        order_id: entry.order_id,
        car1: Some(entry.car1.clone()),
        car2: entry.car2.clone(),
        highlighted_car: entry.highlighted_car.clone(),
        penalty_action: entry.penalty_action.clone(),
        notes: entry.notes.clone(),
    }
}

/// Signature used to detect whether a car's control log entries changed
/// between two polls: `(OrderId + the seven penalty-relevant fields)`.
fn entry_signature(entry: &ControlLogEntry) -> (u64, String, Option<String>, Option<String>, String, String, String) {
    (
        entry.order_id,
        entry.car1.clone(),
        entry.car2.clone(),
        entry.highlighted_car.clone(),
        entry.penalty_action.clone(),
        entry.notes.clone(),
        penalty_target(entry).to_string(),
    )
}

#[derive(Default)]
pub struct ControlLogProcessor {
    by_car: HashMap<String, Vec<ControlLogEntry>>,
}

impl ControlLogProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-fetches entries via `source`, recomputes the per-car index and
    /// penalty counts, and publishes updates for cars whose entry lists
    /// changed since the previous poll (by index or `entry_signature`).
    pub async fn poll<S: ControlLogSource, H: Hub>(
        &mut self,
        parameter: &str,
        group: &str,
        source: &S,
        hub: &H,
    ) -> PortResult<()> {
        let entries = source.load(parameter).await?;
        let new_index = index_by_car(&entries);

        let mut changed_cars: Vec<String> = Vec::new();
        for (car, entries) in &new_index {
            let previously = self.by_car.get(car);
            let changed = match previously {
                None => true,
                Some(old) => {
                    old.len() != entries.len()
                        || old
                            .iter()
                            .zip(entries.iter())
                            .any(|(a, b)| entry_signature(a) != entry_signature(b))
                }
            };
            if changed {
                changed_cars.push(car.clone());
            }
        }
        for car in self.by_car.keys() {
            if !new_index.contains_key(car) {
                changed_cars.push(car.clone());
            }
        }

        self.by_car = new_index;

        for car in changed_cars {
            let entries = self.by_car.get(&car).cloned().unwrap_or_default();
            let update = ControlLogUpdate {
                car_number: car.clone(),
                entries: entries.iter().map(to_view).collect(),
                penalties: penalties_for(&entries),
            };
            if let Err(e) = hub.send_to_group(group, HubMessage::ControlLog(update)).await {
                warn!(error = %e, car = %car, "failed to publish control log update");
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn entry(order_id: u64, car1: &str, car2: Option<&str>, highlighted: Option<&str>, action: &str) -> ControlLogEntry {
        ControlLogEntry {
            order_id,
            car1: car1.to_string(),
            car2: car2.map(str::to_string),
            highlighted_car: highlighted.map(str::to_string),
            penalty_action: action.to_string(),
            notes: String::new(),
        }
    }

    #[derive(Default)]
    struct FakeSource {
        entries: Mutex<Vec<ControlLogEntry>>,
    }
    impl ControlLogSource for FakeSource {
        async fn load(&self, _parameter: &str) -> PortResult<Vec<ControlLogEntry>> {
            Ok(self.entries.lock().unwrap().clone())
        }
    }

    #[derive(Default)]
    struct FakeHub {
        sent: Mutex<Vec<(String, HubMessage)>>,
    }
    impl Hub for FakeHub {
        async fn send_to_group(&self, group: &str, message: HubMessage) -> PortResult<()> {
            self.sent.lock().unwrap().push((group.to_string(), message));
            Ok(())
        }
    }

    #[test]
    fn warnings_count_case_insensitive_matches() {
        let entries = vec![
            entry(1, "7", None, None, "Black Flag Warning issued"),
            entry(2, "7", None, None, "WARNING: unsafe release"),
        ];
        let counts = penalties_for(&entries);
        assert_eq!(counts.warnings, 2);
    }

    #[test]
    fn lap_penalty_sums_first_captured_number() {
        let entries = vec![
            entry(1, "7", None, None, "Drive through, 2 laps added"),
            entry(2, "7", None, None, "1 lap penalty"),
        ];
        let counts = penalties_for(&entries);
        assert_eq!(counts.laps, 3);
    }

    #[test]
    fn two_car_entry_targets_highlighted_car() {
        let e = entry(1, "7", Some("9"), Some("9"), "contact");
        assert_eq!(penalty_target(&e), "9");
    }

    #[test]
    fn two_car_entry_without_highlight_targets_car1() {
        let e = entry(1, "7", Some("9"), None, "contact");
        assert_eq!(penalty_target(&e), "7");
    }

    #[tokio::test]
    async fn poll_publishes_only_changed_cars() {
        let source = FakeSource::default();
        *source.entries.lock().unwrap() = vec![entry(1, "7", None, None, "warning")];
        let hub = FakeHub::default();
        let mut processor = ControlLogProcessor::new();

        processor.poll("evt42", "evt42-sub", &source, &hub).await.unwrap();
        assert_eq!(hub.sent.lock().unwrap().len(), 1);

        processor.poll("evt42", "evt42-sub", &source, &hub).await.unwrap();
        assert_eq!(hub.sent.lock().unwrap().len(), 1);

        *source.entries.lock().unwrap() = vec![entry(1, "7", None, None, "warning, 2 laps")];
        processor.poll("evt42", "evt42-sub", &source, &hub).await.unwrap();
        assert_eq!(hub.sent.lock().unwrap().len(), 2);
    }
}
