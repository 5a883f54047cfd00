//! Position Enricher: class positions, overall/class gap &
//! difference, best-time flags, positions gained/lost, and starting
//! position application.
//!
//! Operates on a deep copy of `carPositions` taken from a
//! `SessionContext` snapshot and diffs the result against the
//! originals to produce patches — mirrors the `calculate_positions`
//! pattern of deriving a fresh view and comparing rather than mutating
//! car state in place.

use std::collections::HashMap;

use timing_contracts::patch::{CarPositionPatch, PositionsGained};
use timing_protocol::time::{format_gap_millis, format_lap_gap, parse_clock_to_millis};

use crate::model::CarPosition;

/// Recomputes positions, gaps, best times and positions-gained across
/// every car in `cars`, returning one patch per car whose enriched view
/// differs from its input (patches with only identity are discarded).
pub fn enrich(cars: &HashMap<String, CarPosition>) -> Vec<CarPositionPatch> {
    let mut updated: HashMap<String, CarPosition> = cars.clone();

    apply_overall_ranking(&mut updated);
    apply_gaps(&mut updated);
    apply_class_positions_and_gaps(&mut updated);
    apply_best_times(&mut updated);
    apply_positions_gained(&mut updated);

    cars.iter()
        .filter_map(|(number, original)| diff(number, original, &updated[number]))
        .collect()
}

fn sorted_numbers(cars: &HashMap<String, CarPosition>) -> Vec<String> {
    let mut numbers: Vec<String> = cars.keys().cloned().collect();
    numbers.sort_by_key(|n| {
        let pos = cars[n].overall_position;
        if pos == 0 { u32::MAX } else { pos }
    });
    numbers
}

fn apply_overall_ranking(_cars: &mut HashMap<String, CarPosition>) {
    // Overall position itself is set upstream by the decoders; this
    // stage only reads the existing ranking to drive gap/diff/class
    // computation below.
}

fn apply_gaps(cars: &mut HashMap<String, CarPosition>) {
    let order = sorted_numbers(cars);
    let mut prev_total_ms: Option<u64> = None;
    let mut prev_lap = 0u32;
    let mut leader_total_ms: Option<u64> = None;

    for (i, number) in order.iter().enumerate() {
        if cars[number].overall_position == 0 {
            continue;
        }
        let total_ms = parse_clock_to_millis(&cars[number].total_time);
        let lap = cars[number].last_lap_completed;

        if i == 0 {
            leader_total_ms = total_ms;
            let car = cars.get_mut(number).unwrap();
            car.overall_gap = String::new();
            car.overall_difference = String::new();
        } else {
            let (gap, diff) = gap_and_diff(total_ms, lap, prev_total_ms, prev_lap, leader_total_ms);
            let car = cars.get_mut(number).unwrap();
            car.overall_gap = gap;
            car.overall_difference = diff;
        }

        prev_total_ms = total_ms;
        prev_lap = lap;
    }
}

fn gap_and_diff(
    total_ms: Option<u64>,
    lap: u32,
    prev_total_ms: Option<u64>,
    prev_lap: u32,
    leader_total_ms: Option<u64>,
) -> (String, String) {
    let gap = if lap == prev_lap {
        match (total_ms, prev_total_ms) {
            (Some(t), Some(p)) => format_gap_millis(t.saturating_sub(p)),
            _ => String::new(),
        }
    } else {
        format_lap_gap(prev_lap.saturating_sub(lap))
    };

    let diff = match (total_ms, leader_total_ms) {
        (Some(t), Some(l)) if lap == prev_lap || prev_lap == lap => format_gap_millis(t.saturating_sub(l)),
        _ => gap.clone(),
    };

    (gap, diff)
}

fn apply_class_positions_and_gaps(cars: &mut HashMap<String, CarPosition>) {
    let mut by_class: HashMap<String, Vec<String>> = HashMap::new();
    for (number, car) in cars.iter() {
        by_class.entry(car.class.clone()).or_default().push(number.clone());
    }

    for (_, mut numbers) in by_class {
        numbers.sort_by_key(|n| {
            let pos = cars[n].overall_position;
            if pos == 0 { u32::MAX } else { pos }
        });

        let mut prev_total_ms: Option<u64> = None;
        let mut prev_lap = 0u32;
        let mut leader_total_ms: Option<u64> = None;

        for (rank, number) in numbers.iter().enumerate() {
            let class_position = (rank as u32) + 1;
            let total_ms = parse_clock_to_millis(&cars[number].total_time);
            let lap = cars[number].last_lap_completed;

            if rank == 0 {
                leader_total_ms = total_ms;
                let car = cars.get_mut(number).unwrap();
                car.class_position = class_position;
                car.in_class_gap = String::new();
                car.in_class_difference = String::new();
            } else {
                let (gap, diff) = gap_and_diff(total_ms, lap, prev_total_ms, prev_lap, leader_total_ms);
                let car = cars.get_mut(number).unwrap();
                car.class_position = class_position;
                car.in_class_gap = gap;
                car.in_class_difference = diff;
            }

            prev_total_ms = total_ms;
            prev_lap = lap;
        }
    }
}

fn apply_best_times(cars: &mut HashMap<String, CarPosition>) {
    for car in cars.values_mut() {
        car.is_best_time = false;
        car.is_best_time_class = false;
    }

    if let Some(best_overall) = cars
        .values()
        .filter_map(|c| parse_clock_to_millis(&c.best_time).map(|ms| (c.number.clone(), ms)))
        .min_by_key(|(_, ms)| *ms)
    {
        cars.get_mut(&best_overall.0).unwrap().is_best_time = true;
    }

    let mut by_class: HashMap<String, Vec<(String, u64)>> = HashMap::new();
    for car in cars.values() {
        if let Some(ms) = parse_clock_to_millis(&car.best_time) {
            by_class.entry(car.class.clone()).or_default().push((car.number.clone(), ms));
        }
    }
    for (_, entries) in by_class {
        if let Some((number, _)) = entries.iter().min_by_key(|(_, ms)| *ms) {
            cars.get_mut(number).unwrap().is_best_time_class = true;
        }
    }
}

fn apply_positions_gained(cars: &mut HashMap<String, CarPosition>) {
    let mut overall_best: Option<(String, i32)> = None;
    let mut class_best: HashMap<String, (String, i32)> = HashMap::new();
    let mut overall_ties = false;
    let mut class_ties: HashMap<String, bool> = HashMap::new();

    for number in cars.keys().cloned().collect::<Vec<_>>() {
        let (start, current, class) = {
            let car = &cars[&number];
            (car.overall_starting_position, car.overall_position, car.class.clone())
        };
        let gained = if start == 0 || current == 0 {
            PositionsGained::Invalid
        } else {
            PositionsGained::Value(start as i32 - current as i32)
        };
        cars.get_mut(&number).unwrap().overall_positions_gained = Some(gained);

        if let PositionsGained::Value(v) = gained {
            if v > 0 {
                match &overall_best {
                    Some((_, best)) if v > *best => {
                        overall_best = Some((number.clone(), v));
                        overall_ties = false;
                    }
                    Some((_, best)) if v == *best => overall_ties = true,
                    None => overall_best = Some((number.clone(), v)),
                    _ => {}
                }
            }
        }

        let in_class_start = cars[&number].in_class_starting_position;
        let in_class_current = cars[&number].class_position;
        let in_class_gained = if in_class_start == 0 || in_class_current == 0 {
            PositionsGained::Invalid
        } else {
            PositionsGained::Value(in_class_start as i32 - in_class_current as i32)
        };
        cars.get_mut(&number).unwrap().in_class_positions_gained = Some(in_class_gained);

        if let PositionsGained::Value(v) = in_class_gained {
            if v > 0 {
                let entry = class_best.get(&class).cloned();
                match entry {
                    Some((_, best)) if v > best => {
                        class_best.insert(class.clone(), (number.clone(), v));
                        class_ties.insert(class.clone(), false);
                    }
                    Some((_, best)) if v == best => {
                        class_ties.insert(class.clone(), true);
                    }
                    None => {
                        class_best.insert(class.clone(), (number.clone(), v));
                    }
                    _ => {}
                }
            }
        }
    }

    for car in cars.values_mut() {
        car.is_overall_most_positions_gained = false;
        car.is_class_most_positions_gained = false;
    }
    if !overall_ties {
        if let Some((number, _)) = overall_best {
            cars.get_mut(&number).unwrap().is_overall_most_positions_gained = true;
        }
    }
    for (class, (number, _)) in class_best {
        if !*class_ties.get(&class).unwrap_or(&false) {
            cars.get_mut(&number).unwrap().is_class_most_positions_gained = true;
        }
    }
}

fn diff(number: &str, before: &CarPosition, after: &CarPosition) -> Option<CarPositionPatch> {
    let mut patch = CarPositionPatch::identity(number);

    if before.class_position != after.class_position {
        patch.class_position = Some(after.class_position);
    }
    if before.overall_gap != after.overall_gap {
        patch.overall_gap = Some(after.overall_gap.clone());
    }
    if before.overall_difference != after.overall_difference {
        patch.overall_difference = Some(after.overall_difference.clone());
    }
    if before.in_class_gap != after.in_class_gap {
        patch.in_class_gap = Some(after.in_class_gap.clone());
    }
    if before.in_class_difference != after.in_class_difference {
        patch.in_class_difference = Some(after.in_class_difference.clone());
    }
    if before.is_best_time != after.is_best_time {
        patch.is_best_time = Some(after.is_best_time);
    }
    if before.is_best_time_class != after.is_best_time_class {
        patch.is_best_time_class = Some(after.is_best_time_class);
    }
    if before.overall_positions_gained != after.overall_positions_gained {
        patch.overall_positions_gained = after.overall_positions_gained;
    }
    if before.in_class_positions_gained != after.in_class_positions_gained {
        patch.in_class_positions_gained = after.in_class_positions_gained;
    }
    if before.is_overall_most_positions_gained != after.is_overall_most_positions_gained {
        patch.is_overall_most_positions_gained = Some(after.is_overall_most_positions_gained);
    }
    if before.is_class_most_positions_gained != after.is_class_most_positions_gained {
        patch.is_class_most_positions_gained = Some(after.is_class_most_positions_gained);
    }

    if patch.is_empty() {
        None
    } else {
        Some(patch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use timing_protocol::Flag;

    fn car(number: &str, overall_position: u32, total_time: &str, lap: u32) -> CarPosition {
        let mut c = CarPosition::new(number);
        c.overall_position = overall_position;
        c.total_time = total_time.to_string();
        c.last_lap_completed = lap;
        c.class = "GT3".to_string();
        c.track_flag = Flag::Green;
        c
    }

    #[test]
    fn gap_computation_same_lap() {
        let mut cars = HashMap::new();
        cars.insert("1".to_string(), car("1", 1, "00:01:23.000", 10));
        cars.insert("2".to_string(), car("2", 2, "00:01:26.250", 10));

        let patches = enrich(&cars);
        let p2 = patches.iter().find(|p| p.number == "2").unwrap();
        assert_eq!(p2.overall_gap, Some("3.250".to_string()));
        let p1 = patches.iter().find(|p| p.number == "1");
        assert!(p1.is_none() || p1.unwrap().overall_gap.as_deref() == Some(""));
    }

    #[test]
    fn gap_computation_lap_down() {
        let mut cars = HashMap::new();
        cars.insert("1".to_string(), car("1", 1, "00:01:23.000", 10));
        cars.insert("2".to_string(), car("2", 2, "00:01:28.000", 9));

        let patches = enrich(&cars);
        let p2 = patches.iter().find(|p| p.number == "2").unwrap();
        assert_eq!(p2.overall_gap, Some("1 lap".to_string()));
    }

    #[test]
    fn positions_gained_uses_sentinel_when_no_starting_position() {
        let mut cars = HashMap::new();
        let mut c = car("1", 1, "00:01:00.000", 5);
        c.overall_starting_position = 0;
        cars.insert("1".to_string(), c);

        let patches = enrich(&cars);
        let p1 = patches.iter().find(|p| p.number == "1").unwrap();
        assert_eq!(p1.overall_positions_gained, Some(PositionsGained::Invalid));
    }

    #[test]
    fn positions_gained_computed_when_both_present() {
        let mut cars = HashMap::new();
        let mut c = car("1", 2, "00:01:00.000", 5);
        c.overall_starting_position = 5;
        cars.insert("1".to_string(), c);

        let patches = enrich(&cars);
        let p1 = patches.iter().find(|p| p.number == "1").unwrap();
        assert_eq!(p1.overall_positions_gained, Some(PositionsGained::Value(3)));
    }

    #[test]
    fn best_time_is_flagged_for_minimum_non_zero_time() {
        let mut cars = HashMap::new();
        let mut c1 = car("1", 1, "00:01:00.000", 5);
        c1.best_time = "00:00:45.000".to_string();
        let mut c2 = car("2", 2, "00:01:05.000", 5);
        c2.best_time = "00:00:40.000".to_string();
        cars.insert("1".to_string(), c1);
        cars.insert("2".to_string(), c2);

        let patches = enrich(&cars);
        let p2 = patches.iter().find(|p| p.number == "2").unwrap();
        assert_eq!(p2.is_best_time, Some(true));
    }

    #[test]
    fn class_positions_are_dense_within_class() {
        let mut cars = HashMap::new();
        cars.insert("1".to_string(), car("1", 1, "00:01:00.000", 5));
        cars.insert("2".to_string(), car("2", 2, "00:01:05.000", 5));
        cars.insert("3".to_string(), car("3", 3, "00:01:10.000", 5));

        let patches = enrich(&cars);
        let p3 = patches.iter().find(|p| p.number == "3").unwrap();
        assert_eq!(p3.class_position, Some(3));
    }

    use proptest::prelude::*;

    fn arb_cars(classes: &'static [&'static str]) -> impl Strategy<Value = HashMap<String, CarPosition>> {
        proptest::collection::vec((1u32..200, 0usize..classes.len()), 1..12).prop_map(move |entries| {
            let mut cars = HashMap::new();
            for (i, (overall_position, class_idx)) in entries.into_iter().enumerate() {
                let number = format!("car-{i}");
                let mut c = CarPosition::new(&number);
                c.overall_position = overall_position;
                c.class = classes[class_idx].to_string();
                c.track_flag = Flag::Green;
                cars.insert(number, c);
            }
            cars
        })
    }

    proptest! {
        // For any sequence of state-changes applied to an empty session,
        // class positions within each class end up dense (1..N, no
        // duplicates) after enrichment, regardless of the overall
        // ordering or how many classes are in play.
        #[test]
        fn class_positions_are_always_dense_within_class(cars in arb_cars(&["GT3", "GT4", "LMP2"])) {
            let patches = enrich(&cars);

            let mut after: HashMap<String, CarPosition> = cars.clone();
            for p in &patches {
                if let Some(pos) = p.class_position {
                    after.get_mut(&p.number).unwrap().class_position = pos;
                }
            }

            let mut by_class: HashMap<String, Vec<u32>> = HashMap::new();
            for car in after.values() {
                by_class.entry(car.class.clone()).or_default().push(car.class_position);
            }
            for positions in by_class.values_mut() {
                positions.sort_unstable();
                let expected: Vec<u32> = (1..=positions.len() as u32).collect();
                prop_assert_eq!(positions.clone(), expected);
            }
        }

        // For two sibling cars on the same lap sorted by overallPosition,
        // the trailing car's overallGap always parses back to the exact
        // (non-negative) millisecond difference between the two — the
        // saturating_sub in gap_and_diff must never wrap instead of clamp.
        #[test]
        fn sibling_gap_on_same_lap_is_non_negative(leader_ms in 1u64..7_200_000, trailing_ms in 1u64..7_200_000) {
            let mut cars = HashMap::new();
            cars.insert("1".to_string(), car("1", 1, &format_gap_millis(leader_ms), 10));
            cars.insert("2".to_string(), car("2", 2, &format_gap_millis(trailing_ms), 10));

            let patches = enrich(&cars);
            let trailing = patches.iter().find(|p| p.number == "2").unwrap();
            let gap_str = trailing.overall_gap.clone().unwrap();
            let parsed = parse_clock_to_millis(&gap_str);

            let expected = trailing_ms.saturating_sub(leader_ms);
            if expected == 0 {
                prop_assert_eq!(parsed, None);
            } else {
                prop_assert_eq!(parsed, Some(expected));
            }
        }

        // overallPositionsGained is exactly start minus current whenever
        // both are known, and the Invalid sentinel the moment either one
        // is the "not yet known" zero value.
        #[test]
        fn positions_gained_matches_start_minus_current_or_sentinel(
            start in 0u32..40, current in 0u32..40,
        ) {
            let mut cars = HashMap::new();
            let mut c = car("1", current, "1:00.000", 5);
            c.overall_starting_position = start;
            cars.insert("1".to_string(), c);

            let patches = enrich(&cars);
            let gained = patches[0].overall_positions_gained;

            if start == 0 || current == 0 {
                prop_assert_eq!(gained, Some(PositionsGained::Invalid));
            } else {
                prop_assert_eq!(gained, Some(PositionsGained::Value(start as i32 - current as i32)));
            }
        }
    }
}
