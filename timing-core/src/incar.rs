//! In-Car Driver Mode: per car, tracks the competitors
//! immediately around it on track and fans out a dirty-checked payload
//! to that car's dedicated hub group.

use std::collections::HashMap;

use timing_contracts::hub::{HubMessage, InCarCar, InCarUpdateV2};
use tracing::warn;

use crate::model::{CarPosition, EventEntry};
use crate::ports::{Hub, MetadataSource};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
struct CarSet {
    car_ahead: Option<String>,
    car_ahead_out_of_class: Option<String>,
    car_behind: Option<String>,
}

fn group_key(event_id: &str, car_number: &str) -> String {
    format!("in-car-evt-{event_id}-car-{car_number}")
}

fn team_for<'a>(entries: &'a [EventEntry], car_number: &str) -> &'a str {
    entries
        .iter()
        .find(|e| e.number == car_number)
        .map(|e| e.team.as_str())
        .unwrap_or("")
}

fn to_in_car_car(car: &CarPosition, team: &str, make: Option<String>, engine: Option<String>) -> InCarCar {
    InCarCar {
        number: car.number.clone(),
        driver_name: car.driver_name.clone(),
        team: team.to_string(),
        make,
        engine,
        class_position: car.class_position,
        overall_position: car.overall_position,
    }
}

/// Per-session in-car state: one `CarSet` per driver's car, plus
/// whatever flag value was current on the last tick (a change here also
/// dirties every car even if its own neighbours didn't move).
#[derive(Default)]
pub struct InCarProcessor {
    sets: HashMap<String, CarSet>,
    last_flag: Option<timing_protocol::Flag>,
}

impl InCarProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recomputes every car's `CarSet` from the current field, publishes
    /// a payload for every car whose set changed (or if the global flag
    /// changed, for all cars), and fetches competitor metadata from
    /// `metadata` for cars referenced in a dirty payload.
    pub async fn tick<H: Hub, M: MetadataSource>(
        &mut self,
        event_id: &str,
        cars: &HashMap<String, CarPosition>,
        event_entries: &[EventEntry],
        current_flag: timing_protocol::Flag,
        hub: &H,
        metadata: &M,
    ) {
        let flag_changed = self.last_flag != Some(current_flag);
        self.last_flag = Some(current_flag);

        for (number, car) in cars.iter() {
            let new_set = compute_car_set(car, cars);
            let dirty = flag_changed || self.sets.get(number) != Some(&new_set);
            self.sets.insert(number.clone(), new_set.clone());

            if !dirty {
                continue;
            }

            let drivers_car = Some(self.enrich(car, event_entries, metadata).await);
            let car_ahead = self.lookup(&new_set.car_ahead, cars, event_entries, metadata).await;
            let car_ahead_out_of_class =
                self.lookup(&new_set.car_ahead_out_of_class, cars, event_entries, metadata).await;
            let car_behind = self.lookup(&new_set.car_behind, cars, event_entries, metadata).await;

            let update = InCarUpdateV2 {
                car_number: number.clone(),
                car_ahead,
                car_ahead_out_of_class,
                drivers_car,
                car_behind,
            };

            let message = HubMessage::InCarUpdateV2(update);
            if let Err(e) = hub.send_to_group(&group_key(event_id, number), message).await {
                warn!(error = %e, car = %number, "failed to publish in-car payload");
            }
        }
    }

    async fn lookup<M: MetadataSource>(
        &self,
        number: &Option<String>,
        cars: &HashMap<String, CarPosition>,
        event_entries: &[EventEntry],
        metadata: &M,
    ) -> Option<InCarCar> {
        let number = number.as_ref()?;
        let car = cars.get(number)?;
        Some(self.enrich(car, event_entries, metadata).await)
    }

    async fn enrich<M: MetadataSource>(
        &self,
        car: &CarPosition,
        event_entries: &[EventEntry],
        metadata: &M,
    ) -> InCarCar {
        let team = team_for(event_entries, &car.number);
        match metadata.competitor_for(&car.number).await {
            Ok(Some(competitor)) => to_in_car_car(car, team, competitor.make, competitor.engine),
            Ok(None) => to_in_car_car(car, team, None, None),
            Err(e) => {
                warn!(error = %e, car = %car.number, "failed to enrich in-car payload with competitor metadata");
                to_in_car_car(car, team, None, None)
            }
        }
    }
}

fn compute_car_set(car: &CarPosition, cars: &HashMap<String, CarPosition>) -> CarSet {
    let car_ahead = (car.class_position > 0)
        .then(|| {
            cars.values()
                .find(|c| c.class == car.class && c.class_position == car.class_position - 1)
                .map(|c| c.number.clone())
        })
        .flatten();

    let car_behind = cars
        .values()
        .find(|c| c.class == car.class && c.class_position == car.class_position + 1)
        .map(|c| c.number.clone());

    let car_ahead_out_of_class = (car.overall_position > 0)
        .then(|| {
            cars.values()
                .find(|c| c.class != car.class && c.overall_position == car.overall_position - 1)
                .map(|c| c.number.clone())
        })
        .flatten();

    CarSet { car_ahead, car_ahead_out_of_class, car_behind }
}
