//! Logger Sink: a consumer-group reader writing every
//! field off the stream to `EventStatusLog`, with special handling for
//! `x2pass`/`x2loop` passing/loop data and a separate structured
//! lap-batch stream feeding `CarLapLog`/`CarLastLap`.

use timing_protocol::time::parse_clock_to_millis;
use tracing::warn;

use crate::ports::{
    CarLastLapRow, EventStatusLogRow, LoopType, PortResult, Store, StreamField, X2LoopRow,
    X2PassingRow,
};

/// A decoded lap batch record off the `evt-proc-log-<eventId>` stream.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct LapBatchEntry {
    pub car_number: String,
    pub lap_number: u32,
    pub lap_time: String,
}

/// One transponder passing carried on an `x2pass` field.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct X2PassEntry {
    transponder_id: String,
    loop_id: String,
    passing_time: String,
    #[serde(default)]
    is_in_pit: bool,
}

/// One loop's metadata carried on an `x2loop` field — the whole set
/// replaces the event's prior loop configuration atomically.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct X2LoopEntry {
    loop_id: String,
    loop_name: String,
    loop_type: String,
    position: u32,
}

fn parse_loop_type(s: &str) -> LoopType {
    match s {
        "pit_in" => LoopType::PitIn,
        "pit_exit" => LoopType::PitExit,
        "pit_sf" => LoopType::PitStartFinish,
        "pit_other" => LoopType::PitOther,
        _ => LoopType::Other,
    }
}

/// Writes one `EventStatusLog` row for every field on the main log
/// stream. `x2pass` additionally upserts a passing row; `x2loop`
/// additionally replaces the event's loop metadata atomically.
pub async fn log_field<S: Store>(
    store: &S,
    event_id: &str,
    session_id: &str,
    field: &StreamField,
) -> PortResult<()> {
    let row = EventStatusLogRow {
        event_type: field.name.clone(),
        event_id: event_id.to_string(),
        session_id: session_id.to_string(),
        data: field.value.clone(),
    };
    store.upsert_event_status_log(&row).await?;

    if field.name.starts_with("x2pass") {
        match serde_json::from_slice::<X2PassEntry>(&field.value) {
            Ok(entry) => {
                store
                    .upsert_x2_passing(&X2PassingRow {
                        event_id: event_id.to_string(),
                        transponder_id: entry.transponder_id,
                        loop_id: entry.loop_id,
                        passing_time: entry.passing_time,
                        is_in_pit: entry.is_in_pit,
                    })
                    .await?;
            }
            Err(e) => warn!(error = %e, "malformed x2pass payload, skipping"),
        }
    } else if field.name.starts_with("x2loop") {
        match serde_json::from_slice::<Vec<X2LoopEntry>>(&field.value) {
            Ok(entries) => {
                let rows: Vec<X2LoopRow> = entries
                    .into_iter()
                    .map(|e| X2LoopRow {
                        loop_id: e.loop_id,
                        loop_name: e.loop_name,
                        loop_type: parse_loop_type(&e.loop_type),
                        position: e.position,
                    })
                    .collect();
                store.replace_x2_loops(event_id, &rows).await?;
            }
            Err(e) => warn!(error = %e, "malformed x2loop payload, skipping"),
        }
    }

    Ok(())
}

/// Processes one structured lap-batch field, writing a `CarLastLap`
/// upsert per entry. Malformed entries are skipped with a warning
/// rather than failing the whole batch.
pub async fn process_lap_batch<S: Store>(
    store: &S,
    event_id: &str,
    session_id: &str,
    payload: &[u8],
) -> PortResult<()> {
    let entries: Vec<LapBatchEntry> = match serde_json::from_slice(payload) {
        Ok(e) => e,
        Err(e) => {
            warn!(error = %e, "malformed lap batch payload, skipping");
            return Ok(());
        }
    };

    for entry in entries {
        if parse_clock_to_millis(&entry.lap_time).is_none() && !entry.lap_time.is_empty() {
            warn!(car = %entry.car_number, lap_time = %entry.lap_time, "unparseable lap time in batch, storing verbatim");
        }
        let row = CarLastLapRow {
            event_id: event_id.to_string(),
            session_id: session_id.to_string(),
            car_number: entry.car_number,
            lap_number: entry.lap_number,
            lap_time: entry.lap_time,
        };
        store.upsert_car_last_lap(&row).await?;
    }

    Ok(())
}
