//! SQLite-backed `Store`: `FlagLog`, `CarLapLog`, `SessionResult`,
//! loop metadata and the per-car status tables.
//!
//! Grounded on `db::mod::create_pool`/`run_migrations` (pool
//! construction, WAL pragma, `include_str!`-embedded migrations) and
//! `db::queries::decoder_live` (`sqlx::FromRow` row structs, plain
//! `sqlx::query`/`query_as` calls, no query builder).

use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::info;

use crate::model::{CarPosition, SessionState};
use crate::ports::{
    CarLastLapRow, EventStatusLogRow, LapRecord, LoopMetadata, LoopType, PortError, PortResult,
    SessionResult, Store, X2LoopRow, X2PassingRow,
};
use timing_contracts::patch::FlagDuration;
use timing_protocol::Flag;

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(db_path: &str) -> anyhow::Result<Self> {
        let url = format!("sqlite:{db_path}?mode=rwc");
        let pool = SqlitePoolOptions::new().max_connections(5).connect(&url).await?;
        info!(path = %db_path, "connected to timing database");
        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> anyhow::Result<()> {
        sqlx::query("PRAGMA journal_mode=WAL").execute(&self.pool).await?;
        sqlx::query("PRAGMA foreign_keys=ON").execute(&self.pool).await?;

        let migrations = [
            include_str!("../../migrations/001_initial_schema.sql"),
            include_str!("../../migrations/002_flag_and_lap_logs.sql"),
            include_str!("../../migrations/003_loops_and_passings.sql"),
        ];

        for migration_sql in &migrations {
            for statement in migration_sql.split(';') {
                let stmt = statement.trim();
                if !stmt.is_empty() {
                    sqlx::query(stmt).execute(&self.pool).await?;
                }
            }
        }

        info!("timing database migrations applied");
        Ok(())
    }
}

fn loop_type_to_str(t: LoopType) -> &'static str {
    match t {
        LoopType::PitIn => "pit_in",
        LoopType::PitExit => "pit_exit",
        LoopType::PitStartFinish => "pit_sf",
        LoopType::PitOther => "pit_other",
        LoopType::Other => "other",
    }
}

fn loop_type_from_str(s: &str) -> LoopType {
    match s {
        "pit_in" => LoopType::PitIn,
        "pit_exit" => LoopType::PitExit,
        "pit_sf" => LoopType::PitStartFinish,
        "pit_other" => LoopType::PitOther,
        _ => LoopType::Other,
    }
}

fn flag_to_str(flag: Flag) -> &'static str {
    match flag {
        Flag::Unknown => "unknown",
        Flag::Green => "green",
        Flag::Yellow => "yellow",
        Flag::Red => "red",
        Flag::White => "white",
        Flag::Checkered => "checkered",
        Flag::Purple35 => "purple35",
    }
}

fn flag_from_str(s: &str) -> Flag {
    match s {
        "green" => Flag::Green,
        "yellow" => Flag::Yellow,
        "red" => Flag::Red,
        "white" => Flag::White,
        "checkered" => Flag::Checkered,
        "purple35" => Flag::Purple35,
        _ => Flag::Unknown,
    }
}

impl Store for SqliteStore {
    async fn load_session(&self, _event_id: &str) -> PortResult<Option<SessionState>> {
        // Session state is rebuilt in-process from the live stream on
        // startup rather than round-tripped through SQLite; persistence
        // here exists for the durable logs below, not full snapshots.
        Ok(None)
    }

    async fn save_flag_log(&self, event_id: &str, session_id: &str, durations: &[FlagDuration]) -> PortResult<()> {
        let mut tx = self.pool.begin().await.map_err(|e| PortError::Store(e.to_string()))?;
        sqlx::query("DELETE FROM flag_log WHERE event_id = ? AND session_id = ?")
            .bind(event_id)
            .bind(session_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| PortError::Store(e.to_string()))?;

        for d in durations {
            sqlx::query(
                "INSERT INTO flag_log (event_id, session_id, flag, start_time, end_time) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(event_id)
            .bind(session_id)
            .bind(flag_to_str(d.flag))
            .bind(&d.start_time)
            .bind(&d.end_time)
            .execute(&mut *tx)
            .await
            .map_err(|e| PortError::Store(e.to_string()))?;
        }

        tx.commit().await.map_err(|e| PortError::Store(e.to_string()))
    }

    async fn load_flag_log(&self, event_id: &str, session_id: &str) -> PortResult<Vec<FlagDuration>> {
        let rows = sqlx::query("SELECT flag, start_time, end_time FROM flag_log WHERE event_id = ? AND session_id = ? ORDER BY start_time ASC")
            .bind(event_id)
            .bind(session_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| PortError::Store(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|row| FlagDuration {
                flag: flag_from_str(row.get::<String, _>("flag").as_str()),
                start_time: row.get("start_time"),
                end_time: row.get("end_time"),
            })
            .collect())
    }

    async fn append_car_lap_log(
        &self,
        event_id: &str,
        session_id: &str,
        car_number: &str,
        lap_number: u32,
        snapshot: &CarPosition,
    ) -> PortResult<()> {
        let snapshot_json = serde_json::to_string(snapshot).map_err(|e| PortError::Store(e.to_string()))?;
        sqlx::query(
            "INSERT INTO car_lap_log (event_id, session_id, car_number, lap_number, class, overall_position, flag, snapshot) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(event_id)
        .bind(session_id)
        .bind(car_number)
        .bind(lap_number as i64)
        .bind(&snapshot.class)
        .bind(snapshot.overall_position as i64)
        .bind(flag_to_str(snapshot.track_flag))
        .bind(snapshot_json)
        .execute(&self.pool)
        .await
        .map_err(|e| PortError::Store(e.to_string()))?;
        Ok(())
    }

    async fn load_recent_laps(&self, event_id: &str, session_id: &str, max_lap: u32) -> PortResult<Vec<LapRecord>> {
        let rows = sqlx::query(
            "SELECT car_number, lap_number, overall_position, class, flag FROM car_lap_log \
             WHERE event_id = ? AND session_id = ? AND lap_number <= ? ORDER BY lap_number ASC",
        )
        .bind(event_id)
        .bind(session_id)
        .bind(max_lap as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| PortError::Store(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|row| LapRecord {
                car_number: row.get("car_number"),
                lap_number: row.get::<i64, _>("lap_number") as u32,
                overall_position: row.get::<i64, _>("overall_position") as u32,
                class: row.get("class"),
                flag: flag_from_str(row.get::<String, _>("flag").as_str()),
            })
            .collect())
    }

    async fn save_session_result(&self, result: &SessionResult) -> PortResult<()> {
        let existing = sqlx::query(
            "SELECT entry_count, car_count, flag_count FROM session_results WHERE event_id = ? AND session_id = ?",
        )
        .bind(&result.event_id)
        .bind(&result.session_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| PortError::Store(e.to_string()))?;

        // Strictly-more-complete rule: never overwrite a result with
        // fewer entries, cars, or flags than the one already stored.
        if let Some(row) = &existing {
            let prev_entries: i64 = row.get("entry_count");
            let prev_cars: i64 = row.get("car_count");
            let prev_flags: i64 = row.get("flag_count");
            if result.entry_count as i64 <= prev_entries
                && result.car_count as i64 <= prev_cars
                && result.flag_count as i64 <= prev_flags
            {
                return Ok(());
            }
        }

        sqlx::query(
            "INSERT INTO session_results (event_id, session_id, entry_count, car_count, flag_count, state_json) \
             VALUES (?, ?, ?, ?, ?, ?) \
             ON CONFLICT(event_id, session_id) DO UPDATE SET \
               entry_count = excluded.entry_count, \
               car_count = excluded.car_count, \
               flag_count = excluded.flag_count, \
               state_json = excluded.state_json",
        )
        .bind(&result.event_id)
        .bind(&result.session_id)
        .bind(result.entry_count as i64)
        .bind(result.car_count as i64)
        .bind(result.flag_count as i64)
        .bind(&result.state_json)
        .execute(&self.pool)
        .await
        .map_err(|e| PortError::Store(e.to_string()))?;
        Ok(())
    }

    async fn set_session_live(&self, event_id: &str, session_id: &str, is_live: bool) -> PortResult<()> {
        sqlx::query(
            "INSERT INTO session_status (event_id, session_id, is_live, ended_at) VALUES (?, ?, ?, CURRENT_TIMESTAMP) \
             ON CONFLICT(event_id, session_id) DO UPDATE SET is_live = excluded.is_live, ended_at = excluded.ended_at",
        )
        .bind(event_id)
        .bind(session_id)
        .bind(is_live)
        .execute(&self.pool)
        .await
        .map_err(|e| PortError::Store(e.to_string()))?;
        Ok(())
    }

    async fn load_loop_metadata(&self, event_id: &str) -> PortResult<Vec<LoopMetadata>> {
        let rows = sqlx::query("SELECT loop_id, loop_name, loop_type FROM x2_loops WHERE event_id = ? ORDER BY position ASC")
            .bind(event_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| PortError::Store(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|row| LoopMetadata {
                loop_id: row.get("loop_id"),
                name: row.get("loop_name"),
                loop_type: loop_type_from_str(row.get::<String, _>("loop_type").as_str()),
            })
            .collect())
    }

    async fn upsert_event_status_log(&self, row: &EventStatusLogRow) -> PortResult<()> {
        sqlx::query(
            "INSERT INTO event_status_log (event_type, event_id, session_id, data, timestamp) \
             VALUES (?, ?, ?, ?, CURRENT_TIMESTAMP)",
        )
        .bind(&row.event_type)
        .bind(&row.event_id)
        .bind(&row.session_id)
        .bind(&row.data)
        .execute(&self.pool)
        .await
        .map_err(|e| PortError::Store(e.to_string()))?;
        Ok(())
    }

    async fn upsert_car_last_lap(&self, row: &CarLastLapRow) -> PortResult<()> {
        sqlx::query(
            "INSERT INTO car_last_lap (event_id, session_id, car_number, lap_number, lap_time, timestamp) \
             VALUES (?, ?, ?, ?, ?, CURRENT_TIMESTAMP) \
             ON CONFLICT(event_id, session_id, car_number) DO UPDATE SET \
               lap_number = excluded.lap_number, lap_time = excluded.lap_time, timestamp = excluded.timestamp",
        )
        .bind(&row.event_id)
        .bind(&row.session_id)
        .bind(&row.car_number)
        .bind(row.lap_number as i64)
        .bind(&row.lap_time)
        .execute(&self.pool)
        .await
        .map_err(|e| PortError::Store(e.to_string()))?;
        Ok(())
    }

    async fn upsert_x2_passing(&self, row: &X2PassingRow) -> PortResult<()> {
        sqlx::query(
            "INSERT INTO x2_passings (event_id, transponder_id, loop_id, passing_time, is_in_pit) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(event_id, transponder_id, loop_id, passing_time) DO UPDATE SET \
               is_in_pit = excluded.is_in_pit",
        )
        .bind(&row.event_id)
        .bind(&row.transponder_id)
        .bind(&row.loop_id)
        .bind(&row.passing_time)
        .bind(row.is_in_pit)
        .execute(&self.pool)
        .await
        .map_err(|e| PortError::Store(e.to_string()))?;
        Ok(())
    }

    async fn replace_x2_loops(&self, event_id: &str, loops: &[X2LoopRow]) -> PortResult<()> {
        let mut tx = self.pool.begin().await.map_err(|e| PortError::Store(e.to_string()))?;
        sqlx::query("DELETE FROM x2_loops WHERE event_id = ?")
            .bind(event_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| PortError::Store(e.to_string()))?;

        for l in loops {
            sqlx::query(
                "INSERT INTO x2_loops (event_id, loop_id, loop_name, loop_type, position) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(event_id)
            .bind(&l.loop_id)
            .bind(&l.loop_name)
            .bind(loop_type_to_str(l.loop_type))
            .bind(l.position as i64)
            .execute(&mut *tx)
            .await
            .map_err(|e| PortError::Store(e.to_string()))?;
        }

        tx.commit().await.map_err(|e| PortError::Store(e.to_string()))
    }
}
