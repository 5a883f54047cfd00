//! The narrow external interfaces the pipeline depends on,
//! expressed as traits so the pipeline logic is testable against
//! in-memory doubles without a live Redis/SQLite.
//!
//! Generic functions are bounded by these traits rather than boxing
//! them as `dyn` objects — `main.rs` wires one concrete adapter per
//! trait, mirroring `AppState` holding concrete `SqlitePool` /
//! `broadcast::Sender` fields instead of trait objects.

use timing_contracts::hub::HubMessage;

use crate::model::SessionState;

#[derive(Debug, thiserror::Error)]
pub enum PortError {
    #[error("broker error: {0}")]
    Broker(String),
    #[error("store error: {0}")]
    Store(String),
    #[error("hub error: {0}")]
    Hub(String),
    #[error("control log error: {0}")]
    ControlLog(String),
    #[error("metadata error: {0}")]
    Metadata(String),
}

pub type PortResult<T> = Result<T, PortError>;

/// One field read off a broker stream, pre-ack.
#[derive(Debug, Clone)]
pub struct StreamField {
    pub id: String,
    pub name: String,
    pub value: Vec<u8>,
}

/// Redis-style append-only stream with consumer groups, plus pub/sub
/// and small string/hash caches.
pub trait Broker: Send + Sync + 'static {
    async fn ensure_group(&self, stream: &str, group: &str) -> PortResult<()>;

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        batch_size: usize,
    ) -> PortResult<Vec<StreamField>>;

    async fn ack(&self, stream: &str, group: &str, id: &str) -> PortResult<()>;

    async fn publish(&self, channel: &str, payload: &[u8]) -> PortResult<()>;

    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl_secs: u64) -> PortResult<()>;

    async fn get(&self, key: &str) -> PortResult<Option<Vec<u8>>>;

    async fn hset(&self, key: &str, field: &str, value: &[u8]) -> PortResult<()>;
}

/// `FlagLog`, `CarLapLog`, `SessionResult`, competitor metadata and loop
/// metadata reads/writes.
pub trait Store: Send + Sync + 'static {
    async fn load_session(&self, event_id: &str) -> PortResult<Option<SessionState>>;

    async fn save_flag_log(
        &self,
        event_id: &str,
        session_id: &str,
        durations: &[timing_contracts::patch::FlagDuration],
    ) -> PortResult<()>;

    async fn load_flag_log(
        &self,
        event_id: &str,
        session_id: &str,
    ) -> PortResult<Vec<timing_contracts::patch::FlagDuration>>;

    async fn append_car_lap_log(
        &self,
        event_id: &str,
        session_id: &str,
        car_number: &str,
        lap_number: u32,
        snapshot: &crate::model::CarPosition,
    ) -> PortResult<()>;

    async fn load_recent_laps(
        &self,
        event_id: &str,
        session_id: &str,
        max_lap: u32,
    ) -> PortResult<Vec<LapRecord>>;

    async fn save_session_result(&self, result: &SessionResult) -> PortResult<()>;

    async fn set_session_live(&self, event_id: &str, session_id: &str, is_live: bool) -> PortResult<()>;

    async fn load_loop_metadata(&self, event_id: &str) -> PortResult<Vec<LoopMetadata>>;

    async fn upsert_event_status_log(&self, row: &EventStatusLogRow) -> PortResult<()>;

    async fn upsert_car_last_lap(&self, row: &CarLastLapRow) -> PortResult<()>;

    async fn upsert_x2_passing(&self, row: &X2PassingRow) -> PortResult<()>;

    async fn replace_x2_loops(&self, event_id: &str, loops: &[X2LoopRow]) -> PortResult<()>;
}

#[derive(Debug, Clone)]
pub struct LapRecord {
    pub car_number: String,
    pub lap_number: u32,
    pub overall_position: u32,
    pub class: String,
    pub flag: timing_protocol::Flag,
}

#[derive(Debug, Clone)]
pub struct LoopMetadata {
    pub loop_id: String,
    pub name: String,
    pub loop_type: LoopType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopType {
    PitIn,
    PitExit,
    PitStartFinish,
    PitOther,
    Other,
}

#[derive(Debug, Clone)]
pub struct SessionResult {
    pub event_id: String,
    pub session_id: String,
    pub entry_count: usize,
    pub car_count: usize,
    pub flag_count: usize,
    pub state_json: String,
}

#[derive(Debug, Clone)]
pub struct EventStatusLogRow {
    pub event_type: String,
    pub event_id: String,
    pub session_id: String,
    pub data: Vec<u8>,
}

/// One X2 transponder passing — append-only, upserted on the natural
/// key so a replayed message is a no-op rather than a duplicate row.
#[derive(Debug, Clone)]
pub struct X2PassingRow {
    pub event_id: String,
    pub transponder_id: String,
    pub loop_id: String,
    pub passing_time: String,
    pub is_in_pit: bool,
}

/// One X2 loop's metadata, part of an atomic per-event replace.
#[derive(Debug, Clone)]
pub struct X2LoopRow {
    pub loop_id: String,
    pub loop_name: String,
    pub loop_type: LoopType,
    pub position: u32,
}

#[derive(Debug, Clone)]
pub struct CarLastLapRow {
    pub event_id: String,
    pub session_id: String,
    pub car_number: String,
    pub lap_number: u32,
    pub lap_time: String,
}

/// Fan-out to subscriber groups — `send_to_group` mirrors the client-side
/// hub methods; the concrete adapter fans a `tokio::broadcast`
/// channel out per group key.
pub trait Hub: Send + Sync + 'static {
    async fn send_to_group(&self, group: &str, message: HubMessage) -> PortResult<()>;
}

#[derive(Debug, Clone)]
pub struct ControlLogEntry {
    pub order_id: u64,
    pub car1: String,
    pub car2: Option<String>,
    pub highlighted_car: Option<String>,
    pub penalty_action: String,
    pub notes: String,
}

pub trait ControlLogSource: Send + Sync + 'static {
    async fn load(&self, parameter: &str) -> PortResult<Vec<ControlLogEntry>>;
}

pub trait MetadataSource: Send + Sync + 'static {
    async fn driver_for(&self, transponder_id: &str) -> PortResult<Option<String>>;
    async fn video_for(&self, event_id: &str, car_number: &str) -> PortResult<Option<VideoMetadata>>;
    async fn competitor_for(&self, car_number: &str) -> PortResult<Option<CompetitorMetadata>>;
}

#[derive(Debug, Clone)]
pub struct VideoMetadata {
    pub destinations: Vec<String>,
    pub flags: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct CompetitorMetadata {
    pub make: Option<String>,
    pub engine: Option<String>,
}
