//! Client-side hub payloads: the shapes pushed out over the fan-out hub
//! to subscribed clients. Each variant corresponds to one of the hub's
//! client-side methods.

use serde::{Deserialize, Serialize};

use crate::patch::{CarPositionPatch, EventEntry, PenaltyCounts, SessionStatePatch};

/// One batch emitted by the Update Consolidator and delivered by the
/// Status Aggregator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchBatch {
    pub session: SessionStatePatch,
    pub cars: Vec<CarPositionPatch>,
}

/// The four-car quad pushed to one driver's in-car group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InCarUpdateV2 {
    pub car_number: String,
    pub car_ahead: Option<InCarCar>,
    pub car_ahead_out_of_class: Option<InCarCar>,
    pub drivers_car: Option<InCarCar>,
    pub car_behind: Option<InCarCar>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InCarCar {
    pub number: String,
    pub driver_name: String,
    pub team: String,
    pub make: Option<String>,
    pub engine: Option<String>,
    pub class_position: u32,
    pub overall_position: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InCarVideoMetadata {
    pub car_number: String,
    pub destinations: Vec<String>,
    pub flags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlLogEntryView {
    pub order_id: u64,
    pub car1: Option<String>,
    pub car2: Option<String>,
    pub highlighted_car: Option<String>,
    pub penalty_action: String,
    pub notes: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlLogUpdate {
    pub car_number: String,
    pub entries: Vec<ControlLogEntryView>,
    pub penalties: PenaltyCounts,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompetitorMetadataUpdate {
    pub car_number: String,
    pub make: Option<String>,
    pub engine: Option<String>,
}

/// Legacy full-payload compatibility shape: only updated car positions,
/// no full roster. Sent to the legacy, non-group-scoped channel in
/// addition to the normal patch batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegacyPayload {
    pub event_id: String,
    pub car_position_updates: Vec<CarPositionPatch>,
}

/// All shapes this core ever pushes to a hub subscriber, tagged so a
/// client can dispatch on `kind` without needing distinct topics.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HubMessage {
    SessionPatch(SessionStatePatch),
    CarPatches(Vec<CarPositionPatch>),
    InCarUpdateV2(InCarUpdateV2),
    InCarVideoMetadata(InCarVideoMetadata),
    ControlLog(ControlLogUpdate),
    CompetitorMetadata(CompetitorMetadataUpdate),
    Reset { event_id: String },
    /// Legacy, pre-patch full-payload compatibility path.
    ReceiveMessage(LegacyPayload),
}
