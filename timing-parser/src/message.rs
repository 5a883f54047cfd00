//! The `TimingMessage` envelope the ingress dispatches to a decoder:
//! `{ type, data, eventId, sessionId }`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimingMessageType {
    RMonitor,
    Multiloop,
    X2Pass,
    X2Loop,
    Flags,
    EvtSessionChanged,
    EvtConfChanged,
    DrEvt,
    DrTrans,
    Video,
    RelayHb,
}

/// An immutable, ordered unit of work consumed by the pipeline. One
/// `TimingMessage` is produced per stream field read by the ingress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingMessage {
    pub message_type: TimingMessageType,
    pub data: Vec<u8>,
    pub event_id: String,
    pub session_id: String,
    /// Monotonic per-process sequence number assigned by the ingress,
    /// used only to assert ordering in tests — not part of the wire
    /// contract with the broker.
    pub received_seq: u64,
}

impl TimingMessage {
    pub fn data_as_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.data)
    }
}
