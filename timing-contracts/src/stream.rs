//! Broker key, channel, and stream field-name grammar: every
//! name the core reads from or writes to the stream broker is built and
//! parsed in exactly one place so the `evt-st-<eventId>` / `<type>-<eventId>-<sessionId>`
//! conventions can't drift between the ingress, logger sink, and the
//! worker loops that publish into them.

/// `sessionId` sentinel meaning "not session-scoped" in a stream field
/// name.
pub const NOT_SESSION_SCOPED: &str = "999999";

/// The `<type>` token used in stream field names and dispatched on by
/// the ingress to pick a decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeedType {
    RMonitor,
    Multiloop,
    X2Pass,
    X2Loop,
    Flags,
    DriverEvent,
    DriverTransponder,
    Video,
    SessionChanged,
    ConfigurationChanged,
    Laps,
    RelayHeartbeat,
}

impl FeedType {
    pub fn as_str(self) -> &'static str {
        match self {
            FeedType::RMonitor => "rmonitor",
            FeedType::Multiloop => "multiloop",
            FeedType::X2Pass => "x2pass",
            FeedType::X2Loop => "x2loop",
            FeedType::Flags => "flags",
            FeedType::DriverEvent => "drevt",
            FeedType::DriverTransponder => "drtrans",
            FeedType::Video => "video",
            FeedType::SessionChanged => "evtsessionchanged",
            FeedType::ConfigurationChanged => "evtconfchanged",
            FeedType::Laps => "laps",
            FeedType::RelayHeartbeat => "relayhb",
        }
    }

    pub fn from_str(raw: &str) -> Option<FeedType> {
        Some(match raw {
            "rmonitor" => FeedType::RMonitor,
            "multiloop" => FeedType::Multiloop,
            "x2pass" => FeedType::X2Pass,
            "x2loop" => FeedType::X2Loop,
            "flags" => FeedType::Flags,
            "drevt" => FeedType::DriverEvent,
            "drtrans" => FeedType::DriverTransponder,
            "video" => FeedType::Video,
            "evtsessionchanged" => FeedType::SessionChanged,
            "evtconfchanged" => FeedType::ConfigurationChanged,
            "laps" => FeedType::Laps,
            "relayhb" => FeedType::RelayHeartbeat,
            _ => return None,
        })
    }
}

/// A parsed stream field name: `<type>-<eventId>-<sessionId>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFieldKey {
    pub feed_type: String,
    pub event_id: String,
    pub session_id: String,
}

impl StreamFieldKey {
    pub fn is_session_scoped(&self) -> bool {
        self.session_id != NOT_SESSION_SCOPED
    }
}

/// Parses a stream field name of the form `<type>-<eventId>-<sessionId>`.
/// Returns `None` when the name has fewer than three `-`-separated
/// tokens, per spec: malformed field names are logged and skipped by
/// the ingress rather than causing a parse error to propagate.
pub fn parse_field_name(name: &str) -> Option<StreamFieldKey> {
    let mut parts = name.splitn(3, '-');
    let feed_type = parts.next()?.to_string();
    let event_id = parts.next()?.to_string();
    let session_id = parts.next()?.to_string();
    if feed_type.is_empty() || event_id.is_empty() || session_id.is_empty() {
        return None;
    }
    Some(StreamFieldKey {
        feed_type,
        event_id,
        session_id,
    })
}

pub fn build_field_name(feed_type: FeedType, event_id: &str, session_id: &str) -> String {
    format!("{}-{}-{}", feed_type.as_str(), event_id, session_id)
}

/// The event's append-only input stream.
pub fn event_input_stream_key(event_id: &str) -> String {
    format!("evt-st-{event_id}")
}

/// The structured lap-log stream a session's pipeline writes to and the
/// logger sink consumes.
pub fn proc_log_stream_key(event_id: &str) -> String {
    format!("evt-proc-log-{event_id}")
}

/// Durable consumer-group name for the event's input stream.
pub fn event_consumer_group(event_id: &str) -> String {
    format!("{{evt-st-{event_id}}}")
}

pub const LOG_CONSUMER_GROUP: &str = "log";
pub const LOGGER_CONSUMER_GROUP: &str = "logger";

pub const EVENT_STATUS_CHANNEL_PREFIX: &str = "event-status";
pub const EVENT_CONFIGURATION_CHANGED_CHANNEL: &str = "event-configuration-changed";
pub const FULLSTATUS_CHANNEL: &str = "fullstatus";
pub const EVENT_SHUTDOWN_SIGNAL_CHANNEL: &str = "evt-shutdown-signal";

/// Hub subscriber group for session/car patches.
pub fn event_subscriber_group(event_id: &str) -> String {
    format!("evt{event_id}-sub")
}

/// Legacy full-payload compatibility group, keyed by event id alone.
pub fn legacy_event_group(event_id: &str) -> String {
    event_id.to_string()
}

/// In-car driver mode group for one car.
pub fn in_car_group(event_id: &str, car_number: &str) -> String {
    format!("in-car-evt-{event_id}-car-{car_number}")
}

pub fn legacy_payload_cache_key(event_id: &str) -> String {
    format!("evt-{event_id}-payload")
}

pub fn in_car_cache_key(event_id: &str, car_number: &str) -> String {
    format!("in-car-data-{event_id}-{car_number}")
}

pub fn driver_event_cache_key(event_id: &str, car_number: &str) -> String {
    format!("drevt{event_id}-car{car_number}")
}

pub fn driver_transponder_cache_key(transponder_id: &str) -> String {
    format!("drtrans{transponder_id}")
}

pub fn video_cache_key(event_id: &str, car_number: &str, transponder_id: &str) -> String {
    format!("videoevt{event_id}-car{car_number}-trans{transponder_id}")
}

pub const RELAY_CONNECTIONS_HASH_KEY: &str = "relay-evt-conns";
