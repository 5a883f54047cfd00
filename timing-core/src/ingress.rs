//! Stream Ingress: reads one event's broker stream under a
//! durable consumer group, dispatches each field as a `TimingMessage`,
//! and acknowledges. Reconnects re-ensure group/stream existence and
//! back off exponentially on transient broker errors.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::{info, warn};

use crate::ports::{Broker, StreamField};
use timing_parser::{TimingMessage, TimingMessageType};

const INITIAL_BACKOFF: Duration = Duration::from_secs(10);
const MAX_BACKOFF: Duration = Duration::from_secs(60);
const BACKOFF_FACTOR: u32 = 2;

fn consumer_group(event_id: &str) -> String {
    format!("evt-st-{event_id}")
}

/// Default consumer name, `{hostname}-{pid}`; `--consumer-name`
/// overrides this in `main.rs`.
pub fn default_consumer_name() -> String {
    let hostname = hostname_best_effort();
    format!("{hostname}-{}", std::process::id())
}

fn hostname_best_effort() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown-host".to_string())
}

fn message_type_from_token(token: &str) -> Option<TimingMessageType> {
    Some(match token {
        "rmonitor" => TimingMessageType::RMonitor,
        "multiloop" => TimingMessageType::Multiloop,
        "x2pass" => TimingMessageType::X2Pass,
        "x2loop" => TimingMessageType::X2Loop,
        "flags" => TimingMessageType::Flags,
        "evtsessionchanged" => TimingMessageType::EvtSessionChanged,
        "evtconfchanged" => TimingMessageType::EvtConfChanged,
        "drevt" => TimingMessageType::DrEvt,
        "drtrans" => TimingMessageType::DrTrans,
        "video" => TimingMessageType::Video,
        "relayhb" => TimingMessageType::RelayHb,
        _ => return None,
    })
}

/// Parses `field.name` (`type-eventId-sessionId`) into a
/// [`TimingMessage`], tagging it with a process-local monotonic
/// sequence number. Returns `None` for a malformed name (fewer than
/// three `-`-separated tokens, or an unrecognized type token) — the
/// caller should log and skip rather than fail the whole batch.
pub fn parse_field(field: &StreamField, seq: &AtomicU64) -> Option<TimingMessage> {
    let tokens: Vec<&str> = field.name.split('-').collect();
    if tokens.len() < 3 {
        return None;
    }
    let message_type = message_type_from_token(tokens[0])?;
    Some(TimingMessage {
        message_type,
        data: field.value.clone(),
        event_id: tokens[1].to_string(),
        session_id: tokens[2].to_string(),
        received_seq: seq.fetch_add(1, Ordering::Relaxed),
    })
}

/// Ensures the consumer group exists, idempotent across reconnects.
pub async fn ensure_group<B: Broker>(broker: &B, event_id: &str) -> Result<(), crate::ports::PortError> {
    broker.ensure_group(event_id, &consumer_group(event_id)).await
}

/// Reads one batch, dispatching each field through `handle` and
/// acknowledging it, skipping (but logging) fields with a malformed
/// name. Returns the number of fields read.
pub async fn read_and_dispatch_batch<B: Broker>(
    broker: &B,
    event_id: &str,
    consumer_name: &str,
    batch_size: usize,
    seq: &AtomicU64,
    mut handle: impl FnMut(TimingMessage, &StreamField),
) -> Result<usize, crate::ports::PortError> {
    let group = consumer_group(event_id);
    let fields = broker.read_group(event_id, &group, consumer_name, batch_size).await?;
    let count = fields.len();

    for field in &fields {
        match parse_field(field, seq) {
            Some(message) => handle(message, field),
            None => warn!(field = %field.name, "malformed or unrecognized field name, skipping"),
        }
        broker.ack(event_id, &group, &field.id).await?;
    }

    Ok(count)
}

/// Runs the ingress loop until `cancellation` fires: ensure group, read
/// and dispatch in a loop, backing off exponentially on broker errors
/// and resetting the backoff after a successful read.
pub async fn run<B: Broker>(
    broker: &B,
    event_id: &str,
    consumer_name: &str,
    batch_size: usize,
    cancellation: &tokio_util::sync::CancellationToken,
    mut handle: impl FnMut(TimingMessage, &StreamField),
) {
    let mut backoff = INITIAL_BACKOFF;
    let seq = AtomicU64::new(0);

    loop {
        if cancellation.is_cancelled() {
            return;
        }

        if let Err(e) = ensure_group(broker, event_id).await {
            warn!(error = %e, event_id = %event_id, backoff_secs = backoff.as_secs(), "failed to ensure consumer group, backing off");
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = cancellation.cancelled() => return,
            }
            backoff = (backoff * BACKOFF_FACTOR).min(MAX_BACKOFF);
            continue;
        }

        match read_and_dispatch_batch(broker, event_id, consumer_name, batch_size, &seq, &mut handle).await {
            Ok(_) => {
                if backoff != INITIAL_BACKOFF {
                    info!(event_id = %event_id, "broker recovered, resetting backoff");
                }
                backoff = INITIAL_BACKOFF;
            }
            Err(e) => {
                warn!(error = %e, event_id = %event_id, backoff_secs = backoff.as_secs(), "broker read failed, backing off");
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = cancellation.cancelled() => return,
                }
                backoff = (backoff * BACKOFF_FACTOR).min(MAX_BACKOFF);
            }
        }
    }
}
