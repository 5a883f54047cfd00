//! Process entrypoint: wires the concrete `Broker`/`Store`/`Hub` adapters
//! to one event/session's pipeline and drives the ingress relay plus
//! every background loop.
//!
//! The ingress loop's `handle` callback is synchronous (it runs inside
//! a plain `FnMut`), so it only relays onto an unbounded channel; all
//! actual decoding and state mutation happens in the processing task
//! below, mirroring the decoder-TCP-to-mpsc relay plus a separate
//! mpsc-to-engine task pattern from `p3-server`'s `main`.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::{mpsc, Notify};
use tracing::{info, warn};

use timing_contracts::hub::HubMessage;
use timing_contracts::patch::{CarPositionPatch, FlagDuration};
use timing_core::adapters::{BroadcastHub, RedisBroker, SqliteStore};
use timing_core::aggregator;
use timing_core::consolidator::Consolidator;
use timing_core::context::SessionContext;
use timing_core::controllog::ControlLogProcessor;
use timing_core::decode::{self, Effect};
use timing_core::external::ExternalEnricher;
use timing_core::flags;
use timing_core::incar::InCarProcessor;
use timing_core::ingress;
use timing_core::laps::LapProcessor;
use timing_core::logger;
use timing_core::monitor::SessionMonitor;
use timing_core::pitloop::{Passing, PitLoopProcessor};
use timing_core::ports::{
    Broker, CompetitorMetadata, ControlLogEntry, ControlLogSource, Hub, MetadataSource, PortResult,
    Store, StreamField, VideoMetadata,
};
use timing_core::startpos;
use timing_core::position;
use timing_parser::multiloop::decode_record;
use timing_parser::rmonitor::RMonitorDecoder;
use timing_parser::{TimingMessage, TimingMessageType};

const MONITOR_TICK: Duration = Duration::from_secs(1);
const STARTPOS_POLL: Duration = Duration::from_secs(15);
const CONTROL_LOG_POLL: Duration = Duration::from_secs(10);
const EXTERNAL_ENRICH_TICK: Duration = Duration::from_secs(5);
const INCAR_TICK: Duration = Duration::from_secs(1);
const FLUSH_TICK: Duration = Duration::from_millis(20);

fn sub_group(event_id: &str) -> String {
    format!("evt{event_id}-sub")
}

fn in_car_group(event_id: &str, car_number: &str) -> String {
    format!("in-car-evt-{event_id}-car-{car_number}")
}

fn lap_batch_stream(event_id: &str) -> String {
    format!("evt-proc-log-{event_id}")
}

fn lap_batch_group(event_id: &str) -> String {
    format!("evt-proc-log-st-{event_id}")
}

#[derive(Parser)]
#[command(name = "timing-core")]
#[command(about = "Real-time race timing and scoring pipeline")]
struct Args {
    /// Event this process pipelines.
    #[arg(long, env = "EVENT_ID")]
    event_id: String,

    /// Initial session under that event.
    #[arg(long, env = "SESSION_ID")]
    session_id: String,

    #[arg(long, env = "REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    redis_url: String,

    #[arg(long, env = "DB_PATH", default_value = "timing.db")]
    db_path: String,

    /// Overrides the default `{hostname}-{pid}` consumer name.
    #[arg(long)]
    consumer_name: Option<String>,

    #[arg(long, default_value_t = 16)]
    batch_size: usize,
}

/// Stand-in for the Sheets-backed control log this repo doesn't ship
/// (out of scope per the external-interface list); always empty.
struct NoControlLog;

impl ControlLogSource for NoControlLog {
    async fn load(&self, _parameter: &str) -> PortResult<Vec<ControlLogEntry>> {
        Ok(Vec::new())
    }
}

/// Stand-in for the driver-roster/video-index collaborators this repo
/// doesn't ship; always reports nothing known.
struct NoMetadata;

impl MetadataSource for NoMetadata {
    async fn driver_for(&self, _transponder_id: &str) -> PortResult<Option<String>> {
        Ok(None)
    }
    async fn video_for(&self, _event_id: &str, _car_number: &str) -> PortResult<Option<VideoMetadata>> {
        Ok(None)
    }
    async fn competitor_for(&self, _car_number: &str) -> PortResult<Option<CompetitorMetadata>> {
        Ok(None)
    }
}

#[derive(Debug, serde::Deserialize)]
struct X2PassPayload {
    transponder_id: String,
    loop_id: String,
    #[serde(default)]
    is_in_pit: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let store = Arc::new(SqliteStore::connect(&args.db_path).await?);
    store.run_migrations().await?;
    let broker = Arc::new(RedisBroker::connect(&args.redis_url).await?);
    let hub = Arc::new(BroadcastHub::new());
    let control_log = Arc::new(NoControlLog);
    let metadata = Arc::new(NoMetadata);

    let ctx = SessionContext::new(args.event_id.clone(), args.session_id.clone());
    match store.load_session(&args.event_id).await {
        Ok(Some(loaded)) => {
            let mut patch = timing_contracts::patch::SessionStatePatch::identity(&args.event_id, &loaded.session_id);
            patch.session_name = Some(loaded.session_name);
            patch.current_flag = Some(loaded.current_flag);
            patch.event_entries = Some(
                loaded
                    .event_entries
                    .into_iter()
                    .map(|e| timing_contracts::patch::EventEntry {
                        number: e.number,
                        name: e.name,
                        team: e.team,
                        class: e.class,
                    })
                    .collect(),
            );
            ctx.apply_session_patch(patch).await;
            for car in loaded.car_positions.into_values() {
                let mut patch = CarPositionPatch::identity(&car.number);
                patch.driver_name = Some(car.driver_name);
                patch.class = Some(car.class);
                patch.overall_position = Some(car.overall_position);
                ctx.apply_car_patch(patch).await;
            }
        }
        Ok(None) => info!(event_id = %args.event_id, "no prior session found, starting fresh"),
        Err(e) => warn!(error = %e, "failed to load prior session, starting fresh"),
    }

    if let Err(e) = store.set_session_live(&args.event_id, &args.session_id, true).await {
        warn!(error = %e, "failed to mark session live");
    }

    let consumer_name = args
        .consumer_name
        .clone()
        .unwrap_or_else(ingress::default_consumer_name);
    let session_changed = Arc::new(Notify::new());

    let (tx, rx) = mpsc::unbounded_channel::<(TimingMessage, StreamField)>();

    spawn_ingress(broker.clone(), args.event_id.clone(), consumer_name.clone(), args.batch_size, ctx.cancellation.clone(), tx);
    spawn_lap_batch_ingest(broker.clone(), store.clone(), args.event_id.clone(), args.session_id.clone(), consumer_name, ctx.cancellation.clone());
    spawn_processing(ctx.clone(), store.clone(), hub.clone(), args.event_id.clone(), args.session_id.clone(), session_changed.clone(), rx);
    spawn_session_monitor(ctx.clone(), store.clone(), args.event_id.clone(), session_changed);
    spawn_starting_position(ctx.clone(), store.clone(), args.event_id.clone());
    spawn_control_log(ctx.clone(), hub.clone(), control_log, args.event_id.clone());
    spawn_external_enrichers(ctx.clone(), hub.clone(), metadata.clone(), args.event_id.clone());
    spawn_in_car(ctx.clone(), hub.clone(), metadata, args.event_id.clone());

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, cancelling background tasks");
    ctx.cancellation.cancel();
    tokio::time::sleep(Duration::from_millis(200)).await;
    Ok(())
}

fn spawn_ingress(
    broker: Arc<RedisBroker>,
    event_id: String,
    consumer_name: String,
    batch_size: usize,
    cancellation: tokio_util::sync::CancellationToken,
    tx: mpsc::UnboundedSender<(TimingMessage, StreamField)>,
) {
    tokio::spawn(async move {
        ingress::run(broker.as_ref(), &event_id, &consumer_name, batch_size, &cancellation, |message, field| {
            if tx.send((message, field.clone())).is_err() {
                warn!("processing task has exited, dropping dispatched message");
            }
        })
        .await;
    });
}

/// Reads the structured lap-batch stream (distinct from the main
/// per-event stream `ingress::run` drains) and feeds each entry through
/// the logger sink's `CarLastLap` upsert.
fn spawn_lap_batch_ingest(
    broker: Arc<RedisBroker>,
    store: Arc<SqliteStore>,
    event_id: String,
    session_id: String,
    consumer_name: String,
    cancellation: tokio_util::sync::CancellationToken,
) {
    tokio::spawn(async move {
        let stream = lap_batch_stream(&event_id);
        let group = lap_batch_group(&event_id);
        loop {
            if cancellation.is_cancelled() {
                return;
            }
            if let Err(e) = broker.ensure_group(&stream, &group).await {
                warn!(error = %e, "failed to ensure lap-batch consumer group");
                tokio::time::sleep(Duration::from_secs(10)).await;
                continue;
            }
            match broker.read_group(&stream, &group, &consumer_name, 16).await {
                Ok(fields) => {
                    for field in &fields {
                        if let Err(e) = logger::process_lap_batch(store.as_ref(), &event_id, &session_id, &field.value).await {
                            warn!(error = %e, "failed to process lap batch entry");
                        }
                        if let Err(e) = broker.ack(&stream, &group, &field.id).await {
                            warn!(error = %e, "failed to ack lap-batch field");
                        }
                    }
                    if fields.is_empty() {
                        tokio::time::sleep(Duration::from_millis(500)).await;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "lap-batch stream read failed, backing off");
                    tokio::time::sleep(Duration::from_secs(10)).await;
                }
            }
        }
    });
}

fn spawn_processing(
    ctx: SessionContext,
    store: Arc<SqliteStore>,
    hub: Arc<BroadcastHub>,
    event_id: String,
    initial_session_id: String,
    session_changed: Arc<Notify>,
    mut rx: mpsc::UnboundedReceiver<(TimingMessage, StreamField)>,
) {
    tokio::spawn(async move {
        let mut rmonitor = RMonitorDecoder::new();
        let mut lap_processor = LapProcessor::new();
        let mut pit_processor = PitLoopProcessor::new();
        pit_processor.reload_loop_metadata(store.as_ref(), &event_id).await;
        let mut consolidator = Consolidator::new(event_id.clone(), initial_session_id.clone());
        let mut session_id = initial_session_id;
        let mut flush = tokio::time::interval(FLUSH_TICK);

        loop {
            tokio::select! {
                received = rx.recv() => {
                    let Some((message, field)) = received else { break };

                    if let Err(e) = logger::log_field(store.as_ref(), &message.event_id, &message.session_id, &field).await {
                        warn!(error = %e, "failed to log field");
                    }

                    match message.message_type {
                        TimingMessageType::RMonitor => {
                            let payload = message.data_as_str().into_owned();
                            for update in rmonitor.decode(&payload) {
                                let effects = decode::rmonitor_effects(&event_id, &session_id, update);
                                apply_effects(&ctx, store.as_ref(), &event_id, &mut consolidator, &mut lap_processor, &pit_processor, &mut session_id, effects).await;
                            }
                        }
                        TimingMessageType::Multiloop => {
                            let payload = message.data_as_str().into_owned();
                            match decode_record(&payload) {
                                Ok(Some(update)) => {
                                    let snapshot = ctx.snapshot().await;
                                    let effects = decode::multiloop_effects(&event_id, &session_id, update, &snapshot);
                                    apply_effects(&ctx, store.as_ref(), &event_id, &mut consolidator, &mut lap_processor, &pit_processor, &mut session_id, effects).await;
                                }
                                Ok(None) => {}
                                Err(e) => warn!(error = %e, "malformed multiloop record, dropping"),
                            }
                        }
                        TimingMessageType::X2Pass => {
                            if let Ok(entry) = serde_json::from_slice::<X2PassPayload>(&message.data) {
                                if let Some(car_number) = ctx.get_car_number_for_transponder(&entry.transponder_id).await {
                                    let current_lap = ctx.get_car_by_number(&car_number).await.map(|c| c.last_lap_completed).unwrap_or(0);
                                    let passing = Passing {
                                        transponder_id: entry.transponder_id,
                                        loop_id: entry.loop_id,
                                        is_in_pit: entry.is_in_pit,
                                    };
                                    let patch = pit_processor.process_passing(&passing, &car_number, current_lap);
                                    if patch.is_entered_pit == Some(true) {
                                        lap_processor.release(&car_number);
                                    }
                                    consolidator.offer_car(patch.clone());
                                    ctx.apply_car_patch(patch).await;
                                }
                            } else {
                                warn!("malformed x2pass payload, skipping live pit/loop update");
                            }
                        }
                        TimingMessageType::X2Loop => {
                            pit_processor.reload_loop_metadata(store.as_ref(), &event_id).await;
                        }
                        TimingMessageType::Flags => {
                            match serde_json::from_slice::<Vec<FlagDuration>>(&message.data) {
                                Ok(durations) => {
                                    if let Some(patch) = flags::process_flags(&ctx, store.as_ref(), &event_id, &session_id, durations).await {
                                        consolidator.offer_session(patch.clone());
                                        ctx.apply_session_patch(patch).await;
                                    }
                                }
                                Err(e) => warn!(error = %e, "malformed flags payload, skipping"),
                            }
                        }
                        TimingMessageType::EvtSessionChanged => {
                            session_changed.notify_one();
                        }
                        TimingMessageType::EvtConfChanged => {
                            ctx.reset_command().await;
                            if let Err(e) = hub.send_to_group(&sub_group(&event_id), HubMessage::Reset { event_id: event_id.clone() }).await {
                                warn!(error = %e, "failed to publish reset notice");
                            }
                        }
                        TimingMessageType::DrEvt | TimingMessageType::DrTrans | TimingMessageType::Video | TimingMessageType::RelayHb => {
                            // Logged above; no additional in-memory state to update.
                        }
                    }
                }
                _ = flush.tick() => {
                    let snapshot = ctx.snapshot().await;
                    for patch in position::enrich(&snapshot.car_positions) {
                        consolidator.offer_car(patch.clone());
                        ctx.apply_car_patch(patch).await;
                    }

                    let snapshot = ctx.snapshot().await;
                    let committed = lap_processor
                        .commit_ready(store.as_ref(), &event_id, &session_id, snapshot.current_flag, &snapshot.car_positions)
                        .await;
                    for patch in lap_processor.projection_patches(&committed) {
                        consolidator.offer_car(patch.clone());
                        ctx.apply_car_patch(patch).await;
                    }

                    if let Some(batch) = consolidator.take_batch_if_ready() {
                        aggregator::publish_batch(hub.as_ref(), &event_id, batch).await;
                    }
                }
            }
        }
    });
}

async fn apply_effects(
    ctx: &SessionContext,
    store: &SqliteStore,
    event_id: &str,
    consolidator: &mut Consolidator,
    lap_processor: &mut LapProcessor,
    pit_processor: &PitLoopProcessor,
    session_id: &mut String,
    effects: Vec<Effect>,
) {
    for effect in effects {
        match effect {
            Effect::Session(patch) => {
                consolidator.offer_session(patch.clone());
                ctx.apply_session_patch(patch).await;
            }
            Effect::Car(patch) => {
                consolidator.offer_car(patch.clone());
                ctx.apply_car_patch(patch).await;
            }
            Effect::NewSession { session_id: new_id, session_name } => {
                ctx.new_session(new_id.clone(), session_name).await;
                *session_id = new_id;
            }
            Effect::FlagDuration(duration) => {
                if let Some(patch) = flags::process_flags(ctx, store, event_id, session_id, vec![duration]).await {
                    consolidator.offer_session(patch.clone());
                    ctx.apply_session_patch(patch).await;
                }
            }
            Effect::LapCompleted { car_number, lap_number } => {
                if lap_processor.observe(&car_number, lap_number) {
                    let mut patch = CarPositionPatch::identity(&car_number);
                    patch.lap_included_pit = Some(pit_processor.lap_included_pit(&car_number, lap_number));
                    consolidator.offer_car(patch.clone());
                    ctx.apply_car_patch(patch).await;
                }
            }
        }
    }
}

fn spawn_session_monitor(ctx: SessionContext, store: Arc<SqliteStore>, event_id: String, session_changed: Arc<Notify>) {
    tokio::spawn(async move {
        let mut monitor = SessionMonitor::new();
        let mut ticker = tokio::time::interval(MONITOR_TICK);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let snapshot = ctx.snapshot().await;
                    monitor.tick(store.as_ref(), &event_id, &snapshot.session_id, &snapshot).await;
                }
                _ = session_changed.notified() => {
                    monitor.on_session_changed();
                }
                _ = ctx.cancellation.cancelled() => {
                    let snapshot = ctx.snapshot().await;
                    monitor.on_shutdown_signal(store.as_ref(), &event_id, &snapshot.session_id, &snapshot).await;
                    return;
                }
            }
        }
    });
}

fn spawn_starting_position(ctx: SessionContext, store: Arc<SqliteStore>, event_id: String) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(STARTPOS_POLL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let session_id = ctx.snapshot().await.session_id;
                    startpos::run_once(&ctx, store.as_ref(), &event_id, &session_id).await;
                }
                _ = ctx.cancellation.cancelled() => return,
            }
        }
    });
}

fn spawn_control_log(ctx: SessionContext, hub: Arc<BroadcastHub>, source: Arc<NoControlLog>, event_id: String) {
    tokio::spawn(async move {
        let mut processor = ControlLogProcessor::new();
        let group = sub_group(&event_id);
        let mut ticker = tokio::time::interval(CONTROL_LOG_POLL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = processor.poll(&event_id, &group, source.as_ref(), hub.as_ref()).await {
                        warn!(error = %e, "control log poll failed");
                    }
                }
                _ = ctx.cancellation.cancelled() => return,
            }
        }
    });
}

fn spawn_external_enrichers(ctx: SessionContext, hub: Arc<BroadcastHub>, metadata: Arc<NoMetadata>, event_id: String) {
    tokio::spawn(async move {
        let mut enricher = ExternalEnricher::new();
        let group = sub_group(&event_id);
        let mut ticker = tokio::time::interval(EXTERNAL_ENRICH_TICK);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let snapshot = ctx.snapshot().await;
                    for car in snapshot.car_positions.values() {
                        let Some(transponder_id) = &car.transponder_id else { continue };
                        if let Some(patch) = enricher.enrich_driver(metadata.as_ref(), transponder_id, &car.number, &car.driver_name).await {
                            ctx.apply_car_patch(patch).await;
                        }
                        enricher.enrich_video(metadata.as_ref(), hub.as_ref(), &in_car_group(&event_id, &car.number), &event_id, &car.number).await;
                    }
                }
                _ = ctx.cancellation.cancelled() => return,
            }
        }
    });
}

fn spawn_in_car(ctx: SessionContext, hub: Arc<BroadcastHub>, metadata: Arc<NoMetadata>, event_id: String) {
    tokio::spawn(async move {
        let mut processor = InCarProcessor::new();
        let mut ticker = tokio::time::interval(INCAR_TICK);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let snapshot = ctx.snapshot().await;
                    processor.tick(&event_id, &snapshot.car_positions, &snapshot.event_entries, snapshot.current_flag, hub.as_ref(), metadata.as_ref()).await;
                }
                _ = ctx.cancellation.cancelled() => return,
            }
        }
    });
}
