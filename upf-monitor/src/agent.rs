use std::borrow::Borrow;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use aya::maps::{Array, HashMap, Map, MapData, PerCpuArray, RingBuf};
use aya::Ebpf;
use log::{debug, info, log_enabled, warn, Level};
use serde_json::Value;
use tokio::io::unix::AsyncFd;
use tokio::signal;

use upf_monitor_common::{
    SessionInfo, TrafficCounter, MAP_AGENT_CONFIG, MAP_DROP_EVENTS, MAP_PACKET_EVENTS,
    MAP_TEID_SESSIONS, MAP_TEID_STATS, MAP_TRAFFIC_STATS,
};

use crate::config::{ConfigRegistry, ProbeConfig};
use crate::events::{drain_ring, EventHandler};
use crate::loader::{
    attach_hooks, bump_memlock_rlimit, load_probes, open_pinned, pin_maps, pin_path, unpin_maps,
    validate_options, ProbeOptions,
};
use crate::sessions::SessionRegistry;
use crate::stats::{
    format_bytes, read_direction_totals, read_teid_counters, snapshot_json, DeltaTracker,
};

#[derive(Clone, Debug)]
pub struct AgentOptions {
    pub probe: ProbeOptions,
    pub report_interval: Duration,
    /// Leave the pins in place on exit for inspection. The next run replaces them.
    pub keep_pins: bool,
}

/// Loads and attaches the probes, then reports until Ctrl+C.
pub async fn run_agent(opts: AgentOptions) -> Result<()> {
    validate_options(&opts.probe)?;
    bump_memlock_rlimit();

    let mut bpf = load_probes(&opts.probe)?;
    write_config(&mut bpf, &opts.probe.config)?;
    attach_hooks(&mut bpf)?;
    pin_maps(&mut bpf, &opts.probe.pin_dir)?;
    info!(
        "probes attached (detailed_tracing={}, drop_tracing={}); maps pinned under {}",
        opts.probe.config.detailed_tracing,
        opts.probe.config.drop_tracing,
        opts.probe.pin_dir.display()
    );

    let result = drive(&mut bpf, opts.report_interval).await;

    info!("detaching probes");
    drop(bpf);
    if !opts.keep_pins {
        unpin_maps(&opts.probe.pin_dir)?;
    }
    result
}

fn write_config(bpf: &mut Ebpf, cfg: &ProbeConfig) -> Result<()> {
    let map = bpf
        .map_mut(MAP_AGENT_CONFIG)
        .with_context(|| format!("map {MAP_AGENT_CONFIG} not found"))?;
    let array = Array::try_from(map).context("config map has unexpected type")?;
    ConfigRegistry::new(array).apply(cfg)
}

fn take_map(bpf: &mut Ebpf, name: &str) -> Result<Map> {
    bpf.take_map(name)
        .with_context(|| format!("map {name} not found"))
}

async fn drive(bpf: &mut Ebpf, report_interval: Duration) -> Result<()> {
    let traffic: PerCpuArray<MapData, TrafficCounter> =
        PerCpuArray::try_from(take_map(bpf, MAP_TRAFFIC_STATS)?)
            .context("traffic map has unexpected type")?;
    let teids: HashMap<MapData, u32, TrafficCounter> =
        HashMap::try_from(take_map(bpf, MAP_TEID_STATS)?)
            .context("teid map has unexpected type")?;
    let sessions = SessionRegistry::new(
        HashMap::try_from(take_map(bpf, MAP_TEID_SESSIONS)?)
            .context("session map has unexpected type")?,
    );
    let drop_ring = RingBuf::try_from(take_map(bpf, MAP_DROP_EVENTS)?)
        .context("drop event map is not a ring buffer")?;
    let packet_ring = RingBuf::try_from(take_map(bpf, MAP_PACKET_EVENTS)?)
        .context("packet event map is not a ring buffer")?;

    let mut drop_fd = AsyncFd::new(drop_ring).context("failed to poll drop ring")?;
    let mut packet_fd = AsyncFd::new(packet_ring).context("failed to poll packet ring")?;

    let mut handler = EventHandler::default();
    let mut deltas = DeltaTracker::default();
    let mut ticker = tokio::time::interval(report_interval);
    let shutdown = signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            res = &mut shutdown => {
                res.context("failed to wait for shutdown signal")?;
                break;
            }
            _ = ticker.tick() => {
                report(&traffic, &teids, &sessions, &mut deltas)?;
            }
            guard = drop_fd.readable_mut() => {
                let mut guard = guard.context("drop ring poll failed")?;
                drain_ring(guard.get_inner_mut(), |raw| handler.on_drop_record(raw));
                guard.clear_ready();
            }
            guard = packet_fd.readable_mut() => {
                let mut guard = guard.context("packet ring poll failed")?;
                drain_ring(guard.get_inner_mut(), |raw| handler.on_packet_record(raw));
                guard.clear_ready();
            }
        }
    }

    summarize(&handler);
    Ok(())
}

fn report<A, B, C>(
    traffic: &PerCpuArray<A, TrafficCounter>,
    teids: &HashMap<B, u32, TrafficCounter>,
    sessions: &SessionRegistry<C>,
    deltas: &mut DeltaTracker,
) -> Result<()>
where
    A: Borrow<MapData>,
    B: Borrow<MapData>,
    C: Borrow<MapData>,
{
    let totals = read_direction_totals(traffic)?;
    let (up, down) = deltas.update(totals);
    info!(
        "uplink {} pkts / {} (+{} / +{}) | downlink {} pkts / {} (+{} / +{})",
        totals.uplink.packets,
        format_bytes(totals.uplink.bytes),
        up.packets,
        format_bytes(up.bytes),
        totals.downlink.packets,
        format_bytes(totals.downlink.bytes),
        down.packets,
        format_bytes(down.bytes),
    );

    if log_enabled!(Level::Debug) {
        let tunnels = read_teid_counters(teids)?;
        let snapshot = snapshot_json(&totals, &tunnels, |teid| session_or_none(sessions, teid));
        debug!("{snapshot}");
    }
    Ok(())
}

fn session_or_none<T: Borrow<MapData>>(
    sessions: &SessionRegistry<T>,
    teid: u32,
) -> Option<SessionInfo> {
    match sessions.get(teid) {
        Ok(info) => info,
        Err(err) => {
            warn!("{err:#}");
            None
        }
    }
}

fn summarize(handler: &EventHandler) {
    info!(
        "{} drop events, {} packet events, {} malformed records",
        handler.drops.total(),
        handler.packets,
        handler.malformed
    );
    for (reason, direction, count) in handler.drops.iter() {
        info!("  {reason}/{direction}: {count}");
    }
}

/// Snapshot built from the maps a running agent pinned under `pin_dir`.
pub fn pinned_snapshot(pin_dir: &Path) -> Result<Value> {
    let traffic: PerCpuArray<MapData, TrafficCounter> =
        PerCpuArray::try_from(open_pinned(&pin_path(pin_dir, MAP_TRAFFIC_STATS))?)
            .context("traffic map has unexpected type")?;
    let teids: HashMap<MapData, u32, TrafficCounter> =
        HashMap::try_from(open_pinned(&pin_path(pin_dir, MAP_TEID_STATS))?)
            .context("teid map has unexpected type")?;
    let sessions = SessionRegistry::from_pin(pin_path(pin_dir, MAP_TEID_SESSIONS))?;

    let totals = read_direction_totals(&traffic)?;
    let tunnels = read_teid_counters(&teids)?;
    Ok(snapshot_json(&totals, &tunnels, |teid| {
        session_or_none(&sessions, teid)
    }))
}
