//! In-process runtime for the probe hooks.
//!
//! [`HostedProbe`] owns host equivalents of every kernel map and hands out one
//! [`CpuContext`] per simulated CPU. The contexts implement [`ProbeMaps`], so
//! the hook functions in `upf_monitor_common::probe` run against it unchanged.
//! TEID counting is exact here, unlike the kernel's first-writer-wins insert.

mod ring;
mod tables;

use std::time::Instant;

use upf_monitor_common::probe::ProbeMaps;
use upf_monitor_common::{
    ConfigKey, Direction, DropEvent, PacketEvent, SessionInfo, TrafficCounter, DROP_RING_BYTES,
    MAX_SESSIONS, MAX_TEIDS, PACKET_RING_BYTES,
};

pub use ring::EventRing;
pub use tables::{BoundedMap, ConfigTable, PerCpuCounters, SessionTable, TableFull, TeidTable};

use crate::stats::{sum_counters, DirectionTotals};

#[derive(Debug)]
pub struct HostedProbe {
    epoch: Instant,
    config: ConfigTable,
    counters: PerCpuCounters,
    teids: TeidTable,
    sessions: SessionTable,
    drop_events: EventRing<DropEvent>,
    packet_events: EventRing<PacketEvent>,
}

impl HostedProbe {
    /// Tables sized like the kernel maps.
    pub fn new(cpus: usize) -> Self {
        Self::with_rings(
            cpus,
            EventRing::with_byte_size(DROP_RING_BYTES),
            EventRing::with_byte_size(PACKET_RING_BYTES),
        )
    }

    pub fn with_rings(
        cpus: usize,
        drop_events: EventRing<DropEvent>,
        packet_events: EventRing<PacketEvent>,
    ) -> Self {
        Self {
            epoch: Instant::now(),
            config: ConfigTable::default(),
            counters: PerCpuCounters::new(cpus),
            teids: TeidTable::new(MAX_TEIDS as usize),
            sessions: SessionTable::new(MAX_SESSIONS as usize),
            drop_events,
            packet_events,
        }
    }

    /// Context for hooks running on `cpu`. Out-of-range CPUs update nothing.
    pub fn cpu(&self, cpu: usize) -> CpuContext<'_> {
        CpuContext { probe: self, cpu }
    }

    pub fn cpus(&self) -> usize {
        self.counters.cpus()
    }

    pub fn set_config(&self, key: ConfigKey, enabled: bool) {
        self.config.set(key, enabled as u32);
    }

    pub fn config(&self) -> &ConfigTable {
        &self.config
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    pub fn teids(&self) -> &TeidTable {
        &self.teids
    }

    pub fn direction_totals(&self) -> DirectionTotals {
        DirectionTotals {
            uplink: sum_counters(&self.counters.values(Direction::Uplink)),
            downlink: sum_counters(&self.counters.values(Direction::Downlink)),
        }
    }

    pub fn per_cpu(&self, cpu: usize, direction: Direction) -> Option<TrafficCounter> {
        self.counters.get(cpu, direction)
    }

    pub fn teid_counter(&self, teid: u32) -> Option<TrafficCounter> {
        self.teids.get(teid)
    }

    pub fn session(&self, teid: u32) -> Option<SessionInfo> {
        self.sessions.get(teid)
    }

    pub fn drop_ring(&self) -> &EventRing<DropEvent> {
        &self.drop_events
    }

    pub fn packet_ring(&self) -> &EventRing<PacketEvent> {
        &self.packet_events
    }

    pub fn drain_drop_events(&self) -> Vec<DropEvent> {
        self.drop_events.drain()
    }

    pub fn drain_packet_events(&self) -> Vec<PacketEvent> {
        self.packet_events.drain()
    }
}

/// [`HostedProbe`] as seen from one CPU.
#[derive(Clone, Copy, Debug)]
pub struct CpuContext<'a> {
    probe: &'a HostedProbe,
    cpu: usize,
}

impl CpuContext<'_> {
    pub fn id(&self) -> usize {
        self.cpu
    }
}

impl ProbeMaps for CpuContext<'_> {
    fn now_ns(&self) -> u64 {
        self.probe.epoch.elapsed().as_nanos() as u64
    }

    fn config(&self, key: ConfigKey) -> Option<u32> {
        self.probe.config.get(key.slot())
    }

    fn update_direction(&self, direction: Direction, len: u32, now_ns: u64) {
        self.probe.counters.record(self.cpu, direction, len, now_ns);
    }

    fn update_teid(&self, teid: u32, len: u32, now_ns: u64) {
        let _ = self.probe.teids.record(teid, len, now_ns);
    }

    fn publish_drop<F: FnOnce() -> DropEvent>(&self, build: F) -> bool {
        self.probe.drop_events.publish_with(build)
    }

    fn publish_packet<F: FnOnce() -> PacketEvent>(&self, build: F) -> bool {
        self.probe.packet_events.publish_with(build)
    }
}
