//! Hook bodies for the gtp5g probes.
//!
//! Everything here is written against [`ProbeMaps`] so the same code runs in
//! the eBPF object (kernel maps) and in the agent's hosted runtime. Hooks
//! never loop or allocate; every early exit is a silent return.

use crate::{
    ConfigKey, Direction, DropEvent, DropReason, PacketEvent, DROP_NOISE_FLOOR,
};

/// Table and channel access used by the hooks.
pub trait ProbeMaps {
    /// Monotonic clock in nanoseconds, stamped on counters and records.
    fn now_ns(&self) -> u64;

    /// Raw config slot; `None` when the lookup misses.
    fn config(&self, key: ConfigKey) -> Option<u32>;

    /// Bumps this CPU's copy of the direction counter.
    fn update_direction(&self, direction: Direction, len: u32, now_ns: u64);

    /// Increments an existing TEID entry or inserts `{1, len}` when the key is
    /// new. Insertion past capacity is dropped.
    fn update_teid(&self, teid: u32, len: u32, now_ns: u64);

    /// Reserves one drop record and fills it with `build` only if the
    /// reservation succeeded. Returns whether the record was submitted.
    fn publish_drop<F: FnOnce() -> DropEvent>(&self, build: F) -> bool;

    /// Same as [`publish_drop`](Self::publish_drop) for the packet channel.
    fn publish_packet<F: FnOnce() -> PacketEvent>(&self, build: F) -> bool;
}

/// A packet handle as seen by a hook.
pub trait Packet {
    /// Byte length, `None` for a null or unreadable handle.
    fn len(&self) -> Option<u32>;
}

impl Packet for Option<u32> {
    fn len(&self) -> Option<u32> {
        *self
    }
}

pub fn feature_enabled<M: ProbeMaps>(maps: &M, key: ConfigKey) -> bool {
    matches!(maps.config(key), Some(value) if value != 0)
}

/// `gtp5g_encap_recv`: GTP-U packet arriving from N3.
pub fn on_uplink_entry<M: ProbeMaps, P: Packet>(maps: &M, skb: &P) {
    let Some(len) = skb.len() else {
        return;
    };
    maps.update_direction(Direction::Uplink, len, maps.now_ns());

    // TEID extraction from the GTP-U header is not wired up; per-tunnel
    // accounting on this path goes through `record_teid` once it is.
}

/// `gtp5g_dev_xmit`: packet leaving through the upfgtp device.
pub fn on_downlink_exit<M: ProbeMaps, P: Packet>(maps: &M, skb: &P) {
    let Some(len) = skb.len() else {
        return;
    };
    maps.update_direction(Direction::Downlink, len, maps.now_ns());
}

/// `skb:kfree_skb`: any freed packet on the host, off unless drop tracing is on.
pub fn on_kfree_skb<M: ProbeMaps, P: Packet>(maps: &M, skb: &P) {
    if !feature_enabled(maps, ConfigKey::DropTracing) {
        return;
    }
    let Some(len) = skb.len() else {
        return;
    };
    if len < DROP_NOISE_FLOOR {
        return;
    }
    emit_drop_event(maps, 0, 0, 0, len, DropReason::KernelInternal, Direction::Uplink);
}

pub fn record_teid<M: ProbeMaps>(maps: &M, teid: u32, len: u32) {
    maps.update_teid(teid, len, maps.now_ns());
}

pub fn emit_drop_event<M: ProbeMaps>(
    maps: &M,
    teid: u32,
    src_ip: u32,
    dst_ip: u32,
    pkt_len: u32,
    reason: DropReason,
    direction: Direction,
) -> bool {
    maps.publish_drop(|| DropEvent {
        timestamp: maps.now_ns(),
        teid,
        src_ip,
        dst_ip,
        src_port: 0,
        dst_port: 0,
        pkt_len,
        reason: reason as u8,
        direction: direction as u8,
        pad: [0; 2],
    })
}

/// Publishes a packet record when detailed tracing is enabled.
pub fn emit_packet_event<M: ProbeMaps>(
    maps: &M,
    teid: u32,
    src_ip: u32,
    dst_ip: u32,
    pkt_len: u32,
    direction: Direction,
    qfi: u8,
) -> bool {
    if !feature_enabled(maps, ConfigKey::DetailedTracing) {
        return false;
    }
    maps.publish_packet(|| PacketEvent {
        timestamp: maps.now_ns(),
        teid,
        src_ip,
        dst_ip,
        pkt_len,
        direction: direction as u8,
        qfi,
        pad: [0; 2],
    })
}
