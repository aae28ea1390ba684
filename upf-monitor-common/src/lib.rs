#![no_std]

// Types shared between the gtp5g probes and the userspace agent.
// Keep this crate `no_std` friendly so it can be used from eBPF code.

pub mod probe;

pub const MAP_TRAFFIC_STATS: &str = "traffic_stats";
pub const MAP_TEID_STATS: &str = "teid_stats";
pub const MAP_TEID_SESSIONS: &str = "teid_sessions";
pub const MAP_AGENT_CONFIG: &str = "agent_config";
pub const MAP_DROP_EVENTS: &str = "drop_events";
pub const MAP_PACKET_EVENTS: &str = "packet_events";

pub const PROG_UPLINK_ENTRY: &str = "gtp5g_encap_recv";
pub const PROG_DOWNLINK_EXIT: &str = "gtp5g_dev_xmit";
pub const PROG_KFREE_SKB: &str = "kfree_skb";

pub const DIRECTION_SLOTS: u32 = 2;
pub const MAX_TEIDS: u32 = 4096;
pub const MAX_SESSIONS: u32 = 4096;
pub const CONFIG_SLOTS: u32 = 4;

pub const DROP_RING_BYTES: u32 = 256 * 1024;
pub const PACKET_RING_BYTES: u32 = 512 * 1024;
/// Every BPF ring buffer record is prefixed by an 8 byte header.
pub const RING_RECORD_HEADER: usize = 8;

/// Freed packets shorter than this are not reported on the drop path.
pub const DROP_NOISE_FLOOR: u32 = 20;

/// `sk_buff.len` offset on x86_64 5.x/6.x kernels; overridable at load time.
pub const DEFAULT_SKB_LEN_OFFSET: u32 = 112;
/// `skbaddr` offset inside the `skb:kfree_skb` tracepoint record.
pub const KFREE_SKB_SKBADDR_OFFSET: usize = 8;

/// Number of whole records of `record_len` bytes a ring of `byte_size` holds.
pub const fn ring_capacity(byte_size: u32, record_len: usize) -> usize {
    let slot = (record_len + RING_RECORD_HEADER + 7) & !7;
    byte_size as usize / slot
}

#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Direction {
    Uplink = 0,
    Downlink = 1,
}

impl Direction {
    pub const fn slot(self) -> u32 {
        self as u32
    }

    pub const fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Direction::Uplink),
            1 => Some(Direction::Downlink),
            _ => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Direction::Uplink => "uplink",
            Direction::Downlink => "downlink",
        }
    }
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum DropReason {
    NoMatchingRule = 0,
    InvalidTeid = 1,
    QosViolation = 2,
    KernelInternal = 3,
}

impl DropReason {
    pub const fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(DropReason::NoMatchingRule),
            1 => Some(DropReason::InvalidTeid),
            2 => Some(DropReason::QosViolation),
            3 => Some(DropReason::KernelInternal),
            _ => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            DropReason::NoMatchingRule => "no_pdr_match",
            DropReason::InvalidTeid => "invalid_teid",
            DropReason::QosViolation => "qos_violation",
            DropReason::KernelInternal => "kernel_drop",
        }
    }
}

/// Index into the `agent_config` array.
#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ConfigKey {
    DetailedTracing = 0,
    DropTracing = 1,
}

impl ConfigKey {
    pub const fn slot(self) -> u32 {
        self as u32
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct TrafficCounter {
    pub packets: u64,
    pub bytes: u64,
    pub timestamp: u64,
}

impl TrafficCounter {
    /// Entry created on the first observation of a key.
    pub const fn first_seen(len: u32, now_ns: u64) -> Self {
        Self {
            packets: 1,
            bytes: len as u64,
            timestamp: now_ns,
        }
    }

    pub fn record(&mut self, len: u32, now_ns: u64) {
        self.packets = self.packets.wrapping_add(1);
        self.bytes = self.bytes.wrapping_add(len as u64);
        self.timestamp = now_ns;
    }
}

/// Session identity for one TEID, written by the PFCP side of the agent.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct SessionInfo {
    pub seid: u64,
    pub ue_ip: u32,
    pub upf_ip: u32,
    pub created_at: u64,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct DropEvent {
    pub timestamp: u64,
    pub teid: u32,
    pub src_ip: u32,
    pub dst_ip: u32,
    pub src_port: u16,
    pub dst_port: u16,
    pub pkt_len: u32,
    pub reason: u8,
    pub direction: u8,
    pub pad: [u8; 2],
}

impl DropEvent {
    pub const LEN: usize = 32;

    /// Decodes a record published on `drop_events`.
    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::LEN {
            return None;
        }
        Some(Self {
            timestamp: read_u64(buf, 0),
            teid: read_u32(buf, 8),
            src_ip: read_u32(buf, 12),
            dst_ip: read_u32(buf, 16),
            src_port: read_u16(buf, 20),
            dst_port: read_u16(buf, 22),
            pkt_len: read_u32(buf, 24),
            reason: buf[28],
            direction: buf[29],
            pad: [0; 2],
        })
    }

    pub fn reason(&self) -> Option<DropReason> {
        DropReason::from_u8(self.reason)
    }

    pub fn direction(&self) -> Option<Direction> {
        Direction::from_u8(self.direction)
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct PacketEvent {
    pub timestamp: u64,
    pub teid: u32,
    pub src_ip: u32,
    pub dst_ip: u32,
    pub pkt_len: u32,
    pub direction: u8,
    pub qfi: u8,
    pub pad: [u8; 2],
}

impl PacketEvent {
    /// Bytes carrying fields; the in-memory record is padded to 32.
    pub const LEN: usize = 28;

    /// Decodes a record published on `packet_events`.
    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::LEN {
            return None;
        }
        Some(Self {
            timestamp: read_u64(buf, 0),
            teid: read_u32(buf, 8),
            src_ip: read_u32(buf, 12),
            dst_ip: read_u32(buf, 16),
            pkt_len: read_u32(buf, 20),
            direction: buf[24],
            qfi: buf[25],
            pad: [0; 2],
        })
    }

    pub fn direction(&self) -> Option<Direction> {
        Direction::from_u8(self.direction)
    }
}

fn read_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_ne_bytes([buf[offset], buf[offset + 1]])
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_ne_bytes(raw)
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_ne_bytes(raw)
}

// When compiled for userspace with the `user` feature enabled the crate
// exposes an implementation of `aya::Pod` for these types so they can be
// used with aya's typed map APIs.
#[cfg(feature = "user")]
mod user_impls {
    extern crate aya;

    use super::{DropEvent, PacketEvent, SessionInfo, TrafficCounter};
    use aya::Pod;

    unsafe impl Pod for TrafficCounter {}
    unsafe impl Pod for SessionInfo {}
    unsafe impl Pod for DropEvent {}
    unsafe impl Pod for PacketEvent {}
}
