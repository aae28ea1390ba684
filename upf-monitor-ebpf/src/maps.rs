use aya_ebpf::macros::map;
use aya_ebpf::maps::{Array, HashMap, PerCpuArray, RingBuf};
use upf_monitor_common::{
    SessionInfo, TrafficCounter, CONFIG_SLOTS, DIRECTION_SLOTS, DROP_RING_BYTES, MAX_SESSIONS,
    MAX_TEIDS, PACKET_RING_BYTES,
};

// Slot 0 = uplink, 1 = downlink; one private copy per CPU.
#[map(name = "traffic_stats")]
pub static TRAFFIC_STATS: PerCpuArray<TrafficCounter> =
    PerCpuArray::<TrafficCounter>::with_max_entries(DIRECTION_SLOTS, 0);

#[map(name = "teid_stats")]
pub static TEID_STATS: HashMap<u32, TrafficCounter> =
    HashMap::<u32, TrafficCounter>::with_max_entries(MAX_TEIDS, 0);

// Filled by the agent from PFCP; the hooks do not read it yet.
#[map(name = "teid_sessions")]
pub static TEID_SESSIONS: HashMap<u32, SessionInfo> =
    HashMap::<u32, SessionInfo>::with_max_entries(MAX_SESSIONS, 0);

#[map(name = "agent_config")]
pub static AGENT_CONFIG: Array<u32> = Array::<u32>::with_max_entries(CONFIG_SLOTS, 0);

#[map(name = "drop_events")]
pub static DROP_EVENTS: RingBuf = RingBuf::with_byte_size(DROP_RING_BYTES, 0);

#[map(name = "packet_events")]
pub static PACKET_EVENTS: RingBuf = RingBuf::with_byte_size(PACKET_RING_BYTES, 0);
