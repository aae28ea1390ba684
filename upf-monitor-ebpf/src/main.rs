#![no_std]
#![no_main]

mod maps;

use aya_ebpf::helpers::{bpf_ktime_get_ns, bpf_probe_read_kernel};
use aya_ebpf::macros::{kprobe, tracepoint};
use aya_ebpf::programs::{ProbeContext, TracePointContext};
use upf_monitor_common::probe::{self, Packet, ProbeMaps};
use upf_monitor_common::{
    ConfigKey, Direction, DropEvent, PacketEvent, TrafficCounter, DEFAULT_SKB_LEN_OFFSET,
    KFREE_SKB_SKBADDR_OFFSET,
};

use crate::maps::{AGENT_CONFIG, DROP_EVENTS, PACKET_EVENTS, TEID_STATS, TRAFFIC_STATS};

const BPF_NOEXIST: u64 = 1;

// Patched by the loader through `EbpfLoader::set_global`.
#[no_mangle]
static SKB_LEN_OFFSET: u32 = DEFAULT_SKB_LEN_OFFSET;

#[kprobe]
pub fn gtp5g_encap_recv(ctx: ProbeContext) -> u32 {
    // int gtp5g_encap_recv(struct sock *sk, struct sk_buff *skb)
    probe::on_uplink_entry(&KernelMaps, &Skb(ctx.arg(1)));
    0
}

#[kprobe]
pub fn gtp5g_dev_xmit(ctx: ProbeContext) -> u32 {
    // netdev_tx_t gtp5g_dev_xmit(struct sk_buff *skb, struct net_device *dev)
    probe::on_downlink_exit(&KernelMaps, &Skb(ctx.arg(0)));
    0
}

#[tracepoint]
pub fn kfree_skb(ctx: TracePointContext) -> u32 {
    let skb = unsafe { ctx.read_at::<*const u8>(KFREE_SKB_SKBADDR_OFFSET) }.ok();
    probe::on_kfree_skb(&KernelMaps, &Skb(skb));
    0
}

struct Skb(Option<*const u8>);

impl Packet for Skb {
    fn len(&self) -> Option<u32> {
        let skb = self.0?;
        if skb.is_null() {
            return None;
        }
        let offset = unsafe { core::ptr::read_volatile(&SKB_LEN_OFFSET) } as usize;
        unsafe { bpf_probe_read_kernel(skb.add(offset) as *const u32) }.ok()
    }
}

struct KernelMaps;

impl ProbeMaps for KernelMaps {
    fn now_ns(&self) -> u64 {
        unsafe { bpf_ktime_get_ns() }
    }

    fn config(&self, key: ConfigKey) -> Option<u32> {
        AGENT_CONFIG.get(key.slot()).copied()
    }

    fn update_direction(&self, direction: Direction, len: u32, now_ns: u64) {
        if let Some(ptr) = TRAFFIC_STATS.get_ptr_mut(direction.slot()) {
            let counter = unsafe { &mut *ptr };
            counter.record(len, now_ns);
        }
    }

    fn update_teid(&self, teid: u32, len: u32, now_ns: u64) {
        match TEID_STATS.get_ptr_mut(&teid) {
            Some(ptr) => {
                let counter = unsafe { &mut *ptr };
                counter.record(len, now_ns);
            }
            None => {
                let init = TrafficCounter::first_seen(len, now_ns);
                let _ = TEID_STATS.insert(&teid, &init, BPF_NOEXIST);
            }
        }
    }

    fn publish_drop<F: FnOnce() -> DropEvent>(&self, build: F) -> bool {
        match DROP_EVENTS.reserve::<DropEvent>(0) {
            Some(mut entry) => {
                entry.write(build());
                entry.submit(0);
                true
            }
            None => false,
        }
    }

    fn publish_packet<F: FnOnce() -> PacketEvent>(&self, build: F) -> bool {
        match PACKET_EVENTS.reserve::<PacketEvent>(0) {
            Some(mut entry) => {
                entry.write(build());
                entry.submit(0);
                true
            }
            None => false,
        }
    }
}

#[link_section = "license"]
#[no_mangle]
static LICENSE: [u8; 4] = *b"GPL\0";

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}
