use std::thread;

use upf_monitor::hosted::{EventRing, HostedProbe};
use upf_monitor_common::probe::{
    emit_drop_event, emit_packet_event, on_downlink_exit, on_kfree_skb, on_uplink_entry,
    record_teid,
};
use upf_monitor_common::{ConfigKey, Direction, DropReason, TrafficCounter};

const NULL_SKB: Option<u32> = None;

#[test]
fn uplink_hook_adds_one_packet_on_observing_cpu() {
    let probe = HostedProbe::new(4);
    on_uplink_entry(&probe.cpu(2), &Some(1400));

    let counter = probe.per_cpu(2, Direction::Uplink).unwrap();
    assert_eq!((counter.packets, counter.bytes), (1, 1400));
    for cpu in [0, 1, 3] {
        assert_eq!(
            probe.per_cpu(cpu, Direction::Uplink),
            Some(TrafficCounter::default())
        );
    }
    assert_eq!(probe.direction_totals().downlink.packets, 0);
}

#[test]
fn downlink_hook_is_symmetric() {
    let probe = HostedProbe::new(2);
    on_downlink_exit(&probe.cpu(0), &Some(98));
    on_downlink_exit(&probe.cpu(0), &Some(2));

    let counter = probe.per_cpu(0, Direction::Downlink).unwrap();
    assert_eq!((counter.packets, counter.bytes), (2, 100));
    assert_eq!(probe.direction_totals().uplink.packets, 0);
}

#[test]
fn null_handle_has_no_side_effects() {
    let probe = HostedProbe::new(1);
    probe.set_config(ConfigKey::DropTracing, true);
    let cpu = probe.cpu(0);
    on_uplink_entry(&cpu, &NULL_SKB);
    on_downlink_exit(&cpu, &NULL_SKB);
    on_kfree_skb(&cpu, &NULL_SKB);

    let totals = probe.direction_totals();
    assert_eq!(totals.uplink.packets + totals.downlink.packets, 0);
    assert!(probe.drain_drop_events().is_empty());
}

#[test]
fn teid_counter_created_then_incremented() {
    let probe = HostedProbe::new(2);
    record_teid(&probe.cpu(0), 0x1234, 500);
    let first = probe.teid_counter(0x1234).unwrap();
    assert_eq!((first.packets, first.bytes), (1, 500));

    record_teid(&probe.cpu(1), 0x1234, 700);
    let second = probe.teid_counter(0x1234).unwrap();
    assert_eq!((second.packets, second.bytes), (2, 1200));
    assert!(second.timestamp >= first.timestamp);
}

#[test]
fn drop_tracing_disabled_emits_nothing() {
    let probe = HostedProbe::new(1);
    probe.set_config(ConfigKey::DetailedTracing, true);
    for len in [0, 19, 20, 1500, u32::MAX] {
        on_kfree_skb(&probe.cpu(0), &Some(len));
    }
    assert!(probe.drain_drop_events().is_empty());
}

#[test]
fn drop_tracing_respects_noise_floor() {
    let probe = HostedProbe::new(1);
    probe.set_config(ConfigKey::DropTracing, true);

    on_kfree_skb(&probe.cpu(0), &Some(19));
    assert!(probe.drain_drop_events().is_empty());

    on_kfree_skb(&probe.cpu(0), &Some(20));
    let events = probe.drain_drop_events();
    assert_eq!(events.len(), 1);
    let event = &events[0];
    assert_eq!(event.reason(), Some(DropReason::KernelInternal));
    assert_eq!(event.direction(), Some(Direction::Uplink));
    assert_eq!(event.pkt_len, 20);
    assert_eq!((event.teid, event.src_ip, event.dst_ip), (0, 0, 0));
    assert_eq!((event.src_port, event.dst_port), (0, 0));
}

#[test]
fn packet_events_need_detailed_tracing() {
    let probe = HostedProbe::new(1);
    probe.set_config(ConfigKey::DropTracing, true);
    let cpu = probe.cpu(0);

    assert!(!emit_packet_event(&cpu, 7, 1, 2, 60, Direction::Downlink, 9));
    assert!(probe.drain_packet_events().is_empty());

    probe.set_config(ConfigKey::DetailedTracing, true);
    assert!(emit_packet_event(&cpu, 7, 1, 2, 60, Direction::Downlink, 9));
    let events = probe.drain_packet_events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].qfi, 9);
    assert_eq!(events[0].direction(), Some(Direction::Downlink));
}

#[test]
fn saturated_channel_keeps_committed_records() {
    let probe =
        HostedProbe::with_rings(1, EventRing::with_capacity(2), EventRing::with_capacity(1));
    let cpu = probe.cpu(0);

    assert!(emit_drop_event(&cpu, 1, 0, 0, 100, DropReason::NoMatchingRule, Direction::Uplink));
    assert!(emit_drop_event(&cpu, 2, 0, 0, 200, DropReason::InvalidTeid, Direction::Downlink));
    assert!(!emit_drop_event(&cpu, 3, 0, 0, 300, DropReason::QosViolation, Direction::Uplink));
    assert_eq!(probe.drop_ring().dropped(), 1);

    let events = probe.drain_drop_events();
    assert_eq!(
        events.iter().map(|e| e.teid).collect::<Vec<_>>(),
        vec![1, 2]
    );
    assert_eq!(events[1].reason(), Some(DropReason::InvalidTeid));
}

#[test]
fn rejected_drops_are_counted() {
    let host =
        HostedProbe::with_rings(1, EventRing::with_capacity(1), EventRing::with_capacity(1));
    let cpu = host.cpu(0);

    assert!(emit_drop_event(&cpu, 1, 0, 0, 100, DropReason::NoMatchingRule, Direction::Uplink));
    for teid in 2..7 {
        let reason = DropReason::NoMatchingRule;
        assert!(!emit_drop_event(&cpu, teid, 0, 0, 100, reason, Direction::Uplink));
    }

    assert_eq!(host.drop_ring().dropped(), 5);
    assert_eq!(host.drain_drop_events().len(), 1);
}

#[test]
fn empty_config_disables_every_gate() {
    let probe = HostedProbe::new(1);
    let cpu = probe.cpu(0);
    on_kfree_skb(&cpu, &Some(1500));
    assert!(!emit_packet_event(&cpu, 1, 0, 0, 1500, Direction::Uplink, 0));
    assert!(probe.drain_drop_events().is_empty());
    assert!(probe.drain_packet_events().is_empty());

    // Counters are never gated.
    on_uplink_entry(&cpu, &Some(1500));
    assert_eq!(probe.direction_totals().uplink.packets, 1);
}

#[test]
fn per_cpu_slots_sum_without_loss() {
    const CPUS: usize = 8;
    const PACKETS: u64 = 10_000;
    let probe = HostedProbe::new(CPUS);

    thread::scope(|s| {
        for cpu in 0..CPUS {
            let ctx = probe.cpu(cpu);
            s.spawn(move || {
                for _ in 0..PACKETS {
                    on_uplink_entry(&ctx, &Some(100));
                    on_downlink_exit(&ctx, &Some(50));
                    record_teid(&ctx, 0xabcd, 100);
                }
            });
        }
    });

    let totals = probe.direction_totals();
    assert_eq!(totals.uplink.packets, (CPUS as u64 * PACKETS) as u128);
    assert_eq!(totals.uplink.bytes, (CPUS as u64 * PACKETS * 100) as u128);
    assert_eq!(totals.downlink.bytes, (CPUS as u64 * PACKETS * 50) as u128);
    for cpu in 0..CPUS {
        assert_eq!(probe.per_cpu(cpu, Direction::Uplink).unwrap().packets, PACKETS);
    }
    assert_eq!(probe.teid_counter(0xabcd).unwrap().packets, CPUS as u64 * PACKETS);
}

#[test]
fn concurrent_drops_never_exceed_ring() {
    let probe =
        HostedProbe::with_rings(4, EventRing::with_capacity(64), EventRing::with_capacity(1));
    probe.set_config(ConfigKey::DropTracing, true);

    thread::scope(|s| {
        for cpu in 0..4 {
            let ctx = probe.cpu(cpu);
            s.spawn(move || {
                for _ in 0..100 {
                    on_kfree_skb(&ctx, &Some(64));
                }
            });
        }
    });

    let events = probe.drain_drop_events();
    assert_eq!(events.len(), 64);
    assert!(events.iter().all(|e| e.pkt_len == 64));
}
