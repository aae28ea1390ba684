use std::borrow::BorrowMut;
use std::collections::BTreeMap;
use std::fmt;

use aya::maps::{MapData, RingBuf};
use log::{debug, warn};

use upf_monitor_common::{DropEvent, PacketEvent};

use crate::stats::ipv4_from_raw;

/// Pops every record currently committed to `ring`.
pub fn drain_ring<T, F>(ring: &mut RingBuf<T>, mut on_record: F) -> usize
where
    T: BorrowMut<MapData>,
    F: FnMut(&[u8]),
{
    let mut drained = 0;
    while let Some(item) = ring.next() {
        on_record(&item);
        drained += 1;
    }
    drained
}

pub struct DropLine<'a>(pub &'a DropEvent);

impl fmt::Display for DropLine<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let event = self.0;
        write!(
            f,
            "reason={} direction={} teid=0x{:x} src={} dst={} len={}",
            event.reason().map_or("unknown", |r| r.as_str()),
            event.direction().map_or("unknown", |d| d.as_str()),
            event.teid,
            ipv4_from_raw(event.src_ip),
            ipv4_from_raw(event.dst_ip),
            event.pkt_len
        )
    }
}

pub struct PacketLine<'a>(pub &'a PacketEvent);

impl fmt::Display for PacketLine<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let event = self.0;
        write!(
            f,
            "direction={} teid=0x{:x} src={} dst={} len={} qfi={}",
            event.direction().map_or("unknown", |d| d.as_str()),
            event.teid,
            ipv4_from_raw(event.src_ip),
            ipv4_from_raw(event.dst_ip),
            event.pkt_len,
            event.qfi
        )
    }
}

/// Drop counts keyed by (reason label, direction label).
#[derive(Debug, Default)]
pub struct DropTally {
    counts: BTreeMap<(&'static str, &'static str), u64>,
}

impl DropTally {
    pub fn record(&mut self, event: &DropEvent) {
        let reason = event.reason().map_or("unknown", |r| r.as_str());
        let direction = event.direction().map_or("unknown", |d| d.as_str());
        *self.counts.entry((reason, direction)).or_insert(0) += 1;
    }

    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    pub fn get(&self, reason: &str, direction: &str) -> u64 {
        self.counts
            .iter()
            .find(|((r, d), _)| *r == reason && *d == direction)
            .map_or(0, |(_, count)| *count)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &'static str, u64)> + '_ {
        self.counts.iter().map(|((r, d), count)| (*r, *d, *count))
    }
}

/// Consumer side of both ring buffers.
#[derive(Debug, Default)]
pub struct EventHandler {
    pub drops: DropTally,
    pub packets: u64,
    pub malformed: u64,
}

impl EventHandler {
    pub fn on_drop_record(&mut self, raw: &[u8]) {
        match DropEvent::from_bytes(raw) {
            Some(event) => {
                warn!("[DROP] {}", DropLine(&event));
                self.drops.record(&event);
            }
            None => {
                self.malformed += 1;
                debug!("discarding {} byte drop record", raw.len());
            }
        }
    }

    pub fn on_packet_record(&mut self, raw: &[u8]) {
        match PacketEvent::from_bytes(raw) {
            Some(event) => {
                debug!("[PKT] {}", PacketLine(&event));
                self.packets += 1;
            }
            None => {
                self.malformed += 1;
                debug!("discarding {} byte packet record", raw.len());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use upf_monitor_common::{Direction, DropReason};

    use crate::stats::ipv4_to_raw;

    fn drop_event(reason: DropReason, direction: Direction) -> DropEvent {
        DropEvent {
            timestamp: 1,
            teid: 0x2a,
            src_ip: ipv4_to_raw(Ipv4Addr::new(10, 60, 0, 1)),
            dst_ip: ipv4_to_raw(Ipv4Addr::new(8, 8, 8, 8)),
            pkt_len: 84,
            reason: reason as u8,
            direction: direction as u8,
            ..Default::default()
        }
    }

    fn encode(event: &DropEvent) -> Vec<u8> {
        let mut buf = vec![0u8; DropEvent::LEN];
        buf[0..8].copy_from_slice(&event.timestamp.to_ne_bytes());
        buf[8..12].copy_from_slice(&event.teid.to_ne_bytes());
        buf[12..16].copy_from_slice(&event.src_ip.to_ne_bytes());
        buf[16..20].copy_from_slice(&event.dst_ip.to_ne_bytes());
        buf[24..28].copy_from_slice(&event.pkt_len.to_ne_bytes());
        buf[28] = event.reason;
        buf[29] = event.direction;
        buf
    }

    #[test]
    fn drop_line_names_reason_and_addresses() {
        let event = drop_event(DropReason::InvalidTeid, Direction::Downlink);
        assert_eq!(
            DropLine(&event).to_string(),
            "reason=invalid_teid direction=downlink teid=0x2a src=10.60.0.1 dst=8.8.8.8 len=84"
        );
    }

    #[test]
    fn unknown_codes_render_as_unknown() {
        let mut event = drop_event(DropReason::KernelInternal, Direction::Uplink);
        event.reason = 9;
        event.direction = 7;
        assert!(DropLine(&event)
            .to_string()
            .starts_with("reason=unknown direction=unknown"));
    }

    #[test]
    fn handler_tallies_by_reason_and_direction() {
        let mut handler = EventHandler::default();
        let kernel_up = encode(&drop_event(DropReason::KernelInternal, Direction::Uplink));
        let qos_down = encode(&drop_event(DropReason::QosViolation, Direction::Downlink));
        handler.on_drop_record(&kernel_up);
        handler.on_drop_record(&kernel_up);
        handler.on_drop_record(&qos_down);

        assert_eq!(handler.drops.total(), 3);
        assert_eq!(handler.drops.get("kernel_drop", "uplink"), 2);
        assert_eq!(handler.drops.get("qos_violation", "downlink"), 1);
        assert_eq!(handler.drops.get("no_pdr_match", "uplink"), 0);
        assert_eq!(handler.malformed, 0);
    }

    #[test]
    fn handler_counts_short_records_as_malformed() {
        let mut handler = EventHandler::default();
        handler.on_drop_record(&[0u8; 12]);
        handler.on_packet_record(&[0u8; 4]);
        handler.on_packet_record(&[0u8; 32]);
        assert_eq!(handler.malformed, 2);
        assert_eq!(handler.packets, 1);
        assert_eq!(handler.drops.total(), 0);
    }
}
