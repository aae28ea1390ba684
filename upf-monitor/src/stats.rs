use std::borrow::Borrow;
use std::net::Ipv4Addr;

use anyhow::{anyhow, Context, Result};
use aya::maps::{HashMap, MapData, PerCpuArray, PerCpuValues};
use chrono::Utc;
use serde_json::{Map as JsonMap, Number as JsonNumber, Value};

use upf_monitor_common::{Direction, SessionInfo, TrafficCounter};

/// Cross-CPU sum of one direction slot.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Totals {
    pub packets: u128,
    pub bytes: u128,
    /// Most recent update seen on any CPU.
    pub last_seen_ns: u64,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct DirectionTotals {
    pub uplink: Totals,
    pub downlink: Totals,
}

impl DirectionTotals {
    pub fn get(&self, direction: Direction) -> &Totals {
        match direction {
            Direction::Uplink => &self.uplink,
            Direction::Downlink => &self.downlink,
        }
    }
}

pub fn sum_counters<'a, I>(values: I) -> Totals
where
    I: IntoIterator<Item = &'a TrafficCounter>,
{
    let mut totals = Totals::default();
    for v in values {
        totals.bytes = totals.bytes.wrapping_add(v.bytes as u128);
        totals.packets = totals.packets.wrapping_add(v.packets as u128);
        totals.last_seen_ns = totals.last_seen_ns.max(v.timestamp);
    }
    totals
}

/// Reads both direction slots of `traffic_stats` and folds the per-CPU copies.
pub fn read_direction_totals<T: Borrow<MapData>>(
    map: &PerCpuArray<T, TrafficCounter>,
) -> Result<DirectionTotals> {
    let read = |direction: Direction| -> Result<Totals> {
        let per_cpu: PerCpuValues<TrafficCounter> = map
            .get(&direction.slot(), 0)
            .with_context(|| format!("failed to read {} counters", direction.as_str()))?;
        Ok(sum_counters(per_cpu.iter()))
    };
    Ok(DirectionTotals {
        uplink: read(Direction::Uplink)?,
        downlink: read(Direction::Downlink)?,
    })
}

pub fn read_teid_counters<T: Borrow<MapData>>(
    map: &HashMap<T, u32, TrafficCounter>,
) -> Result<Vec<(u32, TrafficCounter)>> {
    let mut entries = Vec::new();
    for item in map.iter() {
        let (teid, counter) = item.map_err(|e| anyhow!("teid_stats iter error: {}", e))?;
        entries.push((teid, counter));
    }
    entries.sort_by_key(|(teid, _)| *teid);
    Ok(entries)
}

/// Change in totals between two consecutive reports.
#[derive(Debug, Default)]
pub struct DeltaTracker {
    previous: Option<DirectionTotals>,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Delta {
    pub packets: u128,
    pub bytes: u128,
}

impl DeltaTracker {
    pub fn update(&mut self, current: DirectionTotals) -> (Delta, Delta) {
        let previous = self.previous.replace(current).unwrap_or_default();
        (
            delta(&previous.uplink, &current.uplink),
            delta(&previous.downlink, &current.downlink),
        )
    }
}

fn delta(previous: &Totals, current: &Totals) -> Delta {
    // A redeploy resets the maps; treat the new value as the whole delta.
    if current.packets < previous.packets {
        return Delta {
            packets: current.packets,
            bytes: current.bytes,
        };
    }
    Delta {
        packets: current.packets - previous.packets,
        bytes: current.bytes.saturating_sub(previous.bytes),
    }
}

pub fn format_bytes(bytes: u128) -> String {
    const KB: u128 = 1024;
    const MB: u128 = KB * 1024;
    const GB: u128 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}

/// Map-side IPv4 addresses are stored in network byte order.
pub fn ipv4_from_raw(raw: u32) -> Ipv4Addr {
    Ipv4Addr::from(raw.to_ne_bytes())
}

pub fn ipv4_to_raw(addr: Ipv4Addr) -> u32 {
    u32::from_ne_bytes(addr.octets())
}

/// JSON document printed by `stats` and logged by the agent at debug level.
pub fn snapshot_json<F>(
    totals: &DirectionTotals,
    teids: &[(u32, TrafficCounter)],
    mut session_for: F,
) -> Value
where
    F: FnMut(u32) -> Option<SessionInfo>,
{
    let mut directions = JsonMap::new();
    for direction in [Direction::Uplink, Direction::Downlink] {
        let t = totals.get(direction);
        let mut obj = JsonMap::new();
        obj.insert("packets".to_string(), value_from_u128(t.packets));
        obj.insert("bytes".to_string(), value_from_u128(t.bytes));
        obj.insert("last_seen_ns".to_string(), Value::from(t.last_seen_ns));
        directions.insert(direction.as_str().to_string(), Value::Object(obj));
    }

    let mut tunnels = Vec::with_capacity(teids.len());
    for (teid, counter) in teids {
        let mut obj = JsonMap::new();
        obj.insert("teid".to_string(), Value::String(format!("0x{teid:08x}")));
        obj.insert("packets".to_string(), Value::from(counter.packets));
        obj.insert("bytes".to_string(), Value::from(counter.bytes));
        obj.insert("last_seen_ns".to_string(), Value::from(counter.timestamp));
        if let Some(session) = session_for(*teid) {
            obj.insert("seid".to_string(), Value::String(format!("0x{:x}", session.seid)));
            obj.insert(
                "ue_ip".to_string(),
                Value::String(ipv4_from_raw(session.ue_ip).to_string()),
            );
            obj.insert(
                "upf_ip".to_string(),
                Value::String(ipv4_from_raw(session.upf_ip).to_string()),
            );
        }
        tunnels.push(Value::Object(obj));
    }

    let mut root = JsonMap::new();
    root.insert(
        "collected_at".to_string(),
        Value::String(Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()),
    );
    root.insert("traffic".to_string(), Value::Object(directions));
    root.insert("teids".to_string(), Value::Array(tunnels));
    Value::Object(root)
}

fn value_from_u128(n: u128) -> Value {
    if n <= u64::MAX as u128 {
        Value::Number(JsonNumber::from(n as u64))
    } else {
        Value::String(n.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Number as JsonNumber;

    fn counter(packets: u64, bytes: u64, timestamp: u64) -> TrafficCounter {
        TrafficCounter {
            packets,
            bytes,
            timestamp,
        }
    }

    #[test]
    fn sum_counters_accumulates_multiple_cpus() {
        let cpus = vec![counter(2, 100, 10), counter(1, 50, 30)];
        let totals = sum_counters(cpus.iter());
        assert_eq!(totals.bytes, 150);
        assert_eq!(totals.packets, 3);
        assert_eq!(totals.last_seen_ns, 30);
    }

    #[test]
    fn sum_counters_handles_large_values() {
        let cpus = vec![counter(u64::MAX, u64::MAX, 0), counter(1, 1, 0)];
        let totals = sum_counters(cpus.iter());
        assert_eq!(totals.bytes, (u64::MAX as u128) + 1);
        assert_eq!(totals.packets, (u64::MAX as u128) + 1);
    }

    #[test]
    fn value_from_u128_formats_numbers() {
        match value_from_u128(42) {
            Value::Number(n) => assert_eq!(n, JsonNumber::from(42)),
            other => panic!("unexpected value: {other:?}"),
        }

        let big = (u64::MAX as u128) + 5;
        match value_from_u128(big) {
            Value::String(s) => assert_eq!(s, big.to_string()),
            other => panic!("expected string, got {other:?}"),
        }
    }

    #[test]
    fn deltas_track_consecutive_reports() {
        let mut tracker = DeltaTracker::default();
        let mut totals = DirectionTotals::default();
        totals.uplink.packets = 10;
        totals.uplink.bytes = 1000;
        let (up, down) = tracker.update(totals);
        assert_eq!(up, Delta { packets: 10, bytes: 1000 });
        assert_eq!(down, Delta::default());

        totals.uplink.packets = 15;
        totals.uplink.bytes = 1600;
        totals.downlink.packets = 1;
        totals.downlink.bytes = 64;
        let (up, down) = tracker.update(totals);
        assert_eq!(up, Delta { packets: 5, bytes: 600 });
        assert_eq!(down, Delta { packets: 1, bytes: 64 });
    }

    #[test]
    fn deltas_restart_after_reset() {
        let mut tracker = DeltaTracker::default();
        let mut totals = DirectionTotals::default();
        totals.uplink.packets = 100;
        totals.uplink.bytes = 9000;
        tracker.update(totals);

        totals.uplink.packets = 3;
        totals.uplink.bytes = 300;
        let (up, _) = tracker.update(totals);
        assert_eq!(up, Delta { packets: 3, bytes: 300 });
    }

    #[test]
    fn format_bytes_picks_unit() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.00 MB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.00 GB");
    }

    #[test]
    fn raw_addresses_keep_network_order() {
        let addr = Ipv4Addr::new(10, 60, 0, 1);
        let raw = ipv4_to_raw(addr);
        assert_eq!(raw.to_ne_bytes(), [10, 60, 0, 1]);
        assert_eq!(ipv4_from_raw(raw), addr);
    }

    #[test]
    fn snapshot_joins_sessions() {
        let totals = DirectionTotals {
            uplink: Totals {
                packets: 4,
                bytes: 400,
                last_seen_ns: 9,
            },
            downlink: Totals::default(),
        };
        let teids = vec![(0x10, counter(4, 400, 9)), (0x20, counter(1, 60, 3))];
        let snapshot = snapshot_json(&totals, &teids, |teid| {
            (teid == 0x10).then(|| SessionInfo {
                seid: 0xabc,
                ue_ip: ipv4_to_raw(Ipv4Addr::new(10, 60, 0, 1)),
                upf_ip: ipv4_to_raw(Ipv4Addr::new(192, 168, 0, 10)),
                created_at: 0,
            })
        });

        assert_eq!(snapshot["traffic"]["uplink"]["packets"], 4);
        assert_eq!(snapshot["traffic"]["downlink"]["bytes"], 0);
        assert_eq!(snapshot["teids"][0]["teid"], "0x00000010");
        assert_eq!(snapshot["teids"][0]["ue_ip"], "10.60.0.1");
        assert_eq!(snapshot["teids"][0]["seid"], "0xabc");
        assert!(snapshot["teids"][1].get("seid").is_none());
    }
}
