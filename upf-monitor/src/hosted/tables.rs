use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;

use upf_monitor_common::{ConfigKey, Direction, SessionInfo, TrafficCounter, CONFIG_SLOTS};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
#[error("table full ({capacity} entries)")]
pub struct TableFull {
    pub capacity: usize,
}

/// Host copy of `agent_config`. Zero means disabled.
#[derive(Debug, Default)]
pub struct ConfigTable {
    slots: [AtomicU32; CONFIG_SLOTS as usize],
}

impl ConfigTable {
    pub fn get(&self, slot: u32) -> Option<u32> {
        self.slots
            .get(slot as usize)
            .map(|value| value.load(Ordering::Acquire))
    }

    pub fn set(&self, key: ConfigKey, value: u32) {
        self.slots[key.slot() as usize].store(value, Ordering::Release);
    }

    pub fn clear(&self) {
        for slot in &self.slots {
            slot.store(0, Ordering::Release);
        }
    }
}

#[derive(Debug, Default)]
struct CounterCell {
    packets: AtomicU64,
    bytes: AtomicU64,
    timestamp: AtomicU64,
}

impl CounterCell {
    fn snapshot(&self) -> TrafficCounter {
        TrafficCounter {
            packets: self.packets.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            timestamp: self.timestamp.load(Ordering::Relaxed),
        }
    }
}

// One cache line per CPU so neighbouring writers never share a line.
#[repr(C, align(64))]
#[derive(Debug, Default)]
struct CpuSlot {
    directions: [CounterCell; 2],
}

/// Per-CPU direction counters. Each slot has a single writer (its CPU), so
/// updates are plain relaxed load/store pairs.
#[derive(Debug)]
pub struct PerCpuCounters {
    cpus: Box<[CpuSlot]>,
}

impl PerCpuCounters {
    pub fn new(cpus: usize) -> Self {
        Self {
            cpus: (0..cpus).map(|_| CpuSlot::default()).collect(),
        }
    }

    pub fn cpus(&self) -> usize {
        self.cpus.len()
    }

    pub fn record(&self, cpu: usize, direction: Direction, len: u32, now_ns: u64) {
        let Some(slot) = self.cpus.get(cpu) else {
            return;
        };
        let cell = &slot.directions[direction.slot() as usize];
        let packets = cell.packets.load(Ordering::Relaxed);
        cell.packets.store(packets.wrapping_add(1), Ordering::Relaxed);
        let bytes = cell.bytes.load(Ordering::Relaxed);
        cell.bytes.store(bytes.wrapping_add(len as u64), Ordering::Relaxed);
        cell.timestamp.store(now_ns, Ordering::Relaxed);
    }

    pub fn get(&self, cpu: usize, direction: Direction) -> Option<TrafficCounter> {
        self.cpus
            .get(cpu)
            .map(|slot| slot.directions[direction.slot() as usize].snapshot())
    }

    /// Values of one direction slot, one per CPU, in CPU order.
    pub fn values(&self, direction: Direction) -> Vec<TrafficCounter> {
        self.cpus
            .iter()
            .map(|slot| slot.directions[direction.slot() as usize].snapshot())
            .collect()
    }
}

/// Concurrent map that refuses new keys once `capacity` keys are present.
#[derive(Debug)]
pub struct BoundedMap<V> {
    map: DashMap<u32, V>,
    capacity: usize,
    // Keys present plus inserts in flight; never exceeds `capacity`.
    reserved: AtomicUsize,
}

impl<V: Copy> BoundedMap<V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            map: DashMap::with_capacity(capacity),
            capacity,
            reserved: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn get(&self, key: u32) -> Option<V> {
        self.map.get(&key).map(|entry| *entry)
    }

    /// Applies `update` to an existing value or inserts `insert()` for a new key.
    pub fn upsert_with<I, U>(&self, key: u32, insert: I, update: U) -> Result<(), TableFull>
    where
        I: FnOnce() -> V,
        U: FnOnce(&mut V),
    {
        if let Some(mut existing) = self.map.get_mut(&key) {
            update(&mut existing);
            return Ok(());
        }

        if !self.reserve() {
            // Another writer may have created the key while we were looking.
            return match self.map.get_mut(&key) {
                Some(mut existing) => {
                    update(&mut existing);
                    Ok(())
                }
                None => Err(TableFull {
                    capacity: self.capacity,
                }),
            };
        }

        match self.map.entry(key) {
            Entry::Occupied(mut entry) => {
                self.reserved.fetch_sub(1, Ordering::AcqRel);
                update(entry.get_mut());
            }
            Entry::Vacant(entry) => {
                entry.insert(insert());
            }
        }
        Ok(())
    }

    pub fn remove(&self, key: u32) -> Option<V> {
        self.map.remove(&key).map(|(_, value)| {
            self.reserved.fetch_sub(1, Ordering::AcqRel);
            value
        })
    }

    /// Entries sorted by key.
    pub fn entries(&self) -> Vec<(u32, V)> {
        let mut entries: Vec<(u32, V)> = self
            .map
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect();
        entries.sort_by_key(|(key, _)| *key);
        entries
    }

    fn reserve(&self) -> bool {
        self.reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.capacity).then_some(n + 1)
            })
            .is_ok()
    }
}

/// Host copy of `teid_stats` with exact insert-or-increment.
#[derive(Debug)]
pub struct TeidTable(BoundedMap<TrafficCounter>);

impl TeidTable {
    pub fn new(capacity: usize) -> Self {
        Self(BoundedMap::new(capacity))
    }

    pub fn record(&self, teid: u32, len: u32, now_ns: u64) -> Result<(), TableFull> {
        self.0.upsert_with(
            teid,
            || TrafficCounter::first_seen(len, now_ns),
            |counter| counter.record(len, now_ns),
        )
    }

    pub fn get(&self, teid: u32) -> Option<TrafficCounter> {
        self.0.get(teid)
    }

    pub fn entries(&self) -> Vec<(u32, TrafficCounter)> {
        self.0.entries()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Host copy of `teid_sessions`.
#[derive(Debug)]
pub struct SessionTable(BoundedMap<SessionInfo>);

impl SessionTable {
    pub fn new(capacity: usize) -> Self {
        Self(BoundedMap::new(capacity))
    }

    pub fn upsert(&self, teid: u32, info: SessionInfo) -> Result<(), TableFull> {
        self.0.upsert_with(teid, || info, |existing| *existing = info)
    }

    pub fn get(&self, teid: u32) -> Option<SessionInfo> {
        self.0.get(teid)
    }

    pub fn remove(&self, teid: u32) -> Option<SessionInfo> {
        self.0.remove(teid)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
