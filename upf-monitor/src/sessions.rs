use std::borrow::{Borrow, BorrowMut};
use std::fmt;
use std::io;
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use aya::maps::{HashMap, MapData, MapError};

use upf_monitor_common::SessionInfo;

use crate::loader::open_pinned;
use crate::stats::{ipv4_from_raw, ipv4_to_raw};

/// Builds a `teid_sessions` value stamped with the current wall-clock time.
pub fn session_info(seid: u64, ue_ip: Ipv4Addr, upf_ip: Ipv4Addr) -> SessionInfo {
    let created_at = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    SessionInfo {
        seid,
        ue_ip: ipv4_to_raw(ue_ip),
        upf_ip: ipv4_to_raw(upf_ip),
        created_at,
    }
}

pub struct SessionLine<'a>(pub u32, pub &'a SessionInfo);

impl fmt::Display for SessionLine<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let SessionLine(teid, info) = self;
        write!(
            f,
            "teid=0x{:08x} seid=0x{:x} ue={} upf={} created_at={}",
            teid,
            info.seid,
            ipv4_from_raw(info.ue_ip),
            ipv4_from_raw(info.upf_ip),
            info.created_at
        )
    }
}

/// Writer for `teid_sessions`, driven by the PFCP side of the deployment.
pub struct SessionRegistry<T> {
    map: HashMap<T, u32, SessionInfo>,
}

impl SessionRegistry<MapData> {
    pub fn from_pin<P: AsRef<Path>>(pin_path: P) -> Result<Self> {
        let map = open_pinned(pin_path.as_ref())?;
        let map = HashMap::try_from(map).context("session map has unexpected type")?;
        Ok(Self { map })
    }
}

impl<T: Borrow<MapData>> SessionRegistry<T> {
    pub fn new(map: HashMap<T, u32, SessionInfo>) -> Self {
        Self { map }
    }

    pub fn get(&self, teid: u32) -> Result<Option<SessionInfo>> {
        match self.map.get(&teid, 0) {
            Ok(info) => Ok(Some(info)),
            Err(MapError::KeyNotFound) => Ok(None),
            Err(err) => Err(err).with_context(|| format!("failed to look up teid 0x{teid:08x}")),
        }
    }

    pub fn list(&self) -> Result<Vec<(u32, SessionInfo)>> {
        let mut sessions = Vec::new();
        for item in self.map.iter() {
            let (teid, info) = item.map_err(|e| anyhow!("teid_sessions iter error: {}", e))?;
            sessions.push((teid, info));
        }
        sessions.sort_by_key(|(teid, _)| *teid);
        Ok(sessions)
    }
}

impl<T: BorrowMut<MapData>> SessionRegistry<T> {
    /// Fails once the map holds `MAX_SESSIONS` other TEIDs.
    pub fn upsert(&mut self, teid: u32, info: SessionInfo) -> Result<()> {
        self.map
            .insert(teid, info, 0)
            .with_context(|| format!("failed to store session for teid 0x{teid:08x}"))
    }

    /// Returns whether an entry was removed.
    pub fn remove(&mut self, teid: u32) -> Result<bool> {
        match self.map.remove(&teid) {
            Ok(()) => Ok(true),
            Err(MapError::SyscallError(err)) if err.io_error.kind() == io::ErrorKind::NotFound => {
                Ok(false)
            }
            Err(err) => Err(err).with_context(|| format!("failed to remove teid 0x{teid:08x}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_info_stores_network_order() {
        let info = session_info(7, Ipv4Addr::new(10, 60, 0, 1), Ipv4Addr::new(10, 100, 200, 3));
        assert_eq!(info.seid, 7);
        assert_eq!(info.ue_ip.to_ne_bytes(), [10, 60, 0, 1]);
        assert_eq!(info.upf_ip.to_ne_bytes(), [10, 100, 200, 3]);
        assert!(info.created_at > 0);
    }

    #[test]
    fn session_line_renders_addresses() {
        let info = SessionInfo {
            seid: 0x1f,
            ue_ip: ipv4_to_raw(Ipv4Addr::new(10, 60, 0, 9)),
            upf_ip: ipv4_to_raw(Ipv4Addr::new(10, 100, 200, 3)),
            created_at: 12,
        };
        assert_eq!(
            SessionLine(0xbeef, &info).to_string(),
            "teid=0x0000beef seid=0x1f ue=10.60.0.9 upf=10.100.200.3 created_at=12"
        );
    }
}
