use std::borrow::{Borrow, BorrowMut};
use std::path::Path;

use anyhow::{Context, Result};
use aya::maps::{Array, MapData};
use clap::ValueEnum;

use upf_monitor_common::ConfigKey;

use crate::loader::open_pinned;

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum Toggle {
    On,
    Off,
}

impl Toggle {
    pub fn enabled(self) -> bool {
        self == Toggle::On
    }
}

/// Command-line name of a config slot.
#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum Feature {
    DetailedTracing,
    DropTracing,
}

impl Feature {
    pub fn key(self) -> ConfigKey {
        match self {
            Feature::DetailedTracing => ConfigKey::DetailedTracing,
            Feature::DropTracing => ConfigKey::DropTracing,
        }
    }
}

/// Feature switches the agent writes into `agent_config`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ProbeConfig {
    /// Publish a `PacketEvent` per forwarded packet.
    pub detailed_tracing: bool,
    /// Report `kfree_skb` frees; noisy, off by default.
    pub drop_tracing: bool,
}

impl ProbeConfig {
    pub fn slots(&self) -> [(ConfigKey, u32); 2] {
        [
            (ConfigKey::DetailedTracing, self.detailed_tracing as u32),
            (ConfigKey::DropTracing, self.drop_tracing as u32),
        ]
    }

    pub fn set(&mut self, key: ConfigKey, enabled: bool) {
        match key {
            ConfigKey::DetailedTracing => self.detailed_tracing = enabled,
            ConfigKey::DropTracing => self.drop_tracing = enabled,
        }
    }
}

/// Userspace handle on the `agent_config` array.
pub struct ConfigRegistry<T> {
    array: Array<T, u32>,
}

impl ConfigRegistry<MapData> {
    pub fn from_pin<P: AsRef<Path>>(pin_path: P) -> Result<Self> {
        let map = open_pinned(pin_path.as_ref())?;
        let array = Array::try_from(map).context("config map has unexpected type")?;
        Ok(Self { array })
    }
}

impl<T: Borrow<MapData>> ConfigRegistry<T> {
    pub fn new(array: Array<T, u32>) -> Self {
        Self { array }
    }

    pub fn current(&self) -> Result<ProbeConfig> {
        let mut cfg = ProbeConfig::default();
        for key in [ConfigKey::DetailedTracing, ConfigKey::DropTracing] {
            let raw = self
                .array
                .get(&key.slot(), 0)
                .with_context(|| format!("failed to read config slot {}", key.slot()))?;
            cfg.set(key, raw != 0);
        }
        Ok(cfg)
    }
}

impl<T: BorrowMut<MapData>> ConfigRegistry<T> {
    pub fn set(&mut self, key: ConfigKey, enabled: bool) -> Result<()> {
        self.array
            .set(key.slot(), enabled as u32, 0)
            .with_context(|| format!("failed to write config slot {}", key.slot()))
    }

    pub fn apply(&mut self, cfg: &ProbeConfig) -> Result<()> {
        for (key, value) in cfg.slots() {
            self.set(key, value != 0)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_fail_safe() {
        let cfg = ProbeConfig::default();
        assert_eq!(
            cfg.slots(),
            [(ConfigKey::DetailedTracing, 0), (ConfigKey::DropTracing, 0)]
        );
    }

    #[test]
    fn set_updates_single_switch() {
        let mut cfg = ProbeConfig::default();
        cfg.set(ConfigKey::DropTracing, true);
        assert!(cfg.drop_tracing);
        assert!(!cfg.detailed_tracing);
        assert_eq!(cfg.slots()[1], (ConfigKey::DropTracing, 1));
    }

    #[test]
    fn toggle_maps_to_bool() {
        assert!(Toggle::On.enabled());
        assert!(!Toggle::Off.enabled());
    }

    #[test]
    fn feature_names_parse_to_slots() {
        let feature = Feature::from_str("drop-tracing", false).unwrap();
        assert_eq!(feature.key().slot(), 1);
        let feature = Feature::from_str("detailed-tracing", false).unwrap();
        assert_eq!(feature.key().slot(), 0);
    }
}
