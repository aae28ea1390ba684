use std::{
    fs, io,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, ensure, Context, Result};
use aya::maps::{Map, MapData};
use aya::pin::PinError;
use aya::programs::{KProbe, TracePoint};
use aya::{Ebpf, EbpfLoader};
use log::{debug, info, warn};

use upf_monitor_common::{
    MAP_AGENT_CONFIG, MAP_TEID_SESSIONS, MAP_TEID_STATS, MAP_TRAFFIC_STATS, PROG_DOWNLINK_EXIT,
    PROG_KFREE_SKB, PROG_UPLINK_ENTRY,
};

use crate::config::ProbeConfig;

#[cfg(feature = "embed-ebpf")]
const EBPF_BYTES: &[u8] = aya::include_bytes_aligned!(concat!(env!("OUT_DIR"), "/upf-monitor"));

const SKB_LEN_GLOBAL: &str = "SKB_LEN_OFFSET";

pub const DEFAULT_PIN_DIR: &str = "/sys/fs/bpf/upf_monitor";

/// Maps shared with the `stats`, `config` and `session` subcommands.
pub const PINNED_MAPS: [&str; 4] = [
    MAP_TRAFFIC_STATS,
    MAP_TEID_STATS,
    MAP_TEID_SESSIONS,
    MAP_AGENT_CONFIG,
];

#[derive(Clone, Debug)]
pub struct ProbeOptions {
    /// Compiled eBPF object; `None` uses the embedded one.
    pub object: Option<PathBuf>,
    pub pin_dir: PathBuf,
    pub skb_len_offset: u32,
    pub config: ProbeConfig,
}

enum Hook {
    KProbe {
        program: &'static str,
        function: &'static str,
    },
    TracePoint {
        program: &'static str,
        category: &'static str,
        name: &'static str,
    },
}

const HOOKS: [Hook; 3] = [
    Hook::KProbe {
        program: PROG_UPLINK_ENTRY,
        function: "gtp5g_encap_recv",
    },
    Hook::KProbe {
        program: PROG_DOWNLINK_EXIT,
        function: "gtp5g_dev_xmit",
    },
    Hook::TracePoint {
        program: PROG_KFREE_SKB,
        category: "skb",
        name: "kfree_skb",
    },
];

pub fn pin_path(pin_dir: &Path, map_name: &str) -> PathBuf {
    pin_dir.join(map_name)
}

/// Opens a map pinned by a running agent.
pub fn open_pinned(path: &Path) -> Result<Map> {
    let map_data = MapData::from_pin(path)
        .map_err(|e| anyhow!("failed to open pinned map {}: {}", path.display(), e))?;
    Map::from_map_data(map_data).map_err(|e| anyhow!("invalid map type: {}", e))
}

pub fn validate_options(opts: &ProbeOptions) -> Result<()> {
    ensure!(
        opts.skb_len_offset % 4 == 0,
        "skb len offset {} is not 4-byte aligned",
        opts.skb_len_offset
    );
    ensure!(
        opts.skb_len_offset < 1024,
        "skb len offset {} is outside struct sk_buff",
        opts.skb_len_offset
    );
    if let Some(object) = &opts.object {
        ensure!(
            object.is_file(),
            "eBPF object {} does not exist",
            object.display()
        );
    }
    Ok(())
}

pub fn bump_memlock_rlimit() {
    // Older kernels account BPF memory against RLIMIT_MEMLOCK.
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        debug!("remove limit on locked memory failed, ret is: {ret}");
    }
}

pub fn load_probes(opts: &ProbeOptions) -> Result<Ebpf> {
    let mut loader = EbpfLoader::new();
    loader.set_global(SKB_LEN_GLOBAL, &opts.skb_len_offset, true);
    match &opts.object {
        Some(path) => loader
            .load_file(path)
            .with_context(|| format!("failed to load eBPF object {}", path.display())),
        None => load_embedded(&mut loader),
    }
}

#[cfg(feature = "embed-ebpf")]
fn load_embedded(loader: &mut EbpfLoader<'_>) -> Result<Ebpf> {
    loader
        .load(EBPF_BYTES)
        .context("failed to load embedded eBPF object")
}

#[cfg(not(feature = "embed-ebpf"))]
fn load_embedded(_loader: &mut EbpfLoader<'_>) -> Result<Ebpf> {
    anyhow::bail!("no eBPF object embedded in this build; pass --object or enable the embed-ebpf feature")
}

/// Loads and attaches all three hooks. A missing kernel symbol fails here.
pub fn attach_hooks(bpf: &mut Ebpf) -> Result<()> {
    for hook in &HOOKS {
        match *hook {
            Hook::KProbe { program, function } => attach_kprobe(bpf, program, function)?,
            Hook::TracePoint {
                program,
                category,
                name,
            } => attach_tracepoint(bpf, program, category, name)?,
        }
    }
    Ok(())
}

fn attach_kprobe(bpf: &mut Ebpf, program_name: &str, function: &str) -> Result<()> {
    let program: &mut KProbe = bpf
        .program_mut(program_name)
        .with_context(|| format!("program {program_name} not found"))?
        .try_into()
        .with_context(|| format!("program {program_name} is not a kprobe"))?;
    program
        .load()
        .with_context(|| format!("failed to load kprobe {program_name}"))?;
    program
        .attach(function, 0)
        .with_context(|| format!("failed to attach kprobe to {function}; is gtp5g loaded?"))?;
    info!("attached kprobe/{function}");
    Ok(())
}

fn attach_tracepoint(bpf: &mut Ebpf, program_name: &str, category: &str, name: &str) -> Result<()> {
    let program: &mut TracePoint = bpf
        .program_mut(program_name)
        .with_context(|| format!("program {program_name} not found"))?
        .try_into()
        .with_context(|| format!("program {program_name} is not a tracepoint"))?;
    program
        .load()
        .with_context(|| format!("failed to load tracepoint {program_name}"))?;
    program
        .attach(category, name)
        .with_context(|| format!("failed to attach tracepoint {category}/{name}"))?;
    info!("attached tracepoint/{category}/{name}");
    Ok(())
}

pub fn pin_maps(bpf: &mut Ebpf, pin_dir: &Path) -> Result<()> {
    for map_name in PINNED_MAPS {
        pin_map(bpf, map_name, &pin_path(pin_dir, map_name))?;
    }
    Ok(())
}

fn pin_map(bpf: &mut Ebpf, map_name: &str, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let map = bpf
        .map_mut(map_name)
        .with_context(|| format!("map {map_name} not found"))?;
    pin_replacing(path, |path| map.pin(path).map_err(pin_io_error))
        .with_context(|| format!("failed to pin map {map_name} at {}", path.display()))
}

fn pin_io_error(err: PinError) -> io::Error {
    match err {
        PinError::SyscallError(err) => err.io_error,
        other => io::Error::other(other.to_string()),
    }
}

/// Runs `pin`, and if a pin from an earlier run holds `path`, removes it and
/// pins again. Tools opening `path` then see the maps of this run.
fn pin_replacing<F>(path: &Path, mut pin: F) -> io::Result<()>
where
    F: FnMut(&Path) -> io::Result<()>,
{
    match pin(path) {
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
            warn!("replacing stale pin {}", path.display());
            fs::remove_file(path)?;
            pin(path)
        }
        result => result,
    }
}

/// Removes the pins left by [`pin_maps`]; already-missing pins are ignored.
pub fn unpin_maps(pin_dir: &Path) -> Result<()> {
    for map_name in PINNED_MAPS {
        let path = pin_path(pin_dir, map_name);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err).with_context(|| format!("failed to unpin {}", path.display()))
            }
        }
    }
    match fs::remove_dir(pin_dir) {
        Ok(()) => Ok(()),
        // Something else still lives in the directory, or it is already gone.
        Err(err)
            if err.kind() == io::ErrorKind::NotFound
                || err.raw_os_error() == Some(libc::ENOTEMPTY) =>
        {
            Ok(())
        }
        Err(err) => Err(err).with_context(|| format!("failed to remove {}", pin_dir.display())),
    }
}
