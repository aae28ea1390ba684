use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::exit;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, CommandFactory, Parser, Subcommand};
use log::info;

use upf_monitor::agent::{pinned_snapshot, run_agent, AgentOptions};
use upf_monitor::config::{ConfigRegistry, Feature, ProbeConfig, Toggle};
use upf_monitor::loader::{pin_path, ProbeOptions, DEFAULT_PIN_DIR};
use upf_monitor::sessions::{session_info, SessionLine, SessionRegistry};
use upf_monitor_common::{DEFAULT_SKB_LEN_OFFSET, MAP_AGENT_CONFIG, MAP_TEID_SESSIONS};

#[derive(Parser)]
#[command(name = "upf-monitor")]
#[command(about = "eBPF traffic and drop telemetry for the gtp5g user plane", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Load and attach the probes, then report until Ctrl+C
    Run(RunCommand),
    /// Print a JSON snapshot of the pinned counters
    Stats(PinArgs),
    /// Read or change runtime feature switches
    Config(ConfigCommand),
    /// Manage TEID to session mappings
    Session(SessionCommand),
}

#[derive(Args)]
struct PinArgs {
    /// bpffs directory holding the pinned maps
    #[arg(long, value_name = "DIR", default_value = DEFAULT_PIN_DIR)]
    pin_dir: PathBuf,
}

#[derive(Args)]
struct RunCommand {
    /// Compiled eBPF object; required unless built with the embed-ebpf feature
    #[arg(long, value_name = "PATH")]
    object: Option<PathBuf>,
    #[command(flatten)]
    pins: PinArgs,
    /// Byte offset of `len` in the running kernel's struct sk_buff
    #[arg(long, value_name = "BYTES", default_value_t = DEFAULT_SKB_LEN_OFFSET)]
    skb_len_offset: u32,
    /// Publish one event per forwarded packet
    #[arg(long, value_enum, default_value_t = Toggle::Off)]
    detailed_tracing: Toggle,
    /// Report kernel packet frees
    #[arg(long, value_enum, default_value_t = Toggle::Off)]
    drop_tracing: Toggle,
    /// Seconds between traffic reports
    #[arg(long, default_value_t = 1)]
    report_interval_secs: u64,
    /// Keep the pinned maps after exit
    #[arg(long, action = ArgAction::SetTrue)]
    keep_pins: bool,
}

#[derive(Args)]
struct ConfigCommand {
    #[command(flatten)]
    pins: PinArgs,
    #[command(subcommand)]
    action: ConfigAction,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show the current switches
    Get,
    /// Flip one switch on the running probes
    Set {
        #[arg(value_enum)]
        feature: Feature,
        #[arg(value_enum)]
        value: Toggle,
    },
}

#[derive(Args)]
struct SessionCommand {
    #[command(flatten)]
    pins: PinArgs,
    #[command(subcommand)]
    action: SessionAction,
}

#[derive(Subcommand)]
enum SessionAction {
    /// Add or replace the session for a TEID
    Put {
        #[arg(value_parser = parse_u32)]
        teid: u32,
        #[arg(long, value_parser = parse_u64)]
        seid: u64,
        #[arg(long)]
        ue_ip: Ipv4Addr,
        #[arg(long)]
        upf_ip: Ipv4Addr,
    },
    /// Forget the session for a TEID
    Rm {
        #[arg(value_parser = parse_u32)]
        teid: u32,
    },
    /// List every known session
    List,
}

fn parse_u32(raw: &str) -> Result<u32, String> {
    let value = parse_u64(raw)?;
    u32::try_from(value).map_err(|_| format!("{raw} does not fit in 32 bits"))
}

/// Accepts decimal or `0x`-prefixed hex.
fn parse_u64(raw: &str) -> Result<u64, String> {
    let parsed = match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => raw.parse(),
    };
    parsed.map_err(|err| format!("invalid number {raw}: {err}"))
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if let Err(err) = run().await {
        eprintln!("upf-monitor error: {err:?}");
        exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Run(cmd)) => {
            let opts = AgentOptions {
                probe: ProbeOptions {
                    object: cmd.object,
                    pin_dir: cmd.pins.pin_dir,
                    skb_len_offset: cmd.skb_len_offset,
                    config: ProbeConfig {
                        detailed_tracing: cmd.detailed_tracing.enabled(),
                        drop_tracing: cmd.drop_tracing.enabled(),
                    },
                },
                report_interval: Duration::from_secs(cmd.report_interval_secs.max(1)),
                keep_pins: cmd.keep_pins,
            };
            run_agent(opts).await?;
        }
        Some(Commands::Stats(pins)) => {
            let snapshot = pinned_snapshot(&pins.pin_dir)?;
            let rendered =
                serde_json::to_string_pretty(&snapshot).context("failed to render snapshot")?;
            println!("{rendered}");
        }
        Some(Commands::Config(cmd)) => {
            let mut registry =
                ConfigRegistry::from_pin(pin_path(&cmd.pins.pin_dir, MAP_AGENT_CONFIG))?;
            match cmd.action {
                ConfigAction::Get => {
                    let cfg = registry.current()?;
                    println!("detailed-tracing: {}", on_off(cfg.detailed_tracing));
                    println!("drop-tracing: {}", on_off(cfg.drop_tracing));
                }
                ConfigAction::Set { feature, value } => {
                    registry.set(feature.key(), value.enabled())?;
                    info!("{feature:?} set to {}", on_off(value.enabled()));
                }
            }
        }
        Some(Commands::Session(cmd)) => {
            let mut registry =
                SessionRegistry::from_pin(pin_path(&cmd.pins.pin_dir, MAP_TEID_SESSIONS))?;
            match cmd.action {
                SessionAction::Put {
                    teid,
                    seid,
                    ue_ip,
                    upf_ip,
                } => {
                    let info = session_info(seid, ue_ip, upf_ip);
                    registry.upsert(teid, info)?;
                    println!("{}", SessionLine(teid, &info));
                }
                SessionAction::Rm { teid } => {
                    if !registry.remove(teid)? {
                        println!("no session for teid 0x{teid:08x}");
                    }
                }
                SessionAction::List => {
                    for (teid, info) in registry.list()? {
                        println!("{}", SessionLine(teid, &info));
                    }
                }
            }
        }
        None => {
            Cli::command().print_help().ok();
            println!();
        }
    }

    Ok(())
}

fn on_off(enabled: bool) -> &'static str {
    if enabled {
        "on"
    } else {
        "off"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn numbers_accept_hex_and_decimal() {
        assert_eq!(parse_u32("0x2a"), Ok(42));
        assert_eq!(parse_u32("42"), Ok(42));
        assert_eq!(parse_u64("0XFFFFFFFFFF"), Ok(0xff_ffff_ffff));
        assert!(parse_u32("0x1ffffffff").is_err());
        assert!(parse_u32("teid").is_err());
    }

    #[test]
    fn run_defaults_keep_tracing_off() {
        let cli = Cli::try_parse_from(["upf-monitor", "run"]).unwrap();
        let Some(Commands::Run(cmd)) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(cmd.detailed_tracing, Toggle::Off);
        assert_eq!(cmd.drop_tracing, Toggle::Off);
        assert_eq!(cmd.skb_len_offset, DEFAULT_SKB_LEN_OFFSET);
        assert_eq!(cmd.pins.pin_dir, PathBuf::from(DEFAULT_PIN_DIR));
    }

    #[test]
    fn session_put_parses_addresses() {
        let cli = Cli::try_parse_from([
            "upf-monitor",
            "session",
            "put",
            "0x10",
            "--seid",
            "7",
            "--ue-ip",
            "10.60.0.1",
            "--upf-ip",
            "10.100.200.3",
        ])
        .unwrap();
        let Some(Commands::Session(cmd)) = cli.command else {
            panic!("expected session");
        };
        match cmd.action {
            SessionAction::Put { teid, ue_ip, .. } => {
                assert_eq!(teid, 0x10);
                assert_eq!(ue_ip, Ipv4Addr::new(10, 60, 0, 1));
            }
            _ => panic!("expected put"),
        }
    }
}
