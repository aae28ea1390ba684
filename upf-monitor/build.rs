use std::{
    env,
    ffi::OsString,
    fs,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
    process::{Command, Stdio},
    thread,
};

use anyhow::{anyhow, bail, Context as _, Result};
use cargo_metadata::{Artifact, CompilerMessage, Message, MetadataCommand};

const EBPF_PACKAGE: &str = "upf-monitor-ebpf";

fn main() -> Result<()> {
    println!("cargo:rerun-if-env-changed=CARGO_FEATURE_EMBED_EBPF");
    // Without `embed-ebpf` the agent loads the object from `--object` at runtime.
    if env::var_os("CARGO_FEATURE_EMBED_EBPF").is_none() {
        return Ok(());
    }

    let out_dir = PathBuf::from(env::var_os("OUT_DIR").context("OUT_DIR not set")?);
    let root_dir = ebpf_root_dir()?;
    println!("cargo:rerun-if-changed={}", root_dir.display());

    let objects = compile_ebpf(&out_dir.join(EBPF_PACKAGE))?;
    for (name, object) in objects {
        let dst = out_dir.join(&name);
        fs::copy(&object, &dst)
            .with_context(|| format!("failed to copy {} to {}", object.display(), dst.display()))?;
    }
    Ok(())
}

fn ebpf_root_dir() -> Result<PathBuf> {
    let metadata = MetadataCommand::new()
        .no_deps()
        .exec()
        .context("failed to read workspace metadata")?;
    let package = metadata
        .packages
        .iter()
        .find(|package| package.name.as_str() == EBPF_PACKAGE)
        .ok_or_else(|| anyhow!("{EBPF_PACKAGE} package not found"))?;
    package
        .manifest_path
        .parent()
        .map(|dir| dir.as_std_path().to_path_buf())
        .ok_or_else(|| anyhow!("no parent for {}", package.manifest_path))
}

/// `bpfel-unknown-none` or `bpfeb-unknown-none`, following the host endianness.
fn bpf_target() -> Result<&'static str> {
    match env::var("CARGO_CFG_TARGET_ENDIAN").as_deref() {
        Ok("little") => Ok("bpfel-unknown-none"),
        Ok("big") => Ok("bpfeb-unknown-none"),
        Ok(other) => bail!("unsupported endian {other}"),
        Err(err) => bail!("CARGO_CFG_TARGET_ENDIAN not set: {err}"),
    }
}

fn ebpf_rustflags() -> Result<OsString> {
    let arch = env::var("CARGO_CFG_TARGET_ARCH").context("CARGO_CFG_TARGET_ARCH not set")?;
    let arch = if arch.starts_with("riscv64") { "riscv64" } else { arch.as_str() };
    // CARGO_ENCODED_RUSTFLAGS separates flags with 0x1f.
    let flags = [
        format!("--cfg=bpf_target_arch=\"{arch}\""),
        "-Cdebuginfo=2".to_owned(),
        "-Clink-arg=--btf".to_owned(),
    ];
    Ok(flags.join("\x1f").into())
}

/// Builds the kernel crate with nightly `build-std` and returns its binaries.
fn compile_ebpf(target_dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut cmd = Command::new("rustup");
    cmd.args(["run", "nightly", "cargo", "build", "--package", EBPF_PACKAGE])
        .args(["-Z", "build-std=core", "--bins", "--release"])
        .args(["--message-format=json", "--target", bpf_target()?])
        .arg("--target-dir")
        .arg(target_dir)
        .env("CARGO_ENCODED_RUSTFLAGS", ebpf_rustflags()?)
        .env_remove("RUSTC")
        .env_remove("RUSTC_WORKSPACE_WRAPPER")
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn {cmd:?}"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("no stderr pipe for {EBPF_PACKAGE}"))?;
    let relay = thread::spawn(move || {
        for line in BufReader::new(stderr).lines().map_while(|line| line.ok()) {
            eprintln!("[ebpf] {line}");
        }
    });

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("no stdout pipe for {EBPF_PACKAGE}"))?;
    let mut objects = Vec::new();
    for message in Message::parse_stream(BufReader::new(stdout)) {
        match message.context("malformed cargo message")? {
            Message::CompilerArtifact(Artifact {
                executable: Some(executable),
                target,
                ..
            }) => objects.push((target.name, executable.into_std_path_buf())),
            Message::CompilerMessage(CompilerMessage { message, .. }) => {
                for line in message.rendered.iter().flat_map(|text| text.lines()) {
                    eprintln!("[ebpf] {line}");
                }
            }
            Message::TextLine(line) => eprintln!("[ebpf] {line}"),
            _ => {}
        }
    }

    let status = child
        .wait()
        .with_context(|| format!("failed to wait for {cmd:?}"))?;
    if relay.join().is_err() {
        bail!("stderr relay for {EBPF_PACKAGE} panicked");
    }
    if !status.success() {
        bail!("{cmd:?} failed: {status}");
    }
    Ok(objects)
}
