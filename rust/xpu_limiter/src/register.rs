//! Registration with the host-side device plugin.
//!
//! The container announces itself by handing its memory-cgroup path to an
//! external client tool. The cgroup string ends up on a command line, so
//! it is screened against a shell-metacharacter blacklist before any
//! subprocess is spawned.

use std::path::Path;
use std::process::Command;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use log::info;

pub const CLIENT_TOOL_PATH: &str = "/opt/xpu/bin/xpu-client-tool";
const REGISTER_ATTEMPTS: u32 = 10;
const RETRY_DELAY: Duration = Duration::from_secs(1);

const ARG_BLACKLIST: &str = "!;&$><!\n\\*?{}()";

pub fn is_dangerous_argument(arg: &str) -> bool {
    arg.chars().any(|c| ARG_BLACKLIST.contains(c))
}

/// Extract the memory controller's cgroup path from a `/proc/<pid>/cgroup`
/// style file.
pub fn cgroup_memory_path(cgroup_file: &Path) -> Result<String> {
    let content = std::fs::read_to_string(cgroup_file)
        .with_context(|| format!("failed to read {:?}", cgroup_file))?;
    const MEMORY_HEADER: &str = "memory:";
    for line in content.lines() {
        if let Some(pos) = line.find(MEMORY_HEADER) {
            return Ok(line[pos + MEMORY_HEADER.len()..].to_string());
        }
    }
    bail!("no memory controller line in {:?}", cgroup_file);
}

fn register_once(cgroup: &str) -> Result<()> {
    if !Path::new(CLIENT_TOOL_PATH).exists() {
        bail!("{} does not exist", CLIENT_TOOL_PATH);
    }
    info!("run: {} --cgroup-path {}", CLIENT_TOOL_PATH, cgroup);
    let status = Command::new(CLIENT_TOOL_PATH)
        .arg("--cgroup-path")
        .arg(cgroup)
        .status()
        .with_context(|| format!("failed to spawn {}", CLIENT_TOOL_PATH))?;
    if !status.success() {
        bail!("{} exited with {}", CLIENT_TOOL_PATH, status);
    }
    Ok(())
}

/// Announce this container to the device plugin, retrying transient
/// failures. A cgroup path containing blacklisted bytes is refused outright
/// without spawning anything.
pub fn register_to_device_plugin(cgroup_file: &Path) -> Result<()> {
    let cgroup = cgroup_memory_path(cgroup_file)?;
    if is_dangerous_argument(&cgroup) {
        bail!("cgroup path {:?} contains forbidden characters", cgroup);
    }
    let mut last_err = None;
    for attempt in 1..=REGISTER_ATTEMPTS {
        match register_once(&cgroup) {
            Ok(()) => {
                info!("registered with device plugin");
                return Ok(());
            }
            Err(e) => {
                info!("registration attempt {} failed: {:#}", attempt, e);
                last_err = Some(e);
                std::thread::sleep(RETRY_DELAY);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("registration failed")))
        .with_context(|| format!("gave up after {} attempts", REGISTER_ATTEMPTS))
}
