//! Quota configuration dropped into the container by the device plugin.
//!
//! `<base>/vgpu.config` (or `vnpu.config`) carries the quotas; its absence
//! means the process runs directly on the host and nothing is limited.
//! `<base>/vnpu-ids.config` binds the container to a die and a scheduler
//! slot.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use log::{debug, info};

use crate::misc::read_first_line;

pub const CONFIG_BASE_DIR: &str = "/etc/xpu/";
pub const IDS_CONFIG_NAME: &str = "vnpu-ids.config";

pub const MEGABYTE: u64 = 1024 * 1024;
const PERCENT_MAX: u64 = 100;

#[derive(Clone, Debug, Default)]
pub struct ResourceConfig {
    memory_quota: u64,
    compute_quota: u32,
    limit_memory: bool,
    limit_compute: bool,
}

impl ResourceConfig {
    /// Host mode: nothing is limited.
    pub fn host_mode() -> Self {
        Self::default()
    }

    /// Load quotas from `path`. A missing file is host mode, a present but
    /// malformed file is an error.
    ///
    /// Format, both lines mandatory and ordered:
    /// ```text
    /// UsedMem:<MB>
    /// UsedCores:<percent 0..100>
    /// ```
    /// `UsedCores:0` turns compute limiting off while memory limiting
    /// stays on.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("{:?} does not exist, running in host mode", path);
            return Ok(Self::host_mode());
        }
        let content =
            std::fs::read_to_string(path).with_context(|| format!("failed to read {:?}", path))?;
        let mut lines = content.lines();
        let mem_line = lines.next().context("missing UsedMem line")?;
        let memory_mb = parse_keyed_value(mem_line, "UsedMem", u32::MAX as u64)?;
        let cores_line = lines.next().context("missing UsedCores line")?;
        let cores = parse_keyed_value(cores_line, "UsedCores", PERCENT_MAX)?;
        let config = Self {
            memory_quota: memory_mb * MEGABYTE,
            compute_quota: cores as u32,
            limit_memory: true,
            limit_compute: cores != 0,
        };
        info!(
            "loaded {:?}: memory quota {} B, compute quota {}%, limit memory {}, limit compute {}",
            path, config.memory_quota, config.compute_quota, config.limit_memory,
            config.limit_compute
        );
        Ok(config)
    }

    pub fn limit_memory(&self) -> bool {
        self.limit_memory
    }

    pub fn limit_compute(&self) -> bool {
        self.limit_compute
    }

    pub fn memory_quota(&self) -> u64 {
        self.memory_quota
    }

    pub fn compute_quota(&self) -> u32 {
        self.compute_quota
    }
}

fn parse_keyed_value(line: &str, key: &str, max: u64) -> Result<u64> {
    let value = match line.strip_prefix(key).and_then(|rest| rest.strip_prefix(':')) {
        Some(value) => value,
        None => bail!("expected `{}:<value>`, got {:?}", key, line),
    };
    let value: u64 = value
        .trim()
        .parse()
        .with_context(|| format!("failed to parse {} value {:?}", key, value))?;
    if value > max {
        bail!("{} value {} exceeds maximum {}", key, value, max);
    }
    Ok(value)
}

/// Identity of this container's scheduler slot, from `vnpu-ids.config`:
/// a single `<dieId>-<nodeIdx>` line, split at the last `-`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DieBinding {
    pub die_id: String,
    pub node_idx: usize,
}

impl DieBinding {
    pub fn load(base_dir: &Path) -> Result<Self> {
        let path = base_dir.join(IDS_CONFIG_NAME);
        let line = read_first_line(&path)?;
        let binding = Self::parse(&line)
            .with_context(|| format!("failed to parse {:?} line {:?}", path, line))?;
        info!("die binding loaded: {}", line);
        Ok(binding)
    }

    fn parse(line: &str) -> Result<Self> {
        let Some(pos) = line.rfind('-') else {
            bail!("no `-` separator");
        };
        let die_id = line[..pos].to_string();
        if die_id.is_empty() {
            bail!("empty die id");
        }
        let node_idx = line[pos + 1..]
            .parse()
            .context("node index is not a number")?;
        Ok(Self { die_id, node_idx })
    }

    pub fn config_base() -> PathBuf {
        PathBuf::from(CONFIG_BASE_DIR)
    }
}
