//! Memory quota enforcement.
//!
//! Every intercepted allocation runs a read-modify-check against the
//! accelerator's live usage under a host-wide file lock, so two containers
//! racing on the last free bytes cannot both win. When usage cannot be
//! verified the check fails closed.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use log::{error, info};

use crate::config::ResourceConfig;
use crate::device::XpuManager;
use crate::file_lock::FileLock;
use crate::pids::PidManager;

pub const LOCK_BASE_DIR: &str = "/run/xpu/";
pub const MEMCTL_LOCK_NAME: &str = "memctl.lock";

/// Result of one guarded check. The allocation the check admitted must
/// complete while this guard is alive; dropping it releases the host-wide
/// lock.
pub struct MemoryGuard {
    lock: FileLock,
    pub enough: bool,
}

impl MemoryGuard {
    /// True when the check could not run at all (lock unusable). The caller
    /// must fail the allocation with the driver's generic error code, not
    /// OOM.
    pub fn error(&self) -> bool {
        !self.lock.held()
    }
}

pub struct MemoryLimiter {
    config: Arc<ResourceConfig>,
    xpu: Arc<dyn XpuManager>,
    pids: Arc<PidManager>,
    lock_path: PathBuf,
}

impl MemoryLimiter {
    pub fn new(
        config: Arc<ResourceConfig>,
        xpu: Arc<dyn XpuManager>,
        pids: Arc<PidManager>,
        lock_dir: &Path,
    ) -> Self {
        Self {
            config,
            xpu,
            pids,
            lock_path: lock_dir.join(MEMCTL_LOCK_NAME),
        }
    }

    /// Create the lock directory. Must run before the first check.
    pub fn initialize(&self) -> Result<()> {
        use std::os::unix::fs::DirBuilderExt;
        let dir = self.lock_path.parent().unwrap_or(Path::new("/"));
        let mut builder = std::fs::DirBuilder::new();
        builder.recursive(true).mode(0o750);
        builder
            .create(dir)
            .with_context(|| format!("mkdir {:?} failed", dir))?;
        info!("lock dir {:?} ready", dir);
        Ok(())
    }

    /// Check whether `requested` more bytes fit under the quota, holding
    /// the host-wide lock for the duration of the check.
    pub fn guarded_check(&self, requested: u64) -> MemoryGuard {
        let lock = FileLock::exclusive(&self.lock_path);
        let enough = lock.held() && self.memory_check(requested);
        MemoryGuard { lock, enough }
    }

    fn memory_check(&self, requested: u64) -> bool {
        if !self.config.limit_memory() {
            return true;
        }
        let used = match self.used_memory() {
            Ok(used) => used,
            Err(e) => {
                error!("failed to query used memory: {:#}", e);
                return false;
            }
        };
        let quota = self.config.memory_quota();
        if requested + used > quota {
            error!(
                "out of memory, requested {} B, used {} B, quota {} B",
                requested, used, quota
            );
            return false;
        }
        true
    }

    /// Live usage attributed to this container: the sum over every device
    /// process whose host pid translates through the PID map.
    pub fn used_memory(&self) -> Result<u64> {
        let device = self.xpu.current_device()?;
        let samples = self.xpu.process_memory(device)?;
        Ok(samples
            .iter()
            .filter(|s| self.pids.container_pid(s.host_pid as i32).is_some())
            .map(|s| s.used_bytes)
            .sum())
    }
}
