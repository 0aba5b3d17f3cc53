//! Process-wide limiter facade.
//!
//! The interposer library installs one [`ResourceLimiter`] per process on
//! first use; every intercepted entry point reaches it through
//! [`ResourceLimiter::instance`]. Bring-up that fails leaves the process
//! unable to honor its quota contract toward siblings, so it exits.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use log::error;
use once_cell::sync::OnceCell;

use crate::config::{ResourceConfig, CONFIG_BASE_DIR};
use crate::core_limiter::CoreLimiter;
use crate::device::{KernelRuntime, XpuManager};
use crate::memory_limiter::{MemoryLimiter, LOCK_BASE_DIR};
use crate::pids::PidManager;

/// Filesystem roots the limiter works against, overridable for tests.
#[derive(Clone, Debug)]
pub struct Paths {
    pub config_base: PathBuf,
    pub lock_base: PathBuf,
    pub cgroup_file: PathBuf,
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            config_base: PathBuf::from(CONFIG_BASE_DIR),
            lock_base: PathBuf::from(LOCK_BASE_DIR),
            cgroup_file: PathBuf::from("/proc/self/cgroup"),
        }
    }
}

pub struct ResourceLimiter {
    config: Arc<ResourceConfig>,
    pids: Arc<PidManager>,
    memory: MemoryLimiter,
    core: CoreLimiter,
}

static INSTANCE: OnceCell<ResourceLimiter> = OnceCell::new();

impl ResourceLimiter {
    /// Wire up config, PID translation, memory and compute limiting.
    pub fn bring_up(
        xpu: Arc<dyn XpuManager>,
        runtime: Arc<dyn KernelRuntime>,
        paths: Paths,
    ) -> Result<Self> {
        xpu.init().context("device init failed")?;
        let config = Arc::new(ResourceConfig::load(
            &paths.config_base.join(xpu.config_file()),
        )?);
        let pids = PidManager::new(paths.config_base.clone());
        if config.limit_memory() || config.limit_compute() {
            pids.initialize(&paths.cgroup_file)?;
        } else {
            // Host mode has no device plugin to register with.
            pids.spawn_watcher()?;
        }
        let memory = MemoryLimiter::new(config.clone(), xpu, pids.clone(), &paths.lock_base);
        memory.initialize()?;
        let core = CoreLimiter::new(runtime);
        core.start(&config, &paths.config_base)?;
        Ok(Self {
            config,
            pids,
            memory,
            core,
        })
    }

    /// Install the process-wide limiter, exiting on bring-up failure.
    /// Subsequent calls return the already-installed instance.
    pub fn install(
        xpu: Arc<dyn XpuManager>,
        runtime: Arc<dyn KernelRuntime>,
        paths: Paths,
    ) -> &'static ResourceLimiter {
        INSTANCE.get_or_init(|| match Self::bring_up(xpu, runtime, paths) {
            Ok(limiter) => limiter,
            Err(e) => {
                error!("resource limiter bring-up failed: {:#}", e);
                std::process::exit(1);
            }
        })
    }

    pub fn instance() -> Option<&'static ResourceLimiter> {
        INSTANCE.get()
    }

    pub fn config(&self) -> &ResourceConfig {
        &self.config
    }

    pub fn pids(&self) -> &PidManager {
        &self.pids
    }

    pub fn memory(&self) -> &MemoryLimiter {
        &self.memory
    }

    pub fn core(&self) -> &CoreLimiter {
        &self.core
    }

    pub fn shutdown(&self) {
        self.core.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{RawContext, RawStream, XPU_ERROR_OUT_OF_MEMORY, XPU_SUCCESS};
    use crate::memory_limiter::tests::FakeXpu;
    use std::io::Write;

    struct NullRuntime;

    impl KernelRuntime for NullRuntime {
        fn current_context(&self) -> Result<RawContext> {
            Ok(0)
        }

        fn set_context(&self, _ctx: RawContext) -> Result<()> {
            Ok(())
        }

        fn synchronize_stream(&self, _stream: RawStream) -> Result<()> {
            Ok(())
        }
    }

    fn host_mode_paths() -> (tempfile::TempDir, Paths) {
        let dir = tempfile::tempdir().unwrap();
        let config_base = dir.path().join("etc");
        let lock_base = dir.path().join("run");
        std::fs::create_dir_all(&config_base).unwrap();
        let cgroup_file = dir.path().join("cgroup");
        let mut file = std::fs::File::create(&cgroup_file).unwrap();
        write!(file, "4:memory:/\n").unwrap();
        let paths = Paths {
            config_base,
            lock_base,
            cgroup_file,
        };
        (dir, paths)
    }

    #[test]
    fn host_mode_limits_nothing() {
        let (_dir, paths) = host_mode_paths();
        let limiter = ResourceLimiter::bring_up(
            FakeXpu::with_usage(Vec::new()),
            Arc::new(NullRuntime),
            paths,
        )
        .unwrap();
        assert!(!limiter.config().limit_memory());
        assert!(!limiter.config().limit_compute());

        // Allocations pass through untouched and launches never block.
        let ret = crate::abi::checked_alloc(&limiter, u64::MAX / 2, || XPU_SUCCESS);
        assert_eq!(ret, XPU_SUCCESS);
        let ret = crate::abi::guarded_launch(&limiter, 1, 2, || XPU_SUCCESS);
        assert_eq!(ret, XPU_SUCCESS);

        // Info-class queries report the real device values.
        let (total, free) = crate::abi::mem_get_info(&limiter, 1000, 400);
        assert_eq!((total, free), (1000, 400));
    }

    #[test]
    fn containerized_memory_quota_is_enforced() {
        let (_dir, paths) = host_mode_paths();
        let mut cfg =
            std::fs::File::create(paths.config_base.join("vgpu.config")).unwrap();
        // Compute limiting off so bring-up does not need an ids config.
        write!(cfg, "UsedMem:1024\nUsedCores:0\n").unwrap();
        let mut pids =
            std::fs::File::create(paths.config_base.join("pids.config")).unwrap();
        writeln!(pids, "{:>11} {:>11}", 100, 1).unwrap();

        use crate::config::MEGABYTE;
        use crate::device::ProcMemSample;
        let xpu = FakeXpu::with_usage(vec![ProcMemSample {
            host_pid: 100,
            used_bytes: 900 * MEGABYTE,
        }]);
        let limiter =
            ResourceLimiter::bring_up(xpu, Arc::new(NullRuntime), paths).unwrap();
        limiter.pids().refresh().unwrap();

        let ret = crate::abi::checked_alloc(&limiter, 200 * MEGABYTE, || XPU_SUCCESS);
        assert_eq!(ret, XPU_ERROR_OUT_OF_MEMORY);
        let ret = crate::abi::checked_alloc(&limiter, 100 * MEGABYTE, || XPU_SUCCESS);
        assert_eq!(ret, XPU_SUCCESS);

        let (total, free) = crate::abi::mem_get_info(&limiter, 0, 0);
        assert_eq!(total, 1024 * MEGABYTE);
        assert_eq!(free, 124 * MEGABYTE);
        assert_eq!(crate::abi::total_mem(&limiter, 0), 1024 * MEGABYTE);
    }
}
