#![cfg(feature = "nvml")]

//! Fleet-management queries over NVML.

use anyhow::{bail, Context, Result};
use nvml_wrapper::enums::device::UsedGpuMemory;
use nvml_wrapper::error::NvmlError;
use nvml_wrapper::Nvml;

use crate::device::{ProcMemSample, ProcUtilSample, XpuManager, MAX_DEVICE_COUNT};

pub struct NvmlManager {
    nvml: Nvml,
    device: u32,
}

impl NvmlManager {
    /// Load the NVML library and pin this process to `device`.
    pub fn probe(device: u32) -> Result<Self> {
        let nvml = Nvml::init().context("failed to initialize NVML")?;
        Ok(Self { nvml, device })
    }
}

impl XpuManager for NvmlManager {
    fn init(&self) -> Result<()> {
        let count = self.device_count()?;
        if count == 0 || count > MAX_DEVICE_COUNT {
            bail!("unusable device count {}", count);
        }
        if self.device >= count {
            bail!("device index {} out of range 0..{}", self.device, count);
        }
        Ok(())
    }

    fn device_count(&self) -> Result<u32> {
        self.nvml.device_count().context("device count query failed")
    }

    fn current_device(&self) -> Result<u32> {
        Ok(self.device)
    }

    fn total_memory(&self, device: u32) -> Result<u64> {
        let dev = self.nvml.device_by_index(device)?;
        Ok(dev.memory_info()?.total)
    }

    fn process_memory(&self, device: u32) -> Result<Vec<ProcMemSample>> {
        let dev = self.nvml.device_by_index(device)?;
        let procs = dev.running_compute_processes()?;
        Ok(procs
            .into_iter()
            .map(|p| ProcMemSample {
                host_pid: p.pid,
                used_bytes: match p.used_gpu_memory {
                    UsedGpuMemory::Used(bytes) => bytes,
                    UsedGpuMemory::Unavailable => 0,
                },
            })
            .collect())
    }

    fn process_utilization(&self, device: u32, since_us: u64) -> Result<Vec<ProcUtilSample>> {
        let dev = self.nvml.device_by_index(device)?;
        let samples = match dev.process_utilization_stats(since_us) {
            Ok(samples) => samples,
            // No samples in the window is not an error.
            Err(NvmlError::NotFound) => return Ok(Vec::new()),
            Err(e) => return Err(e).context("process utilization query failed"),
        };
        Ok(samples
            .into_iter()
            .map(|s| ProcUtilSample {
                host_pid: s.pid,
                sm_util: s.sm_util,
            })
            .collect())
    }

    fn config_file(&self) -> &'static str {
        "vgpu.config"
    }
}
