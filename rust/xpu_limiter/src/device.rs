//! Seams toward the vendor accelerator stack.
//!
//! The limiter never talks to a driver directly. [`XpuManager`] covers the
//! fleet-management side (device enumeration, memory accounting,
//! per-process utilization) and [`KernelRuntime`] covers the runtime side
//! (contexts and streams) that the interposed launch path touches.

use anyhow::Result;

/// Opaque driver context handle as it crosses the interposed ABI.
pub type RawContext = usize;
/// Opaque driver stream handle as it crosses the interposed ABI.
pub type RawStream = usize;

/// Driver status codes reported back across the interposed ABI. No new
/// codes are minted; a refused allocation looks exactly like a driver OOM.
pub const XPU_SUCCESS: i32 = 0;
pub const XPU_ERROR_OUT_OF_MEMORY: i32 = 2;
pub const XPU_ERROR_UNKNOWN: i32 = 999;

pub const MAX_DEVICE_COUNT: u32 = 16;

/// One process's live memory footprint on a device, keyed by host pid.
#[derive(Clone, Copy, Debug)]
pub struct ProcMemSample {
    pub host_pid: u32,
    pub used_bytes: u64,
}

/// One process's compute utilization sample, keyed by host pid.
#[derive(Clone, Copy, Debug)]
pub struct ProcUtilSample {
    pub host_pid: u32,
    pub sm_util: u32,
}

pub trait XpuManager: Send + Sync {
    fn init(&self) -> Result<()>;
    fn device_count(&self) -> Result<u32>;
    fn current_device(&self) -> Result<u32>;
    fn total_memory(&self, device: u32) -> Result<u64>;
    fn process_memory(&self, device: u32) -> Result<Vec<ProcMemSample>>;
    /// Utilization samples collected since `since_us` (microseconds,
    /// system clock).
    fn process_utilization(&self, device: u32, since_us: u64) -> Result<Vec<ProcUtilSample>>;
    /// Name of the quota config file for this device family, e.g.
    /// `vgpu.config`.
    fn config_file(&self) -> &'static str;
}

pub trait KernelRuntime: Send + Sync {
    fn current_context(&self) -> Result<RawContext>;
    fn set_context(&self, ctx: RawContext) -> Result<()>;
    fn synchronize_stream(&self, stream: RawStream) -> Result<()>;
}
