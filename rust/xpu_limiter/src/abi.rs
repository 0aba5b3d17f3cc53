//! Decision layer behind the interposed driver entry points.
//!
//! The trampolines themselves are thin: an allocation-class entry computes
//! its request size and calls [`checked_alloc`], a launch-class entry wraps
//! the original call in [`guarded_launch`], the info-class entries go
//! through [`mem_get_info`]. Either the original driver result or one of
//! the driver's own error codes crosses the ABI; no new codes are minted.

use std::collections::HashSet;

use lazy_static::lazy_static;
use log::error;

use crate::device::{RawContext, RawStream, XPU_ERROR_OUT_OF_MEMORY, XPU_ERROR_UNKNOWN};
use crate::limiter::ResourceLimiter;

// CU_AD_FORMAT values as they appear in array descriptors on the wire.
pub const FORMAT_UNSIGNED_INT8: u32 = 0x01;
pub const FORMAT_UNSIGNED_INT16: u32 = 0x02;
pub const FORMAT_UNSIGNED_INT32: u32 = 0x03;
pub const FORMAT_SIGNED_INT8: u32 = 0x08;
pub const FORMAT_SIGNED_INT16: u32 = 0x09;
pub const FORMAT_SIGNED_INT32: u32 = 0x0a;
pub const FORMAT_HALF: u32 = 0x10;
pub const FORMAT_FLOAT: u32 = 0x20;

pub fn element_size(format: u32) -> u64 {
    match format {
        FORMAT_UNSIGNED_INT8 | FORMAT_SIGNED_INT8 => 1,
        FORMAT_UNSIGNED_INT16 | FORMAT_SIGNED_INT16 | FORMAT_HALF => 2,
        FORMAT_UNSIGNED_INT32 | FORMAT_SIGNED_INT32 | FORMAT_FLOAT => 4,
        _ => 8,
    }
}

/// Size request of a 1D/2D/3D/mipmapped array allocation. Unused
/// dimensions arrive as zero and count as one.
#[derive(Clone, Copy, Debug, Default)]
pub struct ArrayDescriptor {
    pub format: u32,
    pub num_channels: u32,
    pub width: u64,
    pub height: u64,
    pub depth: u64,
}

pub fn array_size(desc: &ArrayDescriptor) -> u64 {
    element_size(desc.format)
        * desc.num_channels as u64
        * desc.width
        * desc.height.max(1)
        * desc.depth.max(1)
}

pub fn round_up(n: u64, base: u64) -> u64 {
    match n % base {
        0 => n,
        rem => n + base - rem,
    }
}

/// Pitched allocations round each row up to the element size.
pub fn pitched_size(width_in_bytes: u64, height: u64, elem: u64) -> u64 {
    round_up(width_in_bytes, elem) * height.max(1)
}

/// Allocation-class wrapper: run the guarded quota check, then either
/// forward to the original entry point or fail with a driver code.
pub fn checked_alloc(
    limiter: &ResourceLimiter,
    size: u64,
    original: impl FnOnce() -> i32,
) -> i32 {
    let guard = limiter.memory().guarded_check(size);
    if guard.error() {
        return XPU_ERROR_UNKNOWN;
    }
    if !guard.enough {
        return XPU_ERROR_OUT_OF_MEMORY;
    }
    original()
}

/// Launch-class wrapper: hold an admission guard across the original call.
pub fn guarded_launch(
    limiter: &ResourceLimiter,
    ctx: RawContext,
    stream: RawStream,
    original: impl FnOnce() -> i32,
) -> i32 {
    let _guard = limiter.core().request(ctx, stream);
    original()
}

/// Info-class wrapper: with memory limiting on, the quota poses as the
/// device total and the unused quota as free memory.
pub fn mem_get_info(limiter: &ResourceLimiter, device_total: u64, device_free: u64) -> (u64, u64) {
    if !limiter.config().limit_memory() {
        return (device_total, device_free);
    }
    let quota = limiter.config().memory_quota();
    let used = match limiter.memory().used_memory() {
        Ok(used) => used,
        Err(e) => {
            error!("failed to query used memory: {:#}", e);
            quota
        }
    };
    (quota, quota.saturating_sub(used))
}

/// Total-memory variant of the info-class wrapper.
pub fn total_mem(limiter: &ResourceLimiter, device_total: u64) -> u64 {
    if !limiter.config().limit_memory() {
        return device_total;
    }
    limiter.config().memory_quota()
}

lazy_static! {
    static ref INTERPOSED_SYMBOLS: HashSet<&'static str> = {
        [
            "cuDriverGetVersion",
            "cuInit",
            "cuGetProcAddress",
            "cuGetProcAddress_v2",
            "cuCtxCreate",
            "cuCtxCreate_v2",
            "cuCtxCreate_v3",
            "cuCtxPushCurrent",
            "cuCtxPushCurrent_v2",
            "cuCtxPopCurrent",
            "cuCtxPopCurrent_v2",
            "cuCtxSetCurrent",
            "cuMemAllocManaged",
            "cuMemAlloc",
            "cuMemAlloc_v2",
            "cuMemAllocPitch",
            "cuMemAllocPitch_v2",
            "cuArrayCreate",
            "cuArrayCreate_v2",
            "cuArray3DCreate",
            "cuArray3DCreate_v2",
            "cuMipmappedArrayCreate",
            "cuDeviceTotalMem",
            "cuDeviceTotalMem_v2",
            "cuMemGetInfo",
            "cuMemGetInfo_v2",
            "cuLaunchKernel",
            "cuLaunchKernel_ptsz",
            "cuLaunchKernelEx",
            "cuLaunchKernelEx_ptsz",
            "cuLaunch",
            "cuLaunchCooperativeKernel",
            "cuLaunchCooperativeKernel_ptsz",
            "cuLaunchCooperativeKernelMultiDevice",
            "cuLaunchGrid",
            "cuLaunchGridAsync",
            "cuGraphLaunch",
            "cuModuleGetFunction",
        ]
        .into_iter()
        .collect()
    };
}

/// Whether the proc-address lookup must hand out this library's wrapper
/// instead of the original symbol.
pub fn is_interposed(symbol: &str) -> bool {
    INTERPOSED_SYMBOLS.contains(symbol)
}
