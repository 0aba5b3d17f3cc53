// SPDX-License-Identifier: GPL-2.0
//
// Copyright (c) 2025 The xpu_limiter Authors

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Per-container accelerator resource governance
//!
//! When several containers share one physical accelerator die, each gets a
//! memory quota in bytes and a compute quota as a percent of die time.
//! This crate is the in-process half of that contract: it is loaded into
//! every tenant process by the ABI interposer and
//!
//! * rejects allocations that would push the container past its memory
//!   quota ([`MemoryLimiter`]),
//! * throttles kernel submissions so the container's long-run share of die
//!   time matches its compute quota ([`CoreLimiter`]),
//! * coordinates with sibling containers over a shared-memory region with
//!   no broker process ([`TimesliceScheduler`]),
//! * translates host pids to container pids so usage lands on the right
//!   tenant ([`PidManager`]).
//!
//! The ABI trampolines themselves live in the interposer; they call into
//! the [`abi`] decision layer and the process-global
//! [`limiter::ResourceLimiter`].

pub mod abi;

pub mod config;
pub use config::DieBinding;
pub use config::ResourceConfig;

mod core_limiter;
pub use core_limiter::CoreLimiter;
pub use core_limiter::RequestGuard;

pub mod device;

mod file_lock;
pub use file_lock::FileLock;

pub mod limiter;
pub use limiter::ResourceLimiter;

pub mod logging;

mod memory_limiter;
pub use memory_limiter::MemoryGuard;
pub use memory_limiter::MemoryLimiter;

pub mod misc;

mod nvml;
#[cfg(feature = "nvml")]
pub use nvml::NvmlManager;

mod pids;
pub use pids::PidManager;

pub mod register;

mod sched;
pub use sched::SchedRegion;
pub use sched::TimesliceScheduler;
pub use sched::MAX_NODES;
pub use sched::REGION_SIZE;

mod sem;
pub use sem::Sem;

mod shm;
pub use shm::region_name;
pub use shm::Shm;

mod stream_cache;
pub use stream_cache::StreamCache;
