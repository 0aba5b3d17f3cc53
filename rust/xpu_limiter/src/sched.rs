//! Cross-process time-slice scheduler.
//!
//! Up to [`MAX_NODES`] sibling containers map the same [`SchedRegion`] for
//! one die and elect exactly one "current" node at a time to submit kernels.
//! Coordination is pure compare-and-swap over the mapped atomics; there is
//! no broker process. Liveness is a per-node heartbeat: a node whose
//! heartbeat goes stale loses the current role to the least recently served
//! live sibling.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{bail, Result};
use log::{debug, warn};

use crate::misc::monotonic_now_ns;
use crate::shm::Shm;

/// One scheduling period is split into this many time units.
pub const PERIOD_UNIT_NUMBER: u64 = 100;
/// Smallest configurable compute share, percent.
pub const MIN_COMPUTE_QUOTA: u64 = 5;
/// One slot per container that can share a die.
pub const MAX_NODES: usize = (PERIOD_UNIT_NUMBER / MIN_COMPUTE_QUOTA) as usize;

/// Granularity of one scheduling time unit.
pub const TIME_UNIT: Duration = Duration::from_millis(1);

/// A node whose heartbeat is older than this is dead: its current role can
/// be stolen and a stuck initialization can be broken.
const ALIVE_TIMEOUT: Duration = Duration::from_secs(1);
const INIT_TIMEOUT: Duration = Duration::from_secs(1);
/// Slots staler than one full period are skipped during rotation.
const ROTATION_TIMEOUT_UNITS: u64 = PERIOD_UNIT_NUMBER;

const MAGIC_READY: u32 = u32::from_be_bytes(*b"vXPU");
const MAGIC_INIT: u32 = u32::from_be_bytes(*b"init");

/// Batch of kernel submissions admitted per scheduler tick while holding
/// the current role.
pub const OP_BATCH_SIZE: usize = 10;

#[repr(C)]
pub struct Node {
    /// CLOCK_MONOTONIC nanoseconds of the owner's last liveness write.
    /// Zero marks the slot dead.
    heartbeat: AtomicU64,
}

/// The shared coordination block, viewed in place over the mapped bytes.
///
/// Sibling processes built from different sources must agree on this
/// layout byte for byte: fixed field widths, declaration order, host
/// endianness, no padding.
#[repr(C)]
pub struct SchedRegion {
    magic: AtomicU32,
    current: AtomicU32,
    time_unit: AtomicU64,
    used_units: AtomicU64,
    nodes: [Node; MAX_NODES],
}

pub const REGION_SIZE: usize = std::mem::size_of::<SchedRegion>();
const _: () = assert!(REGION_SIZE == 4 + 4 + 8 + 8 + MAX_NODES * 8);

impl SchedRegion {
    /// # Safety
    ///
    /// `ptr` must point to at least [`REGION_SIZE`] bytes of shared
    /// mapping, aligned for u64, valid for the returned lifetime.
    unsafe fn from_raw<'a>(ptr: *mut u8) -> &'a SchedRegion {
        debug_assert!(ptr as usize % std::mem::align_of::<SchedRegion>() == 0);
        &*(ptr as *const SchedRegion)
    }

    pub fn current(&self) -> u32 {
        self.current.load(Ordering::Acquire)
    }

    pub fn used_units(&self) -> u64 {
        self.used_units.load(Ordering::Acquire)
    }

    pub fn heartbeat(&self, idx: usize) -> u64 {
        self.nodes[idx].heartbeat.load(Ordering::Acquire)
    }

    pub fn is_ready(&self) -> bool {
        self.magic.load(Ordering::Acquire) == MAGIC_READY
    }
}

/// Per-process view of the scheduler for one `(die, idx)` slot.
pub struct TimesliceScheduler {
    idx: usize,
    shm: Shm,
    quota_percent: u64,
    quota: Duration,
    current_slice: Duration,
    last_used_units: Option<u64>,
}

impl TimesliceScheduler {
    /// Attach to the region backing one die and claim slot `idx`.
    ///
    /// Runs the single-writer initialization protocol: the first attacher
    /// formats the region, everyone else waits for `READY`. Attaching to a
    /// region that is already `READY` mutates nothing.
    pub fn attach(idx: usize, shm: Shm, quota_percent: u32) -> Result<Self> {
        if idx >= MAX_NODES {
            bail!("node index {} out of range 0..{}", idx, MAX_NODES);
        }
        if !(1..=PERIOD_UNIT_NUMBER).contains(&(quota_percent as u64)) {
            bail!("compute quota {}% out of range 1..=100", quota_percent);
        }
        if shm.len() < REGION_SIZE {
            bail!(
                "region too small: {} bytes, need {}",
                shm.len(),
                REGION_SIZE
            );
        }
        let mut sched = Self {
            idx,
            shm,
            quota_percent: quota_percent as u64,
            quota: Duration::ZERO,
            current_slice: Duration::ZERO,
            last_used_units: None,
        };
        sched.join_region()?;
        sched.quota = sched.time_unit() * quota_percent;
        sched.current_slice = sched.quota;
        Ok(sched)
    }

    fn region(&self) -> &SchedRegion {
        unsafe { SchedRegion::from_raw(self.shm.as_ptr()) }
    }

    /// Shared view, for observers like the monitor.
    pub fn region_view(&self) -> &SchedRegion {
        self.region()
    }

    pub fn idx(&self) -> usize {
        self.idx
    }

    pub fn time_unit(&self) -> Duration {
        Duration::from_nanos(self.region().time_unit.load(Ordering::Acquire))
    }

    pub fn current_slice(&self) -> Duration {
        self.current_slice
    }

    fn join_region(&self) -> Result<()> {
        let region = self.region();
        let mut begin = monotonic_now_ns();
        loop {
            let state = region.magic.load(Ordering::Acquire);
            if state == MAGIC_READY {
                return Ok(());
            }
            if state == MAGIC_INIT {
                // Somebody else is formatting the region. If they stay in
                // that state past the timeout they died mid-format; force
                // the magic back so the next loop retriggers initialization.
                let now = monotonic_now_ns();
                if now.saturating_sub(begin) > INIT_TIMEOUT.as_nanos() as u64 {
                    let _ = region.magic.compare_exchange(
                        MAGIC_INIT,
                        0,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                    begin = now;
                }
                std::thread::yield_now();
                continue;
            }
            if region
                .magic
                .compare_exchange(state, MAGIC_INIT, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }
            warn!("node {}: initializing scheduling region", self.idx);
            for node in &region.nodes {
                node.heartbeat.store(0, Ordering::Relaxed);
            }
            region.current.store(0, Ordering::Relaxed);
            region
                .time_unit
                .store(TIME_UNIT.as_nanos() as u64, Ordering::Relaxed);
            region.magic.store(MAGIC_READY, Ordering::Release);
            warn!("node {}: scheduling region ready", self.idx);
            return Ok(());
        }
    }

    /// Write the current steady-clock time into our slot and return it.
    pub fn update_heartbeat(&self) -> u64 {
        let now = monotonic_now_ns();
        self.region().nodes[self.idx]
            .heartbeat
            .store(now, Ordering::Release);
        now
    }

    fn own_heartbeat(&self) -> u64 {
        self.region().nodes[self.idx].heartbeat.load(Ordering::Relaxed)
    }

    /// True when this node holds the current role. When the holder is dead,
    /// runs an election; the result lands on a later tick.
    pub fn try_take_current(&self) -> bool {
        let region = self.region();
        let cur = region.current.load(Ordering::Acquire);
        if cur as usize == self.idx {
            return true;
        }
        let now = self.own_heartbeat();
        let cur_heartbeat = region.nodes[cur as usize % MAX_NODES]
            .heartbeat
            .load(Ordering::Acquire);
        if now.saturating_sub(cur_heartbeat) <= ALIVE_TIMEOUT.as_nanos() as u64 {
            return false;
        }
        self.elect_replacement(cur, now);
        false
    }

    /// Replace a dead holder with the live node served least recently.
    fn elect_replacement(&self, stale: u32, now: u64) {
        let region = self.region();
        let mut best: Option<(usize, u64)> = None;
        for (i, node) in region.nodes.iter().enumerate() {
            let heartbeat = node.heartbeat.load(Ordering::Acquire);
            if now.saturating_sub(heartbeat) > ALIVE_TIMEOUT.as_nanos() as u64 {
                continue;
            }
            if best.map_or(true, |(_, b)| heartbeat < b) {
                best = Some((i, heartbeat));
            }
        }
        let chosen = best.map_or(self.idx, |(i, _)| i) as u32;
        match region
            .current
            .compare_exchange(stale, chosen, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => warn!(
                "node {}: current {} is dead, elected {}",
                self.idx, stale, chosen
            ),
            Err(cur) => debug!(
                "node {}: lost election, current already moved to {}",
                self.idx, cur
            ),
        }
    }

    /// Hand the current role to the next live node in ring order. Only the
    /// holder calls this.
    pub fn release_current(&self) {
        let region = self.region();
        let now = self.own_heartbeat();
        let rotation_timeout =
            self.region().time_unit.load(Ordering::Acquire) * ROTATION_TIMEOUT_UNITS;
        for off in 1..=MAX_NODES {
            let next = (self.idx + off) % MAX_NODES;
            let heartbeat = region.nodes[next].heartbeat.load(Ordering::Acquire);
            if now.saturating_sub(heartbeat) > rotation_timeout {
                continue;
            }
            if let Err(cur) = region.current.compare_exchange(
                self.idx as u32,
                next as u32,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                warn!(
                    "node {}: release skipped, current already moved to {}",
                    self.idx, cur
                );
            }
            return;
        }
    }

    /// Charge the finished slice and size the next one. A slice that ran
    /// past its budget shrinks the next slice by the overrun.
    pub fn account_slice(&mut self, begin: u64, end: u64) {
        let actual = Duration::from_nanos(end.saturating_sub(begin));
        let overdraft = actual.saturating_sub(self.current_slice);
        if overdraft > self.quota {
            warn!(
                "node {}: slice overran by {:?}, next slice clamped to zero",
                self.idx,
                overdraft - self.quota
            );
        }
        self.current_slice = self.quota.saturating_sub(overdraft);
    }

    /// Sleep long enough that this node's expected share of a 100-unit
    /// window equals its quota, given how many units all nodes consumed
    /// since our previous slice.
    pub fn execute_idle_time(&mut self) {
        let region = self.region();
        let used = region
            .used_units
            .fetch_add(self.quota_percent, Ordering::AcqRel)
            + self.quota_percent;
        let Some(last) = self.last_used_units else {
            self.last_used_units = Some(used);
            return;
        };
        self.last_used_units = Some(used);
        let period_used = used.wrapping_sub(last);
        if period_used >= PERIOD_UNIT_NUMBER {
            debug!(
                "node {}: {} units used in last period, die saturated",
                self.idx, period_used
            );
            return;
        }
        let period_idle = PERIOD_UNIT_NUMBER - period_used;
        let idle_ns = self.region().time_unit.load(Ordering::Acquire) as u128
            * period_idle as u128
            * self.quota_percent as u128
            / period_used as u128;
        std::thread::sleep(Duration::from_nanos(idle_ns as u64));
    }

    /// Zero our heartbeat so siblings see this node dead immediately.
    pub fn mark_dead(&self) {
        self.region().nodes[self.idx]
            .heartbeat
            .store(0, Ordering::Release);
    }
}

impl Drop for TimesliceScheduler {
    fn drop(&mut self) {
        self.mark_dead();
    }
}
