//! Compute quota enforcement.
//!
//! Application threads bracket every kernel submission with a
//! [`RequestGuard`]; a background scheduler thread runs the cross-process
//! time-slice loop and, while this container holds the current role, admits
//! submissions in batches. The two sides meet in a request/acknowledge
//! semaphore pair: the scheduler grants a batch of permits, each admitted
//! submission acknowledges on guard drop, and the scheduler waits for every
//! acknowledgement before the batch's streams are synchronized and the
//! current role can move on.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use log::{info, warn};

use crate::config::{DieBinding, ResourceConfig};
use crate::device::{KernelRuntime, RawContext, RawStream};
use crate::sched::{TimesliceScheduler, OP_BATCH_SIZE, REGION_SIZE};
use crate::sem::Sem;
use crate::shm::{region_name, Shm};
use crate::stream_cache::StreamCache;

/// State shared between the scheduler thread and the request guards.
struct Gate {
    sem_req: Sem,
    sem_ack: Sem,
    streams: StreamCache,
    runtime: Arc<dyn KernelRuntime>,
}

impl Gate {
    fn new(runtime: Arc<dyn KernelRuntime>) -> Self {
        Self {
            sem_req: Sem::new(0),
            sem_ack: Sem::new(0),
            streams: StreamCache::with_capacity(OP_BATCH_SIZE),
            runtime,
        }
    }

    fn open_batch(&self, op_count: usize) -> ReleaseGuard<'_> {
        self.sem_req.release(op_count);
        ReleaseGuard {
            gate: self,
            granted: op_count,
        }
    }
}

/// Brackets one kernel submission. Construction blocks until the scheduler
/// admits the submission into the running slice; dropping acknowledges that
/// the underlying driver call returned.
pub struct RequestGuard<'a> {
    gate: Option<&'a Gate>,
}

impl RequestGuard<'_> {
    fn admitted(gate: &Gate, ctx: RawContext, stream: RawStream) -> RequestGuard<'_> {
        gate.sem_req.acquire(1);
        gate.streams.push(ctx, stream);
        RequestGuard { gate: Some(gate) }
    }

    fn passthrough() -> RequestGuard<'static> {
        RequestGuard { gate: None }
    }
}

impl Drop for RequestGuard<'_> {
    fn drop(&mut self) {
        if let Some(gate) = self.gate {
            gate.sem_ack.release(1);
        }
    }
}

/// One admission batch, held by the scheduler while the slice runs. Drop
/// reclaims unconsumed grants, waits for every admitted submission's
/// acknowledgement and synchronizes the recorded streams, so no admitted
/// work overlaps the next holder's slice.
struct ReleaseGuard<'a> {
    gate: &'a Gate,
    granted: usize,
}

impl Drop for ReleaseGuard<'_> {
    fn drop(&mut self) {
        let unclaimed = self.gate.sem_req.acquire_all();
        let admitted = self.granted.saturating_sub(unclaimed);
        self.gate.sem_ack.acquire(admitted);
        self.gate.streams.drain(self.gate.runtime.as_ref());
    }
}

pub struct CoreLimiter {
    gate: Arc<Gate>,
    enabled: AtomicBool,
    terminating: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CoreLimiter {
    pub fn new(runtime: Arc<dyn KernelRuntime>) -> Self {
        Self {
            gate: Arc::new(Gate::new(runtime)),
            enabled: AtomicBool::new(false),
            terminating: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        }
    }

    /// Attach to the die's scheduling region and start the scheduler
    /// thread. With compute limiting off this is a no-op and every guard
    /// passes through.
    pub fn start(&self, config: &ResourceConfig, config_base: &Path) -> Result<()> {
        if !config.limit_compute() {
            info!("compute limiting off, scheduler thread not started");
            return Ok(());
        }
        let mut worker = self.worker.lock().unwrap();
        if worker.is_some() {
            warn!("scheduler thread already running, ignored");
            return Ok(());
        }
        let binding = DieBinding::load(config_base)?;
        let shm = Shm::init(&region_name(&binding.die_id), REGION_SIZE)?;
        let sched = TimesliceScheduler::attach(binding.node_idx, shm, config.compute_quota())?;
        let gate = self.gate.clone();
        let terminating = self.terminating.clone();
        let handle = std::thread::Builder::new()
            .name("xpu-sched".into())
            .spawn(move || scheduler_loop(sched, gate, terminating))
            .context("failed to spawn scheduler thread")?;
        *worker = Some(handle);
        self.enabled.store(true, Ordering::Release);
        Ok(())
    }

    /// Guard for one kernel submission on `stream` under `ctx`.
    pub fn request(&self, ctx: RawContext, stream: RawStream) -> RequestGuard<'_> {
        if !self.enabled.load(Ordering::Acquire) {
            return RequestGuard::passthrough();
        }
        RequestGuard::admitted(&self.gate, ctx, stream)
    }

    /// Stop the scheduler thread and mark our slot dead. Idempotent.
    pub fn shutdown(&self) {
        self.terminating.store(true, Ordering::Release);
        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("scheduler thread panicked during shutdown");
            }
        }
        self.enabled.store(false, Ordering::Release);
    }
}

impl Drop for CoreLimiter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn scheduler_loop(mut sched: TimesliceScheduler, gate: Arc<Gate>, terminating: Arc<AtomicBool>) {
    info!(
        "scheduler thread running for node {} (pid {})",
        sched.idx(),
        std::process::id()
    );
    while !terminating.load(Ordering::Acquire) {
        let begin = sched.update_heartbeat();
        if !sched.try_take_current() {
            std::thread::yield_now();
            continue;
        }
        let end = run_timeslice(&mut sched, &gate, begin);
        sched.account_slice(begin, end);
        sched.execute_idle_time();
        sched.release_current();
    }
    sched.mark_dead();
}

/// Run one slice: admit batches until the slice budget is spent, returning
/// the heartbeat written at the end.
fn run_timeslice(sched: &mut TimesliceScheduler, gate: &Gate, begin: u64) -> u64 {
    let mut end = begin;
    while std::time::Duration::from_nanos(end.saturating_sub(begin)) < sched.current_slice() {
        {
            let _batch = gate.open_batch(OP_BATCH_SIZE);
            std::thread::yield_now();
        }
        end = sched.update_heartbeat();
    }
    end
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::tests::test_region_name;
    use anyhow::Result;
    use std::io::Write;
    use std::sync::atomic::AtomicU64;
    use std::time::Duration;

    #[derive(Default)]
    struct NullRuntime {
        synced: AtomicU64,
    }

    impl KernelRuntime for NullRuntime {
        fn current_context(&self) -> Result<RawContext> {
            Ok(1)
        }

        fn set_context(&self, _ctx: RawContext) -> Result<()> {
            Ok(())
        }

        fn synchronize_stream(&self, _stream: RawStream) -> Result<()> {
            self.synced.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    fn config_dir(die: &str, idx: usize, cores: u32) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let mut ids = std::fs::File::create(dir.path().join("vnpu-ids.config")).unwrap();
        writeln!(ids, "{}-{}", die, idx).unwrap();
        let mut cfg = std::fs::File::create(dir.path().join("vgpu.config")).unwrap();
        write!(cfg, "UsedMem:1024\nUsedCores:{}\n", cores).unwrap();
        dir
    }

    fn load_config(dir: &tempfile::TempDir) -> ResourceConfig {
        ResourceConfig::load(&dir.path().join("vgpu.config")).unwrap()
    }

    #[test]
    fn disabled_guards_pass_through() {
        let limiter = CoreLimiter::new(Arc::new(NullRuntime::default()));
        // No scheduler thread anywhere, yet guards must not block.
        for _ in 0..32 {
            let _guard = limiter.request(1, 2);
        }
    }

    #[test]
    fn disabled_config_skips_scheduler_thread() {
        let dir = config_dir("unused", 0, 0);
        let limiter = CoreLimiter::new(Arc::new(NullRuntime::default()));
        limiter.start(&load_config(&dir), dir.path()).unwrap();
        assert!(limiter.worker.lock().unwrap().is_none());
        let _guard = limiter.request(1, 2);
    }

    #[test]
    fn batch_handshake_balances_semaphores() {
        let runtime = Arc::new(NullRuntime::default());
        let gate = Gate::new(runtime.clone());
        {
            let _batch = gate.open_batch(4);
            {
                let _a = RequestGuard::admitted(&gate, 1, 10);
                let _b = RequestGuard::admitted(&gate, 1, 20);
            }
            // Both guards dropped: two acks pending, two grants unclaimed.
        }
        // Batch drop reclaimed the grants, consumed the acks and drained
        // the cache.
        assert_eq!(gate.sem_req.acquire_all(), 0);
        assert_eq!(gate.sem_ack.acquire_all(), 0);
        assert_eq!(gate.streams.pending(), 0);
        assert_eq!(runtime.synced.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn requests_complete_under_running_scheduler() {
        let die = test_region_name("gate");
        let dir = config_dir(die.trim_start_matches('/'), 0, 100);
        let limiter = Arc::new(CoreLimiter::new(Arc::new(NullRuntime::default())));
        limiter.start(&load_config(&dir), dir.path()).unwrap();

        let mut handles = Vec::new();
        for t in 0..4 {
            let limiter = limiter.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..8 {
                    let _guard = limiter.request(t, i);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        limiter.shutdown();
    }

    #[test]
    fn shutdown_is_idempotent_and_marks_slot_dead() {
        let die = test_region_name("stop");
        let dir = config_dir(die.trim_start_matches('/'), 2, 50);
        let limiter = CoreLimiter::new(Arc::new(NullRuntime::default()));
        limiter.start(&load_config(&dir), dir.path()).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        limiter.shutdown();
        limiter.shutdown();

        let shm = Shm::init(&region_name(die.trim_start_matches('/')), REGION_SIZE).unwrap();
        let sched = TimesliceScheduler::attach(3, shm, 50).unwrap();
        assert_eq!(sched.region_view().heartbeat(2), 0);
    }

    #[test]
    fn missing_ids_config_fails_start() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = std::fs::File::create(dir.path().join("vgpu.config")).unwrap();
        write!(cfg, "UsedMem:1024\nUsedCores:50\n").unwrap();
        let limiter = CoreLimiter::new(Arc::new(NullRuntime::default()));
        let config = ResourceConfig::load(&dir.path().join("vgpu.config")).unwrap();
        assert!(limiter.start(&config, dir.path()).is_err());
    }
}
