//! Multi-node scheduling scenarios, with every node driven the way the
//! in-process scheduler thread drives it. Threads stand in for sibling
//! container processes; the coordination all happens through the shared
//! region, exactly as it would across real processes.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use xpu_limiter::{Shm, TimesliceScheduler, MAX_NODES, REGION_SIZE};

fn region(tag: &str) -> String {
    static SEQ: AtomicUsize = AtomicUsize::new(0);
    format!(
        "/xpu-itest-{}-{}-{}",
        std::process::id(),
        tag,
        SEQ.fetch_add(1, Ordering::Relaxed)
    )
}

fn attach(name: &str, idx: usize, quota: u32) -> TimesliceScheduler {
    let shm = Shm::init(name, REGION_SIZE).unwrap();
    TimesliceScheduler::attach(idx, shm, quota).unwrap()
}

/// One node's slice loop, counting elections and elected nanoseconds.
fn drive(
    mut sched: TimesliceScheduler,
    stop: Arc<AtomicBool>,
    slices: Arc<AtomicUsize>,
    elected_ns: Arc<AtomicUsize>,
) {
    while !stop.load(Ordering::Relaxed) {
        let begin = sched.update_heartbeat();
        if !sched.try_take_current() {
            thread::yield_now();
            continue;
        }
        let mut end = begin;
        while Duration::from_nanos(end.saturating_sub(begin)) < sched.current_slice() {
            thread::yield_now();
            end = sched.update_heartbeat();
        }
        sched.account_slice(begin, end);
        sched.execute_idle_time();
        sched.release_current();
        slices.fetch_add(1, Ordering::Relaxed);
        elected_ns.fetch_add((end - begin) as usize, Ordering::Relaxed);
    }
}

#[test]
fn init_race_selects_one_initializer() {
    let name = region("initrace");
    let barrier = Arc::new(Barrier::new(5));
    let mut handles = Vec::new();
    for idx in 0..5 {
        let name = name.clone();
        let barrier = barrier.clone();
        handles.push(thread::spawn(move || {
            let shm = Shm::init(&name, REGION_SIZE).unwrap();
            barrier.wait();
            let sched = TimesliceScheduler::attach(idx, shm, 20).unwrap();
            sched.update_heartbeat();
            assert!(sched.region_view().is_ready());
            // Attach again: a ready region is never reformatted.
            let shm = Shm::init(&name, REGION_SIZE).unwrap();
            let again = TimesliceScheduler::attach(idx, shm, 20).unwrap();
            assert!(again.region_view().heartbeat(idx) > 0);
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn crashed_holder_is_replaced_quickly() {
    let name = region("crash");
    let a = attach(&name, 0, 33);
    let b = attach(&name, 1, 33);
    let c = attach(&name, 2, 34);

    a.update_heartbeat();
    b.update_heartbeat();
    c.update_heartbeat();
    assert!(a.try_take_current());

    // Tenant A dies while holding current. Its exit path zeroes the
    // heartbeat, so the survivors do not even wait out the liveness
    // timeout.
    drop(a);
    assert_eq!(b.region_view().heartbeat(0), 0);

    let deadline = Instant::now() + Duration::from_millis(1100);
    loop {
        b.update_heartbeat();
        c.update_heartbeat();
        if b.try_take_current() || c.try_take_current() {
            break;
        }
        assert!(Instant::now() < deadline, "no successor elected in time");
        thread::yield_now();
    }
}

#[test]
fn full_ring_at_minimum_quota_rotates_without_starvation() {
    let name = region("ring");
    let stop = Arc::new(AtomicBool::new(false));
    let mut slices = Vec::new();
    let mut handles = Vec::new();
    // Every slot occupied at the minimum 5% share; the twenty tenants
    // together claim the full 100-unit period.
    for idx in 0..MAX_NODES {
        let sched = attach(&name, idx, 5);
        let stop = stop.clone();
        let count = Arc::new(AtomicUsize::new(0));
        let ns = Arc::new(AtomicUsize::new(0));
        slices.push(count.clone());
        handles.push(thread::spawn(move || drive(sched, stop, count, ns)));
    }

    let deadline = Instant::now() + Duration::from_secs(15);
    while Instant::now() < deadline {
        if slices
            .iter()
            .all(|count| count.load(Ordering::Relaxed) >= 1)
        {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    stop.store(true, Ordering::Relaxed);
    for handle in handles {
        handle.join().unwrap();
    }
    for (idx, count) in slices.iter().enumerate() {
        assert!(
            count.load(Ordering::Relaxed) >= 1,
            "node {} starved",
            idx
        );
    }
}

#[test]
fn elected_time_tracks_quota() {
    let name = region("fair");
    let stop = Arc::new(AtomicBool::new(false));
    let small_ns = Arc::new(AtomicUsize::new(0));
    let large_ns = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for (idx, quota, ns) in [(0, 25, small_ns.clone()), (1, 75, large_ns.clone())] {
        let sched = attach(&name, idx, quota);
        let stop = stop.clone();
        let count = Arc::new(AtomicUsize::new(0));
        handles.push(thread::spawn(move || drive(sched, stop, count, ns)));
    }

    thread::sleep(Duration::from_millis(1500));
    stop.store(true, Ordering::Relaxed);
    for handle in handles {
        handle.join().unwrap();
    }

    let small = small_ns.load(Ordering::Relaxed) as f64;
    let large = large_ns.load(Ordering::Relaxed) as f64;
    assert!(small > 0.0 && large > 0.0);
    // Quotas are 25/75; leave a wide margin for a loaded test host.
    let ratio = large / small;
    assert!(ratio > 1.3, "elected time ratio {:.2} too even", ratio);
}
