use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Counting semaphore with a take-all primitive.
///
/// The admission handshake needs to observe the exact number of permits
/// outstanding at the end of a batch window, which the std primitives do
/// not offer; a counter under a mutex does.
pub struct Sem {
    count: Mutex<usize>,
    cv: Condvar,
}

impl Sem {
    pub fn new(count: usize) -> Self {
        Self {
            count: Mutex::new(count),
            cv: Condvar::new(),
        }
    }

    pub fn release(&self, n: usize) {
        let mut count = self.count.lock().unwrap();
        *count += n;
        self.cv.notify_all();
    }

    pub fn acquire(&self, n: usize) {
        let mut count = self.count.lock().unwrap();
        while *count < n {
            count = self.cv.wait(count).unwrap();
        }
        *count -= n;
    }

    /// Take every permit currently available without blocking.
    pub fn acquire_all(&self) -> usize {
        let mut count = self.count.lock().unwrap();
        std::mem::take(&mut *count)
    }

    /// Acquire `n` permits unless `wait_max` elapses first.
    pub fn try_acquire_for(&self, n: usize, wait_max: Duration) -> bool {
        let count = self.count.lock().unwrap();
        let (mut count, result) = self
            .cv
            .wait_timeout_while(count, wait_max, |count| *count < n)
            .unwrap();
        if result.timed_out() {
            return false;
        }
        *count -= n;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn release_wakes_blocked_acquire() {
        let sem = Arc::new(Sem::new(0));
        let waiter = {
            let sem = sem.clone();
            thread::spawn(move || sem.acquire(3))
        };
        for _ in 0..3 {
            sem.release(1);
        }
        waiter.join().unwrap();
        assert_eq!(sem.acquire_all(), 0);
    }

    #[test]
    fn acquire_all_drains_exact_count() {
        let sem = Sem::new(0);
        sem.release(7);
        assert_eq!(sem.acquire_all(), 7);
        assert_eq!(sem.acquire_all(), 0);
    }

    #[test]
    fn try_acquire_for_times_out() {
        let sem = Sem::new(1);
        assert!(!sem.try_acquire_for(2, Duration::from_millis(20)));
        // The single permit must still be there.
        assert!(sem.try_acquire_for(1, Duration::from_millis(20)));
    }

    #[test]
    fn permits_balance_across_threads() {
        let sem = Arc::new(Sem::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let sem = sem.clone();
            handles.push(thread::spawn(move || {
                sem.acquire(1);
                sem.release(1);
            }));
        }
        sem.release(8);
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(sem.acquire_all(), 8);
    }
}
