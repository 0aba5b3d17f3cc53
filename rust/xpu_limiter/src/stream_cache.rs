use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use log::warn;

use crate::device::{KernelRuntime, RawContext, RawStream};

struct Slot {
    ctx: AtomicUsize,
    stream: AtomicUsize,
}

/// Fixed-capacity record of the streams touched during one admission batch.
///
/// `push` may be called concurrently from request guards. `drain` must not
/// overlap with pushes; the admission handshake guarantees that, since it
/// only drains after every admitted request guard has acknowledged.
pub struct StreamCache {
    slots: Vec<Slot>,
    cursor: AtomicUsize,
}

impl StreamCache {
    pub fn with_capacity(capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| Slot {
                ctx: AtomicUsize::new(0),
                stream: AtomicUsize::new(0),
            })
            .collect();
        Self {
            slots,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn push(&self, ctx: RawContext, stream: RawStream) -> bool {
        let idx = self.cursor.fetch_add(1, Ordering::AcqRel);
        if idx >= self.slots.len() {
            return false;
        }
        self.slots[idx].ctx.store(ctx, Ordering::Relaxed);
        self.slots[idx].stream.store(stream, Ordering::Release);
        true
    }

    pub fn pending(&self) -> usize {
        self.cursor.load(Ordering::Acquire).min(self.slots.len())
    }

    /// Synchronize every recorded stream, then reset the cursor so the next
    /// batch starts empty.
    pub fn drain(&self, runtime: &dyn KernelRuntime) {
        let count = self.pending();
        for slot in &self.slots[..count] {
            let ctx = slot.ctx.load(Ordering::Relaxed);
            let stream = slot.stream.load(Ordering::Acquire);
            if let Err(e) = runtime.set_context(ctx) {
                warn!("set context failed: {:#}", e);
                std::thread::sleep(Duration::from_secs(1));
                continue;
            }
            if let Err(e) = runtime.synchronize_stream(stream) {
                warn!("stream synchronize failed: {:#}", e);
                std::thread::sleep(Duration::from_secs(1));
                continue;
            }
        }
        self.cursor.store(0, Ordering::Release);
    }
}
