//! Bounded pool of worker slots.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

/// A fixed set of numbered worker slots.
///
/// A slot is held by a job for its whole execution, including teardown,
/// and returns to the pool when the [`WorkerSlot`] is dropped.
#[derive(Debug)]
pub struct WorkerPool {
    size: usize,
    free: Mutex<BTreeSet<usize>>,
}

impl WorkerPool {
    pub fn new(size: usize) -> Arc<Self> {
        Arc::new(Self {
            size,
            free: Mutex::new((0..size).collect()),
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn available(&self) -> usize {
        self.free.lock().map(|free| free.len()).unwrap_or(0)
    }

    pub fn in_use(&self) -> usize {
        self.size - self.available()
    }

    /// Take the lowest numbered free slot, if any.
    pub fn try_acquire(self: &Arc<Self>) -> Option<WorkerSlot> {
        let mut free = self.free.lock().ok()?;
        let id = free.pop_first()?;
        Some(WorkerSlot {
            id,
            pool: Arc::clone(self),
        })
    }

    fn release(&self, id: usize) {
        if let Ok(mut free) = self.free.lock() {
            free.insert(id);
        }
    }
}

/// Exclusive use of one worker slot.
#[derive(Debug)]
pub struct WorkerSlot {
    id: usize,
    pool: Arc<WorkerPool>,
}

impl WorkerSlot {
    pub fn id(&self) -> usize {
        self.id
    }
}

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        self.pool.release(self.id);
    }
}
