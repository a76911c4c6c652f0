use std::sync::atomic::{AtomicUsize, Ordering};

use log::debug;

/// Receives evacuation failure notifications.
///
/// Implementations decide what the next collection should be. Every hook is
/// fire and forget and may be called from any evacuating thread, so none of
/// them may block or allocate on the heap being collected.
pub trait Controller: Send + Sync + std::fmt::Debug {
    fn notify_allocation_failure_during_evacuation(&self, words: usize);
    fn notify_old_evacuation_failure(&self);
    fn notify_promotion_failure(&self);
}

/// Default controller: counts notifications so the next cycle can be
/// upgraded to a degenerated or full collection.
#[derive(Debug, Default)]
pub struct ControlCounters {
    alloc_failures: AtomicUsize,
    alloc_failure_words: AtomicUsize,
    old_evacuation_failures: AtomicUsize,
    promotion_failures: AtomicUsize,
}

impl ControlCounters {
    pub fn alloc_failures(&self) -> usize {
        self.alloc_failures.load(Ordering::Relaxed)
    }

    pub fn alloc_failure_words(&self) -> usize {
        self.alloc_failure_words.load(Ordering::Relaxed)
    }

    pub fn old_evacuation_failures(&self) -> usize {
        self.old_evacuation_failures.load(Ordering::Relaxed)
    }

    pub fn promotion_failures(&self) -> usize {
        self.promotion_failures.load(Ordering::Relaxed)
    }
}

impl Controller for ControlCounters {
    fn notify_allocation_failure_during_evacuation(&self, words: usize) {
        let n = self.alloc_failures.fetch_add(1, Ordering::Relaxed);
        self.alloc_failure_words.fetch_add(words, Ordering::Relaxed);
        if n == 0 {
            debug!("allocation failure during evacuation ({words} words)");
        }
    }

    fn notify_old_evacuation_failure(&self) {
        self.old_evacuation_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn notify_promotion_failure(&self) {
        self.promotion_failures.fetch_add(1, Ordering::Relaxed);
    }
}
