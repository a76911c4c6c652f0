use std::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};

/// A byte budget and how much of it has been spent this cycle.
#[derive(Debug, Default)]
pub struct Budget {
    reserve: AtomicUsize,
    expended: AtomicUsize,
}

impl Budget {
    #[inline(always)]
    pub fn reserve(&self) -> usize {
        self.reserve.load(Ordering::Relaxed)
    }

    /// Returns the previous reserve.
    #[inline]
    pub fn set_reserve(&self, bytes: usize) -> usize {
        self.reserve.swap(bytes, Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn expended(&self) -> usize {
        self.expended.load(Ordering::Relaxed)
    }

    /// Adds to the expended total and returns the new total.
    #[inline]
    pub fn expend(&self, bytes: usize) -> usize {
        self.expended.fetch_add(bytes, Ordering::Relaxed) + bytes
    }

    /// Gives back bytes from an allocation that was not used.
    #[inline]
    pub fn unexpend(&self, bytes: usize) {
        let _ = self
            .expended
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |spent| {
                Some(spent.saturating_sub(bytes))
            });
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.reserve().saturating_sub(self.expended())
    }

    #[inline]
    pub fn reset_expended(&self) {
        self.expended.store(0, Ordering::Relaxed);
    }
}

/// Per-cycle evacuation budgets.
///
/// Set by the sizing heuristic at cycle start and consumed by the copy
/// allocators. Accounting is approximate: races only skew heuristics.
#[derive(Debug, Default)]
pub struct EvacReserves {
    pub young: Budget,
    pub old: Budget,
    pub promotion: Budget,
    /// Bytes the mutator may borrow from (positive) or must give back to
    /// (negative) the old generation.
    alloc_supplement: AtomicIsize,
    previous_promotion: AtomicUsize,
    captured_old_usage: AtomicUsize,
    /// Totals flushed from retired thread buffers this cycle.
    promoted: AtomicUsize,
    evacuated: AtomicUsize,
}

impl EvacReserves {
    /// Returns the previous supplement.
    pub fn set_alloc_supplement_reserve(&self, bytes: isize) -> isize {
        self.alloc_supplement.swap(bytes, Ordering::Relaxed)
    }

    pub fn alloc_supplement_reserve(&self) -> isize {
        self.alloc_supplement.load(Ordering::Relaxed)
    }

    pub fn set_previous_promotion(&self, bytes: usize) {
        self.previous_promotion.store(bytes, Ordering::Relaxed);
    }

    pub fn previous_promotion(&self) -> usize {
        self.previous_promotion.load(Ordering::Relaxed)
    }

    /// Returns the previously captured usage.
    pub fn capture_old_usage(&self, bytes: usize) -> usize {
        self.captured_old_usage.swap(bytes, Ordering::Relaxed)
    }

    pub fn captured_old_usage(&self) -> usize {
        self.captured_old_usage.load(Ordering::Relaxed)
    }

    pub fn record_promoted(&self, bytes: usize) {
        if bytes > 0 {
            self.promoted.fetch_add(bytes, Ordering::Relaxed);
        }
    }

    pub fn record_evacuated(&self, bytes: usize) {
        if bytes > 0 {
            self.evacuated.fetch_add(bytes, Ordering::Relaxed);
        }
    }

    pub fn promoted(&self) -> usize {
        self.promoted.load(Ordering::Relaxed)
    }

    pub fn evacuated(&self) -> usize {
        self.evacuated.load(Ordering::Relaxed)
    }

    /// Starts a new cycle: clears spending and moves this cycle's promotion
    /// total into `previous_promotion`.
    pub fn reset_for_cycle(&self) {
        self.young.reset_expended();
        self.old.reset_expended();
        self.promotion.reset_expended();
        let promoted = self.promoted.swap(0, Ordering::Relaxed);
        self.set_previous_promotion(promoted);
        self.evacuated.store(0, Ordering::Relaxed);
    }
}
