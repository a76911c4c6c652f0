use std::{
    sync::atomic::{AtomicU8, Ordering},
    time::{Duration, Instant},
};

use log::info;
use parking_lot::Mutex;

use crate::{HdrSeq, SuspendibleThreadSet};

/// Cancellation state of the running cycle.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelState {
    /// Idle: workers may claim a no-yield window.
    Cancellable = 0,
    /// A worker holds the no-yield window.
    NotCancelled = 1,
    /// The cycle must unwind. Sticky until cleared.
    Cancelled = 2,
}

impl From<u8> for CancelState {
    fn from(val: u8) -> Self {
        match val {
            1 => CancelState::NotCancelled,
            2 => CancelState::Cancelled,
            _ => CancelState::Cancellable,
        }
    }
}

/// Why a cycle was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelCause {
    AllocationFailure,
    AllocationFailureEvac,
    DegenerateRequested,
    FullRequested,
    Shutdown,
}

#[derive(Debug, Default)]
struct CancelRecord {
    requested: Option<Instant>,
    cause: Option<CancelCause>,
    latencies: HdrSeq,
}

/// Tri-state cancellation flag owned by the heap.
#[derive(Debug)]
pub struct CancelFlag {
    state: AtomicU8,
    record: Mutex<CancelRecord>,
}

impl Default for CancelFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelFlag {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(CancelState::Cancellable as u8),
            record: Mutex::new(CancelRecord::default()),
        }
    }

    #[inline(always)]
    pub fn state(&self) -> CancelState {
        CancelState::from(self.state.load(Ordering::Acquire))
    }

    #[inline(always)]
    pub fn is_cancelled(&self) -> bool {
        self.state() == CancelState::Cancelled
    }

    /// Forces the cancelled state. Returns true if this call performed the
    /// transition.
    pub fn cancel(&self, cause: CancelCause) -> bool {
        let prev = self
            .state
            .swap(CancelState::Cancelled as u8, Ordering::AcqRel);
        if CancelState::from(prev) == CancelState::Cancelled {
            return false;
        }
        let mut record = self.record.lock();
        record.requested = Some(Instant::now());
        record.cause = Some(cause);
        info!("cancelling GC: {cause:?}");
        true
    }

    /// Cooperative cancellation check.
    ///
    /// Outside of a suspendible worker this is [`is_cancelled`]. Inside, the
    /// caller claims the no-yield window, parks if the thread set asks it
    /// to, and the claimant gives the window back. A cancellation that lands
    /// meanwhile is never overwritten.
    ///
    /// [`is_cancelled`]: CancelFlag::is_cancelled
    pub fn check_and_yield(
        &self,
        sts_active: bool,
        suspendible_workers: bool,
        sts: &SuspendibleThreadSet,
    ) -> bool {
        if !(sts_active && suspendible_workers) {
            return self.is_cancelled();
        }

        let prev = match self.state.compare_exchange(
            CancelState::Cancellable as u8,
            CancelState::NotCancelled as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(prev) | Err(prev) => CancelState::from(prev),
        };

        match prev {
            CancelState::Cancelled => true,
            CancelState::Cancellable | CancelState::NotCancelled => {
                if sts.should_yield() {
                    sts.yield_point();
                }
                if prev == CancelState::Cancellable {
                    let _ = self.state.compare_exchange(
                        CancelState::NotCancelled as u8,
                        CancelState::Cancellable as u8,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                }
                false
            }
        }
    }

    /// Returns to cancellable and records the cancel to clear latency.
    pub fn clear(&self) -> Option<Duration> {
        self.state
            .store(CancelState::Cancellable as u8, Ordering::Release);
        let mut record = self.record.lock();
        record.cause = None;
        let elapsed = record.requested.take()?.elapsed();
        record.latencies.add(elapsed.as_secs_f64());
        info!("GC cancellation took {:.3}s", elapsed.as_secs_f64());
        Some(elapsed)
    }

    pub fn cause(&self) -> Option<CancelCause> {
        self.record.lock().cause
    }

    /// Snapshot of recorded cancellation latencies, in seconds.
    pub fn latencies(&self) -> HdrSeq {
        self.record.lock().latencies.clone()
    }
}
