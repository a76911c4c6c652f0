use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct StsState {
    joined: usize,
    stopped: usize,
    suspend_all: bool,
}

/// Rendezvous between suspendible workers and a coordinator.
///
/// Workers `join` before doing concurrent work and poll [`should_yield`]
/// at safe points. A coordinator calls [`synchronize`] to wait until every
/// joined worker is parked in [`yield_point`] or has left, and
/// [`desynchronize`] to let them run again.
///
/// [`should_yield`]: SuspendibleThreadSet::should_yield
/// [`synchronize`]: SuspendibleThreadSet::synchronize
/// [`desynchronize`]: SuspendibleThreadSet::desynchronize
/// [`yield_point`]: SuspendibleThreadSet::yield_point
#[derive(Debug, Default)]
pub struct SuspendibleThreadSet {
    state: Mutex<StsState>,
    cvar: Condvar,
    suspend_requested: AtomicBool,
}

impl SuspendibleThreadSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Joins the set, waiting out a synchronization in progress.
    pub fn join(&self) {
        let mut state = self.state.lock();
        while state.suspend_all {
            self.cvar.wait(&mut state);
        }
        state.joined += 1;
    }

    pub fn leave(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.joined > 0, "leave without join");
        state.joined -= 1;
        if state.suspend_all && state.stopped == state.joined {
            self.cvar.notify_all();
        }
    }

    /// Joins for the lifetime of the returned guard.
    pub fn joiner(&self) -> StsJoiner<'_> {
        self.join();
        StsJoiner { sts: self }
    }

    #[inline(always)]
    pub fn should_yield(&self) -> bool {
        self.suspend_requested.load(Ordering::Acquire)
    }

    /// Parks the calling worker while a synchronization is in progress.
    pub fn yield_point(&self) {
        let mut state = self.state.lock();
        if !state.suspend_all {
            return;
        }
        state.stopped += 1;
        if state.stopped == state.joined {
            self.cvar.notify_all();
        }
        while state.suspend_all {
            self.cvar.wait(&mut state);
        }
        state.stopped -= 1;
    }

    /// Blocks until every joined worker is parked.
    pub fn synchronize(&self) {
        let mut state = self.state.lock();
        debug_assert!(!state.suspend_all, "nested synchronize");
        state.suspend_all = true;
        self.suspend_requested.store(true, Ordering::Release);
        while state.stopped < state.joined {
            self.cvar.wait(&mut state);
        }
    }

    pub fn desynchronize(&self) {
        let mut state = self.state.lock();
        state.suspend_all = false;
        self.suspend_requested.store(false, Ordering::Release);
        self.cvar.notify_all();
    }

    pub fn joined(&self) -> usize {
        self.state.lock().joined
    }
}

/// Membership in a [`SuspendibleThreadSet`], left on drop.
#[derive(Debug)]
pub struct StsJoiner<'a> {
    sts: &'a SuspendibleThreadSet,
}

impl StsJoiner<'_> {
    pub fn yield_if_requested(&self) {
        if self.sts.should_yield() {
            self.sts.yield_point();
        }
    }
}

impl Drop for StsJoiner<'_> {
    fn drop(&mut self) {
        self.sts.leave();
    }
}
