use std::sync::atomic::{AtomicUsize, Ordering};

use log::warn;

use crate::GcThread;

const OOM_MARKER: usize = 1 << (usize::BITS - 1);
const COUNT_MASK: usize = !OOM_MARKER;

/// Out-of-memory-during-evacuation protocol.
///
/// Counts the threads inside an evacuation scope. The first thread that
/// cannot allocate a copy sets the OOM bit; from then on every thread
/// that fails, or that enters a scope, is marked and only resolves
/// forwarding pointers for the rest of the cycle. Nothing here blocks or
/// allocates.
#[derive(Debug, Default)]
pub struct OomEvacHandler {
    threads_in_evac: AtomicUsize,
}

impl OomEvacHandler {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline(always)]
    pub fn is_oom(&self) -> bool {
        self.threads_in_evac.load(Ordering::Acquire) & OOM_MARKER != 0
    }

    #[inline(always)]
    pub fn threads_in_evac(&self) -> usize {
        self.threads_in_evac.load(Ordering::Acquire) & COUNT_MASK
    }

    pub fn enter_evacuation(&self, thread: &mut GcThread) {
        thread.evac_depth += 1;
        if thread.evac_depth > 1 {
            return;
        }
        debug_assert!(!thread.counted_in_evac);

        let mut current = self.threads_in_evac.load(Ordering::Acquire);
        loop {
            if current & OOM_MARKER != 0 {
                thread.oom_during_evac = true;
                return;
            }
            match self.threads_in_evac.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    thread.counted_in_evac = true;
                    return;
                }
                Err(witness) => current = witness,
            }
        }
    }

    pub fn leave_evacuation(&self, thread: &mut GcThread) {
        debug_assert!(thread.evac_depth > 0, "leave without enter");
        thread.evac_depth -= 1;
        if thread.evac_depth > 0 {
            return;
        }
        if thread.counted_in_evac {
            self.threads_in_evac.fetch_sub(1, Ordering::AcqRel);
            thread.counted_in_evac = false;
        }
    }

    /// Sets the OOM bit, takes the caller out of the count and marks it.
    pub fn handle_out_of_memory_during_evacuation(&self, thread: &mut GcThread) {
        let prev = self.threads_in_evac.fetch_or(OOM_MARKER, Ordering::AcqRel);
        if prev & OOM_MARKER == 0 {
            warn!("out of memory during evacuation");
        }
        if thread.counted_in_evac {
            self.threads_in_evac.fetch_sub(1, Ordering::AcqRel);
            thread.counted_in_evac = false;
        }
        thread.oom_during_evac = true;
    }

    /// Resets the protocol once no thread is evacuating.
    pub fn clear(&self) {
        debug_assert_eq!(self.threads_in_evac(), 0, "threads still evacuating");
        self.threads_in_evac.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_scopes_count_once() {
        let handler = OomEvacHandler::new();
        let mut t = GcThread::without_labs();
        handler.enter_evacuation(&mut t);
        handler.enter_evacuation(&mut t);
        assert_eq!(handler.threads_in_evac(), 1);
        handler.leave_evacuation(&mut t);
        assert_eq!(handler.threads_in_evac(), 1);
        handler.leave_evacuation(&mut t);
        assert_eq!(handler.threads_in_evac(), 0);
    }

    #[test]
    fn test_oom_marks_failing_and_entering_threads() {
        let handler = OomEvacHandler::new();
        let mut a = GcThread::without_labs();
        let mut b = GcThread::without_labs();
        handler.enter_evacuation(&mut a);
        handler.enter_evacuation(&mut b);
        assert_eq!(handler.threads_in_evac(), 2);

        handler.handle_out_of_memory_during_evacuation(&mut a);
        assert!(handler.is_oom());
        assert!(a.is_oom_during_evac());
        assert!(!b.is_oom_during_evac());
        assert_eq!(handler.threads_in_evac(), 1);

        // a was already uncounted, leaving must not decrement again
        handler.leave_evacuation(&mut a);
        assert_eq!(handler.threads_in_evac(), 1);

        let mut c = GcThread::without_labs();
        handler.enter_evacuation(&mut c);
        assert!(c.is_oom_during_evac());
        assert_eq!(handler.threads_in_evac(), 1);
        handler.leave_evacuation(&mut c);

        handler.leave_evacuation(&mut b);
        assert_eq!(handler.threads_in_evac(), 0);
        handler.clear();
        assert!(!handler.is_oom());
    }
}
