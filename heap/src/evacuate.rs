//! Evacuation of single objects.
//!
//! `evacuate_object` is called by workers walking the collection set and
//! by mutator barriers that touch an object before it has been moved. Both
//! converge on one copy through [`try_install_forward`].

use log::trace;
use object::{ObjRef, WORD_SIZE, copy_object_body, fill_with_object};

use crate::{
    Affiliation, AllocRequest, GcThread, HeapInner, Region, resolve_forwarded,
    try_install_forward,
};

/// Where a copy's memory came from, for rollback on a lost race.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CopySource {
    Gclab,
    Plab,
    Shared,
}

impl HeapInner {
    // ── copy buffers ──────────────────────────────────────────────

    /// Bump allocates a young copy from the thread's GCLAB, refilling it
    /// when the remainder is small enough to throw away.
    pub fn allocate_from_gclab(
        &self,
        thread: &mut GcThread,
        words: usize,
    ) -> Option<usize> {
        let lab = thread.gclab.as_mut()?;
        let addr = match lab.allocate(words) {
            Some(addr) => addr,
            None => self.allocate_from_gclab_slow(thread, words)?,
        };
        thread.gclab_evacuated += words * WORD_SIZE;
        Some(addr)
    }

    #[cold]
    #[inline(never)]
    fn allocate_from_gclab_slow(
        &self,
        thread: &mut GcThread,
        words: usize,
    ) -> Option<usize> {
        let settings = &self.settings;
        let lab = thread.gclab.as_ref()?;

        // too much left to discard, copy this one outside the buffer
        if lab.words_remaining() > lab.capacity_words() / settings.lab_refill_waste_fraction {
            return None;
        }

        let new_size = (thread.gclab_size * 2)
            .clamp(settings.min_lab_words, settings.max_lab_words);
        if new_size < words {
            return None;
        }
        let min_size = words.max(settings.min_lab_words).min(new_size);

        self.retire_gclab(thread);
        let mut req = AllocRequest::for_gclab(min_size, new_size);
        let buf = self.allocate_memory(&mut req)?;
        trace!("new GCLAB of {} words at {buf:#x}", req.actual_words());

        thread.gclab_size = new_size;
        thread.stats.lab_refills += 1;
        let lab = thread.gclab.as_mut()?;
        lab.set_buf(buf, req.actual_words());
        lab.allocate(words)
    }

    /// Bump allocates an old copy from the thread's PLAB.
    ///
    /// Promotions are refused outright while the thread may not promote,
    /// without touching the buffer.
    pub fn allocate_from_plab(
        &self,
        thread: &mut GcThread,
        words: usize,
        is_promotion: bool,
    ) -> Option<usize> {
        if is_promotion && !thread.allow_plab_promotions {
            return None;
        }
        let lab = thread.plab.as_mut()?;
        let addr = match lab.allocate(words) {
            Some(addr) => addr,
            None => {
                let addr = self.allocate_from_plab_slow(thread, words)?;
                // the refill may have revoked promotions
                if is_promotion && !thread.allow_plab_promotions {
                    if let Some(lab) = thread.plab.as_mut() {
                        lab.undo_allocation(addr, words);
                    }
                    return None;
                }
                addr
            }
        };

        let bytes = words * WORD_SIZE;
        if is_promotion {
            thread.plab_promoted += bytes;
            let promoted = self.reserves.promoted() + thread.plab_promoted;
            if promoted > self.reserves.promotion.reserve() {
                thread.allow_plab_promotions = false;
            }
        } else {
            thread.plab_evacuated += bytes;
        }
        Some(addr)
    }

    #[cold]
    #[inline(never)]
    fn allocate_from_plab_slow(
        &self,
        thread: &mut GcThread,
        words: usize,
    ) -> Option<usize> {
        let settings = &self.settings;
        let lab = thread.plab.as_ref()?;

        if lab.words_remaining() > lab.capacity_words() / settings.lab_refill_waste_fraction {
            return None;
        }

        let new_size = (thread.plab_size * 2)
            .clamp(settings.min_lab_words, settings.max_lab_words);
        if new_size < words {
            return None;
        }
        let min_size = words.max(settings.min_lab_words).min(new_size);
        // promotions through the new buffer need promotion reserve behind them
        let allow_promotions = self.reserves.promotion.remaining() > 0;

        self.retire_plab(thread);
        let mut req = AllocRequest::for_plab(min_size, new_size);
        let buf = self.allocate_memory(&mut req)?;
        trace!("new PLAB of {} words at {buf:#x}", req.actual_words());

        thread.plab_size = new_size;
        thread.allow_plab_promotions = allow_promotions;
        thread.stats.lab_refills += 1;
        let lab = thread.plab.as_mut()?;
        lab.set_buf(buf, req.actual_words());
        lab.allocate(words)
    }

    fn retire_gclab(&self, thread: &mut GcThread) {
        let Some(lab) = thread.gclab.as_mut() else {
            return;
        };
        let waste = lab.retire();
        thread.stats.lab_waste_words += waste;
        self.reserves.young.unexpend(waste * WORD_SIZE);
        self.reserves.record_evacuated(thread.gclab_evacuated);
        thread.gclab_evacuated = 0;
    }

    fn retire_plab(&self, thread: &mut GcThread) {
        let Some(lab) = thread.plab.as_mut() else {
            return;
        };
        let waste = lab.retire();
        thread.stats.lab_waste_words += waste;
        self.reserves.old.unexpend(waste * WORD_SIZE);
        self.reserves.record_promoted(thread.plab_promoted);
        self.reserves.record_evacuated(thread.plab_evacuated);
        thread.plab_promoted = 0;
        thread.plab_evacuated = 0;
    }

    /// Retires both copy buffers and flushes their byte totals. Must be
    /// called before the regions they point into are walked.
    pub fn retire_labs(&self, thread: &mut GcThread) {
        self.retire_gclab(thread);
        self.retire_plab(thread);
    }

    // ── evacuation ────────────────────────────────────────────────

    /// Returns the canonical copy of `obj`, evacuating it if nobody has.
    ///
    /// Never fails: when no copy can be allocated the failure is reported
    /// through the controller and the cancellation flag, the thread stops
    /// evacuating for the rest of the cycle and the current forwardee (which
    /// may be `obj` itself) is returned.
    pub fn evacuate_object(&self, obj: ObjRef, thread: &mut GcThread) -> ObjRef {
        if thread.oom_during_evac {
            return resolve_forwarded(obj);
        }
        debug_assert!(thread.is_evac_allowed(), "must be inside an evacuation scope");

        let region = self.region_containing(obj.addr());
        debug_assert!(!region.is_humongous(), "humongous objects never move");

        let mark = obj.header().mark();
        if let Some(forwardee) = mark.forwardee() {
            return forwardee;
        }

        let target = region.affiliation();
        if self.is_generational()
            && self.is_gc_generation_young()
            && target == Affiliation::Young
            && self.settings.promote_tenured_objects
            // a displaced header may be changing under a lock owner
            && !mark.has_displaced_mark_helper()
            && region.age() + mark.age() as u32 >= self.settings.tenuring_threshold
            && let Some(copy) = self.try_evacuate_object(obj, thread, region, Affiliation::Old)
        {
            return copy;
        }

        self.try_evacuate_object(obj, thread, region, target)
            .unwrap_or_else(|| resolve_forwarded(obj))
    }

    /// Copies `obj` into `target` and races to publish the copy.
    ///
    /// Returns `None` only when a promotion could not be allocated; the
    /// caller then evacuates within the young generation.
    pub fn try_evacuate_object(
        &self,
        obj: ObjRef,
        thread: &mut GcThread,
        from_region: &Region,
        target: Affiliation,
    ) -> Option<ObjRef> {
        debug_assert_ne!(target, Affiliation::Free);
        let words = obj.size_words();
        let is_promotion = target == Affiliation::Old && from_region.is_young();

        let mut copy = None;
        let mut source = CopySource::Shared;
        match target {
            Affiliation::Old if self.settings.use_plab => {
                copy = self.allocate_from_plab(thread, words, is_promotion);
                if copy.is_none() && words < thread.plab_size {
                    // likely up against the reserve, retry with a minimal buffer
                    thread.plab_size = self.settings.min_lab_words;
                    copy = self.allocate_from_plab(thread, words, is_promotion);
                }
                source = CopySource::Plab;
            }
            Affiliation::Young => {
                copy = self.allocate_from_gclab(thread, words);
                if copy.is_none() && words < thread.gclab_size {
                    thread.gclab_size = self.settings.min_lab_words;
                    copy = self.allocate_from_gclab(thread, words);
                }
                source = CopySource::Gclab;
            }
            _ => {}
        }

        if copy.is_none() {
            let mut req = AllocRequest::for_shared_gc(words, target, is_promotion);
            copy = self.allocate_memory(&mut req);
            source = CopySource::Shared;
        }

        let Some(copy_addr) = copy else {
            if target == Affiliation::Old {
                debug_assert!(self.is_generational());
                if from_region.is_young() {
                    thread.stats.promotion_failures += 1;
                    self.handle_promotion_failure();
                    return None;
                }
                self.handle_old_evacuation_failure();
            }
            thread.stats.alloc_failures += 1;
            self.handle_alloc_failure_evac(words);
            self.oom_handler.handle_out_of_memory_during_evacuation(thread);
            return Some(resolve_forwarded(obj));
        };

        // SAFETY: copy_addr is fresh memory of `words` words owned by this
        // thread; the source is a live object of the same size
        let copy_ref = unsafe {
            copy_object_body(obj.addr(), copy_addr, words);
            ObjRef::from_addr_unchecked(copy_addr)
        };

        // the copy takes the mark it replaces, so the install comes last
        let result = try_install_forward(obj, copy_ref);

        if result == copy_ref {
            if self.is_generational() {
                match target {
                    Affiliation::Old => self.handle_old_evacuation(thread, copy_ref, is_promotion),
                    _ if self.is_aging_cycle() => Self::increase_object_age(copy_ref, 1),
                    _ => {}
                }
            }
            thread.stats.copies_won += 1;
            if source == CopySource::Shared {
                thread.stats.shared_copies += 1;
            }
            return Some(copy_ref);
        }

        // lost the race, our copy was never published
        let bytes = words * WORD_SIZE;
        match source {
            CopySource::Gclab => {
                if let Some(lab) = thread.gclab.as_mut() {
                    lab.undo_allocation(copy_addr, words);
                }
                thread.gclab_evacuated -= bytes;
            }
            CopySource::Plab => {
                if let Some(lab) = thread.plab.as_mut() {
                    lab.undo_allocation(copy_addr, words);
                }
                if is_promotion {
                    thread.plab_promoted -= bytes;
                } else {
                    thread.plab_evacuated -= bytes;
                }
            }
            CopySource::Shared => {
                // SAFETY: the range is ours and was never published
                unsafe { fill_with_object(copy_addr, words) };
            }
        }
        thread.stats.copies_lost += 1;
        Some(result)
    }

    /// Remembered-set upkeep for a copy that landed in the old generation.
    fn handle_old_evacuation(&self, thread: &mut GcThread, copy: ObjRef, is_promotion: bool) {
        if is_promotion {
            self.increase_old_allocated(copy.size_bytes());
            thread.stats.promotions += 1;
        }
        self.cards.register_object(copy.addr());
        self.dirty_cards(copy.addr(), copy.end());
    }

    /// Adds `additional` to the age of `obj`, saturating. A displaced
    /// header is aged in its lock record.
    pub fn increase_object_age(obj: ObjRef, additional: u8) {
        let header = obj.header();
        let mut mark = header.mark();
        loop {
            if mark.has_displaced_mark_helper() {
                let displaced = mark.displaced_mark_helper();
                mark.set_displaced_mark_helper(
                    displaced.with_age(displaced.age().saturating_add(additional)),
                );
                return;
            }
            let aged = mark.with_age(mark.age().saturating_add(additional));
            match header.cas_mark(mark, aged) {
                Ok(_) => return,
                Err(witness) => mark = witness,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Barrier, atomic::AtomicUsize};

    use object::{MAX_AGE, MarkWord, data_word, ref_slots};

    use super::*;
    use crate::{
        AllocCounters, CancelCause, ControlCounters, GcState, Heap, HeapSettings,
        heap::tests::test_settings,
    };

    fn heap_with(settings: HeapSettings) -> (Heap, Arc<ControlCounters>) {
        let _ = env_logger::builder().is_test(true).try_init();
        let counters = Arc::new(ControlCounters::default());
        let heap = Heap::with_controller(settings, counters.clone()).unwrap();
        (heap, counters)
    }

    fn filled_object(heap: &Heap, generation: Affiliation, words: usize) -> ObjRef {
        let obj = heap.allocate_object(generation, words, 1).unwrap();
        for i in 0..object::data_len(obj) {
            unsafe { *data_word(obj, i) = 0xC0DE_0000 + i };
        }
        obj
    }

    /// Puts the object's region into the collection set and stops further
    /// allocation into it.
    fn start_evacuation(heap: &Heap, obj: ObjRef) {
        heap.cset.add_region(heap.region_containing(obj.addr()));
        heap.free_set.retire_current_regions();
        heap.set_evacuation_in_progress(true);
    }

    fn give_lab(heap: &Heap, thread: &mut GcThread, old: bool, words: usize) {
        let mut req = if old {
            AllocRequest::for_plab(words, words)
        } else {
            AllocRequest::for_gclab(words, words)
        };
        let buf = heap.allocate_memory(&mut req).unwrap();
        let lab = if old { thread.plab.as_mut() } else { thread.gclab.as_mut() };
        lab.unwrap().set_buf(buf, words);
    }

    fn payload_equal(a: ObjRef, b: ObjRef) -> bool {
        (0..object::data_len(a)).all(|i| unsafe { *data_word(a, i) == *data_word(b, i) })
    }

    #[test]
    fn test_evacuate_copies_and_forwards() {
        let (heap, _) = heap_with(test_settings());
        let obj = filled_object(&heap, Affiliation::Young, 16);
        obj.header().set_mark(MarkWord::prototype().with_hash(7));
        let target = filled_object(&heap, Affiliation::Young, 4);
        ref_slots(obj)[0].store(Some(target));
        start_evacuation(&heap, obj);

        let mut t = heap.thread();
        heap.enter_evacuation(&mut t);
        let copy = heap.evacuate_object(obj, &mut t);
        heap.leave_evacuation(&mut t);

        assert_ne!(copy, obj);
        assert!(!heap.in_collection_set(copy));
        assert_eq!(resolve_forwarded(obj), copy);
        assert_eq!(copy.size_words(), 16);
        assert!(payload_equal(obj, copy));
        assert_eq!(ref_slots(copy)[0].load(), Some(target));
        assert_eq!(copy.header().mark().hash(), 7);
        assert!(!copy.header().mark().is_forwarded());
        assert_eq!(t.gclab_evacuated(), 16 * WORD_SIZE);
        assert_eq!(t.stats().copies_won, 1);

        // idempotent once forwarded
        heap.enter_evacuation(&mut t);
        assert_eq!(heap.evacuate_object(obj, &mut t), copy);
        heap.leave_evacuation(&mut t);
    }

    #[test]
    fn test_losing_race_rewinds_gclab() {
        let (heap, _) = heap_with(test_settings());
        let obj = filled_object(&heap, Affiliation::Young, 16);
        start_evacuation(&heap, obj);
        let region = heap.region_containing(obj.addr());

        let mut a = heap.thread();
        let mut b = heap.thread();
        give_lab(&heap, &mut a, false, 64);
        give_lab(&heap, &mut b, false, 64);
        let b_top = b.gclab().unwrap().top();

        heap.enter_evacuation(&mut a);
        heap.enter_evacuation(&mut b);
        let winner = heap.try_evacuate_object(obj, &mut a, region, Affiliation::Young).unwrap();
        let loser = heap.try_evacuate_object(obj, &mut b, region, Affiliation::Young).unwrap();
        heap.leave_evacuation(&mut a);
        heap.leave_evacuation(&mut b);

        assert_eq!(winner, loser);
        assert_eq!(winner.addr(), a.gclab().unwrap().bottom());
        assert_eq!(b.gclab().unwrap().top(), b_top);
        assert_eq!(b.gclab_evacuated(), 0);
        assert_eq!(b.stats().copies_lost, 1);
    }

    #[test]
    fn test_losing_race_fills_shared_copy() {
        let (heap, _) = heap_with(test_settings());
        let obj = filled_object(&heap, Affiliation::Young, 16);
        start_evacuation(&heap, obj);
        let region = heap.region_containing(obj.addr());

        let mut a = heap.thread();
        let mut b = GcThread::without_labs();
        heap.enter_evacuation(&mut a);
        heap.enter_evacuation(&mut b);
        let winner = heap.evacuate_object(obj, &mut a);

        // b's shared copy lands right after a's GCLAB
        let to_region = heap.region_containing(winner.addr());
        let shared_at = to_region.top();
        let result = heap.try_evacuate_object(obj, &mut b, region, Affiliation::Young).unwrap();
        heap.leave_evacuation(&mut a);
        heap.leave_evacuation(&mut b);

        assert_eq!(result, winner);
        assert_eq!(resolve_forwarded(obj), winner);
        let husk = unsafe { ObjRef::from_addr_unchecked(shared_at) };
        assert!(husk.header().is_filler());
        assert_eq!(husk.size_words(), 16);
    }

    #[test]
    fn test_concurrent_evacuations_converge() {
        const THREADS: usize = 8;
        let (heap, _) = heap_with(test_settings());
        let obj = filled_object(&heap, Affiliation::Young, 16);
        start_evacuation(&heap, obj);
        let barrier = Barrier::new(THREADS);
        let lost = AtomicUsize::new(0);

        let results: Vec<ObjRef> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..THREADS)
                .map(|_| {
                    s.spawn(|| {
                        let mut t = heap.thread();
                        let region = heap.region_containing(obj.addr());
                        heap.enter_evacuation(&mut t);
                        barrier.wait();
                        let r = heap
                            .try_evacuate_object(obj, &mut t, region, Affiliation::Young)
                            .unwrap();
                        heap.leave_evacuation(&mut t);
                        lost.fetch_add(t.stats().copies_lost, std::sync::atomic::Ordering::Relaxed);
                        heap.retire_labs(&mut t);
                        r
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let winner = resolve_forwarded(obj);
        assert!(results.iter().all(|&r| r == winner));
        assert!(payload_equal(obj, winner));
        assert_eq!(lost.load(std::sync::atomic::Ordering::Relaxed), THREADS - 1);
        assert_eq!(heap.reserves.evacuated(), 16 * WORD_SIZE);
    }

    #[test]
    fn test_promotion_gating_leaves_plab_alone() {
        let (heap, _) = heap_with(test_settings());
        let mut t = heap.thread();
        give_lab(&heap, &mut t, true, 64);
        t.set_allow_plab_promotions(false);
        let top = t.plab().unwrap().top();

        assert_eq!(heap.allocate_from_plab(&mut t, 16, true), None);
        assert_eq!(t.plab().unwrap().top(), top);
        assert_eq!(t.plab_promoted(), 0);

        assert_eq!(heap.allocate_from_plab(&mut t, 16, false), Some(top));
        assert_eq!(t.plab_evacuated(), 16 * WORD_SIZE);
    }

    fn young_cycle(heap: &Heap) {
        heap.set_gc_state(GcState::YOUNG_CYCLE, true);
    }

    fn aged(obj: ObjRef, age: u8) {
        obj.header().set_mark(MarkWord::prototype().with_age(age));
    }

    #[test]
    fn test_full_plab_promotes_through_shared_allocator() {
        let (heap, _) = heap_with(test_settings());
        let obj = filled_object(&heap, Affiliation::Young, 16);
        aged(obj, heap.settings.tenuring_threshold as u8);
        young_cycle(&heap);
        start_evacuation(&heap, obj);

        let mut t = heap.thread();
        give_lab(&heap, &mut t, true, 64);
        heap.allocate_from_plab(&mut t, 56, false).unwrap();
        let plab_top = t.plab().unwrap().top();
        assert_eq!(t.plab().unwrap().words_remaining(), 8);

        heap.enter_evacuation(&mut t);
        let copy = heap.evacuate_object(obj, &mut t);
        heap.leave_evacuation(&mut t);

        assert!(heap.region_containing(copy.addr()).is_old());
        assert_eq!(t.plab().unwrap().top(), plab_top);
        assert_eq!(t.plab_size(), heap.settings.min_lab_words);
        assert_eq!(
            AllocCounters::get(&heap.free_set.counters().shared_gc_promotion),
            1
        );
        assert_eq!(heap.old_allocated(), 16 * WORD_SIZE);
        assert!(heap.cards.is_card_dirty(copy.addr()));
        assert_eq!(heap.cards.first_object_in_card(copy.addr()), Some(copy.addr()));
        assert_eq!(t.stats().promotions, 1);
    }

    #[test]
    fn test_old_evacuation_failure() {
        let (heap, counters) = heap_with(test_settings());
        let obj = filled_object(&heap, Affiliation::Old, 16);
        let other = filled_object(&heap, Affiliation::Old, 16);
        start_evacuation(&heap, obj);
        heap.reserves.old.set_reserve(0);

        let mut t = GcThread::without_labs();
        heap.enter_evacuation(&mut t);
        let result = heap.evacuate_object(obj, &mut t);
        assert_eq!(result, obj);
        assert!(t.is_oom_during_evac());
        assert_eq!(counters.old_evacuation_failures(), 1);
        assert_eq!(counters.alloc_failures(), 1);
        assert_eq!(counters.alloc_failure_words(), 16);
        assert!(heap.old_evacuation_failed());
        assert!(heap.cancelled_gc());
        assert_eq!(heap.cancel.cause(), Some(CancelCause::AllocationFailureEvac));
        assert!(heap.oom_handler.is_oom());

        // short-circuits from now on
        assert_eq!(heap.evacuate_object(other, &mut t), other);
        assert_eq!(counters.alloc_failures(), 1);
        heap.leave_evacuation(&mut t);
        assert_eq!(heap.oom_handler.threads_in_evac(), 0);
    }

    #[test]
    fn test_promotion_failure_falls_back_to_young() {
        let (heap, counters) = heap_with(test_settings());
        let obj = filled_object(&heap, Affiliation::Young, 16);
        aged(obj, 10);
        young_cycle(&heap);
        start_evacuation(&heap, obj);
        heap.reserves.old.set_reserve(0);
        heap.reserves.promotion.set_reserve(0);

        let mut t = heap.thread();
        heap.enter_evacuation(&mut t);
        let copy = heap.evacuate_object(obj, &mut t);
        heap.leave_evacuation(&mut t);

        assert_ne!(copy, obj);
        assert!(heap.region_containing(copy.addr()).is_young());
        assert_eq!(counters.promotion_failures(), 1);
        assert_eq!(counters.alloc_failures(), 0);
        assert!(!t.is_oom_during_evac());
        assert!(!heap.cancelled_gc());
    }

    #[test]
    fn test_displaced_header_skips_promotion() {
        let (heap, _) = heap_with(test_settings());
        let obj = filled_object(&heap, Affiliation::Young, 8);
        let record = AtomicUsize::new(MarkWord::prototype().with_age(10).raw());
        obj.header().set_mark(unsafe { MarkWord::locked(&record) });
        young_cycle(&heap);
        heap.set_gc_state(GcState::AGING_CYCLE, true);
        start_evacuation(&heap, obj);

        let mut t = heap.thread();
        heap.enter_evacuation(&mut t);
        let copy = heap.evacuate_object(obj, &mut t);
        heap.leave_evacuation(&mut t);

        assert!(heap.region_containing(copy.addr()).is_young());
        assert!(copy.header().has_displaced_mark());
        assert_eq!(copy.header().identity_mark().age(), 11);
    }

    #[test]
    fn test_aging_saturates() {
        let (heap, _) = heap_with(test_settings());
        let young = filled_object(&heap, Affiliation::Young, 8);
        let old_timer = filled_object(&heap, Affiliation::Young, 8);
        aged(young, 3);
        aged(old_timer, MAX_AGE);
        heap.set_gc_state(GcState::AGING_CYCLE, true);
        start_evacuation(&heap, young);

        let mut t = heap.thread();
        heap.enter_evacuation(&mut t);
        let a = heap.evacuate_object(young, &mut t);
        let b = heap.evacuate_object(old_timer, &mut t);
        heap.leave_evacuation(&mut t);

        assert_eq!(a.header().mark().age(), 4);
        assert_eq!(b.header().mark().age(), MAX_AGE);
        // the original keeps its forwarding mark
        assert!(young.header().mark().is_forwarded());
    }

    #[test]
    fn test_oom_thread_only_resolves() {
        let (heap, _) = heap_with(test_settings());
        let obj = filled_object(&heap, Affiliation::Young, 8);
        start_evacuation(&heap, obj);
        let mut t = heap.thread();
        t.oom_during_evac = true;
        assert_eq!(heap.evacuate_object(obj, &mut t), obj);
        assert!(!t.gclab().unwrap().has_buffer());
    }

    #[test]
    fn test_gclab_refill_doubles_and_retains() {
        let (heap, _) = heap_with(test_settings());
        let initial = heap.settings.initial_lab_words;
        let mut t = heap.thread();

        assert!(heap.allocate_from_gclab(&mut t, 16).is_some());
        assert_eq!(t.gclab_size(), initial * 2);
        assert_eq!(t.gclab().unwrap().capacity_words(), initial * 2);
        assert_eq!(t.stats().lab_refills, 1);

        // far too much left over to retire for this request
        let remaining = t.gclab().unwrap().words_remaining();
        assert_eq!(heap.allocate_from_gclab(&mut t, remaining + 2), None);
        assert_eq!(t.gclab().unwrap().words_remaining(), remaining);

        // larger than any buffer
        let huge = heap.settings.max_lab_words + 2;
        assert_eq!(heap.allocate_from_gclab(&mut t, huge), None);
    }

    #[test]
    fn test_retire_labs_keeps_regions_parseable() {
        let (heap, _) = heap_with(test_settings());
        let objs: Vec<ObjRef> = (0..4)
            .map(|_| filled_object(&heap, Affiliation::Young, 10))
            .collect();
        start_evacuation(&heap, objs[0]);

        let mut t = heap.thread();
        heap.enter_evacuation(&mut t);
        let copies: Vec<ObjRef> = objs.iter().map(|&o| heap.evacuate_object(o, &mut t)).collect();
        heap.leave_evacuation(&mut t);
        heap.retire_labs(&mut t);

        assert!(!t.gclab().unwrap().has_buffer());
        assert_eq!(heap.reserves.evacuated(), 4 * 10 * WORD_SIZE);
        let to_region = heap.region_containing(copies[0].addr());
        let mut seen = Vec::new();
        heap.marked_object_iterate(to_region, to_region.top(), |o| seen.push(o));
        assert_eq!(seen, copies);
    }

    #[test]
    fn test_non_generational_never_promotes() {
        let (heap, _) = heap_with(HeapSettings {
            generational: false,
            ..test_settings()
        });
        let obj = filled_object(&heap, Affiliation::Young, 8);
        aged(obj, MAX_AGE);
        young_cycle(&heap);
        heap.set_gc_state(GcState::AGING_CYCLE, true);
        start_evacuation(&heap, obj);

        let mut t = heap.thread();
        heap.enter_evacuation(&mut t);
        let copy = heap.evacuate_object(obj, &mut t);
        heap.leave_evacuation(&mut t);

        assert!(heap.region_containing(copy.addr()).is_young());
        assert_eq!(heap.cards.dirty_card_count(), 0);
    }
}
