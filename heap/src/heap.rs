//! Region-based evacuating heap.
//!
//! The heap is split into fixed-size regions owned by the young or the old
//! generation. A collection cycle evacuates the live objects of a
//! collection set while mutators keep running, forwarding every moved
//! object through its mark word, and then rewrites stale references.
//!
//! This crate does not trace. Consumers mark live objects in the
//! [`MarkingContext`], pick a [`CollectionSet`] and drive the cycle with the
//! functions in [`crate::cycle`], or call [`HeapInner::evacuate_object`] and
//! the update functions directly from their barriers.

use std::{
    ops::Deref,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering},
    },
};

use bitflags::bitflags;
use log::{info, warn};
use object::{
    HEADER_WORDS, MIN_OBJECT_WORDS, OBJECT_ALIGN_WORDS, ObjRef, WORD_SIZE,
    align_object_words, init_object,
};

use crate::{
    Affiliation, AllocError, AllocRequest, CancelCause, CancelFlag, CardTable,
    CollectionSet, ControlCounters, Controller, EvacReserves, FreeSet,
    GcThread, HeapError, HeapSettings, MarkingContext, OomEvacHandler, Region,
    RegionTable, Reservation, SuspendibleThreadSet,
};

bitflags! {
    /// Phase bits of the running cycle, readable by barriers.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct GcState: u8 {
        /// Some objects may be forwarded; readers must resolve.
        const HAS_FORWARDED = 1 << 0;
        const MARKING = 1 << 1;
        const EVACUATION = 1 << 2;
        const UPDATE_REFS = 1 << 3;
        /// The cycle collects the young generation only.
        const YOUNG_CYCLE = 1 << 4;
        /// Survivors of this cycle grow older.
        const AGING_CYCLE = 1 << 5;
    }
}

// ── HeapInner ─────────────────────────────────────────────────────────

/// Core shared heap state.
#[derive(Debug)]
pub struct HeapInner {
    pub settings: HeapSettings,
    pub regions: RegionTable,
    pub cset: CollectionSet,
    pub marking: MarkingContext,
    pub cards: CardTable,
    pub free_set: FreeSet,
    pub reserves: EvacReserves,
    pub cancel: CancelFlag,
    pub sts: SuspendibleThreadSet,
    pub oom_handler: OomEvacHandler,
    controller: Arc<dyn Controller>,
    gc_state: AtomicU8,
    /// Sticky until [`HeapInner::clear_old_evacuation_failure`].
    old_gen_oom_evac: AtomicBool,
    /// Bytes promoted into old regions this cycle.
    old_allocated: AtomicUsize,
    // dropped last: every address above points into it
    reservation: Reservation,
}

impl HeapInner {
    pub fn new(
        settings: HeapSettings,
        controller: Arc<dyn Controller>,
    ) -> Result<Self, HeapError> {
        settings.validate()?;

        let heap_size = settings.heap_size;
        let region_size = settings.region_size;
        let reservation = Reservation::new(heap_size, region_size)
            .ok_or(HeapError::Reserve(heap_size))?;
        let base = reservation.start();

        let regions = RegionTable::new(base, region_size, settings.region_count());
        let cset = CollectionSet::new(&regions, region_size);
        let marking = MarkingContext::new(&regions);
        let cards = CardTable::new(base, heap_size, settings.card_size);

        let reserves = EvacReserves::default();
        reserves.young.set_reserve(heap_size);
        reserves.old.set_reserve(heap_size);
        reserves.promotion.set_reserve(heap_size);

        info!(
            "heap of {} regions x {} KB at {:#x}, generational: {}",
            regions.len(),
            region_size / 1024,
            base,
            settings.generational
        );

        Ok(Self {
            settings,
            regions,
            cset,
            marking,
            cards,
            free_set: FreeSet::new(),
            reserves,
            cancel: CancelFlag::new(),
            sts: SuspendibleThreadSet::new(),
            oom_handler: OomEvacHandler::new(),
            controller,
            gc_state: AtomicU8::new(0),
            old_gen_oom_evac: AtomicBool::new(false),
            old_allocated: AtomicUsize::new(0),
            reservation,
        })
    }

    #[inline(always)]
    pub fn base(&self) -> usize {
        self.reservation.start()
    }

    #[inline(always)]
    pub fn end(&self) -> usize {
        self.reservation.end()
    }

    #[inline(always)]
    pub fn is_in(&self, addr: usize) -> bool {
        self.regions.contains(addr)
    }

    #[inline(always)]
    pub fn is_generational(&self) -> bool {
        self.settings.generational
    }

    pub fn controller(&self) -> &dyn Controller {
        self.controller.as_ref()
    }

    /// Evacuation context for a worker or mutator of this heap.
    #[must_use]
    pub fn thread(&self) -> GcThread {
        GcThread::new(&self.settings)
    }

    // ── regions ───────────────────────────────────────────────────

    #[inline(always)]
    pub fn region_containing(&self, addr: usize) -> &Region {
        self.regions.region_containing(addr)
    }

    #[inline(always)]
    pub fn region_index_containing(&self, addr: usize) -> usize {
        self.regions.index_containing(addr)
    }

    #[inline(always)]
    pub fn in_collection_set(&self, obj: ObjRef) -> bool {
        self.cset.is_in(obj)
    }

    #[inline(always)]
    pub fn in_collection_set_loc(&self, addr: usize) -> bool {
        self.cset.is_in_loc(addr)
    }

    /// Old object, seen from a young collection.
    #[inline]
    pub fn is_old(&self, obj: ObjRef) -> bool {
        self.is_gc_generation_young() && self.region_containing(obj.addr()).is_old()
    }

    // ── gc state ──────────────────────────────────────────────────

    #[inline(always)]
    pub fn gc_state(&self) -> GcState {
        GcState::from_bits_truncate(self.gc_state.load(Ordering::Acquire))
    }

    pub fn set_gc_state(&self, flags: GcState, value: bool) {
        if value {
            self.gc_state.fetch_or(flags.bits(), Ordering::AcqRel);
        } else {
            self.gc_state.fetch_and(!flags.bits(), Ordering::AcqRel);
        }
    }

    #[inline(always)]
    pub fn has_forwarded_objects(&self) -> bool {
        self.gc_state().contains(GcState::HAS_FORWARDED)
    }

    #[inline(always)]
    pub fn is_idle(&self) -> bool {
        !self.gc_state().intersects(
            GcState::MARKING | GcState::EVACUATION | GcState::UPDATE_REFS,
        )
    }

    #[inline(always)]
    pub fn is_concurrent_mark_in_progress(&self) -> bool {
        self.gc_state().contains(GcState::MARKING)
    }

    #[inline(always)]
    pub fn is_evacuation_in_progress(&self) -> bool {
        self.gc_state().contains(GcState::EVACUATION)
    }

    #[inline(always)]
    pub fn is_update_refs_in_progress(&self) -> bool {
        self.gc_state().contains(GcState::UPDATE_REFS)
    }

    #[inline(always)]
    pub fn is_gc_generation_young(&self) -> bool {
        self.gc_state().contains(GcState::YOUNG_CYCLE)
    }

    #[inline(always)]
    pub fn is_aging_cycle(&self) -> bool {
        self.gc_state().contains(GcState::AGING_CYCLE)
    }

    pub fn set_evacuation_in_progress(&self, value: bool) {
        if value {
            self.set_gc_state(GcState::HAS_FORWARDED, true);
        }
        self.set_gc_state(GcState::EVACUATION, value);
    }

    // ── evacuation scope and failures ─────────────────────────────

    #[inline]
    pub fn enter_evacuation(&self, thread: &mut GcThread) {
        self.oom_handler.enter_evacuation(thread);
    }

    #[inline]
    pub fn leave_evacuation(&self, thread: &mut GcThread) {
        self.oom_handler.leave_evacuation(thread);
    }

    pub fn handle_promotion_failure(&self) {
        self.controller.notify_promotion_failure();
    }

    /// Remembers that an old-to-old copy could not be allocated, so that a
    /// full collection follows the cycle.
    pub fn handle_old_evacuation_failure(&self) {
        if !self.old_gen_oom_evac.swap(true, Ordering::AcqRel) {
            warn!("old generation evacuation failed");
            self.controller.notify_old_evacuation_failure();
        }
    }

    /// Consumes the old evacuation failure. True if one was pending.
    pub fn clear_old_evacuation_failure(&self) -> bool {
        self.old_gen_oom_evac
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    pub fn old_evacuation_failed(&self) -> bool {
        self.old_gen_oom_evac.load(Ordering::Acquire)
    }

    pub fn handle_alloc_failure_evac(&self, words: usize) {
        self.controller
            .notify_allocation_failure_during_evacuation(words);
        self.cancel_gc(CancelCause::AllocationFailureEvac);
    }

    pub fn old_allocated(&self) -> usize {
        self.old_allocated.load(Ordering::Relaxed)
    }

    pub fn increase_old_allocated(&self, bytes: usize) {
        self.old_allocated.fetch_add(bytes, Ordering::Relaxed);
    }

    // ── cancellation ──────────────────────────────────────────────

    #[inline(always)]
    pub fn cancelled_gc(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_gc(&self, cause: CancelCause) -> bool {
        self.cancel.cancel(cause)
    }

    /// Cancellation check for workers. `sts_active` says whether the caller
    /// has joined the suspendible thread set.
    #[inline]
    pub fn check_cancelled_gc_and_yield(&self, sts_active: bool) -> bool {
        self.cancel.check_and_yield(
            sts_active,
            self.settings.suspendible_workers,
            &self.sts,
        )
    }

    pub fn clear_cancelled_gc(&self, clear_oom_handler: bool) {
        self.cancel.clear();
        if clear_oom_handler {
            self.oom_handler.clear();
        }
    }

    // ── cards ─────────────────────────────────────────────────────

    pub fn dirty_cards(&self, start: usize, end: usize) {
        debug_assert!(self.is_generational());
        self.cards.mark_range_as_dirty(start, end - start);
    }

    pub fn clear_cards(&self, start: usize, end: usize) {
        debug_assert!(self.is_generational());
        self.cards.mark_range_as_clean(start, end - start);
    }

    pub fn clear_cards_for(&self, region: &Region) {
        if self.is_generational() {
            self.cards
                .mark_range_as_empty(region.bottom(), region.end() - region.bottom());
        }
    }

    /// Post-write hook for stores of young references into old objects.
    #[inline]
    pub fn mark_card_as_dirty(&self, addr: usize) {
        if self.is_generational() {
            self.cards.mark_card_as_dirty(addr);
        }
    }

    // ── allocation ────────────────────────────────────────────────

    #[inline]
    pub fn allocate_memory(&self, req: &mut AllocRequest) -> Option<usize> {
        self.free_set.allocate(&self.regions, &self.reserves, req)
    }

    /// Mutator allocation of a plain object with `refs` reference slots.
    ///
    /// The size is rounded up to the object alignment. Objects larger than
    /// a region are humongous and never move.
    pub fn allocate_object(
        &self,
        generation: Affiliation,
        words: usize,
        refs: usize,
    ) -> Result<ObjRef, AllocError> {
        let words = align_object_words(words.max(MIN_OBJECT_WORDS));
        if HEADER_WORDS + refs > words || words > u32::MAX as usize {
            return Err(AllocError::BadLayout { words, refs });
        }
        let generation = match generation {
            Affiliation::Old if self.is_generational() => Affiliation::Old,
            _ => Affiliation::Young,
        };

        let addr = if words > self.regions.region_words() {
            self.free_set
                .allocate_humongous(&self.regions, words, generation)
        } else {
            self.allocate_memory(&mut AllocRequest::for_shared(words, generation))
        };
        let addr = addr.ok_or(AllocError::OutOfMemory { words, generation })?;

        // SAFETY: the free set handed out `words` fresh words at `addr`
        let obj = unsafe { init_object(addr, words, refs) };
        if generation == Affiliation::Old {
            self.cards.register_object(addr);
        }
        Ok(obj)
    }

    // ── iteration ─────────────────────────────────────────────────

    /// Calls `f` for every live object of `region` that starts below
    /// `limit`.
    ///
    /// Below top-at-mark-start the bitmap is consulted; above it every
    /// object is live and the region is walked by size. Fillers are
    /// skipped.
    pub fn marked_object_iterate(
        &self,
        region: &Region,
        limit: usize,
        mut f: impl FnMut(ObjRef),
    ) {
        debug_assert!(!region.is_humongous_continuation());
        const GRANULE: usize = OBJECT_ALIGN_WORDS * WORD_SIZE;

        let bitmap = self.marking.bitmap();
        let tams = self.marking.top_at_mark_start(region).min(region.end());
        let limit_bitmap = limit.min(tams);

        let mut cb = bitmap.next_marked_addr(region.bottom(), limit_bitmap);
        while cb < limit_bitmap {
            // SAFETY: marked addresses are object starts
            f(unsafe { ObjRef::from_addr_unchecked(cb) });
            cb += GRANULE;
            if cb < limit_bitmap {
                cb = bitmap.next_marked_addr(cb, limit_bitmap);
            }
        }

        let mut cs = tams;
        while cs < limit {
            // SAFETY: regions are parseable above top-at-mark-start
            let obj = unsafe { ObjRef::from_addr_unchecked(cs) };
            let size = obj.size_bytes();
            debug_assert!(size > 0, "unparseable region at {cs:#x}");
            if size == 0 {
                break;
            }
            if !obj.header().is_filler() {
                f(obj);
            }
            cs += size;
        }
    }
}

// ── Heap (Arc wrapper) ────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Heap(Arc<HeapInner>);

impl Heap {
    /// A heap reporting to a default [`ControlCounters`].
    pub fn new(settings: HeapSettings) -> Result<Self, HeapError> {
        Self::with_controller(settings, Arc::new(ControlCounters::default()))
    }

    pub fn with_controller(
        settings: HeapSettings,
        controller: Arc<dyn Controller>,
    ) -> Result<Self, HeapError> {
        Ok(Self(Arc::new(HeapInner::new(settings, controller)?)))
    }
}

impl Deref for Heap {
    type Target = HeapInner;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}
