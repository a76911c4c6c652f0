use std::sync::atomic::{AtomicUsize, Ordering};

use log::{debug, trace};
use object::{OBJECT_ALIGN_WORDS, WORD_SIZE};
use parking_lot::Mutex;

use crate::{Affiliation, Budget, EvacReserves, Region, RegionFlags, RegionTable};

/// Who is asking for memory and what for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocKind {
    /// Mutator allocation outside of any buffer.
    Shared,
    /// Evacuation copy outside of any buffer.
    SharedGc,
    /// A new young copy buffer.
    Gclab,
    /// A new old copy buffer.
    Plab,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocRequest {
    kind: AllocKind,
    affiliation: Affiliation,
    min_words: usize,
    words: usize,
    is_promotion: bool,
    actual_words: usize,
}

impl AllocRequest {
    pub fn for_shared(words: usize, affiliation: Affiliation) -> Self {
        Self::exact(AllocKind::Shared, words, affiliation, false)
    }

    pub fn for_shared_gc(
        words: usize,
        affiliation: Affiliation,
        is_promotion: bool,
    ) -> Self {
        debug_assert!(!is_promotion || affiliation == Affiliation::Old);
        Self::exact(AllocKind::SharedGc, words, affiliation, is_promotion)
    }

    pub fn for_gclab(min_words: usize, words: usize) -> Self {
        Self::lab(AllocKind::Gclab, min_words, words, Affiliation::Young)
    }

    pub fn for_plab(min_words: usize, words: usize) -> Self {
        Self::lab(AllocKind::Plab, min_words, words, Affiliation::Old)
    }

    fn exact(
        kind: AllocKind,
        words: usize,
        affiliation: Affiliation,
        is_promotion: bool,
    ) -> Self {
        Self {
            kind,
            affiliation,
            min_words: words,
            words,
            is_promotion,
            actual_words: 0,
        }
    }

    fn lab(
        kind: AllocKind,
        min_words: usize,
        words: usize,
        affiliation: Affiliation,
    ) -> Self {
        debug_assert!(min_words <= words);
        Self {
            kind,
            affiliation,
            min_words,
            words,
            is_promotion: false,
            actual_words: 0,
        }
    }

    #[inline(always)]
    pub fn kind(&self) -> AllocKind {
        self.kind
    }

    #[inline(always)]
    pub fn affiliation(&self) -> Affiliation {
        self.affiliation
    }

    #[inline(always)]
    pub fn is_promotion(&self) -> bool {
        self.is_promotion
    }

    #[inline(always)]
    pub fn is_gc_alloc(&self) -> bool {
        self.kind != AllocKind::Shared
    }

    #[inline(always)]
    pub fn is_lab_alloc(&self) -> bool {
        matches!(self.kind, AllocKind::Gclab | AllocKind::Plab)
    }

    #[inline(always)]
    pub fn min_words(&self) -> usize {
        self.min_words
    }

    #[inline(always)]
    pub fn words(&self) -> usize {
        self.words
    }

    /// Words handed out, valid after a successful allocation. May be less
    /// than requested for buffers.
    #[inline(always)]
    pub fn actual_words(&self) -> usize {
        self.actual_words
    }
}

/// Counts of served and failed requests, by kind.
#[derive(Debug, Default)]
pub struct AllocCounters {
    pub shared: AtomicUsize,
    pub shared_gc: AtomicUsize,
    pub shared_gc_promotion: AtomicUsize,
    pub gclab: AtomicUsize,
    pub plab: AtomicUsize,
    pub humongous: AtomicUsize,
    pub failed: AtomicUsize,
}

impl AllocCounters {
    fn record(&self, req: &AllocRequest) {
        let counter = match req.kind {
            AllocKind::Shared => &self.shared,
            AllocKind::SharedGc if req.is_promotion => &self.shared_gc_promotion,
            AllocKind::SharedGc => &self.shared_gc,
            AllocKind::Gclab => &self.gclab,
            AllocKind::Plab => &self.plab,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
struct FreeSetState {
    current_young: Option<usize>,
    current_old: Option<usize>,
}

impl FreeSetState {
    fn current(&mut self, affiliation: Affiliation) -> &mut Option<usize> {
        match affiliation {
            Affiliation::Old => &mut self.current_old,
            _ => &mut self.current_young,
        }
    }
}

/// The shared allocator.
///
/// Keeps one current region per generation and bump allocates into it,
/// claiming free regions as they fill up. Evacuation requests are checked
/// against the reserves; mutator requests are not.
#[derive(Debug, Default)]
pub struct FreeSet {
    state: Mutex<FreeSetState>,
    counters: AllocCounters,
}

impl FreeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counters(&self) -> &AllocCounters {
        &self.counters
    }

    /// Budget words available to `req`, before region capacity.
    fn budget_words(reserves: &EvacReserves, req: &AllocRequest) -> usize {
        let bytes = match (req.kind, req.affiliation) {
            (AllocKind::Shared, _) => usize::MAX,
            (AllocKind::Plab, _) => reserves
                .old
                .remaining()
                .saturating_add(reserves.promotion.remaining()),
            (_, Affiliation::Old) if req.is_promotion => reserves.promotion.remaining(),
            (_, Affiliation::Old) => reserves.old.remaining(),
            _ => reserves.young.remaining(),
        };
        bytes / WORD_SIZE
    }

    fn charge(reserves: &EvacReserves, req: &AllocRequest, words: usize) {
        let bytes = words * WORD_SIZE;
        let budget: &Budget = match (req.kind, req.affiliation) {
            (AllocKind::Shared, _) => return,
            (AllocKind::Plab, _) => {
                let from_old = bytes.min(reserves.old.remaining());
                reserves.old.expend(from_old);
                reserves.promotion.expend(bytes - from_old);
                return;
            }
            (_, Affiliation::Old) if req.is_promotion => &reserves.promotion,
            (_, Affiliation::Old) => &reserves.old,
            _ => &reserves.young,
        };
        budget.expend(bytes);
    }

    /// Serves `req` from the current region of its generation, claiming a
    /// new region when the current one cannot fit even the minimum.
    pub fn allocate(
        &self,
        regions: &RegionTable,
        reserves: &EvacReserves,
        req: &mut AllocRequest,
    ) -> Option<usize> {
        let mut state = self.state.lock();

        let budget = Self::budget_words(reserves, req);
        if budget < req.min_words {
            debug!(
                "{:?} request of {} words exceeds {:?} reserve",
                req.kind, req.min_words, req.affiliation
            );
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        let wanted = req.words.min(budget);
        // lab sizes stay object aligned so the tail can hold a filler
        let wanted = if req.is_lab_alloc() {
            wanted & !(OBJECT_ALIGN_WORDS - 1)
        } else {
            wanted
        };
        let wanted = wanted.max(req.min_words);
        if req.min_words > regions.region_words() {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        loop {
            let current = *state.current(req.affiliation);
            if let Some(index) = current {
                let region = regions.get(index)?;
                let words = if req.is_lab_alloc() {
                    wanted.min(region.free_words() & !(OBJECT_ALIGN_WORDS - 1))
                } else {
                    wanted
                };
                if words >= req.min_words
                    && let Some(addr) = region.allocate(words)
                {
                    Self::charge(reserves, req, words);
                    req.actual_words = words;
                    self.counters.record(req);
                    return Some(addr);
                }
            }

            let Some(region) = Self::claim_region(regions, req.affiliation) else {
                debug!(
                    "no free region for {:?} request of {} words",
                    req.kind, req.min_words
                );
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                return None;
            };
            *state.current(req.affiliation) = Some(region.index());
        }
    }

    fn claim_region(regions: &RegionTable, affiliation: Affiliation) -> Option<&Region> {
        let region = regions
            .iter()
            .find(|r| r.is_free() && r.try_claim(affiliation))?;
        region.set_top(region.bottom());
        region.reset_age();
        trace!("claimed region {} for {:?}", region.index(), affiliation);
        Some(region)
    }

    /// Stops allocating into the current regions. Used before evacuation so
    /// that no copy lands in a collection set region.
    pub fn retire_current_regions(&self) {
        let mut state = self.state.lock();
        state.current_young = None;
        state.current_old = None;
    }

    /// Allocates `words` over contiguous free regions.
    pub fn allocate_humongous(
        &self,
        regions: &RegionTable,
        words: usize,
        affiliation: Affiliation,
    ) -> Option<usize> {
        let _state = self.state.lock();
        let needed = words.div_ceil(regions.region_words());

        let mut run = 0;
        let mut first = 0;
        for region in regions.iter() {
            if region.is_free() {
                if run == 0 {
                    first = region.index();
                }
                run += 1;
                if run == needed {
                    break;
                }
            } else {
                run = 0;
            }
        }
        if run < needed {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let mut remaining = words * WORD_SIZE;
        for index in first..first + needed {
            let region = regions.get(index)?;
            let claimed = region.try_claim(affiliation);
            debug_assert!(claimed, "free set lock guards humongous claims");
            let flag = if index == first {
                RegionFlags::HUMONGOUS_START
            } else {
                RegionFlags::HUMONGOUS_CONTINUATION
            };
            region.add_flags(flag);
            let used = remaining.min(region.end() - region.bottom());
            region.set_top(region.bottom() + used);
            remaining -= used;
        }
        self.counters.humongous.fetch_add(1, Ordering::Relaxed);
        trace!("humongous allocation of {words} words at region {first}");
        regions.get(first).map(Region::bottom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Heap, heap::tests::test_settings};

    #[test]
    fn test_lab_sizes_stay_object_aligned() {
        let heap = Heap::new(test_settings()).unwrap();
        // an odd budget must not produce an odd buffer
        heap.reserves.young.set_reserve(75 * WORD_SIZE);

        let mut req = AllocRequest::for_gclab(32, 256);
        let addr = heap.allocate_memory(&mut req).unwrap();
        assert_eq!(req.actual_words(), 74);
        let region = heap.region_containing(addr);
        assert_eq!(region.top(), addr + 74 * WORD_SIZE);
        assert_eq!(heap.reserves.young.remaining(), WORD_SIZE);
    }

    #[test]
    fn test_request_beyond_reserve_fails() {
        let heap = Heap::new(test_settings()).unwrap();
        heap.reserves.old.set_reserve(16 * WORD_SIZE);

        let mut req = AllocRequest::for_shared_gc(32, Affiliation::Old, false);
        assert_eq!(heap.allocate_memory(&mut req), None);
        assert_eq!(AllocCounters::get(&heap.free_set.counters().failed), 1);

        // mutators are not held to the reserves
        let mut req = AllocRequest::for_shared(32, Affiliation::Old);
        assert!(heap.allocate_memory(&mut req).is_some());
    }
}
