//! Parallel drivers for one evacuation cycle.
//!
//! Marking is the caller's business: by the time [`prepare_evacuation`]
//! runs, the marking context must describe what is live. A cycle then goes
//!
//! 1. [`prepare_evacuation`]: pick the collection set, open evacuation.
//! 2. [`evacuate_collection_set`]: workers copy every live object out of
//!    the collection set. Mutators may evacuate through
//!    [`HeapInner::evacuate_object`] at the same time.
//! 3. Mutators retire their copy buffers and finish allocations in flight.
//! 4. [`update_references`]: workers rewrite stale references in the rest
//!    of the heap, then the roots are updated.
//! 5. [`finish_cycle`]: close the cycle and age surviving regions.
//!
//! Reclaiming the collection set afterwards is left to the caller.

use std::{
    panic,
    thread,
    time::{Duration, Instant},
};

use log::{debug, info};
use object::WORD_SIZE;

use crate::{
    GcState, HeapError, HeapInner, Region, RegionIterator, RootProvider,
    ThreadEvacStats,
};

/// Result of [`evacuate_collection_set`].
#[derive(Debug, Clone, Copy, Default)]
pub struct EvacOutcome {
    /// The phase stopped early, some live objects may not be forwarded.
    pub cancelled: bool,
    pub stats: ThreadEvacStats,
    pub elapsed: Duration,
}

/// Picks the collection set and opens evacuation.
///
/// `cycle` may carry [`GcState::YOUNG_CYCLE`] and [`GcState::AGING_CYCLE`].
/// A young cycle only considers young regions. Humongous, pinned and free
/// regions are never selected. Returns the number of regions chosen.
pub fn prepare_evacuation(
    heap: &HeapInner,
    cycle: GcState,
    mut select: impl FnMut(&Region) -> bool,
) -> usize {
    debug_assert!(!heap.is_concurrent_mark_in_progress(), "marking must be complete");
    // nothing may be allocated into a region once it is selected
    heap.free_set.retire_current_regions();
    heap.reserves.reset_for_cycle();
    heap.cset.clear();
    let old_usage: usize = heap
        .regions
        .iter()
        .filter(|r| r.is_old())
        .map(|r| r.used_words() * WORD_SIZE)
        .sum();
    heap.reserves.capture_old_usage(old_usage);

    let young_only = heap.is_generational() && cycle.contains(GcState::YOUNG_CYCLE);
    for region in heap.regions.iter() {
        if region.is_free() || region.is_humongous() || region.is_pinned() {
            continue;
        }
        if young_only && !region.is_young() {
            continue;
        }
        if select(region) {
            heap.cset.add_region(region);
        }
    }

    heap.set_gc_state(
        GcState::YOUNG_CYCLE,
        heap.is_generational() && cycle.contains(GcState::YOUNG_CYCLE),
    );
    heap.set_gc_state(
        GcState::AGING_CYCLE,
        heap.is_generational() && cycle.contains(GcState::AGING_CYCLE),
    );
    heap.set_evacuation_in_progress(true);

    info!(
        "collection set: {} regions, {} KB used",
        heap.cset.count(),
        heap.cset.used_bytes() / 1024
    );
    heap.cset.count()
}

/// Runs `f` on `workers` named scoped threads and collects the results.
fn run_workers<T: Send>(
    name: &str,
    workers: usize,
    f: impl Fn(usize) -> T + Sync,
) -> Result<Vec<T>, HeapError> {
    let f = &f;
    thread::scope(|s| {
        let handles = (0..workers.max(1))
            .map(|id| {
                thread::Builder::new()
                    .name(format!("{name}-{id}"))
                    .spawn_scoped(s, move || f(id))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(handles
            .into_iter()
            .map(|h| h.join().unwrap_or_else(|e| panic::resume_unwind(e)))
            .collect())
    })
}

/// Evacuates every live object of the collection set on `workers`
/// threads.
///
/// Workers check for cancellation before every region and stop copying
/// as soon as it is observed. An evacuation already past its allocation
/// always completes.
pub fn evacuate_collection_set(
    heap: &HeapInner,
    workers: usize,
) -> Result<EvacOutcome, HeapError> {
    debug_assert!(heap.is_evacuation_in_progress());
    let start = Instant::now();
    let iter = RegionIterator::new(&heap.regions);

    let per_worker = run_workers("gc-evac", workers, |id| {
        let _sts = heap.sts.joiner();
        let mut thread = heap.thread();
        let mut regions = 0;
        while let Some(region) = iter.next() {
            if !heap.cset.is_in_index(region.index()) {
                continue;
            }
            if heap.check_cancelled_gc_and_yield(true) {
                break;
            }
            heap.enter_evacuation(&mut thread);
            heap.marked_object_iterate(region, region.top(), |obj| {
                if !heap.cancelled_gc() {
                    heap.evacuate_object(obj, &mut thread);
                }
            });
            heap.leave_evacuation(&mut thread);
            regions += 1;
        }
        heap.retire_labs(&mut thread);
        debug!("evacuation worker {id}: {regions} regions, {:?}", thread.stats());
        *thread.stats()
    })?;

    let mut outcome = EvacOutcome {
        cancelled: heap.cancelled_gc(),
        elapsed: start.elapsed(),
        ..Default::default()
    };
    for stats in per_worker {
        outcome.stats += stats;
    }
    info!(
        "evacuated {} KB ({} copies, {} promotions) in {:.3}ms{}",
        heap.reserves.evacuated() / 1024,
        outcome.stats.copies_won,
        outcome.stats.promotions,
        outcome.elapsed.as_secs_f64() * 1000.0,
        if outcome.cancelled { ", cancelled" } else { "" }
    );
    Ok(outcome)
}

/// Rewrites references into the collection set, heap first, then roots.
///
/// Evacuation is closed on entry. Every copy buffer must be retired and
/// no allocation may be half initialized; allocations made while the
/// workers run are not visited. Returns false if the phase was cancelled.
pub fn update_references(
    heap: &HeapInner,
    workers: usize,
    roots: &mut dyn RootProvider,
) -> Result<bool, HeapError> {
    heap.set_evacuation_in_progress(false);
    heap.set_gc_state(GcState::UPDATE_REFS, true);
    let start = Instant::now();

    let watermarks: Vec<usize> = heap.regions.iter().map(Region::top).collect();
    let iter = RegionIterator::new(&heap.regions);

    run_workers("gc-update", workers, |_| {
        let _sts = heap.sts.joiner();
        while let Some(region) = iter.next() {
            if heap.check_cancelled_gc_and_yield(true) {
                break;
            }
            heap.update_region_references(region, watermarks[region.index()], true);
        }
    })?;

    if heap.cancelled_gc() {
        info!("reference update cancelled");
        return Ok(false);
    }
    heap.update_roots(roots, false);
    info!(
        "updated references in {:.3}ms",
        start.elapsed().as_secs_f64() * 1000.0
    );
    Ok(true)
}

/// Closes the cycle. Young regions that survived an aging cycle grow
/// older and collection set regions lose their cards. Old reserve left
/// unspent is lent to mutators until the next cycle. A pending
/// cancellation is cleared; returns whether there was one.
pub fn finish_cycle(heap: &HeapInner) -> bool {
    let aging = heap.is_aging_cycle();
    for region in heap.regions.iter() {
        if heap.cset.is_in_index(region.index()) {
            heap.clear_cards_for(region);
        } else if aging && region.is_young() {
            region.increment_age();
        }
    }
    let unspent = heap.reserves.old.remaining();
    heap.reserves
        .set_alloc_supplement_reserve(isize::try_from(unspent).unwrap_or(isize::MAX));

    heap.set_evacuation_in_progress(false);
    heap.set_gc_state(
        GcState::UPDATE_REFS
            | GcState::HAS_FORWARDED
            | GcState::YOUNG_CYCLE
            | GcState::AGING_CYCLE,
        false,
    );

    let cancelled = heap.cancelled_gc();
    if cancelled {
        heap.clear_cancelled_gc(true);
    }
    cancelled
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Barrier,
        atomic::{AtomicBool, Ordering},
    };

    use object::{ObjRef, RefSlot, data_word, ref_slots};

    use super::*;
    use crate::{
        Affiliation, CancelCause, Heap, HeapSettings, resolve_forwarded,
        heap::tests::test_settings,
    };

    /// Objects of 8 words, two refs each, the first data word holding an id.
    fn build_graph(heap: &Heap, count: usize) -> (Vec<ObjRef>, Vec<RefSlot>) {
        let objs: Vec<ObjRef> = (0..count)
            .map(|i| {
                let obj = heap.allocate_object(Affiliation::Young, 8, 2).unwrap();
                unsafe { *data_word(obj, 0) = i };
                obj
            })
            .collect();
        for (i, obj) in objs.iter().enumerate() {
            ref_slots(*obj)[0].store(Some(objs[(i + 1) % count]));
            ref_slots(*obj)[1].store(Some(objs[(i * 7 + 3) % count]));
        }
        let roots = objs.iter().step_by(5).map(|&o| RefSlot::new(Some(o))).collect();
        (objs, roots)
    }

    fn id(obj: ObjRef) -> usize {
        unsafe { *data_word(obj, 0) }
    }

    #[test]
    fn test_prepare_selects_young_regions_only() {
        let heap = Heap::new(test_settings()).unwrap();
        let young = heap.allocate_object(Affiliation::Young, 8, 0).unwrap();
        let old = heap.allocate_object(Affiliation::Old, 8, 0).unwrap();
        let words = heap.regions.region_words() + 2;
        let humongous = heap.allocate_object(Affiliation::Young, words, 0).unwrap();

        let chosen = prepare_evacuation(
            &heap,
            GcState::YOUNG_CYCLE | GcState::AGING_CYCLE,
            |_| true,
        );
        assert_eq!(chosen, 1);
        assert!(heap.in_collection_set(young));
        assert!(!heap.in_collection_set(old));
        assert!(!heap.in_collection_set(humongous));
        assert!(heap.is_evacuation_in_progress());
        assert!(heap.has_forwarded_objects());
        assert!(heap.is_aging_cycle());

        assert_eq!(heap.reserves.captured_old_usage(), 8 * WORD_SIZE);

        heap.mark_card_as_dirty(young.addr());
        finish_cycle(&heap);
        assert!(heap.is_idle());
        assert!(!heap.cards.is_card_dirty(young.addr()));
        assert_eq!(
            heap.reserves.alloc_supplement_reserve(),
            heap.reserves.old.remaining() as isize
        );
    }

    #[test]
    fn test_cycle_with_racing_mutators() {
        let _ = env_logger::builder().is_test(true).try_init();
        let heap = Heap::new(test_settings()).unwrap();
        let (objs, mut roots) = build_graph(&heap, 2000);

        prepare_evacuation(&heap, GcState::YOUNG_CYCLE | GcState::AGING_CYCLE, |_| true);
        let cset_regions = heap.cset.count();
        assert!(cset_regions > 0);

        const MUTATORS: usize = 4;
        let start = Barrier::new(MUTATORS + 1);
        let outcome = thread::scope(|s| {
            for m in 0..MUTATORS {
                let (heap, objs, start) = (&heap, &objs, &start);
                s.spawn(move || {
                    // a load barrier: evacuate before use
                    let mut t = heap.thread();
                    start.wait();
                    for obj in objs.iter().skip(m).step_by(MUTATORS) {
                        heap.enter_evacuation(&mut t);
                        let copy = heap.evacuate_object(*obj, &mut t);
                        heap.leave_evacuation(&mut t);
                        assert_eq!(id(copy), id(*obj));
                    }
                    heap.retire_labs(&mut t);
                });
            }
            start.wait();
            evacuate_collection_set(&heap, 4).unwrap()
        });
        assert!(!outcome.cancelled);

        for obj in &objs {
            let copy = resolve_forwarded(*obj);
            assert_ne!(copy, *obj);
            assert!(!heap.in_collection_set(copy));
        }

        assert!(update_references(&heap, 4, &mut roots).unwrap());
        for obj in &objs {
            let copy = resolve_forwarded(*obj);
            for slot in ref_slots(copy) {
                let target = slot.load().unwrap();
                assert!(!heap.in_collection_set(target), "stale ref in {copy:?}");
            }
            let i = id(copy);
            assert_eq!(id(ref_slots(copy)[0].load().unwrap()), (i + 1) % objs.len());
        }
        for root in &roots {
            assert!(!heap.in_collection_set(root.load().unwrap()));
        }

        let copy_region = heap.region_containing(resolve_forwarded(objs[0]).addr());
        assert!(!finish_cycle(&heap));
        assert_eq!(copy_region.age(), 1);
        assert!(heap.is_idle());
    }

    #[test]
    fn test_cancellation_leaves_only_complete_copies() {
        let heap = Heap::new(HeapSettings {
            generational: false,
            ..test_settings()
        })
        .unwrap();
        let (objs, _) = build_graph(&heap, 4000);
        prepare_evacuation(&heap, GcState::empty(), |_| true);

        let cancelled = AtomicBool::new(false);
        let outcome = thread::scope(|s| {
            s.spawn(|| {
                let mut t = heap.thread();
                for obj in objs.iter().rev().take(200) {
                    heap.enter_evacuation(&mut t);
                    heap.evacuate_object(*obj, &mut t);
                    heap.leave_evacuation(&mut t);
                }
                heap.retire_labs(&mut t);
                heap.cancel_gc(CancelCause::DegenerateRequested);
                cancelled.store(true, Ordering::Release);
            });
            evacuate_collection_set(&heap, 2).unwrap()
        });
        assert!(cancelled.load(Ordering::Acquire));
        assert!(heap.cancelled_gc());

        for (i, obj) in objs.iter().enumerate() {
            let copy = resolve_forwarded(*obj);
            assert_eq!(id(copy), i);
            assert_eq!(copy.size_words(), 8);
            assert_eq!(ref_slots(copy)[0].load(), ref_slots(*obj)[0].load());
        }

        assert!(outcome.stats.copies_won <= objs.len());
        assert!(finish_cycle(&heap));
        assert!(!heap.cancelled_gc());
        assert_eq!(heap.cancel.latencies().num(), 1);
    }
}
