//! Synthetic object graph: construction, marking and verification.

use std::collections::HashSet;

use heap::{Affiliation, AllocError, GcState, Heap, resolve_forwarded};
use object::{ObjRef, RefSlot, data_len, data_word, ref_slots};

/// Every object carries `id` and `id ^ CHECK` in its first two data words.
const CHECK: usize = 0x5eed_cafe_f00d;

/// xorshift64*, deterministic per seed.
#[derive(Debug, Clone)]
pub struct Rng(u64);

impl Rng {
    pub fn new(seed: u64) -> Self {
        Self(seed.max(1))
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.0 = x;
        x.wrapping_mul(0x2545_f491_4f6c_dd1d)
    }

    pub fn below(&mut self, n: usize) -> usize {
        (self.next_u64() % n.max(1) as u64) as usize
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GraphShape {
    pub objects: usize,
    pub max_refs: usize,
    /// One in `old_every` objects is allocated old.
    pub old_every: usize,
    /// One in `root_every` objects is a root.
    pub root_every: usize,
}

/// Allocates the graph and returns its roots.
pub fn build(heap: &Heap, shape: GraphShape, rng: &mut Rng) -> Result<Vec<RefSlot>, AllocError> {
    let mut objs = Vec::with_capacity(shape.objects);
    for id in 0..shape.objects {
        let refs = rng.below(shape.max_refs + 1);
        let words = 2 + refs + 2 + rng.below(8);
        let generation = if shape.old_every > 0 && id % shape.old_every == 0 {
            Affiliation::Old
        } else {
            Affiliation::Young
        };
        let obj = heap.allocate_object(generation, words, refs)?;
        // SAFETY: at least two data words were allocated above
        unsafe {
            *data_word(obj, 0) = id;
            *data_word(obj, 1) = id ^ CHECK;
        }
        objs.push(obj);
    }

    for &obj in &objs {
        for slot in ref_slots(obj) {
            // a few nulls keep the walkers honest
            if rng.below(8) != 0 {
                let target = objs[rng.below(objs.len())];
                slot.store(Some(target));
                if heap.region_containing(obj.addr()).is_old() {
                    heap.mark_card_as_dirty(slot.addr());
                }
            }
        }
    }

    Ok(objs
        .iter()
        .step_by(shape.root_every.max(1))
        .map(|&obj| RefSlot::new(Some(obj)))
        .collect())
}

/// Marks everything reachable from `roots`, as of now.
///
/// In generational mode the remembered set is rebuilt on the way: old
/// cards start clean and every old-to-young reference dirties its card.
pub fn mark(heap: &Heap, roots: &[RefSlot]) -> usize {
    heap.set_gc_state(GcState::MARKING, true);
    for region in heap.regions.iter() {
        heap.marking.clear_region(region);
        heap.marking.capture_top_at_mark_start(region);
        if heap.is_generational() && region.is_old() {
            heap.clear_cards(region.bottom(), region.top());
        }
    }

    let mut stack: Vec<ObjRef> = Vec::new();
    let mut marked = 0;
    let mut visit = |obj: ObjRef, stack: &mut Vec<ObjRef>| {
        let obj = resolve_forwarded(obj);
        if heap.marking.mark(obj) {
            marked += 1;
            stack.push(obj);
        }
    };

    for root in roots {
        if let Some(obj) = root.load() {
            visit(obj, &mut stack);
        }
    }
    while let Some(obj) = stack.pop() {
        let from_old = heap.region_containing(obj.addr()).is_old();
        for slot in ref_slots(obj) {
            if let Some(target) = slot.load() {
                if from_old && heap.region_containing(target.addr()).is_young() {
                    heap.mark_card_as_dirty(slot.addr());
                }
                visit(target, &mut stack);
            }
        }
    }
    heap.marking.mark_complete();
    heap.set_gc_state(GcState::MARKING, false);
    marked
}

/// Walks the graph from `roots` checking every payload. With `strict`,
/// no reference may point into the collection set any more.
pub fn verify(heap: &Heap, roots: &[RefSlot], strict: bool) -> Result<usize, String> {
    let mut seen = HashSet::new();
    let mut stack: Vec<ObjRef> = Vec::new();

    let mut check = |obj: ObjRef, stack: &mut Vec<ObjRef>| -> Result<(), String> {
        if strict && heap.in_collection_set(obj) {
            return Err(format!("stale reference to {obj:?}"));
        }
        let obj = resolve_forwarded(obj);
        if !seen.insert(obj.addr()) {
            return Ok(());
        }
        if data_len(obj) < 2 {
            return Err(format!("{obj:?} lost its payload"));
        }
        // SAFETY: length checked above
        let (id, tag) = unsafe { (*data_word(obj, 0), *data_word(obj, 1)) };
        if id ^ CHECK != tag {
            return Err(format!("{obj:?} has a torn payload: {id:#x} / {tag:#x}"));
        }
        stack.push(obj);
        Ok(())
    };

    for root in roots {
        if let Some(obj) = root.load() {
            check(obj, &mut stack)?;
        }
    }
    while let Some(obj) = stack.pop() {
        for slot in ref_slots(obj) {
            if let Some(target) = slot.load() {
                check(target, &mut stack)?;
            }
        }
    }
    Ok(seen.len())
}
