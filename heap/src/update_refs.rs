//! Rewriting of references into the collection set.
//!
//! Two flavours of slot update: an exclusive one for slots nobody else can
//! touch, and a concurrent one that only replaces the exact stale value it
//! read. A lost CAS is fine either way, the slot no longer points into the
//! collection set.

use object::{ObjRef, RefSlot, ref_slots};

use crate::{HeapInner, Region, resolve_forwarded};

/// Source of references that live outside the heap.
pub trait RootProvider {
    fn visit_roots(&mut self, f: &mut dyn FnMut(&RefSlot));
}

impl RootProvider for [RefSlot] {
    fn visit_roots(&mut self, f: &mut dyn FnMut(&RefSlot)) {
        self.iter().for_each(f);
    }
}

impl RootProvider for Vec<RefSlot> {
    fn visit_roots(&mut self, f: &mut dyn FnMut(&RefSlot)) {
        self.as_mut_slice().visit_roots(f);
    }
}

impl HeapInner {
    /// Installs `new` in `slot` if it still holds `expected`. Returns the
    /// value witnessed.
    #[inline(always)]
    pub fn cas_ref(
        new: Option<ObjRef>,
        slot: &RefSlot,
        expected: Option<ObjRef>,
    ) -> Option<ObjRef> {
        slot.compare_exchange(expected, new)
    }

    #[inline]
    fn forwardee_for_update(&self, obj: ObjRef) -> ObjRef {
        let fwd = resolve_forwarded(obj);
        // evacuation may only have failed for a cancelled cycle
        debug_assert!(
            fwd != obj || self.cancelled_gc(),
            "{obj:?} in collection set is not forwarded"
        );
        fwd
    }

    /// Exclusive slot update.
    #[inline]
    pub fn update_with_forwarded(&self, slot: &RefSlot) {
        if let Some(obj) = slot.load()
            && self.in_collection_set(obj)
        {
            slot.store(Some(self.forwardee_for_update(obj)));
        }
    }

    /// Slot update racing with mutator stores.
    #[inline]
    pub fn conc_update_with_forwarded(&self, slot: &RefSlot) {
        if let Some(obj) = slot.load()
            && self.in_collection_set(obj)
        {
            let fwd = self.forwardee_for_update(obj);
            if fwd != obj {
                Self::cas_ref(Some(fwd), slot, Some(obj));
            }
        }
    }

    pub fn update_object_refs(&self, obj: ObjRef, concurrent: bool) {
        for slot in ref_slots(obj) {
            if concurrent {
                self.conc_update_with_forwarded(slot);
            } else {
                self.update_with_forwarded(slot);
            }
        }
    }

    /// Updates every live object of a region outside the collection set
    /// that starts below `limit`, the region's top when the update phase
    /// began. Objects allocated since hold updated references already.
    /// Copy buffers pointing into the region must be retired.
    pub fn update_region_references(
        &self,
        region: &Region,
        limit: usize,
        concurrent: bool,
    ) {
        if region.is_free()
            || region.is_humongous_continuation()
            || self.cset.is_in_index(region.index())
        {
            return;
        }
        self.marked_object_iterate(region, limit, |obj| {
            self.update_object_refs(obj, concurrent);
        });
    }

    pub fn update_roots(&self, roots: &mut dyn RootProvider, concurrent: bool) {
        roots.visit_roots(&mut |slot| {
            if concurrent {
                self.conc_update_with_forwarded(slot);
            } else {
                self.update_with_forwarded(slot);
            }
        });
    }
}
