use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use object::ObjRef;

use crate::{Region, RegionTable};

/// The regions selected for evacuation this cycle.
///
/// Membership is one flag per region, looked up by address, so `is_in` is a
/// shift and a load.
#[derive(Debug)]
pub struct CollectionSet {
    base: usize,
    end: usize,
    region_shift: u32,
    members: Box<[AtomicBool]>,
    count: AtomicUsize,
    live_bytes: AtomicUsize,
}

impl CollectionSet {
    pub fn new(regions: &RegionTable, region_size: usize) -> Self {
        let members = (0..regions.len())
            .map(|_| AtomicBool::new(false))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            base: regions.base(),
            end: regions.end(),
            region_shift: region_size.trailing_zeros(),
            members,
            count: AtomicUsize::new(0),
            live_bytes: AtomicUsize::new(0),
        }
    }

    /// Adds `region`. Humongous regions are never evacuated.
    pub fn add_region(&self, region: &Region) {
        debug_assert!(!region.is_humongous(), "humongous regions stay in place");
        if !self.members[region.index()].swap(true, Ordering::AcqRel) {
            self.count.fetch_add(1, Ordering::Relaxed);
            self.live_bytes.fetch_add(
                region.used_words() * object::WORD_SIZE,
                Ordering::Relaxed,
            );
        }
    }

    #[inline(always)]
    pub fn is_in_index(&self, index: usize) -> bool {
        self.members
            .get(index)
            .is_some_and(|m| m.load(Ordering::Acquire))
    }

    #[inline(always)]
    pub fn is_in(&self, obj: ObjRef) -> bool {
        self.is_in_loc(obj.addr())
    }

    /// Membership of the region containing `addr`. Addresses outside the
    /// heap are never in the set.
    #[inline(always)]
    pub fn is_in_loc(&self, addr: usize) -> bool {
        if addr < self.base || addr >= self.end {
            return false;
        }
        self.is_in_index((addr - self.base) >> self.region_shift)
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Used bytes of the member regions at the time they were added.
    pub fn used_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        for member in self.members.iter() {
            member.store(false, Ordering::Release);
        }
        self.count.store(0, Ordering::Relaxed);
        self.live_bytes.store(0, Ordering::Relaxed);
    }
}
