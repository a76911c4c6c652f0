use std::sync::atomic::{AtomicU8, AtomicU32, AtomicUsize, Ordering};

use bitflags::bitflags;
use object::WORD_SIZE;

/// The generation a region currently belongs to.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Affiliation {
    Free = 0,
    Young = 1,
    Old = 2,
}

impl From<u8> for Affiliation {
    fn from(val: u8) -> Self {
        match val {
            1 => Affiliation::Young,
            2 => Affiliation::Old,
            _ => Affiliation::Free,
        }
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct RegionFlags: u8 {
        /// First region of a humongous object.
        const HUMONGOUS_START = 1 << 0;
        /// Trailing region of a humongous object.
        const HUMONGOUS_CONTINUATION = 1 << 1;
        /// Region may not be evacuated.
        const PINNED = 1 << 2;
    }
}

/// A fixed-size span of the heap.
///
/// `top` only grows between recycles and is bumped with CAS so that the
/// shared allocator and humongous allocation can race safely.
#[derive(Debug)]
pub struct Region {
    index: usize,
    bottom: usize,
    end: usize,
    top: AtomicUsize,
    affiliation: AtomicU8,
    age: AtomicU32,
    flags: AtomicU8,
}

impl Region {
    pub fn new(index: usize, bottom: usize, size: usize) -> Self {
        Self {
            index,
            bottom,
            end: bottom + size,
            top: AtomicUsize::new(bottom),
            affiliation: AtomicU8::new(Affiliation::Free as u8),
            age: AtomicU32::new(0),
            flags: AtomicU8::new(0),
        }
    }

    #[inline(always)]
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline(always)]
    pub fn bottom(&self) -> usize {
        self.bottom
    }

    #[inline(always)]
    pub fn end(&self) -> usize {
        self.end
    }

    #[inline(always)]
    pub fn top(&self) -> usize {
        self.top.load(Ordering::Acquire)
    }

    #[inline(always)]
    pub fn set_top(&self, top: usize) {
        debug_assert!(top >= self.bottom && top <= self.end);
        self.top.store(top, Ordering::Release);
    }

    #[inline(always)]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.bottom && addr < self.end
    }

    #[inline(always)]
    pub fn free_words(&self) -> usize {
        (self.end - self.top()) / WORD_SIZE
    }

    #[inline(always)]
    pub fn used_words(&self) -> usize {
        (self.top() - self.bottom) / WORD_SIZE
    }

    /// Bump allocates `words` at `top`.
    pub fn allocate(&self, words: usize) -> Option<usize> {
        let bytes = words.checked_mul(WORD_SIZE)?;
        let mut top = self.top.load(Ordering::Relaxed);
        loop {
            let new_top = top.checked_add(bytes)?;
            if new_top > self.end {
                return None;
            }
            match self.top.compare_exchange_weak(
                top,
                new_top,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(top),
                Err(current) => top = current,
            }
        }
    }

    // ── affiliation ───────────────────────────────────────────────

    #[inline(always)]
    pub fn affiliation(&self) -> Affiliation {
        Affiliation::from(self.affiliation.load(Ordering::Acquire))
    }

    #[inline(always)]
    pub fn set_affiliation(&self, affiliation: Affiliation) {
        self.affiliation
            .store(affiliation as u8, Ordering::Release);
    }

    /// Claims a free region for `affiliation`. Only one claimant wins.
    pub fn try_claim(&self, affiliation: Affiliation) -> bool {
        debug_assert_ne!(affiliation, Affiliation::Free);
        self.affiliation
            .compare_exchange(
                Affiliation::Free as u8,
                affiliation as u8,
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    #[inline(always)]
    pub fn is_young(&self) -> bool {
        self.affiliation() == Affiliation::Young
    }

    #[inline(always)]
    pub fn is_old(&self) -> bool {
        self.affiliation() == Affiliation::Old
    }

    #[inline(always)]
    pub fn is_free(&self) -> bool {
        self.affiliation() == Affiliation::Free
    }

    // ── age ───────────────────────────────────────────────────────

    #[inline(always)]
    pub fn age(&self) -> u32 {
        self.age.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn increment_age(&self) -> u32 {
        self.age.fetch_add(1, Ordering::Relaxed) + 1
    }

    #[inline(always)]
    pub fn reset_age(&self) {
        self.age.store(0, Ordering::Relaxed);
    }

    // ── flags ─────────────────────────────────────────────────────

    #[inline(always)]
    pub fn flags(&self) -> RegionFlags {
        RegionFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    #[inline(always)]
    pub fn add_flags(&self, flags: RegionFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    #[inline(always)]
    pub fn remove_flags(&self, flags: RegionFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    #[inline(always)]
    pub fn is_humongous(&self) -> bool {
        self.flags().intersects(
            RegionFlags::HUMONGOUS_START | RegionFlags::HUMONGOUS_CONTINUATION,
        )
    }

    #[inline(always)]
    pub fn is_humongous_continuation(&self) -> bool {
        self.flags().contains(RegionFlags::HUMONGOUS_CONTINUATION)
    }

    #[inline(always)]
    pub fn is_pinned(&self) -> bool {
        self.flags().contains(RegionFlags::PINNED)
    }
}

/// All regions of the heap, indexed by address.
#[derive(Debug)]
pub struct RegionTable {
    base: usize,
    end: usize,
    region_shift: u32,
    regions: Box<[Region]>,
}

impl RegionTable {
    pub fn new(base: usize, region_size: usize, count: usize) -> Self {
        debug_assert!(region_size.is_power_of_two());
        let regions = (0..count)
            .map(|i| Region::new(i, base + i * region_size, region_size))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            base,
            end: base + count * region_size,
            region_shift: region_size.trailing_zeros(),
            regions,
        }
    }

    #[inline(always)]
    pub fn base(&self) -> usize {
        self.base
    }

    #[inline(always)]
    pub fn end(&self) -> usize {
        self.end
    }

    #[inline(always)]
    pub fn region_size(&self) -> usize {
        1 << self.region_shift
    }

    #[inline(always)]
    pub fn region_words(&self) -> usize {
        self.region_size() / WORD_SIZE
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    #[inline(always)]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.end
    }

    #[inline(always)]
    pub fn index_containing(&self, addr: usize) -> usize {
        debug_assert!(self.contains(addr), "{addr:#x} outside the heap");
        (addr - self.base) >> self.region_shift
    }

    #[inline(always)]
    pub fn region_containing(&self, addr: usize) -> &Region {
        &self.regions[self.index_containing(addr)]
    }

    /// Bounds checked lookup, `None` past the last region.
    #[inline(always)]
    pub fn get(&self, index: usize) -> Option<&Region> {
        self.regions.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Region> {
        self.regions.iter()
    }
}

/// Hands out regions to parallel workers, each exactly once.
#[derive(Debug)]
pub struct RegionIterator<'a> {
    table: &'a RegionTable,
    index: AtomicUsize,
}

impl<'a> RegionIterator<'a> {
    pub fn new(table: &'a RegionTable) -> Self {
        Self {
            table,
            index: AtomicUsize::new(0),
        }
    }

    /// Next unclaimed region, `None` when exhausted.
    #[inline]
    pub fn next(&self) -> Option<&'a Region> {
        let index = self.index.fetch_add(1, Ordering::Relaxed);
        self.table.get(index)
    }

    pub fn reset(&self) {
        self.index.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGION: usize = 64 * 1024;

    fn table(count: usize) -> RegionTable {
        // addresses are never dereferenced here
        RegionTable::new(0x1000_0000, REGION, count)
    }

    #[test]
    fn test_address_lookup() {
        let table = table(4);
        assert_eq!(table.index_containing(0x1000_0000), 0);
        assert_eq!(table.index_containing(0x1000_0000 + REGION - 8), 0);
        assert_eq!(table.index_containing(0x1000_0000 + REGION), 1);
        let last = table.region_containing(table.end() - 8);
        assert_eq!(last.index(), 3);
        assert!(!table.contains(table.end()));
        assert!(table.get(4).is_none());
    }

    #[test]
    fn test_bump_allocation_stops_at_end() {
        let table = table(1);
        let region = table.get(0).unwrap();
        let words = REGION / WORD_SIZE;
        let a = region.allocate(words - 4).unwrap();
        assert_eq!(a, region.bottom());
        assert!(region.allocate(8).is_none());
        let b = region.allocate(4).unwrap();
        assert_eq!(b, region.bottom() + (words - 4) * WORD_SIZE);
        assert_eq!(region.free_words(), 0);
    }

    #[test]
    fn test_claim_is_exclusive() {
        let table = table(1);
        let region = table.get(0).unwrap();
        assert!(region.try_claim(Affiliation::Old));
        assert!(!region.try_claim(Affiliation::Young));
        assert!(region.is_old());
    }

    #[test]
    fn test_humongous_flags() {
        let table = table(2);
        let region = table.get(1).unwrap();
        assert!(!region.is_humongous());
        region.add_flags(RegionFlags::HUMONGOUS_CONTINUATION);
        assert!(region.is_humongous());
        assert!(region.is_humongous_continuation());
        region.remove_flags(RegionFlags::HUMONGOUS_CONTINUATION);
        assert!(!region.is_humongous());
    }

    #[test]
    fn test_region_iterator_hands_out_each_once() {
        let table = table(8);
        let iter = RegionIterator::new(&table);
        let mut seen = Vec::new();
        std::thread::scope(|s| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    s.spawn(|| {
                        let mut mine = Vec::new();
                        while let Some(r) = iter.next() {
                            mine.push(r.index());
                        }
                        mine
                    })
                })
                .collect();
            for h in handles {
                seen.extend(h.join().unwrap());
            }
        });
        seen.sort();
        assert_eq!(seen, (0..8).collect::<Vec<_>>());
    }
}
