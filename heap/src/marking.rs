use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use object::{OBJECT_ALIGN_WORDS, ObjRef, WORD_SIZE};

use crate::{Region, RegionTable};

const BITS: usize = usize::BITS as usize;
const GRANULE: usize = OBJECT_ALIGN_WORDS * WORD_SIZE;

/// One mark bit per object granule.
#[derive(Debug)]
pub struct MarkBitmap {
    base: usize,
    end: usize,
    words: Box<[AtomicUsize]>,
}

impl MarkBitmap {
    pub fn new(base: usize, len: usize) -> Self {
        let bits = len.div_ceil(GRANULE);
        Self {
            base,
            end: base + len,
            words: (0..bits.div_ceil(BITS)).map(|_| AtomicUsize::new(0)).collect(),
        }
    }

    #[inline(always)]
    fn bit_index(&self, addr: usize) -> usize {
        debug_assert!(addr >= self.base && addr < self.end);
        debug_assert_eq!(addr % GRANULE, 0);
        (addr - self.base) / GRANULE
    }

    #[inline(always)]
    fn bit_addr(&self, bit: usize) -> usize {
        self.base + bit * GRANULE
    }

    /// Sets the bit for `addr`. Returns true if this call set it.
    #[inline]
    pub fn mark(&self, addr: usize) -> bool {
        let bit = self.bit_index(addr);
        let mask = 1usize << (bit % BITS);
        let prev = self.words[bit / BITS].fetch_or(mask, Ordering::AcqRel);
        prev & mask == 0
    }

    #[inline]
    pub fn is_marked(&self, addr: usize) -> bool {
        let bit = self.bit_index(addr);
        self.words[bit / BITS].load(Ordering::Acquire) & (1 << (bit % BITS)) != 0
    }

    /// First marked address in `[from, limit)`, or `limit` when none.
    pub fn next_marked_addr(&self, from: usize, limit: usize) -> usize {
        if from >= limit {
            return limit;
        }
        let mut bit = self.bit_index(from);
        let limit_bit = (limit - self.base).div_ceil(GRANULE);
        while bit < limit_bit {
            let word = self.words[bit / BITS].load(Ordering::Acquire) >> (bit % BITS);
            if word != 0 {
                let found = bit + word.trailing_zeros() as usize;
                return if found < limit_bit {
                    self.bit_addr(found)
                } else {
                    limit
                };
            }
            bit = (bit / BITS + 1) * BITS;
        }
        limit
    }

    /// Clears every bit for `[start, end)`.
    pub fn clear_range(&self, start: usize, end: usize) {
        if start >= end {
            return;
        }
        let first = self.bit_index(start);
        let last = (end - self.base).div_ceil(GRANULE);
        let mut bit = first;
        while bit < last {
            let in_word = bit % BITS;
            let n = (BITS - in_word).min(last - bit);
            let mask = if n == BITS {
                usize::MAX
            } else {
                ((1usize << n) - 1) << in_word
            };
            self.words[bit / BITS].fetch_and(!mask, Ordering::AcqRel);
            bit += n;
        }
    }
}

/// Liveness as seen by the evacuation and update passes.
///
/// Objects at or above a region's top-at-mark-start were allocated during
/// the cycle and are implicitly live. Below it, the bitmap decides.
#[derive(Debug)]
pub struct MarkingContext {
    bitmap: MarkBitmap,
    tams: Box<[AtomicUsize]>,
    complete: AtomicBool,
}

impl MarkingContext {
    pub fn new(regions: &RegionTable) -> Self {
        Self {
            bitmap: MarkBitmap::new(regions.base(), regions.end() - regions.base()),
            tams: regions.iter().map(|r| AtomicUsize::new(r.bottom())).collect(),
            complete: AtomicBool::new(false),
        }
    }

    #[inline(always)]
    pub fn bitmap(&self) -> &MarkBitmap {
        &self.bitmap
    }

    #[inline(always)]
    pub fn mark(&self, obj: ObjRef) -> bool {
        self.bitmap.mark(obj.addr())
    }

    #[inline(always)]
    pub fn top_at_mark_start(&self, region: &Region) -> usize {
        self.tams[region.index()].load(Ordering::Acquire)
    }

    /// Freezes the region's current top as the marking boundary.
    pub fn capture_top_at_mark_start(&self, region: &Region) {
        self.tams[region.index()].store(region.top(), Ordering::Release);
    }

    pub fn reset_top_at_mark_start(&self, region: &Region) {
        self.tams[region.index()].store(region.bottom(), Ordering::Release);
    }

    #[inline]
    pub fn is_marked_in(&self, region: &Region, addr: usize) -> bool {
        addr >= self.top_at_mark_start(region) || self.bitmap.is_marked(addr)
    }

    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::Acquire)
    }

    pub fn mark_complete(&self) {
        self.complete.store(true, Ordering::Release);
    }

    pub fn mark_incomplete(&self) {
        self.complete.store(false, Ordering::Release);
    }

    /// Clears marks and boundary for `region`.
    pub fn clear_region(&self, region: &Region) {
        self.bitmap.clear_range(region.bottom(), region.end());
        self.reset_top_at_mark_start(region);
    }
}
