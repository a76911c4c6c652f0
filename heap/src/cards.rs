use std::sync::atomic::{AtomicU8, AtomicU16, Ordering};

use object::WORD_SIZE;

const CARD_DIRTY: u8 = 0;
const CARD_CLEAN: u8 = 1;

/// No object starts within the card.
const NO_OBJECT: u16 = u16::MAX;

/// Remembered set for old-to-young pointers.
///
/// One byte per card plus the word offset of the first object starting in
/// each card, so that a scan of a dirty card can find a parseable start.
#[derive(Debug)]
pub struct CardTable {
    base: usize,
    end: usize,
    card_shift: u32,
    cards: Box<[AtomicU8]>,
    first_object: Box<[AtomicU16]>,
}

impl CardTable {
    pub fn new(base: usize, len: usize, card_size: usize) -> Self {
        debug_assert!(card_size.is_power_of_two());
        debug_assert!(card_size / WORD_SIZE < NO_OBJECT as usize);
        let count = len.div_ceil(card_size);
        Self {
            base,
            end: base + len,
            card_shift: card_size.trailing_zeros(),
            cards: (0..count).map(|_| AtomicU8::new(CARD_CLEAN)).collect(),
            first_object: (0..count).map(|_| AtomicU16::new(NO_OBJECT)).collect(),
        }
    }

    #[inline(always)]
    pub fn card_size(&self) -> usize {
        1 << self.card_shift
    }

    #[inline(always)]
    pub fn card_index(&self, addr: usize) -> usize {
        debug_assert!(addr >= self.base && addr < self.end);
        (addr - self.base) >> self.card_shift
    }

    #[inline(always)]
    fn card_start(&self, index: usize) -> usize {
        self.base + (index << self.card_shift)
    }

    /// Card indices covering `[start, start + len)`.
    #[inline]
    fn cards_for(&self, start: usize, len: usize) -> std::ops::Range<usize> {
        if len == 0 {
            return 0..0;
        }
        self.card_index(start)..self.card_index(start + len - 1) + 1
    }

    #[inline(always)]
    pub fn mark_card_as_dirty(&self, addr: usize) {
        self.cards[self.card_index(addr)].store(CARD_DIRTY, Ordering::Relaxed);
    }

    pub fn mark_range_as_dirty(&self, start: usize, len: usize) {
        for i in self.cards_for(start, len) {
            self.cards[i].store(CARD_DIRTY, Ordering::Relaxed);
        }
    }

    pub fn mark_range_as_clean(&self, start: usize, len: usize) {
        for i in self.cards_for(start, len) {
            self.cards[i].store(CARD_CLEAN, Ordering::Relaxed);
        }
    }

    /// Cleans the range and forgets every object start in it.
    pub fn mark_range_as_empty(&self, start: usize, len: usize) {
        for i in self.cards_for(start, len) {
            self.cards[i].store(CARD_CLEAN, Ordering::Relaxed);
            self.first_object[i].store(NO_OBJECT, Ordering::Relaxed);
        }
    }

    #[inline(always)]
    pub fn is_card_dirty(&self, addr: usize) -> bool {
        self.cards[self.card_index(addr)].load(Ordering::Relaxed) == CARD_DIRTY
    }

    pub fn dirty_card_count(&self) -> usize {
        self.cards
            .iter()
            .filter(|c| c.load(Ordering::Relaxed) == CARD_DIRTY)
            .count()
    }

    /// Records that an object starts at `addr`.
    ///
    /// Concurrent registrations in the same card keep the lowest offset.
    pub fn register_object(&self, addr: usize) {
        let index = self.card_index(addr);
        let offset = ((addr - self.card_start(index)) / WORD_SIZE) as u16;
        self.first_object[index].fetch_min(offset, Ordering::Relaxed);
    }

    /// Address of the first registered object starting in the card of `addr`.
    pub fn first_object_in_card(&self, addr: usize) -> Option<usize> {
        let index = self.card_index(addr);
        match self.first_object[index].load(Ordering::Relaxed) {
            NO_OBJECT => None,
            offset => Some(self.card_start(index) + offset as usize * WORD_SIZE),
        }
    }
}
