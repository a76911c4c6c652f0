use object::{MIN_OBJECT_WORDS, WORD_SIZE, fill_with_object};

/// A thread-local copy buffer (GCLAB or PLAB).
///
/// Plain bump allocation between `top` and `end`. Only the owning thread
/// touches it, so nothing here is atomic.
#[derive(Debug, Default)]
pub struct Lab {
    bottom: usize,
    top: usize,
    end: usize,
}

impl Lab {
    pub const fn new() -> Self {
        Self {
            bottom: 0,
            top: 0,
            end: 0,
        }
    }

    /// Installs a fresh buffer. The previous one must have been retired.
    pub fn set_buf(&mut self, start: usize, words: usize) {
        debug_assert!(!self.has_buffer(), "retire before replacing");
        self.bottom = start;
        self.top = start;
        self.end = start + words * WORD_SIZE;
    }

    #[inline(always)]
    pub fn has_buffer(&self) -> bool {
        self.end != 0
    }

    #[inline(always)]
    pub fn top(&self) -> usize {
        self.top
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
    pub fn capacity_words(&self) -> usize {
        (self.end - self.bottom) / WORD_SIZE
    }

    #[inline(always)]
    pub fn words_remaining(&self) -> usize {
        (self.end - self.top) / WORD_SIZE
    }

    #[inline(always)]
    pub fn used_words(&self) -> usize {
        (self.top - self.bottom) / WORD_SIZE
    }

    #[inline(always)]
    pub fn allocate(&mut self, words: usize) -> Option<usize> {
        let bytes = words * WORD_SIZE;
        if self.end - self.top < bytes {
            return None;
        }
        let obj = self.top;
        self.top += bytes;
        Some(obj)
    }

    /// Rolls back the most recent allocation.
    #[inline]
    pub fn undo_allocation(&mut self, obj: usize, words: usize) {
        debug_assert_eq!(
            obj + words * WORD_SIZE,
            self.top,
            "only the last allocation can be undone"
        );
        self.top = obj;
    }

    /// Fills the unused tail with a filler object and drops the buffer.
    /// Returns the number of words wasted.
    pub fn retire(&mut self) -> usize {
        if !self.has_buffer() {
            return 0;
        }
        let waste = self.words_remaining();
        if waste >= MIN_OBJECT_WORDS {
            // SAFETY: the tail belongs to this buffer and was never published
            unsafe { fill_with_object(self.top, waste) };
        }
        *self = Self::new();
        waste
    }
}
