use std::{
    ptr,
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::{MarkWord, ObjRef, RefSlot, WORD_SIZE};

/// Number of header words at the start of every object.
pub const HEADER_WORDS: usize = 2;

/// Smallest object the heap can hold: a bare header.
pub const MIN_OBJECT_WORDS: usize = HEADER_WORDS;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjectKind {
    /// Ordinary object: `ref_count` reference slots followed by raw words.
    Plain = 1,
    /// Dead space that keeps a region parseable.
    Filler = 2,
}

const KIND_BITS: u32 = 8;
const KIND_MASK: usize = (1 << KIND_BITS) - 1;
const REFS_SHIFT: u32 = KIND_BITS;
const REFS_BITS: u32 = 24;
const REFS_MASK: usize = (1 << REFS_BITS) - 1;
const SIZE_SHIFT: u32 = REFS_SHIFT + REFS_BITS;

/// The two-word header at the start of every heap object.
///
/// ```text
/// word 0: mark (atomic), see MarkWord
/// word 1: [size_words:32][ref_count:24][kind:8]
/// ```
///
/// The payload follows the header: `ref_count` [`RefSlot`]s first, then
/// untraced words up to `size_words`.
#[repr(C)]
pub struct Header {
    mark: AtomicUsize,
    info: usize,
}

const _: () = assert!(size_of::<Header>() == HEADER_WORDS * WORD_SIZE);

impl Header {
    pub fn new(kind: ObjectKind, size_words: usize, ref_count: usize) -> Self {
        debug_assert!(size_words >= MIN_OBJECT_WORDS);
        debug_assert!(size_words <= u32::MAX as usize);
        debug_assert!(ref_count <= REFS_MASK);
        debug_assert!(HEADER_WORDS + ref_count <= size_words);
        Self {
            mark: AtomicUsize::new(MarkWord::prototype().raw()),
            info: (kind as usize)
                | (ref_count << REFS_SHIFT)
                | (size_words << SIZE_SHIFT),
        }
    }

    // ── mark word ─────────────────────────────────────────────────

    #[inline(always)]
    pub fn mark(&self) -> MarkWord {
        MarkWord::from_raw(self.mark.load(Ordering::Acquire))
    }

    #[inline(always)]
    pub fn set_mark(&self, mark: MarkWord) {
        self.mark.store(mark.raw(), Ordering::Release);
    }

    /// Atomically replaces the mark if it still equals `expected`.
    /// Returns `Ok(expected)` on success, `Err(witness)` otherwise.
    #[inline(always)]
    pub fn cas_mark(
        &self,
        expected: MarkWord,
        new: MarkWord,
    ) -> Result<MarkWord, MarkWord> {
        self.mark
            .compare_exchange(
                expected.raw(),
                new.raw(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(MarkWord::from_raw)
            .map_err(MarkWord::from_raw)
    }

    #[inline(always)]
    pub fn has_displaced_mark(&self) -> bool {
        self.mark().has_displaced_mark_helper()
    }

    /// The neutral mark, read through the lock record when displaced.
    #[inline]
    pub fn identity_mark(&self) -> MarkWord {
        let mark = self.mark();
        if mark.has_displaced_mark_helper() {
            mark.displaced_mark_helper()
        } else {
            mark
        }
    }

    // ── layout ────────────────────────────────────────────────────

    #[inline(always)]
    pub fn kind(&self) -> ObjectKind {
        match self.info & KIND_MASK {
            2 => ObjectKind::Filler,
            _ => ObjectKind::Plain,
        }
    }

    #[inline(always)]
    pub fn is_filler(&self) -> bool {
        self.kind() == ObjectKind::Filler
    }

    #[inline(always)]
    pub fn size_words(&self) -> usize {
        self.info >> SIZE_SHIFT
    }

    #[inline(always)]
    pub fn ref_count(&self) -> usize {
        (self.info >> REFS_SHIFT) & REFS_MASK
    }
}

impl core::fmt::Debug for Header {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Header")
            .field("mark", &self.mark())
            .field("kind", &self.kind())
            .field("size_words", &self.size_words())
            .field("ref_count", &self.ref_count())
            .finish()
    }
}

// ── Object initialization and access ────────────────────────────────

/// Writes a plain object header at `addr` and nulls its reference slots.
/// Raw payload words are left as found.
///
/// # Safety
///
/// `addr` must be word aligned, non-null and own `size_words` writable words.
pub unsafe fn init_object(addr: usize, size_words: usize, ref_count: usize) -> ObjRef {
    let header = Header::new(ObjectKind::Plain, size_words, ref_count);
    // SAFETY: guaranteed by caller
    unsafe {
        ptr::write(addr as *mut Header, header);
        let slots = (addr as *mut usize).add(HEADER_WORDS);
        ptr::write_bytes(slots, 0, ref_count);
        ObjRef::from_addr_unchecked(addr)
    }
}

/// Overwrites `[addr, addr + words)` with a single dead filler object.
///
/// # Safety
///
/// The range must be owned by the caller and not reachable by other
/// threads as a live object.
pub unsafe fn fill_with_object(addr: usize, words: usize) {
    debug_assert!(words >= MIN_OBJECT_WORDS);
    // SAFETY: guaranteed by caller
    unsafe {
        ptr::write(
            addr as *mut Header,
            Header::new(ObjectKind::Filler, words, 0),
        );
    }
}

/// Copies `words` words from `from` to `to`, skipping the mark word.
///
/// The mark is excluded because other threads may be racing to install a
/// forwarding pointer in the source while it is being copied.
///
/// # Safety
///
/// Both ranges must be valid for `words` words and must not overlap.
pub unsafe fn copy_object_body(from: usize, to: usize, words: usize) {
    debug_assert!(words >= MIN_OBJECT_WORDS);
    debug_assert!(from + words * WORD_SIZE <= to || to + words * WORD_SIZE <= from);
    // SAFETY: guaranteed by caller
    unsafe {
        ptr::copy_nonoverlapping(
            (from as *const usize).add(1),
            (to as *mut usize).add(1),
            words - 1,
        );
    }
}

/// The reference slots of `obj`.
#[inline]
pub fn ref_slots<'a>(obj: ObjRef) -> &'a [RefSlot] {
    let count = obj.header().ref_count();
    // SAFETY: the header describes `count` slots right after itself
    unsafe {
        std::slice::from_raw_parts(
            (obj.as_ptr() as *const RefSlot).add(HEADER_WORDS),
            count,
        )
    }
}

/// Pointer to the `index`th untraced payload word of `obj`.
#[inline]
pub fn data_word(obj: ObjRef, index: usize) -> *mut usize {
    let header = obj.header();
    let offset = HEADER_WORDS + header.ref_count() + index;
    debug_assert!(offset < header.size_words());
    // SAFETY: bounds checked above in debug builds
    unsafe { obj.as_ptr().add(offset) }
}

/// Number of untraced payload words of `obj`.
#[inline]
pub fn data_len(obj: ObjRef) -> usize {
    let header = obj.header();
    header.size_words() - HEADER_WORDS - header.ref_count()
}
