use std::{
    num::NonZeroUsize,
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::Header;

/// Size of a heap word in bytes.
pub const WORD_SIZE: usize = size_of::<usize>();
pub const LOG_WORD_SIZE: u32 = WORD_SIZE.trailing_zeros();

/// Objects start on, and are sized in multiples of, this many words.
pub const OBJECT_ALIGN_WORDS: usize = 2;

#[inline(always)]
pub const fn align_object_words(words: usize) -> usize {
    (words + OBJECT_ALIGN_WORDS - 1) & !(OBJECT_ALIGN_WORDS - 1)
}

/// A reference to a heap object: the address of its [`Header`].
///
/// Constructing an `ObjRef` is unsafe; once constructed it is trusted to
/// point at an initialized header for as long as the memory it refers to
/// has not been reclaimed.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ObjRef(NonZeroUsize);

impl ObjRef {
    /// # Safety
    ///
    /// `addr` must be non-zero, word aligned and point at an initialized
    /// object header.
    #[inline(always)]
    pub const unsafe fn from_addr_unchecked(addr: usize) -> Self {
        // SAFETY: caller guarantees addr != 0
        Self(unsafe { NonZeroUsize::new_unchecked(addr) })
    }

    /// Returns `None` for the null address.
    ///
    /// # Safety
    ///
    /// A non-zero `addr` must satisfy [`ObjRef::from_addr_unchecked`].
    #[inline(always)]
    pub unsafe fn from_addr(addr: usize) -> Option<Self> {
        NonZeroUsize::new(addr).map(Self)
    }

    #[inline(always)]
    pub const fn addr(self) -> usize {
        self.0.get()
    }

    #[inline(always)]
    pub const fn as_ptr(self) -> *mut usize {
        self.0.get() as *mut usize
    }

    #[inline(always)]
    pub fn header<'a>(self) -> &'a Header {
        // SAFETY: ObjRef construction guarantees a valid header
        unsafe { &*(self.addr() as *const Header) }
    }

    /// Object size in words, header included.
    #[inline(always)]
    pub fn size_words(self) -> usize {
        self.header().size_words()
    }

    #[inline(always)]
    pub fn size_bytes(self) -> usize {
        self.size_words() * WORD_SIZE
    }

    /// Address one past the last word of the object.
    #[inline(always)]
    pub fn end(self) -> usize {
        self.addr() + self.size_bytes()
    }
}

impl core::fmt::Debug for ObjRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "ObjRef({:#x})", self.addr())
    }
}

/// A word that holds either null or an [`ObjRef`].
///
/// Reference fields of heap objects and external roots are `RefSlot`s so
/// that collectors and mutators may race on them with atomic operations.
#[derive(Default)]
#[repr(transparent)]
pub struct RefSlot(AtomicUsize);

impl RefSlot {
    #[inline(always)]
    pub const fn null() -> Self {
        Self(AtomicUsize::new(0))
    }

    #[inline(always)]
    pub fn new(value: Option<ObjRef>) -> Self {
        Self(AtomicUsize::new(value.map_or(0, ObjRef::addr)))
    }

    /// # Safety
    ///
    /// `addr` must be a word-aligned location that stays valid for `'a`.
    #[inline(always)]
    pub unsafe fn from_addr<'a>(addr: usize) -> &'a RefSlot {
        debug_assert_eq!(addr % WORD_SIZE, 0);
        // SAFETY: guaranteed by caller
        unsafe { &*(addr as *const RefSlot) }
    }

    #[inline(always)]
    pub fn addr(&self) -> usize {
        self as *const RefSlot as usize
    }

    #[inline(always)]
    pub fn load(&self) -> Option<ObjRef> {
        // SAFETY: slots only ever hold null or valid references
        unsafe { ObjRef::from_addr(self.0.load(Ordering::Acquire)) }
    }

    #[inline(always)]
    pub fn store(&self, value: Option<ObjRef>) {
        self.0.store(value.map_or(0, ObjRef::addr), Ordering::Release);
    }

    /// Installs `new` only if the slot still holds `expected`.
    /// Returns the witnessed value either way.
    #[inline(always)]
    pub fn compare_exchange(
        &self,
        expected: Option<ObjRef>,
        new: Option<ObjRef>,
    ) -> Option<ObjRef> {
        let expected = expected.map_or(0, ObjRef::addr);
        let new = new.map_or(0, ObjRef::addr);
        let witness = match self.0.compare_exchange(
            expected,
            new,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(prev) | Err(prev) => prev,
        };
        // SAFETY: slots only ever hold null or valid references
        unsafe { ObjRef::from_addr(witness) }
    }
}

impl core::fmt::Debug for RefSlot {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("RefSlot").field(&self.load()).finish()
    }
}
