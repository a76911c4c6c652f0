use std::sync::atomic::{AtomicUsize, Ordering};

use crate::ObjRef;

/// Low tag bits of a mark word.
const TAG_MASK: usize = 0b11;
const LOCKED_TAG: usize = 0b00;
const NEUTRAL_TAG: usize = 0b01;
const INFLATED_TAG: usize = 0b10;
const FORWARDED_TAG: usize = 0b11;

const AGE_SHIFT: u32 = 3;
const AGE_BITS: u32 = 4;
const AGE_MASK: usize = ((1 << AGE_BITS) - 1) << AGE_SHIFT;

const HASH_SHIFT: u32 = 8;
const HASH_BITS: u32 = 31;
const HASH_MASK: usize = ((1 << HASH_BITS) - 1) << HASH_SHIFT;

/// Largest age a neutral mark word can hold.
pub const MAX_AGE: u8 = (1 << AGE_BITS) - 1;

/// The first word of every heap object.
///
/// ```text
/// neutral:   [hash:31][unused:1][age:4][unused:1][tag:2 = 01]
/// locked:    [lock record address         ][tag:2 = 00]
/// inflated:  [monitor address             ][tag:2 = 10]
/// forwarded: [address of canonical copy   ][tag:2 = 11]
/// ```
///
/// Locked and inflated marks *displace* the neutral word into the lock
/// record or monitor, whose first word holds it.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct MarkWord(usize);

/// Decoded view of a [`MarkWord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkState {
    Neutral { age: u8, hash: u32 },
    Locked { record: usize },
    Inflated { monitor: usize },
    Forwarded(ObjRef),
}

impl MarkWord {
    /// Mark of a freshly allocated object: neutral, age 0, no hash.
    #[inline(always)]
    pub const fn prototype() -> Self {
        Self(NEUTRAL_TAG)
    }

    #[inline(always)]
    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    #[inline(always)]
    pub const fn raw(self) -> usize {
        self.0
    }

    #[inline(always)]
    pub fn forwarding_to(copy: ObjRef) -> Self {
        debug_assert_eq!(copy.addr() & TAG_MASK, 0);
        Self(copy.addr() | FORWARDED_TAG)
    }

    /// # Safety
    ///
    /// `record` must point to a live, word-aligned word holding the displaced
    /// neutral mark for as long as the object stays locked.
    #[inline(always)]
    pub unsafe fn locked(record: *const AtomicUsize) -> Self {
        debug_assert_eq!(record as usize & TAG_MASK, 0);
        Self(record as usize | LOCKED_TAG)
    }

    /// # Safety
    ///
    /// Same contract as [`MarkWord::locked`], for a monitor.
    #[inline(always)]
    pub unsafe fn inflated(monitor: *const AtomicUsize) -> Self {
        debug_assert_eq!(monitor as usize & TAG_MASK, 0);
        Self(monitor as usize | INFLATED_TAG)
    }

    #[inline]
    pub fn state(self) -> MarkState {
        let addr = self.0 & !TAG_MASK;
        match self.0 & TAG_MASK {
            NEUTRAL_TAG => MarkState::Neutral {
                age: self.age(),
                hash: self.hash(),
            },
            LOCKED_TAG => MarkState::Locked { record: addr },
            INFLATED_TAG => MarkState::Inflated { monitor: addr },
            // SAFETY: forwarding marks are only built from valid ObjRefs
            _ => MarkState::Forwarded(unsafe { ObjRef::from_addr_unchecked(addr) }),
        }
    }

    #[inline(always)]
    pub const fn is_neutral(self) -> bool {
        self.0 & TAG_MASK == NEUTRAL_TAG
    }

    #[inline(always)]
    pub const fn is_forwarded(self) -> bool {
        self.0 & TAG_MASK == FORWARDED_TAG
    }

    #[inline(always)]
    pub fn forwardee(self) -> Option<ObjRef> {
        if self.is_forwarded() {
            // SAFETY: forwarding marks are only built from valid ObjRefs
            Some(unsafe { ObjRef::from_addr_unchecked(self.0 & !TAG_MASK) })
        } else {
            None
        }
    }

    /// True when the identity bits live in a lock record or monitor.
    #[inline(always)]
    pub const fn has_displaced_mark_helper(self) -> bool {
        let tag = self.0 & TAG_MASK;
        tag == LOCKED_TAG || tag == INFLATED_TAG
    }

    #[inline(always)]
    fn displaced_slot(self) -> &'static AtomicUsize {
        debug_assert!(self.has_displaced_mark_helper());
        // SAFETY: guaranteed by the constructors of locked/inflated marks
        unsafe { &*((self.0 & !TAG_MASK) as *const AtomicUsize) }
    }

    /// Reads the neutral word stored in the lock record or monitor.
    #[inline]
    pub fn displaced_mark_helper(self) -> MarkWord {
        MarkWord(self.displaced_slot().load(Ordering::Acquire))
    }

    #[inline]
    pub fn set_displaced_mark_helper(self, mark: MarkWord) {
        self.displaced_slot().store(mark.0, Ordering::Release);
    }

    // ── age / hash ────────────────────────────────────────────────

    #[inline(always)]
    pub const fn age(self) -> u8 {
        ((self.0 & AGE_MASK) >> AGE_SHIFT) as u8
    }

    /// Returns a copy with the age replaced, saturating at [`MAX_AGE`].
    #[inline(always)]
    pub const fn with_age(self, age: u8) -> Self {
        let age = if age > MAX_AGE { MAX_AGE } else { age };
        Self((self.0 & !AGE_MASK) | ((age as usize) << AGE_SHIFT))
    }

    #[inline(always)]
    pub const fn hash(self) -> u32 {
        ((self.0 & HASH_MASK) >> HASH_SHIFT) as u32
    }

    #[inline(always)]
    pub const fn with_hash(self, hash: u32) -> Self {
        let hash = (hash as usize) & ((1 << HASH_BITS) - 1);
        Self((self.0 & !HASH_MASK) | (hash << HASH_SHIFT))
    }
}

impl core::fmt::Debug for MarkWord {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "MarkWord({:#x}: {:?})", self.0, self.state())
    }
}
