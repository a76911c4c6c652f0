mod header;
mod mark;
mod reference;

pub use header::{
    HEADER_WORDS, Header, MIN_OBJECT_WORDS, ObjectKind, copy_object_body,
    data_len, data_word, fill_with_object, init_object, ref_slots,
};
pub use mark::{MAX_AGE, MarkState, MarkWord};
pub use reference::{
    LOG_WORD_SIZE, OBJECT_ALIGN_WORDS, ObjRef, RefSlot, WORD_SIZE,
    align_object_words,
};

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn arena(words: usize) -> Vec<usize> {
        vec![0usize; words]
    }

    // ── Mark word ──────────────────────────────────────────────────

    #[test]
    fn test_prototype_is_neutral_and_young() {
        let mark = MarkWord::prototype();
        assert!(mark.is_neutral());
        assert!(!mark.is_forwarded());
        assert!(!mark.has_displaced_mark_helper());
        assert_eq!(mark.age(), 0);
        assert_eq!(mark.state(), MarkState::Neutral { age: 0, hash: 0 });
    }

    #[test]
    fn test_age_saturates() {
        let mark = MarkWord::prototype().with_age(7);
        assert_eq!(mark.age(), 7);
        assert_eq!(mark.with_age(200).age(), MAX_AGE);
        assert!(mark.with_age(MAX_AGE).is_neutral());
    }

    #[test]
    fn test_hash_and_age_are_independent() {
        let mark = MarkWord::prototype().with_hash(0x1234_5678).with_age(3);
        assert_eq!(mark.hash(), 0x1234_5678);
        assert_eq!(mark.age(), 3);
        let mark = mark.with_age(9);
        assert_eq!(mark.hash(), 0x1234_5678);
    }

    #[test]
    fn test_forwarding_mark_round_trips_address() {
        let mut mem = arena(4);
        let obj = unsafe { init_object(mem.as_mut_ptr() as usize, 4, 0) };
        let mark = MarkWord::forwarding_to(obj);
        assert!(mark.is_forwarded());
        assert_eq!(mark.forwardee(), Some(obj));
        assert_eq!(mark.state(), MarkState::Forwarded(obj));
        assert_eq!(MarkWord::prototype().forwardee(), None);
    }

    #[test]
    fn test_displaced_mark_lives_in_lock_record() {
        let neutral = MarkWord::prototype().with_age(5);
        let record = Box::new(AtomicUsize::new(neutral.raw()));
        let locked = unsafe { MarkWord::locked(&*record) };

        assert!(locked.has_displaced_mark_helper());
        assert!(matches!(locked.state(), MarkState::Locked { .. }));
        assert_eq!(locked.displaced_mark_helper().age(), 5);

        locked.set_displaced_mark_helper(neutral.with_age(6));
        assert_eq!(locked.displaced_mark_helper().age(), 6);

        let monitor = Box::new(AtomicUsize::new(neutral.raw()));
        let inflated = unsafe { MarkWord::inflated(&*monitor) };
        assert!(inflated.has_displaced_mark_helper());
        assert!(matches!(inflated.state(), MarkState::Inflated { .. }));
    }

    // ── Header / layout ────────────────────────────────────────────

    #[test]
    fn test_header_layout_fields() {
        let mut mem = arena(8);
        let obj = unsafe { init_object(mem.as_mut_ptr() as usize, 8, 3) };
        let header = obj.header();
        assert_eq!(header.kind(), ObjectKind::Plain);
        assert_eq!(header.size_words(), 8);
        assert_eq!(header.ref_count(), 3);
        assert_eq!(ref_slots(obj).len(), 3);
        assert_eq!(data_len(obj), 3);
        assert!(ref_slots(obj).iter().all(|slot| slot.load().is_none()));
        assert_eq!(obj.size_bytes(), 8 * WORD_SIZE);
    }

    #[test]
    fn test_filler_replaces_object() {
        let mut mem = arena(6);
        let base = mem.as_mut_ptr() as usize;
        let obj = unsafe { init_object(base, 6, 1) };
        unsafe { fill_with_object(base, 6) };
        assert!(obj.header().is_filler());
        assert_eq!(obj.size_words(), 6);
        assert_eq!(obj.header().ref_count(), 0);
    }

    #[test]
    fn test_body_copy_skips_mark() {
        let mut from = arena(6);
        let mut to = arena(6);
        let src = unsafe { init_object(from.as_mut_ptr() as usize, 6, 1) };
        src.header().set_mark(MarkWord::prototype().with_age(4));
        for i in 0..data_len(src) {
            unsafe { *data_word(src, i) = 100 + i };
        }

        unsafe {
            copy_object_body(src.addr(), to.as_mut_ptr() as usize, 6);
        }
        let dst = unsafe { ObjRef::from_addr_unchecked(to.as_mut_ptr() as usize) };

        assert_eq!(dst.size_words(), 6);
        assert_eq!(dst.header().mark().raw(), 0, "mark must not be copied");
        for i in 0..data_len(dst) {
            assert_eq!(unsafe { *data_word(dst, i) }, 100 + i);
        }
    }

    #[test]
    fn test_identity_mark_reads_through_lock() {
        let mut mem = arena(4);
        let obj = unsafe { init_object(mem.as_mut_ptr() as usize, 4, 0) };
        let record =
            Box::new(AtomicUsize::new(MarkWord::prototype().with_age(2).raw()));
        obj.header().set_mark(unsafe { MarkWord::locked(&*record) });
        assert!(obj.header().has_displaced_mark());
        assert_eq!(obj.header().identity_mark().age(), 2);
    }

    // ── RefSlot ────────────────────────────────────────────────────

    #[test]
    fn test_ref_slot_cas_reports_witness() {
        let mut mem = arena(8);
        let base = mem.as_mut_ptr() as usize;
        let a = unsafe { init_object(base, 4, 0) };
        let b = unsafe { init_object(base + 4 * WORD_SIZE, 4, 0) };

        let slot = RefSlot::new(Some(a));
        assert_eq!(slot.compare_exchange(Some(a), Some(b)), Some(a));
        assert_eq!(slot.load(), Some(b));
        // stale expectation leaves the slot alone
        assert_eq!(slot.compare_exchange(Some(a), None), Some(b));
        assert_eq!(slot.load(), Some(b));
    }

    #[test]
    fn test_object_alignment() {
        assert_eq!(align_object_words(1), 2);
        assert_eq!(align_object_words(2), 2);
        assert_eq!(align_object_words(17), 18);
    }
}
