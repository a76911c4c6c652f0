//! The forwarding protocol.
//!
//! An object is forwarded by swapping its mark word for a forwarding mark
//! that holds the address of the canonical copy. The CAS is the only
//! arbitration between racing evacuators: whoever installs first wins and
//! every caller observes the same copy afterwards.

use object::{MarkWord, ObjRef};

/// Forwardee of `obj`, or `obj` itself when it has not been forwarded.
#[inline(always)]
pub fn resolve_forwarded(obj: ObjRef) -> ObjRef {
    obj.header().mark().forwardee().unwrap_or(obj)
}

#[inline(always)]
pub fn is_forwarded(obj: ObjRef) -> bool {
    obj.header().mark().is_forwarded()
}

/// Tries to make `copy` the canonical copy of `obj`.
///
/// Returns the copy that is canonical after the call: `copy` if this call
/// installed it, or the winner of an earlier race. Acquire/release ordering
/// on the mark makes the winner's payload visible to every reader that
/// observes the forwarding mark.
///
/// `copy` must not be published yet. Its mark is overwritten with the mark
/// each attempt replaces, so a winning copy carries the original's identity
/// as of the moment it was forwarded.
pub fn try_install_forward(obj: ObjRef, copy: ObjRef) -> ObjRef {
    let header = obj.header();
    let new = MarkWord::forwarding_to(copy);
    let mut expected = header.mark();
    loop {
        if let Some(winner) = expected.forwardee() {
            return winner;
        }
        copy.header().set_mark(expected);
        match header.cas_mark(expected, new) {
            Ok(_) => return copy,
            // a lock or hash change is not a forward, retry on the new mark
            Err(witness) => expected = witness,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Barrier,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    };

    use object::{WORD_SIZE, init_object};

    use super::*;

    #[repr(align(16))]
    struct Arena([usize; 256]);

    fn arena() -> Box<Arena> {
        Box::new(Arena([0; 256]))
    }

    fn obj_at(arena: &mut Arena, word: usize, size: usize) -> ObjRef {
        let addr = arena.0.as_mut_ptr() as usize + word * WORD_SIZE;
        unsafe { init_object(addr, size, 0) }
    }

    #[test]
    fn test_unforwarded_resolves_to_self() {
        let mut arena = arena();
        let obj = obj_at(&mut arena, 0, 4);
        assert!(!is_forwarded(obj));
        assert_eq!(resolve_forwarded(obj), obj);
    }

    #[test]
    fn test_second_install_returns_first() {
        let mut arena = arena();
        let obj = obj_at(&mut arena, 0, 4);
        let a = obj_at(&mut arena, 4, 4);
        let b = obj_at(&mut arena, 8, 4);
        assert_eq!(try_install_forward(obj, a), a);
        assert_eq!(try_install_forward(obj, b), a);
        assert!(is_forwarded(obj));
        assert_eq!(resolve_forwarded(obj), a);
        assert_eq!(resolve_forwarded(obj), a);
    }

    #[test]
    fn test_copy_takes_mark_changed_after_copying() {
        let mut arena = arena();
        let obj = obj_at(&mut arena, 0, 4);
        let copy = obj_at(&mut arena, 4, 4);
        copy.header().set_mark(obj.header().mark());
        // hashed between the copy and the install
        let hashed = MarkWord::prototype().with_hash(42);
        obj.header().set_mark(hashed);

        assert_eq!(try_install_forward(obj, copy), copy);
        assert_eq!(copy.header().mark(), hashed);
        assert_eq!(copy.header().identity_mark().hash(), 42);
    }

    #[test]
    fn test_copy_drops_released_lock_record() {
        let mut arena = arena();
        let obj = obj_at(&mut arena, 0, 4);
        let copy = obj_at(&mut arena, 4, 4);
        let neutral = MarkWord::prototype().with_hash(7).with_age(2);
        {
            let record = AtomicUsize::new(neutral.raw());
            obj.header().set_mark(unsafe { MarkWord::locked(&record) });
            copy.header().set_mark(obj.header().mark());
            // the owner unlocks and its record goes away
            obj.header().set_mark(neutral);
        }

        assert_eq!(try_install_forward(obj, copy), copy);
        assert!(!copy.header().has_displaced_mark());
        assert_eq!(copy.header().identity_mark(), neutral);
    }

    #[test]
    fn test_install_racing_hash_changes_keeps_last_mark() {
        let mut arena = arena();
        let obj = obj_at(&mut arena, 0, 4);
        let copy = obj_at(&mut arena, 4, 4);
        let started = AtomicBool::new(false);

        let last = std::thread::scope(|s| {
            let hasher = s.spawn(|| {
                let header = obj.header();
                let mut last = header.mark();
                let mut hash = 1;
                loop {
                    let next = last.with_hash(hash);
                    match header.cas_mark(last, next) {
                        Ok(_) => last = next,
                        Err(witness) if witness.is_forwarded() => return last,
                        Err(witness) => last = witness,
                    }
                    started.store(true, Ordering::Release);
                    hash += 1;
                }
            });
            while !started.load(Ordering::Acquire) {
                std::hint::spin_loop();
            }
            assert_eq!(try_install_forward(obj, copy), copy);
            hasher.join().unwrap()
        });

        assert_eq!(copy.header().mark(), last);
        assert!(copy.header().mark().is_neutral());
    }

    #[test]
    fn test_racing_installs_converge() {
        const THREADS: usize = 8;
        let mut arena = arena();
        let obj = obj_at(&mut arena, 0, 4);
        let copies: Vec<ObjRef> = (0..THREADS)
            .map(|i| obj_at(&mut arena, 4 + i * 4, 4))
            .collect();
        let barrier = Barrier::new(THREADS);

        let results: Vec<ObjRef> = std::thread::scope(|s| {
            let handles: Vec<_> = copies
                .iter()
                .map(|&copy| {
                    let barrier = &barrier;
                    s.spawn(move || {
                        barrier.wait();
                        try_install_forward(obj, copy)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let winner = results[0];
        assert!(results.iter().all(|&r| r == winner));
        assert!(copies.contains(&winner));
        assert_eq!(resolve_forwarded(obj), winner);
    }
}
