use crate::{HeapSettings, Lab};

/// Per-thread evacuation statistics.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ThreadEvacStats {
    pub copies_won: usize,
    pub copies_lost: usize,
    pub shared_copies: usize,
    pub promotions: usize,
    pub promotion_failures: usize,
    pub alloc_failures: usize,
    pub lab_refills: usize,
    pub lab_waste_words: usize,
}

impl std::ops::AddAssign for ThreadEvacStats {
    fn add_assign(&mut self, other: Self) {
        self.copies_won += other.copies_won;
        self.copies_lost += other.copies_lost;
        self.shared_copies += other.shared_copies;
        self.promotions += other.promotions;
        self.promotion_failures += other.promotion_failures;
        self.alloc_failures += other.alloc_failures;
        self.lab_refills += other.lab_refills;
        self.lab_waste_words += other.lab_waste_words;
    }
}

/// Evacuation context of one worker or mutator thread.
///
/// Owns the thread's copy buffers and the flags of the out-of-memory
/// protocol. It is passed explicitly to every evacuation call instead of
/// living in thread-local storage.
#[derive(Debug)]
pub struct GcThread {
    pub(crate) gclab: Option<Lab>,
    pub(crate) plab: Option<Lab>,
    /// Desired size of the next GCLAB, in words.
    pub(crate) gclab_size: usize,
    /// Desired size of the next PLAB, in words.
    pub(crate) plab_size: usize,
    /// Bytes promoted through the current PLAB.
    pub(crate) plab_promoted: usize,
    /// Bytes evacuated old-to-old through the current PLAB.
    pub(crate) plab_evacuated: usize,
    /// Bytes evacuated through the current GCLAB.
    pub(crate) gclab_evacuated: usize,
    pub(crate) allow_plab_promotions: bool,
    pub(crate) oom_during_evac: bool,
    pub(crate) evac_depth: u32,
    pub(crate) counted_in_evac: bool,
    pub(crate) stats: ThreadEvacStats,
}

impl GcThread {
    /// A thread with both copy buffers, sized from `settings`.
    pub fn new(settings: &HeapSettings) -> Self {
        Self {
            gclab: Some(Lab::new()),
            plab: settings.use_plab.then(Lab::new),
            gclab_size: settings.initial_lab_words,
            plab_size: settings.initial_lab_words,
            ..Self::without_labs()
        }
    }

    /// A thread that always copies through the shared allocator.
    pub fn without_labs() -> Self {
        Self {
            gclab: None,
            plab: None,
            gclab_size: 0,
            plab_size: 0,
            plab_promoted: 0,
            plab_evacuated: 0,
            gclab_evacuated: 0,
            allow_plab_promotions: true,
            oom_during_evac: false,
            evac_depth: 0,
            counted_in_evac: false,
            stats: ThreadEvacStats::default(),
        }
    }

    #[inline(always)]
    pub fn gclab(&self) -> Option<&Lab> {
        self.gclab.as_ref()
    }

    #[inline(always)]
    pub fn plab(&self) -> Option<&Lab> {
        self.plab.as_ref()
    }

    #[inline(always)]
    pub fn gclab_size(&self) -> usize {
        self.gclab_size
    }

    #[inline(always)]
    pub fn plab_size(&self) -> usize {
        self.plab_size
    }

    pub fn set_gclab_size(&mut self, words: usize) {
        self.gclab_size = words;
    }

    pub fn set_plab_size(&mut self, words: usize) {
        self.plab_size = words;
    }

    #[inline(always)]
    pub fn allow_plab_promotions(&self) -> bool {
        self.allow_plab_promotions
    }

    pub fn set_allow_plab_promotions(&mut self, allow: bool) {
        self.allow_plab_promotions = allow;
    }

    #[inline(always)]
    pub fn plab_promoted(&self) -> usize {
        self.plab_promoted
    }

    #[inline(always)]
    pub fn plab_evacuated(&self) -> usize {
        self.plab_evacuated
    }

    #[inline(always)]
    pub fn gclab_evacuated(&self) -> usize {
        self.gclab_evacuated
    }

    #[inline(always)]
    pub fn is_oom_during_evac(&self) -> bool {
        self.oom_during_evac
    }

    /// Inside an evacuation scope, see [`Heap::enter_evacuation`].
    ///
    /// [`Heap::enter_evacuation`]: crate::HeapInner::enter_evacuation
    #[inline(always)]
    pub fn is_evac_allowed(&self) -> bool {
        self.evac_depth > 0
    }

    pub fn stats(&self) -> &ThreadEvacStats {
        &self.stats
    }

    /// Forgets per-cycle state. Buffers must already be retired.
    pub fn reset_for_cycle(&mut self) {
        debug_assert!(!self.gclab.as_ref().is_some_and(Lab::has_buffer));
        debug_assert!(!self.plab.as_ref().is_some_and(Lab::has_buffer));
        debug_assert_eq!(self.evac_depth, 0);
        self.oom_during_evac = false;
        self.allow_plab_promotions = true;
        self.plab_promoted = 0;
        self.plab_evacuated = 0;
        self.gclab_evacuated = 0;
        self.stats = ThreadEvacStats::default();
    }
}
