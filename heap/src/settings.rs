use object::{OBJECT_ALIGN_WORDS, WORD_SIZE};

use crate::{OS_PAGE_SIZE, SettingsError};

/// Configuration for the region heap and its evacuation machinery.
#[derive(Debug, Clone)]
pub struct HeapSettings {
    /// Total size of the heap in bytes. Must be a multiple of `region_size`.
    pub heap_size: usize,
    /// Size of a region in bytes. Power of two, multiple of the OS page size.
    pub region_size: usize,
    /// Bytes covered by one remembered-set card. Power of two.
    pub card_size: usize,
    /// Young/old split with promotion and card dirtying.
    pub generational: bool,
    /// Smallest copy buffer handed out, in words.
    pub min_lab_words: usize,
    /// Desired copy buffer size of a fresh thread, in words.
    pub initial_lab_words: usize,
    /// Largest copy buffer handed out, in words.
    pub max_lab_words: usize,
    /// A buffer is only retired for a refill when its remainder is at most
    /// `capacity / lab_refill_waste_fraction` words.
    pub lab_refill_waste_fraction: usize,
    /// Objects whose age plus region age reach this are promoted.
    pub tenuring_threshold: u32,
    /// Promote tenured objects during young collections.
    pub promote_tenured_objects: bool,
    /// Use PLABs for old-generation copies, otherwise always shared.
    pub use_plab: bool,
    /// Workers may park at cancellation checks when asked to.
    pub suspendible_workers: bool,
}

impl Default for HeapSettings {
    fn default() -> Self {
        Self {
            heap_size: 64 * 1024 * 1024, // 64 MB
            region_size: 256 * 1024,     // 256 KB
            card_size: 512,
            generational: true,
            min_lab_words: 64,
            initial_lab_words: 1024,
            max_lab_words: 8 * 1024,
            lab_refill_waste_fraction: 64,
            tenuring_threshold: 7,
            promote_tenured_objects: true,
            use_plab: true,
            suspendible_workers: true,
        }
    }
}

impl HeapSettings {
    #[inline(always)]
    pub fn region_words(&self) -> usize {
        self.region_size / WORD_SIZE
    }

    #[inline(always)]
    pub fn region_count(&self) -> usize {
        self.heap_size / self.region_size
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.heap_size == 0 || self.region_size == 0 || self.card_size == 0 {
            return Err(SettingsError::ZeroSize);
        }
        if !self.region_size.is_power_of_two()
            || !self.region_size.is_multiple_of(OS_PAGE_SIZE)
        {
            return Err(SettingsError::RegionSize(self.region_size));
        }
        if !self.heap_size.is_multiple_of(self.region_size) {
            return Err(SettingsError::HeapNotRegionMultiple {
                heap: self.heap_size,
                region: self.region_size,
            });
        }
        if !self.card_size.is_power_of_two()
            || self.card_size < WORD_SIZE
            || self.card_size > self.region_size
        {
            return Err(SettingsError::CardSize(self.card_size));
        }
        if self.min_lab_words == 0
            || self.min_lab_words > self.initial_lab_words
            || self.initial_lab_words > self.max_lab_words
            || self.max_lab_words > self.region_words()
        {
            return Err(SettingsError::LabBounds {
                min: self.min_lab_words,
                initial: self.initial_lab_words,
                max: self.max_lab_words,
            });
        }
        // a lab must end on an object boundary so its tail can be filled
        if let Some(&words) = [self.min_lab_words, self.initial_lab_words, self.max_lab_words]
            .iter()
            .find(|w| !w.is_multiple_of(OBJECT_ALIGN_WORDS))
        {
            return Err(SettingsError::LabAlignment(words));
        }
        if self.lab_refill_waste_fraction == 0 {
            return Err(SettingsError::WasteFraction);
        }
        Ok(())
    }
}
