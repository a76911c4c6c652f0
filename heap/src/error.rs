use thiserror::Error;

use crate::Affiliation;

/// Rejected [`HeapSettings`](crate::HeapSettings).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SettingsError {
    #[error("heap, region and card sizes must be > 0")]
    ZeroSize,
    #[error("region_size {0} must be a power of two and a multiple of the OS page size")]
    RegionSize(usize),
    #[error("heap_size {heap} must be a multiple of region_size {region}")]
    HeapNotRegionMultiple { heap: usize, region: usize },
    #[error("card_size {0} must be a power of two between one word and the region size")]
    CardSize(usize),
    #[error("lab sizes must satisfy 0 < min ({min}) <= initial ({initial}) <= max ({max}) <= region words")]
    LabBounds {
        min: usize,
        initial: usize,
        max: usize,
    },
    #[error("lab size of {0} words is not a multiple of the object alignment")]
    LabAlignment(usize),
    #[error("lab_refill_waste_fraction must be > 0")]
    WasteFraction,
}

/// Failure to build a [`Heap`](crate::Heap).
#[derive(Debug, Error)]
pub enum HeapError {
    #[error("invalid heap settings: {0}")]
    Settings(#[from] SettingsError),
    #[error("failed to reserve {0} bytes of address space")]
    Reserve(usize),
    #[error("failed to spawn GC worker: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Mutator allocation failure.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AllocError {
    #[error("out of memory allocating {words} words in {generation:?}")]
    OutOfMemory {
        words: usize,
        generation: Affiliation,
    },
    #[error("object of {words} words cannot have {refs} reference slots")]
    BadLayout { words: usize, refs: usize },
}
