mod cancel;
mod cards;
mod controller;
mod cset;
pub mod cycle;
mod error;
mod evacuate;
mod forwarding;
mod free_set;
mod heap;
mod lab;
mod marking;
mod oom;
mod region;
mod reserves;
mod settings;
mod stats;
mod suspendible;
mod system;
mod thread;
mod update_refs;

pub use cancel::{CancelCause, CancelFlag, CancelState};
pub use cards::CardTable;
pub use controller::{ControlCounters, Controller};
pub use cset::CollectionSet;
pub use error::{AllocError, HeapError, SettingsError};
pub use forwarding::{is_forwarded, resolve_forwarded, try_install_forward};
pub use free_set::{AllocCounters, AllocKind, AllocRequest, FreeSet};
pub use heap::{GcState, Heap, HeapInner};
pub use lab::Lab;
pub use marking::{MarkBitmap, MarkingContext};
pub use oom::OomEvacHandler;
pub use region::{Affiliation, Region, RegionFlags, RegionIterator, RegionTable};
pub use reserves::{Budget, EvacReserves};
pub use settings::HeapSettings;
pub use stats::HdrSeq;
pub use suspendible::{StsJoiner, SuspendibleThreadSet};
pub use system::{OS_PAGE_SIZE, Reservation};
pub use thread::{GcThread, ThreadEvacStats};
pub use update_refs::RootProvider;
