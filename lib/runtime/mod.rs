//! The runtime half of CARAT.
//!
//! An [`Aspace`] tracks the live regions of one address space in a
//! [`RegionIndex`]. Regions are identity mapped and never overlap. Every
//! access a guard validates latches a permission on its region, and from
//! then on the region's protection may not drop that permission.
//!
//! [`Runtime`] implements the calls instrumented code makes, and an
//! [`AllocationTable`] remembers allocations and escaped pointers so regions
//! can move while the program runs.

mod abi;
mod aspace;
mod host;
mod index;
mod memory;
mod region;
mod tracking;

pub use self::abi::{Runtime, RuntimeStats, DATA_PROTECTION};
pub use self::aspace::{
    AddressSpace, Aspace, AspaceBuilder, Fault, Relocator, ThreadId, TrackerConfig,
};
pub use self::host::{AspaceHandle, AspaceRegistry, FirstFitAllocator, PhysicalAllocator};
pub use self::index::{new_index, BTreeIndex, IndexKind, ListIndex, RegionIndex};
pub use self::memory::{HostMemory, SparseMemory, PAGE_SIZE};
pub use self::region::{permission_leq, MatchMask, Protection, Region, RegionInfo};
pub use self::tracking::{Allocation, AllocationKind, AllocationTable};
