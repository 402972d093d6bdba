//! Ordered indexes of the regions of an address space.
//!
//! Tracked regions never overlap, so ordering by start also orders regions
//! by end, and every query only has to look at one neighbor.

use crate::runtime::region::{MatchMask, Region, RegionInfo};
use crate::Error;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Which `RegionIndex` implementation an address space uses.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum IndexKind {
    /// A balanced tree keyed by start address.
    BTree,
    /// A vector sorted by start address, searched by bisection.
    SortedList,
}

impl Default for IndexKind {
    fn default() -> IndexKind {
        IndexKind::BTree
    }
}

/// The operations an address space needs from its region index.
pub trait RegionIndex: Send {
    /// Insert a region. Fails if a region with the same start is present.
    fn insert(&mut self, region: Arc<Region>) -> Result<(), Error>;

    /// Remove the region matching `info` under `mask`.
    fn remove(&mut self, info: &RegionInfo, mask: MatchMask) -> Option<Arc<Region>>;

    /// A region overlapping `info`, if any.
    fn find_overlap(&self, info: &RegionInfo) -> Option<Arc<Region>>;

    /// The region containing `address`, if any.
    fn find_containing(&self, address: u64) -> Option<Arc<Region>>;

    /// The region matching `info` under `mask`.
    fn find_exact(&self, info: &RegionInfo, mask: MatchMask) -> Option<Arc<Region>>;

    /// The region with the smallest start not below `info.start`. This is
    /// the region starting at `info.start` when there is one.
    fn next_smallest_by_start(&self, info: &RegionInfo) -> Option<Arc<Region>>;

    /// Every region, ordered by start.
    fn regions(&self) -> Vec<Arc<Region>>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn clear(&mut self);
}

/// Create an empty index of the given kind.
pub fn new_index(kind: IndexKind) -> Box<dyn RegionIndex> {
    match kind {
        IndexKind::BTree => Box::new(BTreeIndex::new()),
        IndexKind::SortedList => Box::new(ListIndex::new()),
    }
}

/// A region index backed by a `BTreeMap`.
#[derive(Debug, Default)]
pub struct BTreeIndex {
    regions: BTreeMap<u64, Arc<Region>>,
}

impl BTreeIndex {
    pub fn new() -> BTreeIndex {
        BTreeIndex {
            regions: BTreeMap::new(),
        }
    }

    fn find_exact_key(&self, info: &RegionInfo, mask: MatchMask) -> Option<u64> {
        if mask.contains(MatchMask::VA) {
            return self
                .regions
                .get(&info.start)
                .filter(|region| region.matches(info, mask))
                .map(|region| region.start());
        }
        self.regions
            .values()
            .find(|region| region.matches(info, mask))
            .map(|region| region.start())
    }
}

impl RegionIndex for BTreeIndex {
    fn insert(&mut self, region: Arc<Region>) -> Result<(), Error> {
        if self.regions.contains_key(&region.start()) {
            return Err(Error::RegionOverlap(region.start()));
        }
        self.regions.insert(region.start(), region);
        Ok(())
    }

    fn remove(&mut self, info: &RegionInfo, mask: MatchMask) -> Option<Arc<Region>> {
        let key = self.find_exact_key(info, mask)?;
        self.regions.remove(&key)
    }

    fn find_overlap(&self, info: &RegionInfo) -> Option<Arc<Region>> {
        if info.length == 0 {
            return None;
        }
        self.regions
            .range(..info.end())
            .next_back()
            .map(|(_, region)| region)
            .filter(|region| region.end() > info.start)
            .cloned()
    }

    fn find_containing(&self, address: u64) -> Option<Arc<Region>> {
        self.regions
            .range(..=address)
            .next_back()
            .map(|(_, region)| region)
            .filter(|region| region.contains_address(address))
            .cloned()
    }

    fn find_exact(&self, info: &RegionInfo, mask: MatchMask) -> Option<Arc<Region>> {
        let key = self.find_exact_key(info, mask)?;
        self.regions.get(&key).cloned()
    }

    fn next_smallest_by_start(&self, info: &RegionInfo) -> Option<Arc<Region>> {
        self.regions
            .range(info.start..)
            .next()
            .map(|(_, region)| region.clone())
    }

    fn regions(&self) -> Vec<Arc<Region>> {
        self.regions.values().cloned().collect()
    }

    fn len(&self) -> usize {
        self.regions.len()
    }

    fn clear(&mut self) {
        self.regions.clear();
    }
}

/// A region index backed by a sorted vector.
#[derive(Debug, Default)]
pub struct ListIndex {
    regions: Vec<Arc<Region>>,
}

impl ListIndex {
    pub fn new() -> ListIndex {
        ListIndex {
            regions: Vec::new(),
        }
    }

    /// The position of the first region starting at or above `start`.
    fn lower_bound(&self, start: u64) -> usize {
        self.regions.partition_point(|region| region.start() < start)
    }

    fn find_exact_position(&self, info: &RegionInfo, mask: MatchMask) -> Option<usize> {
        if mask.contains(MatchMask::VA) {
            let position = self.lower_bound(info.start);
            return self
                .regions
                .get(position)
                .filter(|region| region.matches(info, mask))
                .map(|_| position);
        }
        self.regions
            .iter()
            .position(|region| region.matches(info, mask))
    }
}

impl RegionIndex for ListIndex {
    fn insert(&mut self, region: Arc<Region>) -> Result<(), Error> {
        let position = self.lower_bound(region.start());
        if let Some(existing) = self.regions.get(position) {
            if existing.start() == region.start() {
                return Err(Error::RegionOverlap(region.start()));
            }
        }
        self.regions.insert(position, region);
        Ok(())
    }

    fn remove(&mut self, info: &RegionInfo, mask: MatchMask) -> Option<Arc<Region>> {
        let position = self.find_exact_position(info, mask)?;
        Some(self.regions.remove(position))
    }

    fn find_overlap(&self, info: &RegionInfo) -> Option<Arc<Region>> {
        if info.length == 0 {
            return None;
        }
        let position = self.lower_bound(info.end());
        if position == 0 {
            return None;
        }
        self.regions
            .get(position - 1)
            .filter(|region| region.end() > info.start)
            .cloned()
    }

    fn find_containing(&self, address: u64) -> Option<Arc<Region>> {
        let position = self
            .regions
            .partition_point(|region| region.start() <= address);
        if position == 0 {
            return None;
        }
        self.regions
            .get(position - 1)
            .filter(|region| region.contains_address(address))
            .cloned()
    }

    fn find_exact(&self, info: &RegionInfo, mask: MatchMask) -> Option<Arc<Region>> {
        let position = self.find_exact_position(info, mask)?;
        self.regions.get(position).cloned()
    }

    fn next_smallest_by_start(&self, info: &RegionInfo) -> Option<Arc<Region>> {
        self.regions.get(self.lower_bound(info.start)).cloned()
    }

    fn regions(&self) -> Vec<Arc<Region>> {
        self.regions.clone()
    }

    fn len(&self) -> usize {
        self.regions.len()
    }

    fn clear(&mut self) {
        self.regions.clear();
    }
}
