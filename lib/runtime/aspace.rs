//! The region tracker: an address space of identity-mapped regions.

use crate::runtime::host::PhysicalAllocator;
use crate::runtime::index::{new_index, IndexKind, RegionIndex};
use crate::runtime::region::{permission_leq, MatchMask, Protection, Region, RegionInfo};
use crate::{AccessKind, Error};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Identifies a thread of the host.
pub type ThreadId = u64;

/// Moves the contents of memory when a region moves, fixing up pointers
/// into the moved range.
pub trait Relocator: Send + Sync {
    fn relocate(&self, from: u64, to: u64, length: u64) -> Result<(), Error>;
}

/// Configuration of a region tracker.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct TrackerConfig {
    #[serde(default)]
    pub index: IndexKind,
}

/// A fault the host reports to an address space.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Fault {
    pub address: u64,
    pub access: AccessKind,
    pub thread: Option<ThreadId>,
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} fault at 0x{:x}", self.access, self.address)?;
        if let Some(thread) = self.thread {
            write!(f, " in thread {}", thread)?;
        }
        Ok(())
    }
}

/// The operations the host invokes on an address space.
pub trait AddressSpace: Send + Sync {
    fn name(&self) -> &str;

    /// Start tracking a region.
    fn add_region(&self, info: &RegionInfo) -> Result<Arc<Region>, Error>;

    /// Stop tracking the region matching `info` under `mask`.
    fn remove_region(&self, info: &RegionInfo, mask: MatchMask) -> Result<RegionInfo, Error>;

    /// Replace the protection of the region starting at `info.start`.
    ///
    /// # Panics
    ///
    /// Panics if the new protection takes away a permission an access was
    /// already validated against.
    fn protect_region(&self, info: &RegionInfo, protection: Protection) -> Result<(), Error>;

    /// Returns `true` if one tracked region contains all of `info` and grants
    /// at least `info.protection`.
    fn protection_check(&self, info: &RegionInfo) -> Result<bool, Error>;

    /// Validate one access, latching the permission on success.
    fn request_permission(&self, address: u64, access: AccessKind) -> Result<(), Error>;

    /// Move the region `old` to `new`, relocating its contents.
    fn move_region(&self, old: &RegionInfo, new: &RegionInfo) -> Result<Arc<Region>, Error>;

    /// Resize a region in place, returning its new length. With `by_force`,
    /// regions in the way of growth are moved out of it.
    fn resize_region(&self, info: &RegionInfo, new_size: u64, by_force: bool)
        -> Result<u64, Error>;

    /// Move a region into a fresh block of `new_size` bytes, returning the
    /// start of the unused tail of that block.
    fn defragment_region(&self, info: &RegionInfo, new_size: u64) -> Result<u64, Error>;

    fn add_thread(&self, thread: ThreadId) -> Result<(), Error>;

    fn remove_thread(&self, thread: ThreadId) -> Result<(), Error>;

    fn switch_in(&self, thread: ThreadId) -> Result<(), Error>;

    fn switch_out(&self, thread: ThreadId) -> Result<(), Error>;

    /// Handle a fault. Regions are identity mapped, so no fault is ever
    /// expected, and every fault is an error.
    fn exception(&self, fault: &Fault) -> Result<(), Error>;

    fn print(&self, detailed: bool) -> Result<String, Error>;

    /// Drop every thread and region.
    fn destroy(&self) -> Result<(), Error>;
}

/// Builds an `Aspace`.
pub struct AspaceBuilder {
    name: String,
    config: TrackerConfig,
    stack: Option<RegionInfo>,
    blob: Option<RegionInfo>,
    allocator: Arc<dyn PhysicalAllocator>,
    relocator: Arc<dyn Relocator>,
}

impl AspaceBuilder {
    pub fn new<S: Into<String>>(
        name: S,
        allocator: Arc<dyn PhysicalAllocator>,
        relocator: Arc<dyn Relocator>,
    ) -> AspaceBuilder {
        AspaceBuilder {
            name: name.into(),
            config: TrackerConfig::default(),
            stack: None,
            blob: None,
            allocator,
            relocator,
        }
    }

    pub fn config(mut self, config: TrackerConfig) -> Self {
        self.config = config;
        self
    }

    /// The initial stack. It is tracked for the life of the address space.
    pub fn stack(mut self, stack: RegionInfo) -> Self {
        self.stack = Some(stack);
        self
    }

    /// The initial data blob. It is tracked for the life of the address
    /// space.
    pub fn blob(mut self, blob: RegionInfo) -> Self {
        self.blob = Some(blob);
        self
    }

    pub fn build(self) -> Result<Aspace, Error> {
        let aspace = Aspace {
            name: self.name,
            regions: Mutex::new(new_index(self.config.index)),
            config: self.config,
            threads: Mutex::new(Vec::new()),
            current: AtomicU64::new(NO_THREAD),
            stack: None,
            blob: None,
            allocator: self.allocator,
            relocator: self.relocator,
        };
        let stack = self.stack.map(|info| aspace.add_region(&info)).transpose()?;
        let blob = self.blob.map(|info| aspace.add_region(&info)).transpose()?;
        debug!(
            "created address space {} with {:?} index",
            aspace.name, aspace.config.index
        );
        Ok(Aspace {
            stack,
            blob,
            ..aspace
        })
    }
}

const NO_THREAD: u64 = u64::MAX;

/// An address space tracking identity-mapped regions.
///
/// One lock guards the region index. `request_permission` first checks the
/// initial stack and blob without it: those regions are fixed for the life
/// of the address space, and latching is atomic.
pub struct Aspace {
    name: String,
    config: TrackerConfig,
    regions: Mutex<Box<dyn RegionIndex>>,
    threads: Mutex<Vec<ThreadId>>,
    current: AtomicU64,
    stack: Option<Arc<Region>>,
    blob: Option<Arc<Region>>,
    allocator: Arc<dyn PhysicalAllocator>,
    relocator: Arc<dyn Relocator>,
}

impl Aspace {
    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn stack(&self) -> Option<&Arc<Region>> {
        self.stack.as_ref()
    }

    pub fn blob(&self) -> Option<&Arc<Region>> {
        self.blob.as_ref()
    }

    pub fn allocator(&self) -> &Arc<dyn PhysicalAllocator> {
        &self.allocator
    }

    /// The thread switched in, if any.
    pub fn current_thread(&self) -> Option<ThreadId> {
        match self.current.load(Ordering::Acquire) {
            NO_THREAD => None,
            thread => Some(thread),
        }
    }

    pub fn threads(&self) -> Result<Vec<ThreadId>, Error> {
        Ok(self.lock_threads()?.clone())
    }

    fn lock_regions(&self) -> Result<MutexGuard<Box<dyn RegionIndex>>, Error> {
        self.regions.lock().map_err(|_| {
            Error::UnexpectedException(self.name.clone(), "region lock poisoned".to_string())
        })
    }

    fn lock_threads(&self) -> Result<MutexGuard<Vec<ThreadId>>, Error> {
        self.threads.lock().map_err(|_| {
            Error::UnexpectedException(self.name.clone(), "thread lock poisoned".to_string())
        })
    }

    /// The initial stack and blob may never move or be removed.
    fn is_fixed(&self, region: &Region) -> bool {
        region.is_pinned()
            || self
                .stack
                .iter()
                .chain(self.blob.iter())
                .any(|cached| cached.start() == region.start())
    }

    /// A snapshot of every region, ordered by start.
    pub fn regions(&self) -> Result<Vec<RegionInfo>, Error> {
        Ok(self
            .lock_regions()?
            .regions()
            .iter()
            .map(|region| region.info())
            .collect())
    }

    /// The number of regions tracked.
    pub fn len(&self) -> Result<usize, Error> {
        Ok(self.lock_regions()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, Error> {
        Ok(self.len()? == 0)
    }

    /// The region containing `address`.
    pub fn find(&self, address: u64) -> Result<Option<RegionInfo>, Error> {
        Ok(self
            .lock_regions()?
            .find_containing(address)
            .map(|region| region.info()))
    }

    /// Pin the region containing `address` so it never moves.
    pub fn pin(&self, address: u64) -> Result<RegionInfo, Error> {
        let regions = self.lock_regions()?;
        let region = regions
            .find_containing(address)
            .ok_or(Error::RegionNotFound(address))?;
        region.set_protection(region.protection() | Protection::PIN);
        debug!("pinned {}", region);
        Ok(region.info())
    }

    fn find_region(
        regions: &dyn RegionIndex,
        info: &RegionInfo,
        mask: MatchMask,
    ) -> Result<Arc<Region>, Error> {
        regions
            .find_exact(info, mask)
            .ok_or(Error::RegionNotFound(info.start))
    }

    /// Move every region standing in the way of growing `region` to
    /// `new_end`, returning the lock when the way is clear.
    fn evict_neighbors<'a>(
        &'a self,
        mut regions: MutexGuard<'a, Box<dyn RegionIndex>>,
        region: &Region,
        new_end: u64,
        by_force: bool,
    ) -> Result<MutexGuard<'a, Box<dyn RegionIndex>>, Error> {
        let after = RegionInfo::new(region.start() + 1, 0, Protection::NONE);
        loop {
            let neighbor = match regions.next_smallest_by_start(&after) {
                Some(neighbor) if neighbor.start() < new_end => neighbor,
                _ => return Ok(regions),
            };
            if !by_force {
                return Err(Error::RegionCollision(region.start(), neighbor.start()));
            }
            if self.is_fixed(&neighbor) {
                return Err(Error::RegionPinned(neighbor.start()));
            }

            let old = neighbor.info();
            let destination = self
                .allocator
                .alloc_restricted(old.length, new_end, u64::MAX)
                .or_else(|| self.allocator.alloc_restricted(old.length, 0, region.start()))
                .ok_or_else(|| {
                    Error::OutOfMemory(format!("no room to evict region 0x{:x}", old.start))
                })?;
            debug!(
                "evicting {} to 0x{:x} to grow region 0x{:x}",
                old,
                destination,
                region.start()
            );

            drop(regions);
            let new = RegionInfo::new(destination, old.length, old.protection);
            if let Err(e) = self.move_region(&old, &new) {
                self.allocator.free(destination);
                return Err(e);
            }
            self.allocator.free(old.start);

            regions = self.lock_regions()?;
            let current = RegionInfo::new(region.start(), 0, Protection::NONE);
            Aspace::find_region(&**regions, &current, MatchMask::VA)?;
        }
    }
}

impl AddressSpace for Aspace {
    fn name(&self) -> &str {
        &self.name
    }

    fn add_region(&self, info: &RegionInfo) -> Result<Arc<Region>, Error> {
        if !info.is_identity_mapped() {
            return Err(Error::InvalidRegion(format!(
                "0x{:x} is mapped to 0x{:x}",
                info.start, info.physical_start
            )));
        }
        if info.length == 0 {
            return Err(Error::InvalidRegion(format!(
                "0x{:x} has zero length",
                info.start
            )));
        }
        if info.start.checked_add(info.length).is_none() {
            return Err(Error::InvalidRegion(format!(
                "0x{:x} wraps the address space",
                info.start
            )));
        }

        let mut regions = self.lock_regions()?;
        if let Some(existing) = regions.find_overlap(info) {
            debug!("{} overlaps {}", info, existing);
            return Err(Error::RegionOverlap(existing.start()));
        }
        let region = Arc::new(Region::new(info));
        regions.insert(region.clone())?;
        trace!("added region {}", region);
        Ok(region)
    }

    fn remove_region(&self, info: &RegionInfo, mask: MatchMask) -> Result<RegionInfo, Error> {
        let mut regions = self.lock_regions()?;
        let region = Aspace::find_region(&**regions, info, mask)?;
        if self.is_fixed(&region) {
            return Err(Error::RegionPinned(region.start()));
        }
        let removed = regions
            .remove(&region.info(), MatchMask::VA)
            .ok_or(Error::RegionNotFound(info.start))?;
        trace!("removed region {}", removed);
        Ok(removed.info())
    }

    fn protect_region(&self, info: &RegionInfo, protection: Protection) -> Result<(), Error> {
        let regions = self.lock_regions()?;
        let region = Aspace::find_region(&**regions, info, MatchMask::VA)?;

        let requested = region.requested();
        let loses_write =
            requested.contains(Protection::WRITE) && !protection.contains(Protection::WRITE);
        let loses_read = requested.contains(Protection::READ)
            && !protection.intersects(Protection::READ | Protection::WRITE);
        if loses_write || loses_read {
            drop(regions);
            panic!(
                "protection {:?} of region 0x{:x} drops latched permissions {:?}",
                protection,
                info.start,
                requested
            );
        }

        region.set_protection(protection);
        debug!("protected {}", region);
        Ok(())
    }

    fn protection_check(&self, info: &RegionInfo) -> Result<bool, Error> {
        let regions = self.lock_regions()?;
        Ok(match regions.find_overlap(info) {
            Some(container) => {
                container.info().contains_region(info)
                    && permission_leq(info.protection, container.protection())
            }
            None => false,
        })
    }

    fn request_permission(&self, address: u64, access: AccessKind) -> Result<(), Error> {
        for cached in self.stack.iter().chain(self.blob.iter()) {
            if cached.contains_address(address) && cached.protection().allows(access) {
                cached.latch(access);
                return Ok(());
            }
        }

        let region = self.lock_regions()?.find_containing(address);
        match region {
            Some(region) if region.protection().allows(access) => {
                region.latch(access);
                Ok(())
            }
            region => {
                debug!(
                    "denied {} of 0x{:x} in {:?}",
                    access,
                    address,
                    region.map(|r| r.info())
                );
                Err(Error::GuardViolation { address, access })
            }
        }
    }

    fn move_region(&self, old: &RegionInfo, new: &RegionInfo) -> Result<Arc<Region>, Error> {
        if let Some(mapped) = [old, new].iter().find(|info| !info.is_identity_mapped()) {
            return Err(Error::InvalidRegion(format!(
                "0x{:x} is mapped to 0x{:x}",
                mapped.start, mapped.physical_start
            )));
        }

        let mut regions = self.lock_regions()?;
        let region = Aspace::find_region(&**regions, old, MatchMask::VA | MatchMask::LEN)?;
        if self.is_fixed(&region) {
            return Err(Error::RegionPinned(region.start()));
        }
        if new.length != region.len() {
            return Err(Error::InvalidRegion(format!(
                "moving 0x{:x} bytes to a region of 0x{:x} bytes",
                region.len(),
                new.length
            )));
        }

        let current = region.info();
        regions.remove(&current, MatchMask::VA);
        if let Some(existing) = regions.find_overlap(new) {
            regions.insert(region)?;
            return Err(Error::RegionOverlap(existing.start()));
        }
        if let Err(e) = self.relocator.relocate(current.start, new.start, current.length) {
            regions.insert(region)?;
            return Err(e);
        }

        let moved = Arc::new(Region::new(&RegionInfo {
            start: new.start,
            physical_start: new.start,
            length: current.length,
            protection: current.protection,
            requested: current.requested,
        }));
        regions.insert(moved.clone())?;
        debug!("moved {} to 0x{:x}", current, new.start);
        Ok(moved)
    }

    fn resize_region(
        &self,
        info: &RegionInfo,
        new_size: u64,
        by_force: bool,
    ) -> Result<u64, Error> {
        let regions = self.lock_regions()?;
        let region = Aspace::find_region(&**regions, info, MatchMask::VA)?;
        let old_size = region.len();
        if new_size == old_size {
            return Ok(old_size);
        }
        if new_size == 0 {
            return Err(Error::InvalidRegion(format!(
                "resizing 0x{:x} to zero length",
                region.start()
            )));
        }
        if self.is_fixed(&region) {
            return Err(Error::RegionPinned(region.start()));
        }

        if new_size < old_size {
            if self.allocator.realloc_in_place(region.start(), new_size).is_none() {
                debug!("host does not own 0x{:x}, shrinking the region only", region.start());
            }
            region.set_len(new_size);
            debug!("shrank {} from 0x{:x}", region, old_size);
            return Ok(new_size);
        }

        let new_end = region.start().checked_add(new_size).ok_or_else(|| {
            Error::InvalidRegion(format!("0x{:x} wraps the address space", region.start()))
        })?;
        let regions = self.evict_neighbors(regions, &region, new_end, by_force)?;

        let granted = self
            .allocator
            .realloc_in_place(region.start(), new_size)
            .ok_or_else(|| {
                Error::OutOfMemory(format!(
                    "host cannot grow 0x{:x} to 0x{:x} bytes",
                    region.start(),
                    new_size
                ))
            })?;
        if granted < new_size {
            return Err(Error::OutOfMemory(format!(
                "host granted 0x{:x} of 0x{:x} bytes",
                granted, new_size
            )));
        }
        // track what the host granted, short of the next region
        let after = RegionInfo::new(region.start() + 1, 0, Protection::NONE);
        let length = regions
            .next_smallest_by_start(&after)
            .map(|neighbor| neighbor.start() - region.start())
            .map_or(granted, |room| room.min(granted));
        region.set_len(length);
        debug!("grew {} from 0x{:x}", region, old_size);
        Ok(length)
    }

    fn defragment_region(&self, info: &RegionInfo, new_size: u64) -> Result<u64, Error> {
        let old = {
            let regions = self.lock_regions()?;
            let region = Aspace::find_region(&**regions, info, MatchMask::VA)?;
            if self.is_fixed(&region) {
                return Err(Error::RegionPinned(region.start()));
            }
            region.info()
        };
        if new_size < old.length {
            return Err(Error::InvalidRegion(format!(
                "defragmenting 0x{:x} would shrink it to 0x{:x} bytes",
                old.start, new_size
            )));
        }

        let destination = self.allocator.alloc(new_size).ok_or_else(|| {
            Error::OutOfMemory(format!("no block of 0x{:x} bytes", new_size))
        })?;
        let new = RegionInfo::new(destination, old.length, old.protection);
        if let Err(e) = self.move_region(&old, &new) {
            self.allocator.free(destination);
            return Err(e);
        }
        self.allocator.free(old.start);
        Ok(destination + old.length)
    }

    fn add_thread(&self, thread: ThreadId) -> Result<(), Error> {
        let mut threads = self.lock_threads()?;
        if threads.contains(&thread) {
            return Err(Error::Custom(format!(
                "thread {} already in address space {}",
                thread, self.name
            )));
        }
        threads.push(thread);
        Ok(())
    }

    fn remove_thread(&self, thread: ThreadId) -> Result<(), Error> {
        let mut threads = self.lock_threads()?;
        let position = threads.iter().position(|t| *t == thread).ok_or_else(|| {
            Error::Custom(format!("thread {} not in address space {}", thread, self.name))
        })?;
        threads.remove(position);
        let _ = self
            .current
            .compare_exchange(thread, NO_THREAD, Ordering::AcqRel, Ordering::Acquire);
        Ok(())
    }

    fn switch_in(&self, thread: ThreadId) -> Result<(), Error> {
        if !self.lock_threads()?.contains(&thread) {
            return Err(Error::Custom(format!(
                "thread {} not in address space {}",
                thread, self.name
            )));
        }
        self.current.store(thread, Ordering::Release);
        trace!("switched thread {} into {}", thread, self.name);
        Ok(())
    }

    fn switch_out(&self, thread: ThreadId) -> Result<(), Error> {
        let _ = self
            .current
            .compare_exchange(thread, NO_THREAD, Ordering::AcqRel, Ordering::Acquire);
        trace!("switched thread {} out of {}", thread, self.name);
        Ok(())
    }

    fn exception(&self, fault: &Fault) -> Result<(), Error> {
        error!("unexpected {} in address space {}", fault, self.name);
        Err(Error::UnexpectedException(
            self.name.clone(),
            fault.to_string(),
        ))
    }

    fn print(&self, detailed: bool) -> Result<String, Error> {
        let regions = self.lock_regions()?.regions();
        let threads = self.lock_threads()?.len();
        let mut s = format!(
            "address space {}: {} regions, {} threads\n",
            self.name,
            regions.len(),
            threads
        );
        if detailed {
            for region in regions {
                writeln!(s, "  {} requested {:?}", region, region.requested())
                    .map_err(|e| Error::Custom(e.to_string()))?;
            }
        }
        Ok(s)
    }

    fn destroy(&self) -> Result<(), Error> {
        self.lock_threads()?.clear();
        self.current.store(NO_THREAD, Ordering::Release);
        self.lock_regions()?.clear();
        Ok(())
    }
}

impl fmt::Debug for Aspace {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Aspace")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("regions", &self.len().ok())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::host::FirstFitAllocator;

    struct NoRelocation;

    impl Relocator for NoRelocation {
        fn relocate(&self, _: u64, _: u64, _: u64) -> Result<(), Error> {
            Ok(())
        }
    }

    const HEAP: u64 = 0x10_0000;

    fn aspace_with(kind: IndexKind) -> (Aspace, Arc<FirstFitAllocator>) {
        let allocator = Arc::new(FirstFitAllocator::new(HEAP, 0x10000));
        let aspace = AspaceBuilder::new("test", allocator.clone(), Arc::new(NoRelocation))
            .config(TrackerConfig { index: kind })
            .stack(RegionInfo::new(0x8000, 0x1000, Protection::READ | Protection::WRITE))
            .build()
            .unwrap();
        (aspace, allocator)
    }

    fn aspace() -> (Aspace, Arc<FirstFitAllocator>) {
        aspace_with(IndexKind::default())
    }

    fn heap_region(aspace: &Aspace, allocator: &FirstFitAllocator, size: u64) -> RegionInfo {
        let start = allocator.alloc(size).unwrap();
        let info = RegionInfo::new(start, size, Protection::READ | Protection::WRITE);
        aspace.add_region(&info).unwrap();
        info
    }

    #[test]
    fn request_latches_on_the_containing_region() {
        for kind in [IndexKind::BTree, IndexKind::SortedList] {
            let (aspace, _) = aspace_with(kind);
            let first = RegionInfo::new(0xbec0_0000, 0xcb000, Protection::RWX);
            let second = RegionInfo::new(0xbc20_0000, 0x140_0000, Protection::RWX);
            aspace.add_region(&first).unwrap();
            aspace.add_region(&second).unwrap();

            aspace
                .request_permission(0xbec9_3010, AccessKind::Write)
                .unwrap();

            let regions = aspace.regions().unwrap();
            let latched = regions.iter().find(|r| r.start == first.start).unwrap();
            let untouched = regions.iter().find(|r| r.start == second.start).unwrap();
            assert_eq!(latched.requested, Protection::WRITE);
            assert_eq!(untouched.requested, Protection::NONE);
        }
    }

    #[test]
    fn pinned_region_is_removed_once_unpinned() {
        let (aspace, _) = aspace();
        let info = RegionInfo::new(0x2_0000, 0x100, Protection::READ | Protection::PIN);
        aspace.add_region(&info).unwrap();

        assert!(matches!(
            aspace.remove_region(&info, MatchMask::VA),
            Err(Error::RegionPinned(0x2_0000))
        ));

        aspace.protect_region(&info, Protection::READ).unwrap();
        let removed = aspace.remove_region(&info, MatchMask::VA).unwrap();
        assert_eq!(removed.start, 0x2_0000);
        assert!(aspace.find(0x2_0000).unwrap().is_none());
    }

    #[test]
    fn regions_never_overlap() {
        let (aspace, _) = aspace();
        aspace
            .add_region(&RegionInfo::new(0x2_0000, 0x100, Protection::READ))
            .unwrap();

        for (start, length) in [(0x2_0000, 0x10), (0x1_ff00, 0x101), (0x2_00ff, 0x10)] {
            let info = RegionInfo::new(start, length, Protection::READ);
            assert!(matches!(
                aspace.add_region(&info),
                Err(Error::RegionOverlap(0x2_0000))
            ));
        }
        aspace
            .add_region(&RegionInfo::new(0x2_0100, 0x10, Protection::READ))
            .unwrap();
        assert_eq!(aspace.len().unwrap(), 3);
    }

    #[test]
    fn regions_are_identity_mapped_and_nonempty() {
        let (aspace, _) = aspace();
        let mapped = RegionInfo::new(0x2_0000, 0x100, Protection::READ).with_physical_start(0x5000);
        assert!(matches!(
            aspace.add_region(&mapped),
            Err(Error::InvalidRegion(_))
        ));
        assert!(matches!(
            aspace.add_region(&RegionInfo::new(0x2_0000, 0, Protection::READ)),
            Err(Error::InvalidRegion(_))
        ));
    }

    #[test]
    fn protection_check_needs_full_containment() {
        let (aspace, _) = aspace();
        aspace
            .add_region(&RegionInfo::new(0x2_0000, 0x100, Protection::READ))
            .unwrap();

        let check = |start, length, protection| {
            aspace
                .protection_check(&RegionInfo::new(start, length, protection))
                .unwrap()
        };
        assert!(check(0x2_0000, 0x100, Protection::READ));
        assert!(check(0x2_0010, 0x10, Protection::NONE));
        assert!(!check(0x2_00f0, 0x20, Protection::READ));
        assert!(!check(0x1_fff0, 0x20, Protection::READ));
        assert!(!check(0x2_0000, 0x10, Protection::WRITE));
        assert!(!check(0x3_0000, 0x10, Protection::READ));
    }

    #[test]
    fn kernel_regions_need_kernel_requests() {
        let (aspace, _) = aspace();
        aspace
            .add_region(&RegionInfo::new(
                0x2_0000,
                0x100,
                Protection::READ | Protection::KERN,
            ))
            .unwrap();
        aspace
            .add_region(&RegionInfo::new(0x3_0000, 0x100, Protection::READ))
            .unwrap();

        let check = |start, protection| {
            aspace
                .protection_check(&RegionInfo::new(start, 0x10, protection))
                .unwrap()
        };
        assert!(!check(0x2_0000, Protection::READ));
        assert!(check(0x2_0000, Protection::READ | Protection::KERN));
        assert!(check(0x3_0000, Protection::READ | Protection::KERN));
    }

    #[test]
    fn denied_accesses_do_not_latch() {
        let (aspace, _) = aspace();
        let info = RegionInfo::new(0x2_0000, 0x100, Protection::READ);
        aspace.add_region(&info).unwrap();

        assert!(matches!(
            aspace.request_permission(0x2_0010, AccessKind::Write),
            Err(Error::GuardViolation {
                address: 0x2_0010,
                access: AccessKind::Write
            })
        ));
        assert!(aspace.request_permission(0x2_0100, AccessKind::Read).is_err());
        aspace.request_permission(0x2_00ff, AccessKind::Read).unwrap();

        let region = aspace.find(0x2_0000).unwrap().unwrap();
        assert_eq!(region.requested, Protection::READ);
    }

    #[test]
    fn stack_requests_take_the_fast_path() {
        let (aspace, _) = aspace();
        aspace.request_permission(0x8ff8, AccessKind::Write).unwrap();

        assert_eq!(
            aspace.stack().unwrap().requested(),
            Protection::WRITE
        );
        assert!(matches!(
            aspace.remove_region(&RegionInfo::new(0x8000, 0, Protection::NONE), MatchMask::VA),
            Err(Error::RegionPinned(0x8000))
        ));
    }

    #[test]
    #[should_panic]
    fn narrowing_below_latched_write_is_fatal() {
        let (aspace, _) = aspace();
        let info = RegionInfo::new(0x2_0000, 0x100, Protection::READ | Protection::WRITE);
        aspace.add_region(&info).unwrap();
        aspace.request_permission(0x2_0000, AccessKind::Write).unwrap();

        let _ = aspace.protect_region(&info, Protection::READ);
    }

    #[test]
    fn narrowing_to_write_keeps_latched_read() {
        let (aspace, _) = aspace();
        let info = RegionInfo::new(0x2_0000, 0x100, Protection::READ | Protection::WRITE);
        aspace.add_region(&info).unwrap();
        aspace.request_permission(0x2_0000, AccessKind::Read).unwrap();

        aspace.protect_region(&info, Protection::WRITE).unwrap();
        assert_eq!(
            aspace.find(0x2_0000).unwrap().unwrap().protection,
            Protection::WRITE
        );
    }

    #[test]
    fn move_round_trip() {
        let (aspace, _) = aspace();
        let a = RegionInfo::new(0x2_0000, 0x100, Protection::READ | Protection::WRITE);
        let b = RegionInfo::new(0x4_0000, 0x100, Protection::READ);
        aspace.add_region(&a).unwrap();
        aspace.request_permission(0x2_0000, AccessKind::Write).unwrap();

        aspace.move_region(&a, &b).unwrap();
        assert!(aspace.find(0x2_0000).unwrap().is_none());
        let moved = aspace.find(0x4_0000).unwrap().unwrap();
        assert_eq!(moved.protection, a.protection);
        assert_eq!(moved.requested, Protection::WRITE);

        aspace.move_region(&b, &a).unwrap();
        let back = aspace.find(0x2_0000).unwrap().unwrap();
        assert_eq!(back.length, 0x100);
        assert_eq!(aspace.len().unwrap(), 2);
    }

    #[test]
    fn move_rejects_bad_targets() {
        let (aspace, _) = aspace();
        let a = RegionInfo::new(0x2_0000, 0x100, Protection::READ);
        let c = RegionInfo::new(0x3_0000, 0x100, Protection::READ);
        aspace.add_region(&a).unwrap();
        aspace.add_region(&c).unwrap();

        let short = RegionInfo::new(0x4_0000, 0x80, Protection::READ);
        assert!(aspace.move_region(&a, &short).is_err());
        let onto = RegionInfo::new(0x3_0080, 0x100, Protection::READ);
        assert!(matches!(
            aspace.move_region(&a, &onto),
            Err(Error::RegionOverlap(0x3_0000))
        ));
        // a failed move leaves the region where it was
        assert!(aspace.find(0x2_0000).unwrap().is_some());

        // a region may move onto part of itself
        let shifted = RegionInfo::new(0x2_0080, 0x100, Protection::READ);
        aspace.move_region(&a, &shifted).unwrap();
        assert!(aspace.find(0x2_0170).unwrap().is_some());
    }

    #[test]
    fn move_needs_identity_mapped_regions() {
        let (aspace, _) = aspace();
        let a = RegionInfo::new(0x2_0000, 0x100, Protection::READ);
        aspace.add_region(&a).unwrap();

        let mapped_old = a.with_physical_start(0x6_0000);
        let b = RegionInfo::new(0x4_0000, 0x100, Protection::READ);
        assert!(matches!(
            aspace.move_region(&mapped_old, &b),
            Err(Error::InvalidRegion(_))
        ));
        assert!(matches!(
            aspace.move_region(&a, &b.with_physical_start(0x6_0000)),
            Err(Error::InvalidRegion(_))
        ));
        assert!(aspace.find(0x2_0000).unwrap().is_some());
        assert!(aspace.find(0x4_0000).unwrap().is_none());
    }

    #[test]
    fn resize_is_monotonic() {
        let (aspace, allocator) = aspace();
        let a = heap_region(&aspace, &allocator, 0x100);

        assert_eq!(aspace.resize_region(&a, 0x100, false).unwrap(), 0x100);
        assert_eq!(aspace.resize_region(&a, 0x40, false).unwrap(), 0x40);
        assert!(aspace.find(a.start + 0x40).unwrap().is_none());
        assert_eq!(aspace.resize_region(&a, 0x200, false).unwrap(), 0x200);
        assert!(aspace.find(a.start + 0x1ff).unwrap().is_some());
    }

    #[test]
    fn growth_tracks_the_granted_size() {
        let (aspace, allocator) = aspace();
        let a = heap_region(&aspace, &allocator, 0x100);

        // the host rounds up to its alignment
        assert_eq!(aspace.resize_region(&a, 0x105, false).unwrap(), 0x110);
        assert_eq!(allocator.block_size(a.start), Some(0x110));
        assert_eq!(aspace.find(a.start).unwrap().unwrap().length, 0x110);
        aspace.request_permission(a.start + 0x10f, AccessKind::Write).unwrap();

        // but never past a region the host does not own
        let b = heap_region(&aspace, &allocator, 0x100);
        let wedge = RegionInfo::new(b.start + 0x108, 0x8, Protection::READ);
        aspace.add_region(&wedge).unwrap();
        assert_eq!(aspace.resize_region(&b, 0x105, false).unwrap(), 0x108);
        assert_eq!(aspace.find(b.start).unwrap().unwrap().end(), wedge.start);
    }

    #[test]
    fn growth_collides_with_neighbors() {
        let (aspace, allocator) = aspace();
        let a = heap_region(&aspace, &allocator, 0x100);
        let b = heap_region(&aspace, &allocator, 0x100);

        assert!(matches!(
            aspace.resize_region(&a, 0x180, false),
            Err(Error::RegionCollision(start, neighbor)) if start == a.start && neighbor == b.start
        ));
        assert_eq!(aspace.find(a.start).unwrap().unwrap().length, 0x100);
    }

    #[test]
    fn forced_growth_evicts_neighbors() {
        let (aspace, allocator) = aspace();
        let a = heap_region(&aspace, &allocator, 0x100);
        let b = heap_region(&aspace, &allocator, 0x100);
        let c = heap_region(&aspace, &allocator, 0x100);

        assert_eq!(aspace.resize_region(&a, 0x280, true).unwrap(), 0x280);

        let grown = aspace.find(a.start).unwrap().unwrap();
        assert_eq!(grown.length, 0x280);
        let regions = aspace.regions().unwrap();
        assert_eq!(regions.len(), 4);
        for window in regions.windows(2) {
            assert!(window[0].end() <= window[1].start);
        }
        assert_eq!(aspace.find(b.start).unwrap().unwrap().start, a.start);
        assert_eq!(aspace.find(c.start).unwrap().unwrap().start, a.start);
        assert_eq!(allocator.block_size(a.start), Some(0x280));
    }

    #[test]
    fn forced_growth_stops_at_pinned_neighbors() {
        let (aspace, allocator) = aspace();
        let a = heap_region(&aspace, &allocator, 0x100);
        let b = heap_region(&aspace, &allocator, 0x100);
        aspace.pin(b.start).unwrap();

        assert!(matches!(
            aspace.resize_region(&a, 0x180, true),
            Err(Error::RegionPinned(start)) if start == b.start
        ));
    }

    #[test]
    fn defragment_moves_into_larger_block() {
        let (aspace, allocator) = aspace();
        let a = heap_region(&aspace, &allocator, 0x100);
        aspace.request_permission(a.start, AccessKind::Read).unwrap();

        assert!(matches!(
            aspace.defragment_region(&a, 0x80),
            Err(Error::InvalidRegion(_))
        ));

        let tail = aspace.defragment_region(&a, 0x200).unwrap();
        let moved = aspace.find(tail - 1).unwrap().unwrap();
        assert_eq!(moved.start + 0x100, tail);
        assert_eq!(moved.requested, Protection::READ);
        assert!(aspace.find(a.start).unwrap().is_none());
        assert_eq!(allocator.block_size(a.start), None);
    }

    #[test]
    fn threads_and_exceptions() {
        let (aspace, _) = aspace();
        aspace.add_thread(1).unwrap();
        assert!(aspace.add_thread(1).is_err());
        assert!(aspace.switch_in(2).is_err());

        aspace.switch_in(1).unwrap();
        assert_eq!(aspace.current_thread(), Some(1));
        aspace.switch_out(1).unwrap();
        assert_eq!(aspace.current_thread(), None);

        let fault = Fault {
            address: 0x1234,
            access: AccessKind::Read,
            thread: Some(1),
        };
        assert!(matches!(
            aspace.exception(&fault),
            Err(Error::UnexpectedException(_, _))
        ));

        aspace.destroy().unwrap();
        assert!(aspace.threads().unwrap().is_empty());
        assert!(aspace.is_empty().unwrap());
    }

    #[test]
    fn print_lists_regions() {
        let (aspace, _) = aspace();
        let summary = aspace.print(false).unwrap();
        assert!(summary.starts_with("address space test: 1 regions"));
        let detailed = aspace.print(true).unwrap();
        assert!(detailed.contains("[0x8000, 0x9000)"));
    }

    #[test]
    fn concurrent_use_keeps_regions_disjoint() {
        let (aspace, allocator) = aspace();
        let hot = heap_region(&aspace, &allocator, 0x100);
        aspace.request_permission(hot.start, AccessKind::Read).unwrap();
        aspace.request_permission(hot.start, AccessKind::Write).unwrap();

        let aspace = &aspace;
        let allocator = &allocator;
        std::thread::scope(|scope| {
            // guards on the unlocked fast path and through the index
            scope.spawn(move || {
                for i in 0..2000u64 {
                    let access = AccessKind::from_is_write(i % 2 == 1);
                    aspace.request_permission(hot.start + i % 0x100, access).unwrap();
                    aspace.request_permission(0x8000 + i % 0x1000, access).unwrap();
                }
            });
            // protection changes which keep every latched permission
            scope.spawn(move || {
                for i in 0..1000 {
                    let protection = if i % 2 == 0 {
                        Protection::RWX
                    } else {
                        Protection::RW
                    };
                    aspace.protect_region(&hot, protection).unwrap();
                }
            });
            // forced growth, which gives up the lock while neighbors move
            scope.spawn(move || {
                for _ in 0..100 {
                    let grower = heap_region(aspace, allocator, 0x40);
                    heap_region(aspace, allocator, 0x40);
                    assert_eq!(aspace.resize_region(&grower, 0x80, true).unwrap(), 0x80);
                    for region in aspace.regions().unwrap() {
                        if region.start >= HEAP && region.start != hot.start {
                            aspace.remove_region(&region, MatchMask::VA).unwrap();
                            allocator.free(region.start);
                        }
                    }
                }
            });
            // regions coming and going below the heap
            scope.spawn(move || {
                for i in 0..1000u64 {
                    let info = RegionInfo::new(0x4_0000 + (i % 16) * 0x100, 0x80, Protection::RW);
                    aspace.add_region(&info).unwrap();
                    aspace.request_permission(info.start, AccessKind::Write).unwrap();
                    aspace.remove_region(&info, MatchMask::VA).unwrap();
                }
            });
        });

        let regions = aspace.regions().unwrap();
        for window in regions.windows(2) {
            assert!(window[0].end() <= window[1].start);
        }
        assert_eq!(regions.len(), 2);
        let hot = aspace.find(hot.start).unwrap().unwrap();
        assert_eq!(hot.requested, Protection::READ | Protection::WRITE);
        assert_eq!(hot.protection, Protection::RW);
        assert!(aspace.stack().unwrap().requested().contains(Protection::RW));
    }
}
