//! Interfaces the host provides to address spaces: physical memory
//! allocation and registration of address spaces by name.

use crate::runtime::aspace::{AddressSpace, Aspace, AspaceBuilder};
use crate::Error;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// The host's allocator of physical memory.
pub trait PhysicalAllocator: Send + Sync {
    /// Allocate `size` bytes anywhere.
    fn alloc(&self, size: u64) -> Option<u64>;

    /// Allocate `size` bytes inside `[low, high)`.
    fn alloc_restricted(&self, size: u64, low: u64, high: u64) -> Option<u64>;

    fn free(&self, address: u64);

    /// Grow or shrink the block at `address` without moving it, returning
    /// the size actually granted.
    fn realloc_in_place(&self, address: u64, new_size: u64) -> Option<u64>;
}

/// A first-fit allocator over one contiguous arena.
#[derive(Debug)]
pub struct FirstFitAllocator {
    base: u64,
    size: u64,
    alignment: u64,
    blocks: Mutex<BTreeMap<u64, u64>>,
}

impl FirstFitAllocator {
    pub fn new(base: u64, size: u64) -> FirstFitAllocator {
        FirstFitAllocator::with_alignment(base, size, 16)
    }

    pub fn with_alignment(base: u64, size: u64, alignment: u64) -> FirstFitAllocator {
        FirstFitAllocator {
            base,
            size,
            alignment: alignment.max(1).next_power_of_two(),
            blocks: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn end(&self) -> u64 {
        self.base.saturating_add(self.size)
    }

    fn align(&self, value: u64) -> Option<u64> {
        value
            .checked_add(self.alignment - 1)
            .map(|value| value & !(self.alignment - 1))
    }

    fn blocks(&self) -> Option<MutexGuard<BTreeMap<u64, u64>>> {
        self.blocks.lock().ok()
    }

    /// The size of the block at `address`.
    pub fn block_size(&self, address: u64) -> Option<u64> {
        self.blocks()?.get(&address).cloned()
    }

    /// Bytes currently allocated.
    pub fn allocated(&self) -> u64 {
        self.blocks()
            .map(|blocks| blocks.values().sum())
            .unwrap_or(0)
    }
}

impl PhysicalAllocator for FirstFitAllocator {
    fn alloc(&self, size: u64) -> Option<u64> {
        self.alloc_restricted(size, self.base, self.end())
    }

    fn alloc_restricted(&self, size: u64, low: u64, high: u64) -> Option<u64> {
        let size = self.align(size.max(1))?;
        let low = self.align(low.max(self.base))?;
        let high = high.min(self.end());
        let mut blocks = self.blocks()?;

        let mut candidate = low;
        for (start, length) in blocks.iter() {
            let end = start + length;
            if end <= candidate {
                continue;
            }
            if candidate.checked_add(size)? <= *start {
                break;
            }
            candidate = self.align(end)?;
        }
        if candidate.checked_add(size)? > high {
            return None;
        }
        blocks.insert(candidate, size);
        Some(candidate)
    }

    fn free(&self, address: u64) {
        if let Some(mut blocks) = self.blocks() {
            if blocks.remove(&address).is_none() {
                warn!("free of unallocated block 0x{:x}", address);
            }
        }
    }

    fn realloc_in_place(&self, address: u64, new_size: u64) -> Option<u64> {
        let new_size = self.align(new_size.max(1))?;
        let mut blocks = self.blocks()?;
        blocks.get(&address)?;
        let limit = blocks
            .range(address + 1..)
            .next()
            .map(|(start, _)| *start)
            .unwrap_or_else(|| self.end());
        if address.checked_add(new_size)? > limit {
            return None;
        }
        blocks.insert(address, new_size);
        Some(new_size)
    }
}

/// A handle naming a registered address space.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct AspaceHandle(u64);

/// The host's table of address spaces.
#[derive(Default)]
pub struct AspaceRegistry {
    inner: Mutex<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    next_handle: u64,
    aspaces: BTreeMap<AspaceHandle, Arc<Aspace>>,
}

impl AspaceRegistry {
    pub fn new() -> AspaceRegistry {
        AspaceRegistry::default()
    }

    fn inner(&self) -> Result<MutexGuard<RegistryInner>, Error> {
        self.inner
            .lock()
            .map_err(|_| Error::Custom("address space registry lock poisoned".to_string()))
    }

    /// Build an address space and register it. Names are unique.
    pub fn create(&self, builder: AspaceBuilder) -> Result<(AspaceHandle, Arc<Aspace>), Error> {
        let aspace = Arc::new(builder.build()?);
        let mut inner = self.inner()?;
        if inner.aspaces.values().any(|a| a.name() == aspace.name()) {
            return Err(Error::Custom(format!(
                "address space {} already registered",
                aspace.name()
            )));
        }
        let handle = AspaceHandle(inner.next_handle);
        inner.next_handle += 1;
        inner.aspaces.insert(handle, aspace.clone());
        info!("registered address space {} as {:?}", aspace.name(), handle);
        Ok((handle, aspace))
    }

    pub fn get(&self, handle: AspaceHandle) -> Option<Arc<Aspace>> {
        self.inner().ok()?.aspaces.get(&handle).cloned()
    }

    pub fn find(&self, name: &str) -> Option<(AspaceHandle, Arc<Aspace>)> {
        self.inner()
            .ok()?
            .aspaces
            .iter()
            .find(|(_, aspace)| aspace.name() == name)
            .map(|(handle, aspace)| (*handle, aspace.clone()))
    }

    pub fn len(&self) -> Result<usize, Error> {
        Ok(self.inner()?.aspaces.len())
    }

    pub fn is_empty(&self) -> Result<bool, Error> {
        Ok(self.len()? == 0)
    }

    /// Unregister an address space, draining its threads and regions.
    pub fn destroy(&self, handle: AspaceHandle) -> Result<(), Error> {
        let aspace = self
            .inner()?
            .aspaces
            .remove(&handle)
            .ok_or_else(|| Error::Custom(format!("no address space {:?}", handle)))?;
        aspace.destroy()?;
        info!("destroyed address space {}", aspace.name());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_fit_reuses_holes() {
        let allocator = FirstFitAllocator::new(0x10000, 0x1000);

        let a = allocator.alloc(0x100).unwrap();
        let b = allocator.alloc(0x100).unwrap();
        let c = allocator.alloc(0x10).unwrap();
        assert_eq!((a, b, c), (0x10000, 0x10100, 0x10200));

        allocator.free(b);
        assert_eq!(allocator.alloc(0x80), Some(0x10100));
        assert_eq!(allocator.alloc(0x1000), None);
    }

    #[test]
    fn restricted_allocation_respects_bounds() {
        let allocator = FirstFitAllocator::new(0x10000, 0x1000);
        allocator.alloc(0x100).unwrap();

        assert_eq!(allocator.alloc_restricted(0x100, 0x10800, u64::MAX), Some(0x10800));
        assert_eq!(allocator.alloc_restricted(0x100, 0, 0x10100), None);
    }

    #[test]
    fn realloc_in_place_stops_at_neighbor() {
        let allocator = FirstFitAllocator::new(0x10000, 0x1000);
        let a = allocator.alloc(0x100).unwrap();
        allocator.alloc(0x100).unwrap();

        assert_eq!(allocator.realloc_in_place(a, 0x101), None);
        assert_eq!(allocator.realloc_in_place(a, 0x80), Some(0x80));
        assert_eq!(allocator.realloc_in_place(a, 0xf9), Some(0x100));
        assert_eq!(allocator.block_size(a), Some(0x100));
    }

    #[test]
    fn registry_names_are_unique() {
        struct Stay;
        impl crate::runtime::Relocator for Stay {
            fn relocate(&self, _: u64, _: u64, _: u64) -> Result<(), Error> {
                Ok(())
            }
        }
        let builder = |name: &str| {
            let allocator = Arc::new(FirstFitAllocator::new(0x10000, 0x1000));
            AspaceBuilder::new(name, allocator, Arc::new(Stay))
        };

        let registry = AspaceRegistry::new();
        assert!(registry.is_empty().unwrap());
        let (handle, _) = registry.create(builder("one")).unwrap();
        assert!(registry.create(builder("one")).is_err());
        registry.create(builder("two")).unwrap();
        assert_eq!(registry.len().unwrap(), 2);
        assert_eq!(registry.find("one").unwrap().0, handle);

        registry.destroy(handle).unwrap();
        assert!(registry.get(handle).is_none());
        assert!(registry.destroy(handle).is_err());
        assert_eq!(registry.len().unwrap(), 1);
    }
}
