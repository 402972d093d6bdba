//! The allocations and escaped pointers a runtime has been told about.
//!
//! An escape is a memory cell a pointer was stored to. When a region moves,
//! every escape holding a pointer into it is rewritten to point into the new
//! location.

use crate::runtime::aspace::Relocator;
use crate::runtime::memory::HostMemory;
use crate::Error;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

/// Where an allocation came from.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum AllocationKind {
    Heap,
    /// A global, with the id it was registered under.
    Global(u64),
    Stack,
}

/// A tracked allocation.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct Allocation {
    pub start: u64,
    pub length: u64,
    pub kind: AllocationKind,
}

impl Allocation {
    pub fn end(&self) -> u64 {
        self.start.saturating_add(self.length)
    }

    pub fn contains(&self, address: u64) -> bool {
        self.start <= address && address < self.end()
    }
}

#[derive(Debug, Default)]
struct Tables {
    allocations: BTreeMap<u64, Allocation>,
    escapes: BTreeSet<u64>,
}

/// The allocation table of one runtime.
pub struct AllocationTable {
    memory: Arc<dyn HostMemory>,
    tables: Mutex<Tables>,
}

impl AllocationTable {
    pub fn new(memory: Arc<dyn HostMemory>) -> AllocationTable {
        AllocationTable {
            memory,
            tables: Mutex::new(Tables::default()),
        }
    }

    pub fn memory(&self) -> &Arc<dyn HostMemory> {
        &self.memory
    }

    fn tables(&self) -> Result<MutexGuard<Tables>, Error> {
        self.tables
            .lock()
            .map_err(|_| Error::Custom("allocation table lock poisoned".to_string()))
    }

    /// Start tracking an allocation, replacing any allocation at the same
    /// start.
    pub fn track(&self, start: u64, length: u64, kind: AllocationKind) -> Result<(), Error> {
        let allocation = Allocation {
            start,
            length,
            kind,
        };
        if let Some(previous) = self.tables()?.allocations.insert(start, allocation) {
            warn!("allocation at 0x{:x} tracked twice: {:?}", start, previous);
        }
        Ok(())
    }

    /// Stop tracking the allocation starting at `start`, forgetting escapes
    /// stored in it.
    pub fn untrack(&self, start: u64) -> Result<Option<Allocation>, Error> {
        let mut tables = self.tables()?;
        let allocation = match tables.allocations.remove(&start) {
            Some(allocation) => allocation,
            None => return Ok(None),
        };
        let stale: Vec<u64> = tables
            .escapes
            .range(allocation.start..allocation.end())
            .cloned()
            .collect();
        for escape in stale {
            tables.escapes.remove(&escape);
        }
        Ok(Some(allocation))
    }

    pub fn allocation(&self, start: u64) -> Result<Option<Allocation>, Error> {
        Ok(self.tables()?.allocations.get(&start).cloned())
    }

    /// The allocation containing `address`.
    pub fn find_containing(&self, address: u64) -> Result<Option<Allocation>, Error> {
        Ok(self
            .tables()?
            .allocations
            .range(..=address)
            .next_back()
            .map(|(_, allocation)| *allocation)
            .filter(|allocation| allocation.contains(address)))
    }

    pub fn allocations(&self) -> Result<Vec<Allocation>, Error> {
        Ok(self.tables()?.allocations.values().cloned().collect())
    }

    /// Record that a pointer was stored at `cell`.
    pub fn record_escape(&self, cell: u64) -> Result<(), Error> {
        self.tables()?.escapes.insert(cell);
        Ok(())
    }

    pub fn escapes(&self) -> Result<Vec<u64>, Error> {
        Ok(self.tables()?.escapes.iter().cloned().collect())
    }
}

impl Relocator for AllocationTable {
    fn relocate(&self, from: u64, to: u64, length: u64) -> Result<(), Error> {
        let moved = |address: u64| {
            if from <= address && address - from < length {
                Some(to + (address - from))
            } else {
                None
            }
        };

        let mut tables = self.tables()?;
        self.memory.copy(from, to, length)?;

        let mut escapes = BTreeSet::new();
        let mut rewritten = 0;
        for cell in tables.escapes.iter() {
            let cell = moved(*cell).unwrap_or(*cell);
            let pointer = self.memory.read_u64(cell)?;
            if let Some(pointer) = moved(pointer) {
                self.memory.write_u64(cell, pointer)?;
                rewritten += 1;
            }
            escapes.insert(cell);
        }
        tables.escapes = escapes;

        // take every allocation out before putting any back, the ranges may
        // overlap
        let inside: Vec<u64> = tables
            .allocations
            .range(from..from.saturating_add(length))
            .map(|(start, _)| *start)
            .collect();
        let moving: Vec<Allocation> = inside
            .into_iter()
            .filter_map(|start| tables.allocations.remove(&start))
            .collect();
        for mut allocation in moving {
            allocation.start = to + (allocation.start - from);
            tables.allocations.insert(allocation.start, allocation);
        }

        debug!(
            "relocated 0x{:x} bytes from 0x{:x} to 0x{:x}, rewrote {} escapes",
            length, from, to, rewritten
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::memory::SparseMemory;

    fn table() -> AllocationTable {
        AllocationTable::new(Arc::new(SparseMemory::new()))
    }

    #[test]
    fn untrack_forgets_escapes_inside() {
        let table = table();
        table.track(0x2000, 0x100, AllocationKind::Heap).unwrap();
        table.record_escape(0x2010).unwrap();
        table.record_escape(0x3000).unwrap();

        assert_eq!(table.find_containing(0x20ff).unwrap().unwrap().start, 0x2000);
        let allocation = table.untrack(0x2000).unwrap().unwrap();

        assert_eq!(allocation.kind, AllocationKind::Heap);
        assert_eq!(table.escapes().unwrap(), vec![0x3000]);
        assert!(table.untrack(0x2000).unwrap().is_none());
    }

    #[test]
    fn relocation_rewrites_escaped_pointers() {
        let table = table();
        let memory = table.memory().clone();
        table.track(0x2000, 0x100, AllocationKind::Heap).unwrap();
        table.track(0x3000, 0x100, AllocationKind::Heap).unwrap();

        // a cell outside the region pointing in, and a cell inside pointing
        // at itself
        memory.write_u64(0x3000, 0x2040).unwrap();
        table.record_escape(0x3000).unwrap();
        memory.write_u64(0x2008, 0x2008).unwrap();
        table.record_escape(0x2008).unwrap();
        memory.write_u64(0x2020, 0xdead_beef).unwrap();

        table.relocate(0x2000, 0x5000, 0x100).unwrap();

        assert_eq!(memory.read_u64(0x3000).unwrap(), 0x5040);
        assert_eq!(memory.read_u64(0x5008).unwrap(), 0x5008);
        assert_eq!(memory.read_u64(0x5020).unwrap(), 0xdead_beef);
        assert_eq!(table.escapes().unwrap(), vec![0x3000, 0x5008]);
        assert!(table.allocation(0x2000).unwrap().is_none());
        assert_eq!(table.allocation(0x5000).unwrap().unwrap().length, 0x100);
    }

    #[test]
    fn relocation_onto_itself_keeps_every_allocation() {
        let table = table();
        table.track(0x2000, 0x10, AllocationKind::Heap).unwrap();
        table.track(0x2010, 0xf0, AllocationKind::Global(3)).unwrap();

        table.relocate(0x2000, 0x2010, 0x100).unwrap();

        let allocations = table.allocations().unwrap();
        assert_eq!(allocations.len(), 2);
        assert_eq!(
            (allocations[0].start, allocations[0].length, allocations[0].kind),
            (0x2010, 0x10, AllocationKind::Heap)
        );
        assert_eq!(
            (allocations[1].start, allocations[1].length, allocations[1].kind),
            (0x2020, 0xf0, AllocationKind::Global(3))
        );
    }
}
