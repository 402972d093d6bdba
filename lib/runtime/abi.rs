//! The functions instrumented code calls.
//!
//! Each `notify_*` keeps the address space and the allocation table in step
//! with the program's allocator. Guards validate accesses against the address
//! space, and return `Error::GuardViolation` for accesses that must not
//! happen.

use crate::runtime::aspace::{AddressSpace, Aspace};
use crate::runtime::region::{MatchMask, Protection, RegionInfo};
use crate::runtime::tracking::{AllocationKind, AllocationTable};
use crate::{AccessKind, Error};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Protection given to heap allocations and globals.
pub const DATA_PROTECTION: Protection = Protection::RW;

#[derive(Debug, Default)]
struct Counters {
    allocations: AtomicU64,
    frees: AtomicU64,
    globals: AtomicU64,
    escapes: AtomicU64,
    guards: AtomicU64,
    stack_guards: AtomicU64,
    violations: AtomicU64,
}

/// A snapshot of the calls a runtime has served.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct RuntimeStats {
    pub allocations: u64,
    pub frees: u64,
    pub globals: u64,
    pub escapes: u64,
    pub guards: u64,
    pub stack_guards: u64,
    pub violations: u64,
}

/// The runtime of one address space.
pub struct Runtime {
    aspace: Arc<Aspace>,
    table: Arc<AllocationTable>,
    stack_pointer: AtomicU64,
    counters: Counters,
}

impl Runtime {
    /// A runtime over `aspace`. `table` should be the relocator `aspace` was
    /// built with.
    pub fn new(aspace: Arc<Aspace>, table: Arc<AllocationTable>) -> Runtime {
        Runtime {
            aspace,
            table,
            stack_pointer: AtomicU64::new(0),
            counters: Counters::default(),
        }
    }

    pub fn aspace(&self) -> &Arc<Aspace> {
        &self.aspace
    }

    pub fn table(&self) -> &Arc<AllocationTable> {
        &self.table
    }

    pub fn stats(&self) -> RuntimeStats {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        RuntimeStats {
            allocations: load(&self.counters.allocations),
            frees: load(&self.counters.frees),
            globals: load(&self.counters.globals),
            escapes: load(&self.counters.escapes),
            guards: load(&self.counters.guards),
            stack_guards: load(&self.counters.stack_guards),
            violations: load(&self.counters.violations),
        }
    }

    /// Tell the runtime where the stack pointer is, for stack guards.
    pub fn set_stack_pointer(&self, stack_pointer: u64) {
        self.stack_pointer.store(stack_pointer, Ordering::Release);
    }

    fn track(&self, ptr: u64, size: u64, kind: AllocationKind) -> Result<(), Error> {
        if ptr == 0 {
            return Ok(());
        }
        if size == 0 {
            debug!("not tracking empty allocation at 0x{:x}", ptr);
            return Ok(());
        }
        self.aspace
            .add_region(&RegionInfo::new(ptr, size, DATA_PROTECTION))?;
        self.table.track(ptr, size, kind)
    }

    fn untrack(&self, ptr: u64) -> Result<bool, Error> {
        if self.table.untrack(ptr)?.is_none() {
            return Ok(false);
        }
        self.aspace.remove_region(
            &RegionInfo::new(ptr, 0, Protection::NONE),
            MatchMask::VA,
        )?;
        Ok(true)
    }

    pub fn notify_malloc(&self, ptr: u64, size: u64) -> Result<(), Error> {
        self.counters.allocations.fetch_add(1, Ordering::Relaxed);
        trace!("malloc 0x{:x} bytes at 0x{:x}", size, ptr);
        self.track(ptr, size, AllocationKind::Heap)
    }

    pub fn notify_calloc(&self, ptr: u64, size: u64, nmemb: u64) -> Result<(), Error> {
        let total = size.checked_mul(nmemb).ok_or_else(|| {
            Error::InvalidRegion(format!("calloc of {} elements of 0x{:x} bytes", nmemb, size))
        })?;
        self.notify_malloc(ptr, total)
    }

    pub fn notify_realloc(&self, ptr: u64, size: u64, old: u64) -> Result<(), Error> {
        if old != 0 {
            self.untrack(old)?;
        }
        if ptr == 0 && size != 0 {
            warn!("realloc of 0x{:x} failed, its storage is no longer tracked", old);
        }
        self.notify_malloc(ptr, size)
    }

    pub fn notify_free(&self, ptr: u64) -> Result<(), Error> {
        if ptr == 0 {
            return Ok(());
        }
        self.counters.frees.fetch_add(1, Ordering::Relaxed);
        if !self.untrack(ptr)? {
            warn!("free of untracked pointer 0x{:x}", ptr);
        }
        Ok(())
    }

    pub fn notify_global(&self, ptr: u64, size: u64, id: u64) -> Result<(), Error> {
        self.counters.globals.fetch_add(1, Ordering::Relaxed);
        self.track(ptr, size, AllocationKind::Global(id))
    }

    pub fn notify_escape(&self, cell: u64) -> Result<(), Error> {
        self.counters.escapes.fetch_add(1, Ordering::Relaxed);
        self.table.record_escape(cell)
    }

    /// Validate one access.
    pub fn guard_address(&self, address: u64, is_write: bool) -> Result<(), Error> {
        self.counters.guards.fetch_add(1, Ordering::Relaxed);
        self.aspace
            .request_permission(address, AccessKind::from_is_write(is_write))
            .map_err(|e| {
                self.counters.violations.fetch_add(1, Ordering::Relaxed);
                warn!("guard failed: {}", e);
                e
            })
    }

    /// Validate that a callee's frame of `frame_size` bytes fits in the
    /// writable stack below the stack pointer.
    pub fn guard_callee_stack(&self, frame_size: u64) -> Result<(), Error> {
        self.counters.stack_guards.fetch_add(1, Ordering::Relaxed);
        let stack = self
            .aspace
            .stack()
            .ok_or_else(|| Error::InvalidRegion("address space has no stack".to_string()))?;
        let stack_pointer = match self.stack_pointer.load(Ordering::Acquire) {
            0 => stack.end(),
            stack_pointer => stack_pointer,
        };
        let fits = stack_pointer
            .checked_sub(frame_size)
            .map(|low| low >= stack.start() && stack_pointer <= stack.end())
            .unwrap_or(false);
        if !fits || !stack.protection().allows(AccessKind::Write) {
            self.counters.violations.fetch_add(1, Ordering::Relaxed);
            warn!(
                "callee frame of 0x{:x} bytes does not fit below 0x{:x}",
                frame_size, stack_pointer
            );
            return Err(Error::GuardViolation {
                address: stack_pointer.wrapping_sub(frame_size),
                access: AccessKind::Write,
            });
        }
        stack.latch(AccessKind::Write);
        Ok(())
    }

    /// Pin the region holding `ptr`.
    pub fn pin_pointer(&self, ptr: u64) -> Result<(), Error> {
        self.aspace.pin(ptr).map(|_| ())
    }
}
