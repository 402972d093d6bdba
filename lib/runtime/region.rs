//! Regions of identity-mapped memory, and the permissions attached to them.

use crate::AccessKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

bitflags! {
    /// Protection of a region.
    #[derive(Deserialize, Serialize)]
    pub struct Protection: u32 {
        const NONE  = 0b00_0000;
        const READ  = 0b00_0001;
        const WRITE = 0b00_0010;
        const EXEC  = 0b00_0100;
        /// Only kernel code may access the region.
        const KERN  = 0b00_1000;
        /// The region may not be moved or removed.
        const PIN   = 0b01_0000;
        /// The region is populated when it is created.
        const EAGER = 0b10_0000;
        const RW    = Self::READ.bits | Self::WRITE.bits;
        const RWX   = Self::READ.bits | Self::WRITE.bits | Self::EXEC.bits;
    }
}

bitflags! {
    /// The fields which must agree for two regions to match.
    #[derive(Deserialize, Serialize)]
    pub struct MatchMask: u32 {
        const VA   = 0b0001;
        const PA   = 0b0010;
        const LEN  = 0b0100;
        const PROT = 0b1000;
        const ALL  = Self::VA.bits | Self::PA.bits | Self::LEN.bits | Self::PROT.bits;
    }
}

impl Protection {
    /// The latched permission an access requires.
    pub fn for_access(access: AccessKind) -> Protection {
        match access {
            AccessKind::Read => Protection::READ,
            AccessKind::Write => Protection::WRITE,
        }
    }

    /// Returns `true` if this protection allows `access`. A write needs
    /// `WRITE`, and a read needs `READ` or `WRITE`.
    pub fn allows(&self, access: AccessKind) -> bool {
        match access {
            AccessKind::Write => self.contains(Protection::WRITE),
            AccessKind::Read => self.intersects(Protection::READ | Protection::WRITE),
        }
    }
}

/// Returns `true` if `request` asks for no more than `container` grants.
///
/// Read, write and execute compare forward: the request may only hold bits
/// the container holds. The kernel bit compares inverted: a kernel-only
/// container only satisfies kernel requests.
pub fn permission_leq(request: Protection, container: Protection) -> bool {
    let forward = Protection::RWX;
    let request_forward = request & forward;
    if !(container & forward).contains(request_forward) {
        return false;
    }
    request.contains(Protection::KERN) || !container.contains(Protection::KERN)
}

/// A plain description of a region, used to name regions in queries and to
/// snapshot them.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct RegionInfo {
    pub start: u64,
    pub physical_start: u64,
    pub length: u64,
    pub protection: Protection,
    /// Accesses already validated against the region.
    pub requested: Protection,
}

impl RegionInfo {
    /// An identity-mapped region.
    pub fn new(start: u64, length: u64, protection: Protection) -> RegionInfo {
        RegionInfo {
            start,
            physical_start: start,
            length,
            protection,
            requested: Protection::NONE,
        }
    }

    pub fn with_physical_start(mut self, physical_start: u64) -> RegionInfo {
        self.physical_start = physical_start;
        self
    }

    /// The first address past the region.
    pub fn end(&self) -> u64 {
        self.start.saturating_add(self.length)
    }

    pub fn is_identity_mapped(&self) -> bool {
        self.start == self.physical_start
    }

    pub fn overlaps(&self, other: &RegionInfo) -> bool {
        self.start < other.end() && other.start < self.end()
    }

    /// Returns `true` if both bounds of `other` lie in this region.
    pub fn contains_region(&self, other: &RegionInfo) -> bool {
        self.start <= other.start && other.end() <= self.end()
    }
}

impl fmt::Display for RegionInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "[0x{:x}, 0x{:x}) {:?}",
            self.start,
            self.end(),
            self.protection
        )
    }
}

/// A tracked region.
///
/// The start never changes. Length and protection change under the
/// tracker's lock, and the latched permissions are OR-ed in without it.
#[derive(Debug)]
pub struct Region {
    start: u64,
    physical_start: u64,
    length: AtomicU64,
    protection: AtomicU32,
    requested: AtomicU32,
}

impl Region {
    pub fn new(info: &RegionInfo) -> Region {
        Region {
            start: info.start,
            physical_start: info.physical_start,
            length: AtomicU64::new(info.length),
            protection: AtomicU32::new(info.protection.bits()),
            requested: AtomicU32::new(info.requested.bits()),
        }
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn physical_start(&self) -> u64 {
        self.physical_start
    }

    pub fn len(&self) -> u64 {
        self.length.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn end(&self) -> u64 {
        self.start.saturating_add(self.len())
    }

    pub fn protection(&self) -> Protection {
        Protection::from_bits_truncate(self.protection.load(Ordering::Acquire))
    }

    /// The accesses validated against this region so far.
    pub fn requested(&self) -> Protection {
        Protection::from_bits_truncate(self.requested.load(Ordering::Acquire))
    }

    pub fn is_pinned(&self) -> bool {
        self.protection().contains(Protection::PIN)
    }

    pub fn contains_address(&self, address: u64) -> bool {
        self.start <= address && address < self.end()
    }

    /// Record that `access` was validated against this region.
    pub fn latch(&self, access: AccessKind) {
        self.requested
            .fetch_or(Protection::for_access(access).bits(), Ordering::AcqRel);
    }

    pub(crate) fn set_len(&self, length: u64) {
        self.length.store(length, Ordering::Release);
    }

    pub(crate) fn set_protection(&self, protection: Protection) {
        self.protection.store(protection.bits(), Ordering::Release);
    }

    /// Returns `true` if the fields selected by `mask` agree with `info`.
    pub fn matches(&self, info: &RegionInfo, mask: MatchMask) -> bool {
        (!mask.contains(MatchMask::VA) || self.start == info.start)
            && (!mask.contains(MatchMask::PA) || self.physical_start == info.physical_start)
            && (!mask.contains(MatchMask::LEN) || self.len() == info.length)
            && (!mask.contains(MatchMask::PROT) || self.protection() == info.protection)
    }

    pub fn info(&self) -> RegionInfo {
        RegionInfo {
            start: self.start,
            physical_start: self.physical_start,
            length: self.len(),
            protection: self.protection(),
            requested: self.requested(),
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.info())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_bit_compares_inverted() {
        let user = Protection::READ | Protection::WRITE;
        let kernel = user | Protection::KERN;

        assert!(permission_leq(Protection::READ, user));
        assert!(!permission_leq(Protection::EXEC, user));
        // a kernel request may use user memory
        assert!(permission_leq(Protection::READ | Protection::KERN, user));
        // a user request may not use kernel-only memory
        assert!(!permission_leq(Protection::READ, kernel));
        assert!(permission_leq(Protection::WRITE | Protection::KERN, kernel));
    }

    #[test]
    fn latch_accumulates() {
        let region = Region::new(&RegionInfo::new(0x1000, 0x100, Protection::RWX));
        assert_eq!(region.requested(), Protection::NONE);

        region.latch(AccessKind::Read);
        region.latch(AccessKind::Write);
        region.latch(AccessKind::Read);

        assert_eq!(region.requested(), Protection::READ | Protection::WRITE);
    }

    #[test]
    fn matching_by_mask() {
        let region = Region::new(&RegionInfo::new(0x1000, 0x100, Protection::READ));
        let other = RegionInfo::new(0x1000, 0x200, Protection::WRITE);

        assert!(region.matches(&other, MatchMask::VA | MatchMask::PA));
        assert!(!region.matches(&other, MatchMask::VA | MatchMask::LEN));
        assert!(!region.matches(&other, MatchMask::PROT));
    }

    #[test]
    fn write_permission_implies_read() {
        assert!(Protection::WRITE.allows(AccessKind::Read));
        assert!(!Protection::READ.allows(AccessKind::Write));
        assert!(!Protection::EXEC.allows(AccessKind::Read));
    }
}
