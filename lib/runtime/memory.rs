//! Byte-addressable memory shared by the runtime and the executor.

use crate::Error;
use rustc_hash::FxHashMap;
use std::sync::Mutex;

/// The size of a page of `SparseMemory`.
pub const PAGE_SIZE: usize = 1024;
pub const PAGE_MASK: u64 = !(PAGE_SIZE as u64 - 1);

/// Memory the runtime relocates regions in.
pub trait HostMemory: Send + Sync {
    fn read(&self, address: u64, buf: &mut [u8]) -> Result<(), Error>;

    fn write(&self, address: u64, bytes: &[u8]) -> Result<(), Error>;

    /// Read a little-endian value of `bytes` bytes, at most 8.
    fn read_uint(&self, address: u64, bytes: usize) -> Result<u64, Error> {
        let mut buf = [0u8; 8];
        self.read(address, &mut buf[..bytes.min(8)])?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Write the low `bytes` bytes of `value`, little-endian.
    fn write_uint(&self, address: u64, value: u64, bytes: usize) -> Result<(), Error> {
        self.write(address, &value.to_le_bytes()[..bytes.min(8)])
    }

    fn read_u64(&self, address: u64) -> Result<u64, Error> {
        self.read_uint(address, 8)
    }

    fn write_u64(&self, address: u64, value: u64) -> Result<(), Error> {
        self.write_uint(address, value, 8)
    }

    /// Copy `length` bytes from `from` to `to`. The ranges may overlap.
    fn copy(&self, from: u64, to: u64, length: u64) -> Result<(), Error> {
        let length = usize::try_from(length)
            .map_err(|_| Error::InvalidRegion(format!("copy of 0x{:x} bytes", length)))?;
        let mut buf = vec![0u8; length];
        self.read(from, &mut buf)?;
        self.write(to, &buf)
    }
}

/// Memory allocated a page at a time, on first write. Memory never written
/// reads as zero. Address zero faults.
#[derive(Debug, Default)]
pub struct SparseMemory {
    pages: Mutex<FxHashMap<u64, Box<[u8]>>>,
}

impl SparseMemory {
    pub fn new() -> SparseMemory {
        SparseMemory::default()
    }

    /// The number of pages written to.
    pub fn pages(&self) -> usize {
        self.pages.lock().map(|pages| pages.len()).unwrap_or(0)
    }

    fn check(address: u64, length: usize) -> Result<(), Error> {
        if address < PAGE_SIZE as u64 || address.checked_add(length as u64).is_none() {
            return Err(Error::MemoryFault(address));
        }
        Ok(())
    }
}

impl HostMemory for SparseMemory {
    fn read(&self, address: u64, buf: &mut [u8]) -> Result<(), Error> {
        SparseMemory::check(address, buf.len())?;
        let pages = self
            .pages
            .lock()
            .map_err(|_| Error::MemoryFault(address))?;
        for (offset, byte) in buf.iter_mut().enumerate() {
            let address = address + offset as u64;
            *byte = pages
                .get(&(address & PAGE_MASK))
                .map(|page| page[(address & !PAGE_MASK) as usize])
                .unwrap_or(0);
        }
        Ok(())
    }

    fn write(&self, address: u64, bytes: &[u8]) -> Result<(), Error> {
        SparseMemory::check(address, bytes.len())?;
        let mut pages = self
            .pages
            .lock()
            .map_err(|_| Error::MemoryFault(address))?;
        for (offset, byte) in bytes.iter().enumerate() {
            let address = address + offset as u64;
            let page = pages
                .entry(address & PAGE_MASK)
                .or_insert_with(|| vec![0u8; PAGE_SIZE].into_boxed_slice());
            page[(address & !PAGE_MASK) as usize] = *byte;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_back_across_pages() {
        let memory = SparseMemory::new();
        let address = 0x4000 + PAGE_SIZE as u64 - 3;

        memory.write_u64(address, 0x1122_3344_5566_7788).unwrap();

        assert_eq!(memory.read_u64(address).unwrap(), 0x1122_3344_5566_7788);
        assert_eq!(memory.read_uint(address, 1).unwrap(), 0x88);
        assert_eq!(memory.pages(), 2);
        assert_eq!(memory.read_u64(0x9000).unwrap(), 0);
    }

    #[test]
    fn copy_overlapping() {
        let memory = SparseMemory::new();
        memory.write(0x2000, &[1, 2, 3, 4]).unwrap();

        memory.copy(0x2000, 0x2002, 4).unwrap();

        let mut buf = [0u8; 6];
        memory.read(0x2000, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 1, 2, 3, 4]);
    }

    #[test]
    fn null_page_faults() {
        let memory = SparseMemory::new();
        assert!(matches!(memory.read_u64(0), Err(Error::MemoryFault(0))));
    }
}
