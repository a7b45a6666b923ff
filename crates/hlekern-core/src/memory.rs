//! Guest memory access
//!
//! Lightweight primitives keep their control blocks in guest-addressable
//! memory. The kernel never dereferences host pointers for them; every read
//! and write goes through [`GuestMemory`], which owns byte order.

use crate::error::{KernelError, KernelResult};
use parking_lot::Mutex;

/// Word-granular access to guest memory
pub trait GuestMemory: Send + Sync {
    /// Read a 32-bit word at a guest address
    fn read_u32(&self, addr: u32) -> KernelResult<u32>;

    /// Write a 32-bit word at a guest address
    fn write_u32(&self, addr: u32, value: u32) -> KernelResult<()>;

    /// Check that `len` bytes starting at `addr` are accessible
    fn check_range(&self, addr: u32, len: u32) -> KernelResult<()>;

    /// Read a 64-bit word at a guest address
    fn read_u64(&self, addr: u32) -> KernelResult<u64> {
        let hi = self.read_u32(addr)? as u64;
        let lo = self.read_u32(addr.checked_add(4).ok_or(KernelError::Fault(addr))?)? as u64;
        Ok((hi << 32) | lo)
    }

    /// Write a 64-bit word at a guest address
    fn write_u64(&self, addr: u32, value: u64) -> KernelResult<()> {
        self.check_range(addr, 8)?;
        self.write_u32(addr, (value >> 32) as u32)?;
        self.write_u32(addr + 4, value as u32)
    }
}

/// Big-endian guest RAM held in a host buffer
pub struct FlatMemory {
    bytes: Mutex<Vec<u8>>,
}

impl FlatMemory {
    /// Allocate `size` zeroed bytes starting at guest address 0
    pub fn new(size: usize) -> Self {
        Self {
            bytes: Mutex::new(vec![0; size]),
        }
    }

    /// Size of the backing buffer in bytes
    pub fn size(&self) -> usize {
        self.bytes.lock().len()
    }

    fn range(addr: u32, len: usize, size: usize) -> KernelResult<std::ops::Range<usize>> {
        let start = addr as usize;
        match start.checked_add(len) {
            Some(end) if end <= size => Ok(start..end),
            _ => Err(KernelError::Fault(addr)),
        }
    }
}

impl GuestMemory for FlatMemory {
    fn read_u32(&self, addr: u32) -> KernelResult<u32> {
        let bytes = self.bytes.lock();
        let range = Self::range(addr, 4, bytes.len())?;
        let mut word = [0u8; 4];
        word.copy_from_slice(&bytes[range]);
        Ok(u32::from_be_bytes(word))
    }

    fn write_u32(&self, addr: u32, value: u32) -> KernelResult<()> {
        let mut bytes = self.bytes.lock();
        let range = Self::range(addr, 4, bytes.len())?;
        bytes[range].copy_from_slice(&value.to_be_bytes());
        Ok(())
    }

    fn check_range(&self, addr: u32, len: u32) -> KernelResult<()> {
        Self::range(addr, len as usize, self.bytes.lock().len()).map(drop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_big_endian_layout() {
        let mem = FlatMemory::new(16);
        mem.write_u32(0, 0x1122_3344).unwrap();
        assert_eq!(mem.bytes.lock()[..4], [0x11, 0x22, 0x33, 0x44]);
        assert_eq!(mem.read_u32(0).unwrap(), 0x1122_3344);
    }

    #[test]
    fn test_u64_spans_two_words() {
        let mem = FlatMemory::new(16);
        mem.write_u64(8, 0xAABB_CCDD_0011_2233).unwrap();
        assert_eq!(mem.read_u32(8).unwrap(), 0xAABB_CCDD);
        assert_eq!(mem.read_u32(12).unwrap(), 0x0011_2233);
        assert_eq!(mem.read_u64(8).unwrap(), 0xAABB_CCDD_0011_2233);
    }

    #[test]
    fn test_out_of_range_faults() {
        let mem = FlatMemory::new(8);
        assert_eq!(mem.read_u32(6), Err(KernelError::Fault(6)));
        assert_eq!(mem.write_u32(u32::MAX, 1), Err(KernelError::Fault(u32::MAX)));
        assert_eq!(mem.check_range(0, 8), Ok(()));
        assert_eq!(mem.check_range(1, 8), Err(KernelError::Fault(1)));
    }

    #[test]
    fn test_straddling_u64_write_leaves_memory_untouched() {
        let mem = FlatMemory::new(8);
        mem.write_u32(4, 0x1234_5678).unwrap();
        assert_eq!(mem.write_u64(4, u64::MAX), Err(KernelError::Fault(4)));
        assert_eq!(mem.read_u32(4), Ok(0x1234_5678));
    }
}
