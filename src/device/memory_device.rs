//! In-memory storage device
//!
//! Keeps every written byte in a growable buffer. Used for tests, benchmarks
//! and stores that never need to outlive the process.

use std::io;

use parking_lot::RwLock;

use crate::device::SyncStorageDevice;

/// Volatile device backed by a byte vector.
#[derive(Default)]
pub struct MemoryDevice {
    data: RwLock<Vec<u8>>,
    sector_size: usize,
}

impl MemoryDevice {
    /// Create an empty device with 512-byte sectors.
    pub fn new() -> Self {
        Self::with_sector_size(512)
    }

    /// Create an empty device with the given sector size.
    pub fn with_sector_size(sector_size: usize) -> Self {
        Self {
            data: RwLock::new(Vec::new()),
            sector_size: sector_size.max(1),
        }
    }
}

impl SyncStorageDevice for MemoryDevice {
    fn read_sync(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let data = self.data.read();
        let start = offset as usize;
        if start >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        Ok(n)
    }

    fn write_sync(&self, offset: u64, buf: &[u8]) -> io::Result<usize> {
        let mut data = self.data.write();
        let start = offset as usize;
        let end = start + buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn flush_sync(&self) -> io::Result<()> {
        Ok(())
    }

    fn truncate_sync(&self, size: u64) -> io::Result<()> {
        self.data.write().resize(size as usize, 0);
        Ok(())
    }

    fn size_sync(&self) -> io::Result<u64> {
        Ok(self.data.read().len() as u64)
    }

    fn sector_size(&self) -> usize {
        self.sector_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_device_write_read() {
        let dev = MemoryDevice::new();
        dev.write_sync(100, &[7u8; 10]).unwrap();
        assert_eq!(dev.size_sync().unwrap(), 110);

        let mut buf = [0u8; 20];
        assert_eq!(dev.read_sync(95, &mut buf).unwrap(), 15);
        assert_eq!(&buf[..5], &[0u8; 5]);
        assert_eq!(&buf[5..15], &[7u8; 10]);
    }

    #[test]
    fn test_memory_device_truncate() {
        let dev = MemoryDevice::new();
        dev.write_sync(0, &[1u8; 64]).unwrap();
        dev.truncate_sync(16).unwrap();
        assert_eq!(dev.size_sync().unwrap(), 16);
        let mut buf = [0u8; 8];
        assert_eq!(dev.read_sync(32, &mut buf).unwrap(), 0);
    }
}
