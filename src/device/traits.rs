//! Storage device traits
//!
//! The engine only assumes sector-aligned asynchronous reads and writes at
//! byte offsets. Anything that can do that can back the hybrid log, the object
//! log or a checkpoint.

use std::future::Future;
use std::io;
use std::pin::Pin;

/// Boxed future returned by device operations.
pub type IoFuture<'a, T> = Pin<Box<dyn Future<Output = io::Result<T>> + Send + 'a>>;

/// Async storage device trait
pub trait StorageDevice: Send + Sync + 'static {
    /// Read up to `buf.len()` bytes at `offset`.
    ///
    /// Returns the number of bytes read; a short count means the device ended.
    fn read<'a>(&'a self, offset: u64, buf: &'a mut [u8]) -> IoFuture<'a, usize>;

    /// Write `buf` at `offset`.
    fn write<'a>(&'a self, offset: u64, buf: &'a [u8]) -> IoFuture<'a, usize>;

    /// Flush any buffered writes to stable storage
    fn flush(&self) -> IoFuture<'_, ()>;

    /// Truncate the device to the specified size
    fn truncate(&self, size: u64) -> IoFuture<'_, ()>;

    /// Get the current size of the device
    fn size(&self) -> io::Result<u64>;

    /// Sector size; writes of whole pages are aligned to it.
    fn sector_size(&self) -> usize {
        512
    }

    /// Release storage below `offset`. Devices without segments ignore this.
    fn remove_until(&self, _offset: u64) -> io::Result<()> {
        Ok(())
    }
}

/// Synchronous storage device trait (for simpler implementations)
pub trait SyncStorageDevice: Send + Sync + 'static {
    /// Read data synchronously
    fn read_sync(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;

    /// Write data synchronously
    fn write_sync(&self, offset: u64, buf: &[u8]) -> io::Result<usize>;

    /// Flush synchronously
    fn flush_sync(&self) -> io::Result<()>;

    /// Truncate synchronously
    fn truncate_sync(&self, size: u64) -> io::Result<()>;

    /// Get the current size
    fn size_sync(&self) -> io::Result<u64>;

    /// Get sector size
    fn sector_size(&self) -> usize {
        512
    }

    /// Release storage below `offset`.
    fn remove_until_sync(&self, _offset: u64) -> io::Result<()> {
        Ok(())
    }
}

impl<T: SyncStorageDevice> StorageDevice for T {
    fn read<'a>(&'a self, offset: u64, buf: &'a mut [u8]) -> IoFuture<'a, usize> {
        Box::pin(async move { self.read_sync(offset, buf) })
    }

    fn write<'a>(&'a self, offset: u64, buf: &'a [u8]) -> IoFuture<'a, usize> {
        Box::pin(async move { self.write_sync(offset, buf) })
    }

    fn flush(&self) -> IoFuture<'_, ()> {
        Box::pin(async move { self.flush_sync() })
    }

    fn truncate(&self, size: u64) -> IoFuture<'_, ()> {
        Box::pin(async move { self.truncate_sync(size) })
    }

    fn size(&self) -> io::Result<u64> {
        self.size_sync()
    }

    fn sector_size(&self) -> usize {
        SyncStorageDevice::sector_size(self)
    }

    fn remove_until(&self, offset: u64) -> io::Result<()> {
        self.remove_until_sync(offset)
    }
}

/// Write all of `buf` at `offset`, looping over short writes.
pub async fn write_all<D: StorageDevice + ?Sized>(
    device: &D,
    mut offset: u64,
    mut buf: &[u8],
) -> io::Result<()> {
    while !buf.is_empty() {
        let n = device.write(offset, buf).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "device accepted zero bytes",
            ));
        }
        offset += n as u64;
        buf = &buf[n..];
    }
    Ok(())
}

/// Read exactly `buf.len()` bytes at `offset`.
pub async fn read_exact<D: StorageDevice + ?Sized>(
    device: &D,
    offset: u64,
    buf: &mut [u8],
) -> io::Result<()> {
    let n = device.read(offset, buf).await?;
    if n < buf.len() {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("short read at {offset}: {n} of {} bytes", buf.len()),
        ));
    }
    Ok(())
}
