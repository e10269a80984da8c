//! Storage device abstraction
//!
//! Traits and implementations for the devices behind the hybrid log, the
//! object log and checkpoint files.

mod file_device;
mod memory_device;
mod traits;

pub use file_device::{FileSystemDisk, FileSystemFile, SegmentedFile};
pub use memory_device::MemoryDevice;
pub use traits::{read_exact, write_all, IoFuture, StorageDevice, SyncStorageDevice};
