//! File system storage devices
//!
//! `FileSystemFile` is a single file. `SegmentedFile` spreads the address space
//! over fixed-size segment files so the log's begin address can drop whole
//! segments from disk.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::device::SyncStorageDevice;

/// File system file wrapper
///
/// Wraps a file with mutex protection for thread-safe access.
pub struct FileSystemFile {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileSystemFile {
    /// Open or create a file at the specified path
    pub fn open(path: impl AsRef<Path>, create: bool) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if create {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .truncate(false)
            .open(&path)?;

        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Get the path to the file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SyncStorageDevice for FileSystemFile {
    fn read_sync(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;

        let mut filled = 0;
        while filled < buf.len() {
            match file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }

    fn write_sync(&self, offset: u64, buf: &[u8]) -> io::Result<usize> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush_sync(&self) -> io::Result<()> {
        self.file.lock().sync_all()
    }

    fn truncate_sync(&self, size: u64) -> io::Result<()> {
        self.file.lock().set_len(size)
    }

    fn size_sync(&self) -> io::Result<u64> {
        self.file.lock().metadata().map(|m| m.len())
    }
}

struct Segments {
    files: Vec<Option<FileSystemFile>>,
    /// Segments below this index have been removed.
    begin: u64,
}

/// Segmented file for large storage
pub struct SegmentedFile {
    base_dir: PathBuf,
    prefix: String,
    segment_size: u64,
    segments: Mutex<Segments>,
}

impl SegmentedFile {
    /// Create a new segmented file
    ///
    /// `segment_size` must be a power of two.
    pub fn new(base_dir: impl AsRef<Path>, prefix: &str, segment_size: u64) -> io::Result<Self> {
        if !segment_size.is_power_of_two() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("segment size {segment_size} is not a power of two"),
            ));
        }
        let base_dir = base_dir.as_ref().to_path_buf();
        fs::create_dir_all(&base_dir)?;

        Ok(Self {
            base_dir,
            prefix: prefix.to_string(),
            segment_size,
            segments: Mutex::new(Segments {
                files: Vec::new(),
                begin: 0,
            }),
        })
    }

    /// Segment size in bytes.
    pub fn segment_size(&self) -> u64 {
        self.segment_size
    }

    /// Index of the first segment still present.
    pub fn begin_segment(&self) -> u64 {
        self.segments.lock().begin
    }

    fn segment_path(&self, segment: u64) -> PathBuf {
        self.base_dir.join(format!("{}.{}", self.prefix, segment))
    }

    /// Run `f` against a segment, opening it if needed.
    fn with_segment<R>(
        &self,
        segment: u64,
        f: impl FnOnce(&FileSystemFile) -> io::Result<R>,
    ) -> io::Result<R> {
        let mut segments = self.segments.lock();
        if segment < segments.begin {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("segment {segment} was removed"),
            ));
        }

        let idx = segment as usize;
        if segments.files.len() <= idx {
            segments.files.resize_with(idx + 1, || None);
        }
        if segments.files[idx].is_none() {
            segments.files[idx] = Some(FileSystemFile::open(self.segment_path(segment), true)?);
        }
        match segments.files[idx].as_ref() {
            Some(file) => f(file),
            None => Err(io::Error::new(io::ErrorKind::NotFound, "segment not open")),
        }
    }
}

impl SyncStorageDevice for SegmentedFile {
    fn read_sync(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let mask = self.segment_size - 1;
        let mut done = 0usize;
        while done < buf.len() {
            let pos = offset + done as u64;
            let in_segment = (self.segment_size - (pos & mask)) as usize;
            let len = in_segment.min(buf.len() - done);
            let n = self.with_segment(pos / self.segment_size, |file| {
                file.read_sync(pos & mask, &mut buf[done..done + len])
            })?;
            done += n;
            if n < len {
                break;
            }
        }
        Ok(done)
    }

    fn write_sync(&self, offset: u64, buf: &[u8]) -> io::Result<usize> {
        let mask = self.segment_size - 1;
        let mut done = 0usize;
        while done < buf.len() {
            let pos = offset + done as u64;
            let in_segment = (self.segment_size - (pos & mask)) as usize;
            let len = in_segment.min(buf.len() - done);
            self.with_segment(pos / self.segment_size, |file| {
                file.write_sync(pos & mask, &buf[done..done + len])
            })?;
            done += len;
        }
        Ok(done)
    }

    fn flush_sync(&self) -> io::Result<()> {
        let segments = self.segments.lock();
        for segment in segments.files.iter().flatten() {
            segment.flush_sync()?;
        }
        Ok(())
    }

    fn truncate_sync(&self, size: u64) -> io::Result<()> {
        let last = size / self.segment_size;
        let mut segments = self.segments.lock();
        let open = segments.files.len() as u64;
        for segment in (last + 1)..open {
            if segments.files[segment as usize].take().is_some() {
                fs::remove_file(self.segment_path(segment))?;
            }
        }
        if let Some(Some(file)) = segments.files.get(last as usize) {
            file.truncate_sync(size & (self.segment_size - 1))?;
        }
        Ok(())
    }

    fn size_sync(&self) -> io::Result<u64> {
        let segments = self.segments.lock();
        let mut end = 0u64;
        for (idx, segment) in segments.files.iter().enumerate() {
            if let Some(file) = segment {
                let len = file.size_sync()?;
                if len > 0 {
                    end = idx as u64 * self.segment_size + len;
                }
            }
        }
        Ok(end)
    }

    fn remove_until_sync(&self, offset: u64) -> io::Result<()> {
        let new_begin = offset / self.segment_size;
        let mut segments = self.segments.lock();
        if new_begin <= segments.begin {
            return Ok(());
        }

        for segment in segments.begin..new_begin {
            let idx = segment as usize;
            if let Some(slot) = segments.files.get_mut(idx) {
                slot.take();
            }
            match fs::remove_file(self.segment_path(segment)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        if tracing::enabled!(tracing::Level::DEBUG) {
            tracing::debug!(
                from = segments.begin,
                to = new_begin,
                prefix = %self.prefix,
                "removed log segments"
            );
        }
        segments.begin = new_begin;
        Ok(())
    }
}

/// File system disk device
///
/// Either a single file or a segmented file, picked from configuration.
pub struct FileSystemDisk {
    inner: FileSystemDiskInner,
}

enum FileSystemDiskInner {
    SingleFile(FileSystemFile),
    Segmented(SegmentedFile),
}

impl FileSystemDisk {
    /// Create a single-file disk
    pub fn single_file(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = FileSystemFile::open(path, true)?;
        Ok(Self {
            inner: FileSystemDiskInner::SingleFile(file),
        })
    }

    /// Create a segmented disk
    pub fn segmented(
        base_dir: impl AsRef<Path>,
        prefix: &str,
        segment_size: u64,
    ) -> io::Result<Self> {
        let segments = SegmentedFile::new(base_dir, prefix, segment_size)?;
        Ok(Self {
            inner: FileSystemDiskInner::Segmented(segments),
        })
    }
}

impl SyncStorageDevice for FileSystemDisk {
    fn read_sync(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        match &self.inner {
            FileSystemDiskInner::SingleFile(f) => f.read_sync(offset, buf),
            FileSystemDiskInner::Segmented(s) => s.read_sync(offset, buf),
        }
    }

    fn write_sync(&self, offset: u64, buf: &[u8]) -> io::Result<usize> {
        match &self.inner {
            FileSystemDiskInner::SingleFile(f) => f.write_sync(offset, buf),
            FileSystemDiskInner::Segmented(s) => s.write_sync(offset, buf),
        }
    }

    fn flush_sync(&self) -> io::Result<()> {
        match &self.inner {
            FileSystemDiskInner::SingleFile(f) => f.flush_sync(),
            FileSystemDiskInner::Segmented(s) => s.flush_sync(),
        }
    }

    fn truncate_sync(&self, size: u64) -> io::Result<()> {
        match &self.inner {
            FileSystemDiskInner::SingleFile(f) => f.truncate_sync(size),
            FileSystemDiskInner::Segmented(s) => s.truncate_sync(size),
        }
    }

    fn size_sync(&self) -> io::Result<u64> {
        match &self.inner {
            FileSystemDiskInner::SingleFile(f) => f.size_sync(),
            FileSystemDiskInner::Segmented(s) => s.size_sync(),
        }
    }

    fn remove_until_sync(&self, offset: u64) -> io::Result<()> {
        match &self.inner {
            FileSystemDiskInner::SingleFile(_) => Ok(()),
            FileSystemDiskInner::Segmented(s) => s.remove_until_sync(offset),
        }
    }
}
