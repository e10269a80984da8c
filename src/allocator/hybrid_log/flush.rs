use std::io;
use std::sync::atomic::Ordering;

use crate::address::Address;
use crate::device::{write_all, StorageDevice};
use crate::record::{encode_object_address, RecordHeader, RECORD_HEADER_SIZE};

use super::HybridLog;

impl<D: StorageDevice> HybridLog<D> {
    /// Write `[flushed_until, until)` to the main device.
    ///
    /// Failures are logged and counted; the flushed boundary only moves on success.
    pub(crate) fn flush_until(&self, until: Address) {
        let _guard = self.flush_lock.lock();
        let from = self.flushed_until_address();
        if until <= from {
            return;
        }

        match self.write_range(from, until) {
            Ok(()) => {
                self.flushed_until_address.fetch_max(until);
                if tracing::enabled!(tracing::Level::DEBUG) {
                    tracing::debug!(from = %from, until = %until, "flushed log range");
                }
            }
            Err(err) => {
                self.flush_failures.fetch_add(1, Ordering::AcqRel);
                tracing::error!(from = %from, until = %until, error = %err, "log flush failed");
            }
        }
    }

    fn write_range(&self, from: Address, until: Address) -> io::Result<()> {
        self.for_each_page_range(from, until, |start, bytes| {
            self.io_runtime
                .block_on(write_all(&*self.device, start.control(), bytes))
        })?;
        self.io_runtime.block_on(async {
            if let Some(objects) = &self.object_device {
                objects.flush().await?;
            }
            self.device.flush().await
        })
    }

    /// Copy `[from, until)` in device form to `dst`, starting at offset 0.
    ///
    /// Used by snapshot checkpoints; the range must still be resident.
    pub(crate) fn write_snapshot<S: StorageDevice + ?Sized>(
        &self,
        from: Address,
        until: Address,
        dst: &S,
    ) -> io::Result<u64> {
        let mut written = 0u64;
        self.for_each_page_range(from, until, |start, bytes| {
            let offset = start.control() - from.control();
            self.io_runtime
                .block_on(write_all(dst, offset, bytes))?;
            written += bytes.len() as u64;
            Ok(())
        })?;
        self.io_runtime.block_on(async {
            if let Some(objects) = &self.object_device {
                objects.flush().await?;
            }
            dst.flush().await
        })?;
        Ok(written)
    }

    fn for_each_page_range(
        &self,
        from: Address,
        until: Address,
        mut sink: impl FnMut(Address, &[u8]) -> io::Result<()>,
    ) -> io::Result<()> {
        let mut start = from;
        while start < until {
            let page = self.geometry.page(start);
            let end = until.min(self.geometry.page_start(page + 1));
            let bytes = self.serialize_range(start, end)?;
            sink(start, &bytes)?;
            start = end;
        }
        Ok(())
    }

    /// Device image of `[start, end)`, which must lie within one page and
    /// begin at a record boundary.
    ///
    /// Lock bits are cleared. With an object log, each record's key and value
    /// move to the object device and the record keeps only their offset.
    fn serialize_range(&self, start: Address, end: Address) -> io::Result<Vec<u8>> {
        let len = (end.control() - start.control()) as usize;
        let mut buf = vec![0u8; len];
        let frame = self.arena.frame(self.geometry.page(start));
        frame
            .read_bytes(self.geometry.offset(start) as usize, &mut buf)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "flush range outside page"))?;

        let mut pos = 0;
        while pos + RECORD_HEADER_SIZE <= buf.len() {
            let Some(header) = RecordHeader::decode(&buf[pos..]) else {
                break;
            };
            if header.info.is_null() {
                // Rest of the page was never allocated.
                break;
            }
            let size = header.record_size();
            if pos + size > buf.len() {
                tracing::warn!(
                    address = %(start + pos as u64),
                    size,
                    "record crosses flush boundary; copying raw bytes"
                );
                break;
            }

            let record = &mut buf[pos..pos + size];
            record[0..8].copy_from_slice(&header.info.unlocked().control().to_le_bytes());
            if let Some(objects) = &self.object_device {
                let mut payload = Vec::with_capacity(header.payload_len() as usize);
                payload.extend_from_slice(&record[header.key_range()]);
                payload.extend_from_slice(&record[header.value_range()]);
                let object_address = self
                    .object_tail
                    .fetch_add(payload.len() as u64, Ordering::AcqRel);
                self.io_runtime
                    .block_on(write_all(&**objects, object_address, &payload))?;
                record[RECORD_HEADER_SIZE..].fill(0);
                encode_object_address(record, object_address);
            }
            pos += size;
        }
        Ok(buf)
    }
}
