//! Pending-read resolution.
//!
//! A read that reaches an address below the head address becomes an
//! [`AsyncIoContext`]. The context is a small state machine driven by the
//! bytes that come back from the devices:
//!
//! ```text
//! AwaitingHeader ──► AwaitingObjectPayload ──► Resolved
//!      ▲  │                    │
//!      │  └──► KeyMismatch ◄───┘
//!      └──────────┘
//! ```
//!
//! A short buffer reissues the read with the exact size the header asks for.
//! A record for a different key (or an invalidated record) moves on to the
//! record's previous address until the chain leaves the live log. Chains only
//! point backwards and records never span pages; bytes that break either rule
//! resolve as corruption.

use std::io;
use std::mem;

use crate::address::Address;
use crate::config::ReadRetryPolicy;
use crate::device::StorageDevice;
use crate::error::{KvError, MAX_OBJECT_SIZE};
use crate::record::{decode_object_address, RecordHeader, MIN_RECORD_SIZE, RECORD_HEADER_SIZE};

/// Record found on the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DiskRecord {
    pub(crate) address: Address,
    pub(crate) header: RecordHeader,
    pub(crate) value: Vec<u8>,
}

/// Final result of a pending read.
#[derive(Debug)]
pub(crate) enum ReadOutcome {
    Found(DiskRecord),
    NotFound,
    Failed(KvError),
}

/// Where a pending read stands.
#[derive(Debug)]
pub(crate) enum ResolveState {
    /// Read `read_size` bytes of the record at `address`
    AwaitingHeader { address: Address, read_size: usize },
    /// Read `key ++ value` of the record at `address` from the object log
    AwaitingObjectPayload {
        address: Address,
        header: RecordHeader,
        object_address: u64,
        retrieved_objects: bool,
    },
    /// The record at hand belongs to another key; continue at `next`
    KeyMismatch { next: Address },
    Resolved(ReadOutcome),
}

/// Which device a read goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadTarget {
    Log,
    Objects,
}

/// One device read requested by the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DeviceRead {
    pub(crate) target: ReadTarget,
    pub(crate) offset: u64,
    pub(crate) len: usize,
}

/// State carried by a pending read from submission to completion.
#[derive(Debug)]
pub(crate) struct AsyncIoContext {
    pub(crate) request_id: u64,
    /// Encoded query key
    key: Vec<u8>,
    /// Chain entries below this address are dead
    begin: Address,
    initial_read_size: usize,
    /// Largest record the log can hold (one page)
    max_record_size: usize,
    object_log: bool,
    state: ResolveState,
    /// Payload bytes fetched from the object log for the current record
    object_buffer: Vec<u8>,
}

impl AsyncIoContext {
    pub(crate) fn new(
        request_id: u64,
        key: Vec<u8>,
        address: Address,
        begin: Address,
        initial_read_size: usize,
        max_record_size: usize,
        object_log: bool,
    ) -> Self {
        let mut ctx = Self {
            request_id,
            key,
            begin,
            initial_read_size: initial_read_size.max(RECORD_HEADER_SIZE),
            max_record_size,
            object_log,
            state: ResolveState::KeyMismatch { next: address },
            object_buffer: Vec::new(),
        };
        ctx.state = ctx.start_at(address);
        ctx
    }

    fn start_at(&self, address: Address) -> ResolveState {
        if address.is_invalid() || address < Address::FIRST_VALID || address < self.begin {
            return ResolveState::Resolved(ReadOutcome::NotFound);
        }
        ResolveState::AwaitingHeader {
            address,
            read_size: self.initial_read_size,
        }
    }

    /// Follow a key mismatch to the previous record.
    pub(crate) fn advance(&mut self) {
        if let ResolveState::KeyMismatch { next } = self.state {
            self.object_buffer.clear();
            self.state = self.start_at(next);
        }
    }

    /// Device read the current state is waiting for.
    pub(crate) fn next_read(&self) -> Option<DeviceRead> {
        match &self.state {
            ResolveState::AwaitingHeader { address, read_size } => Some(DeviceRead {
                target: ReadTarget::Log,
                offset: address.control(),
                len: *read_size,
            }),
            ResolveState::AwaitingObjectPayload {
                header,
                object_address,
                retrieved_objects: false,
                ..
            } => Some(DeviceRead {
                target: ReadTarget::Objects,
                offset: *object_address,
                len: header.payload_len() as usize,
            }),
            _ => None,
        }
    }

    /// Feed the bytes read at the current record address.
    pub(crate) fn on_record_bytes(&mut self, bytes: &[u8]) {
        let ResolveState::AwaitingHeader { address, read_size } = self.state else {
            return;
        };
        self.state = self.inspect_record(address, read_size, bytes);
    }

    fn inspect_record(&self, address: Address, read_size: usize, bytes: &[u8]) -> ResolveState {
        let Some(header) = RecordHeader::decode(bytes) else {
            return corrupt(address, "short record header");
        };
        if header.info.is_null() {
            return corrupt(address, "no record at address");
        }

        let required = if self.object_log {
            MIN_RECORD_SIZE
        } else {
            header.record_size()
        };
        if required > self.max_record_size {
            tracing::error!(address = %address, size = required, "record size exceeds a page");
            return corrupt(address, "record larger than a page");
        }
        if bytes.len() < required {
            if read_size < required {
                return ResolveState::AwaitingHeader {
                    address,
                    read_size: required,
                };
            }
            return corrupt(address, "record extends past the end of the device");
        }

        if header.info.is_invalid() {
            return follow_chain(address, &header);
        }

        if self.object_log {
            let size = header.payload_len();
            if size > MAX_OBJECT_SIZE {
                tracing::error!(address = %address, size, limit = MAX_OBJECT_SIZE, "object payload too large");
                return ResolveState::Resolved(ReadOutcome::Failed(KvError::ObjectTooLarge {
                    size,
                    limit: MAX_OBJECT_SIZE,
                }));
            }
            let Some(object_address) = decode_object_address(bytes) else {
                return corrupt(address, "missing object log address");
            };
            return ResolveState::AwaitingObjectPayload {
                address,
                header,
                object_address,
                retrieved_objects: false,
            };
        }

        if bytes[header.key_range()] == self.key[..] {
            ResolveState::Resolved(ReadOutcome::Found(DiskRecord {
                address,
                header,
                value: bytes[header.value_range()].to_vec(),
            }))
        } else {
            follow_chain(address, &header)
        }
    }

    /// Feed the object log bytes of the current record.
    ///
    /// Once the payload has been retrieved, further calls re-evaluate the
    /// stored payload and ignore `payload`.
    pub(crate) fn on_object_payload(&mut self, payload: &[u8]) {
        let ResolveState::AwaitingObjectPayload {
            address,
            header,
            object_address,
            retrieved_objects,
        } = self.state
        else {
            return;
        };
        if !retrieved_objects {
            self.object_buffer = payload.to_vec();
            self.state = ResolveState::AwaitingObjectPayload {
                address,
                header,
                object_address,
                retrieved_objects: true,
            };
        }

        let key_len = header.key_len as usize;
        let value_len = header.value_len as usize;
        if self.object_buffer.len() < key_len + value_len {
            self.state = corrupt(address, "short object log payload");
            return;
        }
        if self.object_buffer[..key_len] == self.key[..] {
            let mut payload = mem::take(&mut self.object_buffer);
            payload.truncate(key_len + value_len);
            let value = payload.split_off(key_len);
            self.state = ResolveState::Resolved(ReadOutcome::Found(DiskRecord {
                address,
                header,
                value,
            }));
        } else {
            self.object_buffer.clear();
            self.state = follow_chain(address, &header);
        }
    }

    /// Abort with a device error.
    pub(crate) fn fail(&mut self, err: KvError) {
        self.object_buffer.clear();
        self.state = ResolveState::Resolved(ReadOutcome::Failed(err));
    }

    pub(crate) fn into_outcome(self) -> ReadOutcome {
        match self.state {
            ResolveState::Resolved(outcome) => outcome,
            _ => ReadOutcome::Failed(KvError::Corruption(
                "pending read ended before resolution".into(),
            )),
        }
    }
}

/// Continue below the record at `address`, which did not match.
fn follow_chain(address: Address, header: &RecordHeader) -> ResolveState {
    let next = header.info.previous_address();
    if next >= address {
        tracing::error!(address = %address, previous = %next, "hash chain does not move backwards");
        return corrupt(address, "hash chain loop");
    }
    ResolveState::KeyMismatch { next }
}

fn corrupt(address: Address, what: &str) -> ResolveState {
    ResolveState::Resolved(ReadOutcome::Failed(KvError::Corruption(format!(
        "{what} at {address}"
    ))))
}

/// Drive `ctx` to resolution against the log and object devices.
pub(crate) async fn resolve<D>(
    mut ctx: AsyncIoContext,
    device: &D,
    objects: Option<&dyn StorageDevice>,
    policy: &ReadRetryPolicy,
) -> ReadOutcome
where
    D: StorageDevice + ?Sized,
{
    loop {
        ctx.advance();
        let Some(read) = ctx.next_read() else {
            return ctx.into_outcome();
        };
        let result = match read.target {
            ReadTarget::Log => read_with_retry(device, read, policy).await,
            ReadTarget::Objects => match objects {
                Some(objects) => read_with_retry(objects, read, policy).await,
                None => Err(KvError::Corruption(
                    "record points into an object log that is not configured".into(),
                )),
            },
        };
        match result {
            Ok(bytes) => match read.target {
                ReadTarget::Log => ctx.on_record_bytes(&bytes),
                ReadTarget::Objects => ctx.on_object_payload(&bytes),
            },
            Err(err) => ctx.fail(err),
        }
    }
}

/// Read with the configured retry policy. Short reads are returned as is.
async fn read_with_retry<D>(
    device: &D,
    read: DeviceRead,
    policy: &ReadRetryPolicy,
) -> Result<Vec<u8>, KvError>
where
    D: StorageDevice + ?Sized,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        let mut buf = vec![0u8; read.len];
        let err: io::Error = match device.read(read.offset, &mut buf).await {
            Ok(n) => {
                buf.truncate(n);
                return Ok(buf);
            }
            Err(err) => err,
        };

        tracing::warn!(
            offset = read.offset,
            len = read.len,
            attempt,
            max_attempts = attempts,
            error = %err,
            "pending read failed"
        );
        if attempt >= attempts {
            return Err(KvError::ReadFailed {
                address: read.offset,
                attempts: attempt,
                message: err.to_string(),
            });
        }
        tokio::time::sleep(policy.backoff(attempt)).await;
    }
}
