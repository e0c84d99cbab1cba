//! Client requests and completion tickets
//!
//! A [`Request`] describes one file-level read or write. Before it enters
//! the pipeline it is validated and split into per-page segments:
//!
//! ```text
//! file bytes   |<--------- byte_size --------->|
//!              ^ byte_offset
//! data chunks  |   chunk 0   |   chunk 1   |   chunk 2   |
//! segments          [seg 0   ][   seg 1    ][ seg 2]
//!                    partial      full       partial
//! ```
//!
//! File chunk `n` lives on the physical page found by walking the
//! request's extent list. Completion is reported exactly once, either
//! through an [`IoTicket`] or through a callback.

use bytes::{Bytes, BytesMut};
use metaio_common::{
    ArrayId, Error, Extent, FileClass, FileDescriptor, INVALID_FD, IoDirection, IoMode, Lpn,
    MAX_ARRAY_COUNT, PageKey, Priority, Result, StorageTier,
};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

/// Request identifier, unique per process
pub type RequestId = u64;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Caller data for a request
#[derive(Debug, Clone)]
pub enum IoBuffer {
    /// Bytes to write
    Write(Bytes),
    /// Destination for read data, `byte_size` long
    Read(BytesMut),
}

impl IoBuffer {
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Write(data) => data.len(),
            Self::Read(buf) => buf.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    const fn direction(&self) -> IoDirection {
        match self {
            Self::Write(_) => IoDirection::Write,
            Self::Read(_) => IoDirection::Read,
        }
    }
}

/// The part of a request that falls on one page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageSegment {
    /// Physical page
    pub lpn: Lpn,
    /// Byte offset within the page's data chunk
    pub offset_in_page: usize,
    /// Bytes covered on this page
    pub len: usize,
    /// Byte offset within the caller's buffer
    pub buf_offset: usize,
}

impl PageSegment {
    /// Whether the segment covers less than a full data chunk
    #[must_use]
    pub const fn is_partial(&self, chunk_size: usize) -> bool {
        self.len != chunk_size
    }
}

/// Result delivered to the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoOutcome {
    pub request_id: RequestId,
    /// Bytes read, for read requests
    pub data: Option<Bytes>,
}

/// Client-visible completion result
pub type IoResult = std::result::Result<IoOutcome, Error>;

/// Callback for asynchronous submissions
pub type IoCallback = Box<dyn FnOnce(IoResult) + Send + 'static>;

/// A file-level metadata I/O
#[derive(Debug)]
pub struct Request {
    pub id: RequestId,
    pub fd: FileDescriptor,
    pub array_id: ArrayId,
    pub direction: IoDirection,
    pub byte_offset: u64,
    pub byte_size: u64,
    pub buffer: Option<IoBuffer>,
    pub tier: StorageTier,
    pub file_class: FileClass,
    pub priority: Priority,
    pub mode: IoMode,
    /// Physical page runs backing the file, in file order
    pub extents: Vec<Extent>,
    pub(crate) segments: Vec<PageSegment>,
    pub(crate) notifier: Option<Notifier>,
    /// Times the request was pushed back by a conflict or an empty pool
    pub(crate) deferrals: u64,
    pub(crate) submitted_at: Option<Instant>,
}

impl Request {
    /// Build a request from raw parts
    #[must_use]
    pub fn new(
        direction: IoDirection,
        fd: FileDescriptor,
        array_id: ArrayId,
        tier: StorageTier,
        byte_offset: u64,
        byte_size: u64,
        buffer: Option<IoBuffer>,
    ) -> Self {
        Self {
            id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            fd,
            array_id,
            direction,
            byte_offset,
            byte_size,
            buffer,
            tier,
            file_class: FileClass::default(),
            priority: Priority::default(),
            mode: IoMode::Sync,
            extents: Vec::new(),
            segments: Vec::new(),
            notifier: None,
            deferrals: 0,
            submitted_at: None,
        }
    }

    /// Read `byte_size` bytes at `byte_offset` of file `fd`
    #[must_use]
    pub fn read(
        fd: FileDescriptor,
        array_id: ArrayId,
        tier: StorageTier,
        byte_offset: u64,
        byte_size: u64,
    ) -> Self {
        let buffer = usize::try_from(byte_size)
            .ok()
            .map(|len| IoBuffer::Read(BytesMut::zeroed(len)));
        Self::new(
            IoDirection::Read,
            fd,
            array_id,
            tier,
            byte_offset,
            byte_size,
            buffer,
        )
    }

    /// Write `data` at `byte_offset` of file `fd`
    #[must_use]
    pub fn write(
        fd: FileDescriptor,
        array_id: ArrayId,
        tier: StorageTier,
        byte_offset: u64,
        data: impl Into<Bytes>,
    ) -> Self {
        let data = data.into();
        let byte_size = data.len() as u64;
        Self::new(
            IoDirection::Write,
            fd,
            array_id,
            tier,
            byte_offset,
            byte_size,
            Some(IoBuffer::Write(data)),
        )
    }

    #[must_use]
    pub fn with_extents(mut self, extents: Vec<Extent>) -> Self {
        self.extents = extents;
        self
    }

    #[must_use]
    pub const fn with_file_class(mut self, file_class: FileClass) -> Self {
        self.file_class = file_class;
        self
    }

    #[must_use]
    pub const fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Bytes the extent list can hold at `chunk_size` bytes per page
    #[must_use]
    pub fn file_capacity(&self, chunk_size: usize) -> u64 {
        self.extents.iter().map(|e| e.count).sum::<u64>() * chunk_size as u64
    }

    /// Physical page backing file chunk `file_page`
    #[must_use]
    pub fn physical_lpn(&self, file_page: u64) -> Option<Lpn> {
        let mut remaining = file_page;
        for extent in &self.extents {
            if remaining < extent.count {
                return Some(extent.start_lpn + remaining);
            }
            remaining -= extent.count;
        }
        None
    }

    /// Check the request before it touches any pipeline resource
    pub fn validate(&self, chunk_size: usize) -> Result<()> {
        if self.fd == INVALID_FD {
            return Err(Error::invalid_request("invalid file descriptor"));
        }
        if self.byte_size == 0 {
            return Err(Error::invalid_request("byte size is zero"));
        }
        let Some(buffer) = &self.buffer else {
            return Err(Error::invalid_request("missing buffer"));
        };
        if buffer.direction() != self.direction {
            return Err(Error::invalid_request(format!(
                "{} request carries a {} buffer",
                self.direction,
                buffer.direction()
            )));
        }
        if buffer.len() as u64 != self.byte_size {
            return Err(Error::invalid_request(format!(
                "buffer holds {} bytes, request says {}",
                buffer.len(),
                self.byte_size
            )));
        }
        if self.array_id >= MAX_ARRAY_COUNT {
            return Err(Error::invalid_argument(format!(
                "array id {} out of range",
                self.array_id
            )));
        }
        if self.extents.is_empty() {
            return Err(Error::invalid_request("request has no extents"));
        }
        // Two file pages on one physical page would race their merges
        let mut runs: Vec<Extent> = self.extents.clone();
        runs.sort_unstable_by_key(|e| e.start_lpn);
        if let Some(pair) = runs.windows(2).find(|w| w[0].end_lpn() > w[1].start_lpn) {
            return Err(Error::invalid_request(format!(
                "extents overlap at lpn {}",
                pair[1].start_lpn
            )));
        }
        let capacity = self.file_capacity(chunk_size);
        let end = self.byte_offset.checked_add(self.byte_size);
        if end.is_none_or(|end| end > capacity) {
            return Err(Error::OutOfRange {
                offset: self.byte_offset,
                size: self.byte_size,
                capacity,
            });
        }
        Ok(())
    }

    /// Split the byte range into page segments
    pub fn segments(&self, chunk_size: usize) -> Result<Vec<PageSegment>> {
        let chunk = chunk_size as u64;
        let end = self.byte_offset + self.byte_size;
        let mut segments = Vec::new();
        let mut pos = self.byte_offset;

        while pos < end {
            let file_page = pos / chunk;
            let offset_in_page = pos % chunk;
            let len = (chunk - offset_in_page).min(end - pos);
            let lpn = self.physical_lpn(file_page).ok_or(Error::OutOfRange {
                offset: self.byte_offset,
                size: self.byte_size,
                capacity: self.file_capacity(chunk_size),
            })?;
            segments.push(PageSegment {
                lpn,
                offset_in_page: offset_in_page as usize,
                len: len as usize,
                buf_offset: (pos - self.byte_offset) as usize,
            });
            pos += len;
        }
        Ok(segments)
    }

    /// Validate and compute segments; called once on submission
    pub(crate) fn prepare(&mut self, chunk_size: usize) -> Result<()> {
        self.validate(chunk_size)?;
        self.segments = self.segments(chunk_size)?;
        Ok(())
    }

    /// Pages touched, in file order
    pub(crate) fn pages(&self) -> impl Iterator<Item = Lpn> + '_ {
        self.segments.iter().map(|s| s.lpn)
    }

    pub(crate) fn page_segments(&self) -> &[PageSegment] {
        &self.segments
    }

    /// Whether this is a single-page partial NVRAM write the reuse cache
    /// may coalesce
    pub(crate) fn is_cacheable_write(&self, chunk_size: usize) -> bool {
        self.direction.is_write()
            && self.tier.supports_write_cache()
            && self.segments.len() == 1
            && self.segments[0].is_partial(chunk_size)
    }

    /// Cache key of the first page
    pub(crate) fn first_key(&self) -> Option<PageKey> {
        self.segments
            .first()
            .map(|s| PageKey::new(self.array_id, s.lpn))
    }

    /// Write payload for one segment
    pub(crate) fn segment_data(&self, segment: &PageSegment) -> Option<Bytes> {
        match &self.buffer {
            Some(IoBuffer::Write(data)) => {
                Some(data.slice(segment.buf_offset..segment.buf_offset + segment.len))
            }
            _ => None,
        }
    }

    /// Copy page data read for one segment into the caller's buffer
    pub(crate) fn fill_read(&mut self, buf_offset: usize, data: &[u8]) {
        if let Some(IoBuffer::Read(buf)) = &mut self.buffer {
            buf[buf_offset..buf_offset + data.len()].copy_from_slice(data);
        }
    }

    pub(crate) fn attach(&mut self, notifier: Notifier) {
        self.mode = notifier.mode();
        self.notifier = Some(notifier);
    }

    /// Report the outcome to the client; consumes the request
    pub(crate) fn finish(mut self, error: Option<Error>) {
        let result = match error {
            Some(err) => Err(err),
            None => Ok(IoOutcome {
                request_id: self.id,
                data: match self.buffer.take() {
                    Some(IoBuffer::Read(buf)) => Some(buf.freeze()),
                    _ => None,
                },
            }),
        };
        match self.notifier.take() {
            Some(notifier) => notifier.notify(result),
            None => debug!(request_id = self.id, "request finished without a listener"),
        }
    }
}

/// Where a request's outcome goes
pub(crate) enum Notifier {
    Ticket(Arc<CompletionSlot>),
    Callback(IoCallback),
}

impl Notifier {
    const fn mode(&self) -> IoMode {
        match self {
            Self::Ticket(_) => IoMode::Sync,
            Self::Callback(_) => IoMode::Async,
        }
    }

    fn notify(self, result: IoResult) {
        match self {
            Self::Ticket(slot) => slot.fill(result),
            Self::Callback(callback) => callback(result),
        }
    }
}

impl fmt::Debug for Notifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ticket(slot) => f
                .debug_struct("Ticket")
                .field("done", &slot.done.load(Ordering::Relaxed))
                .finish(),
            Self::Callback(_) => f.write_str("Callback"),
        }
    }
}

/// Rendezvous between the completion path and a waiting client
#[derive(Default)]
pub(crate) struct CompletionSlot {
    done: AtomicBool,
    result: Mutex<Option<IoResult>>,
    ready: Condvar,
}

impl CompletionSlot {
    fn fill(&self, result: IoResult) {
        let mut slot = self.result.lock();
        *slot = Some(result);
        self.done.store(true, Ordering::Release);
        self.ready.notify_all();
    }
}

/// Handle a synchronous client waits on
pub struct IoTicket {
    request_id: RequestId,
    slot: Arc<CompletionSlot>,
    spin_count: u32,
}

impl IoTicket {
    pub(crate) fn new(request_id: RequestId, spin_count: u32) -> (Self, Notifier) {
        let slot = Arc::new(CompletionSlot::default());
        let ticket = Self {
            request_id,
            slot: Arc::clone(&slot),
            spin_count,
        };
        (ticket, Notifier::Ticket(slot))
    }

    #[must_use]
    pub const fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Whether the outcome is available
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.slot.done.load(Ordering::Acquire)
    }

    /// Take the outcome without blocking
    pub fn try_result(&self) -> Option<IoResult> {
        if !self.is_done() {
            return None;
        }
        self.slot.result.lock().take()
    }

    /// Block until the request completes
    ///
    /// Spins briefly first, since most metadata I/O completes within
    /// microseconds, then parks on the condition variable.
    pub fn wait(self) -> IoResult {
        for _ in 0..self.spin_count {
            if self.is_done() {
                break;
            }
            std::hint::spin_loop();
        }
        let mut slot = self.slot.result.lock();
        loop {
            if let Some(result) = slot.take() {
                return result;
            }
            self.slot.ready.wait(&mut slot);
        }
    }

    /// Block for at most `timeout`
    pub fn wait_timeout(&self, timeout: Duration) -> Option<IoResult> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.slot.result.lock();
        loop {
            if let Some(result) = slot.take() {
                return Some(result);
            }
            if self.slot.ready.wait_until(&mut slot, deadline).timed_out() {
                return slot.take();
            }
        }
    }
}

impl fmt::Debug for IoTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoTicket")
            .field("request_id", &self.request_id)
            .field("done", &self.is_done())
            .finish()
    }
}
