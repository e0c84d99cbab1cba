//! Page storage interface
//!
//! The pipeline never touches media itself. It hands one page I/O at a time
//! to a [`PageStorage`] together with a completion callback; the storage
//! layer invokes the callback exactly once, from whatever thread it likes.
//!
//! [`MemoryStorage`] is a RAM-backed implementation used by tests and the
//! bench tool. It can complete I/O inline or hold completions until
//! [`MemoryStorage::complete_pending`] is called, and it can inject busy
//! rejections, media errors and corrupted pages.

use bytes::Bytes;
use metaio_common::{ArrayId, IoDirection, Lpn, StorageTier};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use thiserror::Error;
use tracing::{debug, trace};

/// One page I/O handed to the storage layer
#[derive(Debug, Clone)]
pub struct PageIo {
    pub direction: IoDirection,
    pub array_id: ArrayId,
    pub tier: StorageTier,
    pub lpn: Lpn,
    /// Full page image for writes, `None` for reads
    pub data: Option<Bytes>,
}

/// Result delivered to a completion callback: the page image for reads
pub type PageIoResult = std::result::Result<Option<Bytes>, StorageError>;

/// Completion callback, invoked exactly once per accepted submission
pub type PageIoCallback = Box<dyn FnOnce(PageIoResult) + Send + 'static>;

/// Errors reported by the storage layer
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("storage submission queue is full")]
    Busy,

    #[error("storage is stopped")]
    Stopped,

    #[error("media error (code {code})")]
    Media { code: i32 },

    #[error("lpn {lpn} is outside the {tier} region of array {array_id}")]
    OutOfRange {
        array_id: ArrayId,
        tier: StorageTier,
        lpn: Lpn,
    },
}

impl StorageError {
    /// Check if the submission may succeed when retried
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Busy)
    }

    /// Numeric code reported to clients
    #[must_use]
    pub const fn code(&self) -> i32 {
        match self {
            Self::Busy => -16,
            Self::Stopped => -108,
            Self::Media { code } => *code,
            Self::OutOfRange { .. } => -34,
        }
    }
}

/// Page-granular storage consumed by the pipeline
pub trait PageStorage: Send + Sync {
    /// Submit one page I/O
    ///
    /// `Ok` means `done` will be invoked exactly once, possibly before this
    /// call returns. `Err` means the submission was refused and `done` was
    /// dropped without being called.
    fn submit(&self, io: PageIo, done: PageIoCallback) -> Result<(), StorageError>;
}

/// When [`MemoryStorage`] runs accepted I/O
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionMode {
    /// Execute and call back inside `submit`
    Inline,
    /// Queue until `complete_pending` is called
    Deferred,
}

type PageAddr = (ArrayId, StorageTier, Lpn);

/// RAM-backed page storage
pub struct MemoryStorage {
    page_size: usize,
    mode: CompletionMode,
    pages: RwLock<HashMap<PageAddr, Bytes>>,
    pending: Mutex<VecDeque<(PageIo, PageIoCallback)>>,
    /// Region sizes; unlisted regions accept any lpn
    regions: RwLock<HashMap<(ArrayId, StorageTier), Lpn>>,
    busy_rejections: AtomicU32,
    media_errors: Mutex<HashSet<(IoDirection, Lpn)>>,
    stopped: AtomicBool,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl MemoryStorage {
    /// Storage that completes every I/O inside `submit`
    #[must_use]
    pub fn new(page_size: usize) -> Self {
        Self::with_mode(page_size, CompletionMode::Inline)
    }

    #[must_use]
    pub fn with_mode(page_size: usize, mode: CompletionMode) -> Self {
        Self {
            page_size,
            mode,
            pages: RwLock::new(HashMap::new()),
            pending: Mutex::new(VecDeque::new()),
            regions: RwLock::new(HashMap::new()),
            busy_rejections: AtomicU32::new(0),
            media_errors: Mutex::new(HashSet::new()),
            stopped: AtomicBool::new(false),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// Bound a region to `max_lpn` pages
    pub fn add_region(&self, array_id: ArrayId, tier: StorageTier, max_lpn: Lpn) {
        self.regions.write().insert((array_id, tier), max_lpn);
    }

    /// Run every queued I/O and invoke its callback, oldest first
    ///
    /// Returns the number of I/Os completed.
    pub fn complete_pending(&self) -> usize {
        let mut completed = 0;
        loop {
            // Pop under the lock, call back outside it
            let next = self.pending.lock().pop_front();
            let Some((io, done)) = next else {
                return completed;
            };
            done(self.execute(&io));
            completed += 1;
        }
    }

    /// Number of accepted I/Os waiting for `complete_pending`
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Refuse the next `count` submissions with `StorageError::Busy`
    pub fn inject_busy(&self, count: u32) {
        self.busy_rejections.store(count, Ordering::SeqCst);
    }

    /// Fail every `direction` I/O to `lpn` with a media error
    pub fn inject_media_error(&self, direction: IoDirection, lpn: Lpn) {
        self.media_errors.lock().insert((direction, lpn));
    }

    pub fn clear_media_errors(&self) {
        self.media_errors.lock().clear();
    }

    /// Stop or restart the device
    pub fn set_stopped(&self, stopped: bool) {
        self.stopped.store(stopped, Ordering::SeqCst);
    }

    /// Flip one byte of a stored page
    pub fn corrupt(&self, array_id: ArrayId, tier: StorageTier, lpn: Lpn, byte: usize) {
        let mut pages = self.pages.write();
        if let Some(page) = pages.get_mut(&(array_id, tier, lpn)) {
            let mut image = page.to_vec();
            image[byte] ^= 0xff;
            *page = Bytes::from(image);
        }
    }

    /// Stored image of a page, if it was ever written
    pub fn page(&self, array_id: ArrayId, tier: StorageTier, lpn: Lpn) -> Option<Bytes> {
        self.pages.read().get(&(array_id, tier, lpn)).cloned()
    }

    /// Number of page reads executed
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Number of page writes executed
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    fn execute(&self, io: &PageIo) -> PageIoResult {
        if self.media_errors.lock().contains(&(io.direction, io.lpn)) {
            debug!(lpn = io.lpn, direction = %io.direction, "injected media error");
            return Err(StorageError::Media { code: -5 });
        }
        let addr = (io.array_id, io.tier, io.lpn);
        match io.direction {
            IoDirection::Read => {
                self.reads.fetch_add(1, Ordering::Relaxed);
                let page = self
                    .pages
                    .read()
                    .get(&addr)
                    .cloned()
                    .unwrap_or_else(|| Bytes::from(vec![0u8; self.page_size]));
                Ok(Some(page))
            }
            IoDirection::Write => {
                self.writes.fetch_add(1, Ordering::Relaxed);
                let Some(data) = io.data.clone() else {
                    return Err(StorageError::Media { code: -22 });
                };
                if data.len() != self.page_size {
                    return Err(StorageError::Media { code: -22 });
                }
                self.pages.write().insert(addr, data);
                Ok(None)
            }
        }
    }
}

impl PageStorage for MemoryStorage {
    fn submit(&self, io: PageIo, done: PageIoCallback) -> Result<(), StorageError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(StorageError::Stopped);
        }
        if self
            .busy_rejections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StorageError::Busy);
        }
        if let Some(&max_lpn) = self.regions.read().get(&(io.array_id, io.tier)) {
            if io.lpn >= max_lpn {
                return Err(StorageError::OutOfRange {
                    array_id: io.array_id,
                    tier: io.tier,
                    lpn: io.lpn,
                });
            }
        }

        trace!(lpn = io.lpn, direction = %io.direction, "page io accepted");
        match self.mode {
            CompletionMode::Inline => done(self.execute(&io)),
            CompletionMode::Deferred => self.pending.lock().push_back((io, done)),
        }
        Ok(())
    }
}
