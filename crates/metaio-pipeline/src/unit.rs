//! Page I/O unit
//!
//! A [`PageUnit`] carries one metadata page through its I/O. Write units
//! run read-modify-merge-write:
//!
//! ```text
//! Init -> Ready -+-> Read -> CheckReadStatus -> E2eCheck -+-> MergeData -> PrepareWrite
//!                |                                        |
//!                +----------------------------------------+   (full page, or page
//!                |                                                image already valid)
//!                +-> PrepareWrite                             (data already merged)
//!
//! PrepareWrite -> Write -> CheckWriteStatus -> Complete
//! ```
//!
//! Read units stop after the end-to-end check:
//! `Init -> Ready -> Read -> CheckReadStatus -> E2eCheck -> Complete`.
//! Any I/O stage can branch to `Error`, which still ends in `Complete` so
//! the unit is always released.
//!
//! The machine never blocks. [`PageUnit::drive`] runs states until the
//! unit needs storage I/O or finishes; the I/O result is fed back through
//! [`PageUnit::on_io_done`] and the unit is driven again.

use crate::page::{self, PageCheck, PageControl};
use crate::storage::{PageIo, PageIoResult};
use bytes::Bytes;
use metaio_common::{Error, FileDescriptor, IoDirection, PageKey, Priority, StorageTier};
use tracing::{debug, trace, warn};

/// Kind of page unit; each kind has its own pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnitKind {
    Read,
    Write,
}

impl UnitKind {
    pub const ALL: [Self; 2] = [Self::Read, Self::Write];

    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
        }
    }
}

impl From<IoDirection> for UnitKind {
    fn from(direction: IoDirection) -> Self {
        match direction {
            IoDirection::Read => Self::Read,
            IoDirection::Write => Self::Write,
        }
    }
}

/// Page unit state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    Init,
    Ready,
    Read,
    CheckReadStatus,
    E2eCheck,
    MergeData,
    PrepareWrite,
    Write,
    CheckWriteStatus,
    Error,
    Complete,
}

/// Reuse-cache state of a write unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    /// Not in the reuse cache
    Uncached,
    /// Fresh cache entry; the page image is unknown and must be read
    FirstRead,
    /// Page image in the buffer matches storage; new data must be merged
    Mergeable,
    /// New data is already in the buffer; only the flush remains
    Merged,
}

/// Where a unit's page lives and who asked for it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitTarget {
    pub key: PageKey,
    pub tier: StorageTier,
    pub fd: FileDescriptor,
    pub priority: Priority,
}

#[derive(Debug, Clone)]
struct MergeSegment {
    offset_in_page: usize,
    data: Bytes,
}

#[derive(Debug, Clone, Copy)]
struct ReadTarget {
    offset_in_page: usize,
    len: usize,
    buf_offset: usize,
}

/// Outcome of running one state
enum Step {
    Continue,
    Submit(PageIo),
    Wait,
    Complete,
}

/// Outcome of driving a unit as far as it can go
#[derive(Debug)]
pub enum Drive {
    /// Hand this I/O to storage and drive again on completion
    Submit(PageIo),
    /// Waiting for an I/O result
    Pending,
    /// Terminal; release the unit
    Complete,
}

/// Owner token recorded on a unit; opaque to the unit itself
pub type OwnerToken = u64;

/// One page's I/O state machine
#[derive(Debug)]
pub struct PageUnit {
    id: u64,
    kind: UnitKind,
    state: UnitState,
    cache_state: CacheState,
    target: Option<UnitTarget>,
    partial: bool,
    segments: Vec<MergeSegment>,
    read_target: Option<ReadTarget>,
    /// Page-sized merge buffer
    page: Vec<u8>,
    /// Write sequence of the image in `page`
    sequence: u64,
    owner: Option<OwnerToken>,
    io_result: Option<PageIoResult>,
    error: Option<Error>,
}

impl PageUnit {
    pub(crate) fn new(kind: UnitKind, page_size: usize) -> Self {
        Self {
            id: 0,
            kind,
            state: UnitState::Init,
            cache_state: CacheState::Uncached,
            target: None,
            partial: false,
            segments: Vec::new(),
            read_target: None,
            page: vec![0; page_size],
            sequence: 0,
            owner: None,
            io_result: None,
            error: None,
        }
    }

    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub const fn kind(&self) -> UnitKind {
        self.kind
    }

    #[must_use]
    pub const fn state(&self) -> UnitState {
        self.state
    }

    #[must_use]
    pub const fn cache_state(&self) -> CacheState {
        self.cache_state
    }

    #[must_use]
    pub const fn target(&self) -> Option<UnitTarget> {
        self.target
    }

    #[must_use]
    pub const fn owner(&self) -> Option<OwnerToken> {
        self.owner
    }

    #[must_use]
    pub const fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    #[must_use]
    pub const fn is_partial(&self) -> bool {
        self.partial
    }

    /// Whether the unit holds pooled resources but has issued no I/O
    #[must_use]
    pub const fn is_idle(&self) -> bool {
        matches!(self.state, UnitState::Init)
    }

    pub(crate) const fn is_cached(&self) -> bool {
        !matches!(self.cache_state, CacheState::Uncached)
    }

    pub(crate) const fn set_id(&mut self, id: u64) {
        self.id = id;
    }

    pub(crate) const fn set_cache_state(&mut self, cache_state: CacheState) {
        self.cache_state = cache_state;
    }

    pub(crate) const fn set_owner(&mut self, owner: OwnerToken) {
        self.owner = Some(owner);
    }

    /// Point the unit at a page; `partial` only matters for writes
    pub(crate) fn configure(&mut self, target: UnitTarget, partial: bool) {
        if self.target.is_some_and(|t| t.key != target.key) {
            // A recycled buffer holds another page's image
            self.sequence = 0;
        }
        self.target = Some(target);
        self.partial = partial;
    }

    /// Ask the unit to copy page bytes back to `buf_offset` of the caller
    pub(crate) const fn set_read_target(
        &mut self,
        offset_in_page: usize,
        len: usize,
        buf_offset: usize,
    ) {
        self.read_target = Some(ReadTarget {
            offset_in_page,
            len,
            buf_offset,
        });
    }

    /// Add caller data to be written at `offset_in_page`
    ///
    /// A resident unit whose image is already valid takes the bytes
    /// straight into its buffer and skips the merge stage.
    pub(crate) fn add_segment(&mut self, offset_in_page: usize, data: Bytes) {
        if self.cache_state == CacheState::Mergeable && self.state == UnitState::Init {
            self.copy_into_page(offset_in_page, &data);
            self.cache_state = CacheState::Merged;
            return;
        }
        if self.cache_state == CacheState::Merged
            && matches!(self.state, UnitState::Init | UnitState::Ready)
        {
            self.copy_into_page(offset_in_page, &data);
            return;
        }
        self.segments.push(MergeSegment {
            offset_in_page,
            data,
        });
    }

    /// Accept a partial write from a request merged onto this unit's owner
    ///
    /// Only possible while the unit has not merged its data yet.
    pub(crate) fn try_absorb(&mut self, offset_in_page: usize, data: Bytes) -> bool {
        if self.kind != UnitKind::Write {
            return false;
        }
        let open = match self.cache_state {
            CacheState::Uncached => false,
            CacheState::Merged => matches!(self.state, UnitState::Init | UnitState::Ready),
            CacheState::FirstRead | CacheState::Mergeable => matches!(
                self.state,
                UnitState::Init
                    | UnitState::Ready
                    | UnitState::Read
                    | UnitState::CheckReadStatus
                    | UnitState::E2eCheck
            ),
        };
        if open {
            self.add_segment(offset_in_page, data);
        }
        open
    }

    fn copy_into_page(&mut self, offset_in_page: usize, data: &[u8]) {
        self.page[offset_in_page..offset_in_page + data.len()].copy_from_slice(data);
    }

    /// Record the result of the I/O this unit is waiting on
    pub(crate) fn on_io_done(&mut self, result: PageIoResult) {
        self.io_result = Some(result);
    }

    /// Record that storage refused the I/O for good
    pub(crate) fn on_submit_failed(&mut self, error: Error) {
        self.set_error(error);
    }

    fn set_error(&mut self, error: Error) {
        self.error = Some(match self.error.take() {
            Some(existing) => existing.most_severe(error),
            None => error,
        });
        self.state = UnitState::Error;
    }

    /// Bytes read for the caller, with their destination offset
    #[must_use]
    pub(crate) fn read_payload(&self) -> Option<(usize, Bytes)> {
        if self.error.is_some() || self.state != UnitState::Complete {
            return None;
        }
        self.read_target.map(|t| {
            (
                t.buf_offset,
                Bytes::copy_from_slice(&self.page[t.offset_in_page..t.offset_in_page + t.len]),
            )
        })
    }

    /// Run states until the unit needs I/O or completes
    pub(crate) fn drive(&mut self) -> Drive {
        loop {
            match self.step() {
                Step::Continue => {}
                Step::Submit(io) => return Drive::Submit(io),
                Step::Wait => return Drive::Pending,
                Step::Complete => return Drive::Complete,
            }
        }
    }

    fn step(&mut self) -> Step {
        let Some(target) = self.target else {
            self.set_error(Error::internal("page unit driven without a target"));
            self.state = UnitState::Complete;
            return Step::Complete;
        };
        trace!(unit = self.id, lpn = target.key.lpn, state = ?self.state, "page unit step");

        match self.state {
            UnitState::Init => {
                self.state = UnitState::Ready;
                Step::Continue
            }
            UnitState::Ready => {
                self.state = self.after_ready();
                Step::Continue
            }
            UnitState::Read => {
                self.state = UnitState::CheckReadStatus;
                Step::Submit(PageIo {
                    direction: IoDirection::Read,
                    array_id: target.key.array_id,
                    tier: target.tier,
                    lpn: target.key.lpn,
                    data: None,
                })
            }
            UnitState::CheckReadStatus => match self.io_result.take() {
                None => Step::Wait,
                Some(Ok(Some(image))) if image.len() == self.page.len() => {
                    self.page.copy_from_slice(&image);
                    self.state = UnitState::E2eCheck;
                    Step::Continue
                }
                Some(Ok(_)) => {
                    self.set_error(Error::internal(format!(
                        "short page read for lpn {}",
                        target.key.lpn
                    )));
                    Step::Continue
                }
                Some(Err(err)) => {
                    self.set_error(Error::IoFailed {
                        direction: IoDirection::Read,
                        lpn: target.key.lpn,
                        code: err.code(),
                    });
                    Step::Continue
                }
            },
            UnitState::E2eCheck => {
                match page::inspect(&self.page, target.key.lpn, target.fd, target.key.array_id) {
                    PageCheck::Blank => {
                        self.page.fill(0);
                        self.sequence = 0;
                    }
                    PageCheck::Valid { sequence } => self.sequence = sequence,
                    PageCheck::Corrupt(reason) => {
                        warn!(
                            lpn = target.key.lpn,
                            array_id = target.key.array_id,
                            reason = reason.as_str(),
                            "page failed end-to-end check"
                        );
                        self.set_error(Error::IntegrityCheckFailed {
                            lpn: target.key.lpn,
                            reason,
                        });
                        return Step::Continue;
                    }
                }
                self.state = match self.kind {
                    UnitKind::Read => UnitState::Complete,
                    UnitKind::Write => UnitState::MergeData,
                };
                Step::Continue
            }
            UnitState::MergeData => {
                for segment in std::mem::take(&mut self.segments) {
                    self.copy_into_page(segment.offset_in_page, &segment.data);
                }
                if self.is_cached() {
                    self.cache_state = CacheState::Merged;
                }
                self.state = UnitState::PrepareWrite;
                Step::Continue
            }
            UnitState::PrepareWrite => {
                self.sequence += 1;
                page::stamp(
                    &mut self.page,
                    &PageControl {
                        lpn: target.key.lpn,
                        fd: target.fd,
                        array_id: target.key.array_id,
                        sequence: self.sequence,
                    },
                );
                self.state = UnitState::Write;
                Step::Continue
            }
            UnitState::Write => {
                self.state = UnitState::CheckWriteStatus;
                Step::Submit(PageIo {
                    direction: IoDirection::Write,
                    array_id: target.key.array_id,
                    tier: target.tier,
                    lpn: target.key.lpn,
                    data: Some(Bytes::copy_from_slice(&self.page)),
                })
            }
            UnitState::CheckWriteStatus => match self.io_result.take() {
                None => Step::Wait,
                Some(Ok(_)) => {
                    if self.is_cached() {
                        // Image is durable; later hits merge straight into it
                        self.cache_state = CacheState::Mergeable;
                    }
                    self.state = UnitState::Complete;
                    Step::Continue
                }
                Some(Err(err)) => {
                    self.set_error(Error::IoFailed {
                        direction: IoDirection::Write,
                        lpn: target.key.lpn,
                        code: err.code(),
                    });
                    Step::Continue
                }
            },
            UnitState::Error => {
                debug!(unit = self.id, lpn = target.key.lpn, error = ?self.error, "page unit failed");
                self.segments.clear();
                self.state = UnitState::Complete;
                Step::Continue
            }
            UnitState::Complete => Step::Complete,
        }
    }

    fn after_ready(&self) -> UnitState {
        match self.kind {
            UnitKind::Read => UnitState::Read,
            UnitKind::Write => match self.cache_state {
                CacheState::Merged => UnitState::PrepareWrite,
                CacheState::Mergeable => UnitState::MergeData,
                CacheState::FirstRead | CacheState::Uncached if self.partial => UnitState::Read,
                CacheState::FirstRead | CacheState::Uncached => UnitState::MergeData,
            },
        }
    }

    /// Clear per-I/O fields, keeping the page image for a cache hit
    pub(crate) fn reset_for_reuse(&mut self) {
        self.state = UnitState::Init;
        self.owner = None;
        self.io_result = None;
        self.error = None;
        self.segments.clear();
        self.read_target = None;
    }

    /// Clear everything before the unit goes back to the free list
    pub(crate) fn reset(&mut self) {
        self.reset_for_reuse();
        self.cache_state = CacheState::Uncached;
        self.partial = false;
        self.target = None;
        self.sequence = 0;
    }
}
