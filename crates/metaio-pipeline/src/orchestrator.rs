//! Request orchestration
//!
//! A [`RequestOrchestrator`] carries one client request (plus any partial
//! writes merged onto it) from admission to notification:
//!
//! ```text
//! Init ---build---> Issued ---last unit done---> Complete
//!                    |  ^
//!                    +--+ pool exhausted: build stalls, resumes next poll
//! ```
//!
//! The build fans the request's page segments out into page units drawn
//! from the [`UnitPool`]. An orchestrator finishes only when its build has
//! covered every segment and every unit it owns has completed, so a
//! stalled build can never notify early.

use crate::pool::{CacheLookup, UnitHandle, UnitPool};
use crate::request::{Request, RequestId};
use crate::unit::{OwnerToken, UnitKind, UnitTarget};
use bytes::Bytes;
use metaio_common::{Error, FileClass, IoDirection, Lpn, PageKey, StorageTier};
use std::time::Instant;
use tracing::{debug, trace};

/// Generation-checked orchestrator slot reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OrchestratorId {
    index: u32,
    generation: u32,
}

impl OrchestratorId {
    /// Owner token stamped on the units this orchestrator allocates
    #[must_use]
    pub const fn token(self) -> OwnerToken {
        ((self.generation as u64) << 32) | self.index as u64
    }

    #[must_use]
    pub const fn from_token(token: OwnerToken) -> Self {
        Self {
            index: token as u32,
            generation: (token >> 32) as u32,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    Init,
    Issued,
    Complete,
}

/// What one build pass produced
#[derive(Debug, Default)]
pub struct BuildProgress {
    /// Units allocated by this pass; the caller drives them
    pub new_units: Vec<UnitHandle>,
    /// Page the build is waiting on when the pool ran dry
    pub stalled_on: Option<Lpn>,
    pub cache_hits: u32,
}

/// Outcome of a finished orchestrator, for statistics
#[derive(Debug, Clone)]
pub struct OrchestratorSummary {
    pub request_id: RequestId,
    pub direction: IoDirection,
    pub tier: StorageTier,
    pub file_class: FileClass,
    pub requests: usize,
    pub error: Option<Error>,
    pub created_at: Instant,
    pub submitted_at: Option<Instant>,
}

#[derive(Debug)]
pub struct RequestOrchestrator {
    id: OrchestratorId,
    state: OrchestratorState,
    request: Request,
    /// Partial writes coalesced onto this request's page
    merged: Vec<Request>,
    locked_pages: Vec<Lpn>,
    start_lpn: Option<Lpn>,
    cursor: usize,
    units: Vec<UnitHandle>,
    outstanding: usize,
    built: bool,
    error: Option<Error>,
    created_at: Instant,
}

impl RequestOrchestrator {
    fn new(id: OrchestratorId, request: Request, locked_pages: Vec<Lpn>) -> Self {
        Self {
            id,
            state: OrchestratorState::Init,
            request,
            merged: Vec::new(),
            locked_pages,
            start_lpn: None,
            cursor: 0,
            units: Vec::new(),
            outstanding: 0,
            built: false,
            error: None,
            created_at: Instant::now(),
        }
    }

    #[must_use]
    pub const fn id(&self) -> OrchestratorId {
        self.id
    }

    #[must_use]
    pub const fn state(&self) -> OrchestratorState {
        self.state
    }

    #[must_use]
    pub const fn request(&self) -> &Request {
        &self.request
    }

    #[must_use]
    pub const fn start_lpn(&self) -> Option<Lpn> {
        self.start_lpn
    }

    #[must_use]
    pub const fn outstanding(&self) -> usize {
        self.outstanding
    }

    #[must_use]
    pub const fn is_built(&self) -> bool {
        self.built
    }

    #[must_use]
    pub fn units(&self) -> &[UnitHandle] {
        &self.units
    }

    #[must_use]
    pub fn merged_count(&self) -> usize {
        self.merged.len()
    }

    #[must_use]
    pub const fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    /// Every unit reported and the build covered all segments
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        self.built && self.outstanding == 0
    }

    fn record_error(&mut self, error: Error) {
        self.error = Some(match self.error.take() {
            Some(existing) => existing.most_severe(error),
            None => error,
        });
    }

    /// Attach a request whose data was absorbed into one of our units
    pub(crate) fn merge(&mut self, request: Request) {
        trace!(owner = self.request.id, merged = request.id, "request merged");
        self.merged.push(request);
    }

    /// Allocate units for the remaining segments
    ///
    /// Stops at the first segment the pool cannot serve; the cursor stays
    /// there so the next pass resumes where this one stopped.
    pub(crate) fn build(&mut self, pool: &mut UnitPool, chunk_size: usize) -> BuildProgress {
        let mut progress = BuildProgress::default();

        if self.state == OrchestratorState::Init {
            let Some(first) = self.request.page_segments().first() else {
                self.abort(Error::internal("request reached the pipeline without segments"));
                return progress;
            };
            self.start_lpn = Some(first.lpn);
            self.state = OrchestratorState::Issued;
        }

        let kind = UnitKind::from(self.request.direction);
        while let Some(segment) = self.request.page_segments().get(self.cursor).copied() {
            let partial = kind == UnitKind::Write && segment.is_partial(chunk_size);
            let target = UnitTarget {
                key: PageKey::new(self.request.array_id, segment.lpn),
                tier: self.request.tier,
                fd: self.request.fd,
                priority: self.request.priority,
            };
            let Some(alloc) = pool.try_alloc(kind, target, partial, self.id.token()) else {
                progress.stalled_on = Some(segment.lpn);
                return progress;
            };
            let data = self.request.segment_data(&segment);
            let Some(unit) = pool.get_mut(alloc.handle) else {
                self.abort(Error::internal("allocated unit vanished"));
                return progress;
            };
            match (kind, data) {
                (UnitKind::Write, Some(data)) => unit.add_segment(segment.offset_in_page, data),
                (UnitKind::Read, _) => {
                    unit.set_read_target(segment.offset_in_page, segment.len, segment.buf_offset);
                }
                (UnitKind::Write, None) => {
                    self.record_error(Error::internal("write request lost its buffer"));
                }
            }
            if alloc.lookup == CacheLookup::Hit {
                progress.cache_hits += 1;
            }
            if !self.units.contains(&alloc.handle) {
                self.units.push(alloc.handle);
                self.outstanding += 1;
                progress.new_units.push(alloc.handle);
            }
            self.cursor += 1;
        }

        self.built = true;
        debug!(
            request_id = self.request.id,
            units = self.units.len(),
            start_lpn = ?self.start_lpn,
            "orchestrator built"
        );
        progress
    }

    /// Stop building and fail the request once outstanding units drain
    pub(crate) fn abort(&mut self, error: Error) {
        self.record_error(error);
        self.built = true;
        if self.state == OrchestratorState::Init {
            self.state = OrchestratorState::Issued;
        }
    }

    /// Account for one finished unit
    pub(crate) fn on_unit_done(&mut self, error: Option<Error>, payload: Option<(usize, Bytes)>) {
        self.outstanding = self.outstanding.saturating_sub(1);
        match error {
            Some(error) => self.record_error(error),
            None => {
                if let Some((buf_offset, data)) = payload {
                    self.request.fill_read(buf_offset, &data);
                }
            }
        }
        if self.is_finished() {
            self.state = OrchestratorState::Complete;
        }
    }

    /// Page locks to hand back to the overlap checker
    pub(crate) fn take_locked_pages(&mut self) -> Vec<Lpn> {
        std::mem::take(&mut self.locked_pages)
    }

    /// Notify the request and every merged request with the shared outcome
    pub(crate) fn finish(self) -> OrchestratorSummary {
        let summary = OrchestratorSummary {
            request_id: self.request.id,
            direction: self.request.direction,
            tier: self.request.tier,
            file_class: self.request.file_class,
            requests: 1 + self.merged.len(),
            error: self.error.clone(),
            created_at: self.created_at,
            submitted_at: self.request.submitted_at,
        };
        for merged in self.merged {
            merged.finish(self.error.clone());
        }
        self.request.finish(self.error);
        summary
    }
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    orchestrator: Option<RequestOrchestrator>,
}

/// Bounded table of active orchestrators
#[derive(Debug)]
pub struct OrchestratorTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl OrchestratorTable {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| Slot {
                generation: 0,
                orchestrator: None,
            })
            .collect();
        Self {
            slots,
            free: (0..capacity as u32).rev().collect(),
        }
    }

    #[must_use]
    pub fn has_free(&self) -> bool {
        !self.free.is_empty()
    }

    #[must_use]
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Start orchestrating `request`; hands the request back when full
    pub fn insert(
        &mut self,
        request: Request,
        locked_pages: Vec<Lpn>,
    ) -> std::result::Result<OrchestratorId, Request> {
        let Some(index) = self.free.pop() else {
            return Err(request);
        };
        let slot = &mut self.slots[index as usize];
        let id = OrchestratorId {
            index,
            generation: slot.generation,
        };
        slot.orchestrator = Some(RequestOrchestrator::new(id, request, locked_pages));
        Ok(id)
    }

    #[must_use]
    pub fn get(&self, id: OrchestratorId) -> Option<&RequestOrchestrator> {
        self.slots
            .get(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.orchestrator.as_ref())
    }

    pub fn get_mut(&mut self, id: OrchestratorId) -> Option<&mut RequestOrchestrator> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.orchestrator.as_mut())
    }

    pub fn remove(&mut self, id: OrchestratorId) -> Option<RequestOrchestrator> {
        let slot = self
            .slots
            .get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation)?;
        let orchestrator = slot.orchestrator.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        Some(orchestrator)
    }
}
