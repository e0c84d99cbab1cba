//! State shared by the dispatcher and the completion processor
//!
//! Every structure sits behind its own short-held `parking_lot` mutex.
//! When more than one is needed they are taken in this order:
//!
//! ```text
//! overlap -> orchestrators -> pool
//! ```
//!
//! The request queue, the completion queue and the readmit queue are
//! leaves: nothing else is locked while they are held. No lock is ever
//! held across a storage submission, because inline storage completes
//! inside `submit` and its callback takes the completion queue lock.

use crate::orchestrator::{OrchestratorId, OrchestratorTable, RequestOrchestrator};
use crate::overlap::OverlapCheckers;
use crate::pool::{UnitHandle, UnitPool};
use crate::request::Request;
use crate::stats::{IoStatistics, PipelineGauges};
use crate::storage::{PageIo, PageIoCallback, PageIoResult, PageStorage, StorageError};
use crate::unit::{Drive, UnitKind};
use crate::wrr::WrrQueue;
use metaio_common::{Error, FileClass, MetaIoConfig, Priority, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, error, trace, warn};

#[derive(Debug)]
pub(crate) enum EventOutcome {
    /// Storage finished the I/O
    Io(PageIoResult),
    /// Storage refused the I/O for good
    Rejected(Error),
}

/// A page unit whose I/O has come back
#[derive(Debug)]
pub(crate) struct CompletionEvent {
    pub handle: UnitHandle,
    pub priority: Priority,
    pub outcome: EventOutcome,
}

pub(crate) struct PipelineCore {
    pub config: MetaIoConfig,
    pub chunk_size: usize,
    storage: Arc<dyn PageStorage>,
    requests: Mutex<WrrQueue<FileClass, Request>>,
    completions: Mutex<WrrQueue<Priority, CompletionEvent>>,
    /// Requests handed back by the overlap checker; served before new ones
    readmits: Mutex<VecDeque<Request>>,
    pub overlap: Mutex<OverlapCheckers>,
    pub orchestrators: Mutex<OrchestratorTable>,
    pub pool: Mutex<UnitPool>,
    pub stats: IoStatistics,
    accepting: AtomicBool,
    /// Back-reference handed to storage callbacks
    me: Weak<Self>,
}

impl PipelineCore {
    pub fn new(config: MetaIoConfig, storage: Arc<dyn PageStorage>) -> Result<Arc<Self>> {
        config.validate()?;
        let requests = WrrQueue::new(&config.request_weights)?;
        let completions = WrrQueue::new(&config.completion_weights)?;
        let pool = UnitPool::new(
            config.read_pool_capacity,
            config.write_pool_capacity,
            config.write_cache_capacity,
            config.page_size,
        );
        let orchestrators = OrchestratorTable::new(config.orchestrator_pool_capacity);
        let stats = IoStatistics::new(config.sampling_skip_count);

        Ok(Arc::new_cyclic(|me| Self {
            chunk_size: config.data_chunk_size(),
            config,
            storage,
            requests: Mutex::new(requests),
            completions: Mutex::new(completions),
            readmits: Mutex::new(VecDeque::new()),
            overlap: Mutex::new(OverlapCheckers::default()),
            orchestrators: Mutex::new(orchestrators),
            pool: Mutex::new(pool),
            stats,
            accepting: AtomicBool::new(true),
            me: me.clone(),
        }))
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::Release);
    }

    pub fn enqueue_request(&self, request: Request) {
        let class = request.file_class;
        self.requests.lock().enqueue(request, class);
    }

    pub fn set_request_weights(&self, weights: &[u32]) -> Result<()> {
        self.requests.lock().set_weights(weights)
    }

    /// Next request to dispatch, readmitted ones first
    pub fn next_request(&self) -> Option<Request> {
        if let Some(request) = self.readmits.lock().pop_front() {
            return Some(request);
        }
        self.requests.lock().dequeue()
    }

    pub fn push_readmits(&self, requests: Vec<Request>) {
        if !requests.is_empty() {
            self.readmits.lock().extend(requests);
        }
    }

    pub fn push_readmit_front(&self, request: Request) {
        self.readmits.lock().push_front(request);
    }

    fn push_completion(&self, event: CompletionEvent) {
        let priority = event.priority;
        self.completions.lock().enqueue(event, priority);
    }

    pub fn next_completion(&self) -> Option<CompletionEvent> {
        self.completions.lock().dequeue()
    }

    /// Run a unit until it needs storage or completes
    pub fn drive_unit(&self, handle: UnitHandle) {
        let (drive, priority) = {
            let mut pool = self.pool.lock();
            let Some(unit) = pool.get_mut(handle) else {
                warn!(?handle, "drive for a released unit");
                return;
            };
            let priority = unit.target().map_or(Priority::Normal, |t| t.priority);
            (unit.drive(), priority)
        };
        self.after_drive(handle, priority, drive);
    }

    fn after_drive(&self, handle: UnitHandle, priority: Priority, drive: Drive) {
        match drive {
            Drive::Submit(io) => self.submit_page_io(handle, priority, io),
            Drive::Pending => {}
            Drive::Complete => self.finish_unit(handle),
        }
    }

    /// Hand one page I/O to storage, retrying busy rejections
    fn submit_page_io(&self, handle: UnitHandle, priority: Priority, io: PageIo) {
        let direction = io.direction;
        let lpn = io.lpn;
        let mut retries = 0;

        loop {
            let core = self.me.clone();
            let done: PageIoCallback = Box::new(move |result| {
                if let Some(core) = core.upgrade() {
                    core.push_completion(CompletionEvent {
                        handle,
                        priority,
                        outcome: EventOutcome::Io(result),
                    });
                }
            });

            let err = match self.storage.submit(io.clone(), done) {
                Ok(()) => {
                    self.stats.record_page_io(direction);
                    trace!(lpn, %direction, "page io submitted");
                    return;
                }
                Err(err) => err,
            };

            if err.is_transient() && retries < self.config.max_submit_retries {
                retries += 1;
                self.stats.record_submit_retry();
                debug!(lpn, %direction, retries, "storage busy, retrying submission");
                std::hint::spin_loop();
                continue;
            }

            error!(lpn, %direction, retries, error = %err, "page io submission failed");
            let failure = match err {
                StorageError::Stopped => Error::StorageStopped,
                other => Error::SubmissionFailed {
                    direction,
                    lpn,
                    reason: other.to_string(),
                },
            };
            self.push_completion(CompletionEvent {
                handle,
                priority,
                outcome: EventOutcome::Rejected(failure),
            });
            return;
        }
    }

    /// Feed a completion back into its unit and keep it moving
    pub fn handle_completion(&self, event: CompletionEvent) {
        let drive = {
            let mut pool = self.pool.lock();
            let Some(unit) = pool.get_mut(event.handle) else {
                warn!(handle = ?event.handle, "completion for a released unit");
                return;
            };
            match event.outcome {
                EventOutcome::Io(result) => unit.on_io_done(result),
                EventOutcome::Rejected(err) => unit.on_submit_failed(err),
            }
            unit.drive()
        };
        self.after_drive(event.handle, event.priority, drive);
    }

    /// Release a completed unit and report to its orchestrator
    fn finish_unit(&self, handle: UnitHandle) {
        let (owner, failure, payload, held) = {
            let mut pool = self.pool.lock();
            let Some(unit) = pool.get(handle) else {
                return;
            };
            let report = (
                unit.owner(),
                unit.error().cloned(),
                unit.read_payload(),
                pool.held_for(handle),
            );
            pool.release(handle);
            report
        };
        if let Some(held) = held {
            self.stats.record_unit_release(held);
        }

        let Some(owner) = owner else {
            return;
        };
        let id = OrchestratorId::from_token(owner);
        let finished = {
            let mut orchestrators = self.orchestrators.lock();
            let Some(orchestrator) = orchestrators.get_mut(id) else {
                warn!(?id, "unit finished for an unknown orchestrator");
                return;
            };
            orchestrator.on_unit_done(failure, payload);
            if orchestrator.is_finished() {
                orchestrators.remove(id)
            } else {
                None
            }
        };
        if let Some(orchestrator) = finished {
            self.complete_orchestrator(orchestrator);
        }
    }

    /// Unlock the orchestrator's pages, then notify its requests
    pub fn complete_orchestrator(&self, mut orchestrator: RequestOrchestrator) {
        let pages = orchestrator.take_locked_pages();
        let request = orchestrator.request();
        let (array_id, tier, was_write) =
            (request.array_id, request.tier, request.direction.is_write());

        if !pages.is_empty() {
            let mut readmits = Vec::new();
            {
                let mut overlap = self.overlap.lock();
                if let Some(checker) = overlap.get_mut(array_id, tier) {
                    for lpn in pages {
                        readmits.extend(checker.release(lpn, was_write));
                    }
                }
            }
            if !readmits.is_empty() {
                trace!(array_id, count = readmits.len(), "requests readmitted");
            }
            self.push_readmits(readmits);
        }

        let summary = orchestrator.finish();
        debug!(
            request_id = summary.request_id,
            requests = summary.requests,
            error = ?summary.error,
            "request complete"
        );
        self.stats.record_completion(&summary);
    }

    /// Fail everything queued or parked; returns the number of requests
    pub fn fail_queued(&self, error: &Error) -> usize {
        let mut failed: Vec<Request> = self.requests.lock().drain();
        failed.extend(self.readmits.lock().drain(..));
        failed.extend(self.overlap.lock().drain_pending());
        let count = failed.len();
        for request in failed {
            request.finish(Some(error.clone()));
        }
        count
    }

    pub fn gauges(&self, stalled_builds: usize) -> PipelineGauges {
        let (free_orchestrators, active_orchestrators) = {
            let orchestrators = self.orchestrators.lock();
            (orchestrators.free_count(), orchestrators.active_count())
        };
        let parked = self.overlap.lock().pending_total();
        let readmits = self.readmits.lock().len();
        let request_queue_depth = self.requests.lock().len();
        let completion_queue_depth = self.completions.lock().len();
        let mut gauges = PipelineGauges {
            free_orchestrators,
            active_orchestrators,
            pending_requests: parked + readmits,
            stalled_builds,
            request_queue_depth,
            completion_queue_depth,
            ..PipelineGauges::default()
        };
        let pool = self.pool.lock();
        for kind in UnitKind::ALL {
            gauges.free_units[kind.index()] = pool.free_count(kind);
            gauges.used_units[kind.index()] = pool.used_count(kind);
        }
        gauges.cache_entries = pool.cached_count();
        gauges.cache_resident = pool.resident_count();
        gauges
    }

    /// Nothing queued, parked or in flight
    pub fn is_idle(&self) -> bool {
        // One lock at a time
        let queued = self.requests.lock().len() + self.readmits.lock().len();
        let completing = self.completions.lock().len();
        let parked = self.overlap.lock().pending_total();
        let active = self.orchestrators.lock().active_count();
        queued + completing + parked + active == 0
    }
}

impl std::fmt::Debug for PipelineCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineCore")
            .field("chunk_size", &self.chunk_size)
            .field("accepting", &self.is_accepting())
            .finish_non_exhaustive()
    }
}
