//! Dispatcher: the top half of the pipeline
//!
//! Each poll first resumes builds stalled on an empty pool, then takes
//! requests (readmitted ones before new ones) and runs them through
//! admission:
//!
//! ```text
//! request --conflict--> cacheable partial write, nobody waiting? --yes--> absorb into
//!    |                        |                                            owner's unit
//!    |                        no
//!    |                        v
//!    |                  park on the page (overlap checker)
//!    |
//!    +--free----> lock pages -> orchestrator -> build -> drive new units
//!                                                 |
//!                                                 +-- pool empty: stall, resume next poll
//! ```
//!
//! While any build is stalled no new request is taken, so only one
//! orchestrator at a time can be short of units.

use crate::shared::PipelineCore;
use crate::orchestrator::OrchestratorId;
use crate::request::Request;
use crate::stats::{MetricsPublisher, TelemetrySink};
use metaio_common::{Error, Lpn};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace, warn};

/// Requests admitted per poll at most
const DISPATCH_BATCH: usize = 16;

#[derive(Debug, Clone, Copy)]
struct StalledBuild {
    id: OrchestratorId,
    /// Page the build is waiting on a unit for
    lpn: Lpn,
    attempts: u64,
}

enum BuildOutcome {
    Done,
    Stalled(Lpn),
}

/// Top-half polling loop
#[derive(Debug)]
pub struct Dispatcher {
    core: Arc<PipelineCore>,
    stalled: VecDeque<StalledBuild>,
    publisher: MetricsPublisher,
}

impl Dispatcher {
    pub(crate) fn new(core: Arc<PipelineCore>, sink: Arc<dyn TelemetrySink>) -> Self {
        let interval = core.config.metric_interval();
        Self {
            core,
            stalled: VecDeque::new(),
            publisher: MetricsPublisher::new(sink, interval),
        }
    }

    /// Builds waiting for pool capacity
    #[must_use]
    pub fn stalled_count(&self) -> usize {
        self.stalled.len()
    }

    /// Run one dispatch round; returns whether anything moved
    pub fn poll(&mut self) -> bool {
        self.publish_if_due();

        let mut progressed = self.resume_stalled();
        for _ in 0..DISPATCH_BATCH {
            if !self.stalled.is_empty() || !self.core.orchestrators.lock().has_free() {
                break;
            }
            let Some(request) = self.core.next_request() else {
                break;
            };
            self.dispatch(request);
            progressed = true;
        }
        progressed
    }

    /// Publish a metric set if the interval elapsed
    pub fn publish_if_due(&mut self) {
        let now = Instant::now();
        if self.publisher.is_due(now) {
            let metrics = self.core.stats.snapshot(&self.core.gauges(self.stalled.len()));
            self.publisher.publish(now, &metrics);
        }
    }

    fn dispatch(&mut self, request: Request) {
        let chunk_size = self.core.chunk_size;
        let (array_id, tier) = (request.array_id, request.tier);

        let id = {
            let mut overlap = self.core.overlap.lock();
            if overlap.get(array_id, tier).is_none() {
                drop(overlap);
                debug!(array_id, %tier, request_id = request.id, "array went away before dispatch");
                self.core.stats.record_failure(request.direction);
                request.finish(Some(Error::ArrayNotRegistered { array_id, tier }));
                return;
            }
            let Some(checker) = overlap.get_mut(array_id, tier) else {
                return;
            };

            if let Some(lpn) = checker.conflict(&request) {
                let request = if request.is_cacheable_write(chunk_size) && checker.pending_len(lpn) == 0 {
                    match self.try_merge(request) {
                        Ok(()) => return,
                        Err(request) => request,
                    }
                } else {
                    request
                };
                if let Some(limit) = self.core.config.backpressure_retry_limit {
                    if request.deferrals >= limit {
                        drop(overlap);
                        warn!(request_id = request.id, lpn, "request deferred too often");
                        self.core.stats.record_failure(request.direction);
                        request.finish(Some(Error::RetryBudgetExceeded {
                            retries: limit,
                        }));
                        return;
                    }
                }
                debug!(array_id, lpn, request_id = request.id, "page busy, request deferred");
                checker.defer(lpn, request);
                self.core.stats.record_deferral();
                return;
            }

            let locked = checker.lock(&request);
            let inserted = self.core.orchestrators.lock().insert(request, locked.clone());
            match inserted {
                Ok(id) => id,
                Err(request) => {
                    // Slot vanished between the capacity check and now
                    for lpn in locked {
                        checker.release(lpn, request.direction.is_write());
                    }
                    drop(overlap);
                    self.core.push_readmit_front(request);
                    return;
                }
            }
        };

        trace!(?id, "orchestrator created");
        if let BuildOutcome::Stalled(lpn) = self.build(id) {
            self.stalled.push_back(StalledBuild {
                id,
                lpn,
                attempts: 1,
            });
        }
    }

    /// Coalesce a partial write into the in-flight unit owning its page
    ///
    /// Runs under the overlap lock; takes orchestrators then pool.
    fn try_merge(&self, request: Request) -> std::result::Result<(), Request> {
        let (Some(key), Some(segment)) = (request.first_key(), request.page_segments().first().copied())
        else {
            return Err(request);
        };
        let Some(data) = request.segment_data(&segment) else {
            return Err(request);
        };

        let mut orchestrators = self.core.orchestrators.lock();
        let Some(owner) = self
            .core
            .pool
            .lock()
            .try_absorb(key, segment.offset_in_page, data)
        else {
            return Err(request);
        };
        let Some(orchestrator) = orchestrators.get_mut(OrchestratorId::from_token(owner)) else {
            // Data is already in the unit; writing it again later is harmless
            warn!(%key, owner, "absorbing unit has no orchestrator");
            return Err(request);
        };
        debug!(%key, request_id = request.id, owner = orchestrator.request().id, "partial write coalesced");
        orchestrator.merge(request);
        self.core.stats.record_merge();
        self.core.stats.record_cache_hits(1);
        Ok(())
    }

    fn build(&self, id: OrchestratorId) -> BuildOutcome {
        let (progress, finished) = {
            let mut orchestrators = self.core.orchestrators.lock();
            let Some(orchestrator) = orchestrators.get_mut(id) else {
                return BuildOutcome::Done;
            };
            let progress = {
                let mut pool = self.core.pool.lock();
                orchestrator.build(&mut pool, self.core.chunk_size)
            };
            let finished = if orchestrator.is_finished() {
                orchestrators.remove(id)
            } else {
                None
            };
            (progress, finished)
        };

        self.core.stats.record_cache_hits(progress.cache_hits);
        for handle in &progress.new_units {
            self.core.drive_unit(*handle);
        }
        if let Some(orchestrator) = finished {
            self.core.complete_orchestrator(orchestrator);
        }

        match progress.stalled_on {
            Some(lpn) => {
                trace!(?id, lpn, "build stalled on empty pool");
                self.core.stats.record_stall();
                BuildOutcome::Stalled(lpn)
            }
            None => BuildOutcome::Done,
        }
    }

    /// Retry stalled builds in order; stops at the first that stalls again
    fn resume_stalled(&mut self) -> bool {
        let mut progressed = false;
        while let Some(mut stalled) = self.stalled.pop_front() {
            let BuildOutcome::Stalled(lpn) = self.build(stalled.id) else {
                progressed = true;
                continue;
            };
            if lpn != stalled.lpn {
                // Earlier pages got their units
                progressed = true;
            }
            stalled.lpn = lpn;
            stalled.attempts += 1;
            if let Some(limit) = self.core.config.backpressure_retry_limit {
                if stalled.attempts > limit {
                    warn!(id = ?stalled.id, lpn, attempts = stalled.attempts, "no page unit within retry budget");
                    self.abort(stalled.id, Error::RetryBudgetExceeded { retries: limit });
                    progressed = true;
                    continue;
                }
            }
            self.stalled.push_front(stalled);
            break;
        }
        progressed
    }

    fn abort(&self, id: OrchestratorId, error: Error) {
        let finished = {
            let mut orchestrators = self.core.orchestrators.lock();
            let Some(orchestrator) = orchestrators.get_mut(id) else {
                return;
            };
            warn!(?id, request_id = orchestrator.request().id, %error, "aborting build");
            orchestrator.abort(error);
            if orchestrator.is_finished() {
                orchestrators.remove(id)
            } else {
                None
            }
        };
        if let Some(orchestrator) = finished {
            self.core.complete_orchestrator(orchestrator);
        }
    }

    /// Give up on every stalled build
    pub(crate) fn abort_stalled(&mut self, error: &Error) -> usize {
        let stalled: Vec<_> = self.stalled.drain(..).collect();
        for build in &stalled {
            self.abort(build.id, error.clone());
        }
        stalled.len()
    }
}
