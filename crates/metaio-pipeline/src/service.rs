//! Client-facing service
//!
//! [`MetaIoService`] owns the shared core and both pipeline halves. It
//! runs in one of two modes:
//!
//! - embedded: the host calls [`MetaIoService::poll`] from its own loop
//! - threaded: [`MetaIoService::start`] moves the halves onto two named
//!   OS threads (`metaio-dispatch`, `metaio-complete`) that poll until
//!   [`MetaIoService::shutdown`]
//!
//! Requests are validated here, before they reach any queue or pool.

use crate::completion::CompletionProcessor;
use crate::shared::PipelineCore;
use crate::dispatcher::Dispatcher;
use crate::request::{IoCallback, IoResult, IoTicket, Notifier, Request, RequestId};
use crate::stats::{IoStatistics, MetricSet, TelemetrySink};
use crate::storage::PageStorage;
use crate::unit::UnitKind;
use metaio_common::{ArrayId, Error, Lpn, MAX_ARRAY_COUNT, MetaIoConfig, Result, StorageTier};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Sleep taken by a worker after `idle_spin_count` empty polls
const IDLE_PARK: Duration = Duration::from_micros(50);

struct Workers {
    dispatch: JoinHandle<Option<Dispatcher>>,
    complete: JoinHandle<Option<CompletionProcessor>>,
}

/// Metadata page I/O service
pub struct MetaIoService {
    core: Arc<PipelineCore>,
    sink: Arc<dyn TelemetrySink>,
    /// Present while nobody else runs the halves
    halves: Mutex<Option<(Dispatcher, CompletionProcessor)>>,
    workers: Mutex<Option<Workers>>,
    running: Arc<AtomicBool>,
}

impl MetaIoService {
    /// Build a service over `storage`, publishing metrics to `sink`
    pub fn new(
        config: MetaIoConfig,
        storage: Arc<dyn PageStorage>,
        sink: Arc<dyn TelemetrySink>,
    ) -> Result<Self> {
        let core = PipelineCore::new(config, storage)?;
        let dispatcher = Dispatcher::new(Arc::clone(&core), Arc::clone(&sink));
        let completion = CompletionProcessor::new(Arc::clone(&core));
        info!(
            page_size = core.config.page_size,
            read_units = core.config.read_pool_capacity,
            write_units = core.config.write_pool_capacity,
            cache_units = core.config.write_cache_capacity,
            "metaio service created"
        );
        Ok(Self {
            core,
            sink,
            halves: Mutex::new(Some((dispatcher, completion))),
            workers: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    #[must_use]
    pub fn config(&self) -> &MetaIoConfig {
        &self.core.config
    }

    /// Bytes of file data one page holds
    #[must_use]
    pub fn chunk_size(&self) -> usize {
        self.core.chunk_size
    }

    /// Register pages `0..=max_lpn` of one array tier
    pub fn add_array(&self, array_id: ArrayId, tier: StorageTier, max_lpn: Lpn) -> Result<()> {
        if array_id >= MAX_ARRAY_COUNT {
            return Err(Error::invalid_argument(format!(
                "array id {array_id} out of range"
            )));
        }
        if !self.core.overlap.lock().add(array_id, tier, max_lpn) {
            return Err(Error::invalid_argument(format!(
                "array {array_id} {tier} already registered"
            )));
        }
        info!(array_id, %tier, max_lpn, "array registered");
        Ok(())
    }

    /// Unregister an array tier; refused while it has I/O outstanding
    pub fn remove_array(&self, array_id: ArrayId, tier: StorageTier) -> Result<()> {
        {
            let mut overlap = self.core.overlap.lock();
            let Some(checker) = overlap.get(array_id, tier) else {
                return Err(Error::ArrayNotRegistered { array_id, tier });
            };
            if !checker.is_idle() {
                return Err(Error::invalid_request(format!(
                    "array {array_id} {tier} has outstanding I/O"
                )));
            }
            overlap.remove(array_id, tier);
        }
        if tier.supports_write_cache() {
            let freed = self.core.pool.lock().release_array_cache(array_id);
            debug!(array_id, freed, "cached units released");
        }
        info!(array_id, %tier, "array removed");
        Ok(())
    }

    /// Queue a request; the ticket reports its outcome
    pub fn submit(&self, request: Request) -> Result<IoTicket> {
        let (ticket, notifier) = IoTicket::new(request.id, self.core.config.sync_spin_count);
        self.enqueue(request, notifier)?;
        Ok(ticket)
    }

    /// Queue a request; `callback` runs once on the completion path
    pub fn submit_with_callback(
        &self,
        request: Request,
        callback: impl FnOnce(IoResult) + Send + 'static,
    ) -> Result<RequestId> {
        let id = request.id;
        let callback: IoCallback = Box::new(callback);
        self.enqueue(request, Notifier::Callback(callback))?;
        Ok(id)
    }

    fn enqueue(&self, mut request: Request, notifier: Notifier) -> Result<()> {
        if !self.core.is_accepting() {
            return Err(Error::ShuttingDown);
        }
        request.prepare(self.core.chunk_size)?;
        {
            let overlap = self.core.overlap.lock();
            let Some(checker) = overlap.get(request.array_id, request.tier) else {
                return Err(Error::ArrayNotRegistered {
                    array_id: request.array_id,
                    tier: request.tier,
                });
            };
            if !checker.covers(&request) {
                return Err(Error::invalid_argument(format!(
                    "request maps beyond lpn {} of array {} {}",
                    checker.max_lpn(),
                    request.array_id,
                    request.tier
                )));
            }
        }

        request.attach(notifier);
        request.submitted_at = Some(Instant::now());
        self.core
            .stats
            .record_issue(request.tier, request.file_class, request.direction);
        debug!(
            request_id = request.id,
            direction = %request.direction,
            array_id = request.array_id,
            offset = request.byte_offset,
            size = request.byte_size,
            "request queued"
        );
        self.core.enqueue_request(request);
        Ok(())
    }

    /// Wait for a ticket
    ///
    /// In embedded mode this polls the pipeline on the calling thread, so
    /// storage must complete I/O on its own.
    pub fn wait(&self, ticket: IoTicket) -> IoResult {
        if self.is_running() {
            return ticket.wait();
        }
        loop {
            if let Some(result) = ticket.try_result() {
                return result;
            }
            if !self.poll() {
                thread::yield_now();
            }
        }
    }

    /// Submit and wait
    pub fn execute(&self, request: Request) -> IoResult {
        let ticket = self.submit(request)?;
        self.wait(ticket)
    }

    /// Run one round of each half on the caller's thread
    ///
    /// Returns `false` when nothing moved, or when worker threads own the
    /// halves.
    pub fn poll(&self) -> bool {
        let mut halves = self.halves.lock();
        let Some((dispatcher, completion)) = halves.as_mut() else {
            return false;
        };
        let dispatched = dispatcher.poll();
        let completed = completion.poll();
        dispatched || completed
    }

    /// Poll until a round makes no progress; returns the rounds run
    pub fn poll_until_idle(&self) -> usize {
        let mut rounds = 0;
        while self.poll() {
            rounds += 1;
        }
        rounds
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Nothing queued, parked or in flight
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.core.is_idle()
    }

    /// Move both halves onto their worker threads
    pub fn start(&self) -> Result<()> {
        let mut halves = self.halves.lock();
        let Some((dispatcher, completion)) = halves.take() else {
            return Err(Error::invalid_request("service already started"));
        };
        let idle_spins = self.core.config.idle_spin_count;
        self.running.store(true, Ordering::Release);

        let dispatch = match spawn_worker(
            "metaio-dispatch",
            Arc::clone(&self.running),
            idle_spins,
            dispatcher,
            Dispatcher::poll,
        ) {
            Ok(handle) => handle,
            Err((dispatcher, err)) => {
                self.running.store(false, Ordering::Release);
                *halves = dispatcher.map(|d| (d, completion));
                return Err(err);
            }
        };
        let complete = match spawn_worker(
            "metaio-complete",
            Arc::clone(&self.running),
            idle_spins,
            completion,
            CompletionProcessor::poll,
        ) {
            Ok(handle) => handle,
            Err((completion, err)) => {
                self.running.store(false, Ordering::Release);
                let dispatcher = join_worker(dispatch, "metaio-dispatch")?;
                *halves = completion.map(|c| (dispatcher, c));
                return Err(err);
            }
        };

        *self.workers.lock() = Some(Workers { dispatch, complete });
        info!("metaio workers started");
        Ok(())
    }

    /// Stop the workers and fail everything not yet dispatched
    ///
    /// Returns the number of requests failed with `ShuttingDown`.
    pub fn shutdown(&self) -> Result<usize> {
        self.core.stop_accepting();
        self.running.store(false, Ordering::Release);

        if let Some(workers) = self.workers.lock().take() {
            let dispatcher = join_worker(workers.dispatch, "metaio-dispatch")?;
            let completion = join_worker(workers.complete, "metaio-complete")?;
            *self.halves.lock() = Some((dispatcher, completion));
        }

        let mut failed = 0;
        if let Some((dispatcher, completion)) = self.halves.lock().as_mut() {
            // Let I/O that already came back reach its clients
            while completion.poll() {}
            failed += dispatcher.abort_stalled(&Error::ShuttingDown);
        }
        failed += self.core.fail_queued(&Error::ShuttingDown);
        info!(failed, "metaio service stopped");
        Ok(failed)
    }

    /// Return every idle cache-resident unit to the pool
    pub fn release_all_cache(&self) -> usize {
        let freed = self.core.pool.lock().release_all_cache();
        debug!(freed, "reuse cache cleared");
        freed
    }

    /// Replace the request queue weights, effective from the next cycle
    pub fn set_request_weights(&self, weights: &[u32]) -> Result<()> {
        self.core.set_request_weights(weights)
    }

    #[must_use]
    pub fn stats(&self) -> &IoStatistics {
        &self.core.stats
    }

    /// Free and used units of one kind
    #[must_use]
    pub fn unit_usage(&self, kind: UnitKind) -> (usize, usize) {
        let pool = self.core.pool.lock();
        (pool.free_count(kind), pool.used_count(kind))
    }

    /// Reuse cache entries, resident or in flight
    #[must_use]
    pub fn cached_units(&self) -> usize {
        self.core.pool.lock().cached_count()
    }

    /// Current metric set
    #[must_use]
    pub fn metrics(&self) -> MetricSet {
        self.core.stats.snapshot(&self.core.gauges(0))
    }

    /// Push the current metric set to the sink now
    pub fn publish_metrics(&self) {
        self.sink.publish(&self.metrics());
    }
}

impl Drop for MetaIoService {
    fn drop(&mut self) {
        if self.is_running() {
            if let Err(err) = self.shutdown() {
                warn!(error = %err, "metaio shutdown on drop failed");
            }
        }
    }
}

impl std::fmt::Debug for MetaIoService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaIoService")
            .field("core", &self.core)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

/// Spawn a polling loop; on failure the worker is handed back
fn spawn_worker<W: Send + 'static>(
    name: &'static str,
    running: Arc<AtomicBool>,
    idle_spins: u32,
    worker: W,
    poll: fn(&mut W) -> bool,
) -> std::result::Result<JoinHandle<Option<W>>, (Option<W>, Error)> {
    // Parked here so a failed spawn can return the worker
    let slot = Arc::new(Mutex::new(Some(worker)));
    let thread_slot = Arc::clone(&slot);

    thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let mut worker = thread_slot.lock().take()?;
            debug!(worker = name, "worker started");
            let mut idle = 0u32;
            while running.load(Ordering::Acquire) {
                if poll(&mut worker) {
                    idle = 0;
                    continue;
                }
                idle += 1;
                if idle >= idle_spins {
                    thread::sleep(IDLE_PARK);
                    idle = 0;
                } else {
                    std::hint::spin_loop();
                }
            }
            debug!(worker = name, "worker stopped");
            Some(worker)
        })
        .map_err(|err| {
            let error = Error::internal(format!("failed to spawn {name}: {err}"));
            (slot.lock().take(), error)
        })
}

fn join_worker<W>(handle: JoinHandle<Option<W>>, name: &str) -> Result<W> {
    match handle.join() {
        Ok(Some(worker)) => Ok(worker),
        Ok(None) => Err(Error::internal(format!("{name} exited without its state"))),
        Err(_) => Err(Error::internal(format!("{name} panicked"))),
    }
}
