//! End-to-end tests driving the service over in-memory storage

use metaio_common::{Error, Extent, IoDirection, MetaIoConfig, StorageTier};
use metaio_pipeline::{
    CompletionMode, IoResult, MemoryStorage, MetaIoService, NullSink, PageStorage, RecordingSink,
    Request, TelemetrySink, UnitKind,
};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::Duration;

const PAGE: usize = 4096;
const CHUNK: usize = 4032;
const FD: u32 = 3;
/// First physical page of the test file
const FILE_LPN: u64 = 16;
const FILE_PAGES: u64 = 8;

fn file() -> Vec<Extent> {
    vec![Extent::new(FILE_LPN, FILE_PAGES)]
}

fn service_with_sink(
    config: MetaIoConfig,
    storage: &Arc<MemoryStorage>,
    sink: Arc<dyn TelemetrySink>,
) -> MetaIoService {
    let storage: Arc<dyn PageStorage> = Arc::clone(storage) as Arc<dyn PageStorage>;
    let service = MetaIoService::new(config, storage, sink).unwrap();
    for tier in StorageTier::ALL {
        service.add_array(0, tier, 255).unwrap();
    }
    service
}

fn service(config: MetaIoConfig, storage: &Arc<MemoryStorage>) -> MetaIoService {
    service_with_sink(config, storage, Arc::new(NullSink))
}

fn write(tier: StorageTier, offset: usize, data: Vec<u8>) -> Request {
    Request::write(FD, 0, tier, offset as u64, data).with_extents(file())
}

fn read(tier: StorageTier, offset: usize, len: usize) -> Request {
    Request::read(FD, 0, tier, offset as u64, len as u64).with_extents(file())
}

/// Alternate pipeline polls and deferred storage completions until both stop
fn settle(service: &MetaIoService, storage: &MemoryStorage) {
    loop {
        let polled = service.poll_until_idle();
        let completed = storage.complete_pending();
        if polled == 0 && completed == 0 {
            return;
        }
    }
}

#[test]
fn test_partial_writes_round_trip() {
    let storage = Arc::new(MemoryStorage::new(PAGE));
    let service = service(MetaIoConfig::default(), &storage);
    let mut rng = StdRng::seed_from_u64(7);

    let capacity = FILE_PAGES as usize * CHUNK;
    let mut model = vec![0u8; capacity];
    for _ in 0..40 {
        let offset = rng.gen_range(0..capacity - 1);
        let len = rng.gen_range(1..=(capacity - offset).min(3 * CHUNK));
        let mut data = vec![0u8; len];
        rng.fill(&mut data[..]);
        model[offset..offset + len].copy_from_slice(&data);
        service.execute(write(StorageTier::Ssd, offset, data)).unwrap();
    }

    let outcome = service.execute(read(StorageTier::Ssd, 0, capacity)).unwrap();
    assert_eq!(outcome.data.unwrap().as_ref(), model.as_slice());
    assert!(service.is_idle());
    assert_eq!(service.unit_usage(UnitKind::Read).1, 0);
    assert_eq!(service.unit_usage(UnitKind::Write).1, 0);
}

#[test]
fn test_read_of_unwritten_range_is_zero() {
    let storage = Arc::new(MemoryStorage::new(PAGE));
    let service = service(MetaIoConfig::default(), &storage);

    let outcome = service.execute(read(StorageTier::Ssd, 100, 2 * CHUNK)).unwrap();
    assert!(outcome.data.unwrap().iter().all(|&b| b == 0));
    assert_eq!(storage.read_count(), 3);
}

#[test]
fn test_nvram_partial_writes_coalesce() {
    let storage = Arc::new(MemoryStorage::with_mode(PAGE, CompletionMode::Deferred));
    let service = service(MetaIoConfig::default(), &storage);

    let first = service
        .submit(write(StorageTier::Nvram, 10, vec![0xaa; 100]))
        .unwrap();
    let second = service
        .submit(write(StorageTier::Nvram, 500, vec![0xbb; 50]))
        .unwrap();
    settle(&service, &storage);

    assert!(first.try_result().unwrap().is_ok());
    assert!(second.try_result().unwrap().is_ok());
    assert_eq!(storage.read_count(), 1);
    assert_eq!(storage.write_count(), 1);
    assert_eq!(service.stats().merged(), 1);
    assert_eq!(service.cached_units(), 1);

    let page = storage.page(0, StorageTier::Nvram, FILE_LPN).unwrap();
    assert!(page[10..110].iter().all(|&b| b == 0xaa));
    assert!(page[500..550].iter().all(|&b| b == 0xbb));
    assert_eq!(page[200], 0);

    // The resident image serves the next partial write without a read
    let third = service
        .submit(write(StorageTier::Nvram, 1000, vec![0xcc; 8]))
        .unwrap();
    settle(&service, &storage);
    assert!(third.try_result().unwrap().is_ok());
    assert_eq!(storage.read_count(), 1);
    assert_eq!(storage.write_count(), 2);
    assert!(service.stats().cache_hits() >= 2);

    let page = storage.page(0, StorageTier::Nvram, FILE_LPN).unwrap();
    assert!(page[10..110].iter().all(|&b| b == 0xaa));
    assert!(page[1000..1008].iter().all(|&b| b == 0xcc));
}

#[test]
fn test_full_page_write_bypasses_cache() {
    let storage = Arc::new(MemoryStorage::new(PAGE));
    let service = service(MetaIoConfig::default(), &storage);

    service
        .execute(write(StorageTier::Nvram, 0, vec![1; 64]))
        .unwrap();
    assert_eq!(service.cached_units(), 1);

    service
        .execute(write(StorageTier::Nvram, 0, vec![2; CHUNK]))
        .unwrap();
    assert_eq!(service.cached_units(), 0);

    // Fresh read after the full overwrite, then the new image is cached
    service
        .execute(write(StorageTier::Nvram, 8, vec![3; 8]))
        .unwrap();
    let outcome = service.execute(read(StorageTier::Nvram, 0, 16)).unwrap();
    assert_eq!(
        outcome.data.unwrap().as_ref(),
        &[2, 2, 2, 2, 2, 2, 2, 2, 3, 3, 3, 3, 3, 3, 3, 3]
    );
}

#[test]
fn test_exhausted_write_pool_defers_instead_of_failing() {
    let storage = Arc::new(MemoryStorage::with_mode(PAGE, CompletionMode::Deferred));
    let config = MetaIoConfig {
        write_pool_capacity: 1,
        write_cache_capacity: 1,
        ..MetaIoConfig::default()
    };
    let service = service(config, &storage);

    let first = service
        .submit(write(StorageTier::Ssd, 0, vec![1; CHUNK]))
        .unwrap();
    let second = service
        .submit(write(StorageTier::Ssd, CHUNK, vec![2; CHUNK]))
        .unwrap();
    service.poll();

    assert!(service.stats().stalls() >= 1);
    assert!(!first.is_done());
    assert!(!second.is_done());
    assert_eq!(service.unit_usage(UnitKind::Write), (0, 1));

    settle(&service, &storage);
    assert!(first.try_result().unwrap().is_ok());
    assert!(second.try_result().unwrap().is_ok());
    assert_eq!(storage.write_count(), 2);
    assert_eq!(service.unit_usage(UnitKind::Write), (1, 0));
}

fn assert_pools_whole(service: &MetaIoService) {
    let config = service.config();
    for (kind, capacity) in [
        (UnitKind::Read, config.read_pool_capacity),
        (UnitKind::Write, config.write_pool_capacity),
    ] {
        let (free, used) = service.unit_usage(kind);
        assert_eq!(free + used, capacity);
        // Only resident cache units stay allocated between requests
        assert!(used <= service.cached_units());
    }
}

#[test]
fn test_conflict_deferral_budget_fails_request() {
    let storage = Arc::new(MemoryStorage::with_mode(PAGE, CompletionMode::Deferred));
    let config = MetaIoConfig {
        backpressure_retry_limit: Some(1),
        ..MetaIoConfig::default()
    };
    let service = service(config, &storage);

    let tickets: Vec<_> = [1u8, 2, 3]
        .into_iter()
        .map(|fill| {
            service
                .submit(write(StorageTier::Ssd, 0, vec![fill; CHUNK]))
                .unwrap()
        })
        .collect();
    settle(&service, &storage);

    // The third write is deferred behind the first, then again behind the second
    assert!(tickets[0].try_result().unwrap().is_ok());
    assert!(tickets[1].try_result().unwrap().is_ok());
    assert!(matches!(
        tickets[2].try_result().unwrap(),
        Err(Error::RetryBudgetExceeded { retries: 1 })
    ));
    assert_eq!(storage.page(0, StorageTier::Ssd, FILE_LPN).unwrap()[0], 2);
    assert_pools_whole(&service);
    assert!(service.is_idle());
}

#[test]
fn test_stalled_build_budget_drains_units() {
    let storage = Arc::new(MemoryStorage::with_mode(PAGE, CompletionMode::Deferred));
    let config = MetaIoConfig {
        write_pool_capacity: 1,
        write_cache_capacity: 1,
        backpressure_retry_limit: Some(2),
        ..MetaIoConfig::default()
    };
    let service = service(config, &storage);

    let ticket = service
        .submit(write(StorageTier::Ssd, 0, vec![4; 2 * CHUNK]))
        .unwrap();
    // First page holds the only unit; the second stalls until the budget runs out
    for _ in 0..3 {
        service.poll();
    }
    assert!(service.stats().stalls() >= 1);
    assert!(!ticket.is_done());
    assert_eq!(service.unit_usage(UnitKind::Write), (0, 1));

    settle(&service, &storage);
    assert!(matches!(
        ticket.try_result().unwrap(),
        Err(Error::RetryBudgetExceeded { retries: 2 })
    ));
    assert_eq!(storage.write_count(), 1);
    assert_eq!(service.unit_usage(UnitKind::Write), (1, 0));
    assert_pools_whole(&service);
    assert!(service.is_idle());

    // Both pages were unlocked
    for offset in [10, CHUNK + 10] {
        let next = service
            .submit(write(StorageTier::Ssd, offset, vec![5; 16]))
            .unwrap();
        settle(&service, &storage);
        assert!(next.try_result().unwrap().is_ok());
    }
}

#[test]
fn test_cache_eviction_keeps_merged_hit() {
    let storage = Arc::new(MemoryStorage::new(PAGE));
    let config = MetaIoConfig {
        write_pool_capacity: 4,
        write_cache_capacity: 1,
        ..MetaIoConfig::default()
    };
    let service = service(config, &storage);

    service
        .execute(write(StorageTier::Nvram, 10, vec![0x11; 8]))
        .unwrap();
    assert_eq!(service.cached_units(), 1);

    // Page 0 hits the cache, then page 1 misses and pushes it out
    service
        .execute(write(StorageTier::Nvram, 100, vec![0x77; CHUNK]))
        .unwrap();
    assert!(service.cached_units() <= 1);

    let outcome = service
        .execute(read(StorageTier::Nvram, 0, 100 + CHUNK))
        .unwrap();
    let data = outcome.data.unwrap();
    assert!(data[10..18].iter().all(|&b| b == 0x11));
    assert!(data[100..].iter().all(|&b| b == 0x77));
    assert_pools_whole(&service);
}

#[test]
fn test_multi_page_write_with_single_unit() {
    let storage = Arc::new(MemoryStorage::new(PAGE));
    let config = MetaIoConfig {
        write_pool_capacity: 1,
        ..MetaIoConfig::default()
    };
    let service = service(config, &storage);

    service
        .execute(write(StorageTier::Ssd, 100, vec![9; 3 * CHUNK]))
        .unwrap();
    let outcome = service
        .execute(read(StorageTier::Ssd, 100, 3 * CHUNK))
        .unwrap();
    assert!(outcome.data.unwrap().iter().all(|&b| b == 9));
    assert_eq!(storage.write_count(), 4);
}

#[test]
fn test_invalid_requests_touch_nothing() {
    let storage = Arc::new(MemoryStorage::new(PAGE));
    let service = service(MetaIoConfig::default(), &storage);
    let before = (
        service.unit_usage(UnitKind::Read),
        service.unit_usage(UnitKind::Write),
    );

    let err = service.submit(read(StorageTier::Ssd, 0, 0)).unwrap_err();
    assert!(matches!(err, Error::InvalidRequest(_)));

    let missing = Request::new(IoDirection::Write, FD, 0, StorageTier::Ssd, 0, 16, None)
        .with_extents(file());
    assert!(matches!(
        service.submit(missing),
        Err(Error::InvalidRequest(_))
    ));

    let past_end = write(StorageTier::Ssd, FILE_PAGES as usize * CHUNK - 4, vec![0; 8]);
    assert!(matches!(
        service.submit(past_end),
        Err(Error::OutOfRange { .. })
    ));

    let unregistered = Request::read(FD, 5, StorageTier::Ssd, 0, 8).with_extents(file());
    assert!(matches!(
        service.submit(unregistered),
        Err(Error::ArrayNotRegistered { array_id: 5, .. })
    ));

    let beyond_array = Request::read(FD, 0, StorageTier::Ssd, 0, 8)
        .with_extents(vec![Extent::new(1000, 1)]);
    assert!(matches!(
        service.submit(beyond_array),
        Err(Error::InvalidArgument(_))
    ));

    let aliased = Request::write(FD, 0, StorageTier::Ssd, 10, vec![7; CHUNK])
        .with_extents(vec![Extent::new(FILE_LPN, 1), Extent::new(FILE_LPN, 1)]);
    assert!(matches!(
        service.submit(aliased),
        Err(Error::InvalidRequest(_))
    ));

    assert_eq!(
        before,
        (
            service.unit_usage(UnitKind::Read),
            service.unit_usage(UnitKind::Write)
        )
    );
    assert_eq!(service.stats().issued(StorageTier::Ssd, IoDirection::Read), 0);
    assert_eq!(service.stats().issued(StorageTier::Ssd, IoDirection::Write), 0);
    assert!(service.is_idle());
    assert_eq!(service.poll_until_idle(), 0);
}

#[test]
fn test_conflicting_writes_complete_in_order() {
    let storage = Arc::new(MemoryStorage::with_mode(PAGE, CompletionMode::Deferred));
    let service = service(MetaIoConfig::default(), &storage);
    let order: Arc<Mutex<Vec<(u8, bool)>>> = Arc::new(Mutex::new(Vec::new()));

    for fill in [1u8, 2, 3] {
        let order = Arc::clone(&order);
        service
            .submit_with_callback(
                write(StorageTier::Ssd, 0, vec![fill; CHUNK]),
                move |result: IoResult| order.lock().push((fill, result.is_ok())),
            )
            .unwrap();
    }
    settle(&service, &storage);

    assert_eq!(*order.lock(), vec![(1, true), (2, true), (3, true)]);
    assert_eq!(storage.page(0, StorageTier::Ssd, FILE_LPN).unwrap()[0], 3);
    assert!(service.stats().deferrals() >= 2);
    assert!(service.is_idle());
}

#[test]
fn test_readers_share_a_page() {
    let storage = Arc::new(MemoryStorage::with_mode(PAGE, CompletionMode::Deferred));
    let service = service(MetaIoConfig::default(), &storage);

    let a = service.submit(read(StorageTier::Ssd, 0, 16)).unwrap();
    let b = service.submit(read(StorageTier::Ssd, 8, 16)).unwrap();
    service.poll();
    assert_eq!(storage.pending_count(), 2);
    assert_eq!(service.stats().deferrals(), 0);

    settle(&service, &storage);
    assert!(a.try_result().unwrap().is_ok());
    assert!(b.try_result().unwrap().is_ok());
}

#[test]
fn test_corrupted_page_fails_integrity_check() {
    let storage = Arc::new(MemoryStorage::new(PAGE));
    let service = service(MetaIoConfig::default(), &storage);

    service
        .execute(write(StorageTier::Ssd, 0, vec![0x42; 100]))
        .unwrap();
    storage.corrupt(0, StorageTier::Ssd, FILE_LPN, 5);

    let err = service
        .execute(read(StorageTier::Ssd, 0, 100))
        .unwrap_err();
    assert!(matches!(
        err,
        Error::IntegrityCheckFailed { lpn: FILE_LPN, .. }
    ));

    // A partial write must not merge into a corrupt image either
    let err = service
        .execute(write(StorageTier::Ssd, 50, vec![1; 10]))
        .unwrap_err();
    assert!(matches!(err, Error::IntegrityCheckFailed { .. }));
    assert_eq!(service.stats().failed(IoDirection::Read), 1);
    assert_eq!(service.stats().failed(IoDirection::Write), 1);
}

#[test]
fn test_page_from_another_file_is_rejected() {
    let storage = Arc::new(MemoryStorage::new(PAGE));
    let service = service(MetaIoConfig::default(), &storage);

    service
        .execute(write(StorageTier::Ssd, 0, vec![7; 32]))
        .unwrap();
    let other_file = Request::read(FD + 1, 0, StorageTier::Ssd, 0, 32).with_extents(file());
    assert!(matches!(
        service.execute(other_file),
        Err(Error::IntegrityCheckFailed { .. })
    ));
}

#[test]
fn test_busy_storage_is_retried() {
    let storage = Arc::new(MemoryStorage::new(PAGE));
    let config = MetaIoConfig {
        max_submit_retries: 3,
        ..MetaIoConfig::default()
    };
    let service = service(config, &storage);

    storage.inject_busy(2);
    service
        .execute(write(StorageTier::Ssd, 0, vec![1; CHUNK]))
        .unwrap();
    assert_eq!(service.stats().submit_retries(), 2);

    // One attempt plus three retries, all refused
    storage.inject_busy(4);
    let err = service
        .execute(write(StorageTier::Ssd, 0, vec![2; CHUNK]))
        .unwrap_err();
    assert!(matches!(
        err,
        Error::SubmissionFailed {
            direction: IoDirection::Write,
            lpn: FILE_LPN,
            ..
        }
    ));

    service
        .execute(write(StorageTier::Ssd, 0, vec![3; CHUNK]))
        .unwrap();
    assert_eq!(storage.page(0, StorageTier::Ssd, FILE_LPN).unwrap()[0], 3);
}

#[test]
fn test_stopped_storage_fails_requests() {
    let storage = Arc::new(MemoryStorage::new(PAGE));
    let service = service(MetaIoConfig::default(), &storage);

    storage.set_stopped(true);
    assert_eq!(
        service.execute(read(StorageTier::Ssd, 0, 8)),
        Err(Error::StorageStopped)
    );
    storage.set_stopped(false);
    assert!(service.execute(read(StorageTier::Ssd, 0, 8)).is_ok());
}

#[test]
fn test_media_error_reaches_client() {
    let storage = Arc::new(MemoryStorage::new(PAGE));
    let service = service(MetaIoConfig::default(), &storage);
    storage.inject_media_error(IoDirection::Write, FILE_LPN + 1);

    let err = service
        .execute(write(StorageTier::Ssd, CHUNK, vec![5; CHUNK]))
        .unwrap_err();
    assert_eq!(
        err,
        Error::IoFailed {
            direction: IoDirection::Write,
            lpn: FILE_LPN + 1,
            code: -5,
        }
    );

    // Pages of a failed request are unlocked again
    storage.clear_media_errors();
    assert!(service
        .execute(write(StorageTier::Ssd, CHUNK, vec![6; CHUNK]))
        .is_ok());
    assert!(service.is_idle());
}

#[test]
fn test_failed_cached_write_leaves_cache() {
    let storage = Arc::new(MemoryStorage::new(PAGE));
    let service = service(MetaIoConfig::default(), &storage);
    storage.inject_media_error(IoDirection::Write, FILE_LPN);

    assert!(service
        .execute(write(StorageTier::Nvram, 4, vec![1; 4]))
        .is_err());
    assert_eq!(service.cached_units(), 0);
    assert_eq!(service.unit_usage(UnitKind::Write).1, 0);
}

#[test]
fn test_threaded_workers() {
    let storage = Arc::new(MemoryStorage::new(PAGE));
    let service = service(MetaIoConfig::default(), &storage);
    service.start().unwrap();
    assert!(service.is_running());
    assert!(service.start().is_err());

    std::thread::scope(|scope| {
        for worker in 0..4u64 {
            let service = &service;
            scope.spawn(move || {
                for i in 0..16u64 {
                    let lpn = 100 + worker * 16 + i;
                    let fill = lpn as u8;
                    let extents = vec![Extent::new(lpn, 1)];
                    let request = Request::write(FD, 0, StorageTier::Ssd, 0, vec![fill; 256])
                        .with_extents(extents.clone());
                    service.execute(request).unwrap();

                    let request =
                        Request::read(FD, 0, StorageTier::Ssd, 0, 256).with_extents(extents);
                    let outcome = service.execute(request).unwrap();
                    assert!(outcome.data.unwrap().iter().all(|&b| b == fill));
                }
            });
        }
    });

    assert_eq!(service.shutdown().unwrap(), 0);
    assert!(!service.is_running());
    assert_eq!(service.stats().completed(IoDirection::Write), 64);
    assert_eq!(service.stats().completed(IoDirection::Read), 64);
    assert!(matches!(
        service.submit(read(StorageTier::Ssd, 0, 8)),
        Err(Error::ShuttingDown)
    ));
}

#[test]
fn test_shutdown_fails_queued_requests() {
    let storage = Arc::new(MemoryStorage::new(PAGE));
    let service = service(MetaIoConfig::default(), &storage);

    let tickets: Vec<_> = (0..3)
        .map(|i| service.submit(read(StorageTier::Ssd, i * 8, 8)).unwrap())
        .collect();
    assert_eq!(service.shutdown().unwrap(), 3);
    for ticket in tickets {
        assert_eq!(ticket.wait(), Err(Error::ShuttingDown));
    }
    assert!(service.is_idle());
}

#[test]
fn test_remove_array() {
    let storage = Arc::new(MemoryStorage::with_mode(PAGE, CompletionMode::Deferred));
    let service = service(MetaIoConfig::default(), &storage);

    let ticket = service
        .submit(write(StorageTier::Nvram, 0, vec![1; 8]))
        .unwrap();
    service.poll();
    assert!(service.remove_array(0, StorageTier::Nvram).is_err());

    settle(&service, &storage);
    assert!(ticket.try_result().unwrap().is_ok());
    assert_eq!(service.cached_units(), 1);

    service.remove_array(0, StorageTier::Nvram).unwrap();
    assert_eq!(service.cached_units(), 0);
    assert!(matches!(
        service.submit(write(StorageTier::Nvram, 0, vec![1; 8])),
        Err(Error::ArrayNotRegistered { .. })
    ));
    assert!(service.add_array(0, StorageTier::Ssd, 10).is_err());
    assert!(service.add_array(9, StorageTier::Ssd, 10).is_err());
}

#[test]
fn test_release_all_cache() {
    let storage = Arc::new(MemoryStorage::new(PAGE));
    let service = service(MetaIoConfig::default(), &storage);

    for page in 0..4 {
        service
            .execute(write(StorageTier::Nvram, page * CHUNK + 1, vec![1; 4]))
            .unwrap();
    }
    assert_eq!(service.cached_units(), 4);
    assert_eq!(service.release_all_cache(), 4);
    assert_eq!(service.cached_units(), 0);
    assert_eq!(
        service.unit_usage(UnitKind::Write),
        (MetaIoConfig::default().write_pool_capacity, 0)
    );
}

#[test]
fn test_metrics_are_published_periodically() {
    let storage = Arc::new(MemoryStorage::new(PAGE));
    let sink = RecordingSink::new();
    let config = MetaIoConfig {
        metric_interval_ms: 10,
        ..MetaIoConfig::default()
    };
    let service = service_with_sink(config, &storage, Arc::clone(&sink) as Arc<dyn TelemetrySink>);

    service
        .execute(write(StorageTier::Ssd, 0, vec![1; 16]))
        .unwrap();
    std::thread::sleep(Duration::from_millis(20));
    service.poll();

    assert!(sink.rounds() >= 1);
    let metrics = sink.last().unwrap();
    assert_eq!(
        metrics.value("metaio_completed_total", &[("direction", "write")]),
        Some(1.0)
    );
    assert_eq!(
        metrics.value(
            "metaio_issued_total",
            &[("tier", "ssd"), ("direction", "write")]
        ),
        Some(1.0)
    );

    let rounds = sink.rounds();
    service.publish_metrics();
    assert_eq!(sink.rounds(), rounds + 1);
}

#[test]
fn test_request_weights_are_checked() {
    let storage = Arc::new(MemoryStorage::new(PAGE));
    let service = service(MetaIoConfig::default(), &storage);

    assert!(service.set_request_weights(&[1, 1, 1, 1]).is_ok());
    assert!(matches!(
        service.set_request_weights(&[1, 2]),
        Err(Error::InvalidArgument(_))
    ));

    let bad = MetaIoConfig {
        page_size: 32,
        ..MetaIoConfig::default()
    };
    let storage: Arc<dyn PageStorage> = storage;
    assert!(MetaIoService::new(bad, storage, Arc::new(NullSink)).is_err());
}
