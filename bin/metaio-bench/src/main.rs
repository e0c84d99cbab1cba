//! MetaIO load generator
//!
//! Runs a random mix of metadata reads and writes against the pipeline
//! over in-memory page storage and reports throughput, latency and cache
//! behaviour.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use metaio_common::{Extent, IoDirection, MetaIoConfig, StorageTier};
use metaio_pipeline::{
    MemoryStorage, MetaIoService, NullSink, PageStorage, Request, TelemetrySink, TracingSink,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Tier {
    Ssd,
    Nvram,
    Journal,
}

impl From<Tier> for StorageTier {
    fn from(tier: Tier) -> Self {
        match tier {
            Tier::Ssd => Self::Ssd,
            Tier::Nvram => Self::Nvram,
            Tier::Journal => Self::JournalSsd,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "metaio-bench")]
#[command(about = "Synthetic load for the MetaIO pipeline")]
#[command(version)]
struct Args {
    /// Pipeline configuration (JSON); defaults apply to missing fields
    #[arg(short, long)]
    config: Option<String>,

    /// Storage tier to exercise
    #[arg(long, value_enum, default_value = "nvram")]
    tier: Tier,

    /// Concurrent client threads
    #[arg(long, default_value = "4")]
    clients: usize,

    /// Requests issued by each client
    #[arg(long, default_value = "10000")]
    requests: u64,

    /// Share of reads, in percent
    #[arg(long, default_value = "50")]
    read_percent: u8,

    /// Number of metadata files
    #[arg(long, default_value = "16")]
    files: u64,

    /// Pages per file
    #[arg(long, default_value = "64")]
    file_pages: u64,

    /// Largest request in bytes
    #[arg(long, default_value = "512")]
    max_io_size: usize,

    /// RNG seed
    #[arg(long, default_value = "1")]
    seed: u64,

    /// Log periodic metric sets
    #[arg(long)]
    log_metrics: bool,

    /// Print the final report as JSON
    #[arg(long)]
    json: bool,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Debug, Default)]
struct ClientReport {
    completed: u64,
    failed: u64,
    latency: Vec<Duration>,
}

fn load_config(path: Option<&str>) -> Result<MetaIoConfig> {
    let Some(path) = path else {
        return Ok(MetaIoConfig::default());
    };
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
    let config: MetaIoConfig =
        serde_json::from_str(&raw).with_context(|| format!("parsing {path}"))?;
    config.validate()?;
    Ok(config)
}

fn run_client(
    service: &MetaIoService,
    args: &Args,
    tier: StorageTier,
    file_capacity: u64,
    seed: u64,
) -> ClientReport {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut report = ClientReport::default();
    let max_size = (args.max_io_size as u64).clamp(1, file_capacity);

    for _ in 0..args.requests {
        let file = rng.gen_range(0..args.files);
        let extents = vec![Extent::new(file * args.file_pages, args.file_pages)];
        let size = rng.gen_range(1..=max_size);
        let offset = rng.gen_range(0..=file_capacity - size);
        // One descriptor per file so page checks pass
        let fd = u32::try_from(file).unwrap_or(u32::MAX - 1);

        let request = if rng.gen_range(0..100u8) < args.read_percent {
            Request::read(fd, 0, tier, offset, size)
        } else {
            let mut data = vec![0u8; size as usize];
            rng.fill(&mut data[..]);
            Request::write(fd, 0, tier, offset, data)
        };
        let request = request.with_extents(extents);

        let start = Instant::now();
        match service.execute(request) {
            Ok(_) => report.completed += 1,
            Err(err) => {
                warn!(error = %err, "request failed");
                report.failed += 1;
            }
        }
        report.latency.push(start.elapsed());
    }
    report
}

fn percentile(sorted: &[Duration], q: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let rank = ((sorted.len() - 1) as f64 * q).round() as usize;
    sorted[rank]
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if args.files == 0 || args.file_pages == 0 || args.clients == 0 {
        anyhow::bail!("files, file pages and clients must be positive");
    }

    let config = load_config(args.config.as_deref())?;
    let tier = StorageTier::from(args.tier);
    let file_capacity = args.file_pages * config.data_chunk_size() as u64;
    let max_lpn = args.files * args.file_pages - 1;

    let storage = Arc::new(MemoryStorage::new(config.page_size));
    storage.add_region(0, tier, max_lpn + 1);
    let sink: Arc<dyn TelemetrySink> = if args.log_metrics {
        Arc::new(TracingSink)
    } else {
        Arc::new(NullSink)
    };
    let storage_handle: Arc<dyn PageStorage> = Arc::clone(&storage) as Arc<dyn PageStorage>;
    let service = MetaIoService::new(config, storage_handle, sink)?;
    service.add_array(0, tier, max_lpn)?;
    service.start()?;

    info!(
        clients = args.clients,
        requests = args.requests,
        %tier,
        read_percent = args.read_percent,
        "starting load"
    );
    let started = Instant::now();
    let reports: Vec<ClientReport> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..args.clients as u64)
            .map(|client| {
                let (service, args) = (&service, &args);
                scope.spawn(move || run_client(service, args, tier, file_capacity, args.seed + client))
            })
            .collect();
        handles
            .into_iter()
            .filter_map(|handle| handle.join().ok())
            .collect()
    });
    let elapsed = started.elapsed();
    service.shutdown()?;

    let completed: u64 = reports.iter().map(|r| r.completed).sum();
    let failed: u64 = reports.iter().map(|r| r.failed).sum();
    let mut latency: Vec<Duration> = reports.into_iter().flat_map(|r| r.latency).collect();
    latency.sort_unstable();
    let iops = completed as f64 / elapsed.as_secs_f64().max(f64::EPSILON);
    let stats = service.stats();

    if args.json {
        let report = serde_json::json!({
            "elapsed_ms": elapsed.as_millis() as u64,
            "completed": completed,
            "failed": failed,
            "iops": iops,
            "latency_us": {
                "p50": percentile(&latency, 0.5).as_micros() as u64,
                "p99": percentile(&latency, 0.99).as_micros() as u64,
                "max": latency.last().map_or(0, |d| d.as_micros() as u64),
            },
            "page_reads": storage.read_count(),
            "page_writes": storage.write_count(),
            "deferrals": stats.deferrals(),
            "merged": stats.merged(),
            "cache_hits": stats.cache_hits(),
            "build_stalls": stats.stalls(),
            "submit_retries": stats.submit_retries(),
            "completed_reads": stats.completed(IoDirection::Read),
            "completed_writes": stats.completed(IoDirection::Write),
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("elapsed:        {:.3}s", elapsed.as_secs_f64());
        println!("completed:      {completed} ({failed} failed)");
        println!("iops:           {iops:.0}");
        println!(
            "latency:        p50 {:?}  p99 {:?}",
            percentile(&latency, 0.5),
            percentile(&latency, 0.99)
        );
        println!(
            "page io:        {} reads, {} writes",
            storage.read_count(),
            storage.write_count()
        );
        println!(
            "pipeline:       {} deferrals, {} merged, {} cache hits, {} stalls",
            stats.deferrals(),
            stats.merged(),
            stats.cache_hits(),
            stats.stalls()
        );
    }

    if failed > 0 {
        anyhow::bail!("{failed} requests failed");
    }
    Ok(())
}
