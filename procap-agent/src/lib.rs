//! Userspace ingestion pipeline for process-annotated packet capture.
//!
//! The kernel side (tc classifiers plus the `sched_process_exec` and
//! `sched_process_exit` tracepoints) writes three record streams into
//! per-CPU perf buffers. This crate drains them: one generic reader per
//! stream decodes records and pushes them onto a bounded queue, the
//! packet consumer enriches packets with device and process context and
//! writes them to the configured sinks, and the process consumer keeps the
//! pid → command line cache current.
//!
//! ```text
//!  PACKET_EVENTS ─▶ reader<PacketDecoder> ─▶ [packets] ─▶ PacketEventConsumer ─▶ sinks
//!  EXEC_EVENTS   ─▶ reader<ExecDecoder>   ─▶ [execs]  ─┐
//!  EXIT_EVENTS   ─▶ reader<ExitDecoder>   ─▶ [exits]  ─┴▶ ProcessEventConsumer ─▶ ProcessCache
//! ```
//!
//! Per-CPU order is preserved end to end; nothing is ordered across CPUs.
//! Use [`codec::sort_by_timestamp`] when temporal order matters.
//!
//! # Feature flags
//!
//! | Feature | Description |
//! |---------|-------------|
//! | `prometheus` | Prometheus metrics exporter |
//!
//! # Usage
//!
//! ```no_run
//! use procap_agent::{run_agent, AgentConfig};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = AgentConfig {
//!     bpf_object: "procap.bpf.o".into(),
//!     interfaces: vec!["eth0".into()],
//!     count: 100,
//!     ..Default::default()
//! };
//! let summary = run_agent(config).await?;
//! eprintln!("{}", summary.line());
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod consumer;
pub mod devices;
pub mod enrich;
pub mod ingest;
#[cfg(feature = "prometheus")]
pub mod metrics;
pub mod perf;
pub mod probes;
pub mod process;
pub mod reader;
pub mod source;
pub mod stats;
pub mod writer;

pub use codec::{DecodeError, EventKind, PacketEvent};
pub use consumer::{ConsumerHandle, ConsumerReport, PacketEventConsumer, RunOutcome};
pub use devices::{DeviceCache, DeviceInfo, DeviceLookup};
pub use enrich::{EnrichError, EnrichedPacket};
pub use ingest::{EventQueues, IngestConfig, Ingestion, Sources};
pub use process::{ProcessCache, ProcessEventConsumer, ProcessInfo, ProcessLookup};
pub use reader::{start_reader, ReaderSummary};
pub use source::{AttachError, ReadError};
pub use stats::{DropCounters, DropSnapshot};
pub use writer::PacketWriter;

use anyhow::{Context, Result};
use log::{info, warn};
use probes::Probes;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// AgentConfig
// ---------------------------------------------------------------------------

/// Default bytes of each packet copied by the probe.
pub const DEFAULT_SNAP_LEN: usize = 262_144;

const PROC_ROOT: &str = "/proc";
const DEVICE_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// Configuration for a capture run.
#[derive(Clone, Debug)]
pub struct AgentConfig {
    /// Compiled probe object to load.
    pub bpf_object: PathBuf,
    /// Interfaces to capture on; empty means every interface in sysfs.
    pub interfaces: Vec<String>,
    /// Stop after this many packets; 0 means run until interrupted.
    pub count: u64,
    /// Sink specs, see [`writer::SinkSpec::parse`].
    pub writers: Vec<String>,
    /// Payload bytes kept per packet, in the probe and in the decoder.
    pub snap_len: usize,
    pub ingest: IngestConfig,
    /// Wait before the packet consumer takes its first event.
    pub delay: Duration,
    pub status_interval: Option<Duration>,
    /// Upper bound for each shutdown phase.
    pub shutdown_timeout: Duration,
    pub metrics_port: u16,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            bpf_object: PathBuf::from("procap.bpf.o"),
            interfaces: Vec::new(),
            count: 0,
            writers: Vec::new(),
            snap_len: DEFAULT_SNAP_LEN,
            ingest: IngestConfig::default(),
            delay: Duration::ZERO,
            status_interval: None,
            shutdown_timeout: Duration::from_secs(2),
            metrics_port: 9184,
        }
    }
}

// ---------------------------------------------------------------------------
// Capture summary
// ---------------------------------------------------------------------------

/// What a finished capture run saw.
#[derive(Clone, Debug)]
pub struct CaptureSummary {
    pub processed: u64,
    pub drops: DropSnapshot,
    pub readers: Vec<ReaderSummary>,
}

impl CaptureSummary {
    /// "N packets captured, M packets dropped by kernel"
    pub fn line(&self) -> String {
        stats::summary_line(self.processed, &self.drops)
    }
}

// ---------------------------------------------------------------------------
// Main agent entry point
// ---------------------------------------------------------------------------

/// Load the probes, capture until the packet limit or Ctrl-C, then shut
/// everything down in order: readers first, then the packet consumer
/// (drain and close sinks), then the process consumer.
pub async fn run_agent(config: AgentConfig) -> Result<CaptureSummary> {
    #[cfg(feature = "prometheus")]
    metrics::init(config.metrics_port)?;

    let device_cache = Arc::new(DeviceCache::new());
    let found = device_cache
        .rescan()
        .await
        .context("Failed to read network devices")?;
    info!("Found {} network devices", found);

    let process_cache = Arc::new(ProcessCache::new());
    let seeded = {
        let cache = process_cache.clone();
        tokio::task::spawn_blocking(move || cache.scan_proc(Path::new(PROC_ROOT)))
            .await
            .unwrap_or_default()
    };
    info!("Seeded process cache with {} running processes", seeded);

    let writers = writer::open_writers(config.writers.as_slice())?;

    info!("Loading eBPF programs...");
    let mut probes = Probes::load(&config.bpf_object, config.snap_len)?;
    probes.attach_tracepoints()?;
    let interfaces = if config.interfaces.is_empty() {
        device_cache.names()
    } else {
        config.interfaces.clone()
    };
    probes.attach_classifiers(interfaces.as_slice())?;
    let sources = probes.take_sources(config.snap_len)?;

    let ingest = IngestConfig {
        max_packet_size: config.snap_len,
        ..config.ingest.clone()
    };
    let cancel = CancellationToken::new();
    let (ingestion, queues) = Ingestion::start(sources, &ingest, &cancel)?;
    let drops = ingestion.drops();

    let device_refresher =
        device_cache.spawn_refresher(DEVICE_REFRESH_INTERVAL, cancel.child_token());

    let process_task = {
        let mut consumer = ProcessEventConsumer::new(process_cache.clone())
            .with_sweep(PROC_ROOT, process::DEFAULT_SWEEP_INTERVAL);
        let token = cancel.child_token();
        tokio::spawn(async move { consumer.run(token, queues.execs, queues.exits).await })
    };

    let consumer = PacketEventConsumer::new(writers, device_cache)
        .with_processes(process_cache)
        .with_delay(config.delay)
        .spawn(queues.packets, config.count, &cancel);

    let reporter = config.status_interval.map(|interval| {
        stats::spawn_status_reporter(
            interval,
            consumer.processed(),
            drops.clone(),
            cancel.child_token(),
        )
    });

    info!("Capturing... Press Ctrl-C to exit");
    tokio::select! {
        res = signal::ctrl_c() => {
            res?;
            info!("Exiting...");
        }
        _ = consumer.finished() => {
            info!("Packet limit reached or capture ended");
        }
    }

    let readers = ingestion.shutdown(config.shutdown_timeout).await;
    let report = consumer.stop(config.shutdown_timeout).await;
    cancel.cancel();
    if tokio::time::timeout(config.shutdown_timeout, process_task)
        .await
        .is_err()
    {
        warn!("process consumer did not stop in time");
    }
    if let Some(reporter) = reporter {
        let _ = reporter.await;
    }
    let _ = device_refresher.await;
    drop(probes);

    let report = report?;
    Ok(CaptureSummary {
        processed: report.processed,
        drops: drops.snapshot(),
        readers,
    })
}
