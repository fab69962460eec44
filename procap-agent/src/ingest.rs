//! Ingestion supervisor.
//!
//! Starts one reader per event stream and hands back the three queues
//! separately. Readers are independent: a reader that stops never stops
//! the others, and each one accounts its own losses in the shared
//! [`DropCounters`].

use crate::codec::{EventDecoder, ExecDecoder, ExitDecoder, PacketDecoder, PacketEvent};
use crate::reader::{start_reader, ReaderOptions, ReaderSummary, ReaderTask};
use crate::source::{page_size, AttachError, EventSource, DEFAULT_PAGES_PER_CPU};
use crate::stats::DropCounters;
use log::{debug, info, warn};
use procap_types::{ExecEvent, ExitEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_PACKET_QUEUE: usize = 1000;
pub const DEFAULT_EXEC_QUEUE: usize = 100;
pub const DEFAULT_EXIT_QUEUE: usize = 100;
/// Largest captured payload the packet probe emits.
pub const DEFAULT_MAX_PACKET_SIZE: usize = 256 * 1024;

#[derive(Clone, Debug)]
pub struct IngestConfig {
    pub packet_queue: usize,
    pub exec_queue: usize,
    pub exit_queue: usize,
    pub max_packet_size: usize,
    pub pages_per_cpu: usize,
    pub page_size: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            packet_queue: DEFAULT_PACKET_QUEUE,
            exec_queue: DEFAULT_EXEC_QUEUE,
            exit_queue: DEFAULT_EXIT_QUEUE,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            pages_per_cpu: DEFAULT_PAGES_PER_CPU,
            page_size: page_size(),
        }
    }
}

impl IngestConfig {
    fn reader_options(&self, queue_capacity: usize) -> ReaderOptions {
        ReaderOptions {
            queue_capacity,
            pages_per_cpu: self.pages_per_cpu,
            page_size: self.page_size,
        }
    }
}

/// The three not-yet-attached sources.
pub struct Sources<P, E, X> {
    pub packets: P,
    pub execs: E,
    pub exits: X,
}

/// Output queues, one per event stream.
#[derive(Debug)]
pub struct EventQueues {
    pub packets: mpsc::Receiver<PacketEvent>,
    pub execs: mpsc::Receiver<ExecEvent>,
    pub exits: mpsc::Receiver<ExitEvent>,
}

/// Running readers for all three streams.
#[derive(Debug)]
pub struct Ingestion {
    cancel: CancellationToken,
    tasks: Vec<ReaderTask>,
    drops: Arc<DropCounters>,
}

impl Ingestion {
    /// Attach all three sources and start their readers.
    ///
    /// If any source fails to attach, readers already started are stopped
    /// before the error is returned.
    pub fn start<P, E, X>(
        sources: Sources<P, E, X>,
        config: &IngestConfig,
        cancel: &CancellationToken,
    ) -> Result<(Ingestion, EventQueues), AttachError>
    where
        P: EventSource,
        E: EventSource,
        X: EventSource,
    {
        let cancel = cancel.child_token();
        let drops = Arc::new(DropCounters::new());
        let mut ingestion = Ingestion {
            cancel,
            tasks: Vec::with_capacity(3),
            drops,
        };

        let packets = ingestion.spawn(
            sources.packets,
            PacketDecoder {
                max_payload: config.max_packet_size,
            },
            &config.reader_options(config.packet_queue),
        )?;
        let execs = ingestion.spawn(
            sources.execs,
            ExecDecoder,
            &config.reader_options(config.exec_queue),
        )?;
        let exits = ingestion.spawn(
            sources.exits,
            ExitDecoder,
            &config.reader_options(config.exit_queue),
        )?;

        info!("started {} event readers", ingestion.tasks.len());
        Ok((
            ingestion,
            EventQueues {
                packets,
                execs,
                exits,
            },
        ))
    }

    fn spawn<S, D>(
        &mut self,
        source: S,
        decoder: D,
        options: &ReaderOptions,
    ) -> Result<mpsc::Receiver<D::Event>, AttachError>
    where
        S: EventSource,
        D: EventDecoder,
    {
        match start_reader(
            source,
            decoder,
            options,
            self.drops.clone(),
            self.cancel.clone(),
        ) {
            Ok(handle) => {
                self.tasks.push(handle.task);
                Ok(handle.events)
            }
            Err(e) => {
                warn!("failed to attach {} reader: {}", D::KIND, e);
                self.stop_all();
                Err(e)
            }
        }
    }

    fn stop_all(&self) {
        self.cancel.cancel();
        for task in &self.tasks {
            task.close();
        }
    }

    pub fn drops(&self) -> Arc<DropCounters> {
        self.drops.clone()
    }

    /// Whether every reader has exited.
    pub fn is_finished(&self) -> bool {
        self.tasks.iter().all(ReaderTask::is_finished)
    }

    /// Stop every reader and wait up to `grace` for each to exit.
    ///
    /// Readers still running after the grace period are aborted and left
    /// out of the returned summaries.
    pub async fn shutdown(self, grace: Duration) -> Vec<ReaderSummary> {
        self.stop_all();
        let deadline = tokio::time::Instant::now() + grace;
        let mut summaries = Vec::with_capacity(self.tasks.len());
        for task in self.tasks {
            let kind = task.kind();
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let abort = task.abort_handle();
            match tokio::time::timeout(remaining, task.join()).await {
                Ok(Ok(summary)) => summaries.push(summary),
                Ok(Err(e)) => warn!("{} reader task failed: {}", kind, e),
                Err(_) => {
                    warn!("{} reader did not stop within {:?}, aborting", kind, grace);
                    abort.abort();
                }
            }
        }
        debug!("ingestion stopped");
        summaries
    }
}
