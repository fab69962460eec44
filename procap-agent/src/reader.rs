//! Generic per-source reader.
//!
//! One reader runs per event stream. It attaches its source with a per-CPU
//! buffer large enough for the stream's biggest record, then drains records
//! in a background task: decode, push onto a bounded queue, and account for
//! lost samples. Only the attach step can fail the caller; every later
//! failure is logged and absorbed so one bad read or one malformed record
//! never stops the stream.

use crate::codec::{EventDecoder, EventKind};
use crate::source::{
    page_size, per_cpu_buffer_size, AttachError, Closer, EventSource, ReadError, RecordRead,
    DEFAULT_PAGES_PER_CPU,
};
use crate::stats::DropCounters;
use log::{debug, error};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug)]
pub struct ReaderOptions {
    /// Capacity of the bounded output queue.
    pub queue_capacity: usize,
    /// Baseline per-CPU buffer size, in pages.
    pub pages_per_cpu: usize,
    pub page_size: usize,
}

impl ReaderOptions {
    pub fn with_queue_capacity(queue_capacity: usize) -> Self {
        Self {
            queue_capacity,
            ..Default::default()
        }
    }
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            queue_capacity: 100,
            pages_per_cpu: DEFAULT_PAGES_PER_CPU,
            page_size: page_size(),
        }
    }
}

/// Why a read loop returned.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReaderExit {
    #[default]
    Cancelled,
    /// The source reported it was closed.
    SourceClosed,
    /// Nobody is receiving from the output queue any more.
    QueueClosed,
}

/// Counters for one read loop, returned when it exits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReaderSummary {
    pub kind: EventKind,
    pub delivered: u64,
    pub lost: u64,
    pub decode_failures: u64,
    pub read_errors: u64,
    pub exit: ReaderExit,
}

impl ReaderSummary {
    fn new(kind: EventKind) -> Self {
        Self {
            kind,
            delivered: 0,
            lost: 0,
            decode_failures: 0,
            read_errors: 0,
            exit: ReaderExit::default(),
        }
    }
}

/// Background half of a started reader.
#[derive(Debug)]
pub struct ReaderTask {
    kind: EventKind,
    closer: Closer,
    handle: JoinHandle<ReaderSummary>,
}

impl ReaderTask {
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Close the underlying source, unblocking a read in progress.
    pub fn close(&self) {
        self.closer.close();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.handle.abort_handle()
    }

    pub async fn join(self) -> Result<ReaderSummary, JoinError> {
        self.handle.await
    }
}

/// A started reader: the output queue plus its background task.
#[derive(Debug)]
pub struct ReaderHandle<E> {
    pub events: mpsc::Receiver<E>,
    pub task: ReaderTask,
}

/// Attach `source` and spawn its read loop.
///
/// On attach failure nothing is spawned and the error is returned.
pub fn start_reader<S, D>(
    source: S,
    decoder: D,
    options: &ReaderOptions,
    drops: Arc<DropCounters>,
    cancel: CancellationToken,
) -> Result<ReaderHandle<D::Event>, AttachError>
where
    S: EventSource,
    D: EventDecoder,
{
    let kind = D::KIND;
    let per_cpu_bytes = per_cpu_buffer_size(
        options.page_size,
        options.pages_per_cpu,
        decoder.max_record_size(),
    );
    debug!(
        "{} reader: page size is {}, using {} bytes per CPU for {}",
        kind,
        options.page_size,
        per_cpu_bytes,
        source.name()
    );

    let records = source.attach(per_cpu_bytes)?;
    let closer = records.closer();
    let (tx, rx) = mpsc::channel(options.queue_capacity.max(1));
    let handle = tokio::spawn(read_loop(records, decoder, tx, drops, cancel));

    Ok(ReaderHandle {
        events: rx,
        task: ReaderTask {
            kind,
            closer,
            handle,
        },
    })
}

async fn read_loop<R, D>(
    mut records: R,
    decoder: D,
    tx: mpsc::Sender<D::Event>,
    drops: Arc<DropCounters>,
    cancel: CancellationToken,
) -> ReaderSummary
where
    R: RecordRead,
    D: EventDecoder,
{
    let kind = D::KIND;
    let closer = records.closer();
    let mut summary = ReaderSummary::new(kind);

    loop {
        if cancel.is_cancelled() {
            summary.exit = ReaderExit::Cancelled;
            break;
        }

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                summary.exit = ReaderExit::Cancelled;
                break;
            }
            result = records.read() => result,
        };

        let record = match result {
            Ok(record) => record,
            Err(ReadError::Closed) => {
                debug!("{} reader: source closed", kind);
                summary.exit = ReaderExit::SourceClosed;
                break;
            }
            Err(ReadError::Transient(e)) => {
                debug!("{} reader: got EOF error: {}", kind, e);
                continue;
            }
            Err(e) => {
                summary.read_errors += 1;
                error!("read {} event failed: {}", kind, e);
                continue;
            }
        };

        if record.lost_samples > 0 {
            drops.record_lost(kind, record.lost_samples);
            summary.lost += record.lost_samples;
        }

        let Some(raw) = record.raw_sample else {
            continue;
        };
        let decoded = decoder.decode(&raw);
        drop(raw);
        let event = match decoded {
            Ok(event) => event,
            Err(e) => {
                drops.record_decode_failure(kind);
                summary.decode_failures += 1;
                error!("parse {} event failed: {}", kind, e);
                continue;
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                summary.exit = ReaderExit::Cancelled;
                break;
            }
            sent = tx.send(event) => {
                if sent.is_err() {
                    debug!("{} reader: queue receiver dropped", kind);
                    summary.exit = ReaderExit::QueueClosed;
                    break;
                }
                summary.delivered += 1;
            }
        }
    }

    closer.close();
    debug!(
        "{} reader stopped ({:?}): delivered={} lost={} decode_failures={}",
        kind, summary.exit, summary.delivered, summary.lost, summary.decode_failures
    );
    summary
}
