//! Packet event consumer.
//!
//! Takes packets off the packet queue, enriches them and hands each one to
//! every configured sink in order. Stopping is two-phase: first the queue
//! is closed so nothing new is accepted, then whatever was already queued
//! is drained (still honouring the event limit and a deadline), and only
//! then are the sinks flushed and closed.

use crate::codec::PacketEvent;
use crate::devices::DeviceLookup;
use crate::enrich::{boot_time_ns, enrich};
use crate::process::ProcessLookup;
use crate::stats::ProcessedCounter;
use crate::writer::PacketWriter;
use anyhow::{anyhow, Result};
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Drain deadline used when the consumer stops on its own or on an outside
/// cancellation.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Why [`PacketEventConsumer::run`] returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    Cancelled,
    /// The event limit was reached.
    LimitReached,
    /// Every sender is gone and the queue is empty.
    QueueClosed,
}

pub struct PacketEventConsumer {
    writers: Vec<Box<dyn PacketWriter>>,
    devices: Arc<dyn DeviceLookup>,
    processes: Option<Arc<dyn ProcessLookup>>,
    delay: Duration,
    boot_ns: u64,
    processed: ProcessedCounter,
    max_events: u64,
}

impl PacketEventConsumer {
    pub fn new(writers: Vec<Box<dyn PacketWriter>>, devices: Arc<dyn DeviceLookup>) -> Self {
        let boot_ns = boot_time_ns().unwrap_or_else(|e| {
            warn!("cannot determine boot time, timestamps are relative: {:#}", e);
            0
        });
        Self {
            writers,
            devices,
            processes: None,
            delay: Duration::ZERO,
            boot_ns,
            processed: ProcessedCounter::new(),
            max_events: 0,
        }
    }

    /// Wait `delay` before taking the first event.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_processes(mut self, processes: Arc<dyn ProcessLookup>) -> Self {
        self.processes = Some(processes);
        self
    }

    /// Override the wall-clock offset added to probe timestamps.
    pub fn with_boot_time(mut self, boot_ns: u64) -> Self {
        self.boot_ns = boot_ns;
        self
    }

    pub fn processed_count(&self) -> u64 {
        self.processed.get()
    }

    /// A live view of the processed count, for status reporting.
    pub fn processed_counter(&self) -> ProcessedCounter {
        self.processed.clone()
    }

    fn limit_reached(&self) -> bool {
        self.max_events > 0 && self.processed.get() >= self.max_events
    }

    /// Consume events until cancelled, the queue closes, or `max_events`
    /// (when non-zero) have been processed.
    pub async fn run(
        &mut self,
        cancel: &CancellationToken,
        rx: &mut mpsc::Receiver<PacketEvent>,
        max_events: u64,
    ) -> RunOutcome {
        self.max_events = max_events;
        if self.limit_reached() {
            return RunOutcome::LimitReached;
        }

        if !self.delay.is_zero() {
            let delay = std::mem::take(&mut self.delay);
            debug!("packet consumer waiting {:?} before start", delay);
            tokio::select! {
                _ = cancel.cancelled() => return RunOutcome::Cancelled,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => return RunOutcome::Cancelled,
                event = rx.recv() => event,
            };
            let Some(event) = event else {
                return RunOutcome::QueueClosed;
            };
            self.handle(event);
            if self.limit_reached() {
                return RunOutcome::LimitReached;
            }
        }
    }

    /// Deliver one event, then count it whether or not it reached a sink.
    fn handle(&mut self, event: PacketEvent) {
        #[cfg(feature = "prometheus")]
        crate::metrics::record_processed(event.payload.len() as u64);
        self.deliver(event);
        self.processed.increment();
    }

    fn deliver(&mut self, event: PacketEvent) {
        let packet = match enrich(
            event,
            self.devices.as_ref(),
            self.processes.as_deref(),
            self.boot_ns,
        ) {
            Ok(packet) => packet,
            Err(e) => {
                error!("parse packet event failed: {}", e);
                return;
            }
        };

        for writer in self.writers.iter_mut() {
            if let Err(e) = writer.write(&packet) {
                error!(
                    "write packet to {} failed: {:#}, device: {}",
                    writer.name(),
                    e,
                    packet.device.name
                );
                #[cfg(feature = "prometheus")]
                crate::metrics::record_sink_error(writer.name(), "write");
            }
            if let Err(e) = writer.flush() {
                error!("flush {} failed: {:#}", writer.name(), e);
                #[cfg(feature = "prometheus")]
                crate::metrics::record_sink_error(writer.name(), "flush");
            }
        }
    }

    /// Stop accepting events, drain what is already queued within `timeout`
    /// (never past the event limit), then close every sink.
    ///
    /// Returns the number of events drained.
    pub async fn shutdown(mut self, mut rx: mpsc::Receiver<PacketEvent>, timeout: Duration) -> u64 {
        rx.close();
        let deadline = tokio::time::Instant::now() + timeout;
        let mut drained = 0;
        while !self.limit_reached() {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(event)) => {
                    self.handle(event);
                    drained += 1;
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        "packet consumer drain timed out after {:?}, {} events left queued",
                        timeout,
                        rx.len()
                    );
                    break;
                }
            }
        }

        for writer in self.writers.iter_mut() {
            if let Err(e) = writer.close() {
                error!("close {} failed: {:#}", writer.name(), e);
            }
        }
        debug!(
            "packet consumer shut down: drained {}, processed {}",
            drained,
            self.processed.get()
        );
        drained
    }

    /// Run on a background task. The task runs [`run`](Self::run) and then
    /// [`shutdown`](Self::shutdown), whichever way `run` ends.
    pub fn spawn(
        self,
        rx: mpsc::Receiver<PacketEvent>,
        max_events: u64,
        cancel: &CancellationToken,
    ) -> ConsumerHandle {
        let stop = cancel.child_token();
        let finished = CancellationToken::new();
        let drain_ms = Arc::new(AtomicU64::new(DEFAULT_DRAIN_TIMEOUT.as_millis() as u64));
        let processed = self.processed_counter();

        let handle = tokio::spawn({
            let stop = stop.clone();
            let finished = finished.clone();
            let drain_ms = drain_ms.clone();
            let processed = processed.clone();
            let mut consumer = self;
            let mut rx = rx;
            async move {
                let outcome = consumer.run(&stop, &mut rx, max_events).await;
                finished.cancel();
                info!("packet consumer stopping: {:?}", outcome);
                let drain = Duration::from_millis(drain_ms.load(Ordering::Relaxed));
                let drained = consumer.shutdown(rx, drain).await;
                ConsumerReport {
                    outcome,
                    processed: processed.get(),
                    drained,
                }
            }
        });

        ConsumerHandle {
            stop,
            finished,
            drain_ms,
            processed,
            handle,
        }
    }
}

/// Final state of a spawned consumer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConsumerReport {
    pub outcome: RunOutcome,
    pub processed: u64,
    /// Events handled during the drain phase.
    pub drained: u64,
}

/// Handle to a consumer running on its own task.
pub struct ConsumerHandle {
    stop: CancellationToken,
    finished: CancellationToken,
    drain_ms: Arc<AtomicU64>,
    processed: ProcessedCounter,
    handle: JoinHandle<ConsumerReport>,
}

impl ConsumerHandle {
    pub fn processed(&self) -> ProcessedCounter {
        self.processed.clone()
    }

    /// Resolves once the consumer stops taking events from the queue, for
    /// any reason.
    pub async fn finished(&self) {
        self.finished.cancelled().await
    }

    pub fn is_finished(&self) -> bool {
        self.finished.is_cancelled()
    }

    /// Stop the consumer: close the queue, drain for at most `timeout`,
    /// close the sinks. Blocks until all of that is done.
    pub async fn stop(self, timeout: Duration) -> Result<ConsumerReport> {
        self.drain_ms
            .store(timeout.as_millis() as u64, Ordering::Relaxed);
        self.stop.cancel();
        self.wait(timeout + DEFAULT_DRAIN_TIMEOUT).await
    }

    /// Wait for the consumer to stop on its own, up to `timeout`.
    ///
    /// The task is aborted if it does not finish in time.
    pub async fn wait(self, timeout: Duration) -> Result<ConsumerReport> {
        let abort = self.handle.abort_handle();
        match tokio::time::timeout(timeout, self.handle).await {
            Ok(Ok(report)) => Ok(report),
            Ok(Err(e)) => Err(anyhow!("packet consumer task failed: {}", e)),
            Err(_) => {
                abort.abort();
                Err(anyhow!("packet consumer did not stop within {:?}", timeout))
            }
        }
    }
}
