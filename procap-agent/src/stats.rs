//! Loss and drop accounting.
//!
//! [`DropCounters`] is owned by the ingestion supervisor and handed to every
//! reader behind an `Arc`. Lost samples (records the kernel overwrote before
//! userspace could read them) and decode failures are tracked separately,
//! one slot per [`EventKind`], so concurrent readers of different event
//! types never touch the same counter.

use crate::codec::EventKind;
use log::info;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
pub struct DropCounters {
    lost: [AtomicU64; EventKind::COUNT],
    decode_failures: [AtomicU64; EventKind::COUNT],
}

impl DropCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add kernel-reported lost samples for `kind`.
    pub fn record_lost(&self, kind: EventKind, count: u64) {
        if count == 0 {
            return;
        }
        self.lost[kind.index()].fetch_add(count, Ordering::Relaxed);
        #[cfg(feature = "prometheus")]
        crate::metrics::record_lost(kind, count);
    }

    pub fn lost(&self, kind: EventKind) -> u64 {
        self.lost[kind.index()].load(Ordering::Relaxed)
    }

    pub fn total_lost(&self) -> u64 {
        EventKind::ALL.iter().map(|&k| self.lost(k)).sum()
    }

    pub fn record_decode_failure(&self, kind: EventKind) {
        self.decode_failures[kind.index()].fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "prometheus")]
        crate::metrics::record_decode_failure(kind);
    }

    pub fn decode_failures(&self, kind: EventKind) -> u64 {
        self.decode_failures[kind.index()].load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> DropSnapshot {
        DropSnapshot {
            packet_lost: self.lost(EventKind::Packet),
            exec_lost: self.lost(EventKind::Exec),
            exit_lost: self.lost(EventKind::Exit),
            packet_decode_failures: self.decode_failures(EventKind::Packet),
            exec_decode_failures: self.decode_failures(EventKind::Exec),
            exit_decode_failures: self.decode_failures(EventKind::Exit),
        }
    }
}

/// Point-in-time copy of [`DropCounters`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DropSnapshot {
    pub packet_lost: u64,
    pub exec_lost: u64,
    pub exit_lost: u64,
    pub packet_decode_failures: u64,
    pub exec_decode_failures: u64,
    pub exit_decode_failures: u64,
}

/// Live count of packet events the consumer has finished with.
#[derive(Clone, Debug, Default)]
pub struct ProcessedCounter(Arc<AtomicU64>);

impl ProcessedCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn increment(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Final report line, e.g. `"12 packets captured, 3 packets dropped by kernel"`.
pub fn summary_line(processed: u64, drops: &DropSnapshot) -> String {
    let mut line = format!(
        "{} packets captured, {} packets dropped by kernel",
        processed, drops.packet_lost
    );
    let lifecycle_lost = drops.exec_lost + drops.exit_lost;
    if lifecycle_lost > 0 {
        line.push_str(&format!(", {} process events dropped", lifecycle_lost));
    }
    line
}

/// Periodically log capture progress until `cancel` fires.
pub fn spawn_status_reporter(
    interval: Duration,
    processed: ProcessedCounter,
    drops: Arc<DropCounters>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // first tick completes immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let snapshot = drops.snapshot();
                    info!("{}", summary_line(processed.get(), &snapshot));
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lost_counts_are_per_kind() {
        let drops = DropCounters::new();
        drops.record_lost(EventKind::Packet, 3);
        drops.record_lost(EventKind::Exec, 2);
        drops.record_lost(EventKind::Packet, 4);
        assert_eq!(drops.lost(EventKind::Packet), 7);
        assert_eq!(drops.lost(EventKind::Exec), 2);
        assert_eq!(drops.lost(EventKind::Exit), 0);
        assert_eq!(drops.total_lost(), 9);
    }

    #[test]
    fn decode_failures_do_not_touch_lost() {
        let drops = DropCounters::new();
        drops.record_decode_failure(EventKind::Exit);
        drops.record_decode_failure(EventKind::Exit);
        assert_eq!(drops.decode_failures(EventKind::Exit), 2);
        assert_eq!(drops.total_lost(), 0);
    }

    #[test]
    fn concurrent_updates_sum_exactly() {
        let drops = Arc::new(DropCounters::new());
        let handles: Vec<_> = EventKind::ALL
            .iter()
            .map(|&kind| {
                let drops = drops.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        drops.record_lost(kind, 2);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        for kind in EventKind::ALL {
            assert_eq!(drops.lost(kind), 2000);
        }
    }

    #[test]
    fn summary_mentions_lifecycle_loss_only_when_present() {
        let mut snap = DropSnapshot {
            packet_lost: 3,
            ..Default::default()
        };
        assert_eq!(
            summary_line(12, &snap),
            "12 packets captured, 3 packets dropped by kernel"
        );
        snap.exit_lost = 1;
        assert!(summary_line(12, &snap).ends_with(", 1 process events dropped"));
    }

    #[test]
    fn processed_counter_is_shared() {
        let counter = ProcessedCounter::new();
        let view = counter.clone();
        counter.increment();
        counter.increment();
        assert_eq!(view.get(), 2);
    }
}
