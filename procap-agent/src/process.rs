//! Process lifecycle cache fed by the exec and exit streams.
//!
//! Packets only carry a pid. The cache maps that pid to what the exec
//! probe saw (binary path, argv, parent) so sinks can print a command line
//! next to each packet. Exited processes are kept for a retention window
//! because their last packets are often still queued when the exit event
//! arrives. Entries whose exit record was lost are found by a periodic
//! sweep that checks `/proc`.

use crate::stats::ProcessedCounter;
use log::{debug, info, warn};
use procap_types::{ExecEvent, ExitEvent};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// How long an exited process stays resolvable, in probe clock time.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(10);

/// How often running processes are checked against `/proc`.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub ppid: u32,
    pub filename: String,
    pub args: Vec<String>,
    /// Probe timestamp of the exec; `None` for processes found at startup.
    pub exec_ns: Option<u64>,
    pub exit_ns: Option<u64>,
}

impl ProcessInfo {
    pub fn from_exec(event: &ExecEvent) -> Self {
        Self {
            pid: event.pid,
            ppid: event.ppid,
            filename: event.filename_str().to_string(),
            args: event.args(),
            exec_ns: Some(event.timestamp_ns),
            exit_ns: None,
        }
    }

    /// Space-joined argv, or the filename when argv is empty.
    pub fn command_line(&self) -> String {
        if self.args.is_empty() {
            self.filename.clone()
        } else {
            self.args.join(" ")
        }
    }
}

/// Resolves a pid to its process, when known.
pub trait ProcessLookup: Send + Sync {
    fn lookup(&self, pid: u32) -> Option<ProcessInfo>;
}

#[derive(Debug, Default)]
pub struct ProcessCache {
    processes: RwLock<HashMap<u32, ProcessInfo>>,
}

impl ProcessCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.processes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn insert(&self, info: ProcessInfo) {
        self.processes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(info.pid, info);
    }

    /// A new exec replaces whatever the pid previously ran.
    pub fn handle_exec(&self, event: &ExecEvent) {
        self.insert(ProcessInfo::from_exec(event));
    }

    pub fn handle_exit(&self, event: &ExitEvent) {
        let mut processes = self
            .processes
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(info) = processes.get_mut(&event.pid) {
            info.exit_ns = Some(event.timestamp_ns);
        }
    }

    /// Drop processes that exited at least `retention` before `now_ns`.
    /// Returns how many were removed.
    pub fn evict_exited(&self, now_ns: u64, retention: Duration) -> usize {
        let retention_ns = u64::try_from(retention.as_nanos()).unwrap_or(u64::MAX);
        let mut processes = self
            .processes
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = processes.len();
        processes.retain(|_, info| match info.exit_ns {
            Some(exit_ns) => now_ns.saturating_sub(exit_ns) < retention_ns,
            None => true,
        });
        before - processes.len()
    }

    /// Remove processes still marked running whose `proc_root/<pid>` entry
    /// is gone: their exit record never arrived. Returns how many were
    /// removed.
    pub fn remove_vanished(&self, proc_root: &Path) -> usize {
        let running: Vec<u32> = self
            .processes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|info| info.exit_ns.is_none())
            .map(|info| info.pid)
            .collect();
        let vanished: Vec<u32> = running
            .into_iter()
            .filter(|pid| !proc_root.join(pid.to_string()).exists())
            .collect();

        let mut processes = self
            .processes
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let mut removed = 0;
        for pid in vanished {
            // An exec or exit may have landed since the scan.
            if processes
                .get(&pid)
                .is_some_and(|info| info.exit_ns.is_none())
            {
                processes.remove(&pid);
                removed += 1;
            }
        }
        removed
    }

    /// Seed the cache with processes already running under `proc_root`.
    pub fn scan_proc(&self, proc_root: &Path) -> usize {
        let entries = match std::fs::read_dir(proc_root) {
            Ok(e) => e,
            Err(e) => {
                debug!("cannot scan {}: {}", proc_root.display(), e);
                return 0;
            }
        };
        let mut count = 0;
        for entry in entries.flatten() {
            let pid: u32 = match entry.file_name().to_string_lossy().parse() {
                Ok(p) => p,
                Err(_) => continue,
            };
            if let Some(info) = read_proc_entry(&entry.path(), pid) {
                self.insert(info);
                count += 1;
            }
        }
        count
    }
}

impl ProcessLookup for ProcessCache {
    fn lookup(&self, pid: u32) -> Option<ProcessInfo> {
        self.processes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&pid)
            .cloned()
    }
}

fn read_proc_entry(dir: &Path, pid: u32) -> Option<ProcessInfo> {
    let stat = std::fs::read_to_string(dir.join("stat")).ok()?;
    let ppid = parse_stat_ppid(&stat)?;
    let args = std::fs::read(dir.join("cmdline"))
        .map(|raw| {
            raw.split(|&b| b == 0)
                .filter(|s| !s.is_empty())
                .map(|s| String::from_utf8_lossy(s).into_owned())
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    let filename = std::fs::read_link(dir.join("exe"))
        .map(|p| p.to_string_lossy().into_owned())
        .ok()
        .or_else(|| args.first().cloned())
        .unwrap_or_default();
    Some(ProcessInfo {
        pid,
        ppid,
        filename,
        args,
        exec_ns: None,
        exit_ns: None,
    })
}

/// The ppid is the second field after the parenthesised comm, which may
/// itself contain spaces and parentheses.
fn parse_stat_ppid(stat: &str) -> Option<u32> {
    let after_comm = &stat[stat.rfind(')')? + 1..];
    after_comm.split_whitespace().nth(1)?.parse().ok()
}

/// Keeps a [`ProcessCache`] current from the exec and exit queues.
pub struct ProcessEventConsumer {
    cache: Arc<ProcessCache>,
    retention: Duration,
    handled: ProcessedCounter,
    newest_ns: u64,
    sweep: Option<(PathBuf, Duration)>,
}

impl ProcessEventConsumer {
    pub fn new(cache: Arc<ProcessCache>) -> Self {
        Self {
            cache,
            retention: DEFAULT_RETENTION,
            handled: ProcessedCounter::new(),
            newest_ns: 0,
            sweep: None,
        }
    }

    /// Every `interval`, drop running processes missing from `proc_root`.
    pub fn with_sweep(mut self, proc_root: impl Into<PathBuf>, interval: Duration) -> Self {
        self.sweep = Some((proc_root.into(), interval));
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Live count of exec and exit events applied to the cache.
    pub fn handled(&self) -> ProcessedCounter {
        self.handled.clone()
    }

    fn observe(&mut self, timestamp_ns: u64) {
        self.newest_ns = self.newest_ns.max(timestamp_ns);
        self.handled.increment();
    }

    fn evict(&self) {
        let evicted = self.cache.evict_exited(self.newest_ns, self.retention);
        if evicted > 0 {
            debug!("evicted {} exited processes", evicted);
        }
        #[cfg(feature = "prometheus")]
        crate::metrics::set_tracked_processes(self.cache.len());
    }

    async fn sweep_vanished(&self) {
        let Some((root, _)) = &self.sweep else {
            return;
        };
        let cache = self.cache.clone();
        let root = root.clone();
        match tokio::task::spawn_blocking(move || cache.remove_vanished(&root)).await {
            Ok(0) => {}
            Ok(removed) => debug!("dropped {} processes that exited unseen", removed),
            Err(e) => warn!("process sweep failed: {}", e),
        }
        self.evict();
    }

    /// Apply events until cancelled or both queues are closed.
    pub async fn run(
        &mut self,
        cancel: CancellationToken,
        mut execs: mpsc::Receiver<ExecEvent>,
        mut exits: mpsc::Receiver<ExitEvent>,
    ) {
        let mut sweep_timer = self.sweep.as_ref().map(|&(_, every)| {
            let mut timer = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            timer
        });
        let mut execs_open = true;
        let mut exits_open = true;
        while execs_open || exits_open {
            // Execs first: an exit is only useful once its exec is applied.
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = execs.recv(), if execs_open => match event {
                    Some(event) => {
                        self.observe(event.timestamp_ns);
                        self.cache.handle_exec(&event);
                    }
                    None => execs_open = false,
                },
                event = exits.recv(), if exits_open => match event {
                    Some(event) => {
                        self.observe(event.timestamp_ns);
                        self.cache.handle_exit(&event);
                        self.evict();
                    }
                    None => exits_open = false,
                },
                _ = next_tick(&mut sweep_timer) => self.sweep_vanished().await,
            }
        }
        info!(
            "process consumer stopped after {} events, {} processes tracked",
            self.handled.get(),
            self.cache.len()
        );
    }
}

async fn next_tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}
