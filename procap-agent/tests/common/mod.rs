//! Shared fixtures: record encoders and an in-memory event source.

#![allow(dead_code)]

use byteorder::{LittleEndian, WriteBytesExt};
use bytes::Bytes;
use procap_agent::source::{AttachError, Closer, EventSource, ReadError, Record, RecordRead};
use procap_types::{ExecEvent, ExitEvent, PacketEventMeta, ProcessMeta};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Encoders: the byte layout the kernel probe writes
// ---------------------------------------------------------------------------

fn write_process(out: &mut Vec<u8>, p: &ProcessMeta) {
    out.write_u32::<LittleEndian>(p.pid).unwrap();
    out.write_u32::<LittleEndian>(p.mntns_id).unwrap();
    out.write_u32::<LittleEndian>(p.netns_id).unwrap();
    out.extend_from_slice(&p.cgroup_name);
}

pub fn encode_packet_header(meta: &PacketEventMeta) -> Vec<u8> {
    let mut out = Vec::new();
    out.write_u64::<LittleEndian>(meta.timestamp_ns).unwrap();
    out.write_u8(meta.packet_type).unwrap();
    out.extend_from_slice(&meta._pad);
    out.write_u32::<LittleEndian>(meta.ifindex).unwrap();
    out.write_u64::<LittleEndian>(meta.payload_len).unwrap();
    out.write_u64::<LittleEndian>(meta.packet_size).unwrap();
    write_process(&mut out, &meta.process);
    out.extend_from_slice(&meta._pad2);
    out
}

/// Header followed by `payload`; `packet_size` is set to the payload length.
pub fn encode_packet(meta: &PacketEventMeta, payload: &[u8]) -> Vec<u8> {
    let mut meta = *meta;
    meta.packet_size = payload.len() as u64;
    let mut out = encode_packet_header(&meta);
    out.extend_from_slice(payload);
    out
}

pub fn packet_meta(timestamp_ns: u64, ifindex: u32, pid: u32) -> PacketEventMeta {
    let mut meta = PacketEventMeta::new();
    meta.timestamp_ns = timestamp_ns;
    meta.ifindex = ifindex;
    meta.payload_len = 1500;
    meta.process.pid = pid;
    meta
}

pub fn encode_exec(event: &ExecEvent) -> Vec<u8> {
    let mut out = Vec::new();
    out.write_u64::<LittleEndian>(event.timestamp_ns).unwrap();
    out.write_u32::<LittleEndian>(event.pid).unwrap();
    out.write_u32::<LittleEndian>(event.ppid).unwrap();
    out.write_u8(event.filename_truncated).unwrap();
    out.write_u8(event.args_truncated).unwrap();
    out.extend_from_slice(&event._pad);
    out.write_u32::<LittleEndian>(event.args_size).unwrap();
    out.extend_from_slice(&event.filename);
    out.extend_from_slice(&event.args);
    out
}

pub fn encode_exit(event: &ExitEvent) -> Vec<u8> {
    let mut out = Vec::new();
    out.write_u64::<LittleEndian>(event.timestamp_ns).unwrap();
    out.write_u32::<LittleEndian>(event.pid).unwrap();
    out.write_u32::<LittleEndian>(event._pad).unwrap();
    out
}

pub fn exit_event(pid: u32, timestamp_ns: u64) -> ExitEvent {
    ExitEvent {
        timestamp_ns,
        pid,
        _pad: 0,
    }
}

pub fn sample(raw: Vec<u8>) -> Result<Record, ReadError> {
    Ok(Record {
        cpu: 0,
        raw_sample: Some(Bytes::from(raw)),
        lost_samples: 0,
    })
}

pub fn lost(count: u64) -> Result<Record, ReadError> {
    Ok(Record {
        cpu: 0,
        raw_sample: None,
        lost_samples: count,
    })
}

// ---------------------------------------------------------------------------
// FakeSource
// ---------------------------------------------------------------------------

/// Observations shared between a test and the fake it handed out.
#[derive(Clone, Debug, Default)]
pub struct SourceStats {
    pub reads: Arc<AtomicUsize>,
    pub attached_bytes: Arc<AtomicUsize>,
    pub dropped: Arc<AtomicBool>,
}

impl SourceStats {
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn is_dropped(&self) -> bool {
        self.dropped.load(Ordering::SeqCst)
    }

    /// Poll until the fake's records have been dropped.
    pub async fn wait_dropped(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.is_dropped() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.is_dropped()
    }
}

/// Replays scripted reads. Once the script is exhausted it either reports
/// `Closed` or, with `hold_open`, blocks until closed.
pub struct FakeSource {
    name: String,
    script: VecDeque<Result<Record, ReadError>>,
    hold_open: bool,
    fail_attach: bool,
    stats: SourceStats,
}

impl FakeSource {
    pub fn new(script: Vec<Result<Record, ReadError>>) -> Self {
        Self {
            name: "fake".into(),
            script: script.into(),
            hold_open: false,
            fail_attach: false,
            stats: SourceStats::default(),
        }
    }

    pub fn hold_open(mut self) -> Self {
        self.hold_open = true;
        self
    }

    pub fn failing() -> Self {
        let mut source = Self::new(Vec::new());
        source.fail_attach = true;
        source
    }

    pub fn stats(&self) -> SourceStats {
        self.stats.clone()
    }
}

impl EventSource for FakeSource {
    type Records = FakeRecords;

    fn name(&self) -> &str {
        &self.name
    }

    fn attach(self, per_cpu_bytes: usize) -> Result<FakeRecords, AttachError> {
        if self.fail_attach {
            return Err(AttachError::MapNotFound(self.name));
        }
        self.stats
            .attached_bytes
            .store(per_cpu_bytes, Ordering::SeqCst);
        Ok(FakeRecords {
            script: self.script,
            hold_open: self.hold_open,
            closer: Closer::new(),
            stats: self.stats,
        })
    }
}

pub struct FakeRecords {
    script: VecDeque<Result<Record, ReadError>>,
    hold_open: bool,
    closer: Closer,
    stats: SourceStats,
}

impl RecordRead for FakeRecords {
    fn read(&mut self) -> impl Future<Output = Result<Record, ReadError>> + Send {
        async move {
            if self.closer.is_closed() {
                return Err(ReadError::Closed);
            }
            if let Some(next) = self.script.pop_front() {
                self.stats.reads.fetch_add(1, Ordering::SeqCst);
                return next;
            }
            if self.hold_open {
                self.closer.closed().await;
            }
            Err(ReadError::Closed)
        }
    }

    fn closer(&self) -> Closer {
        self.closer.clone()
    }
}

impl Drop for FakeRecords {
    fn drop(&mut self) {
        self.stats.dropped.store(true, Ordering::SeqCst);
    }
}
