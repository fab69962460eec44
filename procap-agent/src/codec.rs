//! Binary event codec.
//!
//! Decodes one raw perf sample into a typed event. Every field is read
//! explicitly as little-endian in the order the probe writes it; nothing is
//! transmuted out of the sample. The input slice is only borrowed for the
//! duration of the call; anything that outlives it (the packet payload) is
//! copied.
//!
//! Perf samples are padded to 8 bytes by the kernel, so trailing bytes past
//! the declared content are ignored rather than rejected.

use byteorder::{LittleEndian, ReadBytesExt};
use bytes::Bytes;
use procap_types::{
    ExecEvent, ExitEvent, PacketEventMeta, ProcessMeta, CGROUP_NAME_LEN, EXEC_ARGS_LEN,
    EXEC_FILENAME_LEN,
};
use std::fmt;
use std::io::{self, Read};
use std::mem::size_of;

/// Size of the fixed header preceding every packet payload.
pub const PACKET_HEADER_SIZE: usize = size_of::<PacketEventMeta>();
pub const EXEC_EVENT_SIZE: usize = size_of::<ExecEvent>();
pub const EXIT_EVENT_SIZE: usize = size_of::<ExitEvent>();

/// The three record streams the probes produce.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    Packet,
    Exec,
    Exit,
}

impl EventKind {
    pub const COUNT: usize = 3;
    pub const ALL: [EventKind; Self::COUNT] = [EventKind::Packet, EventKind::Exec, EventKind::Exit];

    pub fn index(self) -> usize {
        match self {
            EventKind::Packet => 0,
            EventKind::Exec => 1,
            EventKind::Exit => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Packet => "packet",
            EventKind::Exec => "exec",
            EventKind::Exit => "exit",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("record too short: need {needed} bytes, got {got}")]
    TooShort { needed: usize, got: usize },
    #[error("payload truncated: header declares {declared} bytes but only {available} follow")]
    Truncated { declared: u64, available: usize },
}

/// A decoded packet: the fixed header plus an owned copy of exactly
/// `meta.packet_size` captured bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PacketEvent {
    pub meta: PacketEventMeta,
    pub payload: Bytes,
}

/// Events carrying the probe's capture timestamp.
///
/// Queues preserve per-CPU order only; anything that needs wall-clock order
/// across CPUs must sort on this field.
pub trait Timestamped {
    fn timestamp_ns(&self) -> u64;
}

impl Timestamped for PacketEvent {
    fn timestamp_ns(&self) -> u64 {
        self.meta.timestamp_ns
    }
}

impl Timestamped for ExecEvent {
    fn timestamp_ns(&self) -> u64 {
        self.timestamp_ns
    }
}

impl Timestamped for ExitEvent {
    fn timestamp_ns(&self) -> u64 {
        self.timestamp_ns
    }
}

/// Stable sort by embedded capture timestamp.
pub fn sort_by_timestamp<T: Timestamped>(events: &mut [T]) {
    events.sort_by_key(T::timestamp_ns);
}

fn too_short(needed: usize, raw: &[u8]) -> DecodeError {
    DecodeError::TooShort {
        needed,
        got: raw.len(),
    }
}

fn read_process_meta(buf: &mut &[u8]) -> io::Result<ProcessMeta> {
    let mut meta = ProcessMeta::new();
    meta.pid = buf.read_u32::<LittleEndian>()?;
    meta.mntns_id = buf.read_u32::<LittleEndian>()?;
    meta.netns_id = buf.read_u32::<LittleEndian>()?;
    let mut cgroup_name = [0u8; CGROUP_NAME_LEN];
    buf.read_exact(&mut cgroup_name)?;
    meta.cgroup_name = cgroup_name;
    Ok(meta)
}

fn read_packet_meta(buf: &mut &[u8]) -> io::Result<PacketEventMeta> {
    let mut meta = PacketEventMeta::new();
    meta.timestamp_ns = buf.read_u64::<LittleEndian>()?;
    meta.packet_type = buf.read_u8()?;
    buf.read_exact(&mut meta._pad)?;
    meta.ifindex = buf.read_u32::<LittleEndian>()?;
    meta.payload_len = buf.read_u64::<LittleEndian>()?;
    meta.packet_size = buf.read_u64::<LittleEndian>()?;
    meta.process = read_process_meta(buf)?;
    buf.read_exact(&mut meta._pad2)?;
    Ok(meta)
}

fn read_exec(buf: &mut &[u8]) -> io::Result<ExecEvent> {
    let mut event = ExecEvent::new();
    event.timestamp_ns = buf.read_u64::<LittleEndian>()?;
    event.pid = buf.read_u32::<LittleEndian>()?;
    event.ppid = buf.read_u32::<LittleEndian>()?;
    event.filename_truncated = buf.read_u8()?;
    event.args_truncated = buf.read_u8()?;
    buf.read_exact(&mut event._pad)?;
    event.args_size = buf.read_u32::<LittleEndian>()?;
    let mut filename = [0u8; EXEC_FILENAME_LEN];
    buf.read_exact(&mut filename)?;
    event.filename = filename;
    let mut args = [0u8; EXEC_ARGS_LEN];
    buf.read_exact(&mut args)?;
    event.args = args;
    Ok(event)
}

fn read_exit(buf: &mut &[u8]) -> io::Result<ExitEvent> {
    Ok(ExitEvent {
        timestamp_ns: buf.read_u64::<LittleEndian>()?,
        pid: buf.read_u32::<LittleEndian>()?,
        _pad: buf.read_u32::<LittleEndian>()?,
    })
}

/// Decode a packet record: fixed header followed by `packet_size` bytes.
pub fn decode_packet(raw: &[u8]) -> Result<PacketEvent, DecodeError> {
    decode_packet_snapped(raw, usize::MAX)
}

/// Like [`decode_packet`], but keeps at most `snap_len` payload bytes.
///
/// The declared size is still validated against the record in full; only
/// the copy is cut short, and `packet_size` is rewritten to match it.
pub fn decode_packet_snapped(raw: &[u8], snap_len: usize) -> Result<PacketEvent, DecodeError> {
    let (mut header, rest) = raw
        .split_at_checked(PACKET_HEADER_SIZE)
        .ok_or_else(|| too_short(PACKET_HEADER_SIZE, raw))?;
    let mut meta =
        read_packet_meta(&mut header).map_err(|_| too_short(PACKET_HEADER_SIZE, raw))?;

    let declared = meta.packet_size;
    let truncated = DecodeError::Truncated {
        declared,
        available: rest.len(),
    };
    let len = usize::try_from(declared).map_err(|_| truncated.clone())?;
    let mut payload = rest.get(..len).ok_or(truncated)?;
    if payload.len() > snap_len {
        payload = &payload[..snap_len];
        meta.packet_size = snap_len as u64;
    }

    Ok(PacketEvent {
        meta,
        payload: Bytes::copy_from_slice(payload),
    })
}

pub fn decode_exec(raw: &[u8]) -> Result<ExecEvent, DecodeError> {
    if raw.len() < EXEC_EVENT_SIZE {
        return Err(too_short(EXEC_EVENT_SIZE, raw));
    }
    let mut buf = raw;
    read_exec(&mut buf).map_err(|_| too_short(EXEC_EVENT_SIZE, raw))
}

pub fn decode_exit(raw: &[u8]) -> Result<ExitEvent, DecodeError> {
    if raw.len() < EXIT_EVENT_SIZE {
        return Err(too_short(EXIT_EVENT_SIZE, raw));
    }
    let mut buf = raw;
    read_exit(&mut buf).map_err(|_| too_short(EXIT_EVENT_SIZE, raw))
}

/// Per-stream decoding strategy used by the generic reader.
pub trait EventDecoder: Send + Sync + 'static {
    type Event: Send + 'static;

    const KIND: EventKind;

    /// Largest record this stream can produce; drives per-CPU buffer sizing.
    fn max_record_size(&self) -> usize;

    fn decode(&self, raw: &[u8]) -> Result<Self::Event, DecodeError>;
}

/// Packet stream decoder. `max_payload` is the snap length: it sizes the
/// per-CPU buffers and caps the payload kept from each record.
#[derive(Clone, Copy, Debug)]
pub struct PacketDecoder {
    pub max_payload: usize,
}

impl EventDecoder for PacketDecoder {
    type Event = PacketEvent;

    const KIND: EventKind = EventKind::Packet;

    fn max_record_size(&self) -> usize {
        PACKET_HEADER_SIZE + self.max_payload
    }

    fn decode(&self, raw: &[u8]) -> Result<PacketEvent, DecodeError> {
        decode_packet_snapped(raw, self.max_payload)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ExecDecoder;

impl EventDecoder for ExecDecoder {
    type Event = ExecEvent;

    const KIND: EventKind = EventKind::Exec;

    fn max_record_size(&self) -> usize {
        EXEC_EVENT_SIZE
    }

    fn decode(&self, raw: &[u8]) -> Result<ExecEvent, DecodeError> {
        decode_exec(raw)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ExitDecoder;

impl EventDecoder for ExitDecoder {
    type Event = ExitEvent;

    const KIND: EventKind = EventKind::Exit;

    fn max_record_size(&self) -> usize {
        EXIT_EVENT_SIZE
    }

    fn decode(&self, raw: &[u8]) -> Result<ExitEvent, DecodeError> {
        decode_exit(raw)
    }
}
