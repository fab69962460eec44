//! The data contract between the procap kernel probes and the userspace agent.
//!
//! Three probes feed three per-CPU perf buffers: a tc classifier emits one
//! [`PacketEventMeta`] header followed by the captured packet bytes, and two
//! scheduler tracepoints emit fixed-size [`ExecEvent`] and [`ExitEvent`]
//! records. Kernel and userspace share no allocator and no serializer; they
//! share *these structs*, laid out `#[repr(C)]` with every padding byte spelled
//! out, so that both sides agree on the layout byte-for-byte.
//!
//! ```text
//! ┌──────────────┐  #[repr(C)] records  ┌──────────────┐   enriched packets   ┌────────┐
//! │ kernel probes│ ──── perf buffers ──▶ │ procap-agent │ ──── writers ──────▶ │ sinks  │
//! └──────────────┘   (one per CPU)       └──────────────┘                      └────────┘
//! ```
//!
//! All multi-byte fields are little-endian. The sizes below are asserted at
//! compile time; changing a field order or width here without changing the
//! probe breaks every record on the wire.
//!
//! # Feature Flags
//!
//! - **`user`** — userspace-only helpers: [`aya::Pod`] impls and the string
//!   accessors in the [`userspace`] module.
//!
//! # Core Types
//!
//! | Type | Size | Description |
//! |------|------|-------------|
//! | [`PacketEventMeta`] | 176 | Fixed header preceding every captured packet |
//! | [`ProcessMeta`] | 140 | Process correlation identifiers embedded in packet headers |
//! | [`ExecEvent`] | 4632 | Process creation (`sched_process_exec`) |
//! | [`ExitEvent`] | 16 | Process termination (`sched_process_exit`) |

#![cfg_attr(not(feature = "user"), no_std)]

/// Maximum length for cgroup names.
pub const CGROUP_NAME_LEN: usize = 128;

/// Maximum length for an executable path.
pub const EXEC_FILENAME_LEN: usize = 512;

/// Maximum length for the NUL-separated argument block.
pub const EXEC_ARGS_LEN: usize = 4096;

/// `packet_type` value for packets seen on ingress.
pub const PACKET_TYPE_INGRESS: u8 = 0;

/// `packet_type` value for packets seen on egress.
pub const PACKET_TYPE_EGRESS: u8 = 1;

/// Process identifiers the tc probe resolves from the socket owning a packet.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProcessMeta {
    /// Process ID (tgid)
    pub pid: u32,
    /// Mount namespace inode
    pub mntns_id: u32,
    /// Network namespace inode
    pub netns_id: u32,
    /// Name of the innermost cgroup
    pub cgroup_name: [u8; CGROUP_NAME_LEN],
}

impl Default for ProcessMeta {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessMeta {
    pub const fn new() -> Self {
        ProcessMeta {
            pid: 0,
            mntns_id: 0,
            netns_id: 0,
            cgroup_name: [0; CGROUP_NAME_LEN],
        }
    }
}

/// Fixed header of a packet record. `packet_size` captured bytes follow it
/// immediately in the same record.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketEventMeta {
    /// Capture time (nanoseconds since boot)
    pub timestamp_ns: u64,
    /// Direction: [`PACKET_TYPE_INGRESS`] or [`PACKET_TYPE_EGRESS`]
    pub packet_type: u8,
    pub _pad: [u8; 3],
    /// Interface the packet was seen on
    pub ifindex: u32,
    /// Length of the packet on the wire
    pub payload_len: u64,
    /// Number of captured bytes following this header
    pub packet_size: u64,
    /// Owning process
    pub process: ProcessMeta,
    pub _pad2: [u8; 4],
}

impl Default for PacketEventMeta {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketEventMeta {
    pub const fn new() -> Self {
        PacketEventMeta {
            timestamp_ns: 0,
            packet_type: PACKET_TYPE_INGRESS,
            _pad: [0; 3],
            ifindex: 0,
            payload_len: 0,
            packet_size: 0,
            process: ProcessMeta::new(),
            _pad2: [0; 4],
        }
    }
}

/// Process creation record emitted from `sched_process_exec`.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExecEvent {
    /// Event time (nanoseconds since boot)
    pub timestamp_ns: u64,
    pub pid: u32,
    pub ppid: u32,
    /// 1 if `filename` was cut at [`EXEC_FILENAME_LEN`]
    pub filename_truncated: u8,
    /// 1 if `args` was cut at [`EXEC_ARGS_LEN`]
    pub args_truncated: u8,
    pub _pad: [u8; 2],
    /// Number of valid bytes in `args`
    pub args_size: u32,
    pub filename: [u8; EXEC_FILENAME_LEN],
    /// NUL-separated argv
    pub args: [u8; EXEC_ARGS_LEN],
}

impl Default for ExecEvent {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecEvent {
    pub const fn new() -> Self {
        ExecEvent {
            timestamp_ns: 0,
            pid: 0,
            ppid: 0,
            filename_truncated: 0,
            args_truncated: 0,
            _pad: [0; 2],
            args_size: 0,
            filename: [0; EXEC_FILENAME_LEN],
            args: [0; EXEC_ARGS_LEN],
        }
    }
}

/// Process termination record emitted from `sched_process_exit`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExitEvent {
    /// Event time (nanoseconds since boot)
    pub timestamp_ns: u64,
    pub pid: u32,
    pub _pad: u32,
}

impl ExitEvent {
    pub const fn new() -> Self {
        ExitEvent {
            timestamp_ns: 0,
            pid: 0,
            _pad: 0,
        }
    }
}

const _: () = assert!(core::mem::size_of::<ProcessMeta>() == 140);
const _: () = assert!(core::mem::size_of::<PacketEventMeta>() == 176);
const _: () = assert!(core::mem::size_of::<ExecEvent>() == 4632);
const _: () = assert!(core::mem::size_of::<ExitEvent>() == 16);

#[cfg(feature = "user")]
mod pod_impls {
    use super::*;
    // SAFETY: All types are #[repr(C)], Copy, and contain only primitive/array fields
    // with explicit padding.
    unsafe impl aya::Pod for ProcessMeta {}
    unsafe impl aya::Pod for PacketEventMeta {}
    unsafe impl aya::Pod for ExecEvent {}
    unsafe impl aya::Pod for ExitEvent {}
}

/// Userspace helper methods (requires `user` feature).
#[cfg(feature = "user")]
pub mod userspace {
    use super::*;

    /// Packet direction decoded from [`PacketEventMeta::packet_type`].
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum Direction {
        Ingress,
        Egress,
        Unknown(u8),
    }

    impl Direction {
        pub fn as_str(&self) -> &'static str {
            match self {
                Direction::Ingress => "ingress",
                Direction::Egress => "egress",
                Direction::Unknown(_) => "unknown",
            }
        }
    }

    fn nul_terminated(buf: &[u8]) -> &str {
        let len = buf.iter().position(|&c| c == 0).unwrap_or(buf.len());
        std::str::from_utf8(&buf[..len]).unwrap_or("<invalid>")
    }

    impl PacketEventMeta {
        pub fn direction(&self) -> Direction {
            match self.packet_type {
                PACKET_TYPE_INGRESS => Direction::Ingress,
                PACKET_TYPE_EGRESS => Direction::Egress,
                other => Direction::Unknown(other),
            }
        }
    }

    impl ProcessMeta {
        /// Get cgroup name as string
        pub fn cgroup_name_str(&self) -> &str {
            nul_terminated(&self.cgroup_name)
        }
    }

    impl ExecEvent {
        /// Get executable path as string
        pub fn filename_str(&self) -> &str {
            nul_terminated(&self.filename)
        }

        /// Split the argument block into individual arguments.
        ///
        /// Only the first `args_size` bytes are considered (clamped to the
        /// array); empty segments from trailing NULs are skipped.
        pub fn args(&self) -> Vec<String> {
            let len = (self.args_size as usize).min(EXEC_ARGS_LEN);
            self.args[..len]
                .split(|&c| c == 0)
                .filter(|s| !s.is_empty())
                .map(|s| String::from_utf8_lossy(s).into_owned())
                .collect()
        }

        pub fn is_truncated(&self) -> bool {
            self.filename_truncated != 0 || self.args_truncated != 0
        }
    }
}
