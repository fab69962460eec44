//! Turns a decoded [`PacketEvent`] into what sinks consume.

use crate::codec::PacketEvent;
use crate::devices::{DeviceInfo, DeviceLookup};
use crate::process::{ProcessInfo, ProcessLookup};
use anyhow::anyhow;
use bytes::Bytes;
use libc::{clock_gettime, timespec, CLOCK_MONOTONIC, CLOCK_REALTIME};
use procap_types::userspace::Direction;
use serde::{Serialize, Serializer};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum EnrichError {
    #[error("no device with ifindex {0}")]
    UnknownDevice(u32),
}

/// A packet with its device and process context resolved.
#[derive(Clone, Debug, Serialize)]
pub struct EnrichedPacket {
    /// Capture time, nanoseconds since the Unix epoch.
    pub timestamp_ns: u64,
    pub device: DeviceInfo,
    #[serde(serialize_with = "serialize_direction")]
    pub direction: Direction,
    pub pid: u32,
    pub mntns_id: u32,
    pub netns_id: u32,
    pub cgroup_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process: Option<ProcessInfo>,
    /// Length of the packet on the wire.
    pub wire_len: u64,
    /// Captured bytes, at most the snap length.
    #[serde(rename = "captured_len", serialize_with = "serialize_len")]
    pub payload: Bytes,
}

fn serialize_direction<S: Serializer>(direction: &Direction, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(direction.as_str())
}

fn serialize_len<S: Serializer>(payload: &Bytes, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(payload.len() as u64)
}

/// Resolve device and process context for `event`.
///
/// `boot_ns` is the wall-clock time at which the probe clock read zero; see
/// [`boot_time_ns`]. A missing process is not an error.
pub fn enrich(
    event: PacketEvent,
    devices: &dyn DeviceLookup,
    processes: Option<&dyn ProcessLookup>,
    boot_ns: u64,
) -> Result<EnrichedPacket, EnrichError> {
    let meta = event.meta;
    let device = devices
        .lookup(meta.ifindex)
        .ok_or(EnrichError::UnknownDevice(meta.ifindex))?;
    let pid = meta.process.pid;
    let process = processes.and_then(|p| p.lookup(pid));

    Ok(EnrichedPacket {
        timestamp_ns: boot_ns.saturating_add(meta.timestamp_ns),
        device,
        direction: meta.direction(),
        pid,
        mntns_id: meta.process.mntns_id,
        netns_id: meta.process.netns_id,
        cgroup_name: meta.process.cgroup_name_str().to_string(),
        process,
        wire_len: meta.payload_len,
        payload: event.payload,
    })
}

fn read_clock(clock: libc::clockid_t) -> anyhow::Result<u64> {
    let mut ts = timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    if unsafe { clock_gettime(clock, &mut ts) } < 0 {
        return Err(anyhow!("clock_gettime({}) failed", clock));
    }
    Ok((ts.tv_sec as u64)
        .saturating_mul(1_000_000_000)
        .saturating_add(ts.tv_nsec as u64))
}

/// Wall-clock nanoseconds at which the monotonic clock (the clock
/// `bpf_ktime_get_ns` reads) was zero.
pub fn boot_time_ns() -> anyhow::Result<u64> {
    let mono = read_clock(CLOCK_MONOTONIC)?;
    let wall = read_clock(CLOCK_REALTIME)?;
    Ok(wall.saturating_sub(mono))
}

/// `HH:MM:SS.ffffff` (UTC) for an epoch timestamp.
pub fn format_clock(epoch_ns: u64) -> String {
    let secs = epoch_ns / 1_000_000_000;
    let micros = (epoch_ns % 1_000_000_000) / 1_000;
    let hours = (secs / 3600) % 24;
    let minutes = (secs / 60) % 60;
    let seconds = secs % 60;
    format!("{:02}:{:02}:{:02}.{:06}", hours, minutes, seconds, micros)
}

#[cfg(test)]
mod tests {
    use super::*;
    use procap_types::{PacketEventMeta, PACKET_TYPE_INGRESS};
    use std::collections::HashMap;

    struct Devices(HashMap<u32, DeviceInfo>);

    impl DeviceLookup for Devices {
        fn lookup(&self, ifindex: u32) -> Option<DeviceInfo> {
            self.0.get(&ifindex).cloned()
        }
    }

    struct NoProcesses;

    impl ProcessLookup for NoProcesses {
        fn lookup(&self, _pid: u32) -> Option<ProcessInfo> {
            None
        }
    }

    fn devices() -> Devices {
        Devices(HashMap::from([(
            2,
            DeviceInfo {
                ifindex: 2,
                name: "eth0".into(),
            },
        )]))
    }

    fn event(ifindex: u32) -> PacketEvent {
        let mut meta = PacketEventMeta::new();
        meta.timestamp_ns = 5_000;
        meta.packet_type = PACKET_TYPE_INGRESS;
        meta.ifindex = ifindex;
        meta.payload_len = 60;
        meta.packet_size = 4;
        meta.process.pid = 77;
        meta.process.cgroup_name[..4].copy_from_slice(b"test");
        PacketEvent {
            meta,
            payload: Bytes::from_static(b"\x45\x00\x00\x3c"),
        }
    }

    #[test]
    fn resolves_device_and_wall_time() {
        let packet = enrich(event(2), &devices(), Some(&NoProcesses), 1_000_000).unwrap();
        assert_eq!(packet.device.name, "eth0");
        assert_eq!(packet.timestamp_ns, 1_005_000);
        assert_eq!(packet.direction, Direction::Ingress);
        assert_eq!(packet.cgroup_name, "test");
        assert_eq!(packet.pid, 77);
        assert!(packet.process.is_none());
        assert_eq!(packet.payload.len(), 4);
    }

    #[test]
    fn unknown_device_is_an_error() {
        assert_eq!(
            enrich(event(9), &devices(), None, 0).unwrap_err(),
            EnrichError::UnknownDevice(9)
        );
    }

    #[test]
    fn serializes_lengths_not_bytes() {
        let packet = enrich(event(2), &devices(), None, 0).unwrap();
        let json = serde_json::to_value(&packet).unwrap();
        assert_eq!(json["captured_len"], 4);
        assert_eq!(json["wire_len"], 60);
        assert_eq!(json["direction"], "ingress");
        assert!(json.get("process").is_none());
    }

    #[test]
    fn clock_formatting() {
        let ns = (13 * 3600 + 5 * 60 + 9) * 1_000_000_000 + 123_456_789;
        assert_eq!(format_clock(ns), "13:05:09.123456");
    }

    #[test]
    fn boot_time_is_in_the_past() {
        let boot = boot_time_ns().unwrap();
        assert!(boot > 0);
    }
}
