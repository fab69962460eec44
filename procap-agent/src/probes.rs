//! Kernel probe loading and attachment.

use crate::codec::{EXEC_EVENT_SIZE, EXIT_EVENT_SIZE, PACKET_HEADER_SIZE};
use crate::ingest::Sources;
use crate::perf::PerfEventSource;
use crate::source::AttachError;
use anyhow::{Context, Result};
use aya::programs::{tc, SchedClassifier, TcAttachType, TracePoint};
use aya::{Ebpf, EbpfLoader};
use aya_log::EbpfLogger;
use log::{debug, info, warn};
use std::path::Path;

pub const PACKET_EVENTS_MAP: &str = "PACKET_EVENTS";
pub const EXEC_EVENTS_MAP: &str = "EXEC_EVENTS";
pub const EXIT_EVENTS_MAP: &str = "EXIT_EVENTS";
/// Read-only global in the packet probe bounding how many bytes it copies.
pub const SNAP_LEN_GLOBAL: &str = "SNAP_LEN";

const TRACEPOINTS: &[(&str, &str, &str)] = &[
    ("sched_process_exec", "sched", "sched_process_exec"),
    ("sched_process_exit", "sched", "sched_process_exit"),
];

const CLASSIFIERS: &[(&str, TcAttachType)] = &[
    ("tc_ingress", TcAttachType::Ingress),
    ("tc_egress", TcAttachType::Egress),
];

/// Bump memlock rlimit for older kernels that account BPF maps against it.
pub fn raise_memlock_rlimit() {
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        warn!("Failed to increase rlimit");
    }
}

/// A loaded probe object. Programs stay attached for as long as this lives.
pub struct Probes {
    ebpf: Ebpf,
}

/// The probe global holds a `u32`; larger snap lengths saturate.
pub fn snap_len_global(snap_len: usize) -> u32 {
    u32::try_from(snap_len).unwrap_or(u32::MAX)
}

impl Probes {
    /// Load `object`, patching its snap length global to `snap_len` so the
    /// packet probe copies no more than that.
    pub fn load(object: &Path, snap_len: usize) -> Result<Self> {
        raise_memlock_rlimit();
        let snap_len = snap_len_global(snap_len);
        let mut ebpf = EbpfLoader::new()
            .set_global(SNAP_LEN_GLOBAL, &snap_len, true)
            .load_file(object)
            .with_context(|| format!("Failed to load eBPF object {}", object.display()))?;

        if let Err(e) = EbpfLogger::init(&mut ebpf) {
            warn!("Failed to initialize eBPF logger: {}", e);
        }
        Ok(Self { ebpf })
    }

    /// Attach the exec/exit tracepoints.
    pub fn attach_tracepoints(&mut self) -> Result<()> {
        for &(prog_name, category, tp_name) in TRACEPOINTS {
            let tp: &mut TracePoint = self
                .ebpf
                .program_mut(prog_name)
                .with_context(|| format!("eBPF program '{prog_name}' not found"))?
                .try_into()?;
            tp.load()
                .with_context(|| format!("Failed to load {prog_name} into kernel"))?;
            tp.attach(category, tp_name)
                .with_context(|| format!("Failed to attach {tp_name} tracepoint"))?;
            info!("Attached tracepoint {}:{}", category, tp_name);
        }
        Ok(())
    }

    /// Attach the ingress and egress classifiers to every interface in
    /// `interfaces`. An interface that cannot be attached is skipped with a
    /// warning; it is an error only if none could be attached.
    pub fn attach_classifiers<S: AsRef<str>>(&mut self, interfaces: &[S]) -> Result<usize> {
        for &(prog_name, _) in CLASSIFIERS {
            let prog: &mut SchedClassifier = self
                .ebpf
                .program_mut(prog_name)
                .with_context(|| format!("eBPF program '{prog_name}' not found"))?
                .try_into()?;
            prog.load()
                .with_context(|| format!("Failed to load {prog_name} into kernel"))?;
        }

        let mut attached = 0;
        for iface in interfaces.iter().map(AsRef::as_ref) {
            // Fails harmlessly when the clsact qdisc already exists.
            if let Err(e) = tc::qdisc_add_clsact(iface) {
                debug!("clsact on {}: {}", iface, e);
            }
            let mut ok = true;
            for &(prog_name, attach_type) in CLASSIFIERS {
                let prog: &mut SchedClassifier = self
                    .ebpf
                    .program_mut(prog_name)
                    .with_context(|| format!("eBPF program '{prog_name}' not found"))?
                    .try_into()?;
                if let Err(e) = prog.attach(iface, attach_type) {
                    warn!("Failed to attach {} on {}: {}", prog_name, iface, e);
                    ok = false;
                }
            }
            if ok {
                info!("Capturing on {}", iface);
                attached += 1;
            }
        }
        if attached == 0 {
            anyhow::bail!("no interface could be attached");
        }
        Ok(attached)
    }

    /// Take the three perf maps as reader sources, sizing the packet buffers
    /// for `snap_len` payload bytes.
    pub fn take_sources(
        &mut self,
        snap_len: usize,
    ) -> Result<Sources<PerfEventSource, PerfEventSource, PerfEventSource>, AttachError> {
        let mut take = |name: &str, max_record_size: usize| {
            self.ebpf
                .take_map(name)
                .map(|map| PerfEventSource::new(name, map, max_record_size))
                .ok_or_else(|| AttachError::MapNotFound(name.to_string()))
        };
        Ok(Sources {
            packets: take(PACKET_EVENTS_MAP, PACKET_HEADER_SIZE + snap_len)?,
            execs: take(EXEC_EVENTS_MAP, EXEC_EVENT_SIZE)?,
            exits: take(EXIT_EVENTS_MAP, EXIT_EVENT_SIZE)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snap_len_global_saturates() {
        assert_eq!(snap_len_global(96), 96);
        assert_eq!(snap_len_global(262_144), 262_144);
        assert_eq!(snap_len_global(usize::MAX), u32::MAX);
    }
}
