//! aya perf event array source.
//!
//! Each online CPU gets its own memory-mapped perf buffer. A pump task per
//! CPU waits on its buffer and forwards every sample, in the order the
//! kernel wrote it, into one channel that [`PerfRecords::read`] drains.
//! Samples from different CPUs interleave arbitrarily.

use crate::source::{
    is_end_of_stream, page_size, AttachError, Closer, EventSource, ReadError, Record, RecordRead,
};
use aya::maps::perf::{AsyncPerfEventArray, AsyncPerfEventArrayBuffer, Events, PerfBufferError};
use aya::maps::{Map, MapData};
use aya::util::online_cpus;
use bytes::BytesMut;
use log::debug;
use std::future::Future;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Samples fetched per `read_events` call.
const READ_BATCH: usize = 16;

/// Records buffered between the CPU pumps and the reader.
const PUMP_QUEUE: usize = 256;

pub struct PerfEventSource {
    name: String,
    map: Map,
    max_record_size: usize,
}

impl PerfEventSource {
    /// `map` must be a `BPF_MAP_TYPE_PERF_EVENT_ARRAY`.
    pub fn new(name: impl Into<String>, map: Map, max_record_size: usize) -> Self {
        Self {
            name: name.into(),
            map,
            max_record_size,
        }
    }
}

/// aya only maps power-of-two page counts.
fn page_count_for(per_cpu_bytes: usize, page_size: usize) -> usize {
    per_cpu_bytes.div_ceil(page_size).max(1).next_power_of_two()
}

impl EventSource for PerfEventSource {
    type Records = PerfRecords;

    fn name(&self) -> &str {
        &self.name
    }

    fn attach(self, per_cpu_bytes: usize) -> Result<PerfRecords, AttachError> {
        let name = self.name;
        let mut array =
            AsyncPerfEventArray::try_from(self.map).map_err(|e| AttachError::Other {
                source_name: name.clone(),
                reason: e.to_string(),
            })?;
        let page_count = page_count_for(per_cpu_bytes, page_size());
        let cpus = online_cpus().map_err(|(_, err)| AttachError::OnlineCpus(err))?;
        debug!(
            "{}: opening {} pages per CPU on {} CPUs",
            name,
            page_count,
            cpus.len()
        );

        // Open every CPU before spawning anything so a failed attach leaves
        // no task behind.
        let mut buffers = Vec::with_capacity(cpus.len());
        for cpu in cpus {
            let buf = array
                .open(cpu, Some(page_count))
                .map_err(|e| AttachError::Open {
                    source_name: name.clone(),
                    cpu,
                    reason: e.to_string(),
                })?;
            buffers.push((cpu, buf));
        }

        let closer = Closer::new();
        let (tx, rx) = mpsc::channel(PUMP_QUEUE);
        let pumps = buffers
            .into_iter()
            .map(|(cpu, buf)| {
                tokio::spawn(pump(
                    cpu,
                    buf,
                    tx.clone(),
                    closer.clone(),
                    self.max_record_size,
                ))
            })
            .collect();

        Ok(PerfRecords {
            _array: array,
            rx,
            closer,
            pumps,
        })
    }
}

fn classify(err: PerfBufferError) -> ReadError {
    if is_end_of_stream(&err) {
        ReadError::Transient(err.to_string())
    } else {
        ReadError::Other(err.to_string())
    }
}

async fn pump(
    cpu: u32,
    mut buf: AsyncPerfEventArrayBuffer<MapData>,
    tx: mpsc::Sender<Result<Record, ReadError>>,
    closer: Closer,
    max_record_size: usize,
) {
    let mut buffers = (0..READ_BATCH)
        .map(|_| BytesMut::with_capacity(max_record_size))
        .collect::<Vec<_>>();

    loop {
        let result = tokio::select! {
            _ = closer.closed() => break,
            result = buf.read_events(&mut buffers) => result,
        };

        let mut batch = Vec::new();
        match result {
            Ok(Events { read, lost }) => {
                let mut lost = lost as u64;
                for sample in buffers.iter_mut().take(read) {
                    batch.push(Ok(Record {
                        cpu,
                        raw_sample: Some(sample.split().freeze()),
                        lost_samples: std::mem::take(&mut lost),
                    }));
                }
                if lost > 0 {
                    batch.push(Ok(Record {
                        cpu,
                        raw_sample: None,
                        lost_samples: lost,
                    }));
                }
            }
            Err(e) => batch.push(Err(classify(e))),
        }

        for item in batch {
            tokio::select! {
                _ = closer.closed() => return,
                sent = tx.send(item) => {
                    if sent.is_err() {
                        return;
                    }
                }
            }
        }
    }
    debug!("perf pump for CPU {} stopped", cpu);
}

/// Attached perf buffers for every online CPU.
pub struct PerfRecords {
    _array: AsyncPerfEventArray<MapData>,
    rx: mpsc::Receiver<Result<Record, ReadError>>,
    closer: Closer,
    pumps: Vec<JoinHandle<()>>,
}

impl RecordRead for PerfRecords {
    fn read(&mut self) -> impl Future<Output = Result<Record, ReadError>> + Send {
        async move {
            if self.closer.is_closed() {
                return Err(ReadError::Closed);
            }
            tokio::select! {
                _ = self.closer.closed() => Err(ReadError::Closed),
                item = self.rx.recv() => item.unwrap_or(Err(ReadError::Closed)),
            }
        }
    }

    fn closer(&self) -> Closer {
        self.closer.clone()
    }
}

impl Drop for PerfRecords {
    fn drop(&mut self) {
        self.closer.close();
        self.rx.close();
        for pump in &self.pumps {
            if !pump.is_finished() {
                pump.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_count_rounds_up_to_power_of_two() {
        assert_eq!(page_count_for(4096 * 64, 4096), 64);
        assert_eq!(page_count_for(4096 * 192, 4096), 256);
        assert_eq!(page_count_for(4097, 4096), 2);
        assert_eq!(page_count_for(0, 4096), 1);
    }
}
