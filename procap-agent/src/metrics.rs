use crate::codec::EventKind;
use anyhow::{Context, Result};
use log::info;
use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

/// Initialize the Prometheus metrics exporter and register metric descriptions.
pub fn init(port: u16) -> Result<()> {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    describe_counter!(
        "procap_packets_processed_total",
        "Packet events taken off the queue by the consumer"
    );
    describe_counter!(
        "procap_packet_bytes_total",
        "Captured payload bytes across processed packets"
    );
    describe_counter!(
        "procap_lost_samples_total",
        "Samples the kernel overwrote before they were read"
    );
    describe_counter!(
        "procap_decode_failures_total",
        "Records that failed to decode and were dropped"
    );
    describe_counter!("procap_sink_errors_total", "Failed sink writes or flushes");
    describe_gauge!("procap_tracked_processes", "Processes held in the process cache");

    info!("Prometheus metrics listening on {}", addr);
    Ok(())
}

pub fn record_processed(bytes: u64) {
    counter!("procap_packets_processed_total").increment(1);
    counter!("procap_packet_bytes_total").increment(bytes);
}

pub fn record_lost(kind: EventKind, count: u64) {
    counter!("procap_lost_samples_total", "event_type" => kind.as_str()).increment(count);
}

pub fn record_decode_failure(kind: EventKind) {
    counter!("procap_decode_failures_total", "event_type" => kind.as_str()).increment(1);
}

/// Record a sink failure; `op` is "write" or "flush".
pub fn record_sink_error(sink: &str, op: &'static str) {
    counter!("procap_sink_errors_total", "sink" => sink.to_string(), "op" => op).increment(1);
}

pub fn set_tracked_processes(count: usize) {
    gauge!("procap_tracked_processes").set(count as f64);
}
