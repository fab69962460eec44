use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "procap")]
#[command(about = "Packet capture annotated with the process that sent or received each packet")]
#[command(version)]
pub struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Capture packets until the count is reached or Ctrl-C
    Capture(CaptureArgs),
}

#[derive(Debug, Parser)]
pub struct CaptureArgs {
    /// Compiled eBPF object with the tc classifiers and sched tracepoints
    #[arg(long, default_value = "procap.bpf.o")]
    pub bpf_object: PathBuf,

    /// Interface to capture on (repeatable); all interfaces when omitted
    #[arg(short, long = "interface")]
    pub interfaces: Vec<String>,

    /// Exit after receiving this many packets (0 = unlimited)
    #[arg(short = 'c', long, default_value_t = 0)]
    pub count: u64,

    /// Output sink (repeatable): "stdout" (default), "text:PATH", "json:PATH"
    #[arg(short = 'w', long = "write")]
    pub writers: Vec<String>,

    /// Bytes of each packet to capture; longer packets are truncated
    #[arg(short = 's', long, default_value_t = procap_agent::DEFAULT_SNAP_LEN)]
    pub snap_len: usize,

    /// Packet event queue capacity
    #[arg(long, default_value_t = procap_agent::ingest::DEFAULT_PACKET_QUEUE)]
    pub packet_queue: usize,

    /// Exec event queue capacity
    #[arg(long, default_value_t = procap_agent::ingest::DEFAULT_EXEC_QUEUE)]
    pub exec_queue: usize,

    /// Exit event queue capacity
    #[arg(long, default_value_t = procap_agent::ingest::DEFAULT_EXIT_QUEUE)]
    pub exit_queue: usize,

    /// Per-CPU perf buffer size, in pages
    #[arg(long, default_value_t = procap_agent::source::DEFAULT_PAGES_PER_CPU)]
    pub pages_per_cpu: usize,

    /// Wait this long before writing the first packet
    #[arg(long, default_value_t = 0)]
    pub delay_ms: u64,

    /// Log a capture status line every N seconds (0 = off)
    #[arg(long, default_value_t = 0)]
    pub status_interval: u64,

    /// Prometheus metrics HTTP port
    #[cfg(feature = "prometheus")]
    #[arg(long, default_value_t = 9184)]
    pub metrics_port: u16,
}
