use anyhow::Result;
use procap_agent::{AgentConfig, IngestConfig};
use std::time::Duration;

use crate::cli::CaptureArgs;

fn agent_config(args: CaptureArgs) -> AgentConfig {
    let defaults = AgentConfig::default();
    AgentConfig {
        bpf_object: args.bpf_object,
        interfaces: args.interfaces,
        count: args.count,
        writers: args.writers,
        snap_len: args.snap_len,
        ingest: IngestConfig {
            packet_queue: args.packet_queue,
            exec_queue: args.exec_queue,
            exit_queue: args.exit_queue,
            pages_per_cpu: args.pages_per_cpu,
            ..IngestConfig::default()
        },
        delay: Duration::from_millis(args.delay_ms),
        status_interval: (args.status_interval > 0)
            .then(|| Duration::from_secs(args.status_interval)),
        #[cfg(feature = "prometheus")]
        metrics_port: args.metrics_port,
        ..defaults
    }
}

pub fn run(args: CaptureArgs) -> Result<()> {
    let config = agent_config(args);
    let rt = tokio::runtime::Runtime::new()?;
    let summary = rt.block_on(procap_agent::run_agent(config))?;
    eprintln!("{}", summary.line());
    Ok(())
}
