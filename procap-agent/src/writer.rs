//! Packet sinks.
//!
//! Sinks are synchronous: the consumer calls `write` then `flush` on each
//! one in configuration order for every packet, and `close` once on
//! shutdown. A failing sink only affects itself.

use crate::enrich::{format_clock, EnrichedPacket};
use anyhow::{bail, Context, Result};
use procap_types::userspace::Direction;
use std::fs::OpenOptions;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

pub trait PacketWriter: Send {
    /// Label used in logs and metrics.
    fn name(&self) -> &str;

    fn write(&mut self, packet: &EnrichedPacket) -> Result<()>;

    fn flush(&mut self) -> Result<()>;

    /// Flush and release the sink. Called once, after the last write.
    fn close(&mut self) -> Result<()> {
        self.flush()
    }
}

/// One human-readable line per packet.
pub struct TextWriter<W: Write + Send> {
    name: String,
    out: W,
}

impl<W: Write + Send> TextWriter<W> {
    pub fn new(name: impl Into<String>, out: W) -> Self {
        Self {
            name: name.into(),
            out,
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

fn direction_label(direction: Direction) -> &'static str {
    match direction {
        Direction::Ingress => "In",
        Direction::Egress => "Out",
        Direction::Unknown(_) => "?",
    }
}

/// `HH:MM:SS.ffffff eth0 Out curl.1234 [cgroup] length 74, captured 74`
pub fn format_text_line(packet: &EnrichedPacket) -> String {
    let process = match &packet.process {
        Some(info) => format!("{}.{}", info.command_line(), packet.pid),
        None => format!("pid.{}", packet.pid),
    };
    let mut line = format!(
        "{} {} {} {}",
        format_clock(packet.timestamp_ns),
        packet.device.name,
        direction_label(packet.direction),
        process
    );
    if !packet.cgroup_name.is_empty() {
        line.push_str(&format!(" [{}]", packet.cgroup_name));
    }
    line.push_str(&format!(
        " length {}, captured {}",
        packet.wire_len,
        packet.payload.len()
    ));
    line
}

impl<W: Write + Send> PacketWriter for TextWriter<W> {
    fn name(&self) -> &str {
        &self.name
    }

    fn write(&mut self, packet: &EnrichedPacket) -> Result<()> {
        writeln!(self.out, "{}", format_text_line(packet))
            .with_context(|| format!("{}: write failed", self.name))
    }

    fn flush(&mut self) -> Result<()> {
        self.out
            .flush()
            .with_context(|| format!("{}: flush failed", self.name))
    }
}

/// Newline-delimited JSON, one object per packet.
pub struct JsonLineWriter<W: Write + Send> {
    name: String,
    out: W,
}

impl<W: Write + Send> JsonLineWriter<W> {
    pub fn new(name: impl Into<String>, out: W) -> Self {
        Self {
            name: name.into(),
            out,
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write + Send> PacketWriter for JsonLineWriter<W> {
    fn name(&self) -> &str {
        &self.name
    }

    fn write(&mut self, packet: &EnrichedPacket) -> Result<()> {
        serde_json::to_writer(&mut self.out, packet)
            .with_context(|| format!("{}: encode failed", self.name))?;
        self.out
            .write_all(b"\n")
            .with_context(|| format!("{}: write failed", self.name))
    }

    fn flush(&mut self) -> Result<()> {
        self.out
            .flush()
            .with_context(|| format!("{}: flush failed", self.name))
    }
}

/// Where a sink writes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SinkSpec {
    Stdout,
    Text(PathBuf),
    Json(PathBuf),
}

impl SinkSpec {
    /// Parse a sink specification.
    /// Formats: "stdout", "text:PATH", "json:PATH"
    pub fn parse(spec: &str) -> Result<Self> {
        if spec == "stdout" || spec == "-" {
            Ok(SinkSpec::Stdout)
        } else if let Some(path) = spec.strip_prefix("text:") {
            Ok(SinkSpec::Text(non_empty(spec, path)?))
        } else if let Some(path) = spec.strip_prefix("json:") {
            Ok(SinkSpec::Json(non_empty(spec, path)?))
        } else {
            bail!(
                "unknown sink '{}', expected stdout, text:PATH or json:PATH",
                spec
            )
        }
    }

    pub fn open(&self) -> Result<Box<dyn PacketWriter>> {
        Ok(match self {
            SinkSpec::Stdout => Box::new(TextWriter::new("stdout", io::stdout())),
            SinkSpec::Text(path) => Box::new(TextWriter::new(
                format!("text:{}", path.display()),
                create(path)?,
            )),
            SinkSpec::Json(path) => Box::new(JsonLineWriter::new(
                format!("json:{}", path.display()),
                create(path)?,
            )),
        })
    }
}

fn non_empty(spec: &str, path: &str) -> Result<PathBuf> {
    if path.is_empty() {
        bail!("sink '{}' is missing a path", spec);
    }
    Ok(PathBuf::from(path))
}

fn create(path: &Path) -> Result<BufWriter<std::fs::File>> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    Ok(BufWriter::new(file))
}

/// Parse and open every sink, in order. No specs means stdout.
pub fn open_writers<S: AsRef<str>>(specs: &[S]) -> Result<Vec<Box<dyn PacketWriter>>> {
    if specs.is_empty() {
        return Ok(vec![SinkSpec::Stdout.open()?]);
    }
    specs
        .iter()
        .map(|spec| SinkSpec::parse(spec.as_ref())?.open())
        .collect()
}
