//! Thread that drains the metrics queue and dispatches each event.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use cvdhost_shared::errors::CvdResult;
use cvdhost_shared::{propagate, stack_err};

use super::queue::{DEVICE_MESSAGE_TYPE, MAX_MESSAGE_SIZE, SysVMessageQueue};

/// One record from the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetricEvent {
    VmStart,
    VmStop,
    DeviceBoot,
    LockScreen,
    /// Any other tag is the command line that launched the device.
    LaunchCommand(String),
}

impl MetricEvent {
    pub fn parse(raw: &[u8]) -> Self {
        let text = String::from_utf8_lossy(raw);
        let tag = text.trim_end_matches('\0').trim();
        match tag {
            "VMStart" => Self::VmStart,
            "VMStop" => Self::VmStop,
            "DeviceBoot" => Self::DeviceBoot,
            "LockScreen" => Self::LockScreen,
            other => Self::LaunchCommand(other.to_string()),
        }
    }

    pub fn tag(&self) -> &str {
        match self {
            Self::VmStart => "VMStart",
            Self::VmStop => "VMStop",
            Self::DeviceBoot => "DeviceBoot",
            Self::LockScreen => "LockScreen",
            Self::LaunchCommand(command) => command,
        }
    }
}

/// Telemetry backend receiving parsed events.
pub trait MetricsEmitter: Send + Sync {
    fn emit(&self, event: &MetricEvent);
}

/// Emitter that records events as structured log lines.
#[derive(Debug, Default)]
pub struct TracingEmitter;

impl MetricsEmitter for TracingEmitter {
    fn emit(&self, event: &MetricEvent) {
        match event {
            MetricEvent::LaunchCommand(command) => {
                tracing::info!(target: "cvdhost::metrics", command = %command, "Launch command")
            }
            other => tracing::info!(target: "cvdhost::metrics", event = other.tag(), "Device event"),
        }
    }
}

pub struct MetricsSink {
    queue: Arc<SysVMessageQueue>,
    emitter: Arc<dyn MetricsEmitter>,
}

impl MetricsSink {
    pub fn new(queue: Arc<SysVMessageQueue>, emitter: Arc<dyn MetricsEmitter>) -> Self {
        Self { queue, emitter }
    }

    /// Receive and dispatch until the queue is removed.
    pub fn run(&self) -> CvdResult<()> {
        loop {
            let raw = match self.queue.receive(MAX_MESSAGE_SIZE, DEVICE_MESSAGE_TYPE, true) {
                Ok(Some(raw)) => raw,
                Ok(None) => continue,
                Err(err) if matches!(err.errno(), Some(libc::EIDRM) | Some(libc::EINVAL)) => {
                    tracing::info!(queue = self.queue.id(), "Metrics queue removed, sink exiting");
                    return Ok(());
                }
                Err(err) => return Err(err),
            };
            let event = MetricEvent::parse(&raw);
            tracing::debug!(?event, "Metrics event");
            self.emitter.emit(&event);
        }
    }

    /// Run on a dedicated thread.
    pub fn start(self) -> CvdResult<MetricsSinkHandle> {
        let thread = propagate!(
            thread::Builder::new()
                .name("metrics-sink".into())
                .spawn(move || self.run()),
            "spawning metrics sink"
        );
        Ok(MetricsSinkHandle { thread })
    }
}

pub struct MetricsSinkHandle {
    thread: JoinHandle<CvdResult<()>>,
}

impl MetricsSinkHandle {
    /// Block until the sink ends, which only happens when the queue goes away.
    pub fn join(self) -> CvdResult<()> {
        match self.thread.join() {
            Ok(result) => result,
            Err(_) => Err(stack_err!("metrics sink panicked")),
        }
    }
}
