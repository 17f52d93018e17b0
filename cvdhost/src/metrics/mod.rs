//! Device event drain over a System V message queue.

pub mod queue;
pub mod sink;

pub use queue::{DEVICE_MESSAGE_TYPE, MAX_MESSAGE_SIZE, SysVMessageQueue};
pub use sink::{MetricEvent, MetricsEmitter, MetricsSink, MetricsSinkHandle, TracingEmitter};
