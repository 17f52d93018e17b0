//! Drains device events from the instance's System V message queue.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use cvdhost::flags;
use cvdhost::logging::{LogOptions, init_logging, log_fatal};
use cvdhost::metrics::{MetricsSink, SysVMessageQueue, TracingEmitter};
use cvdhost_shared::errors::CvdResult;
use cvdhost_shared::propagate;

#[derive(Parser, Debug)]
#[command(name = "metrics_drain", about = "Device event drain")]
struct Cli {
    /// Directory holding the queue key file.
    #[arg(long)]
    queue_dir: PathBuf,
}

fn run(cli: &Cli) -> CvdResult<()> {
    let queue = propagate!(SysVMessageQueue::for_directory(&cli.queue_dir));
    tracing::info!(queue = queue.id(), dir = %cli.queue_dir.display(), "Metrics drain listening");
    let sink = MetricsSink::new(Arc::new(queue), Arc::new(TracingEmitter));
    let handle = propagate!(sink.start());
    propagate!(handle.join());
    Ok(())
}

fn main() {
    let cli = Cli::parse_from(flags::args());
    let guard = init_logging(LogOptions::stderr_only());
    let result = run(&cli);
    if let Err(err) = &result {
        log_fatal(err);
    }
    drop(guard);
    std::process::exit(if result.is_ok() { 0 } else { 1 });
}
