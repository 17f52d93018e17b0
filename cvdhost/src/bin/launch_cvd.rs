//! Launches one virtual device instance and supervises it until it is
//! stopped over its control socket, by SIGINT/SIGTERM, or a member exits.

use std::path::PathBuf;

use clap::Parser;

use cvdhost::config::LauncherConfig;
use cvdhost::flags;
use cvdhost::logging::{LogOptions, init_logging, log_fatal};
use cvdhost::supervisor::Supervisor;
use cvdhost_shared::errors::CvdResult;
use cvdhost_shared::propagate;

#[derive(Parser, Debug)]
#[command(name = "launch_cvd", about = "Launch and supervise a virtual device instance")]
struct Cli {
    /// JSON launcher configuration. Every field is optional.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory for `launcher.log`. Defaults to the instance root.
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

fn load_config(cli: &Cli) -> CvdResult<LauncherConfig> {
    match &cli.config {
        Some(path) => Ok(propagate!(LauncherConfig::load(path))),
        None => {
            let config = LauncherConfig::default();
            propagate!(config.validate());
            Ok(config)
        }
    }
}

fn run(config: LauncherConfig) -> CvdResult<()> {
    let supervisor = propagate!(Supervisor::new(config));
    let instance = propagate!(supervisor.launch());

    let stop = instance.stop_handle();
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        propagate!(
            signal_hook::flag::register(signal, std::sync::Arc::clone(&stop)),
            "installing handler for signal {}",
            signal
        );
    }

    let resources = instance.resources();
    tracing::info!(
        instance_id = instance.id(),
        adb_port = resources.adb_port.value(),
        vsock_cid = resources.vsock_cid.value(),
        signaling_port = resources.signaling_port(),
        control_socket = %instance.layout().control_socket.display(),
        "Virtual device launched"
    );
    propagate!(instance.wait());
    Ok(())
}

fn main() {
    let cli = Cli::parse_from(flags::args());
    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(err) => {
            let _guard = init_logging(LogOptions::stderr_only());
            log_fatal(&err);
            std::process::exit(1);
        }
    };

    let log_dir = cli.log_dir.clone().unwrap_or_else(|| config.instance_root.clone());
    let guard = init_logging(LogOptions::with_file(log_dir, "launcher.log"));
    let result = run(config);
    if let Err(err) = &result {
        log_fatal(err);
    }
    drop(guard);
    std::process::exit(if result.is_ok() { 0 } else { 1 });
}
