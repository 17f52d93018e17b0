//! Forwards the guest serial console to a pty published at `-console_path`.

use std::os::fd::RawFd;
use std::path::PathBuf;

use clap::Parser;
use nix::fcntl::OFlag;

use cvdhost::fd::ScopedFd;
use cvdhost::flags;
use cvdhost::logging::{LogOptions, init_logging, log_fatal};
use cvdhost::relay::ConsoleForwarder;
use cvdhost_shared::errors::{CvdResult, ErrorKind};
use cvdhost_shared::{ensure, errno_err, propagate};

#[derive(Parser, Debug)]
#[command(name = "console_forwarder", about = "Serial console to pty forwarder")]
struct Cli {
    /// Descriptor the forwarder writes guest input to.
    #[arg(long, allow_negative_numbers = true)]
    console_in_fd: RawFd,

    /// Descriptor carrying guest output.
    #[arg(long, allow_negative_numbers = true)]
    console_out_fd: RawFd,

    /// Stable path of the client pty symlink.
    #[arg(long)]
    console_path: PathBuf,

    /// File recording all console output.
    #[arg(long)]
    console_log: PathBuf,

    /// Optional kernel-log pipe to copy guest output into.
    #[arg(long, allow_negative_numbers = true)]
    kernel_log_fd: Option<RawFd>,
}

/// Take over an inherited descriptor as a close-on-exec copy.
fn adopt(fd: RawFd, flag: &str) -> CvdResult<ScopedFd> {
    ensure!(fd >= 0, kind = ErrorKind::Config, "-{} must be non-negative, got {}", flag, fd);
    // SAFETY: F_GETFD only inspects the descriptor.
    if unsafe { libc::fcntl(fd, libc::F_GETFD) } < 0 {
        return Err(errno_err!("-{}={} is not an open descriptor", flag, fd));
    }
    // SAFETY: the descriptor was handed to this process and nothing else owns it.
    let original = unsafe { ScopedFd::from_raw(fd) };
    Ok(propagate!(original.dup(), "duplicating -{}", flag))
}

fn run(cli: &Cli) -> CvdResult<()> {
    let console_in = propagate!(adopt(cli.console_in_fd, "console_in_fd"));
    let console_out = propagate!(adopt(cli.console_out_fd, "console_out_fd"));
    let log = propagate!(
        ScopedFd::open(&cli.console_log, OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_APPEND, 0o666),
        "opening {}",
        cli.console_log.display()
    );

    let mut forwarder = ConsoleForwarder::new(&cli.console_path, console_in, console_out, log);
    if let Some(fd) = cli.kernel_log_fd {
        forwarder = forwarder.with_kernel_log(propagate!(adopt(fd, "kernel_log_fd")));
    }
    let handle = propagate!(forwarder.start());
    tracing::info!(path = %cli.console_path.display(), "Console forwarder running");
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
