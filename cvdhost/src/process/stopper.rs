//! Strategies for stopping a [`Subprocess`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::sys::signal::Signal;

use super::subprocess::Subprocess;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopperResult {
    /// The child could not be signalled.
    StopFailure,
    /// The child was stopped, but not gracefully.
    StopCrash,
    StopSuccess,
}

/// Shared stop strategy invoked by [`Subprocess::stop`].
pub type Stopper = Arc<dyn Fn(&mut Subprocess) -> StopperResult + Send + Sync>;

/// SIGKILL the child, or its whole group when it leads one.
pub fn kill_subprocess(subprocess: &mut Subprocess) -> StopperResult {
    if subprocess.pid() <= 0 {
        return StopperResult::StopFailure;
    }
    let sent = if subprocess.leads_group() {
        subprocess.send_signal_to_group(Signal::SIGKILL)
    } else {
        subprocess.send_signal(Signal::SIGKILL)
    };
    match sent {
        Ok(()) => StopperResult::StopSuccess,
        Err(err) => {
            tracing::error!(name = %subprocess.name(), pid = subprocess.pid(), "Kill failed: {}", err);
            StopperResult::StopFailure
        }
    }
}

/// Try `nice` first and fall back to [`kill_subprocess`].
///
/// A successful fallback reports [`StopperResult::StopCrash`].
pub fn kill_subprocess_fallback(nice: Stopper) -> Stopper {
    Arc::new(move |subprocess: &mut Subprocess| {
        if nice(subprocess) == StopperResult::StopSuccess {
            return StopperResult::StopSuccess;
        }
        tracing::warn!(
            name = %subprocess.name(),
            pid = subprocess.pid(),
            "Graceful stop failed, killing"
        );
        match kill_subprocess(subprocess) {
            StopperResult::StopSuccess => StopperResult::StopCrash,
            other => other,
        }
    })
}

/// Send `signal` and wait up to `timeout` for the child to terminate.
///
/// The child is not reaped, so the owner can still `wait` for its status.
pub fn graceful_stopper(signal: Signal, timeout: Duration) -> Stopper {
    Arc::new(move |subprocess: &mut Subprocess| {
        let sent = if subprocess.leads_group() {
            subprocess.send_signal_to_group(signal)
        } else {
            subprocess.send_signal(signal)
        };
        if let Err(err) = sent {
            tracing::warn!(name = %subprocess.name(), "Sending {} failed: {}", signal, err);
            return StopperResult::StopFailure;
        }
        let deadline = Instant::now() + timeout;
        loop {
            match subprocess.wait_with(libc::WEXITED | libc::WNOHANG | libc::WNOWAIT) {
                Ok(Some(info)) if info.terminated() => return StopperResult::StopSuccess,
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(name = %subprocess.name(), "Polling for exit failed: {}", err);
                    return StopperResult::StopFailure;
                }
            }
            if Instant::now() >= deadline {
                return StopperResult::StopFailure;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    })
}
