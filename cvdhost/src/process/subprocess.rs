//! Handle to a started child process.

use std::fmt;

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{Id, WaitPidFlag, WaitStatus, waitid, waitpid};
use nix::unistd::Pid;

use cvdhost_shared::errors::{CvdResult, ErrorKind};
use cvdhost_shared::{ensure, propagate};

use super::stopper::{Stopper, StopperResult};

/// `waitid` outcome for one child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitInfo {
    pub pid: i32,
    /// `CLD_EXITED`, `CLD_KILLED`, `CLD_DUMPED`, `CLD_STOPPED`, ...
    pub code: i32,
    /// Exit status or signal number, depending on `code`.
    pub status: i32,
}

impl WaitInfo {
    /// `None` for `StillAlive`, the `WNOHANG` answer when nothing changed.
    pub fn from_status(status: WaitStatus) -> Option<Self> {
        let (pid, code, status) = match status {
            WaitStatus::StillAlive => return None,
            WaitStatus::Exited(pid, code) => (pid, libc::CLD_EXITED, code),
            WaitStatus::Signaled(pid, sig, true) => (pid, libc::CLD_DUMPED, sig as i32),
            WaitStatus::Signaled(pid, sig, false) => (pid, libc::CLD_KILLED, sig as i32),
            WaitStatus::Stopped(pid, sig) => (pid, libc::CLD_STOPPED, sig as i32),
            WaitStatus::Continued(pid) => (pid, libc::CLD_CONTINUED, libc::SIGCONT),
            WaitStatus::PtraceEvent(pid, sig, _) => (pid, libc::CLD_TRAPPED, sig as i32),
            WaitStatus::PtraceSyscall(pid) => (pid, libc::CLD_TRAPPED, libc::SIGTRAP),
        };
        Some(Self {
            pid: pid.as_raw(),
            code,
            status,
        })
    }

    pub fn exit_code(&self) -> Option<i32> {
        (self.code == libc::CLD_EXITED).then_some(self.status)
    }

    pub fn signal(&self) -> Option<i32> {
        matches!(self.code, libc::CLD_KILLED | libc::CLD_DUMPED).then_some(self.status)
    }

    /// True for exits and deaths by signal.
    pub fn terminated(&self) -> bool {
        self.exit_code().is_some() || self.signal().is_some()
    }

    pub fn success(&self) -> bool {
        self.exit_code() == Some(0)
    }

    /// Exit code, or the negated signal number.
    pub fn as_status(&self) -> i32 {
        match (self.exit_code(), self.signal()) {
            (Some(code), _) => code,
            (None, Some(signal)) => -signal,
            (None, None) => 0,
        }
    }
}

impl fmt::Display for WaitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.exit_code(), self.signal()) {
            (Some(code), _) => write!(f, "exited with code {}", code),
            (None, Some(sig)) => write!(f, "killed by signal {}", sig),
            _ => write!(f, "changed state (code {}, status {})", self.code, self.status),
        }
    }
}

/// A started child.
///
/// Dropping a `Subprocess` neither kills nor reaps the child; call
/// [`stop`](Self::stop) and [`wait`](Self::wait) for that.
pub struct Subprocess {
    pid: i32,
    name: String,
    in_group: bool,
    waited: bool,
    stopper: Stopper,
}

impl fmt::Debug for Subprocess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subprocess")
            .field("pid", &self.pid)
            .field("name", &self.name)
            .field("waited", &self.waited)
            .finish()
    }
}

impl Subprocess {
    pub(crate) fn new(pid: i32, name: String, in_group: bool, stopper: Stopper) -> Self {
        Self {
            pid,
            name,
            in_group,
            waited: false,
            stopper,
        }
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the child was started as the leader of its own group.
    pub fn in_group(&self) -> bool {
        self.in_group
    }

    /// Whether the child has been reaped.
    pub fn waited(&self) -> bool {
        self.waited
    }

    /// Block until the child terminates and reap it.
    ///
    /// Returns the exit code, or the negated number of the terminating signal.
    /// Waiting twice is an [`ErrorKind::Invariant`] error.
    pub fn wait(&mut self) -> CvdResult<i32> {
        ensure!(
            !self.waited,
            kind = ErrorKind::Invariant,
            "{} (pid {}) was already waited for",
            self.name,
            self.pid
        );
        let status = loop {
            match waitpid(Pid::from_raw(self.pid), None) {
                Err(Errno::EINTR) => continue,
                result => {
                    break propagate!(result, "waitpid({}) for {} failed", self.pid, self.name);
                }
            }
        };
        self.waited = true;
        let code = match status {
            WaitStatus::Exited(_, code) => code,
            WaitStatus::Signaled(_, sig, _) => -(sig as i32),
            other => {
                tracing::warn!(name = %self.name, pid = self.pid, ?other, "Unexpected wait status");
                0
            }
        };
        if code != 0 {
            tracing::debug!(name = %self.name, pid = self.pid, code, "Subprocess ended");
        }
        Ok(code)
    }

    /// `waitid(P_PID, pid, flags)`.
    ///
    /// Returns `None` when `WNOHANG` is set and nothing changed. Reaps (and
    /// marks the subprocess waited) unless `WNOWAIT` is set.
    pub fn wait_with(&mut self, flags: i32) -> CvdResult<Option<WaitInfo>> {
        ensure!(
            !self.waited,
            kind = ErrorKind::Invariant,
            "{} (pid {}) was already waited for",
            self.name,
            self.pid
        );
        let status = loop {
            match waitid(Id::Pid(Pid::from_raw(self.pid)), WaitPidFlag::from_bits_truncate(flags)) {
                Err(Errno::EINTR) => continue,
                result => {
                    break propagate!(result, "waitid({}) for {} failed", self.pid, self.name);
                }
            }
        };
        let Some(result) = WaitInfo::from_status(status) else {
            return Ok(None);
        };
        if result.terminated() && flags & libc::WNOWAIT == 0 {
            self.waited = true;
        }
        Ok(Some(result))
    }

    /// Run the configured stopper. Does not reap.
    pub fn stop(&mut self) -> StopperResult {
        if self.waited {
            return StopperResult::StopSuccess;
        }
        let stopper = std::sync::Arc::clone(&self.stopper);
        stopper(self)
    }

    pub fn send_signal(&self, sig: Signal) -> CvdResult<()> {
        ensure!(
            !self.waited,
            kind = ErrorKind::Invariant,
            "signal {} to reaped {}",
            sig,
            self.name
        );
        propagate!(
            signal::kill(Pid::from_raw(self.pid), sig),
            "sending {} to {} (pid {})",
            sig,
            self.name,
            self.pid
        );
        Ok(())
    }

    /// Signal the child's whole process group. The child must lead it.
    pub fn send_signal_to_group(&self, sig: Signal) -> CvdResult<()> {
        ensure!(
            !self.waited,
            kind = ErrorKind::Invariant,
            "signal {} to reaped {}",
            sig,
            self.name
        );
        let pgid = propagate!(nix::unistd::getpgid(Some(Pid::from_raw(self.pid))));
        ensure!(
            pgid.as_raw() == self.pid,
            kind = ErrorKind::Invariant,
            "{} (pid {}) is not a process group leader",
            self.name,
            self.pid
        );
        propagate!(
            signal::killpg(pgid, sig),
            "sending {} to group of {}",
            sig,
            self.name
        );
        Ok(())
    }

    /// Whether the child leads its own process group.
    pub fn leads_group(&self) -> bool {
        nix::unistd::getpgid(Some(Pid::from_raw(self.pid)))
            .is_ok_and(|pgid| pgid.as_raw() == self.pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{Command, SubprocessOptions};

    #[test]
    fn test_status_mapping() {
        let pid = Pid::from_raw(42);
        assert_eq!(WaitInfo::from_status(WaitStatus::StillAlive), None);
        let exited = WaitInfo::from_status(WaitStatus::Exited(pid, 3)).unwrap();
        assert_eq!((exited.pid, exited.exit_code(), exited.signal()), (42, Some(3), None));
        let dumped = WaitInfo::from_status(WaitStatus::Signaled(pid, Signal::SIGSEGV, true)).unwrap();
        assert_eq!(dumped.as_status(), -libc::SIGSEGV);
        let stopped = WaitInfo::from_status(WaitStatus::Stopped(pid, Signal::SIGSTOP)).unwrap();
        assert!(!stopped.terminated());
    }

    #[test]
    fn test_wait_returns_exit_code() {
        let mut process = Command::new("/bin/sh")
            .add_parameters(["-c", "exit 3"])
            .start(SubprocessOptions::default())
            .unwrap();
        assert_eq!(process.wait().unwrap(), 3);
        assert!(process.waited());
    }

    #[test]
    fn test_double_wait_is_invariant_breach() {
        let mut process = Command::new("/bin/true")
            .start(SubprocessOptions::default())
            .unwrap();
        assert_eq!(process.wait().unwrap(), 0);
        let err = process.wait().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invariant);
    }

    #[test]
    fn test_signal_reports_negative_status() {
        let mut process = Command::new("/bin/sleep")
            .add_parameter(30)
            .start(SubprocessOptions::default())
            .unwrap();
        process.send_signal(Signal::SIGTERM).unwrap();
        assert_eq!(process.wait().unwrap(), -libc::SIGTERM);
    }

    #[test]
    fn test_wait_with_nohang_then_reap() {
        let mut process = Command::new("/bin/sleep")
            .add_parameter(30)
            .start(SubprocessOptions::default())
            .unwrap();
        assert!(process
            .wait_with(libc::WEXITED | libc::WNOHANG)
            .unwrap()
            .is_none());
        process.send_signal(Signal::SIGKILL).unwrap();
        let peek = process
            .wait_with(libc::WEXITED | libc::WNOWAIT)
            .unwrap()
            .unwrap();
        assert_eq!(peek.signal(), Some(libc::SIGKILL));
        assert!(!process.waited());
        let info = process.wait_with(libc::WEXITED).unwrap().unwrap();
        assert_eq!(info.as_status(), -libc::SIGKILL);
        assert!(process.waited());
    }

    #[test]
    fn test_group_signal_requires_leader() {
        let mut plain = Command::new("/bin/sleep")
            .add_parameter(30)
            .start(SubprocessOptions::default())
            .unwrap();
        assert!(!plain.leads_group());
        let err = plain.send_signal_to_group(Signal::SIGTERM).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invariant);
        plain.send_signal(Signal::SIGKILL).unwrap();
        plain.wait().unwrap();

        let mut leader = Command::new("/bin/sleep")
            .add_parameter(30)
            .start(SubprocessOptions::default().in_group(true))
            .unwrap();
        // setsid runs in the child after fork; wait until it took effect.
        for _ in 0..100 {
            if leader.leads_group() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        leader.send_signal_to_group(Signal::SIGTERM).unwrap();
        assert_eq!(leader.wait().unwrap(), -libc::SIGTERM);
    }

    #[test]
    fn test_stop_uses_default_kill() {
        let mut process = Command::new("/bin/sleep")
            .add_parameter(30)
            .start(SubprocessOptions::default())
            .unwrap();
        assert_eq!(process.stop(), StopperResult::StopSuccess);
        assert_eq!(process.wait().unwrap(), -libc::SIGKILL);
    }
}
