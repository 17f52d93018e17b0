//! The group of subprocesses making up one instance.

use nix::sys::signal::Signal;
use parking_lot::Mutex;

use cvdhost_shared::errors::CvdResult;

use crate::process::{StopperResult, Subprocess, WaitInfo};

/// First member seen terminating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitReport {
    pub name: String,
    pub info: WaitInfo,
}

/// Started subprocesses in start order.
#[derive(Debug, Default)]
pub struct Cohort {
    members: Mutex<Vec<Subprocess>>,
}

impl Cohort {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, subprocess: Subprocess) {
        tracing::info!(name = %subprocess.name(), pid = subprocess.pid(), "Cohort member started");
        self.members.lock().push(subprocess);
    }

    pub fn len(&self) -> usize {
        self.members.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `(name, pid)` of members not yet reaped.
    pub fn members(&self) -> Vec<(String, i32)> {
        self.members
            .lock()
            .iter()
            .filter(|member| !member.waited())
            .map(|member| (member.name().to_string(), member.pid()))
            .collect()
    }

    /// Signal every live member, its whole group when it leads one.
    ///
    /// Every member is attempted; the first failure is returned.
    pub fn signal_all(&self, sig: Signal) -> CvdResult<()> {
        let members = self.members.lock();
        let mut first_error = None;
        for member in members.iter().filter(|member| !member.waited()) {
            let sent = if member.in_group() && member.leads_group() {
                member.send_signal_to_group(sig)
            } else {
                member.send_signal(sig)
            };
            if let Err(err) = sent {
                tracing::warn!(name = %member.name(), "Signal {} failed: {}", sig, err);
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Check for a terminated member without blocking. The member is reaped.
    pub fn poll_exit(&self) -> CvdResult<Option<ExitReport>> {
        let mut members = self.members.lock();
        for member in members.iter_mut().filter(|member| !member.waited()) {
            let info = member.wait_with(libc::WEXITED | libc::WNOHANG)?;
            if let Some(info) = info.filter(WaitInfo::terminated) {
                return Ok(Some(ExitReport {
                    name: member.name().to_string(),
                    info,
                }));
            }
        }
        Ok(None)
    }

    /// Stop members in reverse start order and reap them.
    ///
    /// Returns how many needed more than their graceful stop.
    pub fn stop_all(&self) -> usize {
        let mut members = self.members.lock();
        let mut crashed = 0;
        for member in members.iter_mut().rev().filter(|member| !member.waited()) {
            match member.stop() {
                StopperResult::StopSuccess => {}
                StopperResult::StopCrash => crashed += 1,
                StopperResult::StopFailure => {
                    crashed += 1;
                    tracing::error!(name = %member.name(), pid = member.pid(), "Could not stop");
                    continue;
                }
            }
            match member.wait() {
                Ok(status) => tracing::info!(name = %member.name(), status, "Cohort member stopped"),
                Err(err) => tracing::warn!(name = %member.name(), "Reaping failed: {}", err),
            }
        }
        crashed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    use crate::process::{Command, SubprocessOptions, graceful_stopper, kill_subprocess_fallback};

    fn sleeper(name: &str) -> Subprocess {
        Command::new("/bin/sleep")
            .set_name(name)
            .add_parameter(30)
            .set_shared_stopper(kill_subprocess_fallback(graceful_stopper(
                Signal::SIGTERM,
                Duration::from_secs(2),
            )))
            .start(SubprocessOptions::default().in_group(true))
            .unwrap()
    }

    #[test]
    fn test_poll_exit_reports_first_exit() {
        let cohort = Cohort::new();
        cohort.push(sleeper("long"));
        cohort.push(
            Command::new("/bin/sh")
                .set_name("short")
                .add_parameters(["-c", "exit 7"])
                .start(SubprocessOptions::default())
                .unwrap(),
        );

        let deadline = Instant::now() + Duration::from_secs(10);
        let report = loop {
            if let Some(report) = cohort.poll_exit().unwrap() {
                break report;
            }
            assert!(Instant::now() < deadline, "short member never exited");
            std::thread::sleep(Duration::from_millis(20));
        };
        assert_eq!(report.name, "short");
        assert_eq!(report.info.exit_code(), Some(7));
        assert_eq!(cohort.members().len(), 1);

        assert_eq!(cohort.stop_all(), 0);
        assert!(cohort.members().is_empty());
    }

    #[test]
    fn test_signal_all_pauses_and_continues() {
        let cohort = Cohort::new();
        cohort.push(sleeper("a"));
        cohort.push(sleeper("b"));
        // Let both children become group leaders.
        std::thread::sleep(Duration::from_millis(200));
        cohort.signal_all(Signal::SIGSTOP).unwrap();
        cohort.signal_all(Signal::SIGCONT).unwrap();
        assert!(cohort.poll_exit().unwrap().is_none());
        assert_eq!(cohort.len(), 2);
        cohort.stop_all();
        assert!(cohort.members().is_empty());
    }
}
