//! A launched instance and the hooks its coordinator drives.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use nix::sys::signal::Signal;
use serde::Serialize;

use cvdhost_shared::errors::{CvdResult, ErrorKind};
use cvdhost_shared::{ensure, propagate, stack_err};

use super::cohort::{Cohort, ExitReport};
use super::kernel_log::KernelLogDrain;
use super::launch::types::InstanceLayout;
use super::registry::{InstanceRegistry, InstanceStatus};
use super::resources::InstanceResources;
use crate::pipeline::PipelineMetrics;
use crate::snapshot::{CoordinatorHandle, LauncherHooks, SnapshotLatch};

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub const SNAPSHOT_META_FILE: &str = "snapshot_meta.json";

#[derive(Debug, Serialize)]
struct SnapshotMember {
    name: String,
    pid: i32,
}

#[derive(Debug, Serialize)]
struct SnapshotMeta {
    instance_id: u32,
    taken_at: DateTime<Utc>,
    members: Vec<SnapshotMember>,
}

/// [`LauncherHooks`] acting on a cohort.
///
/// Suspend stops every member (and its group) with SIGSTOP, resume sends
/// SIGCONT. `stop` only raises the flag [`RunningInstance::wait`] polls.
pub struct InstanceHooks {
    instance_id: u32,
    instance_dir: PathBuf,
    cohort: Arc<Cohort>,
    registry: InstanceRegistry,
    stop_requested: Arc<AtomicBool>,
}

impl InstanceHooks {
    pub fn new(
        instance_id: u32,
        instance_dir: PathBuf,
        cohort: Arc<Cohort>,
        registry: InstanceRegistry,
        stop_requested: Arc<AtomicBool>,
    ) -> Self {
        Self {
            instance_id,
            instance_dir,
            cohort,
            registry,
            stop_requested,
        }
    }

    fn snapshot_dir(&self, directory: &str) -> PathBuf {
        let path = Path::new(directory);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.instance_dir.join(path)
        }
    }
}

impl LauncherHooks for InstanceHooks {
    fn suspend(&self) -> CvdResult<()> {
        propagate!(self.cohort.signal_all(Signal::SIGSTOP), "pausing instance {}", self.instance_id);
        self.registry.set_status(self.instance_id, InstanceStatus::Suspended);
        Ok(())
    }

    fn resume(&self) -> CvdResult<()> {
        propagate!(self.cohort.signal_all(Signal::SIGCONT), "continuing instance {}", self.instance_id);
        self.registry.set_status(self.instance_id, InstanceStatus::Running);
        Ok(())
    }

    fn snapshot_take(&self, directory: &str) -> CvdResult<()> {
        ensure!(
            !directory.trim().is_empty(),
            kind = ErrorKind::Config,
            "snapshot directory is empty"
        );
        let dir = self.snapshot_dir(directory);
        propagate!(std::fs::create_dir_all(&dir), "creating {}", dir.display());
        let meta = SnapshotMeta {
            instance_id: self.instance_id,
            taken_at: Utc::now(),
            members: self
                .cohort
                .members()
                .into_iter()
                .map(|(name, pid)| SnapshotMember { name, pid })
                .collect(),
        };
        let json = propagate!(serde_json::to_vec_pretty(&meta));
        let path = dir.join(SNAPSHOT_META_FILE);
        propagate!(std::fs::write(&path, json), "writing {}", path.display());
        tracing::info!(instance_id = self.instance_id, dir = %dir.display(), "Snapshot taken");
        Ok(())
    }

    fn stop(&self) -> CvdResult<()> {
        tracing::info!(instance_id = self.instance_id, "Stop requested over control socket");
        self.stop_requested.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// A fully launched instance. Its reservations are held until it is dropped.
pub struct RunningInstance {
    pub(super) resources: InstanceResources,
    pub(super) layout: InstanceLayout,
    pub(super) cohort: Arc<Cohort>,
    pub(super) registry: InstanceRegistry,
    pub(super) latch: Arc<SnapshotLatch>,
    pub(super) stop_requested: Arc<AtomicBool>,
    pub(super) coordinator: Option<CoordinatorHandle>,
    pub(super) kernel_log: Option<KernelLogDrain>,
    pub(super) metrics: PipelineMetrics,
}

impl RunningInstance {
    pub fn id(&self) -> u32 {
        self.resources.id()
    }

    pub fn resources(&self) -> &InstanceResources {
        &self.resources
    }

    pub fn layout(&self) -> &InstanceLayout {
        &self.layout
    }

    pub fn status(&self) -> Option<InstanceStatus> {
        self.registry.status(self.id())
    }

    pub fn latch(&self) -> &Arc<SnapshotLatch> {
        &self.latch
    }

    pub fn launch_metrics(&self) -> &PipelineMetrics {
        &self.metrics
    }

    /// Flag that ends [`wait`](Self::wait) once set. Signal handlers may
    /// set it directly.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop_requested)
    }

    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    /// Block until a stop is requested or a member exits.
    ///
    /// A requested stop returns `Ok` after tearing the cohort down. A member
    /// exiting on its own is reported as an [`ErrorKind::ChildProcess`]
    /// error after the remaining members were stopped.
    pub fn wait(mut self) -> CvdResult<()> {
        let id = self.id();
        let exit = loop {
            if self.stop_requested.load(Ordering::SeqCst) {
                break None;
            }
            if let Some(report) = propagate!(self.cohort.poll_exit()) {
                break Some(report);
            }
            std::thread::sleep(EXIT_POLL_INTERVAL);
        };

        self.registry.set_status(id, InstanceStatus::Stopping);
        self.teardown();

        match exit {
            None => {
                self.registry.set_status(id, InstanceStatus::Stopped);
                tracing::info!(instance_id = id, "Instance stopped");
                Ok(())
            }
            Some(ExitReport { name, info }) => {
                self.registry.set_status(id, InstanceStatus::Failed);
                tracing::error!(instance_id = id, member = %name, "Cohort member {}", info);
                Err(stack_err!(
                    kind = ErrorKind::ChildProcess,
                    "{} of instance {} {}",
                    name,
                    id,
                    info
                ))
            }
        }
    }

    fn teardown(&mut self) {
        if self.latch.is_suspended() {
            // Stopped members would never see SIGTERM.
            if let Err(err) = self.cohort.signal_all(Signal::SIGCONT) {
                tracing::warn!("Continuing suspended cohort failed: {}", err);
            }
            self.latch.resume_and_notify();
        }
        let crashed = self.cohort.stop_all();
        if crashed > 0 {
            tracing::warn!(instance_id = self.id(), crashed, "Members needed SIGKILL");
        }
        if let Some(coordinator) = self.coordinator.take()
            && let Err(err) = coordinator.shutdown()
        {
            tracing::warn!("Snapshot coordinator ended with error: {}", err);
        }
        if let Some(drain) = self.kernel_log.take() {
            match drain.join() {
                Ok(bytes) => tracing::debug!(bytes, "Kernel log drained"),
                Err(err) => tracing::warn!("Kernel log drain failed: {}", err),
            }
        }
        if let Err(err) = std::fs::remove_file(&self.layout.control_socket)
            && err.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!("Removing control socket failed: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{Command, SubprocessOptions};

    fn hooks_with_sleeper(dir: &Path) -> (InstanceHooks, Arc<Cohort>, InstanceRegistry, Arc<AtomicBool>) {
        let cohort = Arc::new(Cohort::new());
        cohort.push(
            Command::new("/bin/sleep")
                .set_name("sleeper")
                .add_parameter(30)
                .start(SubprocessOptions::default())
                .unwrap(),
        );
        let registry = InstanceRegistry::new();
        registry.register(7).unwrap();
        let stop = Arc::new(AtomicBool::new(false));
        let hooks = InstanceHooks::new(
            7,
            dir.to_path_buf(),
            Arc::clone(&cohort),
            registry.clone(),
            Arc::clone(&stop),
        );
        (hooks, cohort, registry, stop)
    }

    #[test]
    fn test_suspend_resume_update_status() {
        let dir = tempfile::tempdir().unwrap();
        let (hooks, cohort, registry, _) = hooks_with_sleeper(dir.path());
        hooks.suspend().unwrap();
        assert_eq!(registry.status(7), Some(InstanceStatus::Suspended));
        hooks.resume().unwrap();
        assert_eq!(registry.status(7), Some(InstanceStatus::Running));
        cohort.stop_all();
    }

    #[test]
    fn test_snapshot_writes_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let (hooks, cohort, _, _) = hooks_with_sleeper(dir.path());
        hooks.snapshot_take("snap1").unwrap();

        let text = std::fs::read_to_string(dir.path().join("snap1").join(SNAPSHOT_META_FILE)).unwrap();
        let meta: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(meta["instance_id"], 7);
        assert_eq!(meta["members"][0]["name"], "sleeper");
        assert!(meta["taken_at"].is_string());

        assert_eq!(hooks.snapshot_take(" ").unwrap_err().kind(), ErrorKind::Config);
        cohort.stop_all();
    }

    #[test]
    fn test_stop_raises_flag() {
        let dir = tempfile::tempdir().unwrap();
        let (hooks, cohort, _, stop) = hooks_with_sleeper(dir.path());
        hooks.stop().unwrap();
        assert!(stop.load(Ordering::SeqCst));
        cohort.stop_all();
    }
}
