//! State shared by the launch tasks.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use nix::unistd::{Group, chown};

use cvdhost_shared::errors::CvdResult;
use cvdhost_shared::propagate;

use crate::config::{HostBinaries, LauncherConfig};
use crate::fd::ScopedFd;
use crate::process::Command;
use crate::snapshot::{CoordinatorHandle, SnapshotLatch};
use crate::supervisor::cohort::Cohort;
use crate::supervisor::kernel_log::KernelLogDrain;
use crate::supervisor::registry::{InstanceRegistry, InstanceStatus};
use crate::supervisor::resources::{InstanceResources, ResourcePools};

/// Group allowed to reach the gRPC sockets of every instance.
pub const GRPC_SOCKET_GROUP: &str = "cvdnetwork";

/// On-disk layout of one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceLayout {
    pub instance_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub console_path: PathBuf,
    pub console_log: PathBuf,
    pub grpc_dir: PathBuf,
    pub control_socket: PathBuf,
    pub kernel_log: PathBuf,
}

impl InstanceLayout {
    pub fn new(config: &LauncherConfig, instance_id: u32) -> Self {
        let instance_dir = config.instance_dir(instance_id);
        Self {
            logs_dir: instance_dir.join("logs"),
            console_path: instance_dir.join("console"),
            console_log: instance_dir.join("console_log"),
            grpc_dir: instance_dir.join("grpc_socket"),
            control_socket: config
                .control_socket
                .clone()
                .unwrap_or_else(|| instance_dir.join("launcher_monitor.socket")),
            kernel_log: instance_dir.join("kernel.log"),
            instance_dir,
        }
    }

    /// Log file for the binary called `name`.
    pub fn log_file(&self, name: &str) -> PathBuf {
        self.logs_dir.join(format!("{}.log", name))
    }

    pub fn grpc_socket(&self, name: &str) -> PathBuf {
        self.grpc_dir.join(format!("{}.sock", name))
    }

    /// Create the directories. Stale sockets from a previous run are removed.
    pub fn prepare(&self) -> CvdResult<()> {
        for dir in [&self.instance_dir, &self.logs_dir, &self.grpc_dir] {
            propagate!(std::fs::create_dir_all(dir), "creating {}", dir.display());
        }
        propagate!(
            std::fs::set_permissions(&self.grpc_dir, std::fs::Permissions::from_mode(0o775)),
            "setting mode of {}",
            self.grpc_dir.display()
        );
        share_with_group(&self.grpc_dir, GRPC_SOCKET_GROUP);

        for stale in [&self.control_socket, &self.console_path] {
            remove_if_present(stale)?;
        }
        Ok(())
    }
}

fn remove_if_present(path: &Path) -> CvdResult<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            tracing::debug!(path = %path.display(), "Removed stale file");
            Ok(())
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(cvdhost_shared::StackTraceError::from(err).push_entry(
            cvdhost_shared::stack_entry!().with_message(format!("removing {}", path.display())),
        )),
    }
}

/// Hand `dir` to `group` when it exists. Hosts without it still work for
/// the current user.
fn share_with_group(dir: &Path, group: &str) {
    match Group::from_name(group) {
        Ok(Some(entry)) => {
            if let Err(err) = chown(dir, None, Some(entry.gid)) {
                tracing::warn!(dir = %dir.display(), group, "chgrp failed: {}", err);
            }
        }
        Ok(None) => tracing::debug!(group, "Group not present, keeping ownership"),
        Err(err) => tracing::warn!(group, "Group lookup failed: {}", err),
    }
}

/// Pipes connecting the VM monitor to the console forwarder and the
/// kernel-log drain.
#[derive(Debug)]
pub struct LaunchPipes {
    /// Forwarder writes, VM reads.
    pub console_in: (ScopedFd, ScopedFd),
    /// VM writes, forwarder reads.
    pub console_out: (ScopedFd, ScopedFd),
    /// VM and forwarder write, the supervisor drains.
    pub kernel_log: (ScopedFd, ScopedFd),
}

impl LaunchPipes {
    pub fn create() -> CvdResult<Self> {
        Ok(Self {
            console_in: propagate!(ScopedFd::pipe(), "console input pipe"),
            console_out: propagate!(ScopedFd::pipe(), "console output pipe"),
            kernel_log: propagate!(ScopedFd::pipe(), "kernel log pipe"),
        })
    }
}

/// Tears down a partially launched instance unless disarmed.
pub struct CleanupGuard {
    registry: InstanceRegistry,
    cohort: Arc<Cohort>,
    instance_id: Option<u32>,
    armed: bool,
}

impl CleanupGuard {
    pub fn new(registry: InstanceRegistry, cohort: Arc<Cohort>) -> Self {
        Self {
            registry,
            cohort,
            instance_id: None,
            armed: true,
        }
    }

    pub fn set_instance(&mut self, instance_id: u32) {
        self.instance_id = Some(instance_id);
    }

    pub fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        tracing::warn!(instance_id = ?self.instance_id, "Instance launch failed, cleaning up");
        let crashed = self.cohort.stop_all();
        if crashed > 0 {
            tracing::warn!(crashed, "Some cohort members had to be killed");
        }
        if let Some(id) = self.instance_id {
            self.registry.set_status(id, InstanceStatus::Failed);
        }
    }
}

/// Inputs, outputs and cleanup for one launch.
pub struct LaunchState {
    pub config: LauncherConfig,
    pub binaries: HostBinaries,
    pub pools: Arc<ResourcePools>,
    pub registry: InstanceRegistry,
    pub resources: Option<InstanceResources>,
    pub layout: Option<InstanceLayout>,
    pub pipes: Option<LaunchPipes>,
    pub commands: Vec<Command>,
    pub cohort: Arc<Cohort>,
    pub kernel_log: Option<KernelLogDrain>,
    pub latch: Arc<SnapshotLatch>,
    pub stop_requested: Arc<AtomicBool>,
    pub coordinator: Option<CoordinatorHandle>,
    pub guard: CleanupGuard,
}

impl LaunchState {
    pub fn new(config: LauncherConfig, pools: Arc<ResourcePools>, registry: InstanceRegistry) -> Self {
        let binaries = HostBinaries::resolve(&config);
        let cohort = Arc::new(Cohort::new());
        let guard = CleanupGuard::new(registry.clone(), Arc::clone(&cohort));
        Self {
            config,
            binaries,
            pools,
            registry,
            resources: None,
            layout: None,
            pipes: None,
            commands: Vec::new(),
            cohort,
            kernel_log: None,
            latch: Arc::new(SnapshotLatch::new()),
            stop_requested: Arc::new(AtomicBool::new(false)),
            coordinator: None,
            guard,
        }
    }

    pub fn instance_id(&self) -> Option<u32> {
        self.resources.as_ref().map(InstanceResources::id)
    }
}
