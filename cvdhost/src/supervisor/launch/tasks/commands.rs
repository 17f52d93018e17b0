//! Task: build the cohort's commands.
//!
//! Every command logs to `logs/<name>.log`, runs in the instance directory,
//! gets `CUTTLEFISH_INSTANCE` and stops with SIGTERM, falling back to
//! SIGKILL after `stop_timeout_secs`.

use std::time::Duration;

use nix::fcntl::OFlag;
use nix::sys::signal::Signal;

use cvdhost_shared::errors::CvdResult;
use cvdhost_shared::{propagate, stack_err};

use super::task_start;
use crate::config::{HostBinaries, LauncherConfig};
use crate::fd::ScopedFd;
use crate::pipeline::PipelineTask;
use crate::process::{Command, StdIoChannel, graceful_stopper, kill_subprocess_fallback};
use crate::supervisor::launch::LaunchContext;
use crate::supervisor::launch::types::{InstanceLayout, LaunchPipes};
use crate::supervisor::resources::InstanceResources;

/// Guest port adbd listens on.
pub const ADB_VSOCK_PORT: u32 = 5555;
/// Guest port of the GNSS HAL.
pub const GNSS_VSOCK_PORT: u32 = 6680;

pub struct BuildCommandsTask;

impl PipelineTask<LaunchContext> for BuildCommandsTask {
    fn run(self: Box<Self>, ctx: LaunchContext) -> CvdResult<()> {
        task_start(&ctx, self.name());
        let mut state = ctx.lock();
        let commands = {
            let resources = propagate!(
                state.resources.as_ref().ok_or_else(|| stack_err!("resources not reserved"))
            );
            let layout = propagate!(
                state.layout.as_ref().ok_or_else(|| stack_err!("layout not prepared"))
            );
            let pipes = propagate!(
                state.pipes.as_ref().ok_or_else(|| stack_err!("pipes not created"))
            );
            propagate!(build_commands(
                &state.config,
                &state.binaries,
                resources,
                layout,
                pipes
            ))
        };
        tracing::debug!(count = commands.len(), "Built cohort commands");
        state.commands = commands;
        Ok(())
    }

    fn name(&self) -> &str {
        "build_commands"
    }
}

/// Commands in start order. The VM monitor comes first.
pub fn build_commands(
    config: &LauncherConfig,
    binaries: &HostBinaries,
    resources: &InstanceResources,
    layout: &InstanceLayout,
    pipes: &LaunchPipes,
) -> CvdResult<Vec<Command>> {
    let cid = resources.vsock_cid.value();
    let ice_servers = propagate!(serde_json::to_string(&config.ice_servers));

    let vm_monitor = Command::new(&binaries.vm_monitor)
        .add_parameter("run")
        .add_parameter(format!("--cid={}", cid))
        .add_parameter("--serial=hardware=serial,num=1,type=file,console=true,path=/proc/self/fd/")
        .append_fd_to_last_parameter(&pipes.console_out.1)
        .append_to_last_parameter(",input=/proc/self/fd/")
        .append_fd_to_last_parameter(&pipes.console_in.0)
        .add_parameter("--serial=hardware=virtio-console,num=1,type=file,path=/proc/self/fd/")
        .append_fd_to_last_parameter(&pipes.kernel_log.1)
        .add_parameters(&config.vm_monitor_args);

    let console_forwarder = Command::new(&binaries.console_forwarder)
        .add_fd_parameter("-console_in_fd=", &pipes.console_in.1)
        .add_fd_parameter("-console_out_fd=", &pipes.console_out.0)
        .add_parameter(format!("-console_path={}", layout.console_path.display()))
        .add_parameter(format!("-console_log={}", layout.console_log.display()))
        .add_fd_parameter("-kernel_log_fd=", &pipes.kernel_log.1);

    let adb_proxy = Command::new(&binaries.socket_vsock_proxy)
        .add_parameter("-server=tcp")
        .add_parameter(format!("-tcp_port={}", resources.adb_port.value()))
        .add_parameter(format!("-vsock_cid={}", cid))
        .add_parameter(format!("-vsock_port={}", ADB_VSOCK_PORT));

    let gnss_proxy = Command::new(&binaries.gnss_grpc_proxy)
        .add_parameter(format!(
            "-grpc_socket_path={}",
            layout.grpc_socket("gnss_grpc_proxy").display()
        ))
        .add_parameter(format!("-vsock_cid={}", cid))
        .add_parameter(format!("-vsock_port={}", GNSS_VSOCK_PORT));

    let signaling = Command::new(&binaries.signaling_server)
        .add_parameter(format!("-port={}", resources.signaling_port()))
        .add_parameter(format!("-ice_servers={}", ice_servers));

    let metrics = Command::new(&binaries.metrics_drain)
        .add_parameter(format!("-queue_dir={}", layout.instance_dir.display()));

    let mut commands = vec![vm_monitor, console_forwarder, adb_proxy, gnss_proxy, signaling, metrics];
    if let Some(sensors) = &binaries.sensors_simulator {
        commands.push(Command::new(sensors).add_parameter(format!("-vsock_cid={}", cid)));
    }

    let stop_timeout = Duration::from_secs(config.stop_timeout_secs);
    let mut supervised = Vec::with_capacity(commands.len());
    for command in commands {
        supervised.push(propagate!(supervise(command, layout, resources.id(), stop_timeout)));
    }
    Ok(supervised)
}

fn supervise(
    command: Command,
    layout: &InstanceLayout,
    instance_id: u32,
    stop_timeout: Duration,
) -> CvdResult<Command> {
    let name = command.short_name();
    let log_path = layout.log_file(&name);
    let log = propagate!(
        ScopedFd::open(&log_path, OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_APPEND, 0o644),
        "opening {}",
        log_path.display()
    );
    Ok(command
        .redirect_stdio(StdIoChannel::StdOut, log)
        .redirect_stdio_to_channel(StdIoChannel::StdErr, StdIoChannel::StdOut)
        .add_environment_variable("CUTTLEFISH_INSTANCE", instance_id)
        .set_working_directory(&layout.instance_dir)
        .set_shared_stopper(kill_subprocess_fallback(graceful_stopper(
            Signal::SIGTERM,
            stop_timeout,
        ))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolRange;
    use crate::supervisor::resources::ResourcePools;

    fn fixture(root: &std::path::Path) -> (LauncherConfig, InstanceResources, InstanceLayout) {
        let config = LauncherConfig {
            instance_root: root.to_path_buf(),
            host_bin_dir: "/host/bin".into(),
            instance_ids: PoolRange::new(2, 3),
            adb_ports: PoolRange::new(6521, 6522),
            vsock_cids: PoolRange::new(4, 5),
            webrtc_ports: PoolRange::new(15560, 15562),
            ice_servers: serde_json::json!([{"urls": "stun:stun.example.com"}]),
            ..LauncherConfig::default()
        };
        let pools = ResourcePools::from_config(&config);
        let resources = InstanceResources::reserve(&pools, 1).unwrap();
        let layout = InstanceLayout::new(&config, resources.id());
        layout.prepare().unwrap();
        (config, resources, layout)
    }

    #[test]
    fn test_cohort_arguments() {
        let root = tempfile::tempdir().unwrap();
        let (config, resources, layout) = fixture(root.path());
        let pipes = LaunchPipes::create().unwrap();
        let commands =
            build_commands(&config, &HostBinaries::resolve(&config), &resources, &layout, &pipes)
                .unwrap();

        let names: Vec<String> = commands.iter().map(Command::short_name).collect();
        assert_eq!(
            names,
            [
                "crosvm",
                "console_forwarder",
                "socket_vsock_proxy",
                "gnss_grpc_proxy",
                "signaling_server",
                "metrics_drain"
            ]
        );

        let vm = commands[0].arguments();
        assert_eq!(vm[1], "run");
        assert_eq!(vm[2], "--cid=4");
        assert!(vm[3].contains(",input=/proc/self/fd/"));

        let proxy = commands[2].arguments();
        assert_eq!(proxy[1..], ["-server=tcp", "-tcp_port=6521", "-vsock_cid=4", "-vsock_port=5555"]);

        let signaling = commands[4].arguments();
        assert_eq!(signaling[1], "-port=15560");
        assert_eq!(signaling[2], r#"-ice_servers=[{"urls":"stun:stun.example.com"}]"#);

        assert!(commands[1].arguments().iter().any(|arg| arg.starts_with("-kernel_log_fd=")));
        assert!(commands[0].environment().iter().any(|env| env == "CUTTLEFISH_INSTANCE=2"));
        assert!(layout.log_file("crosvm").exists());
    }

    #[test]
    fn test_sensors_simulator_appended_when_enabled() {
        let root = tempfile::tempdir().unwrap();
        let (mut config, resources, layout) = fixture(root.path());
        config.enable_sensors_simulator = true;
        let pipes = LaunchPipes::create().unwrap();
        let commands =
            build_commands(&config, &HostBinaries::resolve(&config), &resources, &layout, &pipes)
                .unwrap();
        assert_eq!(commands.len(), 7);
        assert_eq!(commands[6].short_name(), "sensors_simulator");
        assert_eq!(commands[6].arguments()[1], "-vsock_cid=4");
    }
}
