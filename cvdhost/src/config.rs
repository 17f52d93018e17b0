//! Typed launcher configuration.
//!
//! Every field has a default, so an empty JSON object is a valid config.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use cvdhost_shared::errors::{CvdResult, ErrorKind};
use cvdhost_shared::{ensure, propagate};

/// Half-open `[start, end)` range of pool values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolRange {
    pub start: u32,
    pub end: u32,
}

impl PoolRange {
    pub const fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    pub fn values(&self) -> std::ops::Range<u32> {
        self.start..self.end
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LauncherConfig {
    /// Parent of the per-instance directories (`cvd-<id>`).
    pub instance_root: PathBuf,
    /// Directory holding the host binaries.
    pub host_bin_dir: PathBuf,
    pub instance_ids: PoolRange,
    pub adb_ports: PoolRange,
    pub vsock_cids: PoolRange,
    pub webrtc_ports: PoolRange,
    /// Number of displays. The WebRTC block holds one port per display
    /// plus one for the signaling front end.
    pub display_count: u32,
    /// ICE servers handed to every signaling peer.
    pub ice_servers: Value,
    /// Snapshot control socket. Defaults to `launcher_monitor.socket` in the
    /// instance directory.
    pub control_socket: Option<PathBuf>,
    /// Extra arguments for the VM monitor.
    pub vm_monitor_args: Vec<String>,
    /// Binary name to replacement path.
    pub substitutions: BTreeMap<String, PathBuf>,
    /// Seconds allowed for workers to pause on suspend.
    pub suspend_timeout_secs: u64,
    /// Seconds between SIGTERM and SIGKILL when stopping the cohort.
    pub stop_timeout_secs: u64,
    /// Start the sensors simulator alongside the cohort.
    pub enable_sensors_simulator: bool,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(std::env::temp_dir);
        Self {
            instance_root: home.join("cuttlefish_runtime"),
            host_bin_dir: home.join("bin"),
            instance_ids: PoolRange::new(1, 11),
            adb_ports: PoolRange::new(6520, 6530),
            vsock_cids: PoolRange::new(3, 13),
            webrtc_ports: PoolRange::new(15550, 15600),
            display_count: 1,
            ice_servers: Value::Array(Vec::new()),
            control_socket: None,
            vm_monitor_args: Vec::new(),
            substitutions: BTreeMap::new(),
            suspend_timeout_secs: 30,
            stop_timeout_secs: 5,
            enable_sensors_simulator: false,
        }
    }
}

impl LauncherConfig {
    pub fn load(path: &Path) -> CvdResult<Self> {
        let text = propagate!(
            std::fs::read_to_string(path),
            "reading config {}",
            path.display()
        );
        let config: Self = propagate!(
            serde_json::from_str(&text).map_err(|err| {
                cvdhost_shared::StackTraceError::with_detail(ErrorKind::Config, err)
            }),
            "parsing config {}",
            path.display()
        );
        propagate!(config.validate());
        Ok(config)
    }

    pub fn validate(&self) -> CvdResult<()> {
        for (name, range) in [
            ("instance_ids", self.instance_ids),
            ("adb_ports", self.adb_ports),
            ("vsock_cids", self.vsock_cids),
            ("webrtc_ports", self.webrtc_ports),
        ] {
            ensure!(!range.is_empty(), kind = ErrorKind::Config, "pool {} is empty", name);
        }
        ensure!(self.display_count > 0, kind = ErrorKind::Config, "display_count must be positive");
        ensure!(
            self.webrtc_ports.len() > self.display_count as usize,
            kind = ErrorKind::Config,
            "webrtc_ports cannot hold {} displays plus signaling",
            self.display_count
        );
        ensure!(
            self.adb_ports.end <= u32::from(u16::MAX) + 1 && self.webrtc_ports.end <= u32::from(u16::MAX) + 1,
            kind = ErrorKind::Config,
            "port pools must stay below 65536"
        );
        ensure!(
            self.vsock_cids.start >= 3,
            kind = ErrorKind::Config,
            "vsock cids 0..=2 are reserved"
        );
        ensure!(
            self.ice_servers.is_array(),
            kind = ErrorKind::Config,
            "ice_servers must be a JSON array"
        );
        Ok(())
    }

    pub fn instance_dir(&self, instance_id: u32) -> PathBuf {
        self.instance_root.join(format!("cvd-{}", instance_id))
    }
}

pub const VM_MONITOR: &str = "crosvm";
pub const RUN_CVD: &str = "run_cvd";
pub const CONSOLE_FORWARDER: &str = "console_forwarder";
pub const SOCKET_VSOCK_PROXY: &str = "socket_vsock_proxy";
pub const GNSS_GRPC_PROXY: &str = "gnss_grpc_proxy";
pub const SIGNALING_SERVER: &str = "signaling_server";
pub const METRICS_DRAIN: &str = "metrics_drain";
pub const SENSORS_SIMULATOR: &str = "sensors_simulator";

/// Paths of the binaries making up one cohort.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostBinaries {
    pub vm_monitor: PathBuf,
    pub run_cvd: PathBuf,
    pub console_forwarder: PathBuf,
    pub socket_vsock_proxy: PathBuf,
    pub gnss_grpc_proxy: PathBuf,
    pub signaling_server: PathBuf,
    pub metrics_drain: PathBuf,
    /// `None` when the simulator is disabled.
    pub sensors_simulator: Option<PathBuf>,
}

impl HostBinaries {
    /// Apply substitutions on top of `host_bin_dir`.
    ///
    /// A substituted sensors simulator only speaks to a matching `run_cvd`,
    /// so its substitution is ignored unless `run_cvd` is substituted too.
    pub fn resolve(config: &LauncherConfig) -> Self {
        let pick = |name: &str| {
            config
                .substitutions
                .get(name)
                .cloned()
                .unwrap_or_else(|| config.host_bin_dir.join(name))
        };

        let sensors_simulator = config.enable_sensors_simulator.then(|| {
            let substituted = config.substitutions.contains_key(SENSORS_SIMULATOR);
            if substituted && !config.substitutions.contains_key(RUN_CVD) {
                tracing::warn!(
                    "Ignoring {} substitution because {} is not substituted",
                    SENSORS_SIMULATOR,
                    RUN_CVD
                );
                config.host_bin_dir.join(SENSORS_SIMULATOR)
            } else {
                pick(SENSORS_SIMULATOR)
            }
        });

        Self {
            vm_monitor: pick(VM_MONITOR),
            run_cvd: pick(RUN_CVD),
            console_forwarder: pick(CONSOLE_FORWARDER),
            socket_vsock_proxy: pick(SOCKET_VSOCK_PROXY),
            gnss_grpc_proxy: pick(GNSS_GRPC_PROXY),
            signaling_server: pick(SIGNALING_SERVER),
            metrics_drain: pick(METRICS_DRAIN),
            sensors_simulator,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_object_is_default() {
        let config: LauncherConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, LauncherConfig::default());
        config.validate().unwrap();
    }

    #[test]
    fn test_load_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("launcher.json");
        std::fs::write(&path, r#"{"display_count": 2, "adb_ports": {"start": 7000, "end": 7002}}"#)
            .unwrap();
        let config = LauncherConfig::load(&path).unwrap();
        assert_eq!(config.display_count, 2);
        assert_eq!(config.adb_ports.values().collect::<Vec<_>>(), vec![7000, 7001]);
    }

    #[test]
    fn test_invalid_config_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("launcher.json");
        std::fs::write(&path, r#"{"vsock_cids": {"start": 5, "end": 5}}"#).unwrap();
        let err = LauncherConfig::load(&path).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);

        std::fs::write(&path, "not json").unwrap();
        assert_eq!(LauncherConfig::load(&path).unwrap_err().kind(), ErrorKind::Config);
    }

    fn config_with(substitutions: &[(&str, &str)]) -> LauncherConfig {
        LauncherConfig {
            host_bin_dir: PathBuf::from("/host/bin"),
            enable_sensors_simulator: true,
            substitutions: substitutions
                .iter()
                .map(|(name, path)| (name.to_string(), PathBuf::from(path)))
                .collect(),
            ..LauncherConfig::default()
        }
    }

    #[test]
    fn test_substitution_applies() {
        let binaries = HostBinaries::resolve(&config_with(&[(VM_MONITOR, "/opt/crosvm")]));
        assert_eq!(binaries.vm_monitor, PathBuf::from("/opt/crosvm"));
        assert_eq!(binaries.console_forwarder, PathBuf::from("/host/bin/console_forwarder"));
    }

    #[test]
    fn test_sensors_substitution_requires_run_cvd() {
        let alone = HostBinaries::resolve(&config_with(&[(SENSORS_SIMULATOR, "/opt/sensors")]));
        assert_eq!(alone.sensors_simulator, Some(PathBuf::from("/host/bin/sensors_simulator")));

        let paired = HostBinaries::resolve(&config_with(&[
            (SENSORS_SIMULATOR, "/opt/sensors"),
            (RUN_CVD, "/opt/run_cvd"),
        ]));
        assert_eq!(paired.sensors_simulator, Some(PathBuf::from("/opt/sensors")));
    }

    #[test]
    fn test_sensors_disabled() {
        let config = LauncherConfig {
            enable_sensors_simulator: false,
            ..config_with(&[])
        };
        assert_eq!(HostBinaries::resolve(&config).sensors_simulator, None);
    }
}
