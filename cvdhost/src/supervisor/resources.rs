//! Host resources reserved for one instance.

use std::sync::Arc;

use cvdhost_shared::errors::{CvdResult, ErrorKind};
use cvdhost_shared::propagate;

use crate::allocator::{Reservation, UniqueResourceAllocator};
use crate::config::LauncherConfig;

/// Allocators shared by every instance a supervisor launches.
#[derive(Debug)]
pub struct ResourcePools {
    pub instance_ids: Arc<UniqueResourceAllocator<u32>>,
    pub adb_ports: Arc<UniqueResourceAllocator<u16>>,
    pub vsock_cids: Arc<UniqueResourceAllocator<u32>>,
    pub webrtc_ports: Arc<UniqueResourceAllocator<u16>>,
}

fn ports(range: crate::config::PoolRange) -> impl Iterator<Item = u16> {
    range.values().filter_map(|port| u16::try_from(port).ok())
}

impl ResourcePools {
    pub fn from_config(config: &LauncherConfig) -> Arc<Self> {
        Arc::new(Self {
            instance_ids: UniqueResourceAllocator::create(config.instance_ids.values()),
            adb_ports: UniqueResourceAllocator::create(ports(config.adb_ports)),
            vsock_cids: UniqueResourceAllocator::create(config.vsock_cids.values()),
            webrtc_ports: UniqueResourceAllocator::create(ports(config.webrtc_ports)),
        })
    }
}

/// Everything one instance holds. Dropping it returns every value.
#[derive(Debug)]
pub struct InstanceResources {
    pub instance_id: Reservation<u32>,
    pub adb_port: Reservation<u16>,
    pub vsock_cid: Reservation<u32>,
    /// Consecutive block: signaling first, then one port per display.
    pub webrtc_ports: Vec<Reservation<u16>>,
}

impl InstanceResources {
    /// Reserve a full set or nothing.
    pub fn reserve(pools: &ResourcePools, display_count: usize) -> CvdResult<Self> {
        let instance_id = propagate!(pools.instance_ids.unique_item(), "no free instance id");
        let adb_port = propagate!(pools.adb_ports.unique_item(), "no free adb port");
        let vsock_cid = propagate!(pools.vsock_cids.unique_item(), "no free vsock cid");
        let webrtc_ports = propagate!(
            pools.webrtc_ports.unique_consecutive_items(display_count + 1),
            "no run of {} free webrtc ports",
            display_count + 1
        );
        tracing::info!(
            instance_id = instance_id.value(),
            adb_port = adb_port.value(),
            vsock_cid = vsock_cid.value(),
            webrtc_first = webrtc_ports[0].value(),
            "Reserved instance resources"
        );
        Ok(Self {
            instance_id,
            adb_port,
            vsock_cid,
            webrtc_ports,
        })
    }

    pub fn id(&self) -> u32 {
        self.instance_id.value()
    }

    pub fn signaling_port(&self) -> u16 {
        self.webrtc_ports[0].value()
    }

    pub fn display_ports(&self) -> Vec<u16> {
        self.webrtc_ports[1..].iter().map(Reservation::value).collect()
    }
}

/// Kind for a failed reservation, for callers that retry.
pub fn is_exhausted(err: &cvdhost_shared::StackTraceError) -> bool {
    err.kind() == ErrorKind::ResourceUnavailable
}
