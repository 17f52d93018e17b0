//! Device registry shared by every signaling connection.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;

use cvdhost_shared::protocol::signaling::{
    client_disconnected_frame, client_msg_frame, device_info_frame, device_msg_frame,
};

/// One side of a signaling connection, as seen by other connections.
///
/// Implementations queue frames for the connection's own thread; they never
/// block on the network.
pub trait SignalingEndpoint: Send + Sync {
    /// Process-unique id of the connection.
    fn id(&self) -> u64;

    fn send_json(&self, frame: &Value);

    /// Ask the connection to send a close frame and shut down.
    fn close(&self);
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Device id already taken")]
    DeviceIdTaken,
    #[error("Device not found")]
    DeviceNotFound,
    #[error("Client not found")]
    ClientNotFound,
}

struct DeviceEntry {
    info: Value,
    device: Weak<dyn SignalingEndpoint>,
    device_conn: u64,
    /// Keyed by client id. Ids are never reused, even after removal.
    clients: BTreeMap<u64, Weak<dyn SignalingEndpoint>>,
    next_client_id: u64,
}

impl DeviceEntry {
    fn live_clients(&self) -> impl Iterator<Item = Arc<dyn SignalingEndpoint>> + '_ {
        self.clients.values().filter_map(Weak::upgrade)
    }
}

/// What a client learns when it connects to a device.
pub struct ClientAttachment {
    pub client_id: u64,
    pub device_info: Value,
    pub device: Arc<dyn SignalingEndpoint>,
}

#[derive(Default)]
pub struct DeviceRegistry {
    devices: Mutex<HashMap<String, DeviceEntry>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `device` under `device_id`, or update its info when the same
    /// connection registers again. Attached clients are sent the new info.
    pub fn register(
        &self,
        device_id: &str,
        device_info: Value,
        device: &Arc<dyn SignalingEndpoint>,
    ) -> Result<(), RegistryError> {
        let mut devices = self.devices.lock();
        if let Some(entry) = devices.get_mut(device_id) {
            let alive = entry.device.upgrade().is_some();
            if alive && entry.device_conn != device.id() {
                return Err(RegistryError::DeviceIdTaken);
            }
            if alive {
                entry.info = device_info;
                let frame = device_info_frame(&entry.info);
                for client in entry.live_clients() {
                    client.send_json(&frame);
                }
                return Ok(());
            }
        }
        devices.insert(
            device_id.to_string(),
            DeviceEntry {
                info: device_info,
                device: Arc::downgrade(device),
                device_conn: device.id(),
                clients: BTreeMap::new(),
                next_client_id: 0,
            },
        );
        tracing::info!(device_id, "Device registered");
        Ok(())
    }

    /// Remove the entry owned by connection `conn` and close its clients.
    pub fn unregister(&self, device_id: &str, conn: u64) {
        let entry = {
            let mut devices = self.devices.lock();
            match devices.get(device_id) {
                Some(entry) if entry.device_conn == conn => devices.remove(device_id),
                _ => None,
            }
        };
        if let Some(entry) = entry {
            tracing::info!(device_id, "Device unregistered");
            for client in entry.live_clients() {
                client.close();
            }
        }
    }

    /// Attach `client` to a registered device and assign it the next id.
    pub fn connect_client(
        &self,
        device_id: &str,
        client: &Arc<dyn SignalingEndpoint>,
    ) -> Result<ClientAttachment, RegistryError> {
        let mut devices = self.devices.lock();
        let entry = devices
            .get_mut(device_id)
            .ok_or(RegistryError::DeviceNotFound)?;
        let device = entry.device.upgrade().ok_or(RegistryError::DeviceNotFound)?;
        entry.clients.retain(|_, client| client.strong_count() > 0);
        let client_id = entry.next_client_id;
        entry.next_client_id += 1;
        entry.clients.insert(client_id, Arc::downgrade(client));
        Ok(ClientAttachment {
            client_id,
            device_info: entry.info.clone(),
            device,
        })
    }

    /// Drop the client's slot and tell the device it went away.
    pub fn disconnect_client(&self, device_id: &str, client_id: u64) {
        let device = {
            let mut devices = self.devices.lock();
            devices.get_mut(device_id).and_then(|entry| {
                entry.clients.remove(&client_id);
                entry.device.upgrade()
            })
        };
        if let Some(device) = device {
            device.send_json(&client_disconnected_frame(client_id));
        }
    }

    /// Deliver `payload` from a device to one of its clients.
    pub fn send_to_client(
        &self,
        device_id: &str,
        client_id: u64,
        payload: &Value,
    ) -> Result<(), RegistryError> {
        let client = {
            let devices = self.devices.lock();
            let entry = devices.get(device_id).ok_or(RegistryError::DeviceNotFound)?;
            entry
                .clients
                .get(&client_id)
                .and_then(Weak::upgrade)
                .ok_or(RegistryError::ClientNotFound)?
        };
        client.send_json(&device_msg_frame(payload));
        Ok(())
    }

    /// Deliver `payload` from a client to its device.
    pub fn send_to_device(
        &self,
        device_id: &str,
        client_id: u64,
        payload: &Value,
    ) -> Result<(), RegistryError> {
        let device = {
            let devices = self.devices.lock();
            devices
                .get(device_id)
                .and_then(|entry| entry.device.upgrade())
                .ok_or(RegistryError::DeviceNotFound)?
        };
        device.send_json(&client_msg_frame(client_id, payload));
        Ok(())
    }

    /// Registered ids with a live device connection, sorted.
    pub fn device_ids(&self) -> Vec<String> {
        let devices = self.devices.lock();
        let mut ids: Vec<String> = devices
            .iter()
            .filter(|(_, entry)| entry.device.upgrade().is_some())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Number of client slots held for `device_id`, live or not yet pruned.
    pub fn client_count(&self, device_id: &str) -> usize {
        self.devices
            .lock()
            .get(device_id)
            .map_or(0, |entry| entry.clients.len())
    }

    pub fn device_info(&self, device_id: &str) -> Option<Value> {
        self.devices.lock().get(device_id).map(|entry| entry.info.clone())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    static NEXT_ID: AtomicU64 = AtomicU64::new(1);

    /// Endpoint that records what it was sent.
    #[derive(Default)]
    pub(crate) struct RecordingEndpoint {
        id: u64,
        pub frames: Mutex<Vec<Value>>,
        pub closed: AtomicBool,
    }

    impl RecordingEndpoint {
        pub(crate) fn create() -> (Arc<RecordingEndpoint>, Arc<dyn SignalingEndpoint>) {
            let endpoint = Arc::new(RecordingEndpoint {
                id: NEXT_ID.fetch_add(1, Ordering::SeqCst),
                ..Default::default()
            });
            let dynamic: Arc<dyn SignalingEndpoint> = endpoint.clone();
            (endpoint, dynamic)
        }

        pub(crate) fn take(&self) -> Vec<Value> {
            std::mem::take(&mut *self.frames.lock())
        }
    }

    impl SignalingEndpoint for RecordingEndpoint {
        fn id(&self) -> u64 {
            self.id
        }

        fn send_json(&self, frame: &Value) {
            self.frames.lock().push(frame.clone());
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_register_and_list() {
        let registry = DeviceRegistry::new();
        let (_a, a) = RecordingEndpoint::create();
        let (_b, b) = RecordingEndpoint::create();
        registry.register("cvd-2", json!({}), &b).unwrap();
        registry.register("cvd-1", json!({}), &a).unwrap();
        assert_eq!(registry.device_ids(), vec!["cvd-1", "cvd-2"]);
    }

    #[test]
    fn test_duplicate_id_from_other_connection_rejected() {
        let registry = DeviceRegistry::new();
        let (_a, a) = RecordingEndpoint::create();
        let (_b, b) = RecordingEndpoint::create();
        registry.register("cvd-1", json!({}), &a).unwrap();
        assert_eq!(
            registry.register("cvd-1", json!({}), &b),
            Err(RegistryError::DeviceIdTaken)
        );
    }

    #[test]
    fn test_reregister_updates_info_and_notifies_clients() {
        let registry = DeviceRegistry::new();
        let (_device, device) = RecordingEndpoint::create();
        let (client_rec, client) = RecordingEndpoint::create();
        registry.register("cvd-1", json!({"v": 1}), &device).unwrap();
        registry.connect_client("cvd-1", &client).unwrap();
        registry.register("cvd-1", json!({"v": 2}), &device).unwrap();
        assert_eq!(registry.device_ids().len(), 1);
        assert_eq!(registry.device_info("cvd-1"), Some(json!({"v": 2})));
        assert_eq!(
            client_rec.take(),
            vec![json!({"type": "device-info", "device_info": {"v": 2}})]
        );
    }

    #[test]
    fn test_dead_device_id_can_be_reused() {
        let registry = DeviceRegistry::new();
        let (a_rec, a) = RecordingEndpoint::create();
        registry.register("cvd-1", json!({}), &a).unwrap();
        drop(a);
        drop(a_rec);
        assert!(registry.device_ids().is_empty());
        let (_b, b) = RecordingEndpoint::create();
        registry.register("cvd-1", json!({}), &b).unwrap();
    }

    #[test]
    fn test_client_ids_are_monotonic() {
        let registry = DeviceRegistry::new();
        let (_device, device) = RecordingEndpoint::create();
        registry.register("cvd-1", json!({}), &device).unwrap();
        let (_c0, c0) = RecordingEndpoint::create();
        let (_c1, c1) = RecordingEndpoint::create();
        assert_eq!(registry.connect_client("cvd-1", &c0).unwrap().client_id, 0);
        drop(c0);
        assert_eq!(registry.connect_client("cvd-1", &c1).unwrap().client_id, 1);
    }

    #[test]
    fn test_client_slots_are_reclaimed() {
        let registry = DeviceRegistry::new();
        let (_device, device) = RecordingEndpoint::create();
        registry.register("cvd-1", json!({}), &device).unwrap();

        let (_c0, c0) = RecordingEndpoint::create();
        let (c1_rec, c1) = RecordingEndpoint::create();
        let first = registry.connect_client("cvd-1", &c0).unwrap().client_id;
        let second = registry.connect_client("cvd-1", &c1).unwrap().client_id;
        assert_eq!(registry.client_count("cvd-1"), 2);

        registry.disconnect_client("cvd-1", first);
        assert_eq!(registry.client_count("cvd-1"), 1);
        assert_eq!(
            registry.send_to_client("cvd-1", first, &json!({})),
            Err(RegistryError::ClientNotFound)
        );
        registry.send_to_client("cvd-1", second, &json!({})).unwrap();

        // Dropped endpoints are pruned on the next attach.
        drop(c1);
        drop(c1_rec);
        let (_c2, c2) = RecordingEndpoint::create();
        assert_eq!(registry.connect_client("cvd-1", &c2).unwrap().client_id, 2);
        assert_eq!(registry.client_count("cvd-1"), 1);
    }

    #[test]
    fn test_unknown_device_and_client() {
        let registry = DeviceRegistry::new();
        let (_c, c) = RecordingEndpoint::create();
        assert!(matches!(
            registry.connect_client("nope", &c),
            Err(RegistryError::DeviceNotFound)
        ));
        let (_device, device) = RecordingEndpoint::create();
        registry.register("cvd-1", json!({}), &device).unwrap();
        assert_eq!(
            registry.send_to_client("cvd-1", 9, &json!({})),
            Err(RegistryError::ClientNotFound)
        );
    }

    #[test]
    fn test_unregister_closes_clients() {
        let registry = DeviceRegistry::new();
        let (_device_rec, device) = RecordingEndpoint::create();
        let (client_rec, client) = RecordingEndpoint::create();
        registry.register("cvd-1", json!({}), &device).unwrap();
        registry.connect_client("cvd-1", &client).unwrap();
        registry.unregister("cvd-1", device.id() + 1000);
        assert_eq!(registry.device_ids().len(), 1);
        registry.unregister("cvd-1", device.id());
        assert!(registry.device_ids().is_empty());
        assert!(client_rec.closed.load(Ordering::SeqCst));
    }
}
