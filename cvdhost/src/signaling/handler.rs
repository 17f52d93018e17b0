//! Per-connection signaling state machine.
//!
//! A connection starts unassigned and becomes either a device (after
//! `register`) or a client (after `connect`). Malformed input gets one
//! `error` frame and changes nothing.

use std::sync::Arc;

use serde_json::{Map, Value};

use cvdhost_shared::protocol::signaling::{
    self, CLIENT_ID, CONNECT, DEVICE_ID, DEVICE_INFO, FORWARD, PAYLOAD, REGISTER, TYPE,
    config_frame, device_info_frame, error_frame,
};

use super::registry::{DeviceRegistry, SignalingEndpoint};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    New,
    Device { device_id: String },
    Client { device_id: String, client_id: u64 },
}

/// What the transport should do after a frame was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    KeepOpen,
    Close,
}

pub struct SignalingHandler {
    registry: Arc<DeviceRegistry>,
    endpoint: Arc<dyn SignalingEndpoint>,
    ice_servers: Value,
    role: Role,
}

impl SignalingHandler {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        endpoint: Arc<dyn SignalingEndpoint>,
        ice_servers: Value,
    ) -> Self {
        Self {
            registry,
            endpoint,
            ice_servers,
            role: Role::New,
        }
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    /// Send the `config` frame every peer needs for its PeerConnection.
    pub fn on_open(&mut self) {
        self.endpoint.send_json(&config_frame(&self.ice_servers));
    }

    pub fn on_text(&mut self, text: &str) -> Disposition {
        let message = match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(message)) => message,
            Ok(_) => return self.reject("Message must be a JSON object"),
            Err(err) => {
                tracing::debug!(conn = self.endpoint.id(), "Malformed signaling message: {}", err);
                return self.reject("Malformed JSON");
            }
        };
        let Some(kind) = message.get(TYPE).and_then(Value::as_str) else {
            return self.reject("Missing message type");
        };
        match kind {
            REGISTER => self.on_register(&message),
            CONNECT => self.on_connect(&message),
            FORWARD => self.on_forward(&message),
            other => self.reject(&format!("Unknown message type: {}", other)),
        }
    }

    /// Binary frames are not part of the protocol.
    pub fn on_binary(&mut self) -> Disposition {
        self.endpoint
            .send_json(&error_frame("Binary messages are not supported"));
        Disposition::Close
    }

    /// Release registry state held by this connection.
    pub fn on_close(&mut self) {
        match std::mem::replace(&mut self.role, Role::New) {
            Role::New => {}
            Role::Device { device_id } => self.registry.unregister(&device_id, self.endpoint.id()),
            Role::Client {
                device_id,
                client_id,
            } => self.registry.disconnect_client(&device_id, client_id),
        }
    }

    fn reject(&self, message: &str) -> Disposition {
        self.endpoint.send_json(&error_frame(message));
        Disposition::KeepOpen
    }

    fn on_register(&mut self, message: &Map<String, Value>) -> Disposition {
        let Some(device_id) = message.get(DEVICE_ID).and_then(Value::as_str) else {
            return self.reject("register requires a string device_id");
        };
        let Some(device_info) = message.get(DEVICE_INFO) else {
            return self.reject("register requires device_info");
        };
        match &self.role {
            Role::Client { .. } => return self.reject("A client connection cannot register"),
            Role::Device { device_id: current } if current != device_id => {
                return self.reject("Connection already registered another device");
            }
            _ => {}
        }
        if let Err(err) = self
            .registry
            .register(device_id, device_info.clone(), &self.endpoint)
        {
            return self.reject(&err.to_string());
        }
        self.role = Role::Device {
            device_id: device_id.to_string(),
        };
        Disposition::KeepOpen
    }

    fn on_connect(&mut self, message: &Map<String, Value>) -> Disposition {
        match &self.role {
            Role::Client { .. } => {
                self.endpoint
                    .send_json(&error_frame("Connection already attached to a device"));
                return Disposition::Close;
            }
            Role::Device { .. } => return self.reject("A device connection cannot connect"),
            Role::New => {}
        }
        let Some(device_id) = message.get(DEVICE_ID).and_then(Value::as_str) else {
            return self.reject("connect requires a string device_id");
        };
        let attachment = match self.registry.connect_client(device_id, &self.endpoint) {
            Ok(attachment) => attachment,
            Err(err) => return self.reject(&err.to_string()),
        };
        tracing::debug!(device_id, client_id = attachment.client_id, "Client connected");
        self.role = Role::Client {
            device_id: device_id.to_string(),
            client_id: attachment.client_id,
        };
        self.endpoint
            .send_json(&device_info_frame(&attachment.device_info));
        if let Some(payload) = message.get(PAYLOAD) {
            attachment.device.send_json(&signaling::client_msg_frame(
                attachment.client_id,
                payload,
            ));
        }
        Disposition::KeepOpen
    }

    fn on_forward(&mut self, message: &Map<String, Value>) -> Disposition {
        let Some(payload) = message.get(PAYLOAD) else {
            return self.reject("forward requires a payload");
        };
        let result = match &self.role {
            Role::New => return self.reject("Connection is neither a device nor a client"),
            Role::Client {
                device_id,
                client_id,
            } => self.registry.send_to_device(device_id, *client_id, payload),
            Role::Device { device_id } => {
                let Some(client_id) = message.get(CLIENT_ID).and_then(Value::as_u64) else {
                    return self.reject("forward from a device requires a numeric client_id");
                };
                self.registry.send_to_client(device_id, client_id, payload)
            }
        };
        match result {
            Ok(()) => Disposition::KeepOpen,
            Err(err) => self.reject(&err.to_string()),
        }
    }
}
