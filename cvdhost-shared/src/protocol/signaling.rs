//! Signaling frame vocabulary.
//!
//! Frames are UTF-8 JSON objects with a `type` field. The hub never looks
//! inside `payload` or `device_info`; it only routes them.

use serde_json::{Value, json};

pub const TYPE: &str = "type";
pub const DEVICE_ID: &str = "device_id";
pub const DEVICE_INFO: &str = "device_info";
pub const CLIENT_ID: &str = "client_id";
pub const PAYLOAD: &str = "payload";
pub const MESSAGE: &str = "message";
pub const ICE_SERVERS: &str = "ice_servers";

pub const REGISTER: &str = "register";
pub const DEVICE_INFO_TYPE: &str = "device-info";
pub const CONNECT: &str = "connect";
pub const FORWARD: &str = "forward";
pub const CLIENT_MSG: &str = "client_msg";
pub const DEVICE_MSG: &str = "device_msg";
pub const CLIENT_DISCONNECTED: &str = "client_disconnected";
pub const CONFIG: &str = "config";
pub const ERROR: &str = "error";

/// Path of the REST-like device listing.
pub const LIST_DEVICES_PATH: &str = "/list-devices";

pub fn error_frame(message: impl AsRef<str>) -> Value {
    json!({ TYPE: ERROR, MESSAGE: message.as_ref() })
}

pub fn config_frame(ice_servers: &Value) -> Value {
    json!({ TYPE: CONFIG, ICE_SERVERS: ice_servers })
}

pub fn device_info_frame(device_info: &Value) -> Value {
    json!({ TYPE: DEVICE_INFO_TYPE, DEVICE_INFO: device_info })
}

pub fn client_msg_frame(client_id: u64, payload: &Value) -> Value {
    json!({ TYPE: CLIENT_MSG, CLIENT_ID: client_id, PAYLOAD: payload })
}

pub fn device_msg_frame(payload: &Value) -> Value {
    json!({ TYPE: DEVICE_MSG, PAYLOAD: payload })
}

pub fn client_disconnected_frame(client_id: u64) -> Value {
    json!({ TYPE: CLIENT_DISCONNECTED, CLIENT_ID: client_id })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_msg_shape() {
        let frame = client_msg_frame(0, &json!({"x": 1}));
        assert_eq!(
            frame,
            json!({"type": "client_msg", "client_id": 0, "payload": {"x": 1}})
        );
    }

    #[test]
    fn test_error_frame_shape() {
        assert_eq!(
            error_frame("Device not found"),
            json!({"type": "error", "message": "Device not found"})
        );
    }
}
