//! Launcher control records.
//!
//! Each record on the control UDS is a little-endian `u32` byte length
//! followed by that many bytes of JSON. A request is answered by exactly one
//! [`LauncherReply`].

use std::io::{ErrorKind as IoErrorKind, Read, Write};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::errors::{CvdResult, ErrorKind, StackTraceError};
use crate::{ensure, propagate};

/// Upper bound for one record. Control messages are tiny.
pub const MAX_RECORD_LEN: usize = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LauncherAction {
    Stop,
    Status,
    Extended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtendedActionType {
    Suspend,
    Resume,
    SnapshotTake,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LauncherRequest {
    pub action: LauncherAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extended_type: Option<ExtendedActionType>,
    /// Action-specific payload, e.g. the snapshot directory.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub serialized_data: String,
}

impl LauncherRequest {
    pub fn simple(action: LauncherAction) -> Self {
        Self {
            action,
            extended_type: None,
            serialized_data: String::new(),
        }
    }

    pub fn extended(extended_type: ExtendedActionType, serialized_data: impl Into<String>) -> Self {
        Self {
            action: LauncherAction::Extended,
            extended_type: Some(extended_type),
            serialized_data: serialized_data.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LauncherResponse {
    Success,
    Error,
    UnknownAction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LauncherReply {
    pub launcher_response: LauncherResponse,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl LauncherReply {
    pub fn success() -> Self {
        Self {
            launcher_response: LauncherResponse::Success,
            message: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            launcher_response: LauncherResponse::Error,
            message: Some(message.into()),
        }
    }

    pub fn unknown_action() -> Self {
        Self {
            launcher_response: LauncherResponse::UnknownAction,
            message: None,
        }
    }
}

/// Write one length-prefixed JSON record.
pub fn write_record<W: Write, T: Serialize>(writer: &mut W, record: &T) -> CvdResult<()> {
    let body = propagate!(serde_json::to_vec(record));
    ensure!(
        body.len() <= MAX_RECORD_LEN,
        kind = ErrorKind::Protocol,
        "record of {} bytes exceeds limit",
        body.len()
    );
    let len = body.len() as u32;
    propagate!(writer.write_all(&len.to_le_bytes()));
    propagate!(writer.write_all(&body));
    propagate!(writer.flush());
    Ok(())
}

/// Read one length-prefixed JSON record.
///
/// Returns `Ok(None)` when the peer closed the stream on a record boundary.
pub fn read_record<R: Read, T: DeserializeOwned>(reader: &mut R) -> CvdResult<Option<T>> {
    let mut len_bytes = [0u8; 4];
    let mut filled = 0;
    while filled < len_bytes.len() {
        match reader.read(&mut len_bytes[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => {
                return Err(StackTraceError::with_detail(
                    ErrorKind::Protocol,
                    "stream ended inside a record header",
                )
                .push_entry(crate::stack_entry!()));
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == IoErrorKind::Interrupted => continue,
            Err(e) => return Err(StackTraceError::from(e).push_entry(crate::stack_entry!())),
        }
    }
    let len = u32::from_le_bytes(len_bytes) as usize;
    ensure!(
        len <= MAX_RECORD_LEN,
        kind = ErrorKind::Protocol,
        "record of {} bytes exceeds limit",
        len
    );
    let mut body = vec![0u8; len];
    propagate!(reader.read_exact(&mut body), "reading {} byte record", len);
    let record = propagate!(serde_json::from_slice(&body));
    Ok(Some(record))
}
