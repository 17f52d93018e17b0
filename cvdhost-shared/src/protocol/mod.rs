//! Wire vocabularies spoken between the launcher and its collaborators.

pub mod launcher;
pub mod signaling;

pub use launcher::{
    ExtendedActionType, LauncherAction, LauncherReply, LauncherRequest, LauncherResponse,
    read_record, write_record,
};
