//! System V message queue used by guest-facing daemons to report events.

use std::ffi::CString;
use std::fs::OpenOptions;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use cvdhost_shared::errors::{CvdResult, ErrorKind};
use cvdhost_shared::{ensure, errno_err, propagate, stack_err};

/// File whose inode seeds the queue key.
pub const QUEUE_KEY_FILE: &str = "cuttlefish_ipc";
pub const QUEUE_PROJECT_ID: u8 = b'a';
/// Payload bytes per record.
pub const MAX_MESSAGE_SIZE: usize = 200;
/// Record type for device-originated events.
pub const DEVICE_MESSAGE_TYPE: libc::c_long = 1;

#[repr(C)]
struct MessageBuffer {
    mtype: libc::c_long,
    mtext: [u8; MAX_MESSAGE_SIZE],
}

#[derive(Debug)]
pub struct SysVMessageQueue {
    id: libc::c_int,
    key: libc::key_t,
}

impl SysVMessageQueue {
    /// Open (creating if needed) the queue keyed on `<dir>/cuttlefish_ipc`.
    pub fn for_directory(dir: &Path) -> CvdResult<Self> {
        let key_path = dir.join(QUEUE_KEY_FILE);
        propagate!(
            OpenOptions::new().create(true).append(true).open(&key_path),
            "creating queue key file {}",
            key_path.display()
        );
        Self::open(&key_path, QUEUE_PROJECT_ID, true)
    }

    /// Open the queue whose key derives from `path` and `project_id`.
    pub fn open(path: &Path, project_id: u8, create: bool) -> CvdResult<Self> {
        let c_path = propagate!(
            CString::new(path.as_os_str().as_bytes()),
            "queue key path contains NUL"
        );
        // SAFETY: c_path is a valid NUL-terminated string.
        let key = unsafe { libc::ftok(c_path.as_ptr(), libc::c_int::from(project_id)) };
        if key == -1 {
            return Err(errno_err!("ftok({})", path.display()));
        }
        let flags = if create { libc::IPC_CREAT | 0o600 } else { 0 };
        // SAFETY: msgget takes no pointers.
        let id = unsafe { libc::msgget(key, flags) };
        if id == -1 {
            return Err(errno_err!("msgget(key={:#x})", key));
        }
        tracing::debug!(key, id, path = %path.display(), "Opened message queue");
        Ok(Self { id, key })
    }

    /// A queue visible only to this process and its children.
    pub fn private() -> CvdResult<Self> {
        // SAFETY: msgget takes no pointers.
        let id = unsafe { libc::msgget(libc::IPC_PRIVATE, libc::IPC_CREAT | 0o600) };
        if id == -1 {
            return Err(errno_err!("msgget(IPC_PRIVATE)"));
        }
        Ok(Self {
            id,
            key: libc::IPC_PRIVATE,
        })
    }

    pub fn id(&self) -> libc::c_int {
        self.id
    }

    pub fn key(&self) -> libc::key_t {
        self.key
    }

    pub fn send(&self, msg_type: libc::c_long, text: &[u8]) -> CvdResult<()> {
        ensure!(msg_type > 0, kind = ErrorKind::Config, "message type must be positive");
        ensure!(
            text.len() <= MAX_MESSAGE_SIZE,
            kind = ErrorKind::Config,
            "message of {} bytes exceeds {}",
            text.len(),
            MAX_MESSAGE_SIZE
        );
        let mut buffer = MessageBuffer {
            mtype: msg_type,
            mtext: [0; MAX_MESSAGE_SIZE],
        };
        buffer.mtext[..text.len()].copy_from_slice(text);
        loop {
            // SAFETY: buffer is a live, correctly laid out msgbuf of at least
            // `text.len()` payload bytes.
            let rc = unsafe {
                libc::msgsnd(
                    self.id,
                    (&buffer as *const MessageBuffer).cast(),
                    text.len(),
                    0,
                )
            };
            if rc == 0 {
                return Ok(());
            }
            let err = errno_err!("msgsnd(id={})", self.id);
            if err.errno() != Some(libc::EINTR) {
                return Err(err);
            }
        }
    }

    /// Receive one record of `msg_type`. Non-blocking receives return
    /// `None` when nothing is queued. Longer records are truncated.
    pub fn receive(
        &self,
        max_size: usize,
        msg_type: libc::c_long,
        block: bool,
    ) -> CvdResult<Option<Vec<u8>>> {
        let max_size = max_size.min(MAX_MESSAGE_SIZE);
        let mut buffer = MessageBuffer {
            mtype: 0,
            mtext: [0; MAX_MESSAGE_SIZE],
        };
        let mut flags = libc::MSG_NOERROR;
        if !block {
            flags |= libc::IPC_NOWAIT;
        }
        loop {
            // SAFETY: buffer holds MAX_MESSAGE_SIZE >= max_size payload bytes.
            let received = unsafe {
                libc::msgrcv(
                    self.id,
                    (&mut buffer as *mut MessageBuffer).cast(),
                    max_size,
                    msg_type,
                    flags,
                )
            };
            if received >= 0 {
                return Ok(Some(buffer.mtext[..received as usize].to_vec()));
            }
            let err = errno_err!("msgrcv(id={})", self.id);
            match err.errno() {
                Some(libc::EINTR) => continue,
                Some(libc::ENOMSG) if !block => return Ok(None),
                _ => return Err(err),
            }
        }
    }

    /// Delete the queue. Blocked receivers fail with `EIDRM`.
    pub fn remove(&self) -> CvdResult<()> {
        // SAFETY: IPC_RMID ignores the buffer argument.
        let rc = unsafe { libc::msgctl(self.id, libc::IPC_RMID, std::ptr::null_mut()) };
        if rc == -1 {
            let err = errno_err!("msgctl(IPC_RMID, id={})", self.id);
            if err.errno() == Some(libc::EINVAL) || err.errno() == Some(libc::EIDRM) {
                return Err(stack_err!(kind = ErrorKind::ResourceUnavailable, "queue {} already removed", self.id));
            }
            return Err(err);
        }
        Ok(())
    }
}

/// Best-effort check used by tests on kernels without SysV IPC.
pub fn sysv_ipc_supported() -> bool {
    match SysVMessageQueue::private() {
        Ok(queue) => queue.remove().is_ok(),
        Err(_) => false,
    }
}
