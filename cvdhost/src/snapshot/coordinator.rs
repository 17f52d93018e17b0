//! Control-socket loop driving suspend, resume and snapshot requests.

use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use cvdhost_shared::errors::{CvdResult, StackTraceError};
use cvdhost_shared::{propagate, stack_entry, stack_err};
use cvdhost_shared::protocol::{
    ExtendedActionType, LauncherAction, LauncherReply, LauncherRequest, read_record, write_record,
};

use super::latch::SnapshotLatch;
use crate::fd::{ScopedFd, socket};

pub const NOT_SUSPENDED_MESSAGE: &str = "The device is not suspended, and snapshot cannot be taken";

/// Actions the coordinator performs on the instance it controls.
pub trait LauncherHooks: Send + Sync {
    /// Pause the cohort. Called after the latch is suspended.
    fn suspend(&self) -> CvdResult<()>;

    /// Continue the cohort. Called before the latch is resumed.
    fn resume(&self) -> CvdResult<()>;

    /// Persist a snapshot into `directory`. Only called while suspended.
    fn snapshot_take(&self, directory: &str) -> CvdResult<()>;

    /// Tear the instance down. Called after the reply was sent.
    fn stop(&self) -> CvdResult<()>;
}

pub struct SnapshotCoordinator {
    latch: Arc<SnapshotLatch>,
    hooks: Arc<dyn LauncherHooks>,
    suspend_timeout: Duration,
}

impl SnapshotCoordinator {
    pub fn new(latch: Arc<SnapshotLatch>, hooks: Arc<dyn LauncherHooks>) -> Self {
        Self {
            latch,
            hooks,
            suspend_timeout: Duration::from_secs(30),
        }
    }

    /// Limit for draining workers before a suspend gives up.
    pub fn with_suspend_timeout(mut self, timeout: Duration) -> Self {
        self.suspend_timeout = timeout;
        self
    }

    pub fn latch(&self) -> &Arc<SnapshotLatch> {
        &self.latch
    }

    /// Answer one request. The flag is true when the caller should stop
    /// serving and run [`LauncherHooks::stop`].
    pub fn handle_request(&self, request: &LauncherRequest) -> (LauncherReply, bool) {
        match request.action {
            LauncherAction::Stop => (LauncherReply::success(), true),
            LauncherAction::Status => (LauncherReply::success(), false),
            LauncherAction::Extended => {
                let reply = match request.extended_type {
                    Some(ExtendedActionType::Suspend) => self.suspend(),
                    Some(ExtendedActionType::Resume) => self.resume(),
                    Some(ExtendedActionType::SnapshotTake) => {
                        self.snapshot_take(&request.serialized_data)
                    }
                    Some(ExtendedActionType::Unknown) => LauncherReply::unknown_action(),
                    None => LauncherReply::error("extended action without a type"),
                };
                (reply, false)
            }
        }
    }

    fn suspend(&self) -> LauncherReply {
        if self.latch.is_suspended() {
            tracing::debug!("Suspend requested while already suspended");
            return LauncherReply::success();
        }
        if !self.latch.suspend(self.suspend_timeout) {
            return LauncherReply::error("timed out waiting for workers to pause");
        }
        if let Err(err) = self.hooks.suspend() {
            tracing::error!("Suspending the cohort failed: {}", err);
            self.latch.resume_and_notify();
            return LauncherReply::error(err.message());
        }
        tracing::info!("Instance suspended");
        LauncherReply::success()
    }

    fn resume(&self) -> LauncherReply {
        if !self.latch.is_suspended() {
            tracing::debug!("Resume requested while running");
            return LauncherReply::success();
        }
        if let Err(err) = self.hooks.resume() {
            tracing::error!("Resuming the cohort failed: {}", err);
            return LauncherReply::error(err.message());
        }
        if !self.latch.resume_and_notify() {
            return LauncherReply::error("latch could not be resumed");
        }
        tracing::info!("Instance resumed");
        LauncherReply::success()
    }

    fn snapshot_take(&self, directory: &str) -> LauncherReply {
        if !self.latch.is_suspended() {
            return LauncherReply::error(NOT_SUSPENDED_MESSAGE);
        }
        match self.hooks.snapshot_take(directory) {
            Ok(()) => LauncherReply::success(),
            Err(err) => {
                tracing::error!(directory, "Snapshot failed: {}", err);
                LauncherReply::error(err.message())
            }
        }
    }

    /// Serve requests on `listener` until a `Stop` request arrives or the
    /// listener is shut down.
    pub fn serve(&self, listener: &ScopedFd, shutting_down: &AtomicBool) -> CvdResult<()> {
        loop {
            let conn = match socket::accept(listener) {
                Ok(conn) => conn,
                Err(_) if shutting_down.load(Ordering::SeqCst) => return Ok(()),
                Err(err) => {
                    return Err(StackTraceError::from(err)
                        .push_entry(stack_entry!().with_message("accepting on the control socket")));
                }
            };
            let Some(owned) = conn.into_owned() else {
                continue;
            };
            if self.serve_connection(UnixStream::from(owned)) {
                if let Err(err) = self.hooks.stop() {
                    tracing::error!("Stopping the instance failed: {}", err);
                }
                return Ok(());
            }
        }
    }

    /// Returns true after a `Stop` request was answered.
    fn serve_connection(&self, mut stream: UnixStream) -> bool {
        loop {
            let request: LauncherRequest = match read_record(&mut stream) {
                Ok(Some(request)) => request,
                Ok(None) => return false,
                Err(err) => {
                    tracing::warn!("Bad launcher control record: {}", err);
                    if let Err(err) = write_record(&mut stream, &LauncherReply::error(err.message())) {
                        tracing::debug!("Could not report the bad record: {}", err);
                    }
                    return false;
                }
            };
            tracing::debug!(?request, "Launcher control request");
            let (reply, stop) = self.handle_request(&request);
            if let Err(err) = write_record(&mut stream, &reply) {
                tracing::warn!("Could not answer launcher control request: {}", err);
            }
            if stop {
                return true;
            }
        }
    }

    /// Serve on a background thread.
    pub fn spawn(self, listener: ScopedFd) -> CvdResult<CoordinatorHandle> {
        let listener = Arc::new(listener);
        let shutting_down = Arc::new(AtomicBool::new(false));
        let thread = {
            let listener = Arc::clone(&listener);
            let shutting_down = Arc::clone(&shutting_down);
            propagate!(
                thread::Builder::new()
                    .name("snapshot-coordinator".into())
                    .spawn(move || self.serve(&listener, &shutting_down)),
                "spawning snapshot coordinator"
            )
        };
        Ok(CoordinatorHandle {
            listener,
            shutting_down,
            thread: Some(thread),
        })
    }
}

/// Running coordinator. Shut down by closing its listener.
pub struct CoordinatorHandle {
    listener: Arc<ScopedFd>,
    shutting_down: Arc<AtomicBool>,
    thread: Option<JoinHandle<CvdResult<()>>>,
}

impl CoordinatorHandle {
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Stop accepting and wait for the loop to exit.
    pub fn shutdown(mut self) -> CvdResult<()> {
        self.shutting_down.store(true, Ordering::SeqCst);
        // Wakes the blocked accept(2).
        let _ = self.listener.shutdown(std::net::Shutdown::Both);
        match self.thread.take().map(JoinHandle::join) {
            Some(Ok(result)) => result,
            Some(Err(_)) => Err(stack_err!("snapshot coordinator panicked")),
            None => Ok(()),
        }
    }

    /// Wait for the loop to end on its own (after a `Stop` request).
    pub fn join(mut self) -> CvdResult<()> {
        match self.thread.take().map(JoinHandle::join) {
            Some(Ok(result)) => result,
            Some(Err(_)) => Err(stack_err!("snapshot coordinator panicked")),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cvdhost_shared::protocol::LauncherResponse;
    use parking_lot::Mutex;
    use std::io::Write;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
    }

    impl LauncherHooks for Recorder {
        fn suspend(&self) -> CvdResult<()> {
            self.calls.lock().push("suspend".into());
            Ok(())
        }

        fn resume(&self) -> CvdResult<()> {
            self.calls.lock().push("resume".into());
            Ok(())
        }

        fn snapshot_take(&self, directory: &str) -> CvdResult<()> {
            self.calls.lock().push(format!("snapshot {}", directory));
            Ok(())
        }

        fn stop(&self) -> CvdResult<()> {
            self.calls.lock().push("stop".into());
            Ok(())
        }
    }

    fn coordinator() -> (SnapshotCoordinator, Arc<Recorder>) {
        let hooks = Arc::new(Recorder::default());
        let coordinator = SnapshotCoordinator::new(Arc::new(SnapshotLatch::new()), hooks.clone())
            .with_suspend_timeout(Duration::from_millis(200));
        (coordinator, hooks)
    }

    fn extended(kind: ExtendedActionType) -> LauncherRequest {
        LauncherRequest::extended(kind, "")
    }

    #[test]
    fn test_suspend_then_resume() {
        let (coordinator, hooks) = coordinator();
        let (reply, stop) = coordinator.handle_request(&extended(ExtendedActionType::Suspend));
        assert_eq!(reply.launcher_response, LauncherResponse::Success);
        assert!(!stop);
        assert!(coordinator.latch().is_suspended());
        let (reply, _) = coordinator.handle_request(&extended(ExtendedActionType::Resume));
        assert_eq!(reply.launcher_response, LauncherResponse::Success);
        assert!(!coordinator.latch().is_suspended());
        assert_eq!(*hooks.calls.lock(), vec!["suspend", "resume"]);
    }

    #[test]
    fn test_snapshot_requires_suspend() {
        let (coordinator, hooks) = coordinator();
        let request = LauncherRequest::extended(ExtendedActionType::SnapshotTake, "/snap");
        let (reply, _) = coordinator.handle_request(&request);
        assert_eq!(reply.launcher_response, LauncherResponse::Error);
        assert_eq!(reply.message.as_deref(), Some(NOT_SUSPENDED_MESSAGE));

        coordinator.handle_request(&extended(ExtendedActionType::Suspend));
        let (reply, _) = coordinator.handle_request(&request);
        assert_eq!(reply.launcher_response, LauncherResponse::Success);
        assert_eq!(hooks.calls.lock().last().unwrap(), "snapshot /snap");
    }

    #[test]
    fn test_suspend_times_out_while_worker_busy() {
        let (coordinator, hooks) = coordinator();
        let _guard = coordinator.latch().wait_initialized_or_resumed();
        let (reply, _) = coordinator.handle_request(&extended(ExtendedActionType::Suspend));
        assert_eq!(reply.launcher_response, LauncherResponse::Error);
        assert!(hooks.calls.lock().is_empty());
    }

    #[test]
    fn test_status_stop_and_unknown() {
        let (coordinator, _) = coordinator();
        let (reply, stop) = coordinator.handle_request(&LauncherRequest::simple(LauncherAction::Status));
        assert_eq!(reply.launcher_response, LauncherResponse::Success);
        assert!(!stop);
        let (reply, _) = coordinator.handle_request(&extended(ExtendedActionType::Unknown));
        assert_eq!(reply.launcher_response, LauncherResponse::UnknownAction);
        let (reply, stop) = coordinator.handle_request(&LauncherRequest::simple(LauncherAction::Stop));
        assert_eq!(reply.launcher_response, LauncherResponse::Success);
        assert!(stop);
    }

    #[test]
    fn test_serve_over_socket_until_stop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("launcher_monitor.sock");
        let listener = socket::unix_server(&path, 0o700).unwrap();
        let (coordinator, hooks) = coordinator();
        let handle = coordinator.spawn(listener).unwrap();

        let mut stream = UnixStream::connect(&path).unwrap();
        write_record(&mut stream, &extended(ExtendedActionType::Suspend)).unwrap();
        let reply: LauncherReply = read_record(&mut stream).unwrap().unwrap();
        assert_eq!(reply.launcher_response, LauncherResponse::Success);
        write_record(&mut stream, &LauncherRequest::simple(LauncherAction::Stop)).unwrap();
        let reply: LauncherReply = read_record(&mut stream).unwrap().unwrap();
        assert_eq!(reply.launcher_response, LauncherResponse::Success);

        handle.join().unwrap();
        assert_eq!(*hooks.calls.lock(), vec!["suspend", "stop"]);
    }

    #[test]
    fn test_bad_record_is_answered_with_error() {
        let (coordinator, hooks) = coordinator();
        let (mut client, server) = UnixStream::pair().unwrap();
        let body = b"not json";
        client.write_all(&(body.len() as u32).to_le_bytes()).unwrap();
        client.write_all(body).unwrap();

        assert!(!coordinator.serve_connection(server));
        let reply: LauncherReply = read_record(&mut client).unwrap().unwrap();
        assert_eq!(reply.launcher_response, LauncherResponse::Error);
        assert!(hooks.calls.lock().is_empty());
    }

    #[test]
    fn test_bad_record_from_departed_peer() {
        let (coordinator, _) = coordinator();
        let (mut client, server) = UnixStream::pair().unwrap();
        client.write_all(&[1, 0]).unwrap();
        drop(client);
        assert!(!coordinator.serve_connection(server));
    }

    #[test]
    fn test_shutdown_unblocks_accept() {
        let dir = tempfile::tempdir().unwrap();
        let listener = socket::unix_server(&dir.path().join("c.sock"), 0o700).unwrap();
        let (coordinator, _) = coordinator();
        let handle = coordinator.spawn(listener).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        handle.shutdown().unwrap();
    }
}
