//! Suspend/resume gate shared by guest-facing workers.
//!
//! Workers take a [`ResumedGuard`] around each unit of work; while any guard
//! is alive the instance cannot be suspended, and while the latch is
//! suspended no new guard is handed out.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct LatchState {
    suspended: bool,
    /// Live `ResumedGuard`s.
    readers: usize,
    /// A blocking `suspend` is draining readers; no new guards meanwhile.
    suspend_pending: bool,
}

#[derive(Debug, Default)]
pub struct SnapshotLatch {
    state: Mutex<LatchState>,
    changed: Condvar,
}

impl SnapshotLatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_suspended(&self) -> bool {
        self.state.lock().suspended
    }

    /// Suspend if no worker currently holds a guard. Never blocks and does
    /// not wake anyone.
    pub fn try_suspend(&self) -> bool {
        let mut state = self.state.lock();
        if state.readers > 0 || state.suspend_pending {
            return false;
        }
        state.suspended = true;
        true
    }

    /// Resume and wake every waiting worker. Fails only while guards are
    /// held, which cannot happen once suspended.
    pub fn resume_and_notify(&self) -> bool {
        {
            let mut state = self.state.lock();
            if state.readers > 0 || state.suspend_pending {
                return false;
            }
            state.suspended = false;
        }
        self.changed.notify_all();
        true
    }

    /// Suspend, waiting up to `timeout` for live guards to drop.
    ///
    /// New guards are refused while waiting, so busy workers cannot starve
    /// the suspend. On timeout the latch stays resumed.
    pub fn suspend(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        if state.suspend_pending {
            return false;
        }
        state.suspend_pending = true;
        while state.readers > 0 {
            if self.changed.wait_until(&mut state, deadline).timed_out() && state.readers > 0 {
                state.suspend_pending = false;
                drop(state);
                self.changed.notify_all();
                return false;
            }
        }
        state.suspend_pending = false;
        state.suspended = true;
        true
    }

    /// Block until the latch is resumed and return a guard that keeps it so.
    pub fn wait_initialized_or_resumed(&self) -> ResumedGuard<'_> {
        let mut state = self.state.lock();
        while state.suspended || state.suspend_pending {
            self.changed.wait(&mut state);
        }
        state.readers += 1;
        ResumedGuard { latch: self }
    }

    /// Like [`wait_initialized_or_resumed`](Self::wait_initialized_or_resumed)
    /// with a deadline. `None` on timeout.
    pub fn wait_resumed_for(&self, timeout: Duration) -> Option<ResumedGuard<'_>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.suspended || state.suspend_pending {
            if self.changed.wait_until(&mut state, deadline).timed_out()
                && (state.suspended || state.suspend_pending)
            {
                return None;
            }
        }
        state.readers += 1;
        Some(ResumedGuard { latch: self })
    }
}

/// Shared hold on a resumed [`SnapshotLatch`].
#[derive(Debug)]
pub struct ResumedGuard<'a> {
    latch: &'a SnapshotLatch,
}

impl Drop for ResumedGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.latch.state.lock();
        state.readers -= 1;
        let last = state.readers == 0;
        drop(state);
        if last {
            self.latch.changed.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_initially_resumed() {
        let latch = SnapshotLatch::new();
        assert!(!latch.is_suspended());
        let _guard = latch.wait_initialized_or_resumed();
    }

    #[test]
    fn test_try_suspend_fails_while_guard_held() {
        let latch = SnapshotLatch::new();
        let guard = latch.wait_initialized_or_resumed();
        assert!(!latch.try_suspend());
        drop(guard);
        assert!(latch.try_suspend());
        assert!(latch.is_suspended());
    }

    #[test]
    fn test_suspended_latch_refuses_guards() {
        let latch = SnapshotLatch::new();
        assert!(latch.try_suspend());
        assert!(latch.wait_resumed_for(Duration::from_millis(50)).is_none());
        assert!(latch.resume_and_notify());
        assert!(latch.wait_resumed_for(Duration::from_millis(50)).is_some());
    }

    #[test]
    fn test_resume_wakes_waiters() {
        let latch = Arc::new(SnapshotLatch::new());
        assert!(latch.try_suspend());
        let passed = Arc::new(AtomicUsize::new(0));
        let workers: Vec<_> = (0..3)
            .map(|_| {
                let latch = Arc::clone(&latch);
                let passed = Arc::clone(&passed);
                std::thread::spawn(move || {
                    let _guard = latch.wait_initialized_or_resumed();
                    passed.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(passed.load(Ordering::SeqCst), 0);
        assert!(latch.resume_and_notify());
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(passed.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_blocking_suspend_drains_readers() {
        let latch = Arc::new(SnapshotLatch::new());
        let holder = {
            let latch = Arc::clone(&latch);
            std::thread::spawn(move || {
                let _guard = latch.wait_initialized_or_resumed();
                std::thread::sleep(Duration::from_millis(100));
            })
        };
        std::thread::sleep(Duration::from_millis(20));
        assert!(latch.suspend(Duration::from_secs(5)));
        assert!(latch.is_suspended());
        holder.join().unwrap();
    }

    #[test]
    fn test_blocking_suspend_times_out() {
        let latch = SnapshotLatch::new();
        let guard = latch.wait_initialized_or_resumed();
        assert!(!latch.suspend(Duration::from_millis(50)));
        assert!(!latch.is_suspended());
        drop(guard);
        let _again = latch.wait_initialized_or_resumed();
    }
}
