use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

struct Shared {
    state: AtomicBool,
    notify: Notify,
}

/// An await-able one-shot flag.
///
/// Used for worker shutdown and as the per-task stop flag. Raising the flag
/// wakes every waiter; `reset` re-arms it for reuse (a re-taken task clears
/// its stop flag before its runner starts).
#[derive(Clone)]
pub struct ShutdownFlag(Arc<Shared>);

impl ShutdownFlag {
    pub fn new() -> Self {
        Self(Arc::new(Shared {
            state: AtomicBool::new(false),
            notify: Notify::new(),
        }))
    }

    pub fn raise(&self) {
        self.0.state.store(true, Ordering::Release);
        self.0.notify.notify_waiters();
    }

    pub fn is_raised(&self) -> bool {
        self.0.state.load(Ordering::Acquire)
    }

    pub fn reset(&self) {
        self.0.state.store(false, Ordering::Release);
    }

    /// Wait until the flag is raised.
    pub async fn wait(&self) {
        loop {
            if self.is_raised() {
                return;
            }

            // Register for a wakeup before the second check so that a raise
            // between the check and the await is not lost.
            let notified = self.0.notify.notified();
            if self.is_raised() {
                return;
            }

            notified.await;
        }
    }
}

impl Default for ShutdownFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// Raises the flag when dropped, so one control loop exiting takes the rest
/// of the worker down with it.
pub struct ShutdownGuard<'a>(&'a ShutdownFlag);

impl<'a> ShutdownGuard<'a> {
    pub fn new(flag: &'a ShutdownFlag) -> Self {
        Self(flag)
    }
}

impl Drop for ShutdownGuard<'_> {
    fn drop(&mut self) {
        if !self.0.is_raised() {
            tracing::warn!("worker loop exiting without the shutdown flag being raised");
        }

        self.0.raise();
    }
}
