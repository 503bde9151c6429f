//! Concurrency primitives: a rendezvous event with `set`/`reset`/`wait`
//! semantics and the scheduler adapter the runtime spawns background work
//! through.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

/// A rendezvous object. `wait` suspends until `set` is called; `reset` arms
/// it again for reuse. All current waiters are woken by a single `set`.
#[derive(Debug, Default)]
pub struct Event {
    signalled: AtomicBool,
    notify: Notify,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal the event, waking every waiter.
    pub fn set(&self) {
        self.signalled.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// Arm the event so future `wait` calls block again.
    pub fn reset(&self) {
        self.signalled.store(false, Ordering::Release);
    }

    /// Suspend until the event is signalled. Returns immediately if it
    /// already is.
    pub async fn wait(&self) {
        loop {
            // Register interest before re-checking the flag so a concurrent
            // set() cannot be missed between the check and the await.
            let notified = self.notify.notified();
            if self.signalled.load(Ordering::Acquire) {
                return;
            }
            notified.await;
        }
    }

    pub fn is_set(&self) -> bool {
        self.signalled.load(Ordering::Acquire)
    }
}

/// Hand a task to the I/O scheduler. Detached; the runtime uses this for
/// work that must outlive the caller, such as the remote release issued
/// when the last handle to a proxy drops.
///
/// Outside a runtime (process teardown) the task is dropped with a warning
/// rather than panicking.
pub fn spawn<F>(future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(future);
        }
        Err(_) => {
            tracing::warn!("no scheduler available, dropping background task");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn set_wakes_waiter() {
        let event = Arc::new(Event::new());
        let waiter = {
            let event = event.clone();
            tokio::spawn(async move { event.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        event.set();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter woke")
            .unwrap();
    }

    #[tokio::test]
    async fn wait_returns_immediately_when_already_set() {
        let event = Event::new();
        event.set();
        event.wait().await;
        assert!(event.is_set());
    }

    #[tokio::test]
    async fn reset_rearms() {
        let event = Event::new();
        event.set();
        event.wait().await;
        event.reset();
        assert!(!event.is_set());
        let timed_out =
            tokio::time::timeout(Duration::from_millis(20), event.wait()).await;
        assert!(timed_out.is_err());
    }
}
