//! Explicit runtime context for scheduled network work.
//!
//! The original design point: components never reach for a process-wide
//! runtime. The entry point owns the tokio runtime and hands out a
//! [`Reactor`] — a runtime handle paired with a task tracker. The tracker
//! doubles as the shutdown keep-alive: it is closed once the control loop
//! exits, then awaited so operations scheduled before shutdown get a chance
//! to complete. Nothing actively cancels them.

use std::future::Future;

use tokio::runtime::Handle;
use tokio_util::task::TaskTracker;

/// Handle to the reactor plus the set of in-flight scheduled tasks.
#[derive(Clone)]
pub struct Reactor {
    handle: Handle,
    tasks: TaskTracker,
}

impl Reactor {
    #[must_use]
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            tasks: TaskTracker::new(),
        }
    }

    /// Schedules `future` on the reactor, tracked until it completes.
    ///
    /// Callable from any thread; never blocks.
    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let _task = self.tasks.spawn_on(future, &self.handle);
    }

    /// Stops accepting the keep-alive and waits for in-flight work.
    ///
    /// Tasks may still be scheduled afterwards (a completing batch can
    /// trigger the next round); the wait covers those too.
    pub async fn drain(&self) {
        self.tasks.close();
        self.tasks.wait().await;
    }
}
