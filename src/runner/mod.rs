//! Cooperative execution contexts.
//!
//! A [`Runner`] owns a single OS thread that drains a FIFO queue of jobs.
//! Everything bound to one runner (event-source callbacks, task steps)
//! executes serially on that thread; runners are the unit of parallelism.

mod queue;

pub(crate) use queue::{Job, QueueHandle};

use std::thread;

/// A serial execution context with a FIFO job queue.
///
/// Dropping the runner stops its thread at the next queue inspection and
/// discards continuations scheduled after that point. Work posted to a
/// dead runner is silently dropped.
pub struct Runner {
    name: String,
    queue: QueueHandle,
}

impl Runner {
    /// Spawns the queue thread and returns the runner bound to it.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let (queue, rx, alive) = queue::channel();

        thread::Builder::new()
            .name(name.clone())
            .spawn(move || queue::drain(rx, alive))
            .expect("failed to spawn runner thread");

        Self { name, queue }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Posts a job to run cooperatively on this runner's thread.
    ///
    /// Work posted to a dropped runner is silently discarded.
    pub fn schedule(&self, f: impl FnOnce() + Send + 'static) {
        let _ = self.queue.post(Box::new(f));
    }

    pub(crate) fn queue(&self) -> QueueHandle {
        self.queue.clone()
    }
}

impl Drop for Runner {
    fn drop(&mut self) {
        queue::close(&self.queue);
    }
}

/// Access to the underlying [`Runner`] of a user-defined execution context.
///
/// Task callables receive the `Arc` of the concrete type, so state carried
/// next to the runner (counters, caches) is visible inside the callback.
pub trait AsRunner: Send + Sync + 'static {
    fn as_runner(&self) -> &Runner;
}

impl AsRunner for Runner {
    fn as_runner(&self) -> &Runner {
        self
    }
}
