use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender};

/// A unit of work posted to a runner's queue.
pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

/// Sending side of a runner's FIFO queue.
///
/// Handles are held by dispatch sources and may outlive the `Runner`
/// itself; `post` hands the job back once the runner is gone so the
/// caller can fall back to inline cleanup.
#[derive(Clone)]
pub(crate) struct QueueHandle {
    tx: Sender<Job>,
    alive: Arc<AtomicBool>,
}

impl QueueHandle {
    pub(crate) fn post(&self, job: Job) -> Result<(), Job> {
        if !self.alive.load(Ordering::Acquire) {
            return Err(job);
        }
        self.tx.send(job).map_err(|rejected| rejected.0)
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }
}

pub(crate) fn channel() -> (QueueHandle, Receiver<Job>, Arc<AtomicBool>) {
    let (tx, rx) = std::sync::mpsc::channel();
    let alive = Arc::new(AtomicBool::new(true));
    let handle = QueueHandle {
        tx,
        alive: alive.clone(),
    };
    (handle, rx, alive)
}

/// Marks the queue dead and unblocks the draining thread.
///
/// Jobs still sitting in the queue are discarded, not run.
pub(crate) fn close(handle: &QueueHandle) {
    handle.alive.store(false, Ordering::Release);
    let _ = handle.tx.send(Box::new(|| {}));
}

/// Drains the queue until the runner is closed, absorbing job panics.
///
/// A panicking user callback must not take the queue thread down with it;
/// everything scheduled behind it still runs.
pub(crate) fn drain(rx: Receiver<Job>, alive: Arc<AtomicBool>) {
    while let Ok(job) = rx.recv() {
        if !alive.load(Ordering::Acquire) {
            break;
        }
        if catch_unwind(AssertUnwindSafe(job)).is_err() {
            tracing::warn!("queued job panicked; continuing");
        }
    }
}
