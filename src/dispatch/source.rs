use super::command::Command;
use super::engine::engine;
use super::poller::Interest;
use crate::error::{Error, Result};
use crate::runner::QueueHandle;

use std::os::fd::RawFd;
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Mutex};

/// Readiness callback; receives the pending size computed at ready time.
pub(crate) type EventFn = Box<dyn FnMut(usize) + Send + 'static>;

/// Cancel callback; the sole owner of descriptor closing.
pub(crate) type CancelFn = Box<dyn FnOnce() + Send + 'static>;

/// State shared between a source handle, the engine's registry entry, and
/// the callback jobs posted to the owning runner.
pub(crate) struct Shared {
    pub(crate) fd: RawFd,
    pub(crate) interest: Interest,
    pub(crate) queue: QueueHandle,

    /// Registry token, assigned when the engine processes `Register`.
    pub(crate) token: AtomicUsize,

    pub(crate) on_event: Mutex<Option<EventFn>>,
    pub(crate) on_cancel: Mutex<Option<CancelFn>>,
}

/// A readiness source for one direction of one file descriptor.
///
/// Sources are born suspended. Once resumed, the event callback fires
/// serially on the owning runner's queue with the pending size as
/// argument. `cancel` is the only teardown path: the cancel callback is
/// delivered exactly once, after any event callback already queued, and
/// only while the source is resumed; callers cancelling a suspended
/// source must resume it first.
pub(crate) struct DispatchSource {
    shared: Arc<Shared>,
}

impl DispatchSource {
    pub(crate) fn read(fd: RawFd, queue: QueueHandle) -> Result<Self> {
        Self::create(fd, Interest::Read, queue)
    }

    pub(crate) fn write(fd: RawFd, queue: QueueHandle) -> Result<Self> {
        Self::create(fd, Interest::Write, queue)
    }

    fn create(fd: RawFd, interest: Interest, queue: QueueHandle) -> Result<Self> {
        if fd < 0 {
            return Err(Error::IllegalArgument);
        }
        if !queue.is_alive() {
            return Err(Error::RunnerUnavailable);
        }

        let shared = Arc::new(Shared {
            fd,
            interest,
            queue,
            token: AtomicUsize::new(usize::MAX),
            on_event: Mutex::new(None),
            on_cancel: Mutex::new(None),
        });

        engine().send(Command::Register(shared.clone()));

        Ok(Self { shared })
    }

    /// Installs the readiness callback. Must happen before `resume`.
    pub(crate) fn set_event(&self, f: impl FnMut(usize) + Send + 'static) {
        *self.shared.on_event.lock().unwrap() = Some(Box::new(f));
    }

    /// Installs the cancel callback. Must happen before `resume`.
    pub(crate) fn set_cancel(&self, f: impl FnOnce() + Send + 'static) {
        *self.shared.on_cancel.lock().unwrap() = Some(Box::new(f));
    }

    pub(crate) fn resume(&self) {
        engine().send(Command::Resume(self.shared.clone()));
    }

    pub(crate) fn suspend(&self) {
        engine().send(Command::Suspend(self.shared.clone()));
    }

    pub(crate) fn cancel(&self) {
        engine().send(Command::Cancel(self.shared.clone()));
    }
}
