use super::command::Command;
use super::poller::{Interest, Poller, Waker, platform};
use super::source::Shared;
use crate::runner::Job;
use crate::utils::Slab;

use std::sync::atomic::Ordering;
use std::sync::mpsc::{Receiver, Sender, TryRecvError, channel};
use std::sync::{Arc, OnceLock};
use std::thread;

/// Handle used to submit commands to the engine thread.
#[derive(Clone)]
pub(crate) struct EngineHandle {
    tx: Sender<Command>,
    waker: Arc<Waker>,
}

impl EngineHandle {
    pub(crate) fn send(&self, command: Command) {
        if self.tx.send(command).is_ok() {
            self.waker.wake();
        }
    }
}

static ENGINE: OnceLock<EngineHandle> = OnceLock::new();

/// The process-wide dispatch engine, started lazily on first use.
pub(crate) fn engine() -> &'static EngineHandle {
    ENGINE.get_or_init(Engine::start)
}

/// Per-source bookkeeping, owned exclusively by the engine thread.
struct Entry {
    shared: Arc<Shared>,

    /// Resumed by the owner; sources are created suspended.
    armed: bool,

    /// An event callback is queued or running on the owner's runner.
    in_flight: bool,

    cancel_requested: bool,

    /// Listening sockets report pending connections, not readable bytes.
    listening: bool,
}

/// Single-threaded readiness engine.
///
/// Owns the poller, the source registry, and the command channel. Every
/// lifecycle transition of every source happens here; handles only post
/// commands. Readiness deliveries are oneshot: a dispatched event leaves
/// the descriptor disarmed until the owning queue reports the callback
/// finished via `Rearm`, which serializes deliveries per source and
/// coalesces readiness while a callback runs.
pub(crate) struct Engine {
    receiver: Receiver<Command>,
    poller: Poller,
    ready: Vec<usize>,
    sources: Slab<Entry>,
}

impl Engine {
    fn start() -> EngineHandle {
        let (tx, rx) = channel();
        let poller = Poller::new();
        let waker = poller.waker();

        let mut engine = Engine {
            receiver: rx,
            poller,
            ready: Vec::with_capacity(64),
            sources: Slab::with_capacity(64),
        };

        thread::Builder::new()
            .name("dispatch-engine".into())
            .spawn(move || engine.run())
            .expect("failed to spawn dispatch engine thread");

        tracing::debug!("dispatch engine started");

        EngineHandle { tx, waker }
    }

    fn run(&mut self) {
        loop {
            let ready: Vec<usize> = self.ready.drain(..).collect();
            for token in ready {
                self.dispatch(token);
            }

            loop {
                match self.receiver.try_recv() {
                    Ok(command) => self.apply(command),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => return,
                }
            }

            if let Err(error) = self.poller.poll(&mut self.ready) {
                tracing::warn!(%error, "readiness poll failed");
            }
        }
    }

    /// Resolves a command's source to its registry token.
    ///
    /// The pointer comparison guards against a reused token reaching a
    /// source registered later in the same slot (stale `Rearm` after a
    /// finished cancel).
    fn lookup(&self, shared: &Arc<Shared>) -> Option<usize> {
        let token = shared.token.load(Ordering::Acquire);
        let entry = self.sources.get(token)?;
        Arc::ptr_eq(&entry.shared, shared).then_some(token)
    }

    fn apply(&mut self, command: Command) {
        match command {
            Command::Register(shared) => {
                let listening = platform::sys_is_listening(shared.fd);
                let fd = shared.fd;
                let token = self.sources.insert(Entry {
                    shared: shared.clone(),
                    armed: false,
                    in_flight: false,
                    cancel_requested: false,
                    listening,
                });
                shared.token.store(token, Ordering::Release);
                self.poller.add(fd, token);
                tracing::trace!(fd, token, "source registered");
            }

            Command::Resume(shared) => {
                let Some(token) = self.lookup(&shared) else {
                    return;
                };
                let entry = self.sources.get_mut(token).unwrap();
                if entry.armed {
                    return;
                }
                entry.armed = true;
                if entry.cancel_requested {
                    if !entry.in_flight {
                        self.finish_cancel(token);
                    }
                } else if !entry.in_flight {
                    self.poller.arm(entry.shared.fd, token, entry.shared.interest);
                }
            }

            Command::Suspend(shared) => {
                let Some(token) = self.lookup(&shared) else {
                    return;
                };
                let entry = self.sources.get_mut(token).unwrap();
                if !entry.armed {
                    return;
                }
                entry.armed = false;
                if !entry.in_flight && !entry.cancel_requested {
                    self.poller.disarm(entry.shared.fd, token);
                }
            }

            Command::Cancel(shared) => {
                let Some(token) = self.lookup(&shared) else {
                    return;
                };
                let entry = self.sources.get_mut(token).unwrap();
                if entry.cancel_requested {
                    return;
                }
                entry.cancel_requested = true;
                // delivery waits for a resumed source and for any event
                // callback already on the queue
                if entry.armed && !entry.in_flight {
                    self.finish_cancel(token);
                }
            }

            Command::Rearm(shared) => {
                let Some(token) = self.lookup(&shared) else {
                    return;
                };
                let entry = self.sources.get_mut(token).unwrap();
                entry.in_flight = false;
                if entry.cancel_requested {
                    if entry.armed {
                        self.finish_cancel(token);
                    }
                } else if entry.armed {
                    self.poller.arm(entry.shared.fd, token, entry.shared.interest);
                }
            }
        }
    }

    /// Delivers one readiness event to the owning runner's queue.
    fn dispatch(&mut self, token: usize) {
        let Some(entry) = self.sources.get_mut(token) else {
            return;
        };
        if !entry.armed || entry.in_flight || entry.cancel_requested {
            return;
        }

        let pending = match entry.shared.interest {
            Interest::Read if entry.listening => 1,
            Interest::Read => platform::sys_pending_bytes(entry.shared.fd),
            Interest::Write => platform::sys_write_capacity(entry.shared.fd),
        };

        let shared = entry.shared.clone();
        let job: Job = Box::new(move || {
            if let Some(handler) = shared.on_event.lock().unwrap().as_mut() {
                handler(pending);
            }
            engine().send(Command::Rearm(shared.clone()));
        });

        // the kernel disarmed this delivery (oneshot); the Rearm command
        // re-arms once the callback has run. A dead runner drops the
        // event instead; the descriptor stays disarmed, and `armed` keeps
        // the owner's intent so a later cancel still goes through.
        match entry.shared.queue.post(job) {
            Ok(()) => entry.in_flight = true,
            Err(_) => tracing::trace!(fd = entry.shared.fd, "dropping event for dead runner"),
        }
    }

    /// Removes the source and delivers its cancel callback exactly once.
    ///
    /// The callback owns descriptor closing and buffer release. It runs on
    /// the owning runner's queue; if the runner is gone it runs right here
    /// so resources are still released.
    fn finish_cancel(&mut self, token: usize) {
        let Some(entry) = self.sources.remove(token) else {
            return;
        };
        let shared = entry.shared;
        self.poller.remove(shared.fd);
        tracing::trace!(fd = shared.fd, token, "source cancelled");

        let queue = shared.queue.clone();
        let cleanup: Job = Box::new(move || {
            // the event closure holds the owner's back-reference; dropping
            // it here breaks the ownership cycle
            shared.on_event.lock().unwrap().take();
            if let Some(cancel) = shared.on_cancel.lock().unwrap().take() {
                cancel();
            }
        });

        if let Err(cleanup) = queue.post(cleanup) {
            cleanup();
        }
    }
}
