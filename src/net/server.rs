use super::{EventSource, absorb};
use crate::dispatch::DispatchSource;
use crate::dispatch::poller::platform::{
    socketaddr_to_storage, sys_accept, sys_bind, sys_close, sys_is_listening, sys_listen,
    sys_set_nonblocking, sys_set_reuseaddr, sys_socket, sys_sockname,
};
use crate::error::{Error, Result};
use crate::runner::Runner;

use libc::{AF_INET, AF_INET6, c_int};
use std::net::{IpAddr, SocketAddr};
use std::os::fd::RawFd;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};

const LISTEN_BACKLOG: c_int = 10;

/// Accept callback of a [`Server`], held weakly by the framework.
///
/// Returning `true` takes ownership of the accepted descriptor; on
/// `false` (or a panic) the framework closes it.
pub trait ServerHandler: Send + Sync + 'static {
    fn on_connect(&self, fd: RawFd, peer: IpAddr, port: u16) -> bool;
}

/// A listening TCP socket dispatching accepted connections to its runner.
///
/// The server is constructed suspended; [`start`](EventSource::start)
/// begins accepting. The listen descriptor is closed by the cancel path
/// that [`shutdown`](EventSource::shutdown) triggers, exactly once.
pub struct Server {
    name: String,
    fd: RawFd,
    source: DispatchSource,
    started: AtomicBool,
    finished: AtomicBool,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server").field("name", &self.name).field("fd", &self.fd).finish()
    }
}

impl Server {
    /// Creates a listening socket bound to `addr:port`.
    ///
    /// Sets `SO_REUSEADDR` and listens with a backlog of 10. Socket,
    /// bind, and listen failures surface before any source exists.
    pub fn bind<H>(runner: &Arc<Runner>, addr: IpAddr, port: u16, handler: &Arc<H>) -> Result<Self>
    where
        H: ServerHandler,
    {
        let domain = match addr {
            IpAddr::V4(_) => AF_INET,
            IpAddr::V6(_) => AF_INET6,
        };
        let fd = sys_socket(domain).map_err(|e| Error::operation("socket", e))?;

        let prepared = sys_set_reuseaddr(fd)
            .map_err(|e| Error::operation("setsockopt", e))
            .and_then(|_| {
                let (storage, len) = socketaddr_to_storage(&SocketAddr::new(addr, port));
                sys_bind(fd, &storage, len).map_err(|e| Error::operation("bind", e))
            })
            .and_then(|_| {
                sys_listen(fd, LISTEN_BACKLOG).map_err(|e| Error::operation("listen", e))
            })
            .and_then(|_| Self::with_listener(runner, fd, handler));

        match prepared {
            Ok(server) => Ok(server),
            Err(error) => {
                sys_close(fd);
                Err(error)
            }
        }
    }

    /// Adopts a descriptor that is already listening.
    ///
    /// The descriptor is forced non-blocking. On error the caller keeps
    /// ownership of it.
    pub fn adopt<H>(runner: &Arc<Runner>, fd: RawFd, handler: &Arc<H>) -> Result<Self>
    where
        H: ServerHandler,
    {
        if fd < 0 || !sys_is_listening(fd) {
            return Err(Error::IllegalArgument);
        }
        sys_set_nonblocking(fd).map_err(|e| Error::operation("fcntl", e))?;

        Self::with_listener(runner, fd, handler)
    }

    fn with_listener<H>(runner: &Arc<Runner>, fd: RawFd, handler: &Arc<H>) -> Result<Self>
    where
        H: ServerHandler,
    {
        let source = DispatchSource::read(fd, runner.queue())?;

        let strong: Arc<dyn ServerHandler> = handler.clone();
        let handler: Weak<dyn ServerHandler> = Arc::downgrade(&strong);

        source.set_event(move |pending| {
            for _ in 0..pending {
                let (client, peer) = match sys_accept(fd) {
                    Ok(accepted) => accepted,
                    Err(error) => {
                        tracing::trace!(%error, "accept failed");
                        break;
                    }
                };

                // accept even without a live handler so readiness does not
                // keep firing for the same pending connection
                let Some(callback) = handler.upgrade() else {
                    sys_close(client);
                    continue;
                };

                let accepted =
                    absorb("connect", || callback.on_connect(client, peer.ip(), peer.port()))
                        .unwrap_or(false);
                if !accepted {
                    sys_close(client);
                }
            }
        });

        // the engine releases the source registration before this runs
        source.set_cancel(move || {
            sys_close(fd);
            tracing::debug!(fd, "listener released");
        });

        Ok(Self {
            name: "fluentis.net.server".into(),
            fd,
            source,
            started: AtomicBool::new(false),
            finished: AtomicBool::new(false),
        })
    }

    /// The bound address of the listening socket.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        sys_sockname(self.fd).map_err(|e| Error::operation("getsockname", e))
    }
}

impl EventSource for Server {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&self) {
        if self.finished.load(Ordering::Acquire) {
            return;
        }
        if !self.started.swap(true, Ordering::AcqRel) {
            self.source.resume();
        }
    }

    fn stop(&self) {
        if self.finished.load(Ordering::Acquire) {
            return;
        }
        if self.started.swap(false, Ordering::AcqRel) {
            self.source.suspend();
        }
    }

    fn shutdown(&self) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        // cancellation only goes through on a resumed source
        if !self.started.swap(true, Ordering::AcqRel) {
            self.source.resume();
        }
        self.source.cancel();
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}
