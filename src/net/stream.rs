use super::{EventSource, absorb};
use crate::dispatch::DispatchSource;
use crate::dispatch::poller::platform::{
    sys_close, sys_connect, sys_dup, sys_read, sys_set_nonblocking, sys_socket, sys_write,
};
use crate::error::{Error, Result};
use crate::runner::{QueueHandle, Runner};

use libc::{AF_INET, AF_INET6, EINPROGRESS};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Free send-buffer space at or below this value on the first writer
/// readiness marks a failed connect attempt. A healthy socket reports
/// tens of kilobytes or more; a failed one reports zero (see
/// `sys_write_capacity`). Platforms with a different readiness proxy
/// adjust this predicate, not the state machine.
const CONNECT_SPACE_THRESHOLD: usize = 2048;

/// Out-of-band stream notifications.
///
/// Exactly one of `Connected` or `ConnectFailed` follows a connect
/// attempt, before any read or write callback. `Disconnected` is
/// delivered at most once and is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamEvent {
    Connected,
    ConnectFailed,
    Disconnected,
}

/// Callback set of a [`Stream`], held weakly by the framework.
///
/// All callbacks run serially on the stream's runner. A dead handler
/// silently drops the event; a panicking handler is absorbed.
pub trait StreamHandler: Send + Sync + 'static {
    /// Data arrived. `buf` holds the received bytes and may be swapped
    /// via [`ReadBuffer::replace`].
    fn on_read(&self, buf: &mut ReadBuffer);

    /// A write submitted through [`Stream::write`] was fully drained.
    fn on_write(&self, data: &[u8], size: usize);

    fn on_event(&self, event: StreamEvent);
}

/// The stream's receive buffer, presented to `on_read`.
///
/// The backing storage is either supplied by the caller at stream
/// creation or allocated by the stream itself. A handler that wants to
/// keep the received bytes swaps in fresh storage; the replaced buffer is
/// handed back iff the stream did not allocate it, and the adopted one
/// counts as caller-supplied from then on.
pub struct ReadBuffer {
    data: Vec<u8>,
    len: usize,
    mine: bool,
}

impl ReadBuffer {
    fn new(data: Option<Vec<u8>>, size: usize) -> Self {
        match data {
            Some(data) => Self {
                data,
                len: 0,
                mine: false,
            },
            None => Self {
                data: vec![0; size],
                len: 0,
                mine: true,
            },
        }
    }

    /// The bytes received by the read that triggered `on_read`.
    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Swaps the backing storage.
    ///
    /// Returns the previous buffer when it was caller-supplied; storage
    /// the stream allocated itself is dropped here instead.
    pub fn replace(&mut self, new: Vec<u8>) -> Option<Vec<u8>> {
        let old = std::mem::replace(&mut self.data, new);
        self.len = 0;
        if self.mine {
            self.mine = false;
            None
        } else {
            Some(old)
        }
    }

    fn fill(&mut self, fd: RawFd) -> isize {
        let n = sys_read(fd, &mut self.data);
        self.len = if n > 0 { n as usize } else { 0 };
        n
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
enum State {
    Disconnected = 0,
    Starting = 1,
    Connecting = 2,
    Connected = 3,
}

impl State {
    fn from_u8(raw: u8) -> State {
        match raw {
            1 => State::Starting,
            2 => State::Connecting,
            3 => State::Connected,
            _ => State::Disconnected,
        }
    }
}

struct SourceCtx {
    fd: RawFd,
    source: DispatchSource,
}

struct WriteSlot {
    data: Vec<u8>,
    pos: usize,
}

struct Inner {
    name: String,
    queue: QueueHandle,
    handler: Weak<dyn StreamHandler>,
    state: AtomicU8,
    started: AtomicBool,
    finished: AtomicBool,

    /// Writer context; the descriptor is closed by its cancel callback.
    writer: Mutex<Option<SourceCtx>>,

    /// Reader context over a dup of the writer's descriptor.
    reader: Mutex<Option<SourceCtx>>,

    /// Single-write-in-flight flag. Set by `write`, cleared when the
    /// slot drains or the writer's cancel callback drops it.
    wr_busy: AtomicBool,
    wr_slot: Mutex<Option<WriteSlot>>,

    /// Receive storage, parked here until the reader source exists.
    rd_buf: Mutex<Option<ReadBuffer>>,
}

/// A TCP connection driven by readiness callbacks on its runner.
///
/// Constructed either by connecting ([`Stream::connect`]) or by adopting
/// an already connected descriptor ([`Stream::adopt`]). Dropping the
/// stream shuts it down.
pub struct Stream {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream").field("name", &self.inner.name).finish()
    }
}

impl Stream {
    /// Initiates a non-blocking connection to `addr:port`.
    ///
    /// Exactly one `Connected` or `ConnectFailed` event follows, before
    /// any other callback. `buffer` supplies caller-owned receive
    /// storage; with `None` the stream allocates `bufsz` bytes itself.
    pub fn connect<H>(
        runner: &Arc<Runner>,
        addr: IpAddr,
        port: u16,
        handler: &Arc<H>,
        buffer: Option<Vec<u8>>,
        bufsz: usize,
    ) -> Result<Stream>
    where
        H: StreamHandler,
    {
        let inner = Inner::new(runner, handler, buffer, bufsz)?;
        inner.state.store(State::Starting as u8, Ordering::Release);

        let domain = match addr {
            IpAddr::V4(_) => AF_INET,
            IpAddr::V6(_) => AF_INET6,
        };
        let fd = sys_socket(domain).map_err(|e| Error::operation("socket", e))?;

        // the writer source doubles as the connect-completion signal
        if let Err(error) = Inner::create_write_source(&inner, fd) {
            sys_close(fd);
            return Err(error);
        }

        match sys_connect(fd, &SocketAddr::new(addr, port)) {
            Ok(()) => {
                // completed at once; arming below still reports writable,
                // so the regular connect path runs
            }
            Err(error) if error.raw_os_error() == Some(EINPROGRESS) => {
                inner.state.store(State::Connecting as u8, Ordering::Release);
            }
            Err(error) => {
                inner.state.store(State::Disconnected as u8, Ordering::Release);
                inner.cancel_write_source();
                return Err(Error::operation("connect", error));
            }
        }

        // armed only after the connect is initiated; an unconnected
        // socket already polls as writable-with-error
        inner.resume_writer();

        Ok(Stream { inner })
    }

    /// Adopts an already connected descriptor.
    ///
    /// The descriptor is forced non-blocking and reading starts at once;
    /// no `Connected` event is delivered. If construction fails before
    /// any source exists the caller keeps the descriptor; afterwards it
    /// is released with the stream.
    pub fn adopt<H>(
        runner: &Arc<Runner>,
        fd: RawFd,
        handler: &Arc<H>,
        buffer: Option<Vec<u8>>,
        bufsz: usize,
    ) -> Result<Stream>
    where
        H: StreamHandler,
    {
        if fd < 0 {
            return Err(Error::IllegalArgument);
        }

        let inner = Inner::new(runner, handler, buffer, bufsz)?;
        inner.state.store(State::Connected as u8, Ordering::Release);

        sys_set_nonblocking(fd).map_err(|e| Error::operation("fcntl", e))?;

        // separate descriptors, so read and write teardown close
        // independently
        let read_fd = sys_dup(fd).map_err(|e| Error::operation("dup", e))?;

        if let Err(error) = Inner::create_write_source(&inner, fd) {
            sys_close(read_fd);
            return Err(error);
        }
        if let Err(error) = Inner::create_read_source(&inner, read_fd) {
            sys_close(read_fd);
            inner.cancel_write_source();
            return Err(error);
        }

        Ok(Stream { inner })
    }

    /// Submits `data` for writing.
    ///
    /// At most one write may be in flight; completion is reported through
    /// [`StreamHandler::on_write`]. Fails with `IllegalState` while not
    /// connected or while a previous write is still draining.
    pub fn write(&self, data: Vec<u8>) -> Result<()> {
        self.inner.write(data)
    }
}

impl EventSource for Stream {
    fn name(&self) -> &str {
        &self.inner.name
    }

    /// Streams arm their sources at construction; `start` only clears a
    /// previous `stop`.
    fn start(&self) {
        if self.inner.finished.load(Ordering::Acquire) {
            return;
        }
        self.inner.started.store(true, Ordering::Release);
    }

    fn stop(&self) {
        if self.inner.finished.load(Ordering::Acquire) {
            return;
        }
        self.inner.started.store(false, Ordering::Release);
    }

    fn shutdown(&self) {
        if self.inner.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.state.store(State::Disconnected as u8, Ordering::Release);
        self.inner.cancel_read_source();
        self.inner.cancel_write_source();
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Inner {
    fn new<H>(
        runner: &Arc<Runner>,
        handler: &Arc<H>,
        buffer: Option<Vec<u8>>,
        bufsz: usize,
    ) -> Result<Arc<Inner>>
    where
        H: StreamHandler,
    {
        let receive = ReadBuffer::new(buffer, bufsz);
        if receive.capacity() == 0 {
            return Err(Error::IllegalArgument);
        }

        let strong: Arc<dyn StreamHandler> = handler.clone();

        Ok(Arc::new(Inner {
            name: "fluentis.net.stream".into(),
            queue: runner.queue(),
            handler: Arc::downgrade(&strong),
            state: AtomicU8::new(State::Disconnected as u8),
            started: AtomicBool::new(true),
            finished: AtomicBool::new(false),
            writer: Mutex::new(None),
            reader: Mutex::new(None),
            wr_busy: AtomicBool::new(false),
            wr_slot: Mutex::new(None),
            rd_buf: Mutex::new(Some(receive)),
        }))
    }

    fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Creates the (suspended) writer source over `fd`.
    fn create_write_source(inner: &Arc<Inner>, fd: RawFd) -> Result<()> {
        let source = DispatchSource::write(fd, inner.queue.clone())?;

        let event_inner = inner.clone();
        source.set_event(move |pending| match event_inner.state() {
            State::Starting | State::Connecting => {
                Inner::process_connect_event(&event_inner, pending)
            }
            State::Connected => event_inner.process_write_event(fd),
            State::Disconnected => {}
        });

        let cancel_inner = inner.clone();
        source.set_cancel(move || {
            sys_close(fd);
            cancel_inner.writer.lock().unwrap().take();
            // a write caught mid-flight is dropped without `on_write`
            cancel_inner.wr_slot.lock().unwrap().take();
            cancel_inner.wr_busy.store(false, Ordering::Release);
            tracing::trace!(fd, "write source released");
        });

        *inner.writer.lock().unwrap() = Some(SourceCtx { fd, source });
        Ok(())
    }

    /// Creates the reader source over `fd` and starts the read loop.
    fn create_read_source(inner: &Arc<Inner>, fd: RawFd) -> Result<()> {
        let Some(mut buffer) = inner.rd_buf.lock().unwrap().take() else {
            return Err(Error::IllegalState("receive buffer already consumed"));
        };

        let source = DispatchSource::read(fd, inner.queue.clone())?;

        let event_inner = inner.clone();
        source.set_event(move |pending| {
            if event_inner.state() != State::Connected {
                return;
            }
            if pending == 0 {
                // peer closed the connection
                event_inner.process_disconnect_event();
                return;
            }

            let n = buffer.fill(fd);
            if n == 0 {
                event_inner.process_disconnect_event();
                return;
            }
            if n < 0 {
                let error = io::Error::last_os_error();
                if error.kind() == io::ErrorKind::WouldBlock {
                    return;
                }
                tracing::debug!(name = %event_inner.name, %error, "read failed");
                event_inner.process_disconnect_event();
                return;
            }

            if let Some(handler) = event_inner.handler.upgrade() {
                absorb("read", || handler.on_read(&mut buffer));
            }
        });

        let cancel_inner = inner.clone();
        source.set_cancel(move || {
            sys_close(fd);
            cancel_inner.reader.lock().unwrap().take();
            tracing::trace!(fd, "read source released");
        });

        source.resume();
        *inner.reader.lock().unwrap() = Some(SourceCtx { fd, source });
        Ok(())
    }

    fn write(&self, data: Vec<u8>) -> Result<()> {
        if self.state() != State::Connected {
            return Err(Error::IllegalState("stream is not connected"));
        }
        if self
            .wr_busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::IllegalState("a write is already in flight"));
        }

        *self.wr_slot.lock().unwrap() = Some(WriteSlot { data, pos: 0 });
        self.resume_writer();
        Ok(())
    }

    /// Resolves a connect attempt from the first writer readiness.
    fn process_connect_event(inner: &Arc<Inner>, pending: usize) {
        inner.suspend_writer();

        if pending <= CONNECT_SPACE_THRESHOLD {
            tracing::debug!(name = %inner.name, pending, "connect failed");
            inner.state.store(State::Disconnected as u8, Ordering::Release);
            inner.deliver(StreamEvent::ConnectFailed);
            return;
        }

        let write_fd = inner.writer.lock().unwrap().as_ref().map(|ctx| ctx.fd);
        let read_fd = match write_fd.map(sys_dup) {
            Some(Ok(fd)) => fd,
            _ => {
                // no reader means no usable connection; report the
                // attempt as failed and release the writer
                tracing::warn!(name = %inner.name, "failed to dup connected socket");
                inner.state.store(State::Disconnected as u8, Ordering::Release);
                inner.cancel_write_source();
                inner.deliver(StreamEvent::ConnectFailed);
                return;
            }
        };

        if let Err(error) = Inner::create_read_source(inner, read_fd) {
            tracing::warn!(name = %inner.name, %error, "failed to start read loop");
            sys_close(read_fd);
            inner.state.store(State::Disconnected as u8, Ordering::Release);
            inner.cancel_write_source();
            inner.deliver(StreamEvent::ConnectFailed);
            return;
        }

        inner.state.store(State::Connected as u8, Ordering::Release);
        tracing::debug!(name = %inner.name, "connected");
        inner.deliver(StreamEvent::Connected);
    }

    /// Pushes the in-flight slot forward by one `write(2)`.
    fn process_write_event(&self, fd: RawFd) {
        let mut slot = self.wr_slot.lock().unwrap();
        let Some(pending) = slot.as_mut() else {
            return;
        };

        let n = sys_write(fd, &pending.data[pending.pos..]);
        if n < 0 {
            let error = io::Error::last_os_error();
            if error.kind() != io::ErrorKind::WouldBlock {
                // real failures surface as a disconnect on the read side;
                // suspending keeps the error condition from re-firing
                // until that teardown cancels the writer
                drop(slot);
                tracing::debug!(name = %self.name, %error, "write failed");
                self.suspend_writer();
            }
            return;
        }
        pending.pos += n as usize;
        if pending.pos < pending.data.len() {
            return;
        }

        let finished = slot.take().unwrap();
        drop(slot);

        self.suspend_writer();
        self.wr_busy.store(false, Ordering::Release);

        if let Some(handler) = self.handler.upgrade() {
            absorb("write", || handler.on_write(&finished.data, finished.data.len()));
        }
    }

    fn process_disconnect_event(&self) {
        // at most one disconnect per stream instance
        let previous = self.state.swap(State::Disconnected as u8, Ordering::AcqRel);
        if previous == State::Disconnected as u8 {
            return;
        }

        tracing::debug!(name = %self.name, "peer disconnected");
        self.cancel_write_source();
        self.cancel_read_source();
        self.deliver(StreamEvent::Disconnected);
    }

    fn cancel_write_source(&self) {
        let writer = self.writer.lock().unwrap();
        let Some(ctx) = writer.as_ref() else {
            return;
        };
        ctx.source.cancel();
        // a suspended writer must be resumed for the cancel to go
        // through, and the writer may be suspended whether or not a
        // write is in flight (idle, or parked by a failed write);
        // resuming an armed source is a no-op
        ctx.source.resume();
    }

    fn cancel_read_source(&self) {
        // the reader stays resumed for as long as it exists
        if let Some(ctx) = self.reader.lock().unwrap().as_ref() {
            ctx.source.cancel();
        }
    }

    fn suspend_writer(&self) {
        if let Some(ctx) = self.writer.lock().unwrap().as_ref() {
            ctx.source.suspend();
        }
    }

    fn resume_writer(&self) {
        if let Some(ctx) = self.writer.lock().unwrap().as_ref() {
            ctx.source.resume();
        }
    }

    fn deliver(&self, event: StreamEvent) {
        if let Some(handler) = self.handler.upgrade() {
            absorb("event", || handler.on_event(event));
        }
    }
}
