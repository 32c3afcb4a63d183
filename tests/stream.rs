use fluentis::net::{EventSource, ReadBuffer, Stream, StreamEvent, StreamHandler};
use fluentis::runner::Runner;
use fluentis::Error;

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::fd::IntoRawFd;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(2);

#[derive(Debug, PartialEq)]
enum Note {
    Event(StreamEvent),
    Read(Vec<u8>),
    Wrote(usize),
}

struct Probe {
    tx: Sender<Note>,
}

impl StreamHandler for Probe {
    fn on_read(&self, buf: &mut ReadBuffer) {
        self.tx
            .send(Note::Read(buf.bytes().to_vec()))
            .expect("failed to record read");
    }

    fn on_write(&self, _data: &[u8], size: usize) {
        self.tx
            .send(Note::Wrote(size))
            .expect("failed to record write");
    }

    fn on_event(&self, event: StreamEvent) {
        self.tx
            .send(Note::Event(event))
            .expect("failed to record event");
    }
}

fn next(rx: &Receiver<Note>) -> Note {
    rx.recv_timeout(WAIT).expect("no stream callback arrived")
}

fn socket_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("failed to bind");
    let addr = listener.local_addr().expect("no local address");
    let client = TcpStream::connect(addr).expect("failed to connect");
    let (server, _) = listener.accept().expect("failed to accept");
    (client, server)
}

#[test]
fn connects_writes_reads_and_sees_the_peer_leave() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("failed to bind");
    let addr = listener.local_addr().expect("no local address");

    let peer = thread::spawn(move || {
        let (mut socket, _) = listener.accept().expect("peer accept failed");
        let mut buffer = [0u8; 5];
        socket.read_exact(&mut buffer).expect("peer read failed");
        assert_eq!(&buffer, b"hello");
        socket.write_all(b"world").expect("peer write failed");
        socket
    });

    let runner = Arc::new(Runner::new("stream"));
    let (tx, rx) = mpsc::channel();
    let handler = Arc::new(Probe { tx });

    let stream = Stream::connect(&runner, addr.ip(), addr.port(), &handler, None, 4096)
        .expect("failed to initiate connect");

    assert_eq!(next(&rx), Note::Event(StreamEvent::Connected));

    stream.write(b"hello".to_vec()).expect("write rejected");
    assert_eq!(next(&rx), Note::Wrote(5));
    assert_eq!(next(&rx), Note::Read(b"world".to_vec()));

    let socket = peer.join().expect("peer panicked");
    drop(socket);
    assert_eq!(next(&rx), Note::Event(StreamEvent::Disconnected));

    // terminal: the stream refuses further writes
    let error = stream.write(vec![1]).unwrap_err();
    assert!(matches!(error, Error::IllegalState(_)));
}

#[test]
fn connecting_to_a_closed_port_fails_exactly_once() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("failed to bind");
    let addr = listener.local_addr().expect("no local address");
    drop(listener);

    let runner = Arc::new(Runner::new("stream"));
    let (tx, rx) = mpsc::channel();
    let handler = Arc::new(Probe { tx });

    match Stream::connect(&runner, addr.ip(), addr.port(), &handler, None, 4096) {
        Ok(_stream) => {
            assert_eq!(next(&rx), Note::Event(StreamEvent::ConnectFailed));
            assert!(
                rx.recv_timeout(Duration::from_millis(300)).is_err(),
                "a second resolution arrived for one connect attempt"
            );
        }
        // loopback refusals may surface synchronously
        Err(Error::OperationFailed { .. }) => {}
        Err(other) => panic!("unexpected construction error: {other}"),
    }
}

#[test]
fn a_second_write_is_rejected_while_one_is_in_flight() {
    let (mut local, remote) = socket_pair();

    let runner = Arc::new(Runner::new("stream"));
    let (tx, rx) = mpsc::channel();
    let handler = Arc::new(Probe { tx });

    let stream = Stream::adopt(&runner, remote.into_raw_fd(), &handler, None, 4096)
        .expect("failed to adopt socket");

    // larger than the combined kernel buffers, so it cannot drain while
    // the peer is not reading
    let payload = vec![7u8; 16 * 1024 * 1024];
    stream.write(payload).expect("first write rejected");

    let error = stream.write(vec![1]).unwrap_err();
    assert!(matches!(error, Error::IllegalState(_)), "busy writer accepted a write");

    // drain on the peer until the payload is through
    let mut remaining = 16 * 1024 * 1024usize;
    let mut sink = [0u8; 64 * 1024];
    while remaining > 0 {
        let n = local.read(&mut sink).expect("peer read failed");
        assert!(n > 0, "peer saw EOF mid-payload");
        remaining -= n;
    }

    let done = rx
        .recv_timeout(Duration::from_secs(10))
        .expect("write never completed");
    assert_eq!(done, Note::Wrote(16 * 1024 * 1024));

    // the slot is free again
    stream.write(vec![2]).expect("writer stayed busy");
    assert_eq!(next(&rx), Note::Wrote(1));
}

#[test]
fn peer_reset_with_a_write_in_flight_releases_the_writer() {
    let (local, remote) = socket_pair();
    let fd = remote.into_raw_fd();

    let runner = Arc::new(Runner::new("stream"));
    let (tx, rx) = mpsc::channel();
    let handler = Arc::new(Probe { tx });

    let stream =
        Stream::adopt(&runner, fd, &handler, None, 4096).expect("failed to adopt socket");

    // larger than the combined kernel buffers, so the write is still
    // draining when the reset arrives
    stream
        .write(vec![9u8; 16 * 1024 * 1024])
        .expect("write rejected");

    // closing with unread data in the receive queue resets the
    // connection instead of shutting it down cleanly
    drop(local);

    loop {
        match next(&rx) {
            Note::Event(StreamEvent::Disconnected) => break,
            Note::Wrote(_) => panic!("an aborted write still reported completion"),
            _ => {}
        }
    }

    // the writer's cancel path closes the adopted descriptor
    let deadline = Instant::now() + WAIT;
    while unsafe { libc::fcntl(fd, libc::F_GETFD) } >= 0 {
        assert!(
            Instant::now() < deadline,
            "writer descriptor was not released"
        );
        thread::sleep(Duration::from_millis(10));
    }

    // terminal: the slot stays refused after the reset
    let error = stream.write(vec![1]).unwrap_err();
    assert!(matches!(error, Error::IllegalState(_)));
}

#[test]
fn zero_length_write_still_completes() {
    let (_local, remote) = socket_pair();

    let runner = Arc::new(Runner::new("stream"));
    let (tx, rx) = mpsc::channel();
    let handler = Arc::new(Probe { tx });

    let stream = Stream::adopt(&runner, remote.into_raw_fd(), &handler, None, 4096)
        .expect("failed to adopt socket");

    stream.write(Vec::new()).expect("empty write rejected");
    assert_eq!(next(&rx), Note::Wrote(0));
}

struct Swapper {
    tx: Sender<Option<Vec<u8>>>,
}

impl StreamHandler for Swapper {
    fn on_read(&self, buf: &mut ReadBuffer) {
        let returned = buf.replace(vec![0u8; 1024]);
        self.tx.send(returned).expect("failed to record swap");
    }

    fn on_write(&self, _data: &[u8], _size: usize) {}

    fn on_event(&self, _event: StreamEvent) {}
}

#[test]
fn swapping_returns_caller_storage_and_adopts_the_new_buffer() {
    let (mut local, remote) = socket_pair();

    let runner = Arc::new(Runner::new("stream"));
    let (tx, rx) = mpsc::channel();
    let handler = Arc::new(Swapper { tx });

    let stream = Stream::adopt(&runner, remote.into_raw_fd(), &handler, Some(vec![0u8; 512]), 0)
        .expect("failed to adopt socket");

    local.write_all(b"one").expect("peer write failed");
    let first = rx.recv_timeout(WAIT).expect("first read never arrived");
    assert_eq!(first.map(|b| b.len()), Some(512), "caller storage was not returned");

    local.write_all(b"two").expect("peer write failed");
    let second = rx.recv_timeout(WAIT).expect("second read never arrived");
    assert_eq!(
        second.map(|b| b.len()),
        Some(1024),
        "adopted buffer was not treated as caller-owned"
    );

    drop(stream);
}

#[test]
fn engine_allocated_storage_is_never_handed_back() {
    let (mut local, remote) = socket_pair();

    let runner = Arc::new(Runner::new("stream"));
    let (tx, rx) = mpsc::channel();
    let handler = Arc::new(Swapper { tx });

    let stream = Stream::adopt(&runner, remote.into_raw_fd(), &handler, None, 256)
        .expect("failed to adopt socket");

    local.write_all(b"ping").expect("peer write failed");
    let first = rx.recv_timeout(WAIT).expect("read never arrived");
    assert_eq!(first, None, "stream-owned storage escaped to the caller");

    drop(stream);
}

#[test]
fn shutdown_is_idempotent_and_terminal() {
    let (_local, remote) = socket_pair();

    let runner = Arc::new(Runner::new("stream"));
    let (tx, rx) = mpsc::channel();
    let handler = Arc::new(Probe { tx });

    let stream = Stream::adopt(&runner, remote.into_raw_fd(), &handler, None, 4096)
        .expect("failed to adopt socket");

    stream.shutdown();
    stream.shutdown();

    let error = stream.write(vec![1]).unwrap_err();
    assert!(matches!(error, Error::IllegalState(_)));
    assert!(
        rx.recv_timeout(Duration::from_millis(300)).is_err(),
        "callbacks fired after shutdown"
    );
}

#[test]
fn writing_before_connected_is_rejected() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("failed to bind");
    let addr = listener.local_addr().expect("no local address");

    let runner = Arc::new(Runner::new("stream"));
    let (tx, rx) = mpsc::channel();
    let handler = Arc::new(Probe { tx });

    // nobody accepts, so the stream sits in `connecting` for a moment
    let stream = Stream::connect(&runner, addr.ip(), addr.port(), &handler, None, 4096)
        .expect("failed to initiate connect");

    match stream.write(b"early".to_vec()) {
        Err(Error::IllegalState(_)) => {}
        Err(other) => panic!("unexpected error: {other}"),
        // the loopback handshake can win the race; then the write stands
        Ok(()) => {
            assert_eq!(next(&rx), Note::Event(StreamEvent::Connected));
        }
    }

    drop(listener);
}

#[test]
fn adopting_an_invalid_descriptor_is_rejected() {
    let runner = Arc::new(Runner::new("stream"));
    let (tx, _rx) = mpsc::channel();
    let handler = Arc::new(Probe { tx });

    let error = Stream::adopt(&runner, -1, &handler, None, 4096).unwrap_err();
    assert!(matches!(error, Error::IllegalArgument));
}
