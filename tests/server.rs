use fluentis::net::{EventSource, Server, ServerHandler};
use fluentis::runner::Runner;

use std::io::Read;
use std::net::{IpAddr, TcpStream};
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::mpsc::{self, Sender};
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(2);

struct Recorder {
    accept: bool,
    tx: Sender<(RawFd, IpAddr, u16)>,
}

impl ServerHandler for Recorder {
    fn on_connect(&self, fd: RawFd, peer: IpAddr, port: u16) -> bool {
        self.tx
            .send((fd, peer, port))
            .expect("failed to record connection");
        self.accept
    }
}

#[test]
fn accepts_a_connection_and_reports_the_peer() {
    let runner = Arc::new(Runner::new("acceptor"));
    let (tx, rx) = mpsc::channel();
    let handler = Arc::new(Recorder { accept: true, tx });

    let server = Server::bind(&runner, "127.0.0.1".parse().unwrap(), 0, &handler)
        .expect("failed to bind server");
    let addr = server.local_addr().expect("failed to read local address");
    server.start();

    let client = TcpStream::connect(addr).expect("failed to connect");
    let local = client.local_addr().expect("failed to read client address");

    let (fd, peer, port) = rx.recv_timeout(WAIT).expect("no connection reported");
    assert_eq!(peer, local.ip());
    assert_eq!(port, local.port());

    // the handler accepted, so the descriptor must still be open
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    assert!(flags >= 0, "accepted descriptor was closed");
    unsafe { libc::close(fd) };
}

#[test]
fn declined_connection_is_closed_by_the_framework() {
    let runner = Arc::new(Runner::new("acceptor"));
    let (tx, rx) = mpsc::channel();
    let handler = Arc::new(Recorder { accept: false, tx });

    let server = Server::bind(&runner, "127.0.0.1".parse().unwrap(), 0, &handler)
        .expect("failed to bind server");
    let addr = server.local_addr().expect("failed to read local address");
    server.start();

    let mut client = TcpStream::connect(addr).expect("failed to connect");
    rx.recv_timeout(WAIT).expect("no connection reported");

    client
        .set_read_timeout(Some(WAIT))
        .expect("failed to set read timeout");
    let mut buffer = [0u8; 1];
    let n = client.read(&mut buffer).expect("expected a clean close");
    assert_eq!(n, 0, "framework did not close the declined descriptor");
}

#[test]
fn connections_are_drained_after_the_handler_is_dropped() {
    let runner = Arc::new(Runner::new("acceptor"));
    let (tx, _rx) = mpsc::channel();
    let handler = Arc::new(Recorder { accept: true, tx });

    let server = Server::bind(&runner, "127.0.0.1".parse().unwrap(), 0, &handler)
        .expect("failed to bind server");
    let addr = server.local_addr().expect("failed to read local address");
    server.start();
    drop(handler);

    let mut client = TcpStream::connect(addr).expect("failed to connect");
    client
        .set_read_timeout(Some(WAIT))
        .expect("failed to set read timeout");
    let mut buffer = [0u8; 1];
    let n = client.read(&mut buffer).expect("expected a clean close");
    assert_eq!(n, 0, "orphaned connection was not closed");
}

#[test]
fn accepting_begins_only_after_start() {
    let runner = Arc::new(Runner::new("acceptor"));
    let (tx, rx) = mpsc::channel();
    let handler = Arc::new(Recorder { accept: true, tx });

    let server = Server::bind(&runner, "127.0.0.1".parse().unwrap(), 0, &handler)
        .expect("failed to bind server");
    let addr = server.local_addr().expect("failed to read local address");

    // the listening socket exists, so the connect itself succeeds
    let _client = TcpStream::connect(addr).expect("failed to connect");
    assert!(
        rx.recv_timeout(Duration::from_millis(300)).is_err(),
        "connection dispatched before start"
    );

    server.start();
    let (fd, _, _) = rx.recv_timeout(WAIT).expect("no connection after start");
    unsafe { libc::close(fd) };
}

#[test]
fn shutdown_is_idempotent() {
    let runner = Arc::new(Runner::new("acceptor"));
    let (tx, _rx) = mpsc::channel();
    let handler = Arc::new(Recorder { accept: true, tx });

    let server = Server::bind(&runner, "127.0.0.1".parse().unwrap(), 0, &handler)
        .expect("failed to bind server");
    server.start();

    server.shutdown();
    server.shutdown();

    // terminal: a later start must not rearm anything
    server.start();
}

#[test]
fn adopting_a_non_listening_descriptor_is_rejected() {
    let runner = Arc::new(Runner::new("acceptor"));
    let (tx, _rx) = mpsc::channel();
    let handler = Arc::new(Recorder { accept: true, tx });

    let error = Server::adopt(&runner, -1, &handler).unwrap_err();
    assert!(matches!(error, fluentis::Error::IllegalArgument));
}
