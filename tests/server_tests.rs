//! Integration tests for the UDP server endpoint over loopback sockets.

use std::net::{SocketAddr, UdpSocket as StdUdpSocket};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

use tokio::runtime::Runtime;
use udp_server::{Service, UdpServer, UdpServerHandler};

const TIMEOUT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(300);

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    Started,
    Stopped,
    Received(SocketAddr, Vec<u8>),
    Sent(SocketAddr, usize),
    Error(i32),
}

struct Recorder {
    events: Sender<Event>,
}

impl UdpServerHandler for Recorder {
    fn on_started(&mut self, _server: &UdpServer) {
        let _ = self.events.send(Event::Started);
    }

    fn on_stopped(&mut self, _server: &UdpServer) {
        let _ = self.events.send(Event::Stopped);
    }

    fn on_received(&mut self, _server: &UdpServer, peer: SocketAddr, data: &[u8]) {
        let _ = self.events.send(Event::Received(peer, data.to_vec()));
    }

    fn on_sent(&mut self, _server: &UdpServer, destination: SocketAddr, sent: usize) {
        let _ = self.events.send(Event::Sent(destination, sent));
    }

    fn on_error(&mut self, code: i32, _category: &'static str, _message: &str) {
        let _ = self.events.send(Event::Error(code));
    }
}

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap()
}

fn loopback_server(rt: &Runtime) -> (UdpServer, Receiver<Event>) {
    let service = Service::new(rt.handle().clone());
    let (tx, rx) = mpsc::channel();
    let server =
        UdpServer::with_address(&service, Recorder { events: tx }, "127.0.0.1", 0).unwrap();
    (server, rx)
}

fn started_server(rt: &Runtime) -> (UdpServer, Receiver<Event>) {
    let (server, rx) = loopback_server(rt);
    assert!(server.start());
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), Event::Started);
    (server, rx)
}

fn peer_socket() -> StdUdpSocket {
    let peer = StdUdpSocket::bind("127.0.0.1:0").unwrap();
    peer.set_read_timeout(Some(TIMEOUT)).unwrap();
    peer
}

#[test]
fn start_stop_lifecycle() {
    let rt = runtime();
    let (server, rx) = started_server(&rt);

    assert!(server.is_started());
    assert!(server.local_endpoint().is_some());
    assert!(!server.start(), "double start must be rejected");

    assert!(server.stop());
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), Event::Stopped);
    assert!(!server.is_started());
    assert!(server.local_endpoint().is_none());
    assert!(!server.stop(), "stop of a stopped server must be rejected");
}

#[test]
fn receives_a_datagram_with_counters() {
    let rt = runtime();
    let (server, rx) = started_server(&rt);

    server.receive();

    let peer = peer_socket();
    let target = server.local_endpoint().unwrap();
    peer.send_to(b"0123456789", target).unwrap();

    match rx.recv_timeout(TIMEOUT).unwrap() {
        Event::Received(source, data) => {
            assert_eq!(data, b"0123456789");
            assert_eq!(source, peer.local_addr().unwrap());
        }
        other => panic!("expected a received event, got {:?}", other),
    }

    assert_eq!(server.datagrams_received(), 1);
    assert_eq!(server.bytes_received(), 10);
}

#[test]
fn reception_is_consumer_paced() {
    let rt = runtime();
    let (server, rx) = started_server(&rt);

    server.receive();

    let peer = peer_socket();
    let target = server.local_endpoint().unwrap();
    peer.send_to(b"one", target).unwrap();
    peer.send_to(b"two", target).unwrap();

    assert!(matches!(
        rx.recv_timeout(TIMEOUT).unwrap(),
        Event::Received(_, _)
    ));

    // The second datagram waits in the kernel until the next trigger
    assert_eq!(rx.recv_timeout(QUIET), Err(RecvTimeoutError::Timeout));

    server.receive();
    assert!(matches!(
        rx.recv_timeout(TIMEOUT).unwrap(),
        Event::Received(_, _)
    ));
    assert_eq!(server.datagrams_received(), 2);
}

#[test]
fn send_sync_advances_counters_and_delivers() {
    let rt = runtime();
    let (server, rx) = started_server(&rt);

    let peer = peer_socket();
    let destination = peer.local_addr().unwrap();

    assert!(server.send_sync(destination, b"hello"));

    let mut buf = [0u8; 64];
    let (n, from) = peer.recv_from(&mut buf).unwrap();
    assert_eq!(n, 5);
    assert_eq!(&buf[..n], b"hello");
    assert_eq!(from, server.local_endpoint().unwrap());

    assert_eq!(server.bytes_sent(), 5);
    assert_eq!(server.datagrams_sent(), 1);
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), Event::Sent(destination, 5));

    // Zero-length send succeeds with no I/O, no counter movement, no event
    assert!(server.send_sync(destination, b""));
    assert_eq!(server.bytes_sent(), 5);
    assert_eq!(server.datagrams_sent(), 1);
    assert_eq!(rx.recv_timeout(QUIET), Err(RecvTimeoutError::Timeout));
}

#[test]
fn send_async_delivers_and_counts() {
    let rt = runtime();
    let (server, rx) = started_server(&rt);

    let peer = peer_socket();
    let destination = peer.local_addr().unwrap();

    assert!(server.send_async(destination, b"abc"));

    let mut buf = [0u8; 64];
    let (n, _) = peer.recv_from(&mut buf).unwrap();
    assert_eq!(n, 3);

    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), Event::Sent(destination, 3));
    assert_eq!(server.bytes_sent(), 3);
    assert_eq!(server.datagrams_sent(), 1);
    assert_eq!(server.bytes_sending(), 0);

    // Zero-length async send is a trivial success
    assert!(server.send_async(destination, b""));
    assert_eq!(rx.recv_timeout(QUIET), Err(RecvTimeoutError::Timeout));
}

#[test]
fn second_send_async_in_flight_is_rejected() {
    // A current-thread runtime cannot run the dispatcher between the two
    // calls below, so the first send is still in flight for the second.
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let service = Service::new(rt.handle().clone());
    let (tx, rx) = mpsc::channel();
    let server =
        UdpServer::with_address(&service, Recorder { events: tx }, "127.0.0.1", 0).unwrap();

    let peer = peer_socket();
    let destination = peer.local_addr().unwrap();

    rt.block_on(async {
        assert!(server.start());
        while !server.is_started() {
            tokio::task::yield_now().await;
        }

        assert!(server.send_async(destination, b"first"));
        assert!(!server.send_async(destination, b"second"));
        assert_eq!(server.bytes_sending(), 5, "first submission must be intact");

        loop {
            match rx.try_recv() {
                Ok(Event::Started) => {}
                Ok(event) => {
                    assert_eq!(event, Event::Sent(destination, 5));
                    break;
                }
                Err(_) => tokio::task::yield_now().await,
            }
        }
    });

    // Exactly one datagram went out
    let mut buf = [0u8; 64];
    let (n, _) = peer.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"first");
    peer.set_read_timeout(Some(QUIET)).unwrap();
    assert!(peer.recv_from(&mut buf).is_err());
}

#[test]
fn operations_require_a_started_server() {
    let rt = runtime();
    let (server, rx) = loopback_server(&rt);
    let destination: SocketAddr = "127.0.0.1:9".parse().unwrap();

    assert!(!server.send_async(destination, b"x"));
    assert!(!server.send_sync(destination, b"x"));
    assert!(!server.multicast_async(b"x"));
    assert!(!server.multicast_sync(b"x"));
    assert!(!server.stop());
    assert!(!server.restart(), "restart must propagate the stop failure");
    server.receive();

    assert_eq!(rx.recv_timeout(QUIET), Err(RecvTimeoutError::Timeout));
}

#[test]
fn restart_emits_stop_then_start_and_resets_counters() {
    let rt = runtime();
    let (server, rx) = started_server(&rt);

    let peer = peer_socket();
    let destination = peer.local_addr().unwrap();
    assert!(server.send_sync(destination, b"abc"));
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), Event::Sent(destination, 3));
    assert_eq!(server.bytes_sent(), 3);

    assert!(server.restart());
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), Event::Stopped);
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), Event::Started);

    assert!(server.is_started());
    assert_eq!(server.bytes_sending(), 0);
    assert_eq!(server.bytes_sent(), 0);
    assert_eq!(server.bytes_received(), 0);
    assert_eq!(server.datagrams_sent(), 0);
    assert_eq!(server.datagrams_received(), 0);
}

#[test]
fn multicast_sends_use_the_configured_destination() {
    let rt = runtime();
    let (server, rx) = loopback_server(&rt);

    let peer = peer_socket();
    let destination = peer.local_addr().unwrap();

    assert!(server.start_multicast_endpoint(destination));
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), Event::Started);
    assert_eq!(server.multicast_endpoint(), Some(destination));

    assert!(server.multicast_async(b"hello"));
    let mut buf = [0u8; 64];
    let (n, from) = peer.recv_from(&mut buf).unwrap();
    assert_eq!(n, 5);
    assert_eq!(from, server.local_endpoint().unwrap());
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), Event::Sent(destination, 5));

    assert!(server.multicast_sync(b"hey"));
    let (n, _) = peer.recv_from(&mut buf).unwrap();
    assert_eq!(n, 3);
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), Event::Sent(destination, 3));
}

#[test]
fn multicast_address_parsing() {
    let rt = runtime();
    let (server, rx) = loopback_server(&rt);

    assert!(server.start_multicast("not an address", 3334).is_err());
    assert!(server.start_multicast("239.255.0.1", 3334).unwrap());
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), Event::Started);
    assert_eq!(
        server.multicast_endpoint(),
        Some("239.255.0.1:3334".parse().unwrap())
    );
}

#[test]
fn stop_discards_a_receive_in_flight() {
    let rt = runtime();
    let (server, rx) = started_server(&rt);

    server.receive();
    assert!(server.stop());
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), Event::Stopped);

    // The stale operation must surface nothing after the stopped event
    assert_eq!(rx.recv_timeout(QUIET), Err(RecvTimeoutError::Timeout));
}

#[test]
fn socket_options_follow_the_socket_lifetime() {
    let rt = runtime();
    let (server, rx) = started_server(&rt);

    assert!(server.receive_buffer_size().unwrap() > 0);
    assert!(server.send_buffer_size().unwrap() > 0);
    server.set_receive_buffer_size(64 * 1024).unwrap();
    server.set_send_buffer_size(64 * 1024).unwrap();

    assert!(server.stop());
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), Event::Stopped);
    assert!(server.receive_buffer_size().is_err());
    assert!(server.set_send_buffer_size(64 * 1024).is_err());
}

#[test]
fn reuse_flags_are_plain_configuration() {
    let rt = runtime();
    let (server, _rx) = loopback_server(&rt);

    assert!(!server.reuse_address());
    assert!(!server.reuse_port());
    server.set_reuse_address(true);
    server.set_reuse_port(true);
    assert!(server.reuse_address());
    assert!(server.reuse_port());
}
