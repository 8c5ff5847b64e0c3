//! Asynchronous UDP server endpoint
//!
//! This module provides [`UdpServer`], a stateful wrapper around a bound
//! datagram socket. The server is constructed against a host [`Service`] and
//! a local endpoint, and exposes start/stop/restart lifecycle operations,
//! asynchronous and synchronous send paths, an explicit receive trigger and
//! transfer statistics. Consumers observe the server through the
//! [`UdpServerHandler`] callbacks.
//!
//! All socket-mutating work runs on a single dispatcher task spawned onto
//! the host service at construction, so lifecycle transitions never race
//! with send/receive completions and the consumer needs no locking of its
//! own. The operations themselves only submit work and return immediately;
//! the two documented exceptions are [`UdpServer::send_sync`], which blocks
//! until the OS accepts the datagram, and [`UdpServer::restart`], which
//! busy-waits for the asynchronous stop to take effect and therefore must
//! not be called from the runtime's own threads.
//!
//! # Example
//!
//! ```rust,no_run
//! use udp_server::{InternetProtocol, Service, UdpServer, UdpServerHandler};
//! use std::net::SocketAddr;
//!
//! struct Echo;
//!
//! impl UdpServerHandler for Echo {
//!     fn on_received(&mut self, server: &UdpServer, peer: SocketAddr, data: &[u8]) {
//!         server.send_async(peer, data);
//!         server.receive();
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let service = Service::from_current().unwrap();
//!     let server = UdpServer::new(&service, Echo, InternetProtocol::IPv4, 3333);
//!     server.start();
//!     server.receive();
//! }
//! ```

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::{fmt, thread};

use bytes::Bytes;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::error::{self, ErrorReport, Result, UdpError};
use crate::service::Service;

/// Internet protocol family used to form an any-address endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InternetProtocol {
    IPv4,
    IPv6,
}

/// Notification callbacks exposed to the server's consumer.
///
/// All callbacks run on the server's dispatcher task, one at a time. The
/// handler receives a [`UdpServer`] handle so it can re-trigger receives or
/// issue sends from within a callback. The `data` slice passed to
/// `on_received` is a view into the server's internal receive buffer and is
/// only valid for the duration of the call; the next receive may resize or
/// overwrite it.
#[allow(unused_variables)]
pub trait UdpServerHandler: Send + 'static {
    /// The server socket was opened and bound.
    fn on_started(&mut self, server: &UdpServer) {}

    /// The server socket was closed.
    fn on_stopped(&mut self, server: &UdpServer) {}

    /// A datagram arrived from `peer`.
    fn on_received(&mut self, server: &UdpServer, peer: SocketAddr, data: &[u8]) {}

    /// A datagram of `sent` bytes was handed to the OS for `destination`.
    fn on_sent(&mut self, server: &UdpServer, destination: SocketAddr, sent: usize) {}

    /// A transport error occurred that is not expected teardown noise.
    fn on_error(&mut self, code: i32, category: &'static str, message: &str) {}
}

/// State shared between the server handles and the dispatcher task.
///
/// The flags and counters are written by the dispatcher task, with two
/// documented exceptions: `send_async` claims `sending` via compare-and-swap
/// at submission time, and `send_sync` advances the sent counters inline on
/// the calling thread.
struct Shared {
    endpoint: SocketAddr,
    local_endpoint: Mutex<Option<SocketAddr>>,
    multicast_endpoint: Mutex<Option<SocketAddr>>,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    started: AtomicBool,
    receiving: AtomicBool,
    sending: AtomicBool,
    reuse_address: AtomicBool,
    reuse_port: AtomicBool,
    bytes_sending: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    datagrams_sent: AtomicU64,
    datagrams_received: AtomicU64,
}

impl Shared {
    fn new(endpoint: SocketAddr) -> Self {
        Self {
            endpoint,
            local_endpoint: Mutex::new(None),
            multicast_endpoint: Mutex::new(None),
            socket: Mutex::new(None),
            started: AtomicBool::new(false),
            receiving: AtomicBool::new(false),
            sending: AtomicBool::new(false),
            reuse_address: AtomicBool::new(false),
            reuse_port: AtomicBool::new(false),
            bytes_sending: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            datagrams_sent: AtomicU64::new(0),
            datagrams_received: AtomicU64::new(0),
        }
    }

    fn reset_statistics(&self) {
        self.bytes_sending.store(0, Ordering::Relaxed);
        self.bytes_sent.store(0, Ordering::Relaxed);
        self.bytes_received.store(0, Ordering::Relaxed);
        self.datagrams_sent.store(0, Ordering::Relaxed);
        self.datagrams_received.store(0, Ordering::Relaxed);
    }
}

/// Commands posted to the server's dispatcher task
enum Command {
    Start,
    Stop,
    Receive,
    Send { destination: SocketAddr, data: Bytes },
    NotifySent { destination: SocketAddr, sent: usize },
    NotifyError(ErrorReport),
    Shutdown,
}

struct Inner {
    shared: Arc<Shared>,
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Tell the dispatcher task to close any open socket and exit
        let _ = self.cmd_tx.send(Command::Shutdown);
    }
}

/// An asynchronous UDP server endpoint.
///
/// `UdpServer` is a cheap-to-clone handle; the dispatcher task keeps running
/// and the socket stays open until the last handle is dropped. See the
/// [module documentation](self) for the threading model and an example.
#[derive(Clone)]
pub struct UdpServer {
    inner: Arc<Inner>,
}

impl UdpServer {
    /// Create a server bound to the any-address of the given protocol family.
    pub fn new<H>(service: &Arc<Service>, handler: H, protocol: InternetProtocol, port: u16) -> Self
    where
        H: UdpServerHandler,
    {
        let ip = match protocol {
            InternetProtocol::IPv4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            InternetProtocol::IPv6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        Self::with_endpoint(service, handler, SocketAddr::new(ip, port))
    }

    /// Create a server bound to a textual address and port.
    pub fn with_address<H>(
        service: &Arc<Service>,
        handler: H,
        address: &str,
        port: u16,
    ) -> Result<Self>
    where
        H: UdpServerHandler,
    {
        let ip: IpAddr = address
            .parse()
            .map_err(|_| UdpError::InvalidAddress(address.to_string()))?;
        Ok(Self::with_endpoint(service, handler, SocketAddr::new(ip, port)))
    }

    /// Create a server bound to a fully-formed endpoint.
    pub fn with_endpoint<H>(service: &Arc<Service>, handler: H, endpoint: SocketAddr) -> Self
    where
        H: UdpServerHandler,
    {
        let shared = Arc::new(Shared::new(endpoint));
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            shared: shared.clone(),
            cmd_tx,
        });

        let dispatcher = Dispatcher {
            shared,
            server: Arc::downgrade(&inner),
            cmd_rx,
            handler: Box::new(handler),
            socket: None,
            recv_buffer: Vec::new(),
            pending_send: None,
        };
        service.post(dispatcher.run());

        Self { inner }
    }

    /// Start the server.
    ///
    /// Returns `false` if the server is already started. Otherwise the open,
    /// bind and buffer setup are scheduled on the dispatcher task and
    /// `on_started` fires once the socket is live.
    pub fn start(&self) -> bool {
        if self.is_started() {
            return false;
        }
        self.inner.cmd_tx.send(Command::Start).is_ok()
    }

    /// Start the server and remember a multicast destination given as a
    /// textual address and port.
    ///
    /// The destination is only a convenience target for the multicast send
    /// operations; no multicast group is joined on the socket.
    pub fn start_multicast(&self, address: &str, port: u16) -> Result<bool> {
        let ip: IpAddr = address
            .parse()
            .map_err(|_| UdpError::InvalidAddress(address.to_string()))?;
        Ok(self.start_multicast_endpoint(SocketAddr::new(ip, port)))
    }

    /// Start the server and remember a multicast destination endpoint.
    pub fn start_multicast_endpoint(&self, endpoint: SocketAddr) -> bool {
        *self.inner.shared.multicast_endpoint.lock().unwrap() = Some(endpoint);
        self.start()
    }

    /// Stop the server.
    ///
    /// Returns `false` if the server is not started. The socket close is
    /// scheduled on the dispatcher task; operations still in flight are
    /// discarded and produce no callbacks after `on_stopped`.
    pub fn stop(&self) -> bool {
        if !self.is_started() {
            return false;
        }
        self.inner.cmd_tx.send(Command::Stop).is_ok()
    }

    /// Stop the server, wait for the stop to take effect and start it again.
    ///
    /// This is the one operation that blocks its caller: it yields the
    /// calling thread until the stop is observable. Calling it from one of
    /// the host runtime's threads deadlocks.
    pub fn restart(&self) -> bool {
        if !self.stop() {
            return false;
        }

        while self.is_started() {
            thread::yield_now();
        }

        self.start()
    }

    /// Arm one asynchronous receive.
    ///
    /// No-op when the server is not started or a receive is already in
    /// flight. Reception is not continuous: the consumer re-triggers from
    /// its `on_received` callback when it wants the next datagram, which
    /// keeps the receive rate under its control.
    pub fn receive(&self) {
        let shared = &self.inner.shared;
        if !shared.started.load(Ordering::SeqCst) {
            return;
        }
        if shared
            .receiving
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        if self.inner.cmd_tx.send(Command::Receive).is_err() {
            shared.receiving.store(false, Ordering::SeqCst);
        }
    }

    /// Submit one asynchronous send of `buffer` to `destination`.
    ///
    /// The caller's bytes are copied out before this returns, so the buffer
    /// may be transient. Returns `false` without side effects when the
    /// server is not started or another send is still in flight; returns
    /// `true` with no I/O for an empty buffer. Completion is reported via
    /// `on_sent`.
    pub fn send_async(&self, destination: SocketAddr, buffer: &[u8]) -> bool {
        let shared = &self.inner.shared;

        if shared.sending.load(Ordering::SeqCst) {
            return false;
        }
        if !shared.started.load(Ordering::SeqCst) {
            return false;
        }
        if buffer.is_empty() {
            return true;
        }

        // Claim the single in-flight send slot
        if shared
            .sending
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        shared
            .bytes_sending
            .store(buffer.len() as u64, Ordering::Relaxed);

        let data = Bytes::copy_from_slice(buffer);
        if self
            .inner
            .cmd_tx
            .send(Command::Send { destination, data })
            .is_err()
        {
            shared.bytes_sending.store(0, Ordering::Relaxed);
            shared.sending.store(false, Ordering::SeqCst);
            return false;
        }

        true
    }

    /// Send `buffer` to `destination` inline on the calling thread.
    ///
    /// Blocks until the OS accepts the datagram or fails. On success the
    /// sent counters advance and `on_sent` is delivered via the dispatcher
    /// task; on failure the error is classified and reported through
    /// `on_error`. Returns `true` with no I/O for an empty buffer.
    pub fn send_sync(&self, destination: SocketAddr, buffer: &[u8]) -> bool {
        let shared = &self.inner.shared;

        if !shared.started.load(Ordering::SeqCst) {
            return false;
        }
        if buffer.is_empty() {
            return true;
        }

        let socket = shared.socket.lock().unwrap().clone();
        let socket = match socket {
            Some(socket) => socket,
            None => return false,
        };

        loop {
            match socket.try_send_to(buffer, destination) {
                Ok(sent) => {
                    shared.datagrams_sent.fetch_add(1, Ordering::Relaxed);
                    shared.bytes_sent.fetch_add(sent as u64, Ordering::Relaxed);
                    let _ = self
                        .inner
                        .cmd_tx
                        .send(Command::NotifySent { destination, sent });
                    return true;
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => thread::yield_now(),
                Err(err) => {
                    match error::classify(&err) {
                        Some(report) => {
                            let _ = self.inner.cmd_tx.send(Command::NotifyError(report));
                        }
                        None => debug!(error = %err, "suppressed teardown error on sync send"),
                    }
                    return false;
                }
            }
        }
    }

    /// Submit one asynchronous send to the remembered multicast destination.
    ///
    /// Returns `false` when no multicast destination was configured at start.
    pub fn multicast_async(&self, buffer: &[u8]) -> bool {
        match self.multicast_endpoint() {
            Some(endpoint) => self.send_async(endpoint, buffer),
            None => false,
        }
    }

    /// Send to the remembered multicast destination inline on the calling
    /// thread.
    pub fn multicast_sync(&self, buffer: &[u8]) -> bool {
        match self.multicast_endpoint() {
            Some(endpoint) => self.send_sync(endpoint, buffer),
            None => false,
        }
    }

    /// Whether the server is started.
    pub fn is_started(&self) -> bool {
        self.inner.shared.started.load(Ordering::SeqCst)
    }

    /// The endpoint the server binds to, as configured at construction.
    pub fn endpoint(&self) -> SocketAddr {
        self.inner.shared.endpoint
    }

    /// The actual bound address while the server is started.
    ///
    /// Differs from [`endpoint`](Self::endpoint) when binding to port 0.
    pub fn local_endpoint(&self) -> Option<SocketAddr> {
        *self.inner.shared.local_endpoint.lock().unwrap()
    }

    /// The remembered multicast destination, if one was configured.
    pub fn multicast_endpoint(&self) -> Option<SocketAddr> {
        *self.inner.shared.multicast_endpoint.lock().unwrap()
    }

    /// Enable or disable `SO_REUSEADDR`; consulted at bind time only.
    pub fn set_reuse_address(&self, enable: bool) {
        self.inner
            .shared
            .reuse_address
            .store(enable, Ordering::SeqCst);
    }

    /// Whether `SO_REUSEADDR` will be applied at bind time.
    pub fn reuse_address(&self) -> bool {
        self.inner.shared.reuse_address.load(Ordering::SeqCst)
    }

    /// Enable or disable `SO_REUSEPORT`; consulted at bind time only and
    /// ignored on platforms without the option.
    pub fn set_reuse_port(&self, enable: bool) {
        self.inner.shared.reuse_port.store(enable, Ordering::SeqCst);
    }

    /// Whether `SO_REUSEPORT` will be applied at bind time.
    pub fn reuse_port(&self) -> bool {
        self.inner.shared.reuse_port.load(Ordering::SeqCst)
    }

    /// Current `SO_RCVBUF` value of the live socket.
    pub fn receive_buffer_size(&self) -> io::Result<usize> {
        self.with_socket(|socket| SockRef::from(socket).recv_buffer_size())
    }

    /// Current `SO_SNDBUF` value of the live socket.
    pub fn send_buffer_size(&self) -> io::Result<usize> {
        self.with_socket(|socket| SockRef::from(socket).send_buffer_size())
    }

    /// Apply a `SO_RCVBUF` size to the live socket.
    pub fn set_receive_buffer_size(&self, size: usize) -> io::Result<()> {
        self.with_socket(|socket| SockRef::from(socket).set_recv_buffer_size(size))
    }

    /// Apply a `SO_SNDBUF` size to the live socket.
    pub fn set_send_buffer_size(&self, size: usize) -> io::Result<()> {
        self.with_socket(|socket| SockRef::from(socket).set_send_buffer_size(size))
    }

    /// Bytes queued for the send currently in flight.
    pub fn bytes_sending(&self) -> u64 {
        self.inner.shared.bytes_sending.load(Ordering::Relaxed)
    }

    /// Cumulative bytes sent since the last (re)start.
    pub fn bytes_sent(&self) -> u64 {
        self.inner.shared.bytes_sent.load(Ordering::Relaxed)
    }

    /// Cumulative bytes received since the last (re)start.
    pub fn bytes_received(&self) -> u64 {
        self.inner.shared.bytes_received.load(Ordering::Relaxed)
    }

    /// Cumulative datagrams sent since the last (re)start.
    pub fn datagrams_sent(&self) -> u64 {
        self.inner.shared.datagrams_sent.load(Ordering::Relaxed)
    }

    /// Cumulative datagrams received since the last (re)start.
    pub fn datagrams_received(&self) -> u64 {
        self.inner.shared.datagrams_received.load(Ordering::Relaxed)
    }

    fn with_socket<T>(&self, op: impl FnOnce(&UdpSocket) -> io::Result<T>) -> io::Result<T> {
        let socket = self.inner.shared.socket.lock().unwrap().clone();
        match socket {
            Some(socket) => op(socket.as_ref()),
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "UDP server is not started",
            )),
        }
    }
}

impl fmt::Debug for UdpServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UdpServer")
            .field("endpoint", &self.endpoint())
            .field("local_endpoint", &self.local_endpoint())
            .field("started", &self.is_started())
            .finish()
    }
}

/// An outbound datagram while it is in flight
#[derive(Clone)]
struct PendingSend {
    destination: SocketAddr,
    data: Bytes,
}

enum Event {
    Command(Option<Command>),
    ReceiveDone(io::Result<(usize, SocketAddr)>),
    SendDone(io::Result<usize>),
}

/// The server's dispatcher task: the serialized execution domain for every
/// socket-mutating operation and every consumer callback.
struct Dispatcher {
    shared: Arc<Shared>,
    server: Weak<Inner>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    handler: Box<dyn UdpServerHandler>,
    socket: Option<Arc<UdpSocket>>,
    recv_buffer: Vec<u8>,
    pending_send: Option<PendingSend>,
}

impl Dispatcher {
    async fn run(mut self) {
        loop {
            match self.next_event().await {
                Event::Command(Some(Command::Shutdown)) | Event::Command(None) => break,
                Event::Command(Some(cmd)) => self.handle_command(cmd),
                Event::ReceiveDone(result) => self.complete_receive(result),
                Event::SendDone(result) => self.complete_send(result),
            }
        }

        // Last handle is gone: close the socket on the way out
        self.socket = None;
        *self.shared.socket.lock().unwrap() = None;
        self.shared.started.store(false, Ordering::SeqCst);
    }

    /// Multiplex the command channel with the armed receive/send operations.
    ///
    /// At most one receive and at most one send are ever armed at a time;
    /// both socket futures are cancel-safe, so losing the race to another
    /// branch never loses data.
    async fn next_event(&mut self) -> Event {
        let receive_armed =
            self.socket.is_some() && self.shared.receiving.load(Ordering::SeqCst);
        let send_armed = self.socket.is_some() && self.pending_send.is_some();

        let recv_socket = if receive_armed { self.socket.clone() } else { None };
        let send_socket = if send_armed { self.socket.clone() } else { None };
        let send = if send_armed { self.pending_send.clone() } else { None };

        let cmd_rx = &mut self.cmd_rx;
        let recv_buffer = &mut self.recv_buffer;

        tokio::select! {
            cmd = cmd_rx.recv() => Event::Command(cmd),
            result = receive_from(recv_socket, recv_buffer), if receive_armed => {
                Event::ReceiveDone(result)
            }
            result = send_to(send_socket, send), if send_armed => {
                Event::SendDone(result)
            }
        }
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Start => self.handle_start(),
            Command::Stop => self.handle_stop(),
            Command::Receive => {
                // Stopped before the trigger was dispatched
                if self.socket.is_none() {
                    self.shared.receiving.store(false, Ordering::SeqCst);
                }
            }
            Command::Send { destination, data } => self.submit_send(destination, data),
            Command::NotifySent { destination, sent } => {
                if self.shared.started.load(Ordering::SeqCst) {
                    if let Some(server) = self.server() {
                        self.handler.on_sent(&server, destination, sent);
                    }
                }
            }
            Command::NotifyError(report) => {
                if self.shared.started.load(Ordering::SeqCst) {
                    self.handler
                        .on_error(report.code, report.category, &report.message);
                }
            }
            Command::Shutdown => {}
        }
    }

    fn handle_start(&mut self) {
        if self.shared.started.load(Ordering::SeqCst) {
            return;
        }

        let endpoint = self.shared.endpoint;
        let (socket, recv_buffer_size) = match open_socket(&self.shared) {
            Ok(opened) => opened,
            Err(err) => {
                error!(%endpoint, error = %err, "failed to open server socket");
                self.report_error(err);
                return;
            }
        };

        let local = socket.local_addr().ok();
        *self.shared.local_endpoint.lock().unwrap() = local;

        let socket = Arc::new(socket);
        *self.shared.socket.lock().unwrap() = Some(socket.clone());
        self.socket = Some(socket);

        // Size the receive buffer to the socket's receive buffer option
        self.recv_buffer.clear();
        self.recv_buffer.resize(recv_buffer_size.max(1), 0);

        self.shared.reset_statistics();
        self.shared.started.store(true, Ordering::SeqCst);
        debug!(%endpoint, ?local, "UDP server started");

        if let Some(server) = self.server() {
            self.handler.on_started(&server);
        }
    }

    fn handle_stop(&mut self) {
        if !self.shared.started.load(Ordering::SeqCst) {
            return;
        }

        // Dropping the socket cancels whatever is in flight; the armed
        // branches disappear with the cleared flags, so no stale completion
        // ever reaches the consumer.
        self.socket = None;
        *self.shared.socket.lock().unwrap() = None;
        *self.shared.local_endpoint.lock().unwrap() = None;
        self.pending_send = None;
        self.shared.receiving.store(false, Ordering::SeqCst);
        self.shared.sending.store(false, Ordering::SeqCst);
        self.shared.started.store(false, Ordering::SeqCst);
        debug!(endpoint = %self.shared.endpoint, "UDP server stopped");

        if let Some(server) = self.server() {
            self.handler.on_stopped(&server);
        }
    }

    fn submit_send(&mut self, destination: SocketAddr, data: Bytes) {
        // Stopped between submission and dispatch
        if self.socket.is_none() || !self.shared.started.load(Ordering::SeqCst) {
            self.shared.bytes_sending.store(0, Ordering::Relaxed);
            self.shared.sending.store(false, Ordering::SeqCst);
            return;
        }

        self.pending_send = Some(PendingSend { destination, data });
    }

    fn complete_receive(&mut self, result: io::Result<(usize, SocketAddr)>) {
        // Clear the flag first so the handler can re-trigger immediately
        self.shared.receiving.store(false, Ordering::SeqCst);

        if !self.shared.started.load(Ordering::SeqCst) {
            return;
        }

        match result {
            Err(err) => self.report_error(err),
            Ok((0, _)) => {}
            Ok((size, peer)) => {
                self.shared.datagrams_received.fetch_add(1, Ordering::Relaxed);
                self.shared
                    .bytes_received
                    .fetch_add(size as u64, Ordering::Relaxed);

                grow_if_filled(&mut self.recv_buffer, size);

                if let Some(server) = self.server() {
                    self.handler
                        .on_received(&server, peer, &self.recv_buffer[..size]);
                }
            }
        }
    }

    fn complete_send(&mut self, result: io::Result<usize>) {
        let pending = self.pending_send.take();
        self.shared.sending.store(false, Ordering::SeqCst);

        if !self.shared.started.load(Ordering::SeqCst) {
            return;
        }

        let destination = match pending {
            Some(pending) => pending.destination,
            None => return,
        };

        match result {
            Err(err) => self.report_error(err),
            Ok(0) => {}
            Ok(sent) => {
                self.shared.bytes_sending.store(0, Ordering::Relaxed);
                self.shared
                    .bytes_sent
                    .fetch_add(sent as u64, Ordering::Relaxed);
                self.shared.datagrams_sent.fetch_add(1, Ordering::Relaxed);

                if let Some(server) = self.server() {
                    self.handler.on_sent(&server, destination, sent);
                }
            }
        }
    }

    fn report_error(&mut self, err: io::Error) {
        match error::classify(&err) {
            Some(report) => self
                .handler
                .on_error(report.code, report.category, &report.message),
            None => debug!(error = %err, "suppressed expected teardown error"),
        }
    }

    fn server(&self) -> Option<UdpServer> {
        self.server.upgrade().map(|inner| UdpServer { inner })
    }
}

async fn receive_from(
    socket: Option<Arc<UdpSocket>>,
    buffer: &mut [u8],
) -> io::Result<(usize, SocketAddr)> {
    match socket {
        Some(socket) => socket.recv_from(buffer).await,
        None => futures::future::pending().await,
    }
}

async fn send_to(socket: Option<Arc<UdpSocket>>, send: Option<PendingSend>) -> io::Result<usize> {
    match (socket, send) {
        (Some(socket), Some(send)) => socket.send_to(&send.data, send.destination).await,
        _ => futures::future::pending().await,
    }
}

/// Open, configure and bind the server socket; returns it together with the
/// OS receive-buffer size used to size the in-memory receive buffer.
fn open_socket(shared: &Shared) -> io::Result<(UdpSocket, usize)> {
    let endpoint = shared.endpoint;
    let socket = Socket::new(Domain::for_address(endpoint), Type::DGRAM, Some(Protocol::UDP))?;

    if shared.reuse_address.load(Ordering::SeqCst) {
        socket.set_reuse_address(true)?;
    }
    #[cfg(unix)]
    if shared.reuse_port.load(Ordering::SeqCst) {
        socket.set_reuse_port(true)?;
    }

    socket.bind(&endpoint.into())?;
    socket.set_nonblocking(true)?;

    let recv_buffer_size = socket.recv_buffer_size()?;
    let socket = UdpSocket::from_std(socket.into())?;
    Ok((socket, recv_buffer_size))
}

/// Double the receive buffer when a datagram filled it exactly; the payload
/// may have been truncated, so the next receive needs headroom.
fn grow_if_filled(buffer: &mut Vec<u8>, received: usize) {
    if received > 0 && received == buffer.len() {
        buffer.resize(received * 2, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopHandler;

    impl UdpServerHandler for NoopHandler {}

    #[test]
    fn buffer_doubles_only_when_filled_exactly() {
        let mut buffer = vec![0u8; 8];

        grow_if_filled(&mut buffer, 4);
        assert_eq!(buffer.len(), 8);

        grow_if_filled(&mut buffer, 8);
        assert_eq!(buffer.len(), 16);

        grow_if_filled(&mut buffer, 0);
        assert_eq!(buffer.len(), 16);
    }

    #[tokio::test]
    async fn initial_state_is_stopped_with_zero_counters() {
        let service = Service::from_current().unwrap();
        let server = UdpServer::new(&service, NoopHandler, InternetProtocol::IPv4, 0);

        assert!(!server.is_started());
        assert!(server.local_endpoint().is_none());
        assert!(server.multicast_endpoint().is_none());
        assert_eq!(server.bytes_sending(), 0);
        assert_eq!(server.bytes_sent(), 0);
        assert_eq!(server.bytes_received(), 0);
        assert_eq!(server.datagrams_sent(), 0);
        assert_eq!(server.datagrams_received(), 0);
        assert!(server.receive_buffer_size().is_err());
    }

    #[tokio::test]
    async fn endpoint_reflects_the_protocol_family() {
        let service = Service::from_current().unwrap();

        let v4 = UdpServer::new(&service, NoopHandler, InternetProtocol::IPv4, 4444);
        assert_eq!(v4.endpoint(), "0.0.0.0:4444".parse().unwrap());

        let v6 = UdpServer::new(&service, NoopHandler, InternetProtocol::IPv6, 4444);
        assert_eq!(v6.endpoint(), "[::]:4444".parse().unwrap());

        let named = UdpServer::with_address(&service, NoopHandler, "127.0.0.1", 4444).unwrap();
        assert_eq!(named.endpoint(), "127.0.0.1:4444".parse().unwrap());

        assert!(UdpServer::with_address(&service, NoopHandler, "not-an-ip", 4444).is_err());
    }
}
