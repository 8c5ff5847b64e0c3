//! # UDP Server
//!
//! A high-level async UDP server endpoint library for Rust, built on tokio.
//!
//! ## Overview
//!
//! This library wraps a bound datagram socket in a [`UdpServer`] entity that
//! drives non-blocking send and receive cycles through a host dispatch
//! service, tracks transfer statistics and reports everything that happens
//! through consumer callbacks. The server owns its buffers, enforces
//! at-most-one in-flight receive and at-most-one in-flight send, grows the
//! receive buffer adaptively when datagrams may have been truncated, and
//! filters out the transport errors that are only shutdown-race noise.
//!
//! ## Module Structure
//!
//! The library is organized into the following modules:
//!
//! - `error`: Error types and the transport-error classification policy
//! - `service`: The host dispatch service wrapping a tokio runtime handle
//! - `server`: The UDP server endpoint, its lifecycle state machine and the
//!   send/receive pipelines
//!
//! ## Basic Usage
//!
//! Build a [`Service`] over a tokio runtime, implement [`UdpServerHandler`]
//! for your consumer and hand both to a server:
//!
//! ```rust,no_run
//! use udp_server::{InternetProtocol, Service, UdpServer, UdpServerHandler};
//! use std::net::SocketAddr;
//!
//! struct Echo;
//!
//! impl UdpServerHandler for Echo {
//!     fn on_started(&mut self, server: &UdpServer) {
//!         // Arm the first receive; reception is consumer-paced
//!         server.receive();
//!     }
//!
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
//!     tokio::signal::ctrl_c().await.unwrap();
//!     server.stop();
//! }
//! ```
//!
//! ## Threading Model
//!
//! Every socket-mutating operation and every callback runs on one dispatcher
//! task per server, so consumers never need their own locking. The
//! submission APIs return immediately; `send_sync` and `restart` are the two
//! documented blocking exceptions, and `restart` must not be called from the
//! runtime's own threads. See the `server` module documentation for details.

pub mod error;
pub mod server;
pub mod service;

// Re-export main types for ease of use
pub use error::{ErrorReport, Result, UdpError};
pub use server::{InternetProtocol, UdpServer, UdpServerHandler};
pub use service::Service;
