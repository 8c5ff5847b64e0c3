//! Error types and the transport-error classification policy
//!
//! Asynchronous operations that are still in flight when a server stops are
//! routinely completed by the OS with a cancellation-shaped error that
//! carries no actionable information. [`classify`] separates that teardown
//! noise, which is swallowed, from genuine transport errors, which are
//! surfaced to the consumer as a (code, category, message) triple.

use std::io;
use thiserror::Error;

/// Error types for UDP server operations
#[derive(Error, Debug)]
pub enum UdpError {
    #[error("invalid server address: {0}")]
    InvalidAddress(String),

    #[error("no tokio runtime is available on the current thread")]
    NoRuntime,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result type for UDP server operations
pub type Result<T> = std::result::Result<T, UdpError>;

/// A transport error surfaced to the consumer through `on_error`
#[derive(Debug, Clone)]
pub struct ErrorReport {
    /// Platform error code, 0 when the error has no OS-level code
    pub code: i32,
    /// Error category name
    pub category: &'static str,
    /// Human-readable error message
    pub message: String,
}

/// Classify a transport error.
///
/// Returns `None` for the fixed set of teardown conditions that are expected
/// during shutdown races and must not reach the consumer: peer connection
/// aborted/refused/reset, clean end-of-stream and explicit operation
/// cancellation. Every other error is turned into an [`ErrorReport`].
pub fn classify(err: &io::Error) -> Option<ErrorReport> {
    if is_teardown(err) {
        return None;
    }

    match err.raw_os_error() {
        Some(code) => Some(ErrorReport {
            code,
            category: "system",
            message: err.to_string(),
        }),
        None => Some(ErrorReport {
            code: 0,
            category: "generic",
            message: err.to_string(),
        }),
    }
}

fn is_teardown(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::UnexpectedEof
    ) || err.raw_os_error() == Some(libc::ECANCELED)
}
