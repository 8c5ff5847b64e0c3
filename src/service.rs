//! Host dispatch service
//!
//! The server never creates threads or drives an event loop of its own.
//! Everything it schedules goes through a [`Service`], a thin wrapper around
//! a tokio runtime handle that exposes a single "post a task" primitive.
//! One service can host any number of server endpoints.

use std::future::Future;
use std::sync::Arc;

use tokio::runtime::Handle;

use crate::error::{Result, UdpError};

/// Handle to the host event-dispatch service.
///
/// Each server endpoint funnels all of its socket-mutating work through a
/// dedicated task spawned on this service; that task is the endpoint's
/// serialized execution context, so callbacks never run concurrently with
/// each other regardless of how many worker threads the runtime has.
#[derive(Debug, Clone)]
pub struct Service {
    handle: Handle,
}

impl Service {
    /// Create a service backed by the given runtime handle.
    pub fn new(handle: Handle) -> Arc<Self> {
        Arc::new(Self { handle })
    }

    /// Create a service backed by the runtime of the calling context.
    ///
    /// Fails with [`UdpError::NoRuntime`] when called outside a tokio
    /// runtime.
    pub fn from_current() -> Result<Arc<Self>> {
        let handle = Handle::try_current().map_err(|_| UdpError::NoRuntime)?;
        Ok(Arc::new(Self { handle }))
    }

    /// Post a task for later execution on the host runtime.
    pub fn post<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handle.spawn(task);
    }

    /// Get the underlying runtime handle.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_current_requires_a_runtime() {
        assert!(matches!(Service::from_current(), Err(UdpError::NoRuntime)));
    }

    #[tokio::test]
    async fn from_current_inside_a_runtime() {
        let service = Service::from_current().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();
        service.post(async move {
            let _ = tx.send(42u32);
        });
        assert_eq!(rx.await.unwrap(), 42);
    }
}
