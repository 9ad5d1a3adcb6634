use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::FutureExt as _;
use tokio::task::{JoinError, JoinHandle};

/// The outcome of a service that did not exit cleanly.
#[derive(Debug)]
pub struct ServiceStatus(JoinError);

impl ServiceStatus {
    /// Returns `true` if the service panicked.
    pub fn is_panic(&self) -> bool {
        self.0.is_panic()
    }

    /// Returns `true` if the service was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.0.is_cancelled()
    }
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::error::Error for ServiceStatus {}

/// Handle to a spawned [`Service`](crate::Service).
///
/// Awaiting the handle waits for the service's run loop to return.
#[derive(Debug)]
pub struct ServiceJoinHandle {
    name: &'static str,
    handle: JoinHandle<()>,
}

impl ServiceJoinHandle {
    pub(crate) fn new(name: &'static str, handle: JoinHandle<()>) -> Self {
        Self { name, handle }
    }

    /// Returns the name of the service's channel.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Returns `true` once the service has exited.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Future for ServiceJoinHandle {
    type Output = Result<(), ServiceStatus>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.handle.poll_unpin(cx).map(|result| result.map_err(ServiceStatus))
    }
}
