use std::time::Duration;

use tokio::sync::watch;

/// Shutdown request message sent by the [`Controller`] to subscribed services.
///
/// A handler has to ensure that it doesn't take longer than `timeout` to resolve the future.
/// Ideally, open work is persisted or finished in an orderly manner but no new requests are
/// accepted anymore.
///
/// The implementation may ignore the timeout and keep draining until it's done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shutdown {
    /// The timeout for this shutdown. `None` indicates an immediate forced shutdown.
    pub timeout: Option<Duration>,
}

/// Notifies a group of services to shut down.
///
/// Every service receives a [`ShutdownHandle`] from the controller of its group. Once
/// [`shutdown`](Self::shutdown) is called, all handles resolve. Dropping the controller also
/// resolves all handles, so services never outlive the group that started them.
///
/// ```
/// use strata_system::Controller;
///
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let controller = Controller::new();
/// let mut handle = controller.shutdown_handle();
///
/// controller.shutdown(None);
/// assert_eq!(handle.notified().await.timeout, None);
/// # });
/// ```
#[derive(Debug)]
pub struct Controller {
    tx: watch::Sender<Option<Shutdown>>,
}

impl Controller {
    /// Creates a new controller that has not yet signalled shutdown.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    /// Returns a handle that resolves once this controller shuts down.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.tx.subscribe())
    }

    /// Signals shutdown to all handles.
    pub fn shutdown(&self, timeout: Option<Duration>) {
        self.tx.send_replace(Some(Shutdown { timeout }));
    }

    /// Returns `true` once [`shutdown`](Self::shutdown) has been called.
    pub fn is_shutdown(&self) -> bool {
        self.tx.borrow().is_some()
    }
}

impl Default for Controller {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to await the shutdown of a [`Controller`].
#[derive(Debug, Clone)]
pub struct ShutdownHandle(watch::Receiver<Option<Shutdown>>);

impl ShutdownHandle {
    /// Waits for the shutdown signal and returns it.
    ///
    /// Resolves immediately if shutdown has already been signalled, and also when the controller
    /// is dropped. This future is cancellation safe and can be used in `tokio::select!`.
    pub async fn notified(&mut self) -> Shutdown {
        loop {
            if let Some(shutdown) = *self.0.borrow_and_update() {
                return shutdown;
            }

            if self.0.changed().await.is_err() {
                return Shutdown { timeout: None };
            }
        }
    }

    /// Returns the shutdown signal if it has already been sent.
    pub fn get(&self) -> Option<Shutdown> {
        *self.0.borrow()
    }
}
