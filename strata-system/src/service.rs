use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;

use crate::statsd::SystemGauges;
use crate::{ServiceJoinHandle, ShutdownHandle};

/// A message interface for [services](Service).
///
/// Most commonly, this interface is an enumeration of the messages a service handles, but it can
/// be any plain message type.
pub trait Interface: Send + 'static {}

/// Services without messages can use `()` as their interface.
impl Interface for () {}

/// An error when [sending](Addr::send) a message to a service fails.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("failed to send message to service")]
pub struct SendError;

/// An error when [trying to send](Addr::try_send) a message to a service without waiting.
///
/// Both variants hand the undelivered message back to the caller.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum TrySendError<I> {
    /// The inbound channel of the service is full.
    #[error("service queue is full")]
    Full(I),
    /// The service has shut down.
    #[error("service is closed")]
    Closed(I),
}

impl<I> TrySendError<I> {
    /// Returns the message that could not be sent.
    pub fn into_inner(self) -> I {
        match self {
            Self::Full(message) | Self::Closed(message) => message,
        }
    }
}

/// The address of a [`Service`].
///
/// Addresses allow to [send](Self::send) messages to a service's inbound channel. Since the
/// channel is bounded, sending waits while the service is backlogged, which propagates back
/// pressure to the caller. The address can be freely cloned.
pub struct Addr<I: Interface> {
    tx: mpsc::Sender<I>,
    queue_size: Arc<AtomicU64>,
    name: &'static str,
}

impl<I: Interface> Addr<I> {
    /// Sends a message to the service, waiting while its queue is full.
    ///
    /// Fails with [`SendError`] if the service has shut down.
    pub async fn send(&self, message: I) -> Result<(), SendError> {
        self.queue_size.fetch_add(1, Ordering::SeqCst);
        match self.tx.send(message).await {
            Ok(()) => Ok(()),
            Err(_) => {
                self.queue_size.fetch_sub(1, Ordering::SeqCst);
                Err(SendError)
            }
        }
    }

    /// Sends a message to the service without waiting.
    pub fn try_send(&self, message: I) -> Result<(), TrySendError<I>> {
        match self.tx.try_send(message) {
            Ok(()) => {
                self.queue_size.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(message)) => Err(TrySendError::Full(message)),
            Err(mpsc::error::TrySendError::Closed(message)) => Err(TrySendError::Closed(message)),
        }
    }

    /// Returns the number of messages queued or waiting to be queued for the service.
    pub fn len(&self) -> u64 {
        self.queue_size.load(Ordering::Relaxed)
    }

    /// Returns `true` if no messages are queued for the service.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` if the service has stopped receiving messages.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Returns the name of the channel this address sends to.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Emits the current queue length as back pressure gauge.
    pub fn report_back_pressure(&self) {
        strata_statsd::metric!(
            gauge(SystemGauges::ServiceBackPressure) = self.len(),
            service = self.name
        );
    }
}

// Manually derive clone since we do not require `I: Clone` and the Clone derive adds this
// constraint.
impl<I: Interface> Clone for Addr<I> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            queue_size: self.queue_size.clone(),
            name: self.name,
        }
    }
}

impl<I: Interface> fmt::Debug for Addr<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Addr")
            .field("name", &self.name)
            .field("open", &!self.tx.is_closed())
            .field("queue_size", &self.len())
            .finish()
    }
}

/// Inbound channel for messages sent through an [`Addr`].
///
/// This channel is meant to be polled in a [`Service`].
pub struct Receiver<I: Interface> {
    rx: mpsc::Receiver<I>,
    queue_size: Arc<AtomicU64>,
    name: &'static str,
}

impl<I: Interface> Receiver<I> {
    /// Receives the next value for this receiver.
    ///
    /// This method returns `None` if the channel has been closed and there are no remaining
    /// messages in the channel's buffer.
    pub async fn recv(&mut self) -> Option<I> {
        let message = self.rx.recv().await;
        if message.is_some() {
            self.queue_size.fetch_sub(1, Ordering::SeqCst);
        }
        message
    }

    /// Receives the next message if one is immediately available.
    pub fn try_recv(&mut self) -> Option<I> {
        let message = self.rx.try_recv().ok();
        if message.is_some() {
            self.queue_size.fetch_sub(1, Ordering::SeqCst);
        }
        message
    }

    /// Returns the name of this channel.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<I: Interface> fmt::Debug for Receiver<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Receiver")
            .field("name", &self.name)
            .field("queue_size", &self.queue_size.load(Ordering::Relaxed))
            .finish()
    }
}

/// Creates a bounded channel for a service.
///
/// Sending through the returned [`Addr`] waits once `capacity` messages are queued.
pub fn channel<I: Interface>(name: &'static str, capacity: usize) -> (Addr<I>, Receiver<I>) {
    let queue_size = Arc::new(AtomicU64::new(0));
    let (tx, rx) = mpsc::channel(capacity.max(1));

    let addr = Addr {
        tx,
        queue_size: queue_size.clone(),
        name,
    };

    let receiver = Receiver {
        rx,
        queue_size,
        name,
    };

    (addr, receiver)
}

/// An asynchronous unit responding to messages.
///
/// Services receive messages conforming to some [`Interface`] through an [`Addr`] and handle
/// them one by one. Internally, services are free to concurrently process these messages or not,
/// most probably should.
///
/// Every service also receives a [`ShutdownHandle`]. When shutdown is signalled, the service
/// stops accepting new work, drains what is still queued in its receiver and returns.
///
/// # Implementing Services
///
/// The standard way to implement services is through the `run` function. It receives an inbound
/// channel for all messages sent through the service's address and the shutdown handle. The run
/// loop commonly uses `tokio::select!` to react to both.
///
/// ```
/// use strata_system::{Interface, Receiver, Service, ShutdownHandle};
///
/// struct Ping;
/// impl Interface for Ping {}
///
/// struct PingService;
///
/// impl Service for PingService {
///     type Interface = Ping;
///
///     async fn run(self, mut rx: Receiver<Self::Interface>, mut shutdown: ShutdownHandle) {
///         loop {
///             tokio::select! {
///                 biased;
///
///                 _ = shutdown.notified() => break,
///                 Some(Ping) = rx.recv() => (),
///             }
///         }
///     }
/// }
/// ```
pub trait Service: Sized + Send + 'static {
    /// The interface of messages this service implements.
    type Interface: Interface;

    /// Defines the main task of this service.
    fn run(
        self,
        rx: Receiver<Self::Interface>,
        shutdown: ShutdownHandle,
    ) -> impl Future<Output = ()> + Send + 'static;

    /// Spawns the service on the current tokio runtime.
    fn start_with(
        self,
        rx: Receiver<Self::Interface>,
        shutdown: ShutdownHandle,
    ) -> ServiceJoinHandle {
        let name = rx.name();
        ServiceJoinHandle::new(name, tokio::spawn(self.run(rx, shutdown)))
    }
}
