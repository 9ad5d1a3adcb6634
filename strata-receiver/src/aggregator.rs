use serde::{Deserialize, Serialize};
use strata_system::{Interface, Receiver, Service, ShutdownHandle};
use tokio::sync::mpsc;

use crate::Ident;
use crate::statsd::ReceiverCounters;
use crate::stats::Stats;

/// The operation an [`AggregatorCommand`] asks the aggregation engine to perform.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregatorCommandKind {
    /// Adds the value to a counter.
    Counter,
    /// Sets a gauge to the value.
    Gauge,
    /// Appends the value to a list of observations.
    Append,
    /// Keeps the minimum of all values.
    Min,
    /// Keeps the maximum of all values.
    Max,
}

/// A command for the external statistical aggregation engine.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct AggregatorCommand {
    /// The operation.
    pub kind: AggregatorCommandKind,
    /// The metric to aggregate into.
    pub ident: Ident,
    /// The operand.
    pub value: f64,
}

impl AggregatorCommand {
    /// Creates a command of the given kind.
    pub fn new(kind: AggregatorCommandKind, ident: Ident, value: f64) -> Self {
        Self { kind, ident, value }
    }

    /// Adds `value` to the counter `ident`.
    pub fn counter(ident: Ident, value: f64) -> Self {
        Self::new(AggregatorCommandKind::Counter, ident, value)
    }

    /// Sets the gauge `ident` to `value`.
    pub fn gauge(ident: Ident, value: f64) -> Self {
        Self::new(AggregatorCommandKind::Gauge, ident, value)
    }

    /// Appends `value` to the observations of `ident`.
    pub fn append(ident: Ident, value: f64) -> Self {
        Self::new(AggregatorCommandKind::Append, ident, value)
    }

    /// Lowers `ident` to `value` if smaller.
    pub fn min(ident: Ident, value: f64) -> Self {
        Self::new(AggregatorCommandKind::Min, ident, value)
    }

    /// Raises `ident` to `value` if larger.
    pub fn max(ident: Ident, value: f64) -> Self {
        Self::new(AggregatorCommandKind::Max, ident, value)
    }
}

impl Interface for AggregatorCommand {}

/// Passes commands on to the aggregation engine's queue.
///
/// Commands are dropped with a stat when no engine is attached or its queue has been closed.
pub struct AggregatorForwarder {
    queue: Option<mpsc::Sender<AggregatorCommand>>,
    stats: Stats,
}

impl AggregatorForwarder {
    /// Creates a forwarder. `None` drops every command.
    pub fn new(queue: Option<mpsc::Sender<AggregatorCommand>>, stats: Stats) -> Self {
        Self { queue, stats }
    }

    async fn forward(&mut self, command: AggregatorCommand) {
        let Some(ref queue) = self.queue else {
            self.stats.count(ReceiverCounters::AggregatorDropped, 1);
            return;
        };

        if queue.send(command).await.is_err() {
            strata_log::warn!("aggregation engine has shut down, dropping commands");
            self.queue = None;
            self.stats.count(ReceiverCounters::AggregatorDropped, 1);
            return;
        }

        self.stats.count(ReceiverCounters::AggregatorCommands, 1);
    }
}

impl Service for AggregatorForwarder {
    type Interface = AggregatorCommand;

    async fn run(mut self, mut rx: Receiver<Self::Interface>, mut shutdown: ShutdownHandle) {
        loop {
            tokio::select! {
                biased;

                _ = shutdown.notified() => break,
                Some(command) = rx.recv() => self.forward(command).await,
            }
        }

        while let Some(command) = rx.try_recv() {
            self.forward(command).await;
        }
    }
}
