use std::time::Duration;

use chrono::Utc;
use hashbrown::HashMap;
use strata_system::{Addr, Interface, Receiver, Service, ShutdownHandle};
use tokio::time::{Instant, MissedTickBehavior};

use crate::{AggregatorCommand, Ident, IncomingPoint};

/// How paced values for the same metric are combined within one interval.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PacedKind {
    /// Values are added up and emitted as an aggregator counter.
    Sum,
    /// The last value wins and is emitted as a regular point.
    Gauge,
}

/// A high-frequency value that is accumulated before entering the pipeline.
#[derive(Clone, Debug, PartialEq)]
pub struct PacedMetric {
    /// The metric to accumulate into.
    pub ident: Ident,
    /// The value to add or set.
    pub value: f64,
    /// How the value is accumulated.
    pub kind: PacedKind,
}

impl PacedMetric {
    /// Creates a value that is added to the running sum of `ident`.
    pub fn sum(ident: Ident, value: f64) -> Self {
        Self {
            ident,
            value,
            kind: PacedKind::Sum,
        }
    }

    /// Creates a value that replaces the running gauge of `ident`.
    pub fn gauge(ident: Ident, value: f64) -> Self {
        Self {
            ident,
            value,
            kind: PacedKind::Gauge,
        }
    }
}

impl Interface for PacedMetric {}

/// Accumulates paced metrics and emits them once per interval.
///
/// Sums leave as [`AggregatorCommand::counter`], gauges as a point submitted to ingress. Totals
/// are reset after emission and whatever is pending on shutdown is emitted before exiting.
pub struct PacedService {
    interval: Duration,
    commands: Addr<AggregatorCommand>,
    ingress: Addr<IncomingPoint>,
    totals: HashMap<(Ident, PacedKind), f64>,
}

impl PacedService {
    /// Creates the accumulator.
    pub fn new(
        interval: Duration,
        commands: Addr<AggregatorCommand>,
        ingress: Addr<IncomingPoint>,
    ) -> Self {
        Self {
            interval,
            commands,
            ingress,
            totals: HashMap::new(),
        }
    }

    fn accumulate(&mut self, metric: PacedMetric) {
        let total = self.totals.entry((metric.ident, metric.kind)).or_insert(0.0);
        match metric.kind {
            PacedKind::Sum => *total += metric.value,
            PacedKind::Gauge => *total = metric.value,
        }
    }

    async fn emit(&mut self) {
        if self.totals.is_empty() {
            return;
        }

        let now = Utc::now();
        for ((ident, kind), value) in std::mem::take(&mut self.totals) {
            let result = match kind {
                PacedKind::Sum => self.commands.send(AggregatorCommand::counter(ident, value)).await,
                PacedKind::Gauge => self.ingress.send(IncomingPoint::new(ident, now, value)).await,
            };

            if result.is_err() {
                strata_log::debug!("pipeline closed, dropping paced metric");
            }
        }
    }
}

impl Service for PacedService {
    type Interface = PacedMetric;

    async fn run(mut self, mut rx: Receiver<Self::Interface>, mut shutdown: ShutdownHandle) {
        let period = self.interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = shutdown.notified() => break,
                _ = ticker.tick() => self.emit().await,
                Some(metric) = rx.recv() => self.accumulate(metric),
            }
        }

        while let Some(metric) = rx.try_recv() {
            self.accumulate(metric);
        }
        self.emit().await;
    }
}

#[cfg(test)]
mod tests {
    use strata_system::{Controller, channel};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_sums_once_per_interval() {
        let (commands, mut commands_rx) = channel("aggregator", 16);
        let (ingress, mut ingress_rx) = channel("ingress", 16);
        let (paced, rx) = channel("paced", 16);
        let controller = Controller::new();

        let handle = PacedService::new(Duration::from_secs(1), commands, ingress)
            .start_with(rx, controller.shutdown_handle());

        for _ in 0..3 {
            paced
                .send(PacedMetric::sum(Ident::named("hits"), 5.0))
                .await
                .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(1100)).await;
        let command = commands_rx.try_recv().unwrap();
        assert_eq!(command, AggregatorCommand::counter(Ident::named("hits"), 15.0));
        assert!(commands_rx.try_recv().is_none());
        assert!(ingress_rx.try_recv().is_none());

        // Totals are reset after emission.
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(commands_rx.try_recv().is_none());

        controller.shutdown(None);
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_gauge_last_value() {
        let (commands, _commands_rx) = channel("aggregator", 16);
        let (ingress, mut ingress_rx) = channel("ingress", 16);
        let (paced, rx) = channel("paced", 16);
        let controller = Controller::new();

        let handle = PacedService::new(Duration::from_secs(1), commands, ingress)
            .start_with(rx, controller.shutdown_handle());

        for value in [3.0, 1.0, 2.0] {
            paced
                .send(PacedMetric::gauge(Ident::named("queue"), value))
                .await
                .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(1100)).await;
        let point = ingress_rx.try_recv().unwrap();
        assert_eq!(point.ident, Ident::named("queue"));
        assert_eq!(point.value, 2.0);
        assert_eq!(point.hops, 0);

        controller.shutdown(None);
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_emits_pending_on_shutdown() {
        let (commands, mut commands_rx) = channel("aggregator", 16);
        let (ingress, _ingress_rx) = channel("ingress", 16);
        let (paced, rx) = channel("paced", 16);
        let controller = Controller::new();

        let handle = PacedService::new(Duration::from_secs(60), commands, ingress)
            .start_with(rx, controller.shutdown_handle());

        paced
            .send(PacedMetric::sum(Ident::named("hits"), 1.0))
            .await
            .unwrap();

        controller.shutdown(None);
        handle.await.unwrap();

        let command = commands_rx.try_recv().unwrap();
        assert_eq!(command.value, 1.0);
    }
}
