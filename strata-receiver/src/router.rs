use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strata_log::LogError;
use strata_system::{Addr, Receiver, Service, ShutdownHandle};
use tokio::sync::watch;

use crate::statsd::ReceiverCounters;
use crate::stats::Stats;
use crate::{Cluster, ClusterMsg, Ident, IncomingPoint, Node};

/// Where a point has to be applied.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Route {
    /// This node owns the metric.
    Local,
    /// The metric is owned by other nodes.
    Forward(Vec<Node>),
    /// The metric is owned by other nodes, but the point has been forwarded too often.
    HopLimit,
}

/// A point on the wire between two nodes.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct ForwardedPoint {
    /// The metric.
    pub ident: Ident,
    /// When the sample was taken.
    pub timestamp: DateTime<Utc>,
    /// The sampled value.
    pub value: f64,
    /// Forwarding hops including the one this message represents.
    pub hops: u32,
}

impl From<ForwardedPoint> for IncomingPoint {
    fn from(point: ForwardedPoint) -> Self {
        Self {
            ident: point.ident,
            timestamp: point.timestamp,
            value: point.value,
            hops: point.hops,
        }
    }
}

/// Decides whether points are applied locally or forwarded to their owners.
///
/// Without a cluster, or while the local node is unknown to the cluster, everything is local.
#[derive(Clone)]
pub struct ClusterRouter {
    cluster: Option<Arc<dyn Cluster>>,
    outbox: Option<Addr<ClusterMsg>>,
    max_hops: u32,
    stats: Stats,
}

impl ClusterRouter {
    /// Creates a router that treats every metric as local.
    pub fn local(stats: Stats) -> Self {
        Self {
            cluster: None,
            outbox: None,
            max_hops: 0,
            stats,
        }
    }

    /// Creates a router for a cluster, sending forwarded points through `outbox`.
    pub fn clustered(
        cluster: Arc<dyn Cluster>,
        outbox: Addr<ClusterMsg>,
        max_hops: u32,
        stats: Stats,
    ) -> Self {
        Self {
            cluster: Some(cluster),
            outbox: Some(outbox),
            max_hops,
            stats,
        }
    }

    /// Returns where `point` has to be applied.
    ///
    /// Ownership is looked up on every call, so it follows membership changes immediately.
    pub fn route(&self, point: &IncomingPoint) -> Route {
        let Some(ref cluster) = self.cluster else {
            return Route::Local;
        };
        let Some(local) = cluster.local_node() else {
            return Route::Local;
        };

        let owners = cluster.owner_nodes(&point.ident);
        if owners.is_empty() || owners.iter().any(|node| node.name == local.name) {
            return Route::Local;
        }

        if point.hops >= self.max_hops {
            return Route::HopLimit;
        }

        Route::Forward(owners)
    }

    /// Sends a copy of `point` with one more hop to every ready owner.
    pub async fn forward(&self, point: IncomingPoint, owners: Vec<Node>) {
        let (Some(cluster), Some(outbox)) = (&self.cluster, &self.outbox) else {
            self.stats
                .count_reason(ReceiverCounters::PointsForwardFailed, 1, "no_transport");
            return;
        };

        let src = cluster
            .local_node()
            .map(|node| node.name)
            .unwrap_or_default();

        let forwarded = ForwardedPoint {
            ident: point.ident,
            timestamp: point.timestamp,
            value: point.value,
            hops: point.hops.saturating_add(1),
        };

        let body = match serde_json::to_vec(&forwarded) {
            Ok(body) => body,
            Err(error) => {
                strata_log::error!("failed to encode forwarded point: {}", LogError(&error));
                return;
            }
        };

        for node in owners {
            if !node.ready {
                self.stats
                    .count_reason(ReceiverCounters::PointsForwardFailed, 1, "not_ready");
                continue;
            }

            let message = ClusterMsg {
                src: src.clone(),
                dst: node.name,
                body: body.clone(),
            };

            match outbox.send(message).await {
                Ok(()) => self.stats.count(ReceiverCounters::PointsForwarded, 1),
                Err(_) => self
                    .stats
                    .count_reason(ReceiverCounters::PointsForwardFailed, 1, "closed"),
            }
        }
    }
}

impl std::fmt::Debug for ClusterRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterRouter")
            .field("clustered", &self.cluster.is_some())
            .field("max_hops", &self.max_hops)
            .finish()
    }
}

/// Feeds points forwarded by other nodes into the local ingress and logs membership changes.
pub struct ClusterInboxService {
    ingress: Addr<IncomingPoint>,
    changes: watch::Receiver<u64>,
    stats: Stats,
}

impl ClusterInboxService {
    /// Creates the inbox service.
    pub fn new(ingress: Addr<IncomingPoint>, changes: watch::Receiver<u64>, stats: Stats) -> Self {
        Self {
            ingress,
            changes,
            stats,
        }
    }

    async fn handle_message(&self, message: ClusterMsg) {
        let point = match serde_json::from_slice::<ForwardedPoint>(&message.body) {
            Ok(point) => point,
            Err(error) => {
                self.stats.count(ReceiverCounters::ForwardedInvalid, 1);
                strata_log::debug!(
                    src = %message.src,
                    "invalid forwarded point: {}",
                    LogError(&error)
                );
                return;
            }
        };

        self.stats.count(ReceiverCounters::ForwardedReceived, 1);
        if self.ingress.send(point.into()).await.is_err() {
            strata_log::debug!("ingress closed, dropping forwarded point");
        }
    }
}

impl Service for ClusterInboxService {
    type Interface = ClusterMsg;

    async fn run(mut self, mut rx: Receiver<Self::Interface>, mut shutdown: ShutdownHandle) {
        self.changes.borrow_and_update();

        loop {
            tokio::select! {
                biased;

                _ = shutdown.notified() => break,
                Some(message) = rx.recv() => self.handle_message(message).await,
                Ok(()) = self.changes.changed() => {
                    let generation = *self.changes.borrow_and_update();
                    self.stats.count(ReceiverCounters::ClusterChanges, 1);
                    strata_log::info!(generation, "cluster membership changed");
                }
            }
        }

        while let Some(message) = rx.try_recv() {
            self.handle_message(message).await;
        }
    }
}
