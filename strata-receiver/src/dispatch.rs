use strata_system::{Addr, Receiver, Service, ShutdownHandle};

use crate::IncomingPoint;

/// Routes points from the ingress channel to the worker owning their identity.
///
/// The worker is picked by [`Ident::shard`](crate::Ident::shard), so points of the same metric
/// always reach the same worker in submission order.
pub struct DispatchService {
    workers: Vec<Addr<IncomingPoint>>,
}

impl DispatchService {
    /// Creates a dispatcher for the given workers.
    pub fn new(workers: Vec<Addr<IncomingPoint>>) -> Self {
        Self { workers }
    }

    async fn dispatch(&self, point: IncomingPoint) {
        let index = point.ident.shard(self.workers.len());
        let Some(worker) = self.workers.get(index) else {
            strata_log::error!("no worker to dispatch to, dropping point");
            return;
        };

        if worker.send(point).await.is_err() {
            strata_log::error!(worker = index, "worker is gone, dropping point");
        }
    }
}

impl Service for DispatchService {
    type Interface = IncomingPoint;

    async fn run(self, mut rx: Receiver<Self::Interface>, mut shutdown: ShutdownHandle) {
        loop {
            tokio::select! {
                biased;

                _ = shutdown.notified() => break,
                Some(point) = rx.recv() => self.dispatch(point).await,
            }
        }

        while let Some(point) = rx.try_recv() {
            self.dispatch(point).await;
        }
    }
}
