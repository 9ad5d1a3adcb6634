//! Cluster membership as seen by the receiver.
//!
//! The receiver only needs to know which nodes own a metric and how to reach them. Membership,
//! failure detection and the network transport live behind the [`Cluster`] trait. Two
//! implementations ship with this crate: [`SingleNode`], which owns everything, and
//! [`StaticCluster`], an explicit member list connected through an in-process [`ClusterHub`].

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hashbrown::HashMap;
use parking_lot::Mutex;
use strata_system::{Addr, Interface, Receiver, channel};
use tokio::sync::watch;

use crate::Ident;

/// Capacity of the channels registered with a cluster.
const CLUSTER_CHANNEL_CAPACITY: usize = 1024;

/// A member of the cluster.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Node {
    /// Unique name of the node.
    pub name: String,
    /// Address the node is reachable at.
    pub addr: IpAddr,
    /// Whether the node accepts points.
    pub ready: bool,
}

/// An opaque message between two cluster nodes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterMsg {
    /// Name of the sending node.
    pub src: String,
    /// Name of the receiving node.
    pub dst: String,
    /// Encoded payload.
    pub body: Vec<u8>,
}

impl Interface for ClusterMsg {}

/// An error reported by a [`Cluster`].
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// The local node is no longer part of the cluster.
    #[error("node {0} is not a cluster member")]
    NotMember(String),
    /// The transport failed.
    #[error("cluster transport failed: {0}")]
    Transport(String),
}

/// Membership and transport of a multi-node deployment.
#[async_trait]
pub trait Cluster: Send + Sync + 'static {
    /// Returns the local node, or `None` if this process is not part of a cluster.
    fn local_node(&self) -> Option<Node>;

    /// Returns the nodes owning `ident`.
    fn owner_nodes(&self, ident: &Ident) -> Vec<Node>;

    /// Returns the number of known members.
    fn num_members(&self) -> usize;

    /// Opens the message channel of the local node.
    ///
    /// Messages sent through the returned address are delivered to their destination node.
    /// Messages addressed to the local node arrive on the returned receiver.
    fn register_channel(&self) -> (Addr<ClusterMsg>, Receiver<ClusterMsg>);

    /// Returns a receiver that changes whenever membership changes.
    fn notify_changes(&self) -> watch::Receiver<u64>;

    /// Marks the local node as ready or not ready to accept points.
    async fn ready(&self, ready: bool) -> Result<(), ClusterError>;

    /// Announces that the local node is leaving, waiting at most `timeout`.
    async fn leave(&self, timeout: Duration) -> Result<(), ClusterError>;

    /// Releases all cluster resources of the local node.
    async fn shutdown(&self) -> Result<(), ClusterError>;
}

/// A cluster of one node that owns every metric.
#[derive(Debug)]
pub struct SingleNode {
    node: Node,
    changes: watch::Sender<u64>,
}

impl SingleNode {
    /// Creates a single node cluster.
    pub fn new(name: impl Into<String>, addr: IpAddr) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            node: Node {
                name: name.into(),
                addr,
                ready: true,
            },
            changes,
        }
    }
}

impl Default for SingleNode {
    fn default() -> Self {
        Self::new("local", IpAddr::V4(Ipv4Addr::LOCALHOST))
    }
}

#[async_trait]
impl Cluster for SingleNode {
    fn local_node(&self) -> Option<Node> {
        Some(self.node.clone())
    }

    fn owner_nodes(&self, _ident: &Ident) -> Vec<Node> {
        vec![self.node.clone()]
    }

    fn num_members(&self) -> usize {
        1
    }

    fn register_channel(&self) -> (Addr<ClusterMsg>, Receiver<ClusterMsg>) {
        channel("cluster", CLUSTER_CHANNEL_CAPACITY)
    }

    fn notify_changes(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    async fn ready(&self, _ready: bool) -> Result<(), ClusterError> {
        Ok(())
    }

    async fn leave(&self, _timeout: Duration) -> Result<(), ClusterError> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), ClusterError> {
        Ok(())
    }
}

#[derive(Debug)]
struct HubState {
    members: BTreeMap<String, Node>,
    inboxes: HashMap<String, Addr<ClusterMsg>>,
    generation: watch::Sender<u64>,
}

impl HubState {
    fn bump(&self) {
        self.generation.send_modify(|generation| *generation += 1);
    }
}

/// In-process membership and transport shared by the nodes of a [`StaticCluster`].
///
/// Clones refer to the same hub.
#[derive(Clone, Debug)]
pub struct ClusterHub {
    state: Arc<Mutex<HubState>>,
}

impl ClusterHub {
    /// Creates a hub without members.
    pub fn new() -> Self {
        let (generation, _) = watch::channel(0);
        let state = HubState {
            members: BTreeMap::new(),
            inboxes: HashMap::new(),
            generation,
        };

        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Adds a node and returns its view of the cluster.
    ///
    /// The node starts out not ready. Joining with the name of an existing member replaces it.
    pub fn join(&self, name: impl Into<String>, addr: IpAddr) -> StaticCluster {
        let name = name.into();
        let node = Node {
            name: name.clone(),
            addr,
            ready: false,
        };

        let mut state = self.state.lock();
        state.members.insert(name.clone(), node);
        state.bump();

        StaticCluster {
            name,
            hub: self.clone(),
        }
    }

    /// Removes a member and drops its inbox.
    pub fn remove(&self, name: &str) -> Option<Node> {
        let mut state = self.state.lock();
        state.inboxes.remove(name);
        let node = state.members.remove(name);
        if node.is_some() {
            state.bump();
        }
        node
    }

    /// Returns all members sorted by name.
    pub fn members(&self) -> Vec<Node> {
        self.state.lock().members.values().cloned().collect()
    }

    fn inbox(&self, name: &str) -> Option<Addr<ClusterMsg>> {
        self.state.lock().inboxes.get(name).cloned()
    }
}

impl Default for ClusterHub {
    fn default() -> Self {
        Self::new()
    }
}

/// A node's view of a [`ClusterHub`].
///
/// Every metric has exactly one owner, picked by jump consistent hashing of the identity over the
/// ready members sorted by name. Ownership follows membership immediately; cached state is never
/// migrated.
#[derive(Clone, Debug)]
pub struct StaticCluster {
    name: String,
    hub: ClusterHub,
}

impl StaticCluster {
    /// The name of the local node.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The shared hub.
    pub fn hub(&self) -> &ClusterHub {
        &self.hub
    }

    fn set_ready(&self, ready: bool) -> Result<(), ClusterError> {
        let mut state = self.hub.state.lock();
        let node = state
            .members
            .get_mut(&self.name)
            .ok_or_else(|| ClusterError::NotMember(self.name.clone()))?;

        if node.ready != ready {
            node.ready = ready;
            state.bump();
        }

        Ok(())
    }
}

#[async_trait]
impl Cluster for StaticCluster {
    fn local_node(&self) -> Option<Node> {
        self.hub.state.lock().members.get(&self.name).cloned()
    }

    fn owner_nodes(&self, ident: &Ident) -> Vec<Node> {
        let state = self.hub.state.lock();
        let ready: Vec<&Node> = state.members.values().filter(|node| node.ready).collect();
        if ready.is_empty() {
            return Vec::new();
        }

        let bucket = jump_hash(ident.hash64(), ready.len());
        vec![ready[bucket].clone()]
    }

    fn num_members(&self) -> usize {
        self.hub.state.lock().members.len()
    }

    fn register_channel(&self) -> (Addr<ClusterMsg>, Receiver<ClusterMsg>) {
        let (inbox, inbox_rx) = channel("cluster", CLUSTER_CHANNEL_CAPACITY);
        self.hub
            .state
            .lock()
            .inboxes
            .insert(self.name.clone(), inbox);

        let (outbox, mut outbox_rx) = channel::<ClusterMsg>("cluster_out", CLUSTER_CHANNEL_CAPACITY);
        let hub = self.hub.clone();
        tokio::spawn(async move {
            while let Some(message) = outbox_rx.recv().await {
                let Some(inbox) = hub.inbox(&message.dst) else {
                    strata_log::debug!(dst = %message.dst, "no route to cluster node");
                    continue;
                };

                if inbox.send(message).await.is_err() {
                    strata_log::debug!("cluster node inbox closed");
                }
            }
        });

        (outbox, inbox_rx)
    }

    fn notify_changes(&self) -> watch::Receiver<u64> {
        self.hub.state.lock().generation.subscribe()
    }

    async fn ready(&self, ready: bool) -> Result<(), ClusterError> {
        self.set_ready(ready)
    }

    async fn leave(&self, _timeout: Duration) -> Result<(), ClusterError> {
        // Leaving an in-process hub completes immediately.
        self.hub
            .remove(&self.name)
            .map(drop)
            .ok_or_else(|| ClusterError::NotMember(self.name.clone()))
    }

    async fn shutdown(&self) -> Result<(), ClusterError> {
        self.hub.state.lock().inboxes.remove(&self.name);
        Ok(())
    }
}

/// Maps `key` to one of `buckets` buckets.
///
/// Implements "A Fast, Minimal Memory, Consistent Hash Algorithm" by Lamping and Veach.
fn jump_hash(mut key: u64, buckets: usize) -> usize {
    let mut b: i64 = -1;
    let mut j: i64 = 0;

    while j < buckets as i64 {
        b = j;
        key = key.wrapping_mul(2862933555777941757).wrapping_add(1);
        j = ((b + 1) as f64 * ((1u64 << 31) as f64 / ((key >> 33) + 1) as f64)) as i64;
    }

    b.max(0) as usize
}
