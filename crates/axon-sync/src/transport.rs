//! Transport and discovery seams, plus an in-process network.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use axon_clock::NodeId;
use futures::future::BoxFuture;
use tracing::trace;

use crate::error::{Error, Result};
use crate::peer::PeerInfo;
use crate::protocol::{SyncRequest, SyncResponse};

/// Carries one request to one peer and returns its answer.
///
/// Implementations report connectivity problems as
/// [`Error::PeerUnreachable`]. Deadlines are enforced by the caller.
pub trait PeerTransport: Send + Sync {
    fn exchange<'a>(&'a self, peer: &'a PeerInfo, request: SyncRequest) -> BoxFuture<'a, Result<SyncResponse>>;
}

/// Source of peer candidates.
pub trait Discovery: Send + Sync {
    fn discover(&self) -> BoxFuture<'_, Result<Vec<PeerInfo>>>;
}

/// Server side of the protocol.
pub trait RequestHandler: Send + Sync {
    fn serve(&self, request: SyncRequest) -> BoxFuture<'_, Result<SyncResponse>>;
}

struct Endpoint {
    handler: Weak<dyn RequestHandler>,
    reachable: bool,
    latency: Duration,
}

/// In-process network connecting any number of nodes.
///
/// Requests and responses are round-tripped through their bincode
/// encoding, as they would be on a real wire. Nodes can be partitioned
/// off and given extra latency.
#[derive(Default)]
pub struct MemoryNetwork {
    endpoints: Mutex<BTreeMap<NodeId, Endpoint>>,
    base_latency: Mutex<Duration>,
}

impl std::fmt::Debug for MemoryNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryNetwork")
            .field("nodes", &self.lock().keys().cloned().collect::<Vec<_>>())
            .finish()
    }
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn address_of(node: &NodeId) -> String {
        format!("mem://{node}")
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<NodeId, Endpoint>> {
        self.endpoints.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Attach a node. The network only holds a weak reference.
    pub fn register(&self, node: NodeId, handler: Weak<dyn RequestHandler>) {
        self.lock().insert(
            node,
            Endpoint {
                handler,
                reachable: true,
                latency: Duration::ZERO,
            },
        );
    }

    pub fn unregister(&self, node: &NodeId) {
        self.lock().remove(node);
    }

    /// Partition a node off (or heal it). Traffic in both directions fails
    /// while it is unreachable.
    pub fn set_reachable(&self, node: &NodeId, reachable: bool) {
        if let Some(endpoint) = self.lock().get_mut(node) {
            endpoint.reachable = reachable;
        }
    }

    /// Extra delay for requests served by `node`.
    pub fn set_node_latency(&self, node: &NodeId, latency: Duration) {
        if let Some(endpoint) = self.lock().get_mut(node) {
            endpoint.latency = latency;
        }
    }

    /// Delay applied to every request.
    pub fn set_latency(&self, latency: Duration) {
        *self.base_latency.lock().unwrap_or_else(|p| p.into_inner()) = latency;
    }

    pub fn nodes(&self) -> Vec<NodeId> {
        self.lock().keys().cloned().collect()
    }

    /// A transport and discovery handle for `local`.
    pub fn transport(self: &Arc<Self>, local: NodeId) -> MemoryTransport {
        MemoryTransport {
            network: Arc::clone(self),
            local,
        }
    }

    async fn deliver(&self, from: &NodeId, to: &NodeId, request: SyncRequest) -> Result<SyncResponse> {
        let unreachable = |reason: &str| Error::PeerUnreachable {
            peer: to.clone(),
            reason: reason.to_string(),
        };

        let (handler, latency) = {
            let endpoints = self.lock();
            let sender_up = endpoints.get(from).map_or(true, |e| e.reachable);
            let target = endpoints.get(to).ok_or_else(|| unreachable("no such node"))?;
            if !sender_up || !target.reachable {
                return Err(unreachable("network partition"));
            }
            let base = *self.base_latency.lock().unwrap_or_else(|p| p.into_inner());
            (target.handler.clone(), base + target.latency)
        };

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let handler = handler.upgrade().ok_or_else(|| unreachable("node stopped"))?;

        let wire = request.to_bytes()?;
        trace!(%from, %to, bytes = wire.len(), "memory network request");
        let response = handler.serve(SyncRequest::from_bytes(&wire)?).await?;
        let wire = response.to_bytes()?;
        SyncResponse::from_bytes(&wire)
    }
}

/// One node's view of a [`MemoryNetwork`].
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    network: Arc<MemoryNetwork>,
    local: NodeId,
}

impl MemoryTransport {
    pub fn network(&self) -> &Arc<MemoryNetwork> {
        &self.network
    }
}

impl PeerTransport for MemoryTransport {
    fn exchange<'a>(&'a self, peer: &'a PeerInfo, request: SyncRequest) -> BoxFuture<'a, Result<SyncResponse>> {
        Box::pin(self.network.deliver(&self.local, &peer.node_id, request))
    }
}

impl Discovery for MemoryTransport {
    fn discover(&self) -> BoxFuture<'_, Result<Vec<PeerInfo>>> {
        Box::pin(async move {
            Ok(self
                .network
                .nodes()
                .into_iter()
                .filter(|node| *node != self.local)
                .map(|node| {
                    let address = MemoryNetwork::address_of(&node);
                    PeerInfo::new(node, address)
                })
                .collect())
        })
    }
}

/// Fixed peer list, for deployments without dynamic discovery.
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    peers: Vec<PeerInfo>,
}

impl StaticDiscovery {
    pub fn new(peers: Vec<PeerInfo>) -> Self {
        Self { peers }
    }
}

impl Discovery for StaticDiscovery {
    fn discover(&self) -> BoxFuture<'_, Result<Vec<PeerInfo>>> {
        let peers = self.peers.clone();
        Box::pin(async move { Ok(peers) })
    }
}
