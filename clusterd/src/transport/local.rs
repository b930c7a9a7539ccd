use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use clusterd_api::TermId;

use super::{Reply, RequestHandle, RequestKind, Transport, TransportError, TransportResult};
use crate::engine::{ConsensusEngine, HandlerError};
use crate::peers::{PeerDescriptor, PeerId};

/// In-process "network" connecting engines of a simulated cluster
///
/// Requests are handled synchronously by the target engine at send time.
/// Links can be cut in either direction to simulate partitions.
#[derive(Default)]
pub struct LocalNetwork {
    engines: RwLock<HashMap<PeerId, Weak<ConsensusEngine>>>,
    /// `(from, to)` pairs that drop everything
    cut: RwLock<HashSet<(PeerId, PeerId)>>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, engine: &Arc<ConsensusEngine>) {
        self.engines
            .write()
            .expect("Locking failed")
            .insert(engine.id().clone(), Arc::downgrade(engine));
    }

    pub fn transport(self: &Arc<Self>, from: PeerId) -> LocalTransport {
        LocalTransport {
            from,
            network: self.clone(),
            pending: Mutex::new(HashMap::new()),
            next_request_id: AtomicU64::new(0),
        }
    }

    /// Drop everything from `from` to `to` (one direction only)
    pub fn cut_link(&self, from: &PeerId, to: &PeerId) {
        self.cut
            .write()
            .expect("Locking failed")
            .insert((from.clone(), to.clone()));
    }

    /// Cut every link from and to `id`
    pub fn isolate(&self, id: &PeerId) {
        let peers: Vec<PeerId> = self
            .engines
            .read()
            .expect("Locking failed")
            .keys()
            .filter(|peer| *peer != id)
            .cloned()
            .collect();
        for peer in peers {
            self.cut_link(id, &peer);
            self.cut_link(&peer, id);
        }
    }

    /// Restore all links
    pub fn heal(&self) {
        self.cut.write().expect("Locking failed").clear();
    }

    pub fn is_reachable(&self, from: &PeerId, to: &PeerId) -> bool {
        !self
            .cut
            .read()
            .expect("Locking failed")
            .contains(&(from.clone(), to.clone()))
    }

    fn engine(&self, id: &PeerId) -> Option<Arc<ConsensusEngine>> {
        self.engines
            .read()
            .expect("Locking failed")
            .get(id)
            .and_then(Weak::upgrade)
    }
}

/// One engine's view of a [`LocalNetwork`]
pub struct LocalTransport {
    from: PeerId,
    network: Arc<LocalNetwork>,
    pending: Mutex<HashMap<u64, (PeerId, TransportResult<Reply>)>>,
    next_request_id: AtomicU64,
}

impl LocalTransport {
    fn deliver(
        &self,
        peer: &PeerId,
        kind: RequestKind,
        f: impl FnOnce(&ConsensusEngine) -> Result<Reply, HandlerError>,
    ) -> TransportResult<RequestHandle> {
        if !self.network.is_reachable(&self.from, peer) {
            return Err(TransportError::Down("link cut".into()));
        }
        let engine = self
            .network
            .engine(peer)
            .ok_or_else(|| TransportError::Down(format!("no such peer: {peer}")))?;

        let res = f(&engine).map_err(|e| match e {
            HandlerError::Unwilling => TransportError::Unwilling,
            e => TransportError::Down(e.to_string()),
        });

        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        self.pending
            .lock()
            .expect("Locking failed")
            .insert(id, (peer.clone(), res));

        Ok(RequestHandle {
            peer: peer.clone(),
            id,
            kind,
        })
    }
}

impl Transport for LocalTransport {
    fn connect(&self, peer: &PeerDescriptor, _timeout: Duration) -> TransportResult<()> {
        if !self.network.is_reachable(&self.from, &peer.id)
            || !self.network.is_reachable(&peer.id, &self.from)
        {
            return Err(TransportError::Down("link cut".into()));
        }
        self.network
            .engine(&peer.id)
            .map(|_| ())
            .ok_or_else(|| TransportError::Down(format!("no such peer: {}", peer.id)))
    }

    fn send_ping(
        &self,
        peer: &PeerId,
        term: TermId,
        leader: &PeerId,
    ) -> TransportResult<RequestHandle> {
        self.deliver(peer, RequestKind::Ping, |engine| {
            engine.receive_ping(term, leader.clone()).map(Reply::Ping)
        })
    }

    fn send_vote(
        &self,
        peer: &PeerId,
        term: TermId,
        candidate: &PeerId,
    ) -> TransportResult<RequestHandle> {
        self.deliver(peer, RequestKind::Vote, |engine| {
            engine.receive_vote(term, candidate.clone()).map(Reply::Vote)
        })
    }

    fn collect(&self, handle: RequestHandle, _timeout: Duration) -> TransportResult<Reply> {
        let (peer, res) = self
            .pending
            .lock()
            .expect("Locking failed")
            .remove(&handle.id)
            .ok_or_else(|| {
                TransportError::Protocol(format!("no outstanding request {}", handle.id))
            })?;

        // the reply got lost on the way back
        if !self.network.is_reachable(&peer, &self.from) {
            return Err(TransportError::Timeout);
        }
        res
    }
}
