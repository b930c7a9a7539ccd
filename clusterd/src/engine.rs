//! Cluster role coordination
//!
//! [`ConsensusEngine`] owns the raft state and the membership cache
//! (under a single lock) and implements both sides of the two peer
//! requests:
//!
//! * the state loop calls [`ConsensusEngine::step`] repeatedly; it pings
//!   followers when leader and runs elections when the leader is gone,
//! * incoming requests are handed to [`ConsensusEngine::receive_ping`]
//!   and [`ConsensusEngine::receive_vote`].
//!
//! The lock is never held across network I/O. It *is* held across
//! term persistence, so nothing observes a term that isn't durable.
mod ping;
mod vote;

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use clusterd_api::{PingResponse, Request, Response, TermId, VoteResponse};
use rand::rngs::StdRng;
use rand::SeedableRng;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use typed_builder::TypedBuilder;

use crate::clock::{Clock, MonotonicClock};
use crate::config::RaftConfig;
use crate::peers::{ConnectionState, Membership, NodeState, PeerDirectory, PeerId};
use crate::raft::{Action, RaftState, Role};
use crate::task::{PanicGuard, Signal};
use crate::term_store::{PersistedTerm, TermStore};
use crate::transport::{RequestHandle, Transport, TransportError, TransportResult};

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerError {
    /// Consensus disabled on this node, or not initialized yet
    #[error("unwilling to perform")]
    Unwilling,
    #[error("could not persist term")]
    Persist,
}

pub type HandlerResult<T> = std::result::Result<T, HandlerError>;

/// Everything guarded by the cluster lock
#[derive(Debug)]
pub struct ClusterState {
    pub raft: RaftState,
    pub peers: PeerDirectory,
}

/// The one lock over raft state and membership
pub struct ClusterLock {
    inner: RwLock<ClusterState>,
}

impl ClusterLock {
    pub fn new(state: ClusterState) -> Self {
        Self {
            inner: RwLock::new(state),
        }
    }

    pub fn read_locked<R>(&self, f: impl FnOnce(&ClusterState) -> R) -> R {
        f(&self.inner.read().expect("Locking failed"))
    }

    pub fn write_locked<R>(&self, f: impl FnOnce(&mut ClusterState) -> R) -> R {
        f(&mut self.inner.write().expect("Locking failed"))
    }
}

/// Snapshot of the engine state, for diagnostics
#[derive(Debug, Clone)]
pub struct ClusterStatus {
    pub id: PeerId,
    pub role: Role,
    pub term: TermId,
    pub leader: Option<PeerId>,
    pub voted_for: Option<PeerId>,
    pub cluster_size: usize,
    pub initialized: bool,
    pub committed_index: i64,
    pub peers: Vec<NodeState>,
}

fn default_clock() -> Arc<dyn Clock> {
    Arc::new(MonotonicClock::new())
}

/// Everything a [`ConsensusEngine`] is built from
#[derive(TypedBuilder)]
pub struct EngineParams {
    /// Our own FQDN, as it appears in the membership
    pub id: PeerId,

    #[builder(default)]
    pub config: RaftConfig,

    pub term_store: Arc<dyn TermStore>,

    pub membership: Arc<dyn Membership>,

    pub transport: Arc<dyn Transport>,

    #[builder(default = default_clock())]
    pub clock: Arc<dyn Clock>,

    /// Fixed seed for the split-vote backoff
    #[builder(default)]
    pub rng_seed: Option<u64>,

    /// Shared with the node, so signal handlers can stop everything
    #[builder(default)]
    pub is_shutting_down: Arc<AtomicBool>,
}

pub struct ConsensusEngine {
    id: PeerId,
    config: RaftConfig,
    state: ClusterLock,

    term_store: Arc<dyn TermStore>,
    membership: Arc<dyn Membership>,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    rng: Mutex<StdRng>,

    is_shutting_down: Arc<AtomicBool>,
    reload_requested: AtomicBool,
    /// Wakes the state loop before its timeout
    wake: Signal,
    /// Wakes the connection keeper before its timeout
    connection_lost: Signal,

    committed_index: AtomicI64,
    pings_received: AtomicU64,
}

impl ConsensusEngine {
    const LOAD_RETRY_DELAY: Duration = Duration::from_secs(1);
    /// Only every n-th received ping is logged at info level
    const PING_LOG_EVERY: u64 = 20;

    pub fn new(params: EngineParams) -> Arc<Self> {
        let rng = match params.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Arc::new(Self {
            state: ClusterLock::new(ClusterState {
                raft: RaftState::default(),
                peers: PeerDirectory::new(params.id.clone()),
            }),
            id: params.id,
            config: params.config.normalized(),
            term_store: params.term_store,
            membership: params.membership,
            transport: params.transport,
            clock: params.clock,
            rng: Mutex::new(rng),
            is_shutting_down: params.is_shutting_down,
            // membership has to be loaded on the first pass
            reload_requested: AtomicBool::new(true),
            wake: Signal::default(),
            connection_lost: Signal::default(),
            committed_index: AtomicI64::new(0),
            pings_received: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn config(&self) -> &RaftConfig {
        &self.config
    }

    pub fn panic_guard(&self, name: &'static str) -> PanicGuard {
        PanicGuard::new(name, self.is_shutting_down.clone())
    }

    pub fn is_shutting_down(&self) -> bool {
        self.is_shutting_down.load(Ordering::SeqCst)
    }

    pub fn is_initialized(&self) -> bool {
        self.state.read_locked(|s| s.raft.initialized)
    }

    /// Stop all loops driving this engine
    pub fn shutdown(&self) {
        self.is_shutting_down.store(true, Ordering::SeqCst);
        self.wake_all();
    }

    /// Wake the state loop and the connection keeper
    pub fn wake_all(&self) {
        self.wake.notify();
        self.connection_lost.notify();
    }

    /// Re-read the membership on the next pass of the state loop
    pub fn request_reload(&self) {
        self.reload_requested.store(true, Ordering::SeqCst);
        self.wake.notify();
    }

    /// Highest committed log index, reported back in ping replies
    pub fn set_committed_index(&self, index: i64) {
        self.committed_index.store(index, Ordering::SeqCst);
    }

    /// Sleep until `timeout` passes or someone calls [`Self::wake_all`]
    pub fn wait_for_wake(&self, timeout: Duration) -> bool {
        self.wake.wait_timeout(timeout)
    }

    /// Sleep until `timeout` passes or a peer connection is reported lost
    pub fn wait_for_connection_lost(&self, timeout: Duration) -> bool {
        self.connection_lost.wait_timeout(timeout)
    }

    pub fn status(&self) -> ClusterStatus {
        self.state.read_locked(|s| ClusterStatus {
            id: self.id.clone(),
            role: s.raft.role,
            term: s.raft.term,
            leader: s.raft.leader.clone(),
            voted_for: s.raft.voted_for.clone(),
            cluster_size: s.raft.cluster_size,
            initialized: s.raft.initialized,
            committed_index: self.committed_index.load(Ordering::SeqCst),
            peers: s.peers.nodes().to_vec(),
        })
    }

    /// Load the membership and (on first call) the persisted term
    pub fn load(&self) -> anyhow::Result<()> {
        let members = self.membership.load()?;
        let persisted = self
            .term_store
            .load()
            .map_err(|e| anyhow::format_err!("loading persisted term: {e:?}"))?;
        let now = self.clock.now();

        self.state.write_locked(|s| {
            s.peers.reload(members);
            s.raft.cluster_size = s.peers.cluster_size();

            if !s.raft.initialized {
                s.raft.term = persisted.term;
                s.raft.voted_for = persisted.voted_for;
                // give an existing leader a full timeout to find us
                s.raft.last_ping_recv = now;
                s.raft.initialized = true;
                info!(
                    term = %s.raft.term,
                    cluster_size = s.raft.cluster_size,
                    "Consensus state initialized"
                );
            }
        });

        // new members start out disconnected
        self.connection_lost.notify();
        Ok(())
    }

    /// One pass of the state loop
    ///
    /// Returns how long to sleep before the next pass.
    pub fn step(&self) -> Duration {
        if self.reload_requested.swap(false, Ordering::SeqCst) {
            if let Err(e) = self.load() {
                warn!("Failed to load cluster membership: {e:#}");
                self.reload_requested.store(true, Ordering::SeqCst);
                return Self::LOAD_RETRY_DELAY;
            }
        }

        if !self.config.enabled {
            return self.config.election_timeout;
        }

        let now = self.clock.now();
        let tick = self.state.read_locked(|s| s.raft.tick(now, &self.config));

        match tick.action {
            Action::None => tick.wait,
            Action::Ping => self.ping_peers(),
            Action::RequestVote => self.run_election(),
        }
    }

    /// Try to reconnect every active peer in `Connecting` state
    ///
    /// Returns the number of connections established.
    pub fn reconnect_peers(&self) -> usize {
        let (generation, targets) = self.state.read_locked(|s| {
            (
                s.peers.generation(),
                s.peers
                    .active_peers()
                    .into_iter()
                    .filter(|n| n.connection == ConnectionState::Connecting)
                    .map(|n| n.descriptor())
                    .collect::<Vec<_>>(),
            )
        });

        let mut established = 0;
        for peer in targets {
            if self.is_shutting_down() {
                break;
            }

            match self.transport.connect(&peer, self.config.connect_timeout) {
                Ok(()) => {
                    let applied = self.state.write_locked(|s| {
                        // membership changed while we were connecting
                        if s.peers.generation() != generation {
                            return false;
                        }
                        s.peers.mark_connected(&peer.id);
                        true
                    });
                    if applied {
                        info!(peer = %peer.id, addr = %peer.addr, "Peer connected");
                        established += 1;
                    }
                }
                Err(e) => {
                    debug!(peer = %peer.id, addr = %peer.addr, %e, "Could not connect to peer");
                }
            }
        }
        established
    }

    /// Serve a request received from a peer over the wire
    pub fn handle_request(&self, request: Request) -> HandlerResult<Response> {
        Ok(match request {
            Request::Ping(ping) => {
                Response::Ping(match self.receive_ping(ping.term, ping.leader.into()) {
                    Ok(reply) => PingResponse::Accepted {
                        term: reply.term,
                        status: reply.status,
                        highest_committed_index: reply.highest_committed_index,
                    },
                    Err(HandlerError::Unwilling) => PingResponse::Unwilling,
                    Err(e) => return Err(e),
                })
            }
            Request::Vote(vote) => {
                Response::Vote(match self.receive_vote(vote.term, vote.candidate.into()) {
                    Ok(reply) => VoteResponse::Decided {
                        term: reply.term,
                        decision: reply.decision,
                    },
                    Err(HandlerError::Unwilling) => VoteResponse::Unwilling,
                    Err(e) => return Err(e),
                })
            }
        })
    }

    /// Durably record `term` (and the vote cast in it)
    ///
    /// Called with the cluster lock held.
    fn persist(&self, term: TermId, voted_for: Option<PeerId>) -> HandlerResult<()> {
        self.term_store
            .persist(&PersistedTerm::new(term, voted_for))
            .map_err(|e| {
                error!(%term, "Failed to persist term: {e:?}");
                HandlerError::Persist
            })
    }

    /// Dispatch a request to every connected peer in `peers`
    ///
    /// Peers not connected are skipped; the connection keeper is woken
    /// up to deal with them.
    fn send_all(
        &self,
        peers: &[NodeState],
        send: impl Fn(&PeerId) -> TransportResult<RequestHandle>,
    ) -> (Vec<RequestHandle>, Vec<(PeerId, TransportError)>) {
        let mut handles = vec![];
        let mut failures = vec![];

        for peer in peers {
            if peer.connection != ConnectionState::Connected {
                self.connection_lost.notify();
                continue;
            }
            match send(&peer.fqdn) {
                Ok(handle) => handles.push(handle),
                Err(e) => failures.push((peer.fqdn.clone(), e)),
            }
        }

        (handles, failures)
    }

    /// Put peers that failed back to `Connecting`
    fn record_failures(&self, failures: Vec<(PeerId, TransportError)>) {
        if failures.is_empty() {
            return;
        }
        self.state.write_locked(|s| {
            for (peer, e) in failures {
                if s.peers.mark_connecting(&peer, &e) {
                    warn!(%peer, %e, "Lost connection to peer");
                }
            }
        });
        self.connection_lost.notify();
    }
}
