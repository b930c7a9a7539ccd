//! Leader heartbeats, both directions
use std::sync::atomic::Ordering;
use std::time::Duration;

use clusterd_api::TermId;
use tracing::{debug, info, trace};

use super::{ConsensusEngine, HandlerError, HandlerResult};
use crate::peers::PeerId;
use crate::raft::{Action, Role};
use crate::transport::{PingReply, Reply, TransportError};

impl ConsensusEngine {
    /// Ping every active peer as the leader
    ///
    /// Returns the time until the next pass.
    pub(super) fn ping_peers(&self) -> Duration {
        let now = self.clock.now();
        let Some((term, peers)) = self.state.write_locked(|s| {
            if s.raft.tick(now, &self.config).action != Action::Ping {
                return None;
            }
            s.raft.record_ping_sent(now);
            Some((s.raft.term, s.peers.active_peers()))
        }) else {
            return Duration::ZERO;
        };

        trace!(%term, peers = peers.len(), "Sending pings");
        let (handles, failures) =
            self.send_all(&peers, |peer| self.transport.send_ping(peer, term, &self.id));
        self.record_failures(failures);

        for handle in handles {
            let peer = handle.peer.clone();
            match self.transport.collect(handle, self.config.rpc_timeout) {
                Ok(Reply::Ping(reply)) => self.handle_ping_reply(&peer, term, reply),
                Ok(reply) => self.record_failures(vec![(
                    peer,
                    TransportError::Protocol(format!("unexpected reply to ping: {reply:?}")),
                )]),
                Err(TransportError::Unwilling) => {
                    debug!(%peer, "Peer does not take part in consensus");
                }
                Err(e) => self.record_failures(vec![(peer, e)]),
            }
        }

        let now = self.clock.now();
        self.state
            .read_locked(|s| s.raft.wait_after_ping(now, &self.config))
    }

    fn handle_ping_reply(&self, peer: &PeerId, term: TermId, reply: PingReply) {
        let now = self.clock.now();
        self.state.write_locked(|s| {
            if let Some(node) = s.peers.get_mut(peer) {
                node.last_log_index = reply.highest_committed_index;
            }

            if s.raft.term < reply.term {
                if self.persist(reply.term, None).is_err() {
                    // still leader of a stale term; the next ping round retries
                    return;
                }
                info!(
                    %peer,
                    old_term = %s.raft.term,
                    new_term = %reply.term,
                    "Peer has a newer term, stepping down"
                );
                s.raft.step_down(reply.term, now);
            } else if s.raft.role == Role::Leader && s.raft.term == term {
                if let Some(node) = s.peers.get_mut(peer) {
                    node.role = Role::Follower;
                }
            }
        });
    }

    /// Handle a Ping from `leader`
    ///
    /// A ping with a term not lower than ours makes us its follower (and
    /// adopts the term). A stale one is answered with our term, so the
    /// sender learns it has to step down.
    pub fn receive_ping(&self, term: TermId, leader: PeerId) -> HandlerResult<PingReply> {
        if !self.config.enabled {
            return Err(HandlerError::Unwilling);
        }

        let now = self.clock.now();
        let reply = self.state.write_locked(|s| {
            if !s.raft.initialized {
                return Err(HandlerError::Unwilling);
            }

            if s.raft.term <= term {
                if s.raft.term < term {
                    self.persist(term, None)?;
                }
                if s.raft.role != Role::Follower || s.raft.leader.as_ref() != Some(&leader) {
                    info!(%leader, %term, "Following leader");
                }
                s.raft.follow(term, leader.clone(), now);
                if let Some(node) = s.peers.get_mut(&leader) {
                    node.role = Role::Leader;
                }
            } else {
                debug!(%leader, %term, own_term = %s.raft.term, "Ping from a stale leader");
            }

            Ok(PingReply {
                term: s.raft.term,
                status: 0,
                highest_committed_index: self.committed_index.load(Ordering::SeqCst),
            })
        })?;

        let count = self.pings_received.fetch_add(1, Ordering::Relaxed) + 1;
        if count % Self::PING_LOG_EVERY == 0 {
            info!(%leader, %term, count, "Pings received");
        } else {
            debug!(%leader, %term, "Ping received");
        }

        Ok(reply)
    }
}
