//! Elections, both directions
use std::time::Duration;

use clusterd_api::{TermId, VoteDecision};
use tracing::{debug, info, warn};

use super::{ConsensusEngine, HandlerError, HandlerResult};
use crate::peers::{NodeState, PeerId};
use crate::raft::{split_vote_backoff, Action, ElectionResult, Role};
use crate::transport::{Reply, TransportError, VoteReply};

impl ConsensusEngine {
    /// Run one election round
    ///
    /// Returns the time until the next pass: zero after a win, a random
    /// backoff after a split vote, a fixed delay if a quorum of peers
    /// can't be reached.
    pub(super) fn run_election(&self) -> Duration {
        let (term, peers) = match self.start_election() {
            Ok(started) => started,
            Err(wait) => return wait,
        };

        // a higher term might have reached us since the lock was released
        if !self.is_candidate_in(term) {
            return Duration::ZERO;
        }

        let (handles, failures) =
            self.send_all(&peers, |peer| self.transport.send_vote(peer, term, &self.id));
        self.record_failures(failures);

        let quorum = self.state.read_locked(|s| s.raft.election_quorum());
        if handles.len() < quorum {
            warn!(
                %term,
                sent = handles.len(),
                quorum,
                "Could not reach enough peers, delaying election"
            );
            return self.config.election_retry_delay;
        }

        for handle in handles {
            let peer = handle.peer.clone();
            match self.transport.collect(handle, self.config.rpc_timeout) {
                Ok(Reply::Vote(reply)) => {
                    if self.handle_vote_reply(&peer, term, reply) {
                        break;
                    }
                }
                Ok(reply) => self.record_failures(vec![(
                    peer,
                    TransportError::Protocol(format!("unexpected reply to vote: {reply:?}")),
                )]),
                Err(TransportError::Unwilling) => {
                    warn!(%peer, %term, "Peer is unwilling to vote, delaying election");
                    return self.config.election_retry_delay;
                }
                Err(e) => self.record_failures(vec![(peer, e)]),
            }
        }

        self.conclude_election(term)
    }

    /// Bump and persist the term and become a candidate in it
    fn start_election(&self) -> Result<(TermId, Vec<NodeState>), Duration> {
        let now = self.clock.now();
        self.state.write_locked(|s| {
            // role or timing may have changed since the pass was planned
            if s.raft.tick(now, &self.config).action != Action::RequestVote {
                return Err(Duration::ZERO);
            }

            let quorum = s.raft.election_quorum();
            let connected = s.peers.connected_peer_count();
            if connected < quorum {
                warn!(connected, quorum, "Not enough peers connected to hold an election");
                self.connection_lost.notify();
                return Err(self.config.election_retry_delay);
            }

            let term = s.raft.term.next();
            self.persist(term, Some(self.id.clone()))
                .map_err(|_| self.config.election_retry_delay)?;

            info!(
                %term,
                previous_role = %s.raft.role,
                cluster_size = s.raft.cluster_size,
                "Starting election"
            );
            s.raft.start_election(term, self.id.clone());
            Ok((term, s.peers.active_peers()))
        })
    }

    fn is_candidate_in(&self, term: TermId) -> bool {
        self.state
            .read_locked(|s| s.raft.role == Role::Candidate && s.raft.term == term)
    }

    /// Count one vote reply
    ///
    /// Returns `true` when no further replies need to be collected.
    fn handle_vote_reply(&self, peer: &PeerId, term: TermId, reply: VoteReply) -> bool {
        let now = self.clock.now();
        self.state.write_locked(|s| {
            if s.raft.term < reply.term {
                if self.persist(reply.term, None).is_ok() {
                    info!(
                        %peer,
                        old_term = %s.raft.term,
                        new_term = %reply.term,
                        "Peer has a newer term, abandoning election"
                    );
                    s.raft.step_down(reply.term, now);
                }
                return true;
            }

            if s.raft.role != Role::Candidate || s.raft.term != term {
                return true;
            }

            debug!(%peer, %term, decision = ?reply.decision, "Vote reply");
            s.raft.record_vote(reply.decision.is_granted())
        })
    }

    fn conclude_election(&self, term: TermId) -> Duration {
        self.state.write_locked(|s| {
            let tally = s.raft.election;
            match s.raft.conclude_election() {
                ElectionResult::Won => {
                    info!(
                        %term,
                        granted = tally.granted,
                        cluster_size = s.raft.cluster_size,
                        "Won the election, now leader"
                    );
                    Duration::ZERO
                }
                ElectionResult::Split => {
                    let backoff = split_vote_backoff(
                        &self.config,
                        &mut *self.rng.lock().expect("Locking failed"),
                    );
                    info!(
                        %term,
                        granted = tally.granted,
                        denied = tally.denied,
                        backoff_ms = backoff.as_millis(),
                        "Election did not reach a majority, backing off"
                    );
                    backoff
                }
                ElectionResult::Abandoned => Duration::ZERO,
            }
        })
    }

    /// Handle a RequestVote from `candidate`
    ///
    /// At most one vote is granted per term; granting the same candidate
    /// again is a no-op. The vote is durable before the reply leaves.
    pub fn receive_vote(&self, term: TermId, candidate: PeerId) -> HandlerResult<VoteReply> {
        if !self.config.enabled {
            return Err(HandlerError::Unwilling);
        }

        let now = self.clock.now();
        self.state.write_locked(|s| {
            if !s.raft.initialized {
                return Err(HandlerError::Unwilling);
            }

            let decision = if s.raft.term < term {
                self.persist(term, Some(candidate.clone()))?;
                if s.raft.role != Role::Follower {
                    info!(
                        %candidate,
                        %term,
                        role = %s.raft.role,
                        "Newer term in vote request, stepping down"
                    );
                }
                s.raft.step_down(term, now);
                s.raft.voted_for = Some(candidate.clone());
                VoteDecision::Granted
            } else if s.raft.term == term {
                match &s.raft.voted_for {
                    Some(voted_for) if *voted_for == candidate => VoteDecision::Granted,
                    Some(_) => VoteDecision::Denied,
                    None => {
                        self.persist(term, Some(candidate.clone()))?;
                        s.raft.voted_for = Some(candidate.clone());
                        s.raft.role = Role::Follower;
                        s.raft.last_ping_recv = now;
                        VoteDecision::Granted
                    }
                }
            } else {
                VoteDecision::Stale
            };

            info!(%candidate, %term, own_term = %s.raft.term, ?decision, "Vote request");

            Ok(VoteReply {
                term: s.raft.term,
                decision,
            })
        })
    }
}
