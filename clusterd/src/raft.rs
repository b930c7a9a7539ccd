//! Consensus state and the timing rules driving it
//!
//! Nothing in here does any I/O. [`RaftState::tick`] decides what the
//! state loop should do next; the engine executes it and feeds the
//! results back through the mutation methods below.
use std::fmt;
use std::time::Duration;

use clusterd_api::TermId;
use convi::ExpectFrom;
use rand::Rng;

use crate::clock::Millis;
use crate::config::RaftConfig;
use crate::peers::PeerId;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Role {
    /// Follows the leader
    #[default]
    Follower,
    /// Asking peers for votes
    Candidate,
    /// Write master for the current term; pings followers
    Leader,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Follower => write!(f, "follower"),
            Role::Candidate => write!(f, "candidate"),
            Role::Leader => write!(f, "leader"),
        }
    }
}

/// What the state loop should do on this pass
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Action {
    None,
    Ping,
    RequestVote,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Tick {
    pub action: Action,
    /// How long to sleep before evaluating again
    pub wait: Duration,
}

impl Tick {
    fn none(wait: Duration) -> Self {
        Self {
            action: Action::None,
            wait,
        }
    }

    fn act(action: Action) -> Self {
        Self {
            action,
            wait: Duration::ZERO,
        }
    }
}

/// Vote counts of the election started in `term`
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ElectionTally {
    pub term: TermId,
    pub granted: usize,
    pub denied: usize,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ElectionResult {
    /// Got the majority; now the leader
    Won,
    /// No majority; retry after a random backoff
    Split,
    /// Became a follower while the election was running
    Abandoned,
}

#[derive(Clone, Debug, Default)]
pub struct RaftState {
    pub term: TermId,
    pub role: Role,
    pub leader: Option<PeerId>,
    /// Only meaningful while `term` stays the same
    pub voted_for: Option<PeerId>,
    pub election: ElectionTally,
    pub last_ping_recv: Millis,
    /// `None` forces a ping on the next pass
    pub last_ping_send: Option<Millis>,
    /// Voting members, self included
    pub cluster_size: usize,
    /// Membership and the persisted term were loaded
    pub initialized: bool,
}

impl RaftState {
    pub fn majority(&self) -> usize {
        self.cluster_size / 2 + 1
    }

    /// Minimum number of peers that must be reachable to even try an election
    pub fn election_quorum(&self) -> usize {
        self.cluster_size / 2
    }

    /// Decide the next action and the time to wait before the following pass
    pub fn tick(&self, now: Millis, config: &RaftConfig) -> Tick {
        if !self.initialized || self.cluster_size <= 1 {
            // Single node (or not loaded yet) never elects
            return Tick::none(config.election_timeout);
        }

        match self.role {
            Role::Follower => {
                let since_ping = now.since(self.last_ping_recv);
                if config.election_timeout <= since_ping {
                    Tick::act(Action::RequestVote)
                } else {
                    Tick::none(config.election_timeout - since_ping)
                }
            }
            Role::Leader => match self.last_ping_send {
                None => Tick::act(Action::Ping),
                Some(last) => {
                    let since_ping = now.since(last);
                    if config.ping_interval <= since_ping {
                        Tick::act(Action::Ping)
                    } else {
                        Tick::none(config.ping_interval - since_ping)
                    }
                }
            },
            // Previous election was split and we already waited
            Role::Candidate => Tick::act(Action::RequestVote),
        }
    }

    /// Time to wait after a ping round, given the role we ended up in
    pub fn wait_after_ping(&self, now: Millis, config: &RaftConfig) -> Duration {
        match self.role {
            Role::Follower => config
                .election_timeout
                .saturating_sub(now.since(self.last_ping_recv)),
            Role::Leader => match self.last_ping_send {
                Some(last) => config.ping_interval.saturating_sub(now.since(last)),
                None => Duration::ZERO,
            },
            Role::Candidate => Duration::ZERO,
        }
    }

    pub fn record_ping_sent(&mut self, now: Millis) {
        self.last_ping_send = Some(now);
    }

    /// Enter a new election in `term` (which must already be persisted)
    pub fn start_election(&mut self, term: TermId, self_id: PeerId) {
        debug_assert!(self.term < term);
        self.term = term;
        self.role = Role::Candidate;
        self.leader = None;
        self.voted_for = Some(self_id);
        // we vote for ourselves
        self.election = ElectionTally {
            term,
            granted: 1,
            denied: 0,
        };
    }

    /// Count a peer's vote
    ///
    /// Returns `true` once the election can be concluded: either majority
    /// granted, or every member has answered.
    pub fn record_vote(&mut self, granted: bool) -> bool {
        if granted {
            self.election.granted += 1;
        } else {
            self.election.denied += 1;
        }
        self.election_decided()
    }

    pub fn election_decided(&self) -> bool {
        self.majority() <= self.election.granted
            || self.cluster_size <= self.election.granted + self.election.denied
    }

    /// Evaluate the election once the vote round is over
    pub fn conclude_election(&mut self) -> ElectionResult {
        if self.role != Role::Candidate {
            return ElectionResult::Abandoned;
        }
        if self.term != self.election.term || self.election.granted < self.majority() {
            return ElectionResult::Split;
        }

        self.role = Role::Leader;
        self.leader = self.voted_for.clone();
        self.last_ping_send = None;
        ElectionResult::Won
    }

    /// Accept a legitimate leader's ping at `term` (not lower than ours)
    pub fn follow(&mut self, term: TermId, leader: PeerId, now: Millis) {
        debug_assert!(self.term <= term);
        if self.term < term {
            self.voted_for = None;
        }
        self.term = term;
        self.role = Role::Follower;
        self.leader = Some(leader);
        self.last_ping_recv = now;
    }

    /// A peer knows a higher term; become a follower of it
    ///
    /// The new term must already be persisted.
    pub fn step_down(&mut self, term: TermId, now: Millis) {
        debug_assert!(self.term < term);
        self.term = term;
        self.role = Role::Follower;
        self.leader = None;
        self.voted_for = None;
        self.last_ping_recv = now;
    }
}

/// Random pause after a split vote, uniform in `[0, ping_interval)`
pub fn split_vote_backoff(config: &RaftConfig, rng: &mut impl Rng) -> Duration {
    let max = u64::expect_from(config.ping_interval.as_millis()).max(1);
    Duration::from_millis(rng.gen_range(0..max))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    fn config() -> RaftConfig {
        RaftConfig::builder()
            .election_timeout(ms(150))
            .ping_interval(ms(50))
            .build()
    }

    fn state(cluster_size: usize) -> RaftState {
        RaftState {
            cluster_size,
            initialized: true,
            ..RaftState::default()
        }
    }

    #[test]
    fn single_node_never_elects() {
        let state = state(1);
        assert_eq!(
            state.tick(Millis(10_000), &config()),
            Tick::none(ms(150))
        );
    }

    #[test]
    fn uninitialized_never_elects() {
        let state = RaftState {
            cluster_size: 3,
            ..RaftState::default()
        };
        assert_eq!(
            state.tick(Millis(10_000), &config()),
            Tick::none(ms(150))
        );
    }

    #[test]
    fn follower_waits_for_remaining_election_timeout() {
        let mut state = state(3);
        state.last_ping_recv = Millis(100);
        assert_eq!(state.tick(Millis(160), &config()), Tick::none(ms(90)));
        assert_eq!(
            state.tick(Millis(250), &config()),
            Tick::act(Action::RequestVote)
        );
        assert_eq!(
            state.tick(Millis(400), &config()),
            Tick::act(Action::RequestVote)
        );
    }

    #[test]
    fn leader_pings_every_interval() {
        let mut state = state(3);
        state.role = Role::Leader;
        assert_eq!(state.tick(Millis(5), &config()), Tick::act(Action::Ping));

        state.record_ping_sent(Millis(5));
        assert_eq!(state.tick(Millis(20), &config()), Tick::none(ms(35)));
        assert_eq!(state.tick(Millis(55), &config()), Tick::act(Action::Ping));
        assert_eq!(state.wait_after_ping(Millis(25), &config()), ms(30));
    }

    #[test]
    fn candidate_acts_immediately() {
        let mut state = state(3);
        state.role = Role::Candidate;
        assert_eq!(
            state.tick(Millis(0), &config()),
            Tick::act(Action::RequestVote)
        );
        assert_eq!(state.wait_after_ping(Millis(0), &config()), ms(0));
    }

    #[test]
    fn election_won_with_majority() {
        let mut state = state(3);
        state.start_election(TermId(1), PeerId::from("a"));
        assert_eq!(state.election.granted, 1);
        assert!(state.record_vote(true));
        assert_eq!(state.conclude_election(), ElectionResult::Won);
        assert_eq!(state.role, Role::Leader);
        assert_eq!(state.leader, Some(PeerId::from("a")));
        assert_eq!(state.tick(Millis(1), &config()), Tick::act(Action::Ping));
    }

    #[test]
    fn two_two_split_is_decided_but_not_won() {
        let mut state = state(4);
        state.start_election(TermId(7), PeerId::from("a"));
        assert!(!state.record_vote(true));
        assert!(!state.record_vote(false));
        assert!(state.record_vote(false));
        assert_eq!(state.conclude_election(), ElectionResult::Split);
        assert_eq!(state.role, Role::Candidate);
    }

    #[test]
    fn stepped_down_candidate_abandons_election() {
        let mut state = state(3);
        state.start_election(TermId(1), PeerId::from("a"));
        state.step_down(TermId(2), Millis(10));
        assert_eq!(state.conclude_election(), ElectionResult::Abandoned);
        assert_eq!(state.voted_for, None);
        assert_eq!(state.role, Role::Follower);
    }

    #[test]
    fn following_same_term_keeps_vote() {
        let mut state = state(3);
        state.term = TermId(4);
        state.voted_for = Some(PeerId::from("b"));
        state.follow(TermId(4), PeerId::from("b"), Millis(3));
        assert_eq!(state.voted_for, Some(PeerId::from("b")));
        state.follow(TermId(5), PeerId::from("c"), Millis(4));
        assert_eq!(state.voted_for, None);
        assert_eq!(state.leader, Some(PeerId::from("c")));
        assert_eq!(state.last_ping_recv, Millis(4));
    }

    #[test]
    fn backoff_is_bounded_and_deterministic() {
        let config = config();
        let a: Vec<_> = {
            let mut rng = StdRng::seed_from_u64(3);
            (0..32)
                .map(|_| split_vote_backoff(&config, &mut rng))
                .collect()
        };
        let b: Vec<_> = {
            let mut rng = StdRng::seed_from_u64(3);
            (0..32)
                .map(|_| split_vote_backoff(&config, &mut rng))
                .collect()
        };
        assert_eq!(a, b);
        assert!(a.iter().all(|d| *d < config.ping_interval));
    }
}
