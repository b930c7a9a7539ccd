#![allow(unused)]

use clusterd::clock::{Clock, ManualClock, Millis};
use clusterd::config::RaftConfig;
use clusterd::engine::{ClusterStatus, ConsensusEngine, EngineParams};
use clusterd::peers::{PeerDescriptor, PeerId, StaticMembership};
use clusterd::raft::Role;
use clusterd::term_store::MemTermStore;
use clusterd::transport::LocalNetwork;
use clusterd::Parameters;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub fn ms(v: u64) -> Duration {
    Duration::from_millis(v)
}

pub fn peer_id(i: usize) -> PeerId {
    PeerId::new(format!("n{i}.test"))
}

pub fn sim_config() -> RaftConfig {
    RaftConfig::builder()
        .election_timeout(ms(150))
        .ping_interval(ms(50))
        .min_ping_interval(ms(10))
        .election_retry_delay(ms(100))
        .rpc_timeout(ms(20))
        .build()
}

pub struct SimNode {
    pub engine: Arc<ConsensusEngine>,
    pub store: Arc<MemTermStore>,
    pub membership: Arc<StaticMembership>,
    next_step: Millis,
}

/// A cluster of engines on a [`LocalNetwork`], driven by a [`ManualClock`]
///
/// Everything runs on the test thread: the node with the earliest
/// pending step runs next, so runs are fully deterministic.
pub struct SimCluster {
    pub clock: Arc<ManualClock>,
    pub network: Arc<LocalNetwork>,
    pub nodes: Vec<SimNode>,
}

impl SimCluster {
    pub fn new(size: usize) -> Self {
        Self::with_configs((0..size).map(|_| sim_config()).collect())
    }

    pub fn with_configs(configs: Vec<RaftConfig>) -> Self {
        let clock = Arc::new(ManualClock::new(Millis::ZERO));
        let network = LocalNetwork::new();
        let members: Vec<PeerDescriptor> = (0..configs.len())
            .map(|i| PeerDescriptor::new(peer_id(i).as_str(), format!("local:{i}")))
            .collect();

        let nodes = configs
            .into_iter()
            .enumerate()
            .map(|(i, config)| {
                let store = Arc::new(MemTermStore::new());
                let membership = Arc::new(StaticMembership::new(members.clone()));
                let engine = ConsensusEngine::new(
                    EngineParams::builder()
                        .id(peer_id(i))
                        .config(config)
                        .term_store(store.clone())
                        .membership(membership.clone())
                        .transport(Arc::new(network.transport(peer_id(i))))
                        .clock(clock.clone())
                        .rng_seed(Some(u64::try_from(i).unwrap()))
                        .build(),
                );
                network.register(&engine);
                SimNode {
                    engine,
                    store,
                    membership,
                    next_step: Millis::ZERO,
                }
            })
            .collect();

        Self {
            clock,
            network,
            nodes,
        }
    }

    /// Load membership everywhere and connect all peers
    pub fn init(&mut self) {
        for node in &mut self.nodes {
            let wait = node.engine.step();
            node.next_step = self.clock.now() + wait;
        }
        self.reconnect_all();
    }

    pub fn reconnect_all(&self) {
        for node in &self.nodes {
            node.engine.reconnect_peers();
        }
    }

    pub fn now(&self) -> Millis {
        self.clock.now()
    }

    pub fn engine(&self, i: usize) -> &Arc<ConsensusEngine> {
        &self.nodes[i].engine
    }

    pub fn status(&self, i: usize) -> ClusterStatus {
        self.engine(i).status()
    }

    /// Run every node's state loop until `duration` of simulated time passed
    pub fn run_for(&mut self, duration: Duration) {
        let end = self.clock.now() + duration;
        let mut steps = 0;

        loop {
            let (i, at) = self
                .nodes
                .iter()
                .enumerate()
                .map(|(i, node)| (i, node.next_step))
                .min_by_key(|(_, at)| *at)
                .expect("empty cluster");
            if end < at {
                break;
            }

            steps += 1;
            assert!(steps < 100_000, "state loops are spinning");

            if self.clock.now() < at {
                self.clock.set(at);
            }
            // connection keepers are instant in simulation
            self.nodes[i].engine.reconnect_peers();
            let wait = self.nodes[i].engine.step();
            self.nodes[i].next_step = self.clock.now() + wait;
        }

        self.clock.set(end);
    }

    /// Indices of nodes that consider themselves leader
    pub fn leaders(&self) -> Vec<usize> {
        (0..self.nodes.len())
            .filter(|i| self.status(*i).role == Role::Leader)
            .collect()
    }

    pub fn single_leader(&self) -> usize {
        let leaders = self.leaders();
        assert_eq!(leaders.len(), 1, "expected exactly one leader: {leaders:?}");
        leaders[0]
    }

    /// Persisted terms of every node never went down
    pub fn assert_terms_monotonic(&self) {
        for node in &self.nodes {
            let history = node.store.history();
            for pair in history.windows(2) {
                assert!(
                    pair[0].term <= pair[1].term,
                    "{}: term went down: {:?}",
                    node.engine.id(),
                    history
                );
            }
        }
    }
}

/// A real node listening on localhost
pub struct TestClusterd {
    #[allow(unused)]
    data_dir: tempfile::TempDir,
    node: Option<clusterd::Node>,
}

impl TestClusterd {
    pub fn new(id: PeerId, raft: RaftConfig) -> anyhow::Result<Self> {
        let dir = tempfile::tempdir()?;
        let params = Parameters::builder()
            .id(id)
            .listen("127.0.0.1:0".parse()?)
            .data_dir(dir.path().to_owned())
            .raft(raft);
        let node = clusterd::Node::new(params.build())?;
        Ok(Self {
            data_dir: dir,
            node: Some(node),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.node().get_ctrl().local_addr()
    }

    pub fn node(&self) -> &clusterd::Node {
        self.node.as_ref().expect("Node was already dropped")
    }

    pub fn data_dir(&self) -> &Path {
        self.data_dir.path()
    }
}

impl Drop for TestClusterd {
    fn drop(&mut self) {
        self.node().get_ctrl().stop();
        self.node.take(); // drop before tmp directory is cleaned
    }
}
