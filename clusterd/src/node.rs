mod connection_keeper;
mod request_handler;
mod state_loop;

use std::net::{Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use signal_hook::consts::TERM_SIGNALS;
use signal_hook::flag;
use tracing::{debug, info, trace};
use typed_builder::TypedBuilder;

use crate::config::RaftConfig;
use crate::engine::{ClusterStatus, ConsensusEngine, EngineParams};
use crate::node::connection_keeper::ConnectionKeeper;
use crate::node::request_handler::RequestHandler;
use crate::node::state_loop::StateLoop;
use crate::peers::{PeerDescriptor, PeerId, StaticMembership};
use crate::term_store::FileTermStore;
use crate::transport::TcpTransport;

/// Some parameters of runtime operation
#[derive(TypedBuilder, Debug, Clone)]
pub struct Parameters {
    /// FQDN identifying this node in the cluster
    #[builder(setter(into))]
    pub id: PeerId,

    #[builder(default = Parameters::DEFAULT_BIND_ADDR)]
    pub listen: SocketAddr,

    /// Other cluster members
    #[builder(default)]
    pub peers: Vec<PeerDescriptor>,

    /// Where the term is persisted
    pub data_dir: PathBuf,

    #[builder(default)]
    pub raft: RaftConfig,

    #[builder(default)]
    pub rng_seed: Option<u64>,
}

impl Parameters {
    pub const DEFAULT_BIND_ADDR: SocketAddr =
        SocketAddr::new(std::net::IpAddr::V6(Ipv6Addr::LOCALHOST), 0);
}

pub struct NodeCtrl {
    is_node_shutting_down: Arc<AtomicBool>,
    local_addr: SocketAddr,
    engine: Arc<ConsensusEngine>,
    membership: Arc<StaticMembership>,
}

impl NodeCtrl {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn engine(&self) -> &Arc<ConsensusEngine> {
        &self.engine
    }

    pub fn status(&self) -> ClusterStatus {
        self.engine.status()
    }

    /// Replace the cluster membership
    pub fn set_peers(&self, peers: Vec<PeerDescriptor>) {
        self.membership.replace(peers);
        self.engine.request_reload();
    }

    pub fn stop(&self) {
        self.is_node_shutting_down.store(true, Ordering::SeqCst);
        self.engine.wake_all();
    }

    pub fn install_signal_handler(&self) -> anyhow::Result<()> {
        debug!("Installing signal handler");
        for sig in TERM_SIGNALS {
            trace!(sig, "Installing signal handler");
            flag::register(*sig, Arc::clone(&self.is_node_shutting_down))?;
        }
        Ok(())
    }
}

pub struct Node {
    is_node_shutting_down: Arc<AtomicBool>,
    stop_on_drop: bool,
    engine: Arc<ConsensusEngine>,
    membership: Arc<StaticMembership>,
    /// Tokio executor handling peer connections
    request_handler: RequestHandler,
    /// Thread running elections and pings
    #[allow(unused)]
    state_loop: StateLoop,
    #[allow(unused)]
    connection_keeper: ConnectionKeeper,
}

impl Drop for Node {
    fn drop(&mut self) {
        if self.stop_on_drop {
            self.engine.shutdown();
        }
    }
}

impl Node {
    pub fn new(params: Parameters) -> anyhow::Result<Self> {
        info!(
            id = %params.id,
            listen = %params.listen,
            peers = params.peers.len(),
            "data-dir" = %params.data_dir.display(),
            "Starting clusterd"
        );

        let term_store = FileTermStore::open(&params.data_dir)
            .map_err(|e| anyhow::format_err!("opening term store: {e:?}"))?;

        let is_node_shutting_down = Arc::new(AtomicBool::new(false));
        let membership = Arc::new(StaticMembership::new(params.peers));

        let engine = ConsensusEngine::new(
            EngineParams::builder()
                .id(params.id)
                .config(params.raft)
                .term_store(Arc::new(term_store))
                .membership(membership.clone())
                .transport(Arc::new(TcpTransport::new()))
                .rng_seed(params.rng_seed)
                .is_shutting_down(is_node_shutting_down.clone())
                .build(),
        );

        let request_handler = RequestHandler::new(engine.clone(), params.listen)?;
        let state_loop = StateLoop::new(engine.clone());
        let connection_keeper = ConnectionKeeper::new(engine.clone());

        Ok(Node {
            is_node_shutting_down,
            stop_on_drop: true,
            engine,
            membership,
            request_handler,
            state_loop,
            connection_keeper,
        })
    }

    pub fn get_ctrl(&self) -> NodeCtrl {
        NodeCtrl {
            is_node_shutting_down: Arc::clone(&self.is_node_shutting_down),
            local_addr: self.request_handler.local_addr(),
            engine: self.engine.clone(),
            membership: self.membership.clone(),
        }
    }

    /// Block until the node was stopped (through [`NodeCtrl`] or a signal)
    pub fn wait(mut self) {
        self.stop_on_drop = false;
        drop(self);
        info!("Node finished");
    }
}
