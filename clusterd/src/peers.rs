//! Cluster membership cache
use std::fmt;
use std::str::FromStr;
use std::sync::RwLock;

use clusterd_api::PeerName;
use derive_more::Display;
use thiserror::Error;
use tracing::{debug, info};

use crate::raft::Role;

/// Identity of a cluster member (its FQDN)
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Display)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<PeerName> for PeerId {
    fn from(value: PeerName) -> Self {
        Self(value.0)
    }
}

impl From<&PeerId> for PeerName {
    fn from(value: &PeerId) -> Self {
        PeerName(value.0.clone())
    }
}

/// A member as described by the membership source
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerDescriptor {
    pub id: PeerId,
    /// `host:port` of the member's peer listener
    pub addr: String,
    /// Inactive members are known, but don't take part in elections
    pub active: bool,
}

impl PeerDescriptor {
    pub fn new(id: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            id: PeerId::new(id),
            addr: addr.into(),
            active: true,
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("invalid peer `{0}`, expected `ID@HOST:PORT`")]
pub struct PeerParseError(String);

impl FromStr for PeerDescriptor {
    type Err = PeerParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (id, addr) = s
            .split_once('@')
            .filter(|(id, addr)| !id.is_empty() && addr.contains(':'))
            .ok_or_else(|| PeerParseError(s.to_owned()))?;
        Ok(Self::new(id, addr))
    }
}

/// Per-peer connection state
///
/// Consensus code only ever sets `Connecting` (on any transport error);
/// only the connection keeper moves a peer back to `Connected`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct NodeState {
    pub fqdn: PeerId,
    pub addr: String,
    /// Last role we observed; `Candidate` doubles as "unknown voting member"
    pub role: Role,
    pub active: bool,
    pub is_self: bool,
    pub connection: ConnectionState,
    pub last_log_index: i64,
    pub last_error: Option<String>,
}

impl NodeState {
    fn new(desc: PeerDescriptor, is_self: bool) -> Self {
        Self {
            fqdn: desc.id,
            addr: desc.addr,
            role: Role::Candidate,
            active: desc.active,
            is_self,
            // never talked to this one; the connection keeper will handle it
            connection: if is_self {
                ConnectionState::Connected
            } else {
                ConnectionState::Connecting
            },
            last_log_index: 0,
            last_error: None,
        }
    }

    /// Active member other than us
    pub fn is_remote_voter(&self) -> bool {
        self.active && !self.is_self
    }

    pub fn descriptor(&self) -> PeerDescriptor {
        PeerDescriptor {
            id: self.fqdn.clone(),
            addr: self.addr.clone(),
            active: self.active,
        }
    }
}

/// The membership cache
///
/// Lives under the same lock as the raft state.
#[derive(Debug)]
pub struct PeerDirectory {
    self_id: PeerId,
    nodes: Vec<NodeState>,
    /// Bumped on every reload
    generation: u64,
}

impl PeerDirectory {
    pub fn new(self_id: PeerId) -> Self {
        Self {
            self_id,
            nodes: vec![],
            generation: 0,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Replace all node states with ones built from `members`
    ///
    /// Members that kept their address keep their connection state.
    /// `self` is always part of the directory, even if the membership
    /// source forgot to mention it.
    pub fn reload(&mut self, members: Vec<PeerDescriptor>) {
        let mut nodes: Vec<NodeState> = vec![];
        for desc in members {
            if nodes.iter().any(|n| n.fqdn == desc.id) {
                debug!(peer = %desc.id, "Ignoring duplicate member");
                continue;
            }
            let is_self = desc.id == self.self_id;
            let mut node = NodeState::new(desc, is_self);
            if let Some(old) = self.get(&node.fqdn).filter(|old| old.addr == node.addr) {
                node.connection = old.connection;
                node.role = old.role;
                node.last_log_index = old.last_log_index;
                node.last_error = old.last_error.clone();
            }
            nodes.push(node);
        }

        if !nodes.iter().any(|n| n.is_self) {
            nodes.push(NodeState::new(
                PeerDescriptor {
                    id: self.self_id.clone(),
                    addr: String::new(),
                    active: true,
                },
                true,
            ));
        }

        self.nodes = nodes;
        self.generation += 1;

        info!(
            generation = self.generation,
            members = self.nodes.len(),
            voting = self.cluster_size(),
            "Cluster membership loaded"
        );
    }

    /// Number of members eligible to vote, self included
    pub fn cluster_size(&self) -> usize {
        self.nodes.iter().filter(|n| n.active).count()
    }

    /// Snapshot of active members other than us
    pub fn active_peers(&self) -> Vec<NodeState> {
        self.nodes
            .iter()
            .filter(|n| n.is_remote_voter())
            .cloned()
            .collect()
    }

    /// Number of active peers we currently have a connection to
    pub fn connected_peer_count(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| n.is_remote_voter() && n.connection == ConnectionState::Connected)
            .count()
    }

    pub fn nodes(&self) -> &[NodeState] {
        &self.nodes
    }

    pub fn get(&self, id: &PeerId) -> Option<&NodeState> {
        self.nodes.iter().find(|n| &n.fqdn == id)
    }

    pub fn get_mut(&mut self, id: &PeerId) -> Option<&mut NodeState> {
        self.nodes.iter_mut().find(|n| &n.fqdn == id)
    }

    /// Record a transport failure; returns `true` if the state changed
    pub fn mark_connecting(&mut self, id: &PeerId, error: impl fmt::Display) -> bool {
        let Some(node) = self.get_mut(id) else {
            return false;
        };
        node.last_error = Some(error.to_string());
        let changed = node.connection != ConnectionState::Connecting;
        node.connection = ConnectionState::Connecting;
        changed
    }

    pub fn mark_connected(&mut self, id: &PeerId) {
        if let Some(node) = self.get_mut(id) {
            node.connection = ConnectionState::Connected;
            node.last_error = None;
        }
    }
}

/// Source of cluster membership
///
/// In a full deployment this is fed by the directory engine.
pub trait Membership: Send + Sync {
    fn load(&self) -> anyhow::Result<Vec<PeerDescriptor>>;
}

/// Membership given on the command line
///
/// Can be replaced at runtime; the engine picks the new list up on its
/// next reload.
pub struct StaticMembership {
    members: RwLock<Vec<PeerDescriptor>>,
}

impl StaticMembership {
    pub fn new(members: Vec<PeerDescriptor>) -> Self {
        Self {
            members: RwLock::new(members),
        }
    }

    pub fn replace(&self, members: Vec<PeerDescriptor>) {
        *self.members.write().expect("Locking failed") = members;
    }
}

impl Membership for StaticMembership {
    fn load(&self) -> anyhow::Result<Vec<PeerDescriptor>> {
        Ok(self.members.read().expect("Locking failed").clone())
    }
}
