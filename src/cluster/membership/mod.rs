//! Cluster membership
//!
//! The membership layer tracks which nodes are in the cluster and carries
//! small user events between them. Everything it observes is pushed into
//! the agent's bounded event queue as a [`MembershipEvent`].
//!
//! Two backends exist: [`GossipLauncher`] runs a chitchat gossip node over
//! UDP, [`LocalNetwork`] connects nodes living in the same process.

mod gossip;
mod local;

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::config::ClusterConfig;

pub use gossip::{GossipLauncher, GossipMembership};
pub use local::{LocalMembership, LocalNetwork};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemberStatus {
    Alive,
    Leaving,
    Left,
    Failed,
}

impl MemberStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Alive => "alive",
            Self::Leaving => "leaving",
            Self::Left => "left",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "alive" => Some(Self::Alive),
            "leaving" => Some(Self::Leaving),
            "left" => Some(Self::Left),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Whether the node has announced leaving or stopped answering
    pub fn is_departed(self) -> bool {
        !matches!(self, Self::Alive)
    }
}

impl fmt::Display for MemberStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A node as seen by the membership layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub name: String,
    pub addr: SocketAddr,
    pub tags: BTreeMap<String, String>,
    pub status: MemberStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberEventKind {
    Join,
    Leave,
    Failed,
    Update,
}

impl fmt::Display for MemberEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Join => "member-join",
            Self::Leave => "member-leave",
            Self::Failed => "member-failed",
            Self::Update => "member-update",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberEvent {
    pub kind: MemberEventKind,
    pub members: Vec<Member>,
}

/// Opaque broadcast from one node to all nodes
///
/// `name` is the sending node's id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserEvent {
    pub name: String,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryEvent {
    pub name: String,
    pub payload: Bytes,
    pub origin: String,
}

/// Everything the membership layer can push into the event queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    Member(MemberEvent),
    User(UserEvent),
    Query(QueryEvent),
    /// An event kind this node does not understand
    Unknown { kind: u8, origin: String },
}

impl MembershipEvent {
    pub fn kind_name(&self) -> String {
        match self {
            Self::Member(e) => e.kind.to_string(),
            Self::User(_) => "user".to_string(),
            Self::Query(_) => "query".to_string(),
            Self::Unknown { kind, .. } => format!("unknown({})", kind),
        }
    }
}

#[derive(Debug)]
pub enum MembershipError {
    /// Could not bind the membership transport
    Bind(String),
    /// None of the configured members could be reached
    Join(String),
    /// A user event or query could not be sent
    Broadcast(String),
    /// The payload does not fit in a single gossip record
    PayloadTooLarge { size: usize, max: usize },
    /// The layer has already left the cluster
    NotRunning,
    Shutdown(String),
}

impl MembershipError {
    /// Whether resending the same event might succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Broadcast(_))
    }
}

impl fmt::Display for MembershipError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bind(e) => write!(f, "membership bind failed: {}", e),
            Self::Join(e) => write!(f, "failed to join cluster: {}", e),
            Self::Broadcast(e) => write!(f, "broadcast failed: {}", e),
            Self::PayloadTooLarge { size, max } => {
                write!(f, "event payload of {} bytes exceeds {} bytes", size, max)
            }
            Self::NotRunning => write!(f, "membership layer is not running"),
            Self::Shutdown(e) => write!(f, "membership shutdown failed: {}", e),
        }
    }
}

impl std::error::Error for MembershipError {}

/// A running membership layer
#[async_trait]
pub trait Membership: Send + Sync {
    /// This node's id
    fn local_name(&self) -> &str;

    /// Current member list, including this node
    async fn members(&self) -> Vec<Member>;

    /// Broadcast an opaque payload to every node, this one included
    async fn user_event(&self, name: &str, payload: Bytes) -> Result<(), MembershipError>;

    /// Broadcast a query; responses are not collected
    async fn query(&self, name: &str, payload: Bytes) -> Result<(), MembershipError>;

    /// Announce departure and stop. Drops this layer's side of the event
    /// queue once done.
    async fn leave(&self) -> Result<(), MembershipError>;
}

/// Starts a membership layer wired to an event queue
#[async_trait]
pub trait MembershipLauncher: Send + Sync {
    async fn launch(
        &self,
        config: &ClusterConfig,
        events: mpsc::Sender<MembershipEvent>,
    ) -> Result<Arc<dyn Membership>, MembershipError>;
}
