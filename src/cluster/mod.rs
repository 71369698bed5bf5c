//! Cluster Module
//!
//! Joins brokers into a cluster. A gossip membership layer tracks nodes
//! and carries user events; the [`Agent`] wraps every locally published
//! PUBLISH in a [`Message`] envelope and broadcasts it, and each receiving
//! node hands the rebuilt packet to its own subscribers.
//!
//! Delivery is best effort: envelopes may arrive more than once, out of
//! order, or not at all.

mod agent;
mod dispatcher;
mod hook;
pub mod membership;
pub mod message;
mod pool;

pub use agent::{Agent, AgentError};
pub use dispatcher::{DispatchCounts, MemberView};
pub use hook::ClusterHooks;
pub use membership::{
    GossipLauncher, LocalNetwork, Member, MemberStatus, Membership, MembershipError,
    MembershipEvent, MembershipLauncher,
};
pub use message::{Message, MessageError, RemotePublish};
pub use pool::{PoolError, SubmitPolicy, WorkerPool};

/// The broker side of the cluster boundary
///
/// Receives PUBLISH packets that originated on other nodes. Implementations
/// must deliver to local subscribers only and must not relay the packet
/// back into the cluster.
pub trait LocalDelivery: Send + Sync {
    fn publish_to_subscribers(&self, remote: RemotePublish);
}
