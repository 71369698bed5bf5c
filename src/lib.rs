//! VibeMQ Cluster - gossip clustering for VibeMQ brokers
//!
//! Every PUBLISH a local client sends is wrapped in an envelope and
//! broadcast over the membership layer; peers rebuild the packet and
//! deliver it to their own subscribers. Delivery across nodes is best
//! effort and may duplicate or reorder messages.

pub mod broker;
pub mod cluster;
pub mod codec;
pub mod config;
pub mod consensus;
pub mod hooks;
pub mod protocol;

pub use broker::LocalBroker;
pub use cluster::{Agent, AgentError, ClusterHooks, GossipLauncher, LocalNetwork};
pub use config::{ClusterConfig, Config};
pub use hooks::{CompositeHooks, Hooks};
pub use protocol::{ProtocolVersion, QoS};
