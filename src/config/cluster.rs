//! Cluster Configuration
//!
//! Node identity, gossip transport, worker pool sizing and the directory
//! reserved for consensus state. Keys are kebab-case in the file; the
//! snake_case aliases exist so `VIBEMQ__CLUSTER__NODE_NAME` style overrides
//! land on the same fields.

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use super::ConfigError;

/// Tag keys starting with this prefix are reserved for the gossip layer
pub const RESERVED_TAG_PREFIX: &str = "__";

/// Cluster configuration, loaded once and read-only afterwards
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ClusterConfig {
    /// Cluster-unique node name (defaults to the hostname)
    #[serde(alias = "node_name")]
    pub node_name: String,

    /// IP address the gossip transport binds to
    #[serde(alias = "bind_addr")]
    pub bind_addr: IpAddr,

    /// UDP port the gossip transport binds to
    #[serde(alias = "bind_port")]
    pub bind_port: u16,

    /// Address peers use to reach us; resolved from the hostname if unset
    #[serde(alias = "advertise_addr")]
    pub advertise_addr: Option<SocketAddr>,

    /// Seed members ("host:port") for the initial join; empty bootstraps a
    /// singleton cluster
    pub members: Vec<String>,

    /// Capacity of the membership event queue
    #[serde(alias = "queue_depth")]
    pub queue_depth: usize,

    /// Discovery metadata attached to this node
    pub tags: BTreeMap<String, String>,

    /// Inbound worker pool capacity
    #[serde(alias = "inbound_pool_size")]
    pub inbound_pool_size: usize,

    /// Outbound worker pool capacity
    #[serde(alias = "outbound_pool_size")]
    pub outbound_pool_size: usize,

    /// Fail submissions immediately when a pool is saturated instead of
    /// waiting for a free slot
    #[serde(alias = "inout_pool_nonblocking")]
    pub inout_pool_nonblocking: bool,

    /// Directory for persisted consensus state
    #[serde(alias = "nodes_file_dir")]
    pub nodes_file_dir: PathBuf,

    /// Gossip cluster name; nodes with different ids ignore each other
    #[serde(alias = "cluster_id")]
    pub cluster_id: String,

    /// Gossip round interval in milliseconds
    #[serde(alias = "gossip_interval_ms")]
    pub gossip_interval_ms: u64,

    /// Seconds a dead node stays in the gossip state before removal
    #[serde(alias = "dead_node_grace_period")]
    pub dead_node_grace_period: u64,

    /// Number of broadcast slots each node keeps in its gossip state
    #[serde(alias = "event_window")]
    pub event_window: usize,

    /// Listen address reserved for the consensus transport
    #[serde(alias = "consensus_addr")]
    pub consensus_addr: SocketAddr,

    /// Seconds to wait for in-flight pool tasks at shutdown
    #[serde(alias = "drain_timeout")]
    pub drain_timeout: u64,

    /// Extra attempts for a failed broadcast before it is dropped
    #[serde(alias = "broadcast_retries")]
    pub broadcast_retries: u32,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            node_name: default_node_name(),
            bind_addr: IpAddr::from([0, 0, 0, 0]),
            bind_port: 7946,
            advertise_addr: None,
            members: Vec::new(),
            queue_depth: 64,
            tags: BTreeMap::new(),
            inbound_pool_size: 64,
            outbound_pool_size: 64,
            inout_pool_nonblocking: false,
            nodes_file_dir: PathBuf::from("./data/cluster"),
            cluster_id: "vibemq".to_string(),
            gossip_interval_ms: 500,
            dead_node_grace_period: 30,
            event_window: 64,
            consensus_addr: SocketAddr::from(([127, 0, 0, 1], 7950)),
            drain_timeout: 5,
            broadcast_retries: 2,
        }
    }
}

impl ClusterConfig {
    /// Socket address the gossip transport listens on
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.bind_port)
    }

    /// Address advertised to peers
    /// Priority: explicit config > resolved hostname > bind address
    pub fn gossip_advertise_addr(&self) -> SocketAddr {
        if let Some(addr) = self.advertise_addr {
            return addr;
        }

        if self.bind_addr.is_unspecified() {
            if let Some(ip) = resolve_local_ip() {
                return SocketAddr::new(ip, self.bind_port);
            }
        }

        self.listen_addr()
    }

    pub fn gossip_interval(&self) -> Duration {
        Duration::from_millis(self.gossip_interval_ms)
    }

    pub fn dead_node_grace_period_duration(&self) -> Duration {
        Duration::from_secs(self.dead_node_grace_period)
    }

    pub fn drain_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.drain_timeout)
    }

    /// Validate values that would otherwise fail deep inside bootstrap
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_name.trim().is_empty() {
            return Err(ConfigError::Validation(
                "cluster.node-name must not be empty".to_string(),
            ));
        }

        for (name, value) in [
            ("queue-depth", self.queue_depth),
            ("inbound-pool-size", self.inbound_pool_size),
            ("outbound-pool-size", self.outbound_pool_size),
            ("event-window", self.event_window),
        ] {
            if value == 0 {
                return Err(ConfigError::Validation(format!(
                    "cluster.{} must be greater than 0",
                    name
                )));
            }
        }

        if self.gossip_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "cluster.gossip-interval-ms must be greater than 0".to_string(),
            ));
        }

        if let Some(key) = self
            .tags
            .keys()
            .find(|k| k.starts_with(RESERVED_TAG_PREFIX))
        {
            return Err(ConfigError::Validation(format!(
                "cluster tag '{}' uses the reserved '{}' prefix",
                key, RESERVED_TAG_PREFIX
            )));
        }

        Ok(())
    }
}

fn default_node_name() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| format!("node-{}", rand_id()))
}

/// Resolve the local machine's IP address by resolving the hostname
fn resolve_local_ip() -> Option<IpAddr> {
    let hostname = hostname::get().ok()?;
    let addr_str = format!("{}:0", hostname.to_string_lossy());
    addr_str
        .to_socket_addrs()
        .ok()?
        .find(|addr| addr.is_ipv4())
        .map(|addr| addr.ip())
}

fn rand_id() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("{:x}", nanos & 0xFFFFFFFF)
}

#[cfg(test)]
#[allow(clippy::field_reassign_with_default)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClusterConfig::default();
        assert!(!config.node_name.is_empty());
        assert_eq!(config.listen_addr(), "0.0.0.0:7946".parse().unwrap());
        assert!(config.members.is_empty());
        assert_eq!(config.queue_depth, 64);
        assert!(!config.inout_pool_nonblocking);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_explicit_advertise_addr_wins() {
        let mut config = ClusterConfig::default();
        config.advertise_addr = Some("10.0.0.5:7000".parse().unwrap());
        assert_eq!(
            config.gossip_advertise_addr(),
            "10.0.0.5:7000".parse().unwrap()
        );
    }

    #[test]
    fn test_specific_bind_addr_is_advertised() {
        let mut config = ClusterConfig::default();
        config.bind_addr = "127.0.0.1".parse().unwrap();
        config.bind_port = 17946;
        assert_eq!(
            config.gossip_advertise_addr(),
            "127.0.0.1:17946".parse().unwrap()
        );
    }

    #[test]
    fn test_zero_pool_size_rejected() {
        let mut config = ClusterConfig::default();
        config.outbound_pool_size = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("outbound-pool-size"));
    }

    #[test]
    fn test_reserved_tag_rejected() {
        let mut config = ClusterConfig::default();
        config
            .tags
            .insert("__status".to_string(), "alive".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duration_conversions() {
        let mut config = ClusterConfig::default();
        config.gossip_interval_ms = 250;
        config.dead_node_grace_period = 60;
        config.drain_timeout = 3;

        assert_eq!(config.gossip_interval(), Duration::from_millis(250));
        assert_eq!(
            config.dead_node_grace_period_duration(),
            Duration::from_secs(60)
        );
        assert_eq!(config.drain_timeout_duration(), Duration::from_secs(3));
    }
}
