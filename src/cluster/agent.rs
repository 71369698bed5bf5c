//! Cluster agent
//!
//! One agent per process. It owns the worker pools, the membership layer
//! and the event dispatcher, and relays locally published packets to the
//! rest of the cluster.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use super::dispatcher::{DispatchCounts, DispatchStats, Dispatcher, MemberView};
use super::membership::{Member, Membership, MembershipError, MembershipLauncher};
use super::message::{Message, MessageError};
use super::pool::{PoolError, SubmitPolicy, WorkerPool};
use super::LocalDelivery;
use crate::config::{ClusterConfig, ConfigError};
use crate::consensus::{ConsensusError, ConsensusLog};
use crate::hooks::ClientInfo;
use crate::protocol::{Packet, Publish};

/// Delay before the first broadcast retry; doubles on each attempt
const BROADCAST_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug)]
pub enum AgentError {
    Config(ConfigError),
    Pool(PoolError),
    Membership(MembershipError),
    Message(MessageError),
    Consensus(ConsensusError),
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => write!(f, "configuration: {}", e),
            Self::Pool(e) => write!(f, "worker pool: {}", e),
            Self::Membership(e) => write!(f, "membership: {}", e),
            Self::Message(e) => write!(f, "message: {}", e),
            Self::Consensus(e) => write!(f, "consensus: {}", e),
        }
    }
}

impl std::error::Error for AgentError {}

impl From<ConfigError> for AgentError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<PoolError> for AgentError {
    fn from(e: PoolError) -> Self {
        Self::Pool(e)
    }
}

impl From<MembershipError> for AgentError {
    fn from(e: MembershipError) -> Self {
        Self::Membership(e)
    }
}

impl From<MessageError> for AgentError {
    fn from(e: MessageError) -> Self {
        Self::Message(e)
    }
}

impl From<ConsensusError> for AgentError {
    fn from(e: ConsensusError) -> Self {
        Self::Consensus(e)
    }
}

pub struct Agent {
    id: String,
    config: Arc<ClusterConfig>,
    membership: Arc<dyn Membership>,
    consensus: OnceLock<Arc<ConsensusLog>>,
    outbound: WorkerPool,
    /// Reserved for off-loop decode work; the dispatcher decodes inline
    inbound: WorkerPool,
    view: MemberView,
    stats: Arc<DispatchStats>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl Agent {
    /// Build and start an agent
    ///
    /// The configuration is validated first. Steps then run in order and
    /// the first failure aborts: outbound pool, inbound pool, event queue
    /// and dispatcher, membership layer.
    pub async fn bootstrap(
        config: ClusterConfig,
        runtime: Arc<dyn LocalDelivery>,
        launcher: &dyn MembershipLauncher,
    ) -> Result<Arc<Self>, AgentError> {
        config.validate()?;
        let config = Arc::new(config);
        let policy = SubmitPolicy::from_nonblocking(config.inout_pool_nonblocking);

        let outbound = WorkerPool::new("outbound", config.outbound_pool_size, policy)?;
        let inbound = WorkerPool::new("inbound", config.inbound_pool_size, policy)?;

        let (events_tx, events_rx) = mpsc::channel(config.queue_depth);
        let view = MemberView::default();
        let stats = Arc::new(DispatchStats::default());
        let dispatcher = Dispatcher::new(config.node_name.clone(), runtime, view.clone(), stats.clone())
            .spawn(events_rx);

        // On failure the launcher has dropped the sender, which stops the
        // dispatcher.
        let membership = launcher.launch(&config, events_tx).await?;

        info!(
            "Cluster agent {} started (members={:?}, outbound={}, inbound={}, policy={:?})",
            config.node_name,
            config.members,
            outbound.capacity(),
            inbound.capacity(),
            policy
        );

        Ok(Arc::new(Self {
            id: config.node_name.clone(),
            config,
            membership,
            consensus: OnceLock::new(),
            outbound,
            inbound,
            view,
            stats,
            dispatcher: Mutex::new(Some(dispatcher)),
            stopped: AtomicBool::new(false),
        }))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Attach a consensus log for [`Agent::apply_cluster_command`]
    ///
    /// Returns `false` if one is already attached.
    pub fn attach_consensus(&self, log: Arc<ConsensusLog>) -> bool {
        self.consensus.set(log).is_ok()
    }

    /// Current member list from the membership layer
    pub async fn members(&self) -> Vec<Member> {
        self.membership.members().await
    }

    /// Live members as seen through dispatched membership events
    pub fn member_view(&self) -> Vec<Member> {
        self.view.read().values().cloned().collect()
    }

    pub fn dispatch_stats(&self) -> DispatchCounts {
        self.stats.snapshot()
    }

    pub fn outbound_pool(&self) -> &WorkerPool {
        &self.outbound
    }

    pub fn inbound_pool(&self) -> &WorkerPool {
        &self.inbound
    }

    /// Relay a locally published packet to the rest of the cluster
    ///
    /// Only PUBLISH is relayed; other packets are ignored. Encoding and
    /// broadcast happen on the outbound pool, so this returns as soon as
    /// the work is queued. Failures past that point are logged.
    pub async fn relay_local_packet(&self, client: &ClientInfo, packet: &Packet) -> Result<(), PoolError> {
        match packet {
            Packet::Publish(publish) => self.relay_local_publish(client, publish).await,
            other => {
                trace!(
                    "Not relaying {:?} from {}",
                    other.packet_type(),
                    client.client_id
                );
                Ok(())
            }
        }
    }

    /// [`Agent::relay_local_packet`] for a PUBLISH the caller already holds
    pub async fn relay_local_publish(&self, client: &ClientInfo, publish: &Publish) -> Result<(), PoolError> {
        let membership = self.membership.clone();
        let node_id = self.id.clone();
        let client_id = client.client_id.clone();
        let version = client.protocol_version;
        let publish = publish.clone();
        let retries = self.config.broadcast_retries;

        self.outbound
            .submit(async move {
                match Message::publish(&node_id, &client_id, version, &publish)
                    .and_then(|m| m.to_bytes())
                {
                    Ok(bytes) => broadcast(membership.as_ref(), &node_id, bytes, retries).await,
                    Err(e) => error!("Cannot encode PUBLISH from {} for relay: {}", client_id, e),
                }
            })
            .await
    }

    /// Hand a command to the consensus log
    ///
    /// Without an attached log the command is dropped.
    pub async fn apply_cluster_command(&self, message: Message) -> Result<(), AgentError> {
        let Some(log) = self.consensus.get().cloned() else {
            debug!("No consensus log attached, dropping cluster command");
            return Ok(());
        };

        let command = message.to_bytes()?;
        self.outbound
            .submit(async move {
                match log.apply(command) {
                    Ok(index) => trace!("Cluster command applied at index {}", index),
                    Err(e) => warn!("Cluster command rejected: {}", e),
                }
            })
            .await?;
        Ok(())
    }

    /// Drain the pools and leave the cluster
    ///
    /// Safe to call more than once; later calls return immediately.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Cluster agent {} shutting down", self.id);

        let drain = self.config.drain_timeout_duration();
        let (outbound, inbound) =
            tokio::join!(self.outbound.shutdown(drain), self.inbound.shutdown(drain));
        if !outbound || !inbound {
            warn!("Abandoned unfinished relay work after {:?}", drain);
        }

        if let Err(e) = self.membership.leave().await {
            warn!("Leaving cluster failed: {}", e);
        }

        if let Some(handle) = self.dispatcher.lock().await.take() {
            match tokio::time::timeout(drain, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Dispatcher task failed: {}", e),
                Err(_) => warn!("Dispatcher still running after {:?}", drain),
            }
        }

        if let Some(log) = self.consensus.get() {
            if let Err(e) = log.close() {
                warn!("Closing consensus log failed: {}", e);
            }
        }

        info!("Cluster agent {} stopped", self.id);
    }
}

/// Send one event, retrying transient failures with doubling backoff
async fn broadcast(membership: &dyn Membership, node_id: &str, payload: Bytes, retries: u32) {
    let mut backoff = BROADCAST_BACKOFF;
    let mut attempt = 0;
    loop {
        match membership.user_event(node_id, payload.clone()).await {
            Ok(()) => return,
            Err(e) if e.is_retryable() && attempt < retries => {
                attempt += 1;
                debug!("Broadcast attempt {} failed: {}, retrying in {:?}", attempt, e, backoff);
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
            Err(e) => {
                error!("Broadcast failed after {} attempts: {}", attempt + 1, e);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::AtomicU32;

    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::cluster::membership::{LocalNetwork, MembershipEvent};
    use crate::cluster::message::RemotePublish;
    use crate::protocol::{ProtocolVersion, Publish, QoS, Subscribe, Subscription};

    #[derive(Default)]
    struct Collector {
        received: parking_lot::Mutex<Vec<RemotePublish>>,
    }

    impl LocalDelivery for Collector {
        fn publish_to_subscribers(&self, remote: RemotePublish) {
            self.received.lock().push(remote);
        }
    }

    impl Collector {
        fn count(&self) -> usize {
            self.received.lock().len()
        }
    }

    fn config(name: &str, port: u16) -> ClusterConfig {
        ClusterConfig {
            node_name: name.to_string(),
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            bind_port: port,
            drain_timeout: 1,
            ..Default::default()
        }
    }

    fn client() -> ClientInfo {
        ClientInfo::new("c1", ProtocolVersion::V5)
    }

    fn temp_publish() -> Packet {
        Packet::Publish(Publish {
            qos: QoS::AtLeastOnce,
            topic: "sensors/temp".into(),
            packet_id: Some(1),
            payload: Bytes::from_static(&[0x17]),
            ..Default::default()
        })
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_singleton_bootstrap() {
        let network = LocalNetwork::new();
        let agent = Agent::bootstrap(config("solo", 7101), Arc::new(Collector::default()), &network)
            .await
            .unwrap();

        let members = agent.members().await;
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].name, "solo");
        wait_until(|| agent.member_view().len() == 1).await;
        agent.shutdown().await;
    }

    #[tokio::test]
    async fn test_publish_relayed_to_peer_only() {
        let network = LocalNetwork::new();
        let runtime_a = Arc::new(Collector::default());
        let runtime_b = Arc::new(Collector::default());

        let a = Agent::bootstrap(config("node-a", 7101), runtime_a.clone(), &network)
            .await
            .unwrap();
        let mut cfg_b = config("node-b", 7102);
        cfg_b.members = vec!["node-a".to_string()];
        let b = Agent::bootstrap(cfg_b, runtime_b.clone(), &network).await.unwrap();

        a.relay_local_packet(&client(), &temp_publish()).await.unwrap();
        wait_until(|| runtime_b.count() == 1).await;

        let received = runtime_b.received.lock()[0].clone();
        assert_eq!(received.node_id, "node-a");
        assert_eq!(received.client_id, "c1");
        assert_eq!(received.publish.payload, Bytes::from_static(&[0x17]));

        wait_until(|| a.dispatch_stats().own == 1).await;
        assert_eq!(runtime_a.count(), 0);

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn test_non_publish_not_relayed() {
        let network = LocalNetwork::new();
        let runtime_b = Arc::new(Collector::default());
        let a = Agent::bootstrap(config("node-a", 7101), Arc::new(Collector::default()), &network)
            .await
            .unwrap();
        let b = Agent::bootstrap(config("node-b", 7102), runtime_b.clone(), &network)
            .await
            .unwrap();

        let subscribe = Packet::Subscribe(Subscribe {
            packet_id: 1,
            subscriptions: vec![Subscription {
                filter: "a/#".to_string(),
                qos: QoS::AtMostOnce,
            }],
        });
        a.relay_local_packet(&client(), &subscribe).await.unwrap();
        a.relay_local_packet(&client(), &temp_publish()).await.unwrap();

        wait_until(|| b.dispatch_stats().delivered == 1).await;
        assert_eq!(b.dispatch_stats().unknown, 0);
        assert_eq!(runtime_b.count(), 1);
    }

    #[tokio::test]
    async fn test_invalid_config_fails_bootstrap() {
        let mut cfg = config("node-a", 7101);
        cfg.outbound_pool_size = 0;
        let result = Agent::bootstrap(cfg, Arc::new(Collector::default()), &LocalNetwork::new()).await;
        assert!(matches!(result, Err(AgentError::Config(_))));

        let mut cfg = config("node-a", 7101);
        cfg.queue_depth = 0;
        let result = Agent::bootstrap(cfg, Arc::new(Collector::default()), &LocalNetwork::new()).await;
        assert!(matches!(result, Err(AgentError::Config(_))));
    }

    #[tokio::test]
    async fn test_unreachable_members_fail_bootstrap() {
        let mut cfg = config("node-a", 7101);
        cfg.members = vec!["10.1.1.1:7946".to_string()];
        let result = Agent::bootstrap(cfg, Arc::new(Collector::default()), &LocalNetwork::new()).await;
        assert!(matches!(
            result,
            Err(AgentError::Membership(MembershipError::Join(_)))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let network = LocalNetwork::new();
        let agent = Agent::bootstrap(config("node-a", 7101), Arc::new(Collector::default()), &network)
            .await
            .unwrap();

        agent.shutdown().await;
        agent.shutdown().await;
        assert_eq!(network.node_count(), 0);
        assert_eq!(
            agent.relay_local_packet(&client(), &temp_publish()).await,
            Err(PoolError::Closed { pool: "outbound" })
        );
    }

    #[tokio::test]
    async fn test_saturated_nonblocking_pool() {
        let network = LocalNetwork::new();
        let mut cfg = config("node-a", 7101);
        cfg.outbound_pool_size = 1;
        cfg.inout_pool_nonblocking = true;
        let agent = Agent::bootstrap(cfg, Arc::new(Collector::default()), &network)
            .await
            .unwrap();

        agent
            .outbound_pool()
            .submit(std::future::pending())
            .await
            .unwrap();
        assert_eq!(
            agent.relay_local_packet(&client(), &temp_publish()).await,
            Err(PoolError::Saturated { pool: "outbound" })
        );
    }

    struct FlakyMembership {
        failures_left: AtomicU32,
        attempts: AtomicU32,
    }

    #[async_trait]
    impl Membership for FlakyMembership {
        fn local_name(&self) -> &str {
            "flaky"
        }

        async fn members(&self) -> Vec<Member> {
            Vec::new()
        }

        async fn user_event(&self, _name: &str, _payload: Bytes) -> Result<(), MembershipError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(MembershipError::Broadcast("queue full".to_string()));
            }
            Ok(())
        }

        async fn query(&self, _name: &str, _payload: Bytes) -> Result<(), MembershipError> {
            Ok(())
        }

        async fn leave(&self) -> Result<(), MembershipError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_broadcast_retries_transient_failures() {
        let flaky = FlakyMembership {
            failures_left: AtomicU32::new(2),
            attempts: AtomicU32::new(0),
        };
        broadcast(&flaky, "flaky", Bytes::from_static(b"x"), 2).await;
        assert_eq!(flaky.attempts.load(Ordering::SeqCst), 3);

        let flaky = FlakyMembership {
            failures_left: AtomicU32::new(5),
            attempts: AtomicU32::new(0),
        };
        broadcast(&flaky, "flaky", Bytes::from_static(b"x"), 1).await;
        assert_eq!(flaky.attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_command_without_consensus_is_dropped() {
        let network = LocalNetwork::new();
        let agent = Agent::bootstrap(config("node-a", 7101), Arc::new(Collector::default()), &network)
            .await
            .unwrap();
        let message = Message::publish("node-a", "c1", ProtocolVersion::V5, &Publish {
            topic: "t".into(),
            ..Default::default()
        })
        .unwrap();
        assert!(agent.apply_cluster_command(message).await.is_ok());
    }

    #[tokio::test]
    async fn test_command_appended_to_attached_log() {
        let dir = tempfile::tempdir().unwrap();
        let network = LocalNetwork::new();
        let mut cfg = config("node-a", 7101);
        cfg.nodes_file_dir = dir.path().to_path_buf();

        let log = Arc::new(
            ConsensusLog::open(&cfg, Arc::new(crate::consensus::NoopStateMachine)).unwrap(),
        );
        let agent = Agent::bootstrap(cfg, Arc::new(Collector::default()), &network)
            .await
            .unwrap();
        assert!(agent.attach_consensus(log.clone()));
        assert!(!agent.attach_consensus(log.clone()));

        let message = Message::publish("node-a", "c1", ProtocolVersion::V5, &Publish {
            topic: "t".into(),
            ..Default::default()
        })
        .unwrap();
        agent.apply_cluster_command(message).await.unwrap();
        wait_until(|| log.last_index().unwrap_or(0) == 1).await;

        agent.shutdown().await;
    }

    #[tokio::test]
    async fn test_injected_unknown_event_does_not_stop_dispatch() {
        let network = LocalNetwork::new();
        let agent = Agent::bootstrap(config("node-a", 7101), Arc::new(Collector::default()), &network)
            .await
            .unwrap();
        assert!(
            network
                .inject(
                    "node-a",
                    MembershipEvent::Unknown {
                        kind: 99,
                        origin: "x".to_string()
                    }
                )
                .await
        );
        wait_until(|| agent.dispatch_stats().unknown == 1).await;
        wait_until(|| agent.dispatch_stats().member_events >= 1).await;
    }
}
