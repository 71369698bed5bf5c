//! Broker hook that feeds local activity into the cluster agent

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{trace, warn};

use super::agent::Agent;
use crate::hooks::{ClientInfo, HookError, HookEvent, HookResult, Hooks};
use crate::protocol::{Connect, PacketType, Publish, Subscribe, Unsubscribe};

/// Relays session, subscription, publish and will events to an [`Agent`]
///
/// Only PUBLISH (including sent wills) leaves the node. The other callbacks
/// return without touching the packet.
pub struct ClusterHooks {
    agent: Arc<Agent>,
}

impl ClusterHooks {
    pub const ID: &'static str = "cluster-agent-event";

    pub fn init(agent: Option<Arc<Agent>>) -> HookResult<Self> {
        agent
            .map(|agent| Self { agent })
            .ok_or(HookError::MissingAgent)
    }

    async fn relay(&self, client: &ClientInfo, publish: &Publish) {
        if let Err(e) = self.agent.relay_local_publish(client, publish).await {
            warn!(
                "Cluster relay of PUBLISH to {} from {} failed: {}",
                publish.topic, client.client_id, e
            );
        }
    }

    fn skip(client: &ClientInfo, kind: PacketType) {
        trace!("Not relaying {:?} from {}", kind, client.client_id);
    }
}

#[async_trait]
impl Hooks for ClusterHooks {
    fn id(&self) -> &str {
        Self::ID
    }

    fn provides(&self, event: HookEvent) -> bool {
        HookEvent::ALL.contains(&event)
    }

    async fn on_session_established(&self, client: &ClientInfo, _packet: &Connect) {
        Self::skip(client, PacketType::Connect);
    }

    async fn on_subscribed(&self, client: &ClientInfo, _packet: &Subscribe) {
        Self::skip(client, PacketType::Subscribe);
    }

    async fn on_unsubscribed(&self, client: &ClientInfo, _packet: &Unsubscribe) {
        Self::skip(client, PacketType::Unsubscribe);
    }

    async fn on_published(&self, client: &ClientInfo, packet: &Publish) {
        self.relay(client, packet).await;
    }

    async fn on_will_sent(&self, client: &ClientInfo, packet: &Publish) {
        self.relay(client, packet).await;
    }
}
