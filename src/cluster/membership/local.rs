//! In-process membership
//!
//! Nodes launched on the same [`LocalNetwork`] see each other immediately
//! and deliver events straight into each other's queues. Useful for tests
//! and for running several agents inside one process.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use super::{
    Member, MemberEvent, MemberEventKind, MemberStatus, Membership, MembershipError,
    MembershipEvent, MembershipLauncher, QueryEvent, UserEvent,
};
use crate::config::ClusterConfig;

struct LocalNode {
    member: Member,
    events: mpsc::Sender<MembershipEvent>,
}

/// Shared hub that [`LocalMembership`] nodes attach to
#[derive(Clone, Default)]
pub struct LocalNetwork {
    nodes: Arc<Mutex<BTreeMap<String, LocalNode>>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.lock().len()
    }

    /// Push an arbitrary event into one node's queue
    pub async fn inject(&self, node: &str, event: MembershipEvent) -> bool {
        let sender = self.nodes.lock().get(node).map(|n| n.events.clone());
        match sender {
            Some(tx) => tx.send(event).await.is_ok(),
            None => false,
        }
    }

    fn senders(&self) -> Vec<mpsc::Sender<MembershipEvent>> {
        self.nodes.lock().values().map(|n| n.events.clone()).collect()
    }

    fn members(&self) -> Vec<Member> {
        self.nodes.lock().values().map(|n| n.member.clone()).collect()
    }

    async fn deliver(&self, targets: Vec<mpsc::Sender<MembershipEvent>>, event: MembershipEvent) {
        for tx in targets {
            // A node whose queue is closed is on its way out
            let _ = tx.send(event.clone()).await;
        }
    }
}

#[async_trait]
impl MembershipLauncher for LocalNetwork {
    async fn launch(
        &self,
        config: &ClusterConfig,
        events: mpsc::Sender<MembershipEvent>,
    ) -> Result<Arc<dyn Membership>, MembershipError> {
        let member = Member {
            name: config.node_name.clone(),
            addr: config.listen_addr(),
            tags: config.tags.clone(),
            status: MemberStatus::Alive,
        };

        {
            let mut nodes = self.nodes.lock();
            if nodes.contains_key(&member.name) {
                return Err(MembershipError::Bind(format!(
                    "node {} already attached",
                    member.name
                )));
            }
            if nodes.values().any(|n| n.member.addr == member.addr) {
                return Err(MembershipError::Bind(format!("{} already in use", member.addr)));
            }

            if !config.members.is_empty() {
                let reachable = config.members.iter().any(|seed| {
                    nodes
                        .values()
                        .any(|n| n.member.name == *seed || n.member.addr.to_string() == *seed)
                });
                if !reachable {
                    return Err(MembershipError::Join(format!(
                        "no reachable member among {:?}",
                        config.members
                    )));
                }
            }

            nodes.insert(
                member.name.clone(),
                LocalNode {
                    member: member.clone(),
                    events,
                },
            );
        }

        debug!("Local node {} attached", member.name);

        // The new node learns the full view, the others learn about it
        let view = self.members();
        let mut others = Vec::new();
        let mut own = None;
        let targets: Vec<(String, mpsc::Sender<MembershipEvent>)> = self
            .nodes
            .lock()
            .iter()
            .map(|(name, n)| (name.clone(), n.events.clone()))
            .collect();
        for (name, tx) in targets {
            if name == member.name {
                own = Some(tx);
            } else {
                others.push(tx);
            }
        }
        if let Some(tx) = own {
            let _ = tx
                .send(MembershipEvent::Member(MemberEvent {
                    kind: MemberEventKind::Join,
                    members: view,
                }))
                .await;
        }
        self.deliver(
            others,
            MembershipEvent::Member(MemberEvent {
                kind: MemberEventKind::Join,
                members: vec![member.clone()],
            }),
        )
        .await;

        Ok(Arc::new(LocalMembership {
            name: member.name,
            network: self.clone(),
        }))
    }
}

/// A node attached to a [`LocalNetwork`]
pub struct LocalMembership {
    name: String,
    network: LocalNetwork,
}

impl LocalMembership {
    fn ensure_attached(&self) -> Result<(), MembershipError> {
        if self.network.nodes.lock().contains_key(&self.name) {
            Ok(())
        } else {
            Err(MembershipError::NotRunning)
        }
    }
}

#[async_trait]
impl Membership for LocalMembership {
    fn local_name(&self) -> &str {
        &self.name
    }

    async fn members(&self) -> Vec<Member> {
        self.network.members()
    }

    async fn user_event(&self, name: &str, payload: Bytes) -> Result<(), MembershipError> {
        self.ensure_attached()?;
        let event = MembershipEvent::User(UserEvent {
            name: name.to_string(),
            payload,
        });
        self.network.deliver(self.network.senders(), event).await;
        Ok(())
    }

    async fn query(&self, name: &str, payload: Bytes) -> Result<(), MembershipError> {
        self.ensure_attached()?;
        let event = MembershipEvent::Query(QueryEvent {
            name: name.to_string(),
            payload,
            origin: self.name.clone(),
        });
        self.network.deliver(self.network.senders(), event).await;
        Ok(())
    }

    async fn leave(&self) -> Result<(), MembershipError> {
        let removed = self.network.nodes.lock().remove(&self.name);
        let Some(node) = removed else {
            return Err(MembershipError::NotRunning);
        };
        debug!("Local node {} detached", self.name);

        let mut member = node.member;
        member.status = MemberStatus::Left;
        self.network
            .deliver(
                self.network.senders(),
                MembershipEvent::Member(MemberEvent {
                    kind: MemberEventKind::Leave,
                    members: vec![member],
                }),
            )
            .await;
        Ok(())
    }
}
