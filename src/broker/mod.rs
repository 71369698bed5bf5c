//! Local Broker
//!
//! A small in-process broker: sessions, subscriptions and topic routing,
//! with hooks fired on each client action. PUBLISH packets arriving from
//! the cluster are routed to local subscribers without firing hooks, so
//! they are never relayed a second time.

mod topic;

pub use topic::{topic_matches_filter, validate_topic_filter, validate_topic_name};

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cluster::{LocalDelivery, RemotePublish};
use crate::hooks::{ClientInfo, CompositeHooks, Hooks};
use crate::protocol::{Connect, Publish, QoS, Subscribe, Unsubscribe, Will};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    InvalidClientId,
    UnknownClient(String),
    InvalidTopic(&'static str),
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidClientId => write!(f, "client id cannot be empty"),
            Self::UnknownClient(id) => write!(f, "unknown client: {}", id),
            Self::InvalidTopic(e) => write!(f, "invalid topic: {}", e),
        }
    }
}

impl std::error::Error for BrokerError {}

/// Where a delivered message was published
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    Local { client_id: String },
    Cluster { node_id: String, client_id: String },
}

/// A message handed to a subscriber
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub topic: Arc<str>,
    pub payload: Bytes,
    /// Lower of publish and subscription QoS
    pub qos: QoS,
    pub retain: bool,
    pub origin: Origin,
}

struct Session {
    info: ClientInfo,
    will: Option<Will>,
    filters: RwLock<Vec<(String, QoS)>>,
    tx: mpsc::Sender<Delivery>,
}

pub struct LocalBroker {
    sessions: DashMap<Arc<str>, Arc<Session>>,
    hooks: tokio::sync::RwLock<CompositeHooks>,
    queue_capacity: usize,
}

impl LocalBroker {
    /// `queue_capacity` bounds each client's pending deliveries
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            hooks: tokio::sync::RwLock::new(CompositeHooks::new()),
            queue_capacity: queue_capacity.max(1),
        }
    }

    pub async fn add_hook<H: Hooks + 'static>(&self, hook: H) {
        info!("Adding hook '{}'", hook.id());
        self.hooks.write().await.add(hook);
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Open a session, replacing any session with the same client id
    pub async fn connect(
        &self,
        connect: Connect,
    ) -> Result<(ClientInfo, mpsc::Receiver<Delivery>), BrokerError> {
        if connect.client_id.is_empty() {
            return Err(BrokerError::InvalidClientId);
        }

        let info = ClientInfo::new(connect.client_id.clone(), connect.protocol_version);
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let session = Arc::new(Session {
            info: info.clone(),
            will: connect.will.clone(),
            filters: RwLock::new(Vec::new()),
            tx,
        });
        if self
            .sessions
            .insert(Arc::from(connect.client_id.as_str()), session)
            .is_some()
        {
            debug!("Client {} took over an existing session", connect.client_id);
        }

        self.hooks
            .read()
            .await
            .on_session_established(&info, &connect)
            .await;
        Ok((info, rx))
    }

    pub async fn subscribe(&self, client: &ClientInfo, packet: Subscribe) -> Result<(), BrokerError> {
        for sub in &packet.subscriptions {
            validate_topic_filter(&sub.filter).map_err(BrokerError::InvalidTopic)?;
        }

        let session = self.session(&client.client_id)?;
        {
            let mut filters = session.filters.write();
            for sub in &packet.subscriptions {
                filters.retain(|(f, _)| f != &sub.filter);
                filters.push((sub.filter.clone(), sub.qos));
            }
        }

        self.hooks.read().await.on_subscribed(client, &packet).await;
        Ok(())
    }

    pub async fn unsubscribe(&self, client: &ClientInfo, packet: Unsubscribe) -> Result<(), BrokerError> {
        let session = self.session(&client.client_id)?;
        session
            .filters
            .write()
            .retain(|(f, _)| !packet.filters.contains(f));

        self.hooks.read().await.on_unsubscribed(client, &packet).await;
        Ok(())
    }

    /// Route a client's PUBLISH locally; returns the number of deliveries
    pub async fn publish(&self, client: &ClientInfo, publish: Publish) -> Result<usize, BrokerError> {
        validate_topic_name(&publish.topic).map_err(BrokerError::InvalidTopic)?;
        self.session(&client.client_id)?;

        let delivered = self.route(
            &publish,
            Origin::Local {
                client_id: client.client_id.clone(),
            },
        );
        self.hooks.read().await.on_published(client, &publish).await;
        Ok(delivered)
    }

    /// Close a session; an ungraceful close sends the client's will
    pub async fn disconnect(&self, client_id: &str, graceful: bool) {
        let Some((_, session)) = self.sessions.remove(client_id) else {
            return;
        };

        match (&session.will, graceful) {
            (Some(will), false) => {
                let publish = Publish::from_will(will, 1);
                self.route(
                    &publish,
                    Origin::Local {
                        client_id: client_id.to_string(),
                    },
                );
                self.hooks
                    .read()
                    .await
                    .on_will_sent(&session.info, &publish)
                    .await;
            }
            _ => debug!("Client {} disconnected", client_id),
        }
    }

    fn session(&self, client_id: &str) -> Result<Arc<Session>, BrokerError> {
        self.sessions
            .get(client_id)
            .map(|s| s.value().clone())
            .ok_or_else(|| BrokerError::UnknownClient(client_id.to_string()))
    }

    fn route(&self, publish: &Publish, origin: Origin) -> usize {
        let mut delivered = 0;
        for entry in self.sessions.iter() {
            let granted = entry
                .filters
                .read()
                .iter()
                .filter(|(filter, _)| topic_matches_filter(&publish.topic, filter))
                .map(|(_, qos)| *qos)
                .max();
            let Some(granted) = granted else {
                continue;
            };

            let delivery = Delivery {
                topic: publish.topic.clone(),
                payload: publish.payload.clone(),
                qos: publish.qos.min(granted),
                retain: publish.retain,
                origin: origin.clone(),
            };
            match entry.tx.try_send(delivery) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("Dropping message on '{}' for slow client {}", publish.topic, entry.key());
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("Client {} no longer reading", entry.key());
                }
            }
        }
        delivered
    }
}

impl LocalDelivery for LocalBroker {
    fn publish_to_subscribers(&self, remote: RemotePublish) {
        let delivered = self.route(
            &remote.publish,
            Origin::Cluster {
                node_id: remote.node_id,
                client_id: remote.client_id,
            },
        );
        debug!("Cluster message on '{}' delivered to {} clients", remote.publish.topic, delivered);
    }
}
