//! Event dispatch
//!
//! A single task drains the membership event queue in arrival order.
//! Relayed PUBLISH packets are decoded and handed to the local broker;
//! everything else is logged. A bad event is dropped and the loop moves on.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::membership::{
    Member, MemberEvent, MemberEventKind, MembershipEvent, QueryEvent, UserEvent,
};
use super::message::{decode_envelope, MESSAGE_TYPE_PUBLISH};
use super::LocalDelivery;

/// Live members as last reported by the membership layer
pub type MemberView = Arc<RwLock<BTreeMap<String, Member>>>;

/// Counters kept by the dispatch loop
#[derive(Debug, Default)]
pub struct DispatchStats {
    delivered: AtomicU64,
    dropped: AtomicU64,
    unknown: AtomicU64,
    own: AtomicU64,
    member_events: AtomicU64,
    queries: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchCounts {
    /// PUBLISH packets handed to the local broker
    pub delivered: u64,
    /// Events that failed to decode
    pub dropped: u64,
    /// Envelopes or events of a kind this node does not handle
    pub unknown: u64,
    /// Envelopes this node sent itself
    pub own: u64,
    pub member_events: u64,
    pub queries: u64,
}

impl DispatchStats {
    pub fn snapshot(&self) -> DispatchCounts {
        DispatchCounts {
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            unknown: self.unknown.load(Ordering::Relaxed),
            own: self.own.load(Ordering::Relaxed),
            member_events: self.member_events.load(Ordering::Relaxed),
            queries: self.queries.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

pub(crate) struct Dispatcher {
    node_id: String,
    runtime: Arc<dyn LocalDelivery>,
    view: MemberView,
    stats: Arc<DispatchStats>,
}

impl Dispatcher {
    pub(crate) fn new(
        node_id: String,
        runtime: Arc<dyn LocalDelivery>,
        view: MemberView,
        stats: Arc<DispatchStats>,
    ) -> Self {
        Self {
            node_id,
            runtime,
            view,
            stats,
        }
    }

    /// Run until every sender of `events` is gone
    pub(crate) fn spawn(self, mut events: mpsc::Receiver<MembershipEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                self.handle(event);
            }
            debug!("Event queue closed, dispatcher exiting");
        })
    }

    pub(crate) fn handle(&self, event: MembershipEvent) {
        match event {
            MembershipEvent::Member(e) => self.handle_member_event(e),
            MembershipEvent::User(e) => self.handle_user_event(e),
            MembershipEvent::Query(e) => self.handle_query(e),
            MembershipEvent::Unknown { kind, origin } => {
                DispatchStats::bump(&self.stats.unknown);
                warn!("Unknown membership event kind {} from {}", kind, origin);
            }
        }
    }

    fn handle_member_event(&self, event: MemberEvent) {
        DispatchStats::bump(&self.stats.member_events);
        let names: Vec<&str> = event.members.iter().map(|m| m.name.as_str()).collect();
        info!("{}: {:?}", event.kind, names);

        let mut view = self.view.write();
        for member in event.members {
            match event.kind {
                MemberEventKind::Join | MemberEventKind::Update => {
                    view.insert(member.name.clone(), member);
                }
                MemberEventKind::Leave | MemberEventKind::Failed => {
                    view.remove(&member.name);
                }
            }
        }
    }

    fn handle_user_event(&self, event: UserEvent) {
        let message = match decode_envelope(&event.payload) {
            Ok(message) => message,
            Err(e) => {
                DispatchStats::bump(&self.stats.dropped);
                warn!("Dropping undecodable cluster event from {}: {}", event.name, e);
                return;
            }
        };

        if message.node_id == self.node_id {
            DispatchStats::bump(&self.stats.own);
            trace!("Ignoring own cluster event");
            return;
        }

        if message.kind != MESSAGE_TYPE_PUBLISH {
            DispatchStats::bump(&self.stats.unknown);
            warn!(
                "Unknown cluster message type {} from {}",
                message.kind, message.node_id
            );
            return;
        }

        match message.to_publish() {
            Ok(remote) => {
                debug!(
                    "Cluster PUBLISH from {}/{} on '{}'",
                    remote.node_id, remote.client_id, remote.publish.topic
                );
                self.runtime.publish_to_subscribers(remote);
                DispatchStats::bump(&self.stats.delivered);
            }
            Err(e) => {
                DispatchStats::bump(&self.stats.dropped);
                warn!(
                    "Dropping malformed PUBLISH from {}: {}",
                    message.node_id, e
                );
            }
        }
    }

    fn handle_query(&self, event: QueryEvent) {
        DispatchStats::bump(&self.stats.queries);
        debug!(
            "Query '{}' from {} ({} bytes)",
            event.name,
            event.origin,
            event.payload.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use bytes::Bytes;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::cluster::membership::MemberStatus;
    use crate::cluster::message::{encode_publish, Message, RemotePublish};
    use crate::protocol::{ProtocolVersion, Publish, QoS};

    #[derive(Default)]
    struct Collector {
        received: parking_lot::Mutex<Vec<RemotePublish>>,
    }

    impl LocalDelivery for Collector {
        fn publish_to_subscribers(&self, remote: RemotePublish) {
            self.received.lock().push(remote);
        }
    }

    fn dispatcher(node_id: &str) -> (Dispatcher, Arc<Collector>) {
        let collector = Arc::new(Collector::default());
        let dispatcher = Dispatcher::new(
            node_id.to_string(),
            collector.clone(),
            MemberView::default(),
            Arc::new(DispatchStats::default()),
        );
        (dispatcher, collector)
    }

    fn publish_event(node_id: &str) -> MembershipEvent {
        let publish = Publish {
            qos: QoS::AtLeastOnce,
            topic: "sensors/temp".into(),
            packet_id: Some(1),
            payload: Bytes::from_static(&[0x17]),
            ..Default::default()
        };
        let payload = encode_publish(node_id, "c1", ProtocolVersion::V5, &publish).unwrap();
        MembershipEvent::User(UserEvent {
            name: node_id.to_string(),
            payload,
        })
    }

    fn member(name: &str) -> Member {
        Member {
            name: name.to_string(),
            addr: "127.0.0.1:7946".parse::<SocketAddr>().unwrap(),
            tags: BTreeMap::new(),
            status: MemberStatus::Alive,
        }
    }

    #[test]
    fn test_remote_publish_delivered() {
        let (dispatcher, collector) = dispatcher("node-b");
        dispatcher.handle(publish_event("node-a"));

        let received = collector.received.lock();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].client_id, "c1");
        assert_eq!(&*received[0].publish.topic, "sensors/temp");
        assert_eq!(dispatcher.stats.snapshot().delivered, 1);
    }

    #[test]
    fn test_duplicate_events_delivered_twice() {
        let (dispatcher, collector) = dispatcher("node-b");
        let event = publish_event("node-a");
        dispatcher.handle(event.clone());
        dispatcher.handle(event);
        assert_eq!(collector.received.lock().len(), 2);
    }

    #[test]
    fn test_own_events_ignored() {
        let (dispatcher, collector) = dispatcher("node-a");
        dispatcher.handle(publish_event("node-a"));
        assert!(collector.received.lock().is_empty());
        assert_eq!(dispatcher.stats.snapshot().own, 1);
    }

    #[test]
    fn test_unknown_type_skipped_then_loop_continues() {
        let (dispatcher, collector) = dispatcher("node-b");
        let message = Message {
            kind: 8,
            node_id: "node-a".to_string(),
            client_id: "c1".to_string(),
            protocol_version: 5,
            payload: vec![0x82, 0x00],
        };
        dispatcher.handle(MembershipEvent::User(UserEvent {
            name: "node-a".to_string(),
            payload: message.to_bytes().unwrap(),
        }));
        dispatcher.handle(publish_event("node-a"));

        assert_eq!(collector.received.lock().len(), 1);
        let stats = dispatcher.stats.snapshot();
        assert_eq!(stats.unknown, 1);
        assert_eq!(stats.delivered, 1);
    }

    #[test]
    fn test_garbage_payload_dropped() {
        let (dispatcher, collector) = dispatcher("node-b");
        dispatcher.handle(MembershipEvent::User(UserEvent {
            name: "node-a".to_string(),
            payload: Bytes::from_static(&[0xFF, 0xFF, 0xFF]),
        }));
        assert!(collector.received.lock().is_empty());
        assert_eq!(dispatcher.stats.snapshot().dropped, 1);
    }

    #[test]
    fn test_member_events_maintain_view() {
        let (dispatcher, _) = dispatcher("node-a");
        dispatcher.handle(MembershipEvent::Member(MemberEvent {
            kind: MemberEventKind::Join,
            members: vec![member("node-a"), member("node-b")],
        }));
        assert_eq!(dispatcher.view.read().len(), 2);

        dispatcher.handle(MembershipEvent::Member(MemberEvent {
            kind: MemberEventKind::Failed,
            members: vec![member("node-b")],
        }));
        let view = dispatcher.view.read();
        assert_eq!(view.keys().cloned().collect::<Vec<_>>(), vec!["node-a"]);
    }

    #[tokio::test]
    async fn test_loop_exits_when_queue_closes() {
        let (dispatcher, collector) = dispatcher("node-b");
        let (tx, rx) = mpsc::channel(4);
        let handle = dispatcher.spawn(rx);

        tx.send(publish_event("node-a")).await.unwrap();
        tx.send(MembershipEvent::Unknown {
            kind: 9,
            origin: "node-a".to_string(),
        })
        .await
        .unwrap();
        drop(tx);

        handle.await.unwrap();
        assert_eq!(collector.received.lock().len(), 1);
    }
}
