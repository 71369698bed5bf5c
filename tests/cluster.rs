//! Cluster Integration Tests
//!
//! Two broker nodes, each with a cluster agent and the cluster hook
//! installed, exchanging PUBLISH packets end to end.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use pretty_assertions::assert_eq;
use tokio::sync::mpsc;
use tokio::time::timeout;

use vibemq_cluster::broker::{Delivery, LocalBroker, Origin};
use vibemq_cluster::cluster::{
    Agent, ClusterHooks, GossipLauncher, LocalNetwork, MembershipLauncher,
};
use vibemq_cluster::config::ClusterConfig;
use vibemq_cluster::hooks::ClientInfo;
use vibemq_cluster::protocol::{Connect, Publish, QoS, Subscribe, Subscription, Will};

// Atomic port counter to avoid port conflicts between tests
static PORT_COUNTER: AtomicU16 = AtomicU16::new(28_100);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

fn node_config(name: &str, port: u16) -> ClusterConfig {
    ClusterConfig {
        node_name: name.to_string(),
        bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
        bind_port: port,
        gossip_interval_ms: 50,
        drain_timeout: 1,
        ..Default::default()
    }
}

struct Node {
    broker: Arc<LocalBroker>,
    agent: Arc<Agent>,
}

impl Node {
    async fn start(config: ClusterConfig, launcher: &dyn MembershipLauncher) -> Self {
        let broker = Arc::new(LocalBroker::new(64));
        let agent = Agent::bootstrap(config, broker.clone(), launcher)
            .await
            .expect("bootstrap");
        broker
            .add_hook(ClusterHooks::init(Some(agent.clone())).expect("hook"))
            .await;
        Self { broker, agent }
    }

    async fn client(&self, id: &str, will: Option<Will>) -> (ClientInfo, mpsc::Receiver<Delivery>) {
        self.broker
            .connect(Connect {
                client_id: id.to_string(),
                will,
                ..Default::default()
            })
            .await
            .expect("connect")
    }

    async fn subscribe(&self, client: &ClientInfo, filter: &str) {
        self.broker
            .subscribe(
                client,
                Subscribe {
                    packet_id: 1,
                    subscriptions: vec![Subscription {
                        filter: filter.to_string(),
                        qos: QoS::ExactlyOnce,
                    }],
                },
            )
            .await
            .expect("subscribe");
    }
}

fn temp_reading() -> Publish {
    Publish {
        qos: QoS::AtLeastOnce,
        topic: "sensors/temp".into(),
        packet_id: Some(1),
        payload: Bytes::from_static(&[0x17]),
        ..Default::default()
    }
}

async fn recv(rx: &mut mpsc::Receiver<Delivery>) -> Delivery {
    timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("timed out waiting for delivery")
        .expect("channel closed")
}

#[tokio::test]
async fn test_publish_crosses_nodes_once() {
    let network = LocalNetwork::new();
    let a = Node::start(node_config("node-a", next_port()), &network).await;
    let mut cfg_b = node_config("node-b", next_port());
    cfg_b.members = vec!["node-a".to_string()];
    let b = Node::start(cfg_b, &network).await;

    let (local_sub, mut local_rx) = a.client("local-sub", None).await;
    a.subscribe(&local_sub, "sensors/#").await;
    let (remote_sub, mut remote_rx) = b.client("remote-sub", None).await;
    b.subscribe(&remote_sub, "sensors/+").await;

    let (publisher, _) = a.client("c1", None).await;
    a.broker.publish(&publisher, temp_reading()).await.unwrap();

    let remote = recv(&mut remote_rx).await;
    assert_eq!(&*remote.topic, "sensors/temp");
    assert_eq!(remote.payload, Bytes::from_static(&[0x17]));
    assert_eq!(remote.qos, QoS::AtLeastOnce);
    assert_eq!(
        remote.origin,
        Origin::Cluster {
            node_id: "node-a".to_string(),
            client_id: "c1".to_string()
        }
    );

    let local = recv(&mut local_rx).await;
    assert_eq!(
        local.origin,
        Origin::Local {
            client_id: "c1".to_string()
        }
    );

    // node-a saw its own echo and dropped it
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(local_rx.try_recv().is_err());
    assert_eq!(a.agent.dispatch_stats().own, 1);
    assert_eq!(a.agent.dispatch_stats().delivered, 0);
    assert_eq!(b.agent.dispatch_stats().delivered, 1);

    a.agent.shutdown().await;
    b.agent.shutdown().await;
}

#[tokio::test]
async fn test_remote_delivery_is_not_relayed_back() {
    let network = LocalNetwork::new();
    let a = Node::start(node_config("node-a", next_port()), &network).await;
    let b = Node::start(node_config("node-b", next_port()), &network).await;

    let (sub_b, mut rx_b) = b.client("sub", None).await;
    b.subscribe(&sub_b, "#").await;

    let (publisher, _) = a.client("c1", None).await;
    a.broker.publish(&publisher, temp_reading()).await.unwrap();
    recv(&mut rx_b).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    // a: own echo only; b: one delivery and nothing it sent itself
    assert_eq!(a.agent.dispatch_stats().delivered, 0);
    assert_eq!(b.agent.dispatch_stats().own, 0);
}

#[tokio::test]
async fn test_will_reaches_other_node() {
    let network = LocalNetwork::new();
    let a = Node::start(node_config("node-a", next_port()), &network).await;
    let b = Node::start(node_config("node-b", next_port()), &network).await;

    let (watcher, mut rx) = b.client("watcher", None).await;
    b.subscribe(&watcher, "clients/+/status").await;

    let will = Will {
        topic: "clients/c1/status".to_string(),
        payload: Bytes::from_static(b"offline"),
        qos: QoS::AtMostOnce,
        retain: true,
        properties: Default::default(),
    };
    a.client("c1", Some(will)).await;
    a.broker.disconnect("c1", false).await;

    let delivery = recv(&mut rx).await;
    assert_eq!(&*delivery.topic, "clients/c1/status");
    assert!(delivery.retain);
}

#[tokio::test]
async fn test_departed_node_leaves_member_view() {
    let network = LocalNetwork::new();
    let a = Node::start(node_config("node-a", next_port()), &network).await;
    let b = Node::start(node_config("node-b", next_port()), &network).await;

    for _ in 0..200 {
        if a.agent.member_view().len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(a.agent.members().await.len(), 2);

    b.agent.shutdown().await;
    for _ in 0..200 {
        if a.agent.member_view().len() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let names: Vec<String> = a.agent.member_view().into_iter().map(|m| m.name).collect();
    assert_eq!(names, vec!["node-a".to_string()]);
}

#[tokio::test]
async fn test_gossip_nodes_exchange_publish() {
    let port_a = next_port();
    let a = Node::start(node_config("gossip-a", port_a), &GossipLauncher).await;
    let mut cfg_b = node_config("gossip-b", next_port());
    cfg_b.members = vec![format!("127.0.0.1:{}", port_a)];
    let b = Node::start(cfg_b, &GossipLauncher).await;

    // Both sides must see each other before events flow
    timeout(Duration::from_secs(10), async {
        while a.agent.member_view().len() < 2 || b.agent.member_view().len() < 2 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("gossip did not converge");

    let (sub, mut rx) = b.client("sub", None).await;
    b.subscribe(&sub, "sensors/temp").await;
    let (publisher, _) = a.client("c1", None).await;
    a.broker.publish(&publisher, temp_reading()).await.unwrap();

    let delivery = recv(&mut rx).await;
    assert_eq!(delivery.payload, Bytes::from_static(&[0x17]));

    a.agent.shutdown().await;
    b.agent.shutdown().await;
}
