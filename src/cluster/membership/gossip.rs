//! Gossip membership over chitchat
//!
//! Each node publishes its status and tags as chitchat key-values. User
//! events and queries travel in batches: every record published within one
//! gossip interval is appended to the open batch, batch `seq` is stored
//! under `__ev:{seq % window}` and `__seq` holds the newest batch number.
//! The ring therefore spans `event-window` gossip rounds rather than
//! `event-window` events.
//!
//! A slot written less than two gossip intervals ago is never reused; the
//! publish fails with a retryable [`MembershipError::Broadcast`] instead. A
//! reader that still falls more than `event-window` batches behind loses
//! the overwritten batches, which is logged and counted as missed.
//!
//! Liveness comes from chitchat's failure detector. A peer it declares dead
//! is reported `failed` (or `left` once it announced leaving) and keeps
//! that status in [`Membership::members`] until it is garbage collected.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bincode::{Decode, Encode};
use bytes::Bytes;
use chitchat::transport::UdpTransport;
use chitchat::{
    spawn_chitchat, Chitchat, ChitchatConfig, ChitchatHandle, ChitchatId, FailureDetectorConfig,
    NodeState,
};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::{
    Member, MemberEvent, MemberEventKind, MemberStatus, Membership, MembershipError,
    MembershipEvent, MembershipLauncher, QueryEvent, UserEvent,
};
use crate::config::ClusterConfig;

const KEY_STATUS: &str = "__status";
const KEY_TAGS: &str = "__tags";
const KEY_EVENT_SEQ: &str = "__seq";

const RECORD_USER_EVENT: u8 = 1;
const RECORD_QUERY: u8 = 2;

/// Largest payload a single gossip record may carry
pub const MAX_RECORD_PAYLOAD: usize = 16 * 1024;

/// Encoded size at which the open batch is sealed. Hex doubles it on the
/// wire, which must still fit one UDP datagram.
const MAX_BATCH_BYTES: usize = 24 * 1024;

fn slot_key(seq: u64, window: u64) -> String {
    format!("__ev:{}", seq % window)
}

#[derive(Debug, Clone, Encode, Decode)]
struct GossipRecord {
    kind: u8,
    name: String,
    payload: Vec<u8>,
}

impl GossipRecord {
    fn into_event(self, origin: &str) -> MembershipEvent {
        match self.kind {
            RECORD_USER_EVENT => MembershipEvent::User(UserEvent {
                name: self.name,
                payload: Bytes::from(self.payload),
            }),
            RECORD_QUERY => MembershipEvent::Query(QueryEvent {
                name: self.name,
                payload: Bytes::from(self.payload),
                origin: origin.to_string(),
            }),
            kind => MembershipEvent::Unknown {
                kind,
                origin: origin.to_string(),
            },
        }
    }
}

#[derive(Debug, Encode, Decode)]
struct GossipBatch {
    seq: u64,
    records: Vec<GossipRecord>,
}

impl GossipBatch {
    fn encode(&self) -> Result<Vec<u8>, MembershipError> {
        bincode::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| MembershipError::Broadcast(e.to_string()))
    }

    fn decode_hex(value: &str) -> Result<Self, String> {
        let bytes = hex::decode(value).map_err(|e| e.to_string())?;
        let (batch, _) = bincode::decode_from_slice(&bytes, bincode::config::standard())
            .map_err(|e| e.to_string())?;
        Ok(batch)
    }
}

/// Slot update produced by [`BatchWriter::append`]
#[derive(Debug)]
struct Staged {
    key: String,
    value: String,
    /// Set when the record opened a new batch
    head: Option<u64>,
}

struct OpenBatch {
    batch: GossipBatch,
    opened_at: Instant,
}

/// Write side of the local event ring
struct BatchWriter {
    window: u64,
    interval: Duration,
    open: Option<OpenBatch>,
    written_at: Vec<Option<Instant>>,
}

impl BatchWriter {
    fn new(window: u64, interval: Duration) -> Self {
        Self {
            window,
            interval,
            open: None,
            written_at: vec![None; window as usize],
        }
    }

    /// Add `record` to the open batch, or open batch `head + 1` when the
    /// current one is a gossip interval old or full.
    fn append(
        &mut self,
        head: u64,
        record: GossipRecord,
        now: Instant,
    ) -> Result<Staged, MembershipError> {
        if let Some(open) = self.open.as_mut() {
            if open.batch.seq == head && now.duration_since(open.opened_at) < self.interval {
                open.batch.records.push(record.clone());
                match open.batch.encode() {
                    Ok(encoded) if encoded.len() <= MAX_BATCH_BYTES => {
                        let seq = open.batch.seq;
                        return Ok(self.stage(seq, &encoded, false, now));
                    }
                    Ok(_) => {
                        open.batch.records.pop();
                    }
                    Err(e) => {
                        open.batch.records.pop();
                        return Err(e);
                    }
                }
            }
        }

        let seq = head + 1;
        if let Some(written) = self.written_at[(seq % self.window) as usize] {
            if now.duration_since(written) < self.interval * 2 {
                return Err(MembershipError::Broadcast(format!(
                    "all {} event slots written in the last two gossip rounds",
                    self.window
                )));
            }
        }

        let batch = GossipBatch {
            seq,
            records: vec![record],
        };
        let encoded = batch.encode()?;
        self.open = Some(OpenBatch {
            batch,
            opened_at: now,
        });
        Ok(self.stage(seq, &encoded, true, now))
    }

    fn stage(&mut self, seq: u64, encoded: &[u8], opened: bool, now: Instant) -> Staged {
        self.written_at[(seq % self.window) as usize] = Some(now);
        Staged {
            key: slot_key(seq, self.window),
            value: hex::encode(encoded),
            head: opened.then_some(seq),
        }
    }
}

fn member_from_state(node_state: &NodeState) -> Member {
    let id = node_state.chitchat_id();
    let tags = node_state
        .get(KEY_TAGS)
        .and_then(|json| serde_json::from_str(json).ok())
        .unwrap_or_default();
    let status = node_state
        .get(KEY_STATUS)
        .and_then(MemberStatus::parse)
        .unwrap_or(MemberStatus::Alive);

    Member {
        name: id.node_id.clone(),
        addr: id.gossip_advertise_addr,
        tags,
        status,
    }
}

/// Member with the failure detector's verdict applied
fn observed_member(node_state: &NodeState, dead: bool) -> Member {
    let mut member = member_from_state(node_state);
    if dead {
        member.status = match member.status {
            MemberStatus::Leaving | MemberStatus::Left => MemberStatus::Left,
            _ => MemberStatus::Failed,
        };
    }
    member
}

fn head_seq(node_state: &NodeState) -> u64 {
    node_state
        .get(KEY_EVENT_SEQ)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

/// Number of records batch `seq` currently holds in `node_state`
fn visible_records(node_state: &NodeState, seq: u64, window: u64) -> usize {
    node_state
        .get(&slot_key(seq, window))
        .and_then(|value| GossipBatch::decode_hex(value).ok())
        .filter(|batch| batch.seq == seq)
        .map_or(0, |batch| batch.records.len())
}

/// Launches [`GossipMembership`]
#[derive(Debug, Clone, Copy, Default)]
pub struct GossipLauncher;

#[async_trait]
impl MembershipLauncher for GossipLauncher {
    async fn launch(
        &self,
        config: &ClusterConfig,
        events: mpsc::Sender<MembershipEvent>,
    ) -> Result<Arc<dyn Membership>, MembershipError> {
        Ok(Arc::new(GossipMembership::start(config, events).await?))
    }
}

pub struct GossipMembership {
    name: String,
    gossip_interval: Duration,
    chitchat: Arc<Mutex<Chitchat>>,
    writer: parking_lot::Mutex<BatchWriter>,
    handle: Mutex<Option<ChitchatHandle>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
    stop: watch::Sender<bool>,
}

impl GossipMembership {
    pub async fn start(
        config: &ClusterConfig,
        events: mpsc::Sender<MembershipEvent>,
    ) -> Result<Self, MembershipError> {
        let listen_addr = config.listen_addr();
        let advertise_addr = config.gossip_advertise_addr();

        info!(
            "Starting cluster node: {} (listen={}, advertise={})",
            config.node_name, listen_addr, advertise_addr
        );

        if !config.members.is_empty() {
            resolve_seeds(&config.members).await?;
        }

        // Generation lets peers tell a restarted node from its old self
        let generation = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let chitchat_id = ChitchatId::new(config.node_name.clone(), generation, advertise_addr);

        let failure_detector_config = FailureDetectorConfig {
            phi_threshold: 8.0,
            initial_interval: config.gossip_interval(),
            dead_node_grace_period: config.dead_node_grace_period_duration(),
            ..Default::default()
        };

        let chitchat_config = ChitchatConfig {
            chitchat_id: chitchat_id.clone(),
            cluster_id: config.cluster_id.clone(),
            gossip_interval: config.gossip_interval(),
            listen_addr,
            seed_nodes: config.members.clone(),
            failure_detector_config,
            marked_for_deletion_grace_period: config.dead_node_grace_period_duration(),
            catchup_callback: None,
            extra_liveness_predicate: None,
        };

        let tags = serde_json::to_string(&config.tags)
            .map_err(|e| MembershipError::Bind(e.to_string()))?;
        let initial_kvs = vec![
            (KEY_STATUS.to_string(), MemberStatus::Alive.as_str().to_string()),
            (KEY_TAGS.to_string(), tags),
            (KEY_EVENT_SEQ.to_string(), "0".to_string()),
        ];

        let handle = spawn_chitchat(chitchat_config, initial_kvs, &UdpTransport)
            .await
            .map_err(|e| MembershipError::Bind(format!("{}: {}", listen_addr, e)))?;
        let chitchat = handle.chitchat();

        let window = config.event_window.max(1) as u64;
        let (stop, stop_rx) = watch::channel(false);
        let watcher = tokio::spawn(watch_cluster(
            chitchat.clone(),
            chitchat_id,
            window,
            config.gossip_interval(),
            events,
            stop_rx,
        ));

        Ok(Self {
            name: config.node_name.clone(),
            gossip_interval: config.gossip_interval(),
            chitchat,
            writer: parking_lot::Mutex::new(BatchWriter::new(window, config.gossip_interval())),
            handle: Mutex::new(Some(handle)),
            watcher: Mutex::new(Some(watcher)),
            stop,
        })
    }

    async fn publish_record(&self, kind: u8, name: &str, payload: Bytes) -> Result<(), MembershipError> {
        if payload.len() > MAX_RECORD_PAYLOAD {
            return Err(MembershipError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_RECORD_PAYLOAD,
            });
        }
        if self.handle.lock().await.is_none() {
            return Err(MembershipError::NotRunning);
        }

        let record = GossipRecord {
            kind,
            name: name.to_string(),
            payload: payload.to_vec(),
        };

        // The head only moves under the chitchat lock, so it never goes
        // backwards. The slot is written before `__seq` so a peer that sees
        // a new head already has its batch.
        let mut cc = self.chitchat.lock().await;
        let state = cc.self_node_state();
        let staged = self.writer.lock().append(head_seq(state), record, Instant::now())?;
        state.set(staged.key, staged.value);
        if let Some(seq) = staged.head {
            state.set(KEY_EVENT_SEQ, seq);
            trace!("gossip batch {} opened", seq);
        }
        Ok(())
    }
}

async fn resolve_seeds(seeds: &[String]) -> Result<(), MembershipError> {
    let mut resolved = 0;
    for seed in seeds {
        match tokio::net::lookup_host(seed.as_str()).await {
            Ok(mut addrs) => {
                if addrs.next().is_some() {
                    resolved += 1;
                } else {
                    warn!("Cluster member {} resolved to no addresses", seed);
                }
            }
            Err(e) => warn!("Cannot resolve cluster member {}: {}", seed, e),
        }
    }
    if resolved == 0 {
        return Err(MembershipError::Join(format!(
            "none of {} configured members resolved",
            seeds.len()
        )));
    }
    Ok(())
}

#[async_trait]
impl Membership for GossipMembership {
    fn local_name(&self) -> &str {
        &self.name
    }

    async fn members(&self) -> Vec<Member> {
        let cc = self.chitchat.lock().await;
        let dead: HashSet<&ChitchatId> = cc.dead_nodes().collect();
        let members = cc
            .node_states()
            .values()
            .map(|state| observed_member(state, dead.contains(state.chitchat_id())))
            .collect();
        members
    }

    async fn user_event(&self, name: &str, payload: Bytes) -> Result<(), MembershipError> {
        self.publish_record(RECORD_USER_EVENT, name, payload).await
    }

    async fn query(&self, name: &str, payload: Bytes) -> Result<(), MembershipError> {
        self.publish_record(RECORD_QUERY, name, payload).await
    }

    async fn leave(&self) -> Result<(), MembershipError> {
        let Some(handle) = self.handle.lock().await.take() else {
            return Err(MembershipError::NotRunning);
        };

        info!("Node {} leaving cluster", self.name);
        self.chitchat
            .lock()
            .await
            .self_node_state()
            .set(KEY_STATUS, MemberStatus::Leaving.as_str());

        // Give peers a couple of rounds to see the status change
        tokio::time::sleep(self.gossip_interval * 2).await;

        let _ = self.stop.send(true);
        if let Some(watcher) = self.watcher.lock().await.take() {
            let _ = watcher.await;
        }

        handle
            .shutdown()
            .await
            .map_err(|e| MembershipError::Shutdown(e.to_string()))
    }
}

/// Read position into one node's event ring
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Position {
    batch: u64,
    consumed: usize,
}

#[derive(Default)]
struct Cursors {
    positions: HashMap<ChitchatId, Position>,
    missed: u64,
}

impl Cursors {
    fn read_new(
        &mut self,
        node_state: &NodeState,
        is_local: bool,
        window: u64,
        out: &mut Vec<MembershipEvent>,
    ) {
        let id = node_state.chitchat_id();
        let node = id.node_id.as_str();
        let head = head_seq(node_state);
        let current = || Position {
            batch: head,
            consumed: visible_records(node_state, head, window),
        };

        // History published before we first saw a peer is not replayed
        let pos = self
            .positions
            .entry(id.clone())
            .or_insert_with(|| if is_local { Position::default() } else { current() });

        if head < pos.batch {
            debug!("Node {} restarted its event sequence", node);
            *pos = current();
            return;
        }

        let (mut seq, mut skip) = if pos.batch == 0 {
            (1, 0)
        } else {
            (pos.batch, pos.consumed)
        };

        let oldest = head.saturating_sub(window) + 1;
        if seq < oldest {
            let lost = oldest - seq;
            self.missed += lost;
            warn!("Missed {} event batches from node {}", lost, node);
            seq = oldest;
            skip = 0;
        }

        let mut next = Position {
            batch: head,
            consumed: 0,
        };
        while seq <= head {
            match node_state
                .get(&slot_key(seq, window))
                .map(GossipBatch::decode_hex)
            {
                Some(Ok(batch)) if batch.seq == seq => {
                    let len = batch.records.len();
                    out.extend(
                        batch
                            .records
                            .into_iter()
                            .skip(skip)
                            .map(|record| record.into_event(node)),
                    );
                    if seq == head {
                        next.consumed = len.max(skip);
                    }
                }
                Some(Ok(_)) => {
                    self.missed += 1;
                    warn!("Event batch {} from node {} was overwritten before delivery", seq, node);
                }
                Some(Err(e)) => {
                    self.missed += 1;
                    warn!("Undecodable event batch {} from node {}: {}", seq, node, e);
                    if seq == head {
                        next.consumed = usize::MAX;
                    }
                }
                None => {
                    debug!("Event batch {} from node {} not replicated yet", seq, node);
                    next = Position {
                        batch: seq,
                        consumed: skip,
                    };
                    break;
                }
            }
            skip = 0;
            seq += 1;
        }
        *pos = next;
    }

    fn forget(&mut self, id: &ChitchatId) {
        self.positions.remove(id);
    }
}

async fn watch_cluster(
    chitchat: Arc<Mutex<Chitchat>>,
    self_id: ChitchatId,
    window: u64,
    interval: Duration,
    events: mpsc::Sender<MembershipEvent>,
    mut stop: watch::Receiver<bool>,
) {
    let mut known: HashMap<ChitchatId, Member> = HashMap::new();
    let mut cursors = Cursors::default();

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = stop.changed() => break,
        }

        let (snapshot, dead) = {
            let cc = chitchat.lock().await;
            let dead: HashSet<ChitchatId> = cc.dead_nodes().cloned().collect();
            (cc.state_snapshot(), dead)
        };

        let observed: Vec<(&NodeState, Member)> = snapshot
            .node_states
            .iter()
            .map(|state| (state, observed_member(state, dead.contains(state.chitchat_id()))))
            .collect();

        // A restarted node is live under a new generation while its old
        // generation dies; the old one is not reported.
        let live_names: HashSet<&str> = observed
            .iter()
            .filter(|(_, member)| !member.status.is_departed())
            .map(|(_, member)| member.name.as_str())
            .collect();

        let mut joined = Vec::new();
        let mut left = Vec::new();
        let mut failed = Vec::new();
        let mut updated = Vec::new();
        let mut records = Vec::new();
        let mut present = HashSet::new();

        for (node_state, member) in &observed {
            let id = node_state.chitchat_id();
            present.insert(id.clone());
            let superseded =
                member.status.is_departed() && live_names.contains(member.name.as_str());

            match known.get(id) {
                None if member.status.is_departed() => {}
                None => {
                    info!("Discovered cluster node {} at {}", member.name, member.addr);
                    joined.push(member.clone());
                }
                Some(prev) if prev.status.is_departed() && !member.status.is_departed() => {
                    info!("Cluster node {} is reachable again", member.name);
                    joined.push(member.clone());
                }
                Some(prev) if prev.status.is_departed() => {}
                Some(_) if superseded => {
                    debug!("Cluster node {} restarted under a new generation", member.name);
                }
                Some(_) if member.status == MemberStatus::Failed => {
                    info!("Cluster node {} failed", member.name);
                    failed.push(member.clone());
                }
                Some(_) if member.status.is_departed() => {
                    info!("Cluster node {} is leaving", member.name);
                    left.push(member.clone());
                }
                Some(prev) if prev != member => updated.push(member.clone()),
                Some(_) => {}
            }

            cursors.read_new(node_state, id == &self_id, window, &mut records);
            known.insert(id.clone(), member.clone());
        }

        let gone: Vec<ChitchatId> = known
            .keys()
            .filter(|id| !present.contains(*id))
            .cloned()
            .collect();
        for id in gone {
            cursors.forget(&id);
            if let Some(mut member) = known.remove(&id) {
                if !member.status.is_departed() && !live_names.contains(member.name.as_str()) {
                    info!("Cluster node {} failed", member.name);
                    member.status = MemberStatus::Failed;
                    failed.push(member);
                }
            }
        }

        let member_events = [
            (MemberEventKind::Join, joined),
            (MemberEventKind::Update, updated),
            (MemberEventKind::Leave, left),
            (MemberEventKind::Failed, failed),
        ]
        .into_iter()
        .filter(|(_, members)| !members.is_empty())
        .map(|(kind, members)| MembershipEvent::Member(MemberEvent { kind, members }));

        for event in member_events.chain(records) {
            if events.send(event).await.is_err() {
                debug!("Event queue closed, gossip watcher exiting");
                return;
            }
        }
    }

    debug!("Gossip watcher stopped ({} event batches missed)", cursors.missed);
}
