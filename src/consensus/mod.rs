//! Consensus log
//!
//! A replicated-log scaffold kept next to the gossip path. Commands are
//! appended to a durable fjall log and applied to a [`StateMachine`]; the
//! only state machine shipped is [`NoopStateMachine`], and no entries are
//! replicated to other nodes yet. The agent does not start this on its own.

mod store;
mod transport;

use std::fmt;
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use bincode::{Decode, Encode};
use bytes::Bytes;
use tracing::{debug, info};

use crate::config::ClusterConfig;

pub use store::{LogStore, SnapshotStore, StableStore};
pub use transport::TcpTransport;

#[derive(Debug)]
pub enum ConsensusError {
    Io(std::io::Error),
    Storage(String),
    Encode(String),
    Decode(String),
    Transport(String),
}

impl fmt::Display for ConsensusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "IO error: {}", e),
            Self::Storage(e) => write!(f, "storage error: {}", e),
            Self::Encode(e) => write!(f, "encode error: {}", e),
            Self::Decode(e) => write!(f, "decode error: {}", e),
            Self::Transport(e) => write!(f, "transport error: {}", e),
        }
    }
}

impl std::error::Error for ConsensusError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ConsensusError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<fjall::Error> for ConsensusError {
    fn from(err: fjall::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<bincode::error::EncodeError> for ConsensusError {
    fn from(err: bincode::error::EncodeError) -> Self {
        Self::Encode(err.to_string())
    }
}

impl From<bincode::error::DecodeError> for ConsensusError {
    fn from(err: bincode::error::DecodeError) -> Self {
        Self::Decode(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ConsensusError>;

/// One command in the log
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub command: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct ServerEntry {
    pub id: String,
    pub address: String,
}

/// Voting membership of the log
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct Configuration {
    pub servers: Vec<ServerEntry>,
}

/// Point-in-time copy of state machine contents
pub trait StateSnapshot: Send {
    fn persist(&self, sink: &mut dyn Write) -> Result<()>;

    fn release(&mut self) {}
}

/// Deterministic consumer of committed log entries
pub trait StateMachine: Send + Sync {
    fn apply(&self, entry: &LogEntry) -> Option<Bytes>;

    /// `None` when there is nothing worth snapshotting
    fn snapshot(&self) -> Result<Option<Box<dyn StateSnapshot>>>;

    fn restore(&self, source: &mut dyn Read) -> Result<()>;
}

/// Accepts every entry and keeps no state
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopStateMachine;

impl StateMachine for NoopStateMachine {
    fn apply(&self, _entry: &LogEntry) -> Option<Bytes> {
        None
    }

    fn snapshot(&self) -> Result<Option<Box<dyn StateSnapshot>>> {
        Ok(None)
    }

    fn restore(&self, _source: &mut dyn Read) -> Result<()> {
        Ok(())
    }
}

const KEY_CURRENT_TERM: &str = "current_term";
const KEY_CONFIGURATION: &str = "configuration";

pub struct ConsensusLog {
    node_id: String,
    addr: SocketAddr,
    fsm: Arc<dyn StateMachine>,
    logs: LogStore,
    stable: StableStore,
    snapshots: SnapshotStore,
    transport: tokio::sync::Mutex<Option<TcpTransport>>,
    // Serializes index assignment
    append: parking_lot::Mutex<()>,
}

impl ConsensusLog {
    /// Open the stores under `nodes-file-dir`
    pub fn open(config: &ClusterConfig, fsm: Arc<dyn StateMachine>) -> Result<Self> {
        let dir: PathBuf = config.nodes_file_dir.clone();
        std::fs::create_dir_all(&dir)?;

        let logs = LogStore::open(dir.join("raft-log"))?;
        let stable = StableStore::open(dir.join("raft-stable"))?;
        let snapshots = SnapshotStore::open(dir.join("snapshots"), SnapshotStore::DEFAULT_RETAIN)?;

        debug!("Consensus stores opened in {}", dir.display());

        Ok(Self {
            node_id: config.node_name.clone(),
            addr: config.consensus_addr,
            fsm,
            logs,
            stable,
            snapshots,
            transport: tokio::sync::Mutex::new(None),
            append: parking_lot::Mutex::new(()),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Bind the consensus transport; returns the bound address
    pub async fn start(&self) -> Result<SocketAddr> {
        let mut transport = self.transport.lock().await;
        if let Some(t) = transport.as_ref() {
            return Ok(t.local_addr());
        }
        let bound = TcpTransport::bind(self.addr).await?;
        let addr = bound.local_addr();
        info!("Consensus transport for {} listening on {}", self.node_id, addr);
        *transport = Some(bound);
        Ok(addr)
    }

    /// Seed a fresh log with a configuration naming only this node
    ///
    /// Returns `false` if the log already has a configuration.
    pub fn bootstrap_single_node(&self) -> Result<bool> {
        if self.configuration()?.is_some() {
            return Ok(false);
        }

        let configuration = Configuration {
            servers: vec![ServerEntry {
                id: self.node_id.clone(),
                address: self.addr.to_string(),
            }],
        };
        self.stable.set_encoded(KEY_CONFIGURATION, &configuration)?;
        self.stable.set_u64(KEY_CURRENT_TERM, 1)?;
        info!("Bootstrapped single-node consensus for {}", self.node_id);
        Ok(true)
    }

    pub fn configuration(&self) -> Result<Option<Configuration>> {
        self.stable.get_decoded(KEY_CONFIGURATION)
    }

    pub fn current_term(&self) -> Result<u64> {
        Ok(self.stable.get_u64(KEY_CURRENT_TERM)?.unwrap_or(0))
    }

    pub fn last_index(&self) -> Result<u64> {
        self.logs.last_index()
    }

    pub fn entry(&self, index: u64) -> Result<Option<LogEntry>> {
        self.logs.get(index)
    }

    /// Append a command and apply it; returns its log index
    pub fn apply(&self, command: Bytes) -> Result<u64> {
        let _guard = self.append.lock();
        let entry = LogEntry {
            index: self.logs.last_index()? + 1,
            term: self.current_term()?.max(1),
            command: command.to_vec(),
        };
        self.logs.append(std::slice::from_ref(&entry))?;
        self.fsm.apply(&entry);
        Ok(entry.index)
    }

    /// Snapshot the state machine; `None` if it had nothing to save
    pub fn snapshot(&self) -> Result<Option<PathBuf>> {
        let Some(mut snapshot) = self.fsm.snapshot()? else {
            return Ok(None);
        };
        let index = self.last_index()?;
        let term = self.current_term()?;
        let path = self
            .snapshots
            .write(term, index, |sink| snapshot.persist(sink));
        snapshot.release();
        path.map(Some)
    }

    /// Restore the state machine from the newest snapshot
    pub fn restore_latest(&self) -> Result<bool> {
        let Some(mut reader) = self.snapshots.open_latest()? else {
            return Ok(false);
        };
        self.fsm.restore(&mut reader)?;
        Ok(true)
    }

    /// Flush both stores to disk
    pub fn close(&self) -> Result<()> {
        self.logs.flush()?;
        self.stable.flush()
    }
}
