//! Durable consensus stores
//!
//! The log and the stable store are separate fjall keyspaces so each can
//! be flushed on its own. Snapshots are plain files.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};
use tracing::debug;

use super::{ConsensusError, LogEntry, Result};

fn serialize<T: bincode::Encode>(value: &T) -> Result<Vec<u8>> {
    bincode::encode_to_vec(value, bincode::config::standard()).map_err(ConsensusError::from)
}

fn deserialize<T: bincode::Decode<()>>(bytes: &[u8]) -> Result<T> {
    bincode::decode_from_slice(bytes, bincode::config::standard())
        .map(|(value, _)| value)
        .map_err(ConsensusError::from)
}

fn index_key(index: u64) -> Vec<u8> {
    index.to_be_bytes().to_vec()
}

fn key_index(key: &[u8]) -> Result<u64> {
    <[u8; 8]>::try_from(key)
        .map(u64::from_be_bytes)
        .map_err(|_| ConsensusError::Decode(format!("bad log key of {} bytes", key.len())))
}

/// Log entries keyed by big-endian index
pub struct LogStore {
    keyspace: Keyspace,
    entries: PartitionHandle,
}

impl LogStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let keyspace = Config::new(path).open()?;
        let entries = keyspace.open_partition("entries", PartitionCreateOptions::default())?;
        Ok(Self { keyspace, entries })
    }

    /// 0 when empty
    pub fn first_index(&self) -> Result<u64> {
        match self.entries.first_key_value()? {
            Some((key, _)) => key_index(&key),
            None => Ok(0),
        }
    }

    /// 0 when empty
    pub fn last_index(&self) -> Result<u64> {
        match self.entries.last_key_value()? {
            Some((key, _)) => key_index(&key),
            None => Ok(0),
        }
    }

    pub fn get(&self, index: u64) -> Result<Option<LogEntry>> {
        match self.entries.get(index_key(index))? {
            Some(bytes) => Ok(Some(deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn append(&self, entries: &[LogEntry]) -> Result<()> {
        let mut batch = self.keyspace.batch();
        for entry in entries {
            batch.insert(&self.entries, index_key(entry.index), serialize(entry)?);
        }
        batch.commit()?;
        Ok(())
    }

    /// Remove entries with `min <= index <= max`
    pub fn delete_range(&self, min: u64, max: u64) -> Result<()> {
        let mut batch = self.keyspace.batch();
        for index in min..=max {
            batch.remove(&self.entries, index_key(index));
        }
        batch.commit()?;
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.keyspace.persist(PersistMode::SyncAll)?;
        Ok(())
    }
}

/// Small key-value store for terms, votes and configuration
pub struct StableStore {
    keyspace: Keyspace,
    values: PartitionHandle,
}

impl StableStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let keyspace = Config::new(path).open()?;
        let values = keyspace.open_partition("stable", PartitionCreateOptions::default())?;
        Ok(Self { keyspace, values })
    }

    pub fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        self.values.insert(key, value)?;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.values.get(key)?.map(|v| v.to_vec()))
    }

    pub fn set_u64(&self, key: &str, value: u64) -> Result<()> {
        self.set(key, &value.to_be_bytes())
    }

    pub fn get_u64(&self, key: &str) -> Result<Option<u64>> {
        self.get(key)?.map(|bytes| key_index(&bytes)).transpose()
    }

    pub fn set_encoded<T: bincode::Encode>(&self, key: &str, value: &T) -> Result<()> {
        self.set(key, &serialize(value)?)
    }

    pub fn get_decoded<T: bincode::Decode<()>>(&self, key: &str) -> Result<Option<T>> {
        self.get(key)?.map(|bytes| deserialize(&bytes)).transpose()
    }

    pub fn flush(&self) -> Result<()> {
        self.keyspace.persist(PersistMode::SyncAll)?;
        Ok(())
    }
}

/// Snapshot files named so that lexical order is (term, index) order
pub struct SnapshotStore {
    dir: PathBuf,
    retain: usize,
}

impl SnapshotStore {
    pub const DEFAULT_RETAIN: usize = 2;

    pub fn open(dir: PathBuf, retain: usize) -> Result<Self> {
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            retain: retain.max(1),
        })
    }

    fn list(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "snap") {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// Write a snapshot through `fill`, then prune old ones
    pub fn write<F>(&self, term: u64, index: u64, fill: F) -> Result<PathBuf>
    where
        F: FnOnce(&mut dyn Write) -> Result<()>,
    {
        let name = format!("snapshot-{:020}-{:020}", term, index);
        let tmp = self.dir.join(format!("{}.tmp", name));
        let path = self.dir.join(format!("{}.snap", name));

        {
            let mut sink = BufWriter::new(File::create(&tmp)?);
            fill(&mut sink)?;
            sink.flush()?;
        }
        fs::rename(&tmp, &path)?;

        let files = self.list()?;
        if files.len() > self.retain {
            for old in &files[..files.len() - self.retain] {
                debug!("Pruning snapshot {}", old.display());
                fs::remove_file(old)?;
            }
        }
        Ok(path)
    }

    pub fn open_latest(&self) -> Result<Option<BufReader<File>>> {
        match self.list()?.pop() {
            Some(path) => Ok(Some(BufReader::new(File::open(path)?))),
            None => Ok(None),
        }
    }

    pub fn count(&self) -> Result<usize> {
        Ok(self.list()?.len())
    }
}
