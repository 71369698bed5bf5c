//! Consensus transport

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpListener;

use super::{ConsensusError, Result};

/// TCP endpoint reserved for consensus traffic between nodes
pub struct TcpTransport {
    listener: TcpListener,
    local_addr: SocketAddr,
    max_pool: usize,
    timeout: Duration,
}

impl TcpTransport {
    pub const DEFAULT_MAX_POOL: usize = 2;
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ConsensusError::Transport(format!("bind {}: {}", addr, e)))?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
            max_pool: Self::DEFAULT_MAX_POOL,
            timeout: Self::DEFAULT_TIMEOUT,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Outbound connections kept per peer
    pub fn max_pool(&self) -> usize {
        self.max_pool
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn listener(&self) -> &TcpListener {
        &self.listener
    }
}
