//! tarpc client utilities: connect helpers, retry, and connection pools for
//! the Control Plane's address cache and the Shard Manager's data-node
//! connections.

use crate::rpc::protocol::{ControlPlaneRpcClient, DataPlaneRpcClient, ShardManagerRpcClient};
use kq_core::CONTROL_RPC_DEADLINE;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tarpc::client::Config;
use tarpc::context::Context;
use tokio::sync::RwLock;
use tokio_serde::formats::Bincode;
use tracing::{debug, info, warn};

const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;
const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_DELAY_MS: u64 = 500;

/// Tuning knobs for [`connect_to_shard_manager_with_retry`].
///
/// # Example
///
/// ```rust,ignore
/// let config = ClientConfig {
///     retry_attempts: 5,
///     ..ClientConfig::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub connect_timeout: Duration,
    pub retry_attempts: u32,
    pub retry_delay: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
        }
    }
}

/// Build a tarpc call context carrying this system's outbound RPC
/// deadline.
///
/// Every client call in this crate goes through this helper rather than
/// `tarpc::context::current()` directly, so every outbound call shares the
/// same deadline regardless of which plane issues it.
pub fn deadline_context() -> Context {
    let mut ctx = tarpc::context::current();
    ctx.deadline = std::time::SystemTime::now() + CONTROL_RPC_DEADLINE;
    ctx
}

/// Open a single connection to a Shard Manager.
///
/// # Arguments
///
/// * `addr` - the Shard Manager's listen address
///
/// # Errors
///
/// Returns the underlying `std::io::Error` if the TCP connection cannot be
/// established.
pub async fn connect_to_shard_manager(
    addr: SocketAddr,
) -> Result<ShardManagerRpcClient, std::io::Error> {
    debug!("connecting to shard manager at {}", addr);
    let transport = tarpc::serde_transport::tcp::connect(addr, Bincode::default).await?;
    let client = ShardManagerRpcClient::new(Config::default(), transport).spawn();
    info!("connected to shard manager at {}", addr);
    Ok(client)
}

/// Open a single connection to a data-plane node.
///
/// # Arguments
///
/// * `addr` - the data node's listen address
///
/// # Errors
///
/// Returns the underlying `std::io::Error` if the TCP connection cannot be
/// established.
pub async fn connect_to_data_plane(
    addr: SocketAddr,
) -> Result<DataPlaneRpcClient, std::io::Error> {
    debug!("connecting to data plane node at {}", addr);
    let transport = tarpc::serde_transport::tcp::connect(addr, Bincode::default).await?;
    let client = DataPlaneRpcClient::new(Config::default(), transport).spawn();
    info!("connected to data plane node at {}", addr);
    Ok(client)
}

/// Open a single connection to the Control Plane.
///
/// # Arguments
///
/// * `addr` - the Control Plane's listen address
///
/// # Errors
///
/// Returns the underlying `std::io::Error` if the TCP connection cannot be
/// established.
pub async fn connect_to_control_plane(
    addr: SocketAddr,
) -> Result<ControlPlaneRpcClient, std::io::Error> {
    debug!("connecting to control plane at {}", addr);
    let transport = tarpc::serde_transport::tcp::connect(addr, Bincode::default).await?;
    let client = ControlPlaneRpcClient::new(Config::default(), transport).spawn();
    info!("connected to control plane at {}", addr);
    Ok(client)
}

/// Connect to a Shard Manager, retrying with a fixed delay between
/// attempts up to `config.retry_attempts` times.
///
/// Used on process startup, where the Shard Manager and a data node may
/// race each other up.
///
/// # Arguments
///
/// * `addr` - the Shard Manager's listen address
/// * `config` - retry/backoff tuning, see [`ClientConfig`]
///
/// # Errors
///
/// Returns the last connection or timeout error once every attempt is
/// exhausted.
pub async fn connect_to_shard_manager_with_retry(
    addr: SocketAddr,
    config: &ClientConfig,
) -> Result<ShardManagerRpcClient, std::io::Error> {
    let mut last_err = None;
    for attempt in 0..config.retry_attempts {
        match tokio::time::timeout(config.connect_timeout, connect_to_shard_manager(addr)).await {
            Ok(Ok(client)) => return Ok(client),
            Ok(Err(e)) => last_err = Some(e),
            Err(_) => {
                last_err = Some(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "connect timed out",
                ))
            }
        }
        warn!(attempt, "retrying shard manager connection to {}", addr);
        tokio::time::sleep(config.retry_delay).await;
    }
    Err(last_err.unwrap_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::Other, "exhausted retry attempts")
    }))
}

/// Lazy-connect cache of data-plane clients keyed by address, used by the
/// Shard Manager / Control Plane so repeat calls to the same node reuse
/// the connection. A stale client is dropped via `invalidate` and
/// re-established on next use.
#[derive(Clone, Default)]
pub struct DataPlaneClientPool {
    clients: Arc<RwLock<HashMap<String, DataPlaneRpcClient>>>,
}

impl DataPlaneClientPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached client for `address`, connecting and caching one
    /// if none exists yet.
    ///
    /// # Arguments
    ///
    /// * `address` - the data node's listen address, as a string (parsed
    ///   on a cache miss)
    ///
    /// # Errors
    ///
    /// Returns an error if `address` doesn't parse as a socket address, or
    /// if the connection attempt fails.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let client = pool.get_or_connect("127.0.0.1:9002").await?;
    /// ```
    pub async fn get_or_connect(
        &self,
        address: &str,
    ) -> Result<DataPlaneRpcClient, std::io::Error> {
        if let Some(client) = self.clients.read().await.get(address) {
            return Ok(client.clone());
        }
        let addr: SocketAddr = address
            .parse()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("{e}")))?;
        let client = connect_to_data_plane(addr).await?;
        self.clients
            .write()
            .await
            .insert(address.to_string(), client.clone());
        Ok(client)
    }

    /// Drop the cached client for `address`, if any, forcing the next
    /// `get_or_connect` to reconnect. Callers use this after an RPC to
    /// that node fails with a connection-level error.
    pub async fn invalidate(&self, address: &str) {
        self.clients.write().await.remove(address);
    }

    /// Number of connections currently cached, used by tests and by
    /// diagnostics to confirm the pool isn't growing unbounded.
    pub async fn cached_connection_count(&self) -> usize {
        self.clients.read().await.len()
    }
}
