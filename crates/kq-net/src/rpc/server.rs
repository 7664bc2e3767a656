//! tarpc server implementations: each wraps the corresponding in-process
//! component and exposes it to the network.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kq_core::{LockId, QueueItem, ShardId};
use tarpc::context::Context;
use tarpc::server::{self, Channel};
use tokio_serde::formats::Bincode;
use tracing::{debug, error, info, instrument};

use crate::control_plane::ControlPlane;
use crate::data_plane::DataPlane;
use crate::rpc::protocol::{
    ControlPlaneRpc, DataPlaneRpc, RpcError, RpcResult, ShardDescriptor, ShardManagerRpc,
};
use crate::shard_manager::ShardManager;

fn to_wire(d: crate::shard_manager::ShardDescriptor) -> ShardDescriptor {
    ShardDescriptor {
        shard_id: d.shard_id,
        leader_address: d.leader_address,
        internal_address: d.internal_address,
        is_new: d.is_new,
    }
}

/// Network-facing wrapper around a [`ShardManager`], one instance per
/// listening socket.
///
/// # Thread Safety
///
/// `Clone` is cheap: the inner `Arc<ShardManager>` is shared across every
/// concurrently served connection, so state mutated by one RPC is visible
/// to the next.
#[derive(Clone)]
pub struct ShardManagerServer {
    manager: Arc<ShardManager>,
}

impl ShardManagerServer {
    /// Wrap an existing [`ShardManager`] for serving.
    ///
    /// # Arguments
    ///
    /// * `manager` - the shard registry this server exposes over RPC
    pub fn new(manager: Arc<ShardManager>) -> Self {
        Self { manager }
    }

    /// Bind `addr` and serve incoming connections until the process exits.
    ///
    /// # Arguments
    ///
    /// * `addr` - the socket address to listen on
    ///
    /// # Errors
    ///
    /// Returns the `std::io::Error` from binding the listener; individual
    /// connection failures are logged and skipped rather than propagated.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// ShardManagerServer::new(manager).start(addr).await?;
    /// ```
    pub async fn start(self, addr: SocketAddr) -> Result<(), std::io::Error> {
        let listener = tarpc::serde_transport::tcp::listen(&addr, Bincode::default).await?;
        info!("shard manager listening on {}", addr);

        listener
            .filter_map(|r| futures::future::ready(r.ok()))
            .map(server::BaseChannel::with_defaults)
            .for_each_concurrent(10, |channel| {
                let server = self.clone();
                async move { channel.execute(server.serve()).for_each(|_| async {}).await }
            })
            .await;

        Ok(())
    }
}

impl ShardManagerRpc for ShardManagerServer {
    #[instrument(skip(self, _ctx))]
    async fn register_node(self, _ctx: Context, address: String, internal_address: String) -> RpcResult<()> {
        self.manager.register_node(address, internal_address).await;
        Ok(())
    }

    #[instrument(skip(self, _ctx))]
    async fn unregister_node(self, _ctx: Context, address: String) -> RpcResult<()> {
        self.manager.unregister_node(&address).await;
        Ok(())
    }

    /// Resolve `(namespace, queue)` to its shard, allocating a new one
    /// when `create_if_not_found` is set and no mapping exists yet.
    #[instrument(skip(self, _ctx), fields(%namespace, %queue, create_if_not_found))]
    async fn get_shard(
        self,
        _ctx: Context,
        namespace: String,
        queue: String,
        create_if_not_found: bool,
    ) -> RpcResult<ShardDescriptor> {
        debug!("resolving shard");
        self.manager
            .get_shard(&namespace, &queue, create_if_not_found)
            .await
            .map(to_wire)
            .map_err(|e| {
                error!(error = %e, "get_shard failed");
                e.into()
            })
    }

    #[instrument(skip(self, _ctx), fields(%namespace, %queue))]
    async fn delete_shard(self, _ctx: Context, namespace: String, queue: String) -> RpcResult<()> {
        self.manager
            .delete_shard(&namespace, &queue)
            .await
            .map_err(Into::into)
    }

    /// Deprecated alias for `get_shard(create_if_not_found = true)`, kept
    /// for clients that haven't migrated yet.
    #[instrument(skip(self, _ctx), fields(%namespace, %queue))]
    async fn request_shard(
        self,
        _ctx: Context,
        namespace: String,
        queue: String,
    ) -> RpcResult<ShardDescriptor> {
        self.manager
            .request_shard(&namespace, &queue)
            .await
            .map(to_wire)
            .map_err(Into::into)
    }

    #[instrument(skip(self, _ctx))]
    async fn list_shards(self, _ctx: Context) -> RpcResult<Vec<ShardDescriptor>> {
        Ok(self.manager.list_shards().await.into_iter().map(to_wire).collect())
    }

    #[instrument(skip(self, _ctx))]
    async fn heartbeat(self, _ctx: Context, address: String) -> RpcResult<()> {
        self.manager.heartbeat(&address).await.map_err(Into::into)
    }
}

impl From<crate::shard_manager::ShardManagerError> for RpcError {
    fn from(e: crate::shard_manager::ShardManagerError) -> Self {
        use crate::shard_manager::ShardManagerError as E;
        match e {
            E::NotFound(ns, q) => RpcError::NotFound(format!("{ns}/{q}")),
            E::NoAvailableNode => RpcError::FailedPrecondition("no alive data node available".to_string()),
            E::RetryLater => RpcError::DependencyFailure("shard id allocation exhausted retries".to_string()),
        }
    }
}

/// Network-facing wrapper around a [`ControlPlane`], one instance per
/// listening socket.
///
/// # Thread Safety
///
/// `Clone` is cheap: the inner `Arc<ControlPlane>` is shared across every
/// concurrently served connection.
#[derive(Clone)]
pub struct ControlPlaneServer {
    control: Arc<ControlPlane>,
}

impl ControlPlaneServer {
    /// Wrap an existing [`ControlPlane`] for serving.
    ///
    /// # Arguments
    ///
    /// * `control` - the router this server exposes over RPC
    pub fn new(control: Arc<ControlPlane>) -> Self {
        Self { control }
    }

    /// Bind `addr` and serve incoming connections until the process exits.
    ///
    /// # Arguments
    ///
    /// * `addr` - the socket address to listen on
    ///
    /// # Errors
    ///
    /// Returns the `std::io::Error` from binding the listener.
    pub async fn start(self, addr: SocketAddr) -> Result<(), std::io::Error> {
        let listener = tarpc::serde_transport::tcp::listen(&addr, Bincode::default).await?;
        info!("control plane listening on {}", addr);

        listener
            .filter_map(|r| futures::future::ready(r.ok()))
            .map(server::BaseChannel::with_defaults)
            .for_each_concurrent(10, |channel| {
                let server = self.clone();
                async move { channel.execute(server.serve()).for_each(|_| async {}).await }
            })
            .await;

        Ok(())
    }
}

impl From<crate::control_plane::ControlPlaneError> for RpcError {
    fn from(e: crate::control_plane::ControlPlaneError) -> Self {
        use crate::control_plane::ControlPlaneError as E;
        match e {
            E::NotFound(ns, q) => RpcError::NotFound(format!("{ns}/{q}")),
            E::AlreadyExists(ns, q) => RpcError::AlreadyExists(format!("{ns}/{q}")),
            E::DependencyFailure(msg) => RpcError::DependencyFailure(msg),
            E::Internal(msg) => RpcError::Internal(msg),
        }
    }
}

impl ControlPlaneRpc for ControlPlaneServer {
    #[instrument(skip(self, _ctx), fields(%namespace))]
    async fn add_namespace(self, _ctx: Context, namespace: String) -> RpcResult<()> {
        self.control.add_namespace(namespace).await.map_err(Into::into)
    }

    #[instrument(skip(self, _ctx), fields(%namespace, %queue))]
    async fn add_queue(self, _ctx: Context, namespace: String, queue: String) -> RpcResult<ShardDescriptor> {
        let resolved = self.control.add_queue(namespace, queue).await?;
        Ok(ShardDescriptor {
            shard_id: resolved.shard_id,
            leader_address: resolved.address,
            internal_address: String::new(),
            is_new: resolved.is_new,
        })
    }

    #[instrument(skip(self, _ctx), fields(%namespace, %queue))]
    async fn get_queue(self, _ctx: Context, namespace: String, queue: String) -> RpcResult<ShardDescriptor> {
        let resolved = self.control.get_queue(&namespace, &queue).await?;
        Ok(ShardDescriptor {
            shard_id: resolved.shard_id,
            leader_address: resolved.address,
            internal_address: String::new(),
            is_new: resolved.is_new,
        })
    }

    #[instrument(skip(self, _ctx), fields(%namespace, %queue))]
    async fn clear_queue(self, _ctx: Context, namespace: String, queue: String) -> RpcResult<()> {
        self.control.clear_queue(&namespace, &queue).await.map_err(Into::into)
    }

    #[instrument(skip(self, _ctx), fields(%namespace, %queue))]
    async fn delete_queue(self, _ctx: Context, namespace: String, queue: String) -> RpcResult<()> {
        self.control.delete_queue(&namespace, &queue).await.map_err(Into::into)
    }

    #[instrument(skip(self, _ctx), fields(%namespace, %queue))]
    async fn get_dataplane(self, _ctx: Context, namespace: String, queue: String) -> RpcResult<String> {
        self.control.get_dataplane(&namespace, &queue).await.map_err(Into::into)
    }

    #[instrument(skip(self, _ctx))]
    async fn get_stats(self, _ctx: Context) -> RpcResult<()> {
        self.control.get_stats().await.map_err(Into::into)
    }
}

/// Network-facing wrapper around a [`DataPlane`] node, one instance per
/// listening socket.
///
/// # Thread Safety
///
/// `Clone` is cheap: the inner `Arc<DataPlane>` is shared across every
/// concurrently served connection, which is what lets two clients act on
/// the same queue's lock table at once.
#[derive(Clone)]
pub struct DataPlaneServer {
    node: Arc<DataPlane>,
}

impl DataPlaneServer {
    /// Wrap an existing [`DataPlane`] node for serving.
    ///
    /// # Arguments
    ///
    /// * `node` - the data node this server exposes over RPC
    pub fn new(node: Arc<DataPlane>) -> Self {
        Self { node }
    }

    /// Bind `addr` and serve incoming connections until the process exits.
    ///
    /// # Arguments
    ///
    /// * `addr` - the socket address to listen on
    ///
    /// # Errors
    ///
    /// Returns the `std::io::Error` from binding the listener.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// DataPlaneServer::new(node).start(addr).await?;
    /// ```
    pub async fn start(self, addr: SocketAddr) -> Result<(), std::io::Error> {
        let listener = tarpc::serde_transport::tcp::listen(&addr, Bincode::default).await?;
        info!("data plane node listening on {}", addr);

        listener
            .filter_map(|r| futures::future::ready(r.ok()))
            .map(server::BaseChannel::with_defaults)
            .for_each_concurrent(10, |channel| {
                let server = self.clone();
                async move { channel.execute(server.serve()).for_each(|_| async {}).await }
            })
            .await;

        Ok(())
    }
}

impl DataPlaneRpc for DataPlaneServer {
    /// Materialize a queue for `(namespace, queue)` on this node under
    /// `shard_id`, as assigned by the Shard Manager.
    #[instrument(skip(self, _ctx), fields(%namespace, %queue, %shard_id))]
    async fn new_queue(self, _ctx: Context, shard_id: ShardId, namespace: String, queue: String) -> RpcResult<ShardId> {
        self.node
            .new_queue(shard_id, &namespace, &queue)
            .await
            .map_err(Into::into)
    }

    #[instrument(skip(self, _ctx), fields(%namespace, %queue))]
    async fn get(self, _ctx: Context, namespace: String, queue: String) -> RpcResult<ShardId> {
        self.node.get(&namespace, &queue).await.map_err(Into::into)
    }

    /// Not implemented by this node; returns `Unimplemented` rather than
    /// a missing RPC method so clients get a typed response.
    #[instrument(skip(self, _ctx), fields(%namespace, %queue))]
    async fn get_stats(self, _ctx: Context, namespace: String, queue: String) -> RpcResult<()> {
        self.node.get_stats(&namespace, &queue).await
    }

    #[instrument(skip(self, _ctx), fields(%namespace, %queue))]
    async fn delete(self, _ctx: Context, namespace: String, queue: String) -> RpcResult<()> {
        self.node.delete(&namespace, &queue).await.map_err(Into::into)
    }

    #[instrument(skip(self, _ctx), fields(%namespace, %queue))]
    async fn clear(self, _ctx: Context, namespace: String, queue: String) -> RpcResult<()> {
        self.node.clear(&namespace, &queue).await
    }

    #[instrument(skip(self, _ctx), fields(%namespace, %queue, priority))]
    async fn enqueue(self, _ctx: Context, namespace: String, queue: String, priority: u32) -> RpcResult<QueueItem> {
        self.node.enqueue(&namespace, &queue, priority).await
    }

    #[instrument(skip(self, _ctx), fields(%namespace, %queue))]
    async fn dequeue(self, _ctx: Context, namespace: String, queue: String) -> RpcResult<QueueItem> {
        self.node.dequeue(&namespace, &queue).await
    }

    #[instrument(skip(self, _ctx), fields(%namespace, %queue))]
    async fn peek(self, _ctx: Context, namespace: String, queue: String) -> RpcResult<QueueItem> {
        self.node.peek(&namespace, &queue).await
    }

    #[instrument(skip(self, _ctx), fields(%namespace, %queue))]
    async fn peek_lock(self, _ctx: Context, namespace: String, queue: String) -> RpcResult<kq_core::LockedMessage> {
        self.node.peek_lock(&namespace, &queue).await
    }

    #[instrument(skip(self, _ctx), fields(%namespace, %queue))]
    async fn ack(self, _ctx: Context, namespace: String, queue: String, lock_id: LockId) -> RpcResult<()> {
        self.node.ack(&namespace, &queue, lock_id).await
    }

    #[instrument(skip(self, _ctx), fields(%namespace, %queue))]
    async fn nack(self, _ctx: Context, namespace: String, queue: String, lock_id: LockId) -> RpcResult<()> {
        self.node.nack(&namespace, &queue, lock_id).await
    }

    #[instrument(skip(self, _ctx), fields(%namespace, %queue))]
    async fn extend(
        self,
        _ctx: Context,
        namespace: String,
        queue: String,
        lock_id: LockId,
        additional: Duration,
    ) -> RpcResult<()> {
        self.node.extend(&namespace, &queue, lock_id, additional).await
    }

    #[instrument(skip(self, _ctx), fields(%namespace, %queue))]
    async fn set_visibility_timeout(
        self,
        _ctx: Context,
        namespace: String,
        queue: String,
        timeout: Duration,
    ) -> RpcResult<()> {
        self.node.set_visibility_timeout(&namespace, &queue, timeout).await
    }

    #[instrument(skip(self, _ctx), fields(%namespace, %queue))]
    async fn refresh_visibility_timeout(
        self,
        _ctx: Context,
        namespace: String,
        queue: String,
        lock_id: LockId,
    ) -> RpcResult<()> {
        self.node.refresh_visibility_timeout(&namespace, &queue, lock_id).await
    }

    #[instrument(skip(self, _ctx), fields(%namespace, %queue))]
    async fn release_lock(
        self,
        _ctx: Context,
        namespace: String,
        queue: String,
        lock_id: LockId,
    ) -> RpcResult<()> {
        self.node.release_lock(&namespace, &queue, lock_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shard_manager_server_register_then_get_shard() {
        let server = ShardManagerServer::new(Arc::new(ShardManager::new()));
        let ctx = tarpc::context::current();
        server
            .clone()
            .register_node(ctx, "127.0.0.1:9100".into(), "127.0.0.1:9100".into())
            .await
            .unwrap();

        let ctx = tarpc::context::current();
        let descriptor = server
            .get_shard(ctx, "acct".into(), "orders".into(), true)
            .await
            .unwrap();
        assert!(descriptor.is_new);
        assert_eq!(descriptor.leader_address, "127.0.0.1:9100");
    }

    #[tokio::test]
    async fn data_plane_server_new_queue_then_enqueue() {
        let node = Arc::new(DataPlane::new(
            "127.0.0.1:9200".into(),
            "127.0.0.1:9200".into(),
            "127.0.0.1:1".parse().unwrap(),
        ));
        let server = DataPlaneServer::new(node);

        let ctx = tarpc::context::current();
        server
            .clone()
            .new_queue(ctx, ShardId::pack(1, 2), "acct".into(), "orders".into())
            .await
            .unwrap();

        let ctx = tarpc::context::current();
        let item = server
            .clone()
            .enqueue(ctx, "acct".into(), "orders".into(), 3)
            .await
            .unwrap();

        let ctx = tarpc::context::current();
        let dequeued = server.dequeue(ctx, "acct".into(), "orders".into()).await.unwrap();
        assert_eq!(item.message_id, dequeued.message_id);
    }

    #[tokio::test]
    async fn data_plane_server_get_stats_is_unimplemented() {
        let node = Arc::new(DataPlane::new(
            "127.0.0.1:9200".into(),
            "127.0.0.1:9200".into(),
            "127.0.0.1:1".parse().unwrap(),
        ));
        let server = DataPlaneServer::new(node);
        let ctx = tarpc::context::current();
        server
            .clone()
            .new_queue(ctx, ShardId::pack(1, 2), "acct".into(), "orders".into())
            .await
            .unwrap();

        let ctx = tarpc::context::current();
        let err = server.get_stats(ctx, "acct".into(), "orders".into()).await.unwrap_err();
        assert!(matches!(err, RpcError::Unimplemented(_)));
    }
}
