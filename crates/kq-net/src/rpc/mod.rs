//! RPC layer: tarpc service definitions, server wrappers, and client
//! utilities for the three planes.

pub mod client;
pub mod protocol;
pub mod server;

pub use client::{
    connect_to_control_plane, connect_to_data_plane, connect_to_shard_manager,
    connect_to_shard_manager_with_retry, deadline_context, ClientConfig, DataPlaneClientPool,
};
pub use protocol::{
    ControlPlaneRpc, ControlPlaneRpcClient, DataPlaneRpc, DataPlaneRpcClient, RpcError, RpcResult,
    ShardDescriptor, ShardManagerRpc, ShardManagerRpcClient,
};
pub use server::{ControlPlaneServer, DataPlaneServer, ShardManagerServer};
