//! Control Plane binary. Bundles a Shard Manager in the same process, the
//! way the reference deployment runs both under one binary.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use kq_net::rpc::server::{ControlPlaneServer, ShardManagerServer};
use kq_net::{ControlPlane, ShardManager};

#[derive(Parser)]
#[command(name = "controlplane", about = "Kokaq control plane")]
struct Args {
    /// TCP port the control plane listens on.
    #[arg(long, env = "PORT", default_value = "9000")]
    port: u16,

    /// TCP port the bundled shard manager listens on.
    #[arg(long, env = "SHARD_MANAGER_ADDRESS", default_value = "8999")]
    shard_manager_address: u16,
}

fn print_banner(port: u16, shard_manager_port: u16) {
    tracing::info!("Kokaq Control Plane");
    tracing::info!("────────────────────────────────────────────");
    tracing::info!("   Listening on   : 0.0.0.0:{port}");
    tracing::info!("   Protocol       : tarpc over TCP, bincode");
    tracing::info!("   Message Store  : in-memory priority heap (visible | DLQ)");
    tracing::info!("   Node Role      : Control Plane + Shard Manager");
    tracing::info!("────────────────────────────────────────────");
    tracing::info!("   Shard Manager  : 0.0.0.0:{shard_manager_port}");
    tracing::info!("   Telemetry      : tracing, RUST_LOG-driven");
    tracing::info!("────────────────────────────────────────────");
    tracing::info!("Control plane is up and humming, awaiting RPCs.");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let control_addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;
    let shard_manager_addr: SocketAddr =
        format!("0.0.0.0:{}", args.shard_manager_address).parse()?;
    let shard_manager_connect_addr: SocketAddr =
        format!("127.0.0.1:{}", args.shard_manager_address).parse()?;

    print_banner(args.port, args.shard_manager_address);

    let manager = Arc::new(ShardManager::new());
    manager.spawn_liveness_sweeper();

    tokio::spawn(ShardManagerServer::new(manager).start(shard_manager_addr));

    let control = Arc::new(ControlPlane::new(shard_manager_connect_addr));
    ControlPlaneServer::new(control).start(control_addr).await?;
    Ok(())
}
