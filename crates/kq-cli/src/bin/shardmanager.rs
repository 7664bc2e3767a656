//! Standalone Shard Manager binary.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use kq_net::rpc::server::ShardManagerServer;
use kq_net::ShardManager;

#[derive(Parser)]
#[command(name = "shardmanager", about = "Kokaq shard manager")]
struct Args {
    /// TCP port to listen on.
    #[arg(long, env = "PORT", default_value = "8999")]
    port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;

    let manager = Arc::new(ShardManager::new());
    manager.spawn_liveness_sweeper();

    tracing::info!(%addr, "shard manager starting");
    ShardManagerServer::new(manager).start(addr).await?;
    Ok(())
}
