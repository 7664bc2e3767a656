//! Data Plane node binary. Registers with the Shard Manager on startup and
//! unregisters on clean shutdown.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use kq_net::rpc::server::DataPlaneServer;
use kq_net::DataPlane;

#[derive(Parser)]
#[command(name = "dataplane", about = "Kokaq data plane node")]
struct Args {
    /// TCP port this node listens on.
    #[arg(long, env = "PORT", default_value = "9002")]
    port: u16,

    /// Shard manager address this node registers with.
    #[arg(long, env = "SHARD_MANAGER_ADDRESS", default_value = "9000")]
    shard_manager_address: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let listen_addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;
    let self_address = format!("127.0.0.1:{}", args.port);
    let shard_manager_addr: SocketAddr = args
        .shard_manager_address
        .parse()
        .or_else(|_| format!("127.0.0.1:{}", args.shard_manager_address).parse())?;

    let node = Arc::new(DataPlane::new(
        self_address.clone(),
        self_address,
        shard_manager_addr,
    ));
    node.register_with_shard_manager().await?;

    let shutdown_node = Arc::clone(&node);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        shutdown_node.unregister_from_shard_manager().await;
        std::process::exit(0);
    });

    tracing::info!(%listen_addr, "data plane node starting");
    DataPlaneServer::new(node).start(listen_addr).await?;
    Ok(())
}
