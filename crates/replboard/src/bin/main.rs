use clap::Parser;
use replboard::{Config, Listener, Node, TcpConnector};
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about = "Run one replica of a replicated message board", long_about = None)]
struct Args {
    /// Path to the cluster config file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Run as this replica instead of the one named in the config
    #[arg(short, long)]
    id: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let mut config = Config::from_file(&args.config)?;
    if let Some(id) = args.id {
        config = config.with_id(id);
    }

    let listen_addr = config
        .listen_addr()
        .ok_or_else(|| format!("replica {} has no address in the cluster", config.server.id))?;
    info!("Starting replica {} on {}", config.server.id, listen_addr);

    let node = Node::build(config, Arc::new(TcpConnector::new())).await?;
    let listener = Listener::bind(&listen_addr, Arc::clone(&node.dispatcher)).await?;
    let _sync = node.start_background_tasks();

    info!("Replica {} fully initialized and running", node.id);
    listener.run().await
}
