use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use gk_proxy::{run_proxy, AdmissionTable, ProxyConfig};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Parser)]
#[command(name = "gk_proxy")]
#[command(
    about = "Allow-list UDP forwarding proxy between remote game clients and a local game server"
)]
struct Args {
    /// Client-facing UDP port. The game server is reached on port + 100 and
    /// the controller connects on port + 200.
    port: u16,

    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = ProxyConfig::load(args.config.as_deref(), args.port)?;

    let admission = Arc::new(AdmissionTable::new());

    let shutdown = CancellationToken::new();
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_shutdown.cancel();
        }
    });

    run_proxy(config, admission, shutdown).await
}
