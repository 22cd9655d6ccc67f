use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use chat_relay::{
    cli::{Cli, Command},
    client,
    server::{RelayConfig, RelayServer},
};

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Server(args) => {
            let listener = TcpListener::bind(args.listen).await?;
            let config = RelayConfig {
                idle_timeout: Duration::from_secs(args.idle_timeout_secs),
            };
            let server = RelayServer::new(listener, config);
            let addr = server.local_addr()?;
            info!("relay listening on {}", addr);
            if let Err(err) = server.run_until_ctrl_c().await {
                warn!("relay exited with error: {err:?}");
                return Err(err);
            }
        }
        Command::Client(args) => client::run(args).await?,
    }

    Ok(())
}
