use anyhow::Result;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use chat_relay::{
    cli::{Cli, Command, ServerArgs},
    client,
    relay::Relay,
};

/// Logs go to stdout; `RUST_LOG` overrides the default `info` level.
fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

async fn serve(args: ServerArgs) -> Result<()> {
    let listener = TcpListener::bind(args.listen).await?;
    let relay = Relay::new(listener, args.config());

    // Scripts and the e2e tests read the bound address off the end of this line.
    info!("relay listening on {}", relay.local_addr()?);

    relay.run_until_ctrl_c().await.inspect_err(|err| {
        warn!("relay exited with error: {err:?}");
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    match Cli::parse().command {
        Command::Server(args) => serve(args).await,
        Command::Client(args) => client::run(args).await,
    }
}
