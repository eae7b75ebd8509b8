use std::{net::SocketAddr, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::relay::RelayConfig;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay, accepting chat connections over TCP.
    Server(ServerArgs),
    /// Connect to a relay and chat from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Socket address the relay should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:7000")]
    pub listen: SocketAddr,

    /// Number of messages queued per client before deliveries start waiting.
    #[arg(long, default_value_t = 64, value_parser = clap::value_parser!(u32).range(1..))]
    pub outbound_capacity: u32,

    /// Milliseconds a single delivery may wait on a slow client before it is dropped.
    #[arg(long, default_value_t = 5000)]
    pub delivery_timeout_ms: u64,
}

impl ServerArgs {
    pub fn config(&self) -> RelayConfig {
        RelayConfig {
            outbound_capacity: self.outbound_capacity as usize,
            delivery_timeout: Duration::from_millis(self.delivery_timeout_ms),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Address of the relay to connect to.
    #[arg(long, default_value = "127.0.0.1:7000")]
    pub server: SocketAddr,

    /// Display name; prompted for when omitted.
    #[arg(long)]
    pub name: Option<String>,
}
