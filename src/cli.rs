use std::net::SocketAddr;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay server, accepting TCP chat connections.
    Server(ServerArgs),
    /// Connect to a relay server as an interactive chat client.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Socket address the server should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:8888")]
    pub listen: SocketAddr,

    /// Seconds of inbound silence before an idle participant is evicted.
    #[arg(long, default_value_t = 180)]
    pub idle_timeout_secs: u64,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Address of the relay server to connect to.
    #[arg(long, default_value = "127.0.0.1:8888")]
    pub server: SocketAddr,
}
