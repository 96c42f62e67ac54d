use std::net::SocketAddr;

use clap::{Args, Parser, Subcommand};

use crate::server::DEFAULT_CAPACITY;

/// Address used when none is given on the command line.
pub const DEFAULT_ADDR: &str = "127.0.0.1:3491";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay server, rebroadcasting each message to all other peers.
    Server(ServerArgs),
    /// Connect to a relay server and exchange messages from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Socket address the server should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = DEFAULT_ADDR)]
    pub listen: SocketAddr,

    /// Maximum number of simultaneously connected peers.
    #[arg(long, default_value_t = DEFAULT_CAPACITY)]
    pub capacity: usize,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Address of the relay server to connect to.
    #[arg(long, default_value = DEFAULT_ADDR)]
    pub server: SocketAddr,
}
