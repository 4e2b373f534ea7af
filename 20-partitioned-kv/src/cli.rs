use std::time::Duration;

use clap::Parser;

use crate::config::NodeConfig;
use crate::transport::Mode;

#[derive(Parser, Debug)]
#[command(author, version, about = "Run a partitioned key-value store node", long_about = None)]
pub struct Cli {
    /// Transport used for peer traffic.
    #[arg(value_enum)]
    pub mode: Mode,

    /// Host or address to bind, e.g. 127.0.0.1
    pub bind_host: String,

    /// Port to bind.
    pub port: u16,

    /// Comma-separated peers: host:port,host:port,...
    #[arg(value_delimiter = ',')]
    pub peers: Vec<String>,

    /// Identity advertised to peers (defaults to the bound host:port).
    #[arg(long)]
    pub id: Option<String>,

    /// How long to wait on a single peer before giving up.
    #[arg(long, env = "PKV_PEER_TIMEOUT_MS", default_value_t = 2_000)]
    pub peer_timeout_ms: u64,

    /// Print console replies without color.
    #[arg(long)]
    pub no_color: bool,
}

impl Cli {
    pub fn into_config(self) -> NodeConfig {
        let peers = self
            .peers
            .into_iter()
            .map(|peer| peer.trim().to_string())
            .filter(|peer| !peer.is_empty());

        let config = NodeConfig::new(self.mode, self.bind_host, self.port)
            .with_peers(peers)
            .with_peer_timeout(Duration::from_millis(self.peer_timeout_ms));
        match self.id {
            Some(id) => config.with_id(id),
            None => config,
        }
    }
}
