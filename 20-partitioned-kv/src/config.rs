use std::time::Duration;

use crate::message::PeerId;
use crate::transport::Mode;

/// How long a node waits for any single peer before treating it as absent.
pub const DEFAULT_PEER_TIMEOUT: Duration = Duration::from_millis(2_000);

/// Everything needed to bring up one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    pub mode: Mode,
    pub bind_host: String,
    pub port: u16,
    /// Identity advertised to peers. Defaults to the bound `host:port`.
    pub id: Option<PeerId>,
    pub peers: Vec<PeerId>,
    pub peer_timeout: Duration,
}

impl NodeConfig {
    pub fn new(mode: Mode, bind_host: impl Into<String>, port: u16) -> Self {
        Self {
            mode,
            bind_host: bind_host.into(),
            port,
            id: None,
            peers: Vec::new(),
            peer_timeout: DEFAULT_PEER_TIMEOUT,
        }
    }

    pub fn with_peers<I, P>(mut self, peers: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PeerId>,
    {
        self.peers = peers.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_id(mut self, id: impl Into<PeerId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_peer_timeout(mut self, timeout: Duration) -> Self {
        self.peer_timeout = timeout;
        self
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_host, self.port)
    }
}
