//! Wiring that turns a [`NodeConfig`] into a serving node.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::NodeConfig;
use crate::node::Node;
use crate::transport::{self, Listener};

/// A node whose listener is running in the background.
pub struct RunningNode {
    pub node: Arc<Node>,
    pub local_addr: SocketAddr,
    server: JoinHandle<()>,
}

impl RunningNode {
    /// Announces the exit to peers, stops the node and waits for the
    /// listener to release its socket.
    pub async fn shutdown(self) {
        self.node.exit().await;
        if let Err(err) = self.server.await {
            warn!(node = %self.node.id(), error = ?err, "listener task ended abnormally");
        }
    }
}

/// Binds the configured transport and starts serving.
///
/// A bind failure is returned before any node state exists.
pub async fn spawn_node(config: NodeConfig) -> Result<RunningNode> {
    let bind_addr = config.bind_addr();
    let listener = Listener::bind(config.mode, &bind_addr)
        .await
        .with_context(|| format!("failed to bind {} listener on {bind_addr}", config.mode))?;
    let local_addr = listener
        .local_addr()
        .context("failed to read bound address")?;

    let id = config
        .id
        .clone()
        .unwrap_or_else(|| format!("{}:{}", config.bind_host, local_addr.port()));
    let messenger = transport::messenger(config.mode, id.clone());
    let node = Arc::new(Node::new(id, config.peers, messenger, config.peer_timeout));

    let server = listener.serve(Arc::clone(&node));
    node.start().context("failed to start node")?;
    info!(node = %node.id(), mode = %config.mode, addr = %local_addr, "listening for peers");

    Ok(RunningNode {
        node,
        local_addr,
        server,
    })
}
