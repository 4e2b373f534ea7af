//! Ownership negotiation across an in-process cluster.
//!
//! Nodes talk through the local transport, so these tests exercise the full
//! proposer/acceptor exchange without sockets.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use partitioned_kv::message::Message;
use partitioned_kv::messenger::{Messenger, TransportError};
use partitioned_kv::node::{Node, NodeError, NodeState};
use partitioned_kv::transport::local::LocalNetwork;

const PEER_TIMEOUT: Duration = Duration::from_millis(200);

/// Test harness for a cluster of nodes sharing one local network.
struct TestCluster {
    network: Arc<LocalNetwork>,
    nodes: Vec<Arc<Node>>,
}

impl TestCluster {
    /// Starts `n` nodes named `n1..=n{n}`, each knowing all the others.
    fn start(n: usize) -> Result<Self> {
        let network = LocalNetwork::new();
        let ids: Vec<String> = (1..=n).map(|i| format!("n{i}")).collect();

        let mut nodes = Vec::new();
        for id in &ids {
            let node = Arc::new(Node::new(
                id.clone(),
                ids.clone(),
                network.messenger(id.clone()),
                PEER_TIMEOUT,
            ));
            network.register(&node);
            node.start()?;
            nodes.push(node);
        }
        Ok(Self { network, nodes })
    }

    /// 1-indexed.
    fn node(&self, id: usize) -> &Node {
        &self.nodes[id - 1]
    }

    fn owners_of(&self, key: &str) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|node| node.store().has_locally(key))
            .map(|node| node.id().to_string())
            .collect()
    }
}

#[tokio::test]
async fn single_node_owns_everything_it_writes() -> Result<()> {
    let cluster = TestCluster::start(1)?;
    let node = cluster.node(1);
    assert_eq!(node.agreement().majority(), 0);

    node.put("a".into(), "1".into()).await?;
    assert_eq!(node.get("a").await?, "1");
    node.delete("a").await?;

    assert_eq!(node.get("a").await, Err(NodeError::KeyNotLocal));
    assert_eq!(node.delete("a").await, Err(NodeError::KeyNotLocal));
    Ok(())
}

#[tokio::test]
async fn committed_key_is_registered_on_every_peer() -> Result<()> {
    let cluster = TestCluster::start(3)?;

    cluster.node(1).put("k".into(), "v".into()).await?;

    assert_eq!(cluster.owners_of("k"), vec!["n1"]);
    for peer in [2, 3] {
        let store = cluster.node(peer).store();
        assert_eq!(store.peer_for_key("k").as_deref(), Some("n1"));
        assert!(!cluster.node(peer).agreement().has_voted("k"));
    }
    assert_eq!(cluster.node(1).agreement().tally("k").acks, 0, "counters are reset");
    Ok(())
}

#[tokio::test]
async fn reads_are_forwarded_to_the_owner() -> Result<()> {
    let cluster = TestCluster::start(3)?;
    cluster.node(1).put("k".into(), "hello world".into()).await?;

    assert_eq!(cluster.node(2).get("k").await?, "hello world");
    assert_eq!(cluster.node(3).get("k").await?, "hello world");
    assert_eq!(cluster.node(3).get("missing").await, Err(NodeError::KeyNotLocal));
    Ok(())
}

#[tokio::test]
async fn owner_overwrites_in_place_and_others_are_refused() -> Result<()> {
    let cluster = TestCluster::start(3)?;
    cluster.node(1).put("k".into(), "v1".into()).await?;
    cluster.node(1).put("k".into(), "v2".into()).await?;

    assert_eq!(cluster.node(2).get("k").await?, "v2");
    assert_eq!(
        cluster.node(2).put("k".into(), "mine".into()).await,
        Err(NodeError::KeyNotLocal)
    );
    assert_eq!(cluster.owners_of("k"), vec!["n1"]);
    Ok(())
}

#[tokio::test]
async fn claim_without_majority_changes_nothing() -> Result<()> {
    let cluster = TestCluster::start(5)?;
    let proposer = cluster.node(1);
    assert_eq!(proposer.agreement().majority(), 3);

    cluster.network.detach("n4");
    cluster.network.detach("n5");

    assert_eq!(
        proposer.put("k".into(), "v".into()).await,
        Err(NodeError::CannotWrite)
    );
    assert!(cluster.owners_of("k").is_empty());
    for peer in 2..=5 {
        assert!(!cluster.node(peer).store().has_remotely("k"));
    }
    assert!(!proposer.agreement().has_voted("k"));
    assert_eq!(proposer.agreement().tally("k").acks, 0);
    Ok(())
}

#[tokio::test]
async fn only_the_owner_can_delete() -> Result<()> {
    let cluster = TestCluster::start(3)?;
    cluster.node(1).put("k".into(), "v".into()).await?;

    assert_eq!(cluster.node(2).delete("k").await, Err(NodeError::KeyNotLocal));
    assert_eq!(cluster.node(2).delete("nope").await, Err(NodeError::KeyNotLocal));
    assert_eq!(cluster.node(1).get("k").await?, "v");
    Ok(())
}

#[tokio::test]
async fn delete_frees_the_key_for_anyone() -> Result<()> {
    let cluster = TestCluster::start(3)?;
    cluster.node(1).put("k".into(), "v".into()).await?;
    cluster.node(1).delete("k").await?;

    for id in 1..=3 {
        assert!(!cluster.node(id).store().has_key("k"));
    }
    assert_eq!(cluster.node(2).get("k").await, Err(NodeError::KeyNotLocal));

    cluster.node(2).put("k".into(), "again".into()).await?;
    assert_eq!(cluster.owners_of("k"), vec!["n2"]);
    assert_eq!(cluster.node(3).get("k").await?, "again");
    Ok(())
}

#[tokio::test]
async fn exit_evicts_the_peer_and_its_keys() -> Result<()> {
    let cluster = TestCluster::start(3)?;
    cluster.node(3).put("z".into(), "1".into()).await?;
    assert!(cluster.node(1).store().has_remotely("z"));

    cluster.node(3).exit().await;

    assert_eq!(cluster.node(3).state(), NodeState::Stopped);
    assert!(!cluster.node(3).close(), "second close is a no-op");
    for id in [1, 2] {
        let node = cluster.node(id);
        assert!(!node.store().has_key("z"));
        assert_eq!(node.agreement().peer_count(), 1);
        assert_eq!(node.agreement().majority(), 1);
    }

    // Two survivors still reach agreement with each other.
    cluster.node(1).put("z".into(), "2".into()).await?;
    assert_eq!(cluster.node(2).get("z").await?, "2");
    Ok(())
}

#[tokio::test]
async fn store_all_merges_every_nodes_keys() -> Result<()> {
    let cluster = TestCluster::start(3)?;
    cluster.node(1).put("a".into(), "1".into()).await?;
    cluster.node(2).put("b".into(), "2".into()).await?;
    cluster.node(3).put("c".into(), "3".into()).await?;

    let merged = cluster.node(1).store_all().await?;
    assert_eq!(merged.len(), 3);
    assert_eq!(merged["a"], "1");
    assert_eq!(merged["b"], "2");
    assert_eq!(merged["c"], "3");

    // Read-only: nothing moved.
    assert_eq!(cluster.owners_of("b"), vec!["n2"]);
    assert_eq!(cluster.node(1).status().local_keys, 1);
    assert_eq!(cluster.node(1).status().remote_keys, 2);
    Ok(())
}

#[tokio::test]
async fn concurrent_puts_from_one_node_both_commit() -> Result<()> {
    let cluster = TestCluster::start(3)?;
    let node = cluster.node(1);

    let (x, y) = tokio::join!(
        node.put("x".into(), "1".into()),
        node.put("y".into(), "2".into())
    );
    x?;
    y?;
    assert_eq!(cluster.node(2).store().keys_per_peer()["n1"], vec!["x", "y"]);
    Ok(())
}

#[tokio::test]
async fn competing_claims_never_both_win() -> Result<()> {
    let cluster = TestCluster::start(3)?;

    let (first, second) = tokio::join!(
        cluster.node(1).put("k".into(), "from-1".into()),
        cluster.node(2).put("k".into(), "from-2".into())
    );

    assert!(!(first.is_ok() && second.is_ok()));
    assert!(cluster.owners_of("k").len() <= 1);
    Ok(())
}

#[tokio::test]
async fn acceptor_promises_a_key_only_once() -> Result<()> {
    let cluster = TestCluster::start(3)?;
    let acceptor = cluster.node(2);

    let claim = Message::Owner { key: "k".into() };
    assert_eq!(
        acceptor.handle_peer_message(claim.clone()),
        Some(Message::Ack { key: "k".into() })
    );
    assert_eq!(
        acceptor.handle_peer_message(claim),
        Some(Message::Nak { key: "k".into() })
    );

    // The acceptor's own claim on a promised key fails and leaves the promise alone.
    assert_eq!(
        acceptor.put("k".into(), "v".into()).await,
        Err(NodeError::CannotWrite)
    );
    assert!(acceptor.agreement().has_voted("k"));
    Ok(())
}

#[tokio::test]
async fn acceptor_naks_keys_it_already_knows() -> Result<()> {
    let cluster = TestCluster::start(3)?;
    cluster.node(1).put("k".into(), "v".into()).await?;

    assert_eq!(
        cluster.node(1).handle_peer_message(Message::Owner { key: "k".into() }),
        Some(Message::Nak { key: "k".into() })
    );
    assert_eq!(
        cluster.node(2).handle_peer_message(Message::Owner { key: "k".into() }),
        Some(Message::Nak { key: "k".into() })
    );
    Ok(())
}

#[tokio::test]
async fn lifecycle_gates_operations() -> Result<()> {
    let network = LocalNetwork::new();
    let node = Arc::new(Node::new("solo", Vec::new(), network.messenger("solo"), PEER_TIMEOUT));
    network.register(&node);

    assert_eq!(node.state(), NodeState::Ready);
    assert_eq!(node.get("k").await, Err(NodeError::NotRunning));
    assert_eq!(node.handle_peer_message(Message::Store), None);

    node.start()?;
    assert!(matches!(
        node.start(),
        Err(NodeError::InvalidTransition { from: NodeState::Running, .. })
    ));
    assert!(node.handle_peer_message(Message::Store).is_some());

    assert!(node.close());
    assert!(!node.close());
    assert_eq!(node.state(), NodeState::Stopped);
    assert_eq!(node.put("k".into(), "v".into()).await, Err(NodeError::NotRunning));
    assert!(node.start().is_err());

    tokio::time::timeout(Duration::from_secs(1), node.stopped()).await?;
    Ok(())
}

#[tokio::test]
async fn unreachable_owner_is_reported() -> Result<()> {
    let cluster = TestCluster::start(3)?;
    cluster.node(1).put("k".into(), "v".into()).await?;
    cluster.network.detach("n1");

    assert_eq!(cluster.node(2).get("k").await, Err(NodeError::PeerUnreachable));
    Ok(())
}

/// Answers nothing, ever.
struct SilentMessenger;

#[async_trait]
impl Messenger for SilentMessenger {
    async fn get_value_for_key(
        &self,
        _: &Message,
        _: &str,
    ) -> Result<Option<Message>, TransportError> {
        std::future::pending().await
    }

    async fn request_acknowledgement(
        &self,
        _: &Message,
        _: &str,
    ) -> Result<Option<Message>, TransportError> {
        std::future::pending().await
    }

    async fn get_all_data(&self, _: &str) -> Result<Option<Message>, TransportError> {
        std::future::pending().await
    }

    async fn delete_key(&self, _: &Message, _: &str) -> Result<(), TransportError> {
        std::future::pending().await
    }

    async fn commit_key(&self, _: &Message, _: &str) -> Result<(), TransportError> {
        std::future::pending().await
    }

    async fn exit(&self, _: &str) -> Result<(), TransportError> {
        std::future::pending().await
    }
}

/// Acknowledges every claim, but for the wrong key.
struct ConfusedMessenger;

#[async_trait]
impl Messenger for ConfusedMessenger {
    async fn get_value_for_key(
        &self,
        _: &Message,
        _: &str,
    ) -> Result<Option<Message>, TransportError> {
        Ok(None)
    }

    async fn request_acknowledgement(
        &self,
        _: &Message,
        _: &str,
    ) -> Result<Option<Message>, TransportError> {
        Ok(Some(Message::Ack { key: "other".into() }))
    }

    async fn get_all_data(&self, _: &str) -> Result<Option<Message>, TransportError> {
        Ok(None)
    }

    async fn delete_key(&self, _: &Message, _: &str) -> Result<(), TransportError> {
        Ok(())
    }

    async fn commit_key(&self, _: &Message, _: &str) -> Result<(), TransportError> {
        Ok(())
    }

    async fn exit(&self, _: &str) -> Result<(), TransportError> {
        Ok(())
    }
}

#[tokio::test]
async fn silent_peers_count_as_abstentions() -> Result<()> {
    let node = Node::new(
        "me",
        vec!["ghost".to_string()],
        Arc::new(SilentMessenger),
        Duration::from_millis(50),
    );
    node.start()?;

    let started = Instant::now();
    assert_eq!(node.put("k".into(), "v".into()).await, Err(NodeError::CannotWrite));
    assert!(started.elapsed() < Duration::from_secs(2));

    let merged = tokio::time::timeout(Duration::from_secs(2), node.store_all()).await??;
    assert!(merged.is_empty());

    tokio::time::timeout(Duration::from_secs(2), node.exit()).await?;
    assert_eq!(node.state(), NodeState::Stopped);
    Ok(())
}

#[tokio::test]
async fn acks_for_other_keys_are_not_counted() -> Result<()> {
    let node = Node::new(
        "me",
        vec!["p".to_string()],
        Arc::new(ConfusedMessenger),
        PEER_TIMEOUT,
    );
    node.start()?;

    assert_eq!(node.put("k".into(), "v".into()).await, Err(NodeError::CannotWrite));
    assert!(!node.store().has_locally("k"));
    Ok(())
}
