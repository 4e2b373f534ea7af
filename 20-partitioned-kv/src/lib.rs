//! Partitioned key-value store with majority-vote key ownership.
//!
//! Every key lives on exactly one node. A node that wants to create a key
//! asks all of its peers to acknowledge the claim; if a majority agrees the
//! value is stored locally and the peers record who owns it. Reads for keys
//! owned elsewhere are forwarded to the owner. There is no replication: a
//! node that leaves takes its keys with it.
//!
//! # Architecture
//!
//! - **Console task**: reads operator commands and drives the client-side
//!   operations (GET, PUT, DEL, STORE, EXIT) on the node
//! - **Listener task**: accepts peer traffic on the configured transport and
//!   hands each message to the node's acceptor logic, on a bounded pool of
//!   handler tasks
//! - **Shared node**: an `Arc<Node>` whose store and vote bookkeeping are
//!   lock-protected, so handlers and the console can run concurrently
//!
//! # Modules
//!
//! - [`message`]: wire vocabulary and its text encoding
//! - [`store`]: local values plus the key → owner directory
//! - [`agreement`]: peer set, majority threshold, votes and tallies
//! - [`node`]: lifecycle, acceptor dispatch and ownership negotiation
//! - [`messenger`]: the outbound transport contract
//! - [`transport`]: TCP, UDP, RPC and in-process transports
//! - [`console`]: interactive prompt
//! - [`config`] / [`cli`]: startup configuration
//! - [`runtime`]: binding, spawning and shutting down a node

pub mod agreement;
pub mod cli;
pub mod config;
pub mod console;
pub mod message;
pub mod messenger;
pub mod node;
pub mod runtime;
pub mod store;
pub mod transport;
