//! Execution endpoints.
//!
//! A [`Node`] accepts a shell command and hands back a future for its exit
//! code. Refusing the command outright (host unreachable, no capacity) is a
//! synchronous `Err`; losing the connection afterwards resolves the future
//! with an `Err`. Transports live outside this crate; [`LocalNode`] is the
//! one built-in backend.

use std::collections::HashMap;
use std::fmt;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use rand::seq::SliceRandom;
use serde::Serialize;
use thiserror::Error;

use crate::config::{NodeConfig, NodePoolConfig};
use crate::error::{Result, TronError};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NodeError {
    #[error("node {0} is unreachable")]
    Unreachable(String),

    #[error("lost connection to {host}: {reason}")]
    ConnectionLost { host: String, reason: String },
}

/// Resolves to the command's exit code.
pub type Execution = BoxFuture<'static, std::result::Result<i32, NodeError>>;

pub trait Node: Send + Sync + fmt::Debug {
    fn hostname(&self) -> &str;

    fn run(&self, command: &str) -> std::result::Result<Execution, NodeError>;
}

// ---------------------------------------------------------------------------
// LocalNode
// ---------------------------------------------------------------------------

/// Runs commands on the controller host through `sh -c`, reporting under the
/// configured hostname.
#[derive(Debug, Clone)]
pub struct LocalNode {
    hostname: String,
}

impl LocalNode {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
        }
    }
}

impl Node for LocalNode {
    fn hostname(&self) -> &str {
        &self.hostname
    }

    fn run(&self, command: &str) -> std::result::Result<Execution, NodeError> {
        // tokio::process needs a reactor; without one the command cannot be issued
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(NodeError::Unreachable(self.hostname.clone()));
        }
        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(false)
            .spawn()
            .map_err(|_| NodeError::Unreachable(self.hostname.clone()))?;

        let host = self.hostname.clone();
        Ok(Box::pin(async move {
            let status = child
                .wait()
                .await
                .map_err(|e| NodeError::ConnectionLost {
                    host,
                    reason: e.to_string(),
                })?;
            // killed by signal: no code, report as a failure
            Ok(status.code().unwrap_or(-1))
        }))
    }
}

// ---------------------------------------------------------------------------
// NodePool
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct NodePool {
    name: String,
    nodes: Vec<Arc<dyn Node>>,
    cursor: AtomicUsize,
}

impl NodePool {
    pub fn new(name: impl Into<String>, nodes: Vec<Arc<dyn Node>>) -> Result<Self> {
        let name = name.into();
        if nodes.is_empty() {
            return Err(TronError::EmptyNodePool(name));
        }
        Ok(Self {
            name,
            nodes,
            cursor: AtomicUsize::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn nodes(&self) -> &[Arc<dyn Node>] {
        &self.nodes
    }

    pub fn hostnames(&self) -> Vec<&str> {
        self.nodes.iter().map(|n| n.hostname()).collect()
    }

    /// A random member of the pool.
    pub fn next(&self) -> Arc<dyn Node> {
        self.nodes
            .choose(&mut rand::thread_rng())
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.nodes[0]))
    }

    pub fn next_round_robin(&self) -> Arc<dyn Node> {
        let i = self.cursor.fetch_add(1, Ordering::Relaxed) % self.nodes.len();
        Arc::clone(&self.nodes[i])
    }

    pub fn get_by_hostname(&self, hostname: &str) -> Option<Arc<dyn Node>> {
        self.nodes
            .iter()
            .find(|n| n.hostname() == hostname)
            .cloned()
    }
}

/// The pinned node when `hostname` is in the pool, otherwise the next one in
/// round-robin order.
pub fn node_selector(pool: &NodePool, hostname: Option<&str>) -> Arc<dyn Node> {
    hostname
        .and_then(|h| pool.get_by_hostname(h))
        .unwrap_or_else(|| pool.next_round_robin())
}

impl PartialEq for NodePool {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.hostnames() == other.hostnames()
    }
}

// ---------------------------------------------------------------------------
// NodePoolStore
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct PoolSummary {
    pub name: String,
    pub hostnames: Vec<String>,
}

/// Registry of pools by name, built once at startup and passed to whatever
/// needs to resolve a `node:` reference. Every node is also a pool of one
/// under its own name.
#[derive(Debug, Default, Clone)]
pub struct NodePoolStore {
    pools: HashMap<String, Arc<NodePool>>,
}

impl NodePoolStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config<F>(nodes: &[NodeConfig], pools: &[NodePoolConfig], mut build: F) -> Result<Self>
    where
        F: FnMut(&NodeConfig) -> Arc<dyn Node>,
    {
        let mut store = Self::new();
        let mut by_name: HashMap<&str, Arc<dyn Node>> = HashMap::new();
        for cfg in nodes {
            let node = build(cfg);
            by_name.insert(cfg.name.as_str(), Arc::clone(&node));
            store.insert(NodePool::new(cfg.name.clone(), vec![node])?);
        }
        for cfg in pools {
            let members = cfg
                .nodes
                .iter()
                .map(|n| {
                    by_name
                        .get(n.as_str())
                        .cloned()
                        .ok_or_else(|| TronError::UnknownNode(n.clone()))
                })
                .collect::<Result<Vec<_>>>()?;
            store.insert(NodePool::new(cfg.name.clone(), members)?);
        }
        Ok(store)
    }

    pub fn insert(&mut self, pool: NodePool) {
        self.pools.insert(pool.name.clone(), Arc::new(pool));
    }

    pub fn get(&self, name: &str) -> Result<Arc<NodePool>> {
        self.pools
            .get(name)
            .cloned()
            .ok_or_else(|| TronError::UnknownNode(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.pools.contains_key(name)
    }

    pub fn summaries(&self) -> Vec<PoolSummary> {
        let mut out: Vec<PoolSummary> = self
            .pools
            .values()
            .map(|p| PoolSummary {
                name: p.name.clone(),
                hostnames: p.hostnames().into_iter().map(String::from).collect(),
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedNode;

    fn pool(hosts: &[&str]) -> NodePool {
        let nodes: Vec<Arc<dyn Node>> = hosts
            .iter()
            .map(|h| Arc::new(ScriptedNode::new(*h)) as Arc<dyn Node>)
            .collect();
        NodePool::new("pool", nodes).unwrap()
    }

    #[test]
    fn round_robin_cycles() {
        let p = pool(&["a", "b", "c"]);
        let picked: Vec<String> = (0..4)
            .map(|_| p.next_round_robin().hostname().to_string())
            .collect();
        assert_eq!(picked, ["a", "b", "c", "a"]);
    }

    #[test]
    fn next_picks_a_member() {
        let p = pool(&["a", "b"]);
        let host = p.next().hostname().to_string();
        assert!(host == "a" || host == "b");
    }

    #[test]
    fn selector_prefers_pinned_hostname() {
        let p = pool(&["a", "b"]);
        assert_eq!(node_selector(&p, Some("b")).hostname(), "b");
    }

    #[test]
    fn selector_falls_back_when_hostname_unknown() {
        let p = pool(&["a", "b"]);
        assert_eq!(node_selector(&p, Some("gone")).hostname(), "a");
        assert_eq!(node_selector(&p, None).hostname(), "b");
    }

    #[test]
    fn empty_pool_rejected() {
        assert!(matches!(
            NodePool::new("none", Vec::new()),
            Err(TronError::EmptyNodePool(_))
        ));
    }

    #[test]
    fn store_builds_single_node_pools_and_named_pools() {
        let nodes = vec![
            NodeConfig {
                name: "n1".into(),
                hostname: "host1".into(),
            },
            NodeConfig {
                name: "n2".into(),
                hostname: "host2".into(),
            },
        ];
        let pools = vec![NodePoolConfig {
            name: "batch".into(),
            nodes: vec!["n1".into(), "n2".into()],
        }];
        let store = NodePoolStore::from_config(&nodes, &pools, |c| {
            Arc::new(ScriptedNode::new(&c.hostname)) as Arc<dyn Node>
        })
        .unwrap();
        assert_eq!(store.get("n1").unwrap().hostnames(), ["host1"]);
        assert_eq!(store.get("batch").unwrap().hostnames(), ["host1", "host2"]);
        assert!(matches!(store.get("nope"), Err(TronError::UnknownNode(_))));
    }

    #[test]
    fn store_rejects_pool_with_unknown_member() {
        let pools = vec![NodePoolConfig {
            name: "batch".into(),
            nodes: vec!["ghost".into()],
        }];
        let err = NodePoolStore::from_config(&[], &pools, |c| {
            Arc::new(ScriptedNode::new(&c.hostname)) as Arc<dyn Node>
        })
        .unwrap_err();
        assert!(matches!(err, TronError::UnknownNode(n) if n == "ghost"));
    }

    #[tokio::test]
    async fn local_node_reports_exit_codes() {
        let node = LocalNode::new("localhost");
        assert_eq!(node.run("true").unwrap().await, Ok(0));
        assert_eq!(node.run("exit 3").unwrap().await, Ok(3));
    }

    #[test]
    fn local_node_without_runtime_is_unreachable() {
        let node = LocalNode::new("localhost");
        assert!(matches!(node.run("true"), Err(NodeError::Unreachable(_))));
    }
}
