//! Test doubles shared by the unit tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeZone, Utc};

use crate::node::{Execution, Node, NodeError, NodePool, NodePoolStore};

/// A node that records every command and never finishes one on its own;
/// tests deliver completions to the controller by ticket. Flip `refuse` to
/// make dispatch fail.
#[derive(Debug)]
pub struct ScriptedNode {
    hostname: String,
    commands: Mutex<Vec<String>>,
    refuse: AtomicBool,
}

impl ScriptedNode {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            commands: Mutex::new(Vec::new()),
            refuse: AtomicBool::new(false),
        }
    }

    pub fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

impl Node for ScriptedNode {
    fn hostname(&self) -> &str {
        &self.hostname
    }

    fn run(&self, command: &str) -> Result<Execution, NodeError> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(NodeError::Unreachable(self.hostname.clone()));
        }
        if let Ok(mut c) = self.commands.lock() {
            c.push(command.to_string());
        }
        Ok(Box::pin(futures::future::pending()))
    }
}

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

/// Store with one pool `batch` over the given hosts, plus a pool per host.
pub fn store_with(hosts: &[&str]) -> (NodePoolStore, Vec<Arc<ScriptedNode>>) {
    let nodes: Vec<Arc<ScriptedNode>> = hosts
        .iter()
        .map(|h| Arc::new(ScriptedNode::new(*h)))
        .collect();
    let mut store = NodePoolStore::new();
    for n in &nodes {
        let dyn_node: Arc<dyn Node> = n.clone();
        store.insert(NodePool::new(n.hostname().to_string(), vec![dyn_node]).unwrap());
    }
    let members: Vec<Arc<dyn Node>> = nodes.iter().map(|n| n.clone() as Arc<dyn Node>).collect();
    store.insert(NodePool::new("batch", members).unwrap());
    (store, nodes)
}
