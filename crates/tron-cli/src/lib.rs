pub mod cmd;
pub mod output;

use std::sync::Arc;

use tron_core::config::MasterConfig;
use tron_core::{LocalNode, Node, NodePoolStore};

/// Node pools for `config`, every node backed by the local shell.
pub fn local_pools(config: &MasterConfig) -> tron_core::Result<NodePoolStore> {
    NodePoolStore::from_config(&config.nodes, &config.node_pools, |node| {
        Arc::new(LocalNode::new(node.hostname.clone())) as Arc<dyn Node>
    })
}
