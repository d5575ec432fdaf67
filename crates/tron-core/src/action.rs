//! Actions and the dependency graph between them.
//!
//! Actions live in a petgraph arena; an edge `a -> b` means `b` requires `a`.
//! The graph is immutable once built and shared by every run of a job.

use std::collections::HashMap;

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;

use crate::config::{ActionConfig, CleanupActionConfig};
use crate::error::{Result, TronError};

pub const CLEANUP_ACTION_NAME: &str = "cleanup";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    pub name: String,
    pub command: String,
    /// Node or pool override; `None` runs on the job run's node.
    pub node: Option<String>,
    pub is_cleanup: bool,
}

impl Action {
    fn from_config(cfg: &ActionConfig) -> Self {
        Self {
            name: cfg.name.clone(),
            command: cfg.command.clone(),
            node: cfg.node.clone(),
            is_cleanup: false,
        }
    }

    fn cleanup(cfg: &CleanupActionConfig) -> Self {
        Self {
            name: CLEANUP_ACTION_NAME.to_string(),
            command: cfg.command.clone(),
            node: cfg.node.clone(),
            is_cleanup: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ActionGraph {
    graph: DiGraph<Action, ()>,
    index: HashMap<String, NodeIndex>,
    /// Topological order, ties broken by config order.
    order: Vec<NodeIndex>,
}

impl ActionGraph {
    pub fn from_config(
        actions: &[ActionConfig],
        cleanup: Option<&CleanupActionConfig>,
    ) -> Result<Self> {
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();

        for cfg in actions {
            let reserved = cleanup.is_some() && cfg.name == CLEANUP_ACTION_NAME;
            if reserved || index.contains_key(&cfg.name) {
                return Err(TronError::DuplicateAction(cfg.name.clone()));
            }
            let idx = graph.add_node(Action::from_config(cfg));
            index.insert(cfg.name.clone(), idx);
        }
        if let Some(cfg) = cleanup {
            let idx = graph.add_node(Action::cleanup(cfg));
            index.insert(CLEANUP_ACTION_NAME.to_string(), idx);
        }

        for cfg in actions {
            let to = index[&cfg.name];
            for dep in &cfg.requires {
                let from = index
                    .get(dep)
                    .copied()
                    .filter(|i| !graph[*i].is_cleanup)
                    .ok_or_else(|| TronError::UnknownDependency {
                        action: cfg.name.clone(),
                        dependency: dep.clone(),
                    })?;
                graph.update_edge(from, to, ());
            }
        }

        let order = topological_order(&graph)?;
        Ok(Self {
            graph,
            index,
            order,
        })
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn get(&self, name: &str) -> Option<&Action> {
        self.index.get(name).map(|i| &self.graph[*i])
    }

    /// All actions in config order, cleanup last.
    pub fn actions(&self) -> impl Iterator<Item = &Action> {
        self.graph.node_indices().map(move |i| &self.graph[i])
    }

    pub fn names(&self) -> Vec<&str> {
        self.actions().map(|a| a.name.as_str()).collect()
    }

    /// Actions with no requirements. The cleanup action is never a root.
    pub fn roots(&self) -> Vec<&Action> {
        self.actions()
            .filter(|a| !a.is_cleanup && self.required_actions(&a.name).is_empty())
            .collect()
    }

    pub fn cleanup(&self) -> Option<&Action> {
        self.get(CLEANUP_ACTION_NAME).filter(|a| a.is_cleanup)
    }

    pub fn topo_order(&self) -> Vec<&Action> {
        self.order.iter().map(|i| &self.graph[*i]).collect()
    }

    pub fn required_actions(&self, name: &str) -> Vec<&Action> {
        self.neighbors(name, Direction::Incoming)
    }

    pub fn dependent_actions(&self, name: &str) -> Vec<&Action> {
        self.neighbors(name, Direction::Outgoing)
    }

    pub fn actions_for_names<'a, I>(&self, names: I) -> Result<Vec<&Action>>
    where
        I: IntoIterator<Item = &'a str>,
    {
        names
            .into_iter()
            .map(|n| self.get(n).ok_or_else(|| TronError::ActionNotFound(n.to_string())))
            .collect()
    }

    fn neighbors(&self, name: &str, dir: Direction) -> Vec<&Action> {
        let Some(&idx) = self.index.get(name) else {
            return Vec::new();
        };
        let mut found: Vec<NodeIndex> = self.graph.neighbors_directed(idx, dir).collect();
        found.sort();
        found.into_iter().map(|i| &self.graph[i]).collect()
    }
}

/// Kahn's algorithm seeded in config order so the result is stable.
fn topological_order(graph: &DiGraph<Action, ()>) -> Result<Vec<NodeIndex>> {
    let mut in_degree: Vec<usize> = graph
        .node_indices()
        .map(|i| graph.neighbors_directed(i, Direction::Incoming).count())
        .collect();
    let mut ready: Vec<NodeIndex> = graph
        .node_indices()
        .filter(|i| in_degree[i.index()] == 0)
        .collect();
    ready.reverse();

    let mut order = Vec::with_capacity(graph.node_count());
    while let Some(idx) = ready.pop() {
        order.push(idx);
        let mut next: Vec<NodeIndex> = graph.neighbors_directed(idx, Direction::Outgoing).collect();
        next.sort_by(|a, b| b.cmp(a));
        for n in next {
            in_degree[n.index()] -= 1;
            if in_degree[n.index()] == 0 {
                ready.push(n);
            }
        }
    }

    if order.len() != graph.node_count() {
        let stuck = graph
            .node_indices()
            .find(|i| in_degree[i.index()] > 0)
            .map(|i| graph[i].name.clone())
            .unwrap_or_default();
        return Err(TronError::DependencyCycle(stuck));
    }
    Ok(order)
}
