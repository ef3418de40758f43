//! Pipeline graph: nodes, gate conditions and the orchestrator that walks them.
//!
//! A pipeline is a directed graph of `Node`s. Provider-call and aggregate nodes
//! name a single successor; conditional nodes branch on a gate condition and
//! may loop back a bounded number of times; terminal nodes end the run.
//!
//! The `Orchestrator` walks the graph from a start node, wrapping every node
//! invocation in rate limiting and retries, and threads a `WorkflowContext`
//! from stage to stage.

pub mod condition;
pub mod node;
pub mod orchestrator;

use std::collections::HashMap;
use std::fmt::Write as _;

use serde::Serialize;

use gauntlet_core::config::{validate_graph, AppConfig, NodeConfig};
use gauntlet_core::error::{GauntletError, Result};

pub use condition::{evaluate_expr, evaluate_gate, GateEvaluation};
pub use node::{Node, NodeEnv, Transition};
pub use orchestrator::{Orchestrator, OrchestratorBuilder, RunOutcome};

/// A validated, immutable pipeline graph.
#[derive(Debug, Clone)]
pub struct WorkflowGraph {
    start: String,
    nodes: Vec<Node>,
    index: HashMap<String, usize>,
}

/// One edge in the exported graph.
#[derive(Debug, Clone, Serialize)]
pub struct EdgeExport {
    pub from: String,
    pub to: String,
    pub label: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_loops: Option<u32>,
}

/// JSON projection of the graph.
#[derive(Debug, Clone, Serialize)]
pub struct GraphExport<'a> {
    pub start: &'a str,
    pub nodes: &'a [Node],
    pub edges: Vec<EdgeExport>,
}

impl WorkflowGraph {
    /// Build a graph from node definitions, checking every structural invariant.
    pub fn new(start: impl Into<String>, nodes: Vec<NodeConfig>) -> Result<Self> {
        let start = start.into();
        validate_graph(&start, &nodes)?;
        let nodes: Vec<Node> = nodes.into_iter().map(Node::from).collect();
        let index = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id().to_string(), i))
            .collect();
        Ok(Self {
            start,
            nodes,
            index,
        })
    }

    pub fn from_config(config: &AppConfig) -> Result<Self> {
        Self::new(config.pipeline.start.clone(), config.nodes.clone())
    }

    pub fn start(&self) -> &str {
        &self.start
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    /// Like [`node`](Self::node) but with a typed error.
    pub fn require(&self, id: &str) -> Result<&Node> {
        self.node(id)
            .ok_or_else(|| GauntletError::NodeNotFound(id.to_string()))
    }

    /// Nodes in declaration order.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn edges(&self) -> Vec<EdgeExport> {
        self.nodes
            .iter()
            .flat_map(|n| {
                let config = NodeConfig::from(n);
                let max_loops = match n {
                    Node::Conditional(c) => c.max_loops,
                    _ => None,
                };
                config
                    .edges()
                    .into_iter()
                    .map(|(label, to, bounded)| EdgeExport {
                        from: n.id().to_string(),
                        to: to.to_string(),
                        label,
                        max_loops: if bounded { max_loops } else { None },
                    })
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    pub fn edge_count(&self) -> usize {
        self.edges().len()
    }

    pub fn export(&self) -> GraphExport<'_> {
        GraphExport {
            start: &self.start,
            nodes: &self.nodes,
            edges: self.edges(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.export())?)
    }

    /// Text rendering: one block per node with its outgoing edges.
    pub fn visualize(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Pipeline (start: {})", self.start);
        let edges = self.edges();
        for node in &self.nodes {
            let marker = if node.id() == self.start { "*" } else { " " };
            let detail = match node {
                Node::ProviderCall(n) => format!(" via {}", n.provider),
                Node::Aggregate(n) => format!(" of [{}]", n.sources.join(", ")),
                Node::Terminal(n) => format!(" ({:?})", n.verdict).to_lowercase(),
                Node::Conditional(_) => String::new(),
            };
            let _ = writeln!(out, "{marker} [{}] {}{detail}", node.kind(), node.id());
            for edge in edges.iter().filter(|e| e.from == node.id()) {
                match edge.max_loops {
                    Some(max) => {
                        let _ = writeln!(out, "    --{}--> {} (max {max} loops)", edge.label, edge.to);
                    }
                    None => {
                        let _ = writeln!(out, "    --{}--> {}", edge.label, edge.to);
                    }
                }
            }
        }
        out
    }
}
