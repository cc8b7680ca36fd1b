//! Flow graphs as delivered by the host engine
//!
//! A flow is a list of nodes; each node lists, per output port, the ids of the
//! nodes it is wired to, and optionally carries a constraint set. Properties
//! the agent does not interpret are preserved untouched.

pub mod host;

pub use host::{Delivery, HostEngine, RecordingHost};

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::context::{ConstraintGroup, ConstraintSet};
use crate::link::{EdgeKey, LinkCardinality};

/// A message travelling along an edge.
pub type Message = Value;

/// Node type substituted for types the host cannot run.
pub const PLACEHOLDER_TYPE: &str = "dnr-placeholder";

/// Constraint group that no device satisfies.
const NO_RUN_GROUP: &str = "no-run";
const NO_RUN_CORES: u64 = 999_999;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub wires: Vec<Vec<String>>,
    #[serde(default)]
    pub constraints: ConstraintSet,
    #[serde(rename = "replaceFor", default, skip_serializing_if = "Option::is_none")]
    pub replace_for: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl GraphNode {
    pub fn new(id: impl Into<String>, node_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            wires: Vec::new(),
            constraints: ConstraintSet::new(),
            replace_for: None,
            extra: Map::new(),
        }
    }

    /// Wire output `port` to `target`, growing the port list as needed.
    pub fn wire(mut self, port: usize, target: impl Into<String>) -> Self {
        if self.wires.len() <= port {
            self.wires.resize(port + 1, Vec::new());
        }
        self.wires[port].push(target.into());
        self
    }

    pub fn with_constraints(mut self, constraints: ConstraintSet) -> Self {
        self.constraints = constraints;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowGraph {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default)]
    pub nodes: Vec<GraphNode>,
}

impl FlowGraph {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: None,
            nodes: Vec::new(),
        }
    }

    pub fn with_node(mut self, node: GraphNode) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Every wired edge, in node order.
    pub fn edges(&self) -> Vec<EdgeKey> {
        let mut edges = Vec::new();
        for node in &self.nodes {
            for (port, targets) in node.wires.iter().enumerate() {
                for target in targets {
                    edges.push(EdgeKey::new(node.id.clone(), port, target.clone()));
                }
            }
        }
        edges
    }

    /// Number of wires feeding `node_id`.
    pub fn fan_in(&self, node_id: &str) -> usize {
        self.nodes
            .iter()
            .flat_map(|n| n.wires.iter())
            .flat_map(|targets| targets.iter())
            .filter(|t| *t == node_id)
            .count()
    }

    /// Number of wires leaving `port` of `node_id`.
    pub fn fan_out(&self, node_id: &str, port: usize) -> usize {
        self.node(node_id)
            .and_then(|n| n.wires.get(port))
            .map(|targets| targets.len())
            .unwrap_or(0)
    }

    pub fn cardinality(&self, edge: &EdgeKey) -> LinkCardinality {
        LinkCardinality::from_fan(
            self.fan_in(&edge.successor),
            self.fan_out(&edge.predecessor, edge.port),
        )
    }

    /// Replace nodes whose type is not installed with unrunnable placeholders
    /// that keep the original wiring. Returns the ids of replaced nodes.
    pub fn mask_unknown_types(&mut self, installed: &HashSet<String>) -> Vec<String> {
        let mut masked = Vec::new();
        for node in &mut self.nodes {
            if node.node_type == PLACEHOLDER_TYPE || installed.contains(&node.node_type) {
                continue;
            }
            log::info!("Adding placeholder node for missing type: {}", node.node_type);
            let original = std::mem::replace(&mut node.node_type, PLACEHOLDER_TYPE.to_string());
            node.replace_for = Some(original);
            node.extra.insert("outputs".to_string(), json!(node.wires.len()));
            node.constraints = ConstraintSet::new().with_group(
                NO_RUN_GROUP,
                ConstraintGroup::new()
                    .with("id", json!(NO_RUN_GROUP))
                    .with("cores", json!(NO_RUN_CORES)),
            );
            masked.push(node.id.clone());
        }
        masked
    }
}
