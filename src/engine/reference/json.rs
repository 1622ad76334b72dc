//! JSON graph format.
//!
//! Nodes are listed inputs-first; every input reference is
//! `[node_index, output_index, version]`, with single-output nodes always
//! using output 0 and version 0.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::errors::GraphError;

use super::node::{GraphView, IdAllocator, Node, NodeId, NodeKind};
use super::operator::Operator;

/// `op` value used for variable nodes.
const VARIABLE_OP: &str = "null";

/// One serialized node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExport {
    pub op: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attrs: BTreeMap<String, String>,
    #[serde(default)]
    pub inputs: Vec<[usize; 3]>,
}

/// A serialized graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphExport {
    pub nodes: Vec<NodeExport>,
    pub arg_nodes: Vec<usize>,
    pub heads: Vec<[usize; 3]>,
}

impl GraphExport {
    /// Serializes the graph reachable from `head`.
    pub fn from_head(head: &Arc<Node>) -> Self {
        let view = GraphView::new(head);
        let mut index: HashMap<NodeId, usize> = HashMap::new();
        let mut nodes = Vec::with_capacity(view.order.len());
        let mut arg_nodes = Vec::new();

        for node in &view.order {
            let idx = nodes.len();
            index.insert(node.id, idx);

            let export = match &node.kind {
                NodeKind::Variable => {
                    arg_nodes.push(idx);
                    NodeExport {
                        op: VARIABLE_OP.to_string(),
                        name: node.name.clone(),
                        attrs: BTreeMap::new(),
                        inputs: Vec::new(),
                    }
                }
                NodeKind::Op { op, inputs } => NodeExport {
                    op: op.op_name().to_string(),
                    name: node.name.clone(),
                    attrs: op
                        .params()
                        .into_iter()
                        .map(|(k, v)| (k.to_string(), v))
                        .collect(),
                    inputs: inputs.iter().map(|i| [index[&i.id], 0, 0]).collect(),
                },
            };
            nodes.push(export);
        }

        let heads = vec![[index[&head.id], 0, 0]];
        Self {
            nodes,
            arg_nodes,
            heads,
        }
    }

    /// Rebuilds the graph with fresh node ids.
    pub fn into_head(self, ids: &IdAllocator) -> Result<Arc<Node>, GraphError> {
        let mut built: Vec<Arc<Node>> = Vec::with_capacity(self.nodes.len());

        for (idx, export) in self.nodes.into_iter().enumerate() {
            if export.op == VARIABLE_OP {
                if !export.inputs.is_empty() {
                    return Err(GraphError::invalid_graph(format!(
                        "variable {} cannot have inputs",
                        export.name
                    )));
                }
                built.push(Node::variable(ids, export.name));
                continue;
            }

            let keys: Vec<&str> = export.attrs.keys().map(String::as_str).collect();
            let values: Vec<&str> = export.attrs.values().map(String::as_str).collect();
            let op = Operator::parse(&export.op, &keys, &values)?;

            let expected = op.input_names().len();
            if export.inputs.len() != expected {
                return Err(GraphError::invalid_graph(format!(
                    "node {} ({}) has {} inputs, expected {}",
                    export.name,
                    export.op,
                    export.inputs.len(),
                    expected
                )));
            }

            let inputs = export
                .inputs
                .iter()
                .map(|[input, _, _]| {
                    built.get(*input).cloned().ok_or_else(|| {
                        GraphError::invalid_graph(format!(
                            "node {idx} references node {input}, which is not defined before it"
                        ))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;

            built.push(Node::op(ids, export.name, op, inputs));
        }

        match self.heads.as_slice() {
            [[head, _, _]] => built.get(*head).cloned().ok_or_else(|| {
                GraphError::invalid_graph(format!("head {head} is out of range"))
            }),
            heads => Err(GraphError::invalid_graph(format!(
                "expected exactly one head, found {}",
                heads.len()
            ))),
        }
    }
}
