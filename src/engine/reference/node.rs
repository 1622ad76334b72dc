//! Graph nodes held by the reference engine.
//!
//! Nodes are immutable and shared through `Arc`, so several symbol handles
//! can point into the same graph and freeing one never invalidates another.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use super::operator::Operator;

/// Unique identifier for a node within one engine.
pub type NodeId = u64;

/// Per-engine id source.
#[derive(Debug)]
pub struct IdAllocator(AtomicU64);

impl IdAllocator {
    /// Creates an allocator whose first id is 1.
    pub fn new() -> Self {
        Self(AtomicU64::new(1))
    }

    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst)
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// What a node computes.
#[derive(Debug)]
pub enum NodeKind {
    /// A free input (argument or auxiliary state).
    Variable,
    /// An operator applied to its inputs, ordered like `Operator::input_names`.
    Op {
        op: Operator,
        inputs: Vec<Arc<Node>>,
    },
}

/// A node in the computation graph.
#[derive(Debug)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub kind: NodeKind,
}

impl Node {
    pub fn variable(ids: &IdAllocator, name: String) -> Arc<Self> {
        Arc::new(Self {
            id: ids.next(),
            name,
            kind: NodeKind::Variable,
        })
    }

    pub fn op(ids: &IdAllocator, name: String, op: Operator, inputs: Vec<Arc<Node>>) -> Arc<Self> {
        Arc::new(Self {
            id: ids.next(),
            name,
            kind: NodeKind::Op { op, inputs },
        })
    }

    pub fn is_variable(&self) -> bool {
        matches!(self.kind, NodeKind::Variable)
    }

    /// Name of the node's single output.
    pub fn output_name(&self) -> String {
        match self.kind {
            NodeKind::Variable => self.name.clone(),
            NodeKind::Op { .. } => format!("{}_output", self.name),
        }
    }
}

/// A head node's graph in evaluation order.
#[derive(Debug)]
pub struct GraphView {
    /// Every reachable node, inputs before consumers.
    pub order: Vec<Arc<Node>>,
    /// Variables reached through argument slots.
    pub arguments: Vec<Arc<Node>>,
    /// Variables reached through auxiliary slots.
    pub auxiliary: Vec<Arc<Node>>,
}

impl GraphView {
    /// Walks the graph depth-first, inputs in slot order.
    ///
    /// Variables are listed once, at their first visit.
    pub fn new(head: &Arc<Node>) -> Self {
        let mut view = GraphView {
            order: Vec::new(),
            arguments: Vec::new(),
            auxiliary: Vec::new(),
        };
        let mut visited = HashSet::new();
        view.visit(head, false, &mut visited);
        view
    }

    fn visit(&mut self, node: &Arc<Node>, auxiliary: bool, visited: &mut HashSet<NodeId>) {
        if !visited.insert(node.id) {
            return;
        }

        match &node.kind {
            NodeKind::Variable => {
                if auxiliary {
                    self.auxiliary.push(Arc::clone(node));
                } else {
                    self.arguments.push(Arc::clone(node));
                }
            }
            NodeKind::Op { op, inputs } => {
                for (slot, input) in inputs.iter().enumerate() {
                    self.visit(input, op.is_auxiliary_slot(slot), visited);
                }
            }
        }

        self.order.push(Arc::clone(node));
    }

    pub fn argument_names(&self) -> Vec<String> {
        self.arguments.iter().map(|n| n.name.clone()).collect()
    }

    pub fn auxiliary_names(&self) -> Vec<String> {
        self.auxiliary.iter().map(|n| n.name.clone()).collect()
    }
}

/// Copies every node reachable from `head`, preserving shared structure.
pub fn deep_copy(ids: &IdAllocator, head: &Arc<Node>) -> Arc<Node> {
    let mut copies: HashMap<NodeId, Arc<Node>> = HashMap::new();
    for node in GraphView::new(head).order {
        let copy = match &node.kind {
            NodeKind::Variable => Node::variable(ids, node.name.clone()),
            NodeKind::Op { op, inputs } => {
                let inputs = inputs.iter().map(|i| Arc::clone(&copies[&i.id])).collect();
                Node::op(ids, node.name.clone(), op.clone(), inputs)
            }
        };
        copies.insert(node.id, copy);
    }
    Arc::clone(&copies[&head.id])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::reference::operator::BinaryOp;

    fn plus(ids: &IdAllocator, name: &str, lhs: &Arc<Node>, rhs: &Arc<Node>) -> Arc<Node> {
        Node::op(
            ids,
            name.to_string(),
            Operator::Elementwise(BinaryOp::Plus),
            vec![Arc::clone(lhs), Arc::clone(rhs)],
        )
    }

    #[test]
    fn test_ids_are_unique() {
        let ids = IdAllocator::new();
        let a = Node::variable(&ids, "a".to_string());
        let b = Node::variable(&ids, "a".to_string());
        assert_ne!(a.id, b.id);
        assert_eq!(a.id, 1);
    }

    #[test]
    fn test_view_orders_and_deduplicates() {
        let ids = IdAllocator::new();
        let a = Node::variable(&ids, "a".to_string());
        let b = Node::variable(&ids, "b".to_string());
        let ab = plus(&ids, "ab", &a, &b);
        let head = plus(&ids, "head", &ab, &a);

        let view = GraphView::new(&head);
        assert_eq!(view.argument_names(), vec!["a", "b"]);
        assert!(view.auxiliary.is_empty());
        let order: Vec<&str> = view.order.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(order, vec!["a", "b", "ab", "head"]);
    }

    #[test]
    fn test_auxiliary_slots() {
        let ids = IdAllocator::new();
        let op = Operator::parse("BatchNorm", &[], &[]).unwrap();
        let inputs = op
            .input_names()
            .iter()
            .map(|slot| Node::variable(&ids, format!("bn_{slot}")))
            .collect();
        let head = Node::op(&ids, "bn".to_string(), op, inputs);

        let view = GraphView::new(&head);
        assert_eq!(view.argument_names(), vec!["bn_data", "bn_gamma", "bn_beta"]);
        assert_eq!(view.auxiliary_names(), vec!["bn_moving_mean", "bn_moving_var"]);
        assert_eq!(head.output_name(), "bn_output");
    }

    #[test]
    fn test_deep_copy_preserves_sharing() {
        let ids = IdAllocator::new();
        let a = Node::variable(&ids, "a".to_string());
        let head = plus(&ids, "double", &a, &a);
        let copy = deep_copy(&ids, &head);

        assert_ne!(copy.id, head.id);
        assert_eq!(copy.name, "double");
        let NodeKind::Op { inputs, .. } = &copy.kind else {
            panic!("copy should be an operator node");
        };
        assert_eq!(inputs[0].id, inputs[1].id);
        assert_ne!(inputs[0].id, a.id);
        assert_eq!(GraphView::new(&copy).argument_names(), vec!["a"]);
    }
}
