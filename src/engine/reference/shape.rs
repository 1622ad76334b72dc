//! Shape propagation over a graph view.

use std::collections::HashMap;

use crate::base::Shape;
use crate::engine::InferredShapes;
use crate::errors::GraphError;

use super::node::{GraphView, NodeId, NodeKind};

/// Propagates `known` argument shapes until every shape is fixed or no sweep
/// makes progress.
///
/// Each sweep visits operators in evaluation order, letting every shape rule
/// fill slots on both its input and output side.
pub fn infer_shapes(
    view: &GraphView,
    known: &[(&str, &[usize])],
    max_passes: usize,
) -> Result<InferredShapes, GraphError> {
    let mut shapes: HashMap<NodeId, Option<Shape>> =
        view.order.iter().map(|n| (n.id, None)).collect();

    for (name, shape) in known {
        let mut matched = false;
        for arg in view.arguments.iter().filter(|a| a.name == *name) {
            shapes.insert(arg.id, Some(shape.to_vec()));
            matched = true;
        }
        if !matched {
            return Err(GraphError::UnknownArgument {
                name: name.to_string(),
            });
        }
    }

    for pass in 0..max_passes.max(1) {
        let mut changed = false;
        for node in &view.order {
            let NodeKind::Op { op, inputs } = &node.kind else {
                continue;
            };
            let mut input_shapes: Vec<Option<Shape>> =
                inputs.iter().map(|i| shapes[&i.id].clone()).collect();
            let mut output = shapes[&node.id].clone();

            if op.infer_shape(&node.name, &mut input_shapes, &mut output)? {
                changed = true;
                for (input, shape) in inputs.iter().zip(input_shapes) {
                    shapes.insert(input.id, shape);
                }
                shapes.insert(node.id, output);
            }
        }
        log::debug!("shape inference pass {} changed={}", pass + 1, changed);
        if !changed {
            break;
        }
    }

    let mut unresolved = Vec::new();
    let mut collect = |names: Vec<(NodeId, String)>| -> Vec<Shape> {
        names
            .into_iter()
            .filter_map(|(id, name)| {
                let shape = shapes[&id].clone();
                if shape.is_none() {
                    unresolved.push(name);
                }
                shape
            })
            .collect()
    };

    let arg_shapes = collect(view.arguments.iter().map(|n| (n.id, n.name.clone())).collect());
    let aux_shapes = collect(view.auxiliary.iter().map(|n| (n.id, n.name.clone())).collect());
    let out_shapes = match view.order.last() {
        Some(head) => collect(vec![(head.id, head.output_name())]),
        None => Vec::new(),
    };

    if !unresolved.is_empty() {
        return Err(GraphError::IncompleteShapes { unresolved });
    }

    Ok(InferredShapes {
        arg_shapes,
        aux_shapes,
        out_shapes,
    })
}
