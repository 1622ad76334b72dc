//! Bound executors: a graph plus the storage it reads and writes.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use burn::tensor::{Tensor, backend::Backend};

use crate::base::{Context, OpReqType, Shape, shape_size};
use crate::errors::GraphError;

use super::array::{Storage, lock};
use super::node::{GraphView, Node, NodeId, NodeKind};
use super::operator::{BinaryOp, Operator};

/// Where a variable node reads its value from.
#[derive(Debug, Clone, Copy)]
enum Slot {
    Argument(usize),
    Auxiliary(usize),
}

/// A value flowing between nodes during a forward pass.
#[derive(Clone)]
struct Value<B: Backend> {
    shape: Shape,
    values: Tensor<B, 1>,
}

/// An executor created by `executor_bind`.
pub struct BoundExecutor<B: Backend> {
    pub context: Context,
    order: Vec<Arc<Node>>,
    slots: HashMap<NodeId, Slot>,
    args: Vec<Storage<B>>,
    grads: Vec<Option<Storage<B>>>,
    grad_reqs: Vec<OpReqType>,
    aux: Vec<Storage<B>>,
    pub output: Storage<B>,
}

impl<B: Backend> fmt::Debug for BoundExecutor<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundExecutor")
            .field("context", &self.context)
            .field("nodes", &self.order.len())
            .field("args", &self.args.len())
            .field("grads", &self.grads.iter().filter(|g| g.is_some()).count())
            .field("grad_reqs", &self.grad_reqs)
            .field("aux", &self.aux.len())
            .finish()
    }
}

impl<B: Backend> BoundExecutor<B> {
    pub fn new(
        context: Context,
        view: GraphView,
        args: Vec<Storage<B>>,
        grads: Vec<Option<Storage<B>>>,
        grad_reqs: Vec<OpReqType>,
        aux: Vec<Storage<B>>,
        output: Storage<B>,
    ) -> Self {
        let mut slots = HashMap::new();
        for (i, node) in view.arguments.iter().enumerate() {
            slots.insert(node.id, Slot::Argument(i));
        }
        for (i, node) in view.auxiliary.iter().enumerate() {
            slots.insert(node.id, Slot::Auxiliary(i));
        }

        Self {
            context,
            order: view.order,
            slots,
            args,
            grads,
            grad_reqs,
            aux,
            output,
        }
    }

    /// Evaluates every node in order and stores the head's value.
    pub fn forward(&self, is_train: bool) -> Result<(), GraphError> {
        let mut values: HashMap<NodeId, Value<B>> = HashMap::new();

        for node in &self.order {
            let value = match &node.kind {
                NodeKind::Variable => self.read_slot(node)?,
                NodeKind::Op { op, inputs } => {
                    let input_values: Vec<Value<B>> = inputs
                        .iter()
                        .map(|input| values[&input.id].clone())
                        .collect();
                    self.apply(node, op, inputs, input_values, is_train)?
                }
            };
            values.insert(node.id, value);
        }

        let head = self
            .order
            .last()
            .ok_or_else(|| GraphError::invalid_graph("executor has no nodes"))?;
        let result = values
            .remove(&head.id)
            .ok_or_else(|| GraphError::invalid_graph("head node was not evaluated"))?;
        lock(&self.output)?.write(result.values)
    }

    fn read_slot(&self, node: &Node) -> Result<Value<B>, GraphError> {
        let storage = match self.slots.get(&node.id) {
            Some(Slot::Argument(i)) => &self.args[*i],
            Some(Slot::Auxiliary(i)) => &self.aux[*i],
            None => {
                return Err(GraphError::invalid_graph(format!(
                    "variable {} is not bound",
                    node.name
                )));
            }
        };
        let data = lock(storage)?;
        Ok(Value {
            shape: data.shape.clone(),
            values: data.values.clone(),
        })
    }

    fn apply(
        &self,
        node: &Node,
        op: &Operator,
        inputs: &[Arc<Node>],
        mut values: Vec<Value<B>>,
        is_train: bool,
    ) -> Result<Value<B>, GraphError> {
        match op {
            Operator::Elementwise(binary) => {
                let rhs = values.pop();
                let lhs = values.pop();
                let (Some(lhs), Some(rhs)) = (lhs, rhs) else {
                    return Err(GraphError::invalid_graph(format!(
                        "{} expects two inputs",
                        node.name
                    )));
                };
                if lhs.shape != rhs.shape {
                    return Err(GraphError::ShapeMismatch {
                        node: node.name.clone(),
                        expected: lhs.shape,
                        actual: rhs.shape,
                    });
                }
                let result = match binary {
                    BinaryOp::Plus => lhs.values.add(rhs.values),
                    BinaryOp::Minus => lhs.values.sub(rhs.values),
                    BinaryOp::Mul => lhs.values.mul(rhs.values),
                    BinaryOp::Div => lhs.values.div(rhs.values),
                };
                Ok(Value {
                    shape: lhs.shape,
                    values: result,
                })
            }
            Operator::Activation(act) => {
                let data = values.swap_remove(0);
                Ok(Value {
                    shape: data.shape,
                    values: act.apply(data.values),
                })
            }
            Operator::FullyConnected {
                num_hidden,
                no_bias,
            } => {
                let data = &values[0];
                let batch = data.shape[0];
                let features = shape_size(&data.shape[1..])?;
                let x = data.values.clone().reshape([batch, features]);
                let weight = values[1].values.clone().reshape([*num_hidden, features]);
                let mut out = x.matmul(weight.transpose());
                if !no_bias {
                    out = out.add(values[2].values.clone().reshape([1, *num_hidden]));
                }
                Ok(Value {
                    shape: vec![batch, *num_hidden],
                    values: out.reshape([batch * num_hidden]),
                })
            }
            Operator::BatchNorm {
                eps,
                momentum,
                fix_gamma,
            } => self.batch_norm(node, inputs, values, *eps, *momentum, *fix_gamma, is_train),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn batch_norm(
        &self,
        node: &Node,
        inputs: &[Arc<Node>],
        values: Vec<Value<B>>,
        eps: f32,
        momentum: f32,
        fix_gamma: bool,
        is_train: bool,
    ) -> Result<Value<B>, GraphError> {
        let shape = values[0].shape.clone();
        let &[batch, channels] = shape.as_slice() else {
            return Err(GraphError::invalid_graph(format!(
                "{}: BatchNorm expects [batch, channels], got {:?}",
                node.name, shape
            )));
        };
        let row = |v: &Value<B>| v.values.clone().reshape([1, channels]);

        let x = values[0].values.clone().reshape([batch, channels]);
        let (mean, var) = if is_train {
            let mean = x.clone().mean_dim(0);
            let var = (x.clone() - mean.clone()).powf_scalar(2.0).mean_dim(0);
            self.update_moving_stats(inputs, &mean, &var, momentum)?;
            (mean, var)
        } else {
            (row(&values[3]), row(&values[4]))
        };

        let mut out = (x - mean).div((var + eps).sqrt());
        if !fix_gamma {
            out = out.mul(row(&values[1]));
        }
        out = out.add(row(&values[2]));

        Ok(Value {
            shape,
            values: out.reshape([batch * channels]),
        })
    }

    fn update_moving_stats(
        &self,
        inputs: &[Arc<Node>],
        mean: &Tensor<B, 2>,
        var: &Tensor<B, 2>,
        momentum: f32,
    ) -> Result<(), GraphError> {
        for (input, batch_stat) in inputs[3..].iter().zip([mean, var]) {
            let Some(Slot::Auxiliary(i)) = self.slots.get(&input.id) else {
                continue;
            };
            let mut data = lock(&self.aux[*i])?;
            let [channels] = data.values.dims();
            let updated = data.values.clone() * momentum
                + batch_stat.clone().reshape([channels]) * (1.0 - momentum);
            data.write(updated)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::reference::array::ArrayData;
    use crate::engine::reference::node::IdAllocator;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    fn storage(shape: &[usize], values: &[f32]) -> Storage<TestBackend> {
        let device = <TestBackend as Backend>::Device::default();
        let mut data = ArrayData::zeros(shape, Context::cpu(), &device).unwrap();
        data.copy_from(values).unwrap();
        data.into_storage()
    }

    fn read(storage: &Storage<TestBackend>) -> Vec<f32> {
        lock(storage).unwrap().to_vec().unwrap()
    }

    #[test]
    fn test_forward_elementwise_chain() {
        let ids = IdAllocator::new();
        let a = Node::variable(&ids, "a".to_string());
        let b = Node::variable(&ids, "b".to_string());
        let diff = Node::op(
            &ids,
            "diff".to_string(),
            Operator::Elementwise(BinaryOp::Minus),
            vec![a.clone(), b],
        );
        let head = Node::op(
            &ids,
            "ratio".to_string(),
            Operator::Elementwise(BinaryOp::Div),
            vec![diff, a],
        );

        let output = storage(&[2], &[0.0, 0.0]);
        let executor = BoundExecutor::new(
            Context::cpu(),
            GraphView::new(&head),
            vec![storage(&[2], &[4.0, 8.0]), storage(&[2], &[2.0, 2.0])],
            vec![None, None],
            vec![OpReqType::NullOp; 2],
            vec![],
            output.clone(),
        );
        executor.forward(false).unwrap();
        assert_eq!(read(&output), vec![0.5, 0.75]);
    }

    #[test]
    fn test_forward_fully_connected() {
        let ids = IdAllocator::new();
        let inputs = ["x", "w", "b"]
            .iter()
            .map(|n| Node::variable(&ids, n.to_string()))
            .collect();
        let op = Operator::FullyConnected {
            num_hidden: 2,
            no_bias: false,
        };
        let head = Node::op(&ids, "fc".to_string(), op, inputs);

        let output = storage(&[1, 2], &[0.0, 0.0]);
        let executor = BoundExecutor::new(
            Context::cpu(),
            GraphView::new(&head),
            vec![
                storage(&[1, 3], &[1.0, 2.0, 3.0]),
                storage(&[2, 3], &[1.0, 0.0, 0.0, 0.0, 1.0, 1.0]),
                storage(&[2], &[0.5, -0.5]),
            ],
            vec![None, None, None],
            vec![OpReqType::NullOp; 3],
            vec![],
            output.clone(),
        );
        executor.forward(false).unwrap();
        assert_eq!(read(&output), vec![1.5, 4.5]);
    }

    #[test]
    fn test_batch_norm_training_updates_moving_stats() {
        let ids = IdAllocator::new();
        let op = Operator::BatchNorm {
            eps: 0.0,
            momentum: 0.5,
            fix_gamma: true,
        };
        let inputs = op
            .input_names()
            .iter()
            .map(|slot| Node::variable(&ids, format!("bn_{slot}")))
            .collect();
        let head = Node::op(&ids, "bn".to_string(), op, inputs);

        let moving_mean = storage(&[1], &[0.0]);
        let moving_var = storage(&[1], &[1.0]);
        let output = storage(&[2, 1], &[0.0, 0.0]);
        let executor = BoundExecutor::new(
            Context::cpu(),
            GraphView::new(&head),
            vec![
                storage(&[2, 1], &[1.0, 3.0]),
                storage(&[1], &[1.0]),
                storage(&[1], &[0.0]),
            ],
            vec![None, None, None],
            vec![OpReqType::NullOp; 3],
            vec![moving_mean.clone(), moving_var.clone()],
            output.clone(),
        );

        executor.forward(true).unwrap();
        assert_eq!(read(&output), vec![-1.0, 1.0]);
        assert_eq!(read(&moving_mean), vec![1.0]);
        assert_eq!(read(&moving_var), vec![1.0]);

        executor.forward(false).unwrap();
        assert_eq!(read(&output), vec![0.0, 2.0]);
    }
}
