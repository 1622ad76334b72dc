//! Operators understood by the reference engine.
//!
//! Uses a simple enum instead of a registry of trait objects. Each operator
//! declares its input slots (arguments first, then auxiliary states) and a
//! shape rule that can fill in unknown shapes from known ones in either
//! direction.

use crate::base::{Shape, shape_size};
use crate::errors::GraphError;

use super::activation::Activation;

/// Elementwise binary operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Plus,
    Minus,
    Mul,
    Div,
}

impl BinaryOp {
    pub fn op_name(&self) -> &'static str {
        match self {
            BinaryOp::Plus => "_Plus",
            BinaryOp::Minus => "_Minus",
            BinaryOp::Mul => "_Mul",
            BinaryOp::Div => "_Div",
        }
    }
}

/// A configured operator.
#[derive(Debug, Clone, PartialEq)]
pub enum Operator {
    Elementwise(BinaryOp),
    FullyConnected { num_hidden: usize, no_bias: bool },
    Activation(Activation),
    BatchNorm { eps: f32, momentum: f32, fix_gamma: bool },
}

const BINARY_ARGS: &[&str] = &["lhs", "rhs"];
const FC_ARGS: &[&str] = &["data", "weight", "bias"];
const FC_NO_BIAS_ARGS: &[&str] = &["data", "weight"];
const DATA_ARGS: &[&str] = &["data"];
const BATCH_NORM_ARGS: &[&str] = &["data", "gamma", "beta"];
const BATCH_NORM_AUX: &[&str] = &["moving_mean", "moving_var"];

impl Operator {
    /// Builds an operator from its registered name and string parameters.
    pub fn parse(op_name: &str, keys: &[&str], values: &[&str]) -> Result<Self, GraphError> {
        let params = Params {
            operator: op_name,
            entries: keys.iter().copied().zip(values.iter().copied()).collect(),
        };

        let op = match op_name {
            "_Plus" => Operator::Elementwise(BinaryOp::Plus),
            "_Minus" => Operator::Elementwise(BinaryOp::Minus),
            "_Mul" => Operator::Elementwise(BinaryOp::Mul),
            "_Div" => Operator::Elementwise(BinaryOp::Div),
            "FullyConnected" => Operator::FullyConnected {
                num_hidden: params.required("num_hidden")?,
                no_bias: params.flag("no_bias", false)?,
            },
            "Activation" => {
                let act_type = params.raw("act_type").ok_or_else(|| {
                    params.invalid("act_type", "missing required parameter".to_string())
                })?;
                let act = Activation::from_name(act_type).ok_or_else(|| {
                    params.invalid("act_type", format!("unknown activation {act_type:?}"))
                })?;
                Operator::Activation(act)
            }
            "BatchNorm" => Operator::BatchNorm {
                eps: params.optional("eps", 1e-3)?,
                momentum: params.optional("momentum", 0.9)?,
                fix_gamma: params.flag("fix_gamma", true)?,
            },
            _ => {
                return Err(GraphError::UnknownOperator {
                    name: op_name.to_string(),
                });
            }
        };

        params.reject_unknown(op.param_keys())?;
        Ok(op)
    }

    /// Returns the registered operator name.
    pub fn op_name(&self) -> &'static str {
        match self {
            Operator::Elementwise(op) => op.op_name(),
            Operator::FullyConnected { .. } => "FullyConnected",
            Operator::Activation(_) => "Activation",
            Operator::BatchNorm { .. } => "BatchNorm",
        }
    }

    fn param_keys(&self) -> &'static [&'static str] {
        match self {
            Operator::Elementwise(_) => &[],
            Operator::FullyConnected { .. } => &["num_hidden", "no_bias"],
            Operator::Activation(_) => &["act_type"],
            Operator::BatchNorm { .. } => &["eps", "momentum", "fix_gamma"],
        }
    }

    /// Returns the parameters as strings, parseable by [`Operator::parse`].
    pub fn params(&self) -> Vec<(&'static str, String)> {
        match self {
            Operator::Elementwise(_) => vec![],
            Operator::FullyConnected {
                num_hidden,
                no_bias,
            } => vec![
                ("num_hidden", num_hidden.to_string()),
                ("no_bias", no_bias.to_string()),
            ],
            Operator::Activation(act) => vec![("act_type", act.name().to_string())],
            Operator::BatchNorm {
                eps,
                momentum,
                fix_gamma,
            } => vec![
                ("eps", eps.to_string()),
                ("momentum", momentum.to_string()),
                ("fix_gamma", fix_gamma.to_string()),
            ],
        }
    }

    /// Names of the trainable input slots, in calling order.
    pub fn argument_names(&self) -> &'static [&'static str] {
        match self {
            Operator::Elementwise(_) => BINARY_ARGS,
            Operator::FullyConnected { no_bias: false, .. } => FC_ARGS,
            Operator::FullyConnected { no_bias: true, .. } => FC_NO_BIAS_ARGS,
            Operator::Activation(_) => DATA_ARGS,
            Operator::BatchNorm { .. } => BATCH_NORM_ARGS,
        }
    }

    /// Names of the auxiliary state slots, which follow the arguments.
    pub fn auxiliary_names(&self) -> &'static [&'static str] {
        match self {
            Operator::BatchNorm { .. } => BATCH_NORM_AUX,
            _ => &[],
        }
    }

    /// All input slots: arguments, then auxiliary states.
    pub fn input_names(&self) -> Vec<&'static str> {
        let mut names = self.argument_names().to_vec();
        names.extend_from_slice(self.auxiliary_names());
        names
    }

    /// Whether input slot `index` holds an auxiliary state.
    pub fn is_auxiliary_slot(&self, index: usize) -> bool {
        index >= self.argument_names().len()
    }

    /// Fills unknown shapes from known ones.
    ///
    /// `inputs` is indexed like [`Operator::input_names`]. Returns whether any
    /// slot changed; conflicting shapes are an error.
    pub fn infer_shape(
        &self,
        node: &str,
        inputs: &mut [Option<Shape>],
        output: &mut Option<Shape>,
    ) -> Result<bool, GraphError> {
        let mut changed = false;
        match self {
            Operator::Elementwise(_) | Operator::Activation(_) => {
                let known = inputs
                    .iter()
                    .chain(std::iter::once(&*output))
                    .find_map(|s| s.clone());
                if let Some(shape) = known {
                    for slot in inputs.iter_mut() {
                        changed |= assign(node, slot, &shape)?;
                    }
                    changed |= assign(node, output, &shape)?;
                }
            }
            Operator::FullyConnected {
                num_hidden,
                no_bias,
            } => {
                if let Some(data) = inputs[0].clone() {
                    if data.len() < 2 {
                        return Err(GraphError::invalid_graph(format!(
                            "{node}: FullyConnected expects data of rank >= 2, got {data:?}"
                        )));
                    }
                    let batch = data[0];
                    let features = shape_size(&data[1..])?;
                    changed |= assign(node, &mut inputs[1], &vec![*num_hidden, features])?;
                    if !no_bias {
                        changed |= assign(node, &mut inputs[2], &vec![*num_hidden])?;
                    }
                    changed |= assign(node, output, &vec![batch, *num_hidden])?;
                }
            }
            Operator::BatchNorm { .. } => {
                if inputs[0].is_none() {
                    if let Some(shape) = output.clone() {
                        changed |= assign(node, &mut inputs[0], &shape)?;
                    }
                }
                if let Some(data) = inputs[0].clone() {
                    if data.len() != 2 {
                        return Err(GraphError::invalid_graph(format!(
                            "{node}: BatchNorm expects [batch, channels], got {data:?}"
                        )));
                    }
                    let channels = vec![data[1]];
                    for slot in inputs[1..].iter_mut() {
                        changed |= assign(node, slot, &channels)?;
                    }
                    changed |= assign(node, output, &data)?;
                }
            }
        }
        Ok(changed)
    }
}

/// Stores `shape` into an empty slot, or checks it against a filled one.
fn assign(node: &str, slot: &mut Option<Shape>, shape: &Shape) -> Result<bool, GraphError> {
    match slot {
        Some(existing) if existing == shape => Ok(false),
        Some(existing) => Err(GraphError::ShapeMismatch {
            node: node.to_string(),
            expected: shape.clone(),
            actual: existing.clone(),
        }),
        None => {
            *slot = Some(shape.clone());
            Ok(true)
        }
    }
}

/// String parameters handed to an operator constructor.
struct Params<'a> {
    operator: &'a str,
    entries: Vec<(&'a str, &'a str)>,
}

impl<'a> Params<'a> {
    fn raw(&self, key: &str) -> Option<&'a str> {
        self.entries
            .iter()
            .rev()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| *v)
    }

    fn invalid(&self, key: &str, message: String) -> GraphError {
        GraphError::InvalidParameter {
            operator: self.operator.to_string(),
            key: key.to_string(),
            message,
        }
    }

    fn required<T: std::str::FromStr>(&self, key: &str) -> Result<T, GraphError> {
        let raw = self
            .raw(key)
            .ok_or_else(|| self.invalid(key, "missing required parameter".to_string()))?;
        raw.trim()
            .parse()
            .map_err(|_| self.invalid(key, format!("cannot parse {raw:?}")))
    }

    fn optional<T: std::str::FromStr>(&self, key: &str, default: T) -> Result<T, GraphError> {
        match self.raw(key) {
            Some(_) => self.required(key),
            None => Ok(default),
        }
    }

    fn flag(&self, key: &str, default: bool) -> Result<bool, GraphError> {
        match self.raw(key).map(|v| v.trim().to_lowercase()) {
            None => Ok(default),
            Some(v) if v == "true" || v == "1" => Ok(true),
            Some(v) if v == "false" || v == "0" => Ok(false),
            Some(v) => Err(self.invalid(key, format!("expected a boolean, got {v:?}"))),
        }
    }

    fn reject_unknown(&self, allowed: &[&str]) -> Result<(), GraphError> {
        match self.entries.iter().find(|(k, _)| !allowed.contains(k)) {
            Some((key, _)) => Err(self.invalid(key, "unknown parameter".to_string())),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_binary_ops() {
        assert_eq!(
            Operator::parse("_Plus", &[], &[]).unwrap(),
            Operator::Elementwise(BinaryOp::Plus)
        );
        assert_eq!(
            Operator::parse("_Div", &[], &[]).unwrap().op_name(),
            "_Div"
        );
    }

    #[test]
    fn test_parse_fully_connected() {
        let op = Operator::parse("FullyConnected", &["num_hidden", "no_bias"], &["8", "true"])
            .unwrap();
        assert_eq!(
            op,
            Operator::FullyConnected {
                num_hidden: 8,
                no_bias: true
            }
        );
        assert_eq!(op.argument_names(), &["data", "weight"]);
    }

    #[test]
    fn test_parse_unknown_operator() {
        let err = Operator::parse("Convolution", &[], &[]).unwrap_err();
        assert!(matches!(err, GraphError::UnknownOperator { name } if name == "Convolution"));
    }

    #[test]
    fn test_parse_rejects_bad_params() {
        let missing = Operator::parse("FullyConnected", &[], &[]).unwrap_err();
        assert!(matches!(missing, GraphError::InvalidParameter { key, .. } if key == "num_hidden"));

        let malformed = Operator::parse("FullyConnected", &["num_hidden"], &["many"]).unwrap_err();
        assert!(matches!(malformed, GraphError::InvalidParameter { .. }));

        let unknown = Operator::parse("_Plus", &["alpha"], &["1"]).unwrap_err();
        assert!(matches!(unknown, GraphError::InvalidParameter { key, .. } if key == "alpha"));

        let act = Operator::parse("Activation", &["act_type"], &["swish"]).unwrap_err();
        assert!(matches!(act, GraphError::InvalidParameter { .. }));
    }

    #[test]
    fn test_params_round_trip() {
        let op = Operator::parse("BatchNorm", &["eps", "fix_gamma"], &["0.00001", "false"])
            .unwrap();
        let params = op.params();
        let keys: Vec<&str> = params.iter().map(|(k, _)| *k).collect();
        let values: Vec<&str> = params.iter().map(|(_, v)| v.as_str()).collect();
        assert_eq!(Operator::parse(op.op_name(), &keys, &values).unwrap(), op);
    }

    #[test]
    fn test_batch_norm_slots() {
        let op = Operator::parse("BatchNorm", &[], &[]).unwrap();
        assert_eq!(
            op.input_names(),
            vec!["data", "gamma", "beta", "moving_mean", "moving_var"]
        );
        assert!(!op.is_auxiliary_slot(2));
        assert!(op.is_auxiliary_slot(3));
    }

    #[test]
    fn test_elementwise_shape_flows_both_ways() {
        let op = Operator::Elementwise(BinaryOp::Mul);
        let mut inputs = vec![None, Some(vec![2, 3])];
        let mut output = None;
        assert!(op.infer_shape("mul0", &mut inputs, &mut output).unwrap());
        assert_eq!(inputs[0], Some(vec![2, 3]));
        assert_eq!(output, Some(vec![2, 3]));
        assert!(!op.infer_shape("mul0", &mut inputs, &mut output).unwrap());
    }

    #[test]
    fn test_elementwise_shape_conflict() {
        let op = Operator::Elementwise(BinaryOp::Plus);
        let mut inputs = vec![Some(vec![2, 3]), Some(vec![3, 2])];
        let mut output = None;
        let err = op.infer_shape("plus0", &mut inputs, &mut output).unwrap_err();
        assert!(matches!(err, GraphError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_fully_connected_shapes() {
        let op = Operator::FullyConnected {
            num_hidden: 4,
            no_bias: false,
        };
        let mut inputs = vec![Some(vec![5, 2, 3]), None, None];
        let mut output = None;
        op.infer_shape("fc", &mut inputs, &mut output).unwrap();
        assert_eq!(inputs[1], Some(vec![4, 6]));
        assert_eq!(inputs[2], Some(vec![4]));
        assert_eq!(output, Some(vec![5, 4]));
    }

    #[test]
    fn test_fully_connected_rejects_overflowing_features() {
        let op = Operator::FullyConnected {
            num_hidden: 4,
            no_bias: true,
        };
        let mut inputs = vec![Some(vec![1, usize::MAX, 2]), None];
        let mut output = None;
        let err = op.infer_shape("fc", &mut inputs, &mut output).unwrap_err();
        assert!(matches!(err, GraphError::Tensor(_)));
        assert_eq!(inputs[1], None);
    }

    #[test]
    fn test_batch_norm_shapes_from_output() {
        let op = Operator::parse("BatchNorm", &[], &[]).unwrap();
        let mut inputs = vec![None; 5];
        let mut output = Some(vec![8, 3]);
        op.infer_shape("bn", &mut inputs, &mut output).unwrap();
        assert_eq!(inputs[0], Some(vec![8, 3]));
        assert!(inputs[1..].iter().all(|s| s == &Some(vec![3])));
    }
}
