//! Fluent builder for operator symbols.
//!
//! ```
//! use burn::backend::NdArray;
//! use symgraph::prelude::*;
//!
//! let engine = ReferenceEngine::<NdArray>::new(Default::default()).into_shared();
//! let data = Symbol::variable(&engine, "data").unwrap();
//! let fc = Operator::new("FullyConnected")
//!     .set_param("num_hidden", 16)
//!     .set_input("data", &data)
//!     .create_symbol(&engine, "fc1")
//!     .unwrap();
//! assert_eq!(fc.list_arguments().unwrap(), vec!["data", "fc1_weight", "fc1_bias"]);
//! ```

use std::fmt::Display;
use std::sync::Arc;

use crate::engine::Engine;
use crate::errors::GraphError;
use crate::symbol::{Symbol, input_handles};

/// Collects parameters and inputs for one operator node.
#[derive(Debug, Clone)]
pub struct Operator {
    op_name: String,
    params: Vec<(String, String)>,
    keyed_inputs: Vec<(String, Symbol)>,
    positional_inputs: Vec<Symbol>,
}

impl Operator {
    pub fn new(op_name: impl Into<String>) -> Self {
        Self {
            op_name: op_name.into(),
            params: Vec::new(),
            keyed_inputs: Vec::new(),
            positional_inputs: Vec::new(),
        }
    }

    /// Sets a parameter, replacing an earlier value for the same key.
    pub fn set_param(mut self, key: &str, value: impl Display) -> Self {
        let value = value.to_string();
        match self.params.iter_mut().find(|(k, _)| k == key) {
            Some((_, existing)) => *existing = value,
            None => self.params.push((key.to_string(), value)),
        }
        self
    }

    /// Wires `symbol` to the input slot named `key`.
    pub fn set_input(mut self, key: &str, symbol: &Symbol) -> Self {
        self.keyed_inputs.push((key.to_string(), symbol.clone()));
        self
    }

    /// Wires `symbol` to the next input slot in the operator's declared order.
    pub fn push_input(mut self, symbol: &Symbol) -> Self {
        self.positional_inputs.push(symbol.clone());
        self
    }

    /// Creates the operator node. An empty name lets the engine pick one.
    pub fn create_symbol(&self, engine: &Arc<dyn Engine>, name: &str) -> Result<Symbol, GraphError> {
        let config_keys: Vec<&str> = self.params.iter().map(|(k, _)| k.as_str()).collect();
        let config_values: Vec<&str> = self.params.iter().map(|(_, v)| v.as_str()).collect();

        match (self.keyed_inputs.is_empty(), self.positional_inputs.is_empty()) {
            (false, false) => Err(GraphError::invalid_graph(format!(
                "{} mixes keyed and positional inputs",
                self.op_name
            ))),
            (true, false) => {
                let inputs: Vec<&Symbol> = self.positional_inputs.iter().collect();
                let handles = input_handles(engine, &inputs)?;
                let handle = engine.symbol_create_atomic(
                    &self.op_name,
                    name,
                    &[],
                    &handles,
                    &config_keys,
                    &config_values,
                )?;
                Ok(Symbol::from_handle(Arc::clone(engine), handle))
            }
            _ => {
                let input_keys: Vec<&str> =
                    self.keyed_inputs.iter().map(|(k, _)| k.as_str()).collect();
                let input_values: Vec<&Symbol> = self.keyed_inputs.iter().map(|(_, s)| s).collect();
                Symbol::from_operator(
                    engine,
                    &self.op_name,
                    name,
                    &input_keys,
                    &input_values,
                    &config_keys,
                    &config_values,
                )
            }
        }
    }
}

/// Shorthands for the operators the reference engine provides.
pub mod ops {
    use super::*;
    use crate::engine::reference::Activation;

    /// Fully connected layer; weight and bias become `{name}_weight` and
    /// `{name}_bias`.
    pub fn fully_connected(
        data: &Symbol,
        name: &str,
        num_hidden: usize,
        no_bias: bool,
    ) -> Result<Symbol, GraphError> {
        Operator::new("FullyConnected")
            .set_param("num_hidden", num_hidden)
            .set_param("no_bias", no_bias)
            .set_input("data", data)
            .create_symbol(data.engine(), name)
    }

    pub fn activation(
        data: &Symbol,
        name: &str,
        act_type: Activation,
    ) -> Result<Symbol, GraphError> {
        Operator::new("Activation")
            .set_param("act_type", act_type.name())
            .set_input("data", data)
            .create_symbol(data.engine(), name)
    }

    /// Batch normalization over the feature axis of a `[batch, features]` input.
    pub fn batch_norm(
        data: &Symbol,
        name: &str,
        eps: f32,
        momentum: f32,
        fix_gamma: bool,
    ) -> Result<Symbol, GraphError> {
        Operator::new("BatchNorm")
            .set_param("eps", eps)
            .set_param("momentum", momentum)
            .set_param("fix_gamma", fix_gamma)
            .set_input("data", data)
            .create_symbol(data.engine(), name)
    }
}
