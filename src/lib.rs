//! # symgraph
//!
//! Symbolic computation graphs over a handle-based graph engine.
//!
//! Graphs are built from [`Symbol`]s (variables, operator nodes and
//! arithmetic on both), their shapes are inferred by the engine, and they are
//! bound to [`NDArray`]s to form an [`Executor`]. Every object is a handle
//! into an [`Engine`]; the front-end types release their handles on drop.
//!
//! ## Features
//!
//! - **Engine trait**: the handle-level API, one method per engine call.
//! - **Reference engine**: an in-process engine on the Burn framework, with
//!   `FullyConnected`, `Activation`, `BatchNorm` and elementwise arithmetic.
//! - **JSON graphs**: symbols save to and load from a node-list JSON format.
//!
//! ## Example
//!
//! ```
//! use std::collections::HashMap;
//! use symgraph::prelude::*;
//!
//! let engine = ReferenceEngine::<DefaultBackend>::new(Default::default()).into_shared();
//!
//! let x = Symbol::variable(&engine, "x").unwrap();
//! let fc = ops::fully_connected(&x, "fc1", 4, false).unwrap();
//! let net = ops::activation(&fc, "relu1", Activation::Relu).unwrap();
//! assert_eq!(net.list_arguments().unwrap(), vec!["x", "fc1_weight", "fc1_bias"]);
//!
//! let data = NDArray::new(&engine, &[2, 3], Context::cpu()).unwrap();
//! let exec = net
//!     .simple_bind(
//!         Context::cpu(),
//!         &HashMap::from([("x".to_string(), data)]),
//!         &HashMap::new(),
//!         &HashMap::new(),
//!     )
//!     .unwrap();
//! exec.forward(false).unwrap();
//! assert_eq!(exec.outputs()[0].shape().unwrap(), vec![2, 4]);
//! ```

pub mod base;
pub mod engine;
pub mod errors;
pub mod executor;
pub mod ndarray;
pub mod operator;
pub mod symbol;

// Re-exports for convenience
pub use base::{Context, DeviceType, OpReqType, Shape};
pub use engine::reference::Activation;
pub use engine::{Engine, EngineConfig, InferredShapes, ReferenceEngine};
pub use errors::GraphError;
pub use executor::{Executor, ExecutorArrays};
pub use ndarray::NDArray;
pub use operator::Operator;
pub use symbol::{SymBlob, Symbol};

/// Backend used by the reference engine in examples and tests.
pub type DefaultBackend = burn::backend::NdArray;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::base::{Context, OpReqType, Shape};
    pub use crate::engine::reference::Activation;
    pub use crate::engine::{Engine, EngineConfig, ReferenceEngine};
    pub use crate::errors::GraphError;
    pub use crate::executor::Executor;
    pub use crate::ndarray::NDArray;
    pub use crate::operator::{Operator, ops};
    pub use crate::symbol::Symbol;
    pub use crate::DefaultBackend;
}
