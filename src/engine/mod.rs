//! The engine boundary.
//!
//! [`Engine`] mirrors a handle-based graph engine API one call at a time:
//! every graph node, tensor and executor lives inside the engine and is
//! referred to by an opaque handle. The front-end types ([`crate::Symbol`],
//! [`crate::NDArray`], [`crate::Executor`]) own those handles and release them
//! on drop.
//!
//! [`ReferenceEngine`] is an in-process implementation backed by `burn`
//! tensors.

mod config;
pub mod reference;

use std::fmt;
use std::sync::Arc;

use crate::base::{Context, ExecutorHandle, NDArrayHandle, OpReqType, Shape, SymbolHandle};
use crate::errors::GraphError;

pub use config::EngineConfig;
pub use reference::ReferenceEngine;

/// Shapes produced by shape inference, each in the order of the matching
/// `list_*` call.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InferredShapes {
    pub arg_shapes: Vec<Shape>,
    pub aux_shapes: Vec<Shape>,
    pub out_shapes: Vec<Shape>,
}

/// Whether two engine references point at the same engine instance.
pub(crate) fn same_engine(a: &Arc<dyn Engine>, b: &Arc<dyn Engine>) -> bool {
    Arc::ptr_eq(a, b)
}

/// A handle-based computation-graph engine.
///
/// Freeing a null handle must be a no-op. Handles returned by `create`,
/// `copy` and `outputs` calls are owned by the caller.
pub trait Engine: Send + Sync + fmt::Debug {
    /// Creates a leaf variable. An empty name asks the engine to pick one.
    fn symbol_create_variable(&self, name: &str) -> Result<SymbolHandle, GraphError>;

    /// Instantiates an operator node wired to `inputs`.
    ///
    /// `input_keys` is either empty (positional inputs) or parallel to
    /// `inputs`; `config_keys` is parallel to `config_values`.
    fn symbol_create_atomic(
        &self,
        op_name: &str,
        name: &str,
        input_keys: &[&str],
        inputs: &[SymbolHandle],
        config_keys: &[&str],
        config_values: &[&str],
    ) -> Result<SymbolHandle, GraphError>;

    /// Deep-copies the graph behind `handle`.
    fn symbol_copy(&self, handle: SymbolHandle) -> Result<SymbolHandle, GraphError>;

    fn symbol_free(&self, handle: SymbolHandle) -> Result<(), GraphError>;

    /// Name of the head node.
    fn symbol_name(&self, handle: SymbolHandle) -> Result<String, GraphError>;

    fn symbol_list_arguments(&self, handle: SymbolHandle) -> Result<Vec<String>, GraphError>;

    fn symbol_list_outputs(&self, handle: SymbolHandle) -> Result<Vec<String>, GraphError>;

    fn symbol_list_auxiliary_states(
        &self,
        handle: SymbolHandle,
    ) -> Result<Vec<String>, GraphError>;

    /// Propagates the `known` argument shapes through the graph.
    fn symbol_infer_shape(
        &self,
        handle: SymbolHandle,
        known: &[(&str, &[usize])],
    ) -> Result<InferredShapes, GraphError>;

    fn symbol_save_to_json(&self, handle: SymbolHandle) -> Result<String, GraphError>;

    fn symbol_create_from_json(&self, json: &str) -> Result<SymbolHandle, GraphError>;

    /// Allocates a zero-filled array.
    fn ndarray_create(&self, shape: &[usize], context: Context)
    -> Result<NDArrayHandle, GraphError>;

    fn ndarray_free(&self, handle: NDArrayHandle) -> Result<(), GraphError>;

    fn ndarray_shape(&self, handle: NDArrayHandle) -> Result<Shape, GraphError>;

    fn ndarray_context(&self, handle: NDArrayHandle) -> Result<Context, GraphError>;

    fn ndarray_sync_copy_from(&self, handle: NDArrayHandle, data: &[f32])
    -> Result<(), GraphError>;

    fn ndarray_sync_copy_to(&self, handle: NDArrayHandle) -> Result<Vec<f32>, GraphError>;

    /// Refills the array with samples from N(mean, std^2).
    fn ndarray_sample_gaussian(
        &self,
        handle: NDArrayHandle,
        mean: f32,
        std: f32,
    ) -> Result<(), GraphError>;

    /// Binds a graph to arrays.
    ///
    /// `arg_arrays`, `grad_arrays` and `grad_reqs` follow
    /// `symbol_list_arguments`; `aux_arrays` follows
    /// `symbol_list_auxiliary_states`. A null gradient handle is allowed only
    /// where the request is [`OpReqType::NullOp`].
    fn executor_bind(
        &self,
        symbol: SymbolHandle,
        context: Context,
        arg_arrays: &[NDArrayHandle],
        grad_arrays: &[NDArrayHandle],
        grad_reqs: &[OpReqType],
        aux_arrays: &[NDArrayHandle],
    ) -> Result<ExecutorHandle, GraphError>;

    fn executor_forward(&self, handle: ExecutorHandle, is_train: bool) -> Result<(), GraphError>;

    /// Returns new handles aliasing the executor's output storage.
    fn executor_outputs(&self, handle: ExecutorHandle) -> Result<Vec<NDArrayHandle>, GraphError>;

    fn executor_free(&self, handle: ExecutorHandle) -> Result<(), GraphError>;
}
