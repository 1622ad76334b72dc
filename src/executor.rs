//! Executor - a graph bound to concrete arrays.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::base::{Context, ExecutorHandle, NDArrayHandle, OpReqType};
use crate::engine::{Engine, same_engine};
use crate::errors::GraphError;
use crate::ndarray::NDArray;
use crate::symbol::Symbol;

/// Everything an executor is bound to, ordered like the symbol's argument
/// and auxiliary-state lists.
#[derive(Debug, Clone, Default)]
pub struct ExecutorArrays {
    pub arg_arrays: Vec<NDArray>,
    /// `None` only where the matching request is [`OpReqType::NullOp`].
    pub grad_arrays: Vec<Option<NDArray>>,
    pub grad_reqs: Vec<OpReqType>,
    pub aux_arrays: Vec<NDArray>,
}

/// A bound graph, ready to run.
///
/// The executor keeps its symbol and arrays alive and frees its engine
/// handle on drop.
pub struct Executor {
    handle: ExecutorHandle,
    symbol: Symbol,
    context: Context,
    arrays: ExecutorArrays,
    outputs: Vec<NDArray>,
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("handle", &self.handle)
            .field("symbol", &self.symbol.handle())
            .field("context", &self.context)
            .finish()
    }
}

impl Executor {
    pub(crate) fn bind(
        symbol: Symbol,
        context: Context,
        arrays: ExecutorArrays,
    ) -> Result<Self, GraphError> {
        let engine = Arc::clone(symbol.engine());
        let owned = |array: &NDArray| -> Result<NDArrayHandle, GraphError> {
            if same_engine(&engine, array.engine()) {
                Ok(array.handle())
            } else {
                Err(GraphError::EngineMismatch)
            }
        };

        let arg_handles = arrays
            .arg_arrays
            .iter()
            .map(owned)
            .collect::<Result<Vec<_>, _>>()?;
        let grad_handles = arrays
            .grad_arrays
            .iter()
            .map(|grad| grad.as_ref().map_or(Ok(NDArrayHandle::NULL), owned))
            .collect::<Result<Vec<_>, _>>()?;
        let aux_handles = arrays
            .aux_arrays
            .iter()
            .map(owned)
            .collect::<Result<Vec<_>, _>>()?;

        let handle = engine.executor_bind(
            symbol.handle(),
            context,
            &arg_handles,
            &grad_handles,
            &arrays.grad_reqs,
            &aux_handles,
        )?;

        let outputs = match engine.executor_outputs(handle) {
            Ok(outputs) => outputs,
            Err(e) => {
                if let Err(free_err) = engine.executor_free(handle) {
                    log::warn!("failed to free {}: {}", handle, free_err);
                }
                return Err(e);
            }
        };
        let outputs = outputs
            .into_iter()
            .map(|h| NDArray::from_handle(Arc::clone(&engine), h))
            .collect();

        Ok(Self {
            handle,
            symbol,
            context,
            arrays,
            outputs,
        })
    }

    /// Runs the graph, writing into [`Executor::outputs`].
    ///
    /// With `is_train` set, batch-normalized layers use batch statistics and
    /// update their moving averages.
    pub fn forward(&self, is_train: bool) -> Result<(), GraphError> {
        self.engine().executor_forward(self.handle, is_train)
    }

    pub fn outputs(&self) -> &[NDArray] {
        &self.outputs
    }

    pub fn handle(&self) -> ExecutorHandle {
        self.handle
    }

    pub fn engine(&self) -> &Arc<dyn Engine> {
        self.symbol.engine()
    }

    pub fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    pub fn context(&self) -> Context {
        self.context
    }

    pub fn arg_arrays(&self) -> &[NDArray] {
        &self.arrays.arg_arrays
    }

    pub fn grad_arrays(&self) -> &[Option<NDArray>] {
        &self.arrays.grad_arrays
    }

    pub fn grad_reqs(&self) -> &[OpReqType] {
        &self.arrays.grad_reqs
    }

    pub fn aux_arrays(&self) -> &[NDArray] {
        &self.arrays.aux_arrays
    }

    /// Argument arrays keyed by argument name.
    pub fn arg_dict(&self) -> Result<HashMap<String, NDArray>, GraphError> {
        let names = self.symbol.list_arguments()?;
        Ok(names
            .into_iter()
            .zip(self.arrays.arg_arrays.iter().cloned())
            .collect())
    }

    /// Gradient buffers keyed by argument name, skipping arguments without one.
    pub fn grad_dict(&self) -> Result<HashMap<String, NDArray>, GraphError> {
        let names = self.symbol.list_arguments()?;
        Ok(names
            .into_iter()
            .zip(&self.arrays.grad_arrays)
            .filter_map(|(name, grad)| grad.clone().map(|g| (name, g)))
            .collect())
    }

    pub fn aux_dict(&self) -> Result<HashMap<String, NDArray>, GraphError> {
        let names = self.symbol.list_auxiliary_states()?;
        Ok(names
            .into_iter()
            .zip(self.arrays.aux_arrays.iter().cloned())
            .collect())
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        if let Err(e) = self.engine().executor_free(self.handle) {
            log::warn!("failed to free {}: {}", self.handle, e);
        }
    }
}
