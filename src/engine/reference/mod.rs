//! In-process graph engine backed by `burn` tensors.
//!
//! Every context maps onto the engine's single burn device; the context is
//! still recorded per array and checked at bind time.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use burn::backend::NdArray;
//! use symgraph::engine::{Engine, ReferenceEngine};
//!
//! let engine: Arc<dyn Engine> = Arc::new(ReferenceEngine::<NdArray>::new(Default::default()));
//! let x = engine.symbol_create_variable("x").unwrap();
//! assert_eq!(engine.symbol_list_arguments(x).unwrap(), vec!["x"]);
//! engine.symbol_free(x).unwrap();
//! ```

mod activation;
mod array;
mod executor;
mod json;
mod node;
mod operator;
mod shape;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};

use burn::tensor::backend::Backend;

use crate::base::{Context, ExecutorHandle, NDArrayHandle, OpReqType, Shape, SymbolHandle};
use crate::engine::{Engine, EngineConfig, InferredShapes};
use crate::errors::GraphError;

pub use activation::Activation;
pub use json::{GraphExport, NodeExport};

use array::{ArrayData, Storage, lock};
use executor::BoundExecutor;
use node::{GraphView, IdAllocator, Node};
use operator::Operator;

/// Handle tables.
struct EngineState<B: Backend> {
    symbols: HashMap<SymbolHandle, Arc<Node>>,
    arrays: HashMap<NDArrayHandle, Storage<B>>,
    executors: HashMap<ExecutorHandle, BoundExecutor<B>>,
    /// Next auto-generated name suffix, per prefix.
    name_counters: HashMap<String, usize>,
    /// Every node name this engine has handed out or been given.
    used_names: HashSet<String>,
}

impl<B: Backend> EngineState<B> {
    fn new() -> Self {
        Self {
            symbols: HashMap::new(),
            arrays: HashMap::new(),
            executors: HashMap::new(),
            name_counters: HashMap::new(),
            used_names: HashSet::new(),
        }
    }

    fn symbol(&self, handle: SymbolHandle) -> Result<&Arc<Node>, GraphError> {
        self.symbols.get(&handle).ok_or(GraphError::InvalidHandle {
            kind: SymbolHandle::kind(),
            raw: handle.as_raw(),
        })
    }

    fn array(&self, handle: NDArrayHandle) -> Result<&Storage<B>, GraphError> {
        self.arrays.get(&handle).ok_or(GraphError::InvalidHandle {
            kind: NDArrayHandle::kind(),
            raw: handle.as_raw(),
        })
    }

    fn executor(&self, handle: ExecutorHandle) -> Result<&BoundExecutor<B>, GraphError> {
        self.executors.get(&handle).ok_or(GraphError::InvalidHandle {
            kind: ExecutorHandle::kind(),
            raw: handle.as_raw(),
        })
    }

    /// Next `{prefix}{n}` not already in use.
    fn auto_name(&mut self, prefix: &str) -> String {
        let counter = self.name_counters.entry(prefix.to_string()).or_insert(0);
        loop {
            let name = format!("{prefix}{counter}");
            *counter += 1;
            if self.used_names.insert(name.clone()) {
                return name;
            }
        }
    }

    fn reserve_name(&mut self, name: &str) {
        if !self.used_names.contains(name) {
            self.used_names.insert(name.to_string());
        }
    }
}

/// Graph engine running on a burn backend.
pub struct ReferenceEngine<B: Backend> {
    device: B::Device,
    config: EngineConfig,
    handles: IdAllocator,
    nodes: IdAllocator,
    state: Mutex<EngineState<B>>,
}

impl<B: Backend> fmt::Debug for ReferenceEngine<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("ReferenceEngine");
        debug
            .field("device", &self.device)
            .field("config", &self.config);
        if let Ok(state) = self.state.lock() {
            debug
                .field("symbols", &state.symbols.len())
                .field("arrays", &state.arrays.len())
                .field("executors", &state.executors.len());
        }
        debug.finish()
    }
}

impl<B: Backend> ReferenceEngine<B> {
    /// Creates an engine with the default configuration.
    pub fn new(device: B::Device) -> Self {
        Self::with_config(device, EngineConfig::default())
    }

    pub fn with_config(device: B::Device, config: EngineConfig) -> Self {
        Self {
            device,
            config,
            handles: IdAllocator::new(),
            nodes: IdAllocator::new(),
            state: Mutex::new(EngineState::new()),
        }
    }

    /// Wraps the engine for use by the front-end types.
    pub fn into_shared(self) -> Arc<dyn Engine> {
        Arc::new(self)
    }

    /// Returns the burn device every array is allocated on.
    pub fn device(&self) -> &B::Device {
        &self.device
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Number of live handles, as `(symbols, arrays, executors)`.
    pub fn live_handles(&self) -> Result<(usize, usize, usize), GraphError> {
        let state = lock(&self.state)?;
        Ok((
            state.symbols.len(),
            state.arrays.len(),
            state.executors.len(),
        ))
    }

    fn register_symbol(&self, state: &mut EngineState<B>, node: Arc<Node>) -> SymbolHandle {
        let handle = SymbolHandle::from_raw(self.handles.next());
        log::debug!("created {} ({})", handle, node.name);
        state.symbols.insert(handle, node);
        handle
    }

    fn register_array(&self, state: &mut EngineState<B>, storage: Storage<B>) -> NDArrayHandle {
        let handle = NDArrayHandle::from_raw(self.handles.next());
        state.arrays.insert(handle, storage);
        handle
    }

    fn with_array<T>(
        &self,
        handle: NDArrayHandle,
        f: impl FnOnce(&mut ArrayData<B>) -> Result<T, GraphError>,
    ) -> Result<T, GraphError> {
        let state = lock(&self.state)?;
        let storage = state.array(handle)?;
        let mut data = lock(storage)?;
        f(&mut data)
    }
}

/// Rejects names the engine cannot round-trip through its JSON format.
fn validate_name(name: &str) -> Result<(), GraphError> {
    if name.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(GraphError::InvalidName {
            name: name.to_string(),
        });
    }
    Ok(())
}

fn check_lengths(what: &'static str, keys: usize, values: usize) -> Result<(), GraphError> {
    if keys != values {
        return Err(GraphError::MismatchedLengths { what, keys, values });
    }
    Ok(())
}

impl<B: Backend> Engine for ReferenceEngine<B> {
    fn symbol_create_variable(&self, name: &str) -> Result<SymbolHandle, GraphError> {
        validate_name(name)?;
        let mut state = lock(&self.state)?;
        let name = if name.is_empty() {
            state.auto_name("var")
        } else {
            state.reserve_name(name);
            name.to_string()
        };
        let node = Node::variable(&self.nodes, name);
        Ok(self.register_symbol(&mut state, node))
    }

    fn symbol_create_atomic(
        &self,
        op_name: &str,
        name: &str,
        input_keys: &[&str],
        inputs: &[SymbolHandle],
        config_keys: &[&str],
        config_values: &[&str],
    ) -> Result<SymbolHandle, GraphError> {
        if !input_keys.is_empty() {
            check_lengths("input", input_keys.len(), inputs.len())?;
        }
        check_lengths("config", config_keys.len(), config_values.len())?;
        validate_name(name)?;

        let op = Operator::parse(op_name, config_keys, config_values)?;
        let slots = op.input_names();

        let mut state = lock(&self.state)?;
        let name = if name.is_empty() {
            state.auto_name(&op_name.to_lowercase())
        } else {
            state.reserve_name(name);
            name.to_string()
        };

        let mut assigned: Vec<Option<Arc<Node>>> = vec![None; slots.len()];
        if input_keys.is_empty() {
            if inputs.len() > slots.len() {
                return Err(GraphError::invalid_graph(format!(
                    "{op_name} takes at most {} inputs, got {}",
                    slots.len(),
                    inputs.len()
                )));
            }
            for (slot, handle) in assigned.iter_mut().zip(inputs) {
                *slot = Some(Arc::clone(state.symbol(*handle)?));
            }
        } else {
            for (key, handle) in input_keys.iter().zip(inputs) {
                let index = slots.iter().position(|s| s == key).ok_or_else(|| {
                    GraphError::invalid_graph(format!(
                        "{op_name} has no input named {key:?}; expected one of {slots:?}"
                    ))
                })?;
                if assigned[index].is_some() {
                    return Err(GraphError::invalid_graph(format!(
                        "input {key:?} of {name} given twice"
                    )));
                }
                assigned[index] = Some(Arc::clone(state.symbol(*handle)?));
            }
        }

        let node_inputs = assigned
            .into_iter()
            .zip(&slots)
            .map(|(input, slot)| {
                input.unwrap_or_else(|| {
                    let input_name = format!("{name}_{slot}");
                    state.reserve_name(&input_name);
                    Node::variable(&self.nodes, input_name)
                })
            })
            .collect();
        let node = Node::op(&self.nodes, name, op, node_inputs);
        Ok(self.register_symbol(&mut state, node))
    }

    fn symbol_copy(&self, handle: SymbolHandle) -> Result<SymbolHandle, GraphError> {
        let mut state = lock(&self.state)?;
        let copy = node::deep_copy(&self.nodes, state.symbol(handle)?);
        Ok(self.register_symbol(&mut state, copy))
    }

    fn symbol_free(&self, handle: SymbolHandle) -> Result<(), GraphError> {
        if handle.is_null() {
            return Ok(());
        }
        let mut state = lock(&self.state)?;
        match state.symbols.remove(&handle) {
            Some(_) => {
                log::debug!("freed {}", handle);
                Ok(())
            }
            None => Err(GraphError::InvalidHandle {
                kind: SymbolHandle::kind(),
                raw: handle.as_raw(),
            }),
        }
    }

    fn symbol_name(&self, handle: SymbolHandle) -> Result<String, GraphError> {
        let state = lock(&self.state)?;
        Ok(state.symbol(handle)?.name.clone())
    }

    fn symbol_list_arguments(&self, handle: SymbolHandle) -> Result<Vec<String>, GraphError> {
        let state = lock(&self.state)?;
        Ok(GraphView::new(state.symbol(handle)?).argument_names())
    }

    fn symbol_list_outputs(&self, handle: SymbolHandle) -> Result<Vec<String>, GraphError> {
        let state = lock(&self.state)?;
        Ok(vec![state.symbol(handle)?.output_name()])
    }

    fn symbol_list_auxiliary_states(
        &self,
        handle: SymbolHandle,
    ) -> Result<Vec<String>, GraphError> {
        let state = lock(&self.state)?;
        Ok(GraphView::new(state.symbol(handle)?).auxiliary_names())
    }

    fn symbol_infer_shape(
        &self,
        handle: SymbolHandle,
        known: &[(&str, &[usize])],
    ) -> Result<InferredShapes, GraphError> {
        let view = {
            let state = lock(&self.state)?;
            GraphView::new(state.symbol(handle)?)
        };
        shape::infer_shapes(&view, known, self.config.max_infer_passes)
    }

    fn symbol_save_to_json(&self, handle: SymbolHandle) -> Result<String, GraphError> {
        let export = {
            let state = lock(&self.state)?;
            GraphExport::from_head(state.symbol(handle)?)
        };
        Ok(serde_json::to_string_pretty(&export)?)
    }

    fn symbol_create_from_json(&self, json: &str) -> Result<SymbolHandle, GraphError> {
        let export: GraphExport = serde_json::from_str(json)?;
        for node in &export.nodes {
            validate_name(&node.name)?;
        }
        let names: Vec<String> = export.nodes.iter().map(|n| n.name.clone()).collect();
        let head = export.into_head(&self.nodes)?;
        let mut state = lock(&self.state)?;
        for name in &names {
            state.reserve_name(name);
        }
        Ok(self.register_symbol(&mut state, head))
    }

    fn ndarray_create(
        &self,
        shape: &[usize],
        context: Context,
    ) -> Result<NDArrayHandle, GraphError> {
        let storage = ArrayData::zeros(shape, context, &self.device)?.into_storage();
        let mut state = lock(&self.state)?;
        let handle = self.register_array(&mut state, storage);
        log::debug!("created {} {:?} on {}", handle, shape, context);
        Ok(handle)
    }

    fn ndarray_free(&self, handle: NDArrayHandle) -> Result<(), GraphError> {
        if handle.is_null() {
            return Ok(());
        }
        let mut state = lock(&self.state)?;
        match state.arrays.remove(&handle) {
            Some(_) => Ok(()),
            None => Err(GraphError::InvalidHandle {
                kind: NDArrayHandle::kind(),
                raw: handle.as_raw(),
            }),
        }
    }

    fn ndarray_shape(&self, handle: NDArrayHandle) -> Result<Shape, GraphError> {
        self.with_array(handle, |data| Ok(data.shape.clone()))
    }

    fn ndarray_context(&self, handle: NDArrayHandle) -> Result<Context, GraphError> {
        self.with_array(handle, |data| Ok(data.context))
    }

    fn ndarray_sync_copy_from(
        &self,
        handle: NDArrayHandle,
        data: &[f32],
    ) -> Result<(), GraphError> {
        self.with_array(handle, |array| array.copy_from(data))
    }

    fn ndarray_sync_copy_to(&self, handle: NDArrayHandle) -> Result<Vec<f32>, GraphError> {
        self.with_array(handle, |array| array.to_vec())
    }

    fn ndarray_sample_gaussian(
        &self,
        handle: NDArrayHandle,
        mean: f32,
        std: f32,
    ) -> Result<(), GraphError> {
        self.with_array(handle, |array| {
            array.sample_gaussian(mean, std);
            Ok(())
        })
    }

    fn executor_bind(
        &self,
        symbol: SymbolHandle,
        context: Context,
        arg_arrays: &[NDArrayHandle],
        grad_arrays: &[NDArrayHandle],
        grad_reqs: &[OpReqType],
        aux_arrays: &[NDArrayHandle],
    ) -> Result<ExecutorHandle, GraphError> {
        let mut state = lock(&self.state)?;
        let view = GraphView::new(state.symbol(symbol)?);

        let num_args = view.arguments.len();
        if arg_arrays.len() != num_args
            || grad_arrays.len() != num_args
            || grad_reqs.len() != num_args
        {
            return Err(GraphError::bind(format!(
                "graph has {} arguments, got {} arrays, {} gradients, {} requests",
                num_args,
                arg_arrays.len(),
                grad_arrays.len(),
                grad_reqs.len()
            )));
        }
        if aux_arrays.len() != view.auxiliary.len() {
            return Err(GraphError::bind(format!(
                "graph has {} auxiliary states, got {} arrays",
                view.auxiliary.len(),
                aux_arrays.len()
            )));
        }

        let describe = |storage: &Storage<B>| -> Result<(Shape, Context), GraphError> {
            let data = lock(storage)?;
            Ok((data.shape.clone(), data.context))
        };
        let check_context = |name: &str, actual: Context| -> Result<(), GraphError> {
            if self.config.strict_contexts && actual != context {
                return Err(GraphError::bind(format!(
                    "{name} lives on {actual}, executor is bound to {context}"
                )));
            }
            Ok(())
        };

        let args = arg_arrays
            .iter()
            .map(|h| state.array(*h).cloned())
            .collect::<Result<Vec<_>, _>>()?;
        let aux = aux_arrays
            .iter()
            .map(|h| state.array(*h).cloned())
            .collect::<Result<Vec<_>, _>>()?;

        let mut arg_shapes = Vec::with_capacity(num_args);
        for (node, storage) in view.arguments.iter().zip(&args) {
            let (shape, ctx) = describe(storage)?;
            check_context(&node.name, ctx)?;
            arg_shapes.push(shape);
        }

        let mut seen = HashSet::new();
        let known: Vec<(&str, &[usize])> = view
            .arguments
            .iter()
            .zip(&arg_shapes)
            .filter(|(node, _)| seen.insert(node.name.as_str()))
            .map(|(node, shape)| (node.name.as_str(), shape.as_slice()))
            .collect();
        let inferred = shape::infer_shapes(&view, &known, self.config.max_infer_passes)
            .map_err(|e| GraphError::bind(format!("argument arrays do not fit the graph: {e}")))?;
        if inferred.arg_shapes != arg_shapes {
            return Err(GraphError::bind(
                "arguments sharing a name were given different shapes",
            ));
        }

        for ((node, storage), expected) in view.auxiliary.iter().zip(&aux).zip(&inferred.aux_shapes)
        {
            let (shape, ctx) = describe(storage)?;
            check_context(&node.name, ctx)?;
            if &shape != expected {
                return Err(GraphError::ShapeMismatch {
                    node: node.name.clone(),
                    expected: expected.clone(),
                    actual: shape,
                });
            }
        }

        let mut grads = Vec::with_capacity(num_args);
        for (i, (handle, req)) in grad_arrays.iter().zip(grad_reqs).enumerate() {
            let name = &view.arguments[i].name;
            if handle.is_null() {
                if *req != OpReqType::NullOp {
                    return Err(GraphError::bind(format!(
                        "{name} requests {req:?} but has no gradient array"
                    )));
                }
                grads.push(None);
                continue;
            }
            let storage = state.array(*handle)?.clone();
            let (shape, ctx) = describe(&storage)?;
            check_context(name, ctx)?;
            if shape != arg_shapes[i] {
                return Err(GraphError::ShapeMismatch {
                    node: format!("{name} gradient"),
                    expected: arg_shapes[i].clone(),
                    actual: shape,
                });
            }
            grads.push(Some(storage));
        }

        let out_shape = inferred.out_shapes.first().cloned().unwrap_or_default();
        let output = ArrayData::zeros(&out_shape, context, &self.device)?.into_storage();
        let executor = BoundExecutor::new(
            context,
            view,
            args,
            grads,
            grad_reqs.to_vec(),
            aux,
            output,
        );

        let handle = ExecutorHandle::from_raw(self.handles.next());
        log::info!(
            "bound {} to {} on {} (output {:?})",
            symbol,
            handle,
            context,
            out_shape
        );
        state.executors.insert(handle, executor);
        Ok(handle)
    }

    fn executor_forward(&self, handle: ExecutorHandle, is_train: bool) -> Result<(), GraphError> {
        let state = lock(&self.state)?;
        state.executor(handle)?.forward(is_train)?;
        if self.config.verbose {
            log::info!("forward {} (is_train={})", handle, is_train);
        }
        Ok(())
    }

    fn executor_outputs(&self, handle: ExecutorHandle) -> Result<Vec<NDArrayHandle>, GraphError> {
        let mut state = lock(&self.state)?;
        let output = Arc::clone(&state.executor(handle)?.output);
        Ok(vec![self.register_array(&mut state, output)])
    }

    fn executor_free(&self, handle: ExecutorHandle) -> Result<(), GraphError> {
        if handle.is_null() {
            return Ok(());
        }
        let mut state = lock(&self.state)?;
        match state.executors.remove(&handle) {
            Some(_) => {
                log::debug!("freed {}", handle);
                Ok(())
            }
            None => Err(GraphError::InvalidHandle {
                kind: ExecutorHandle::kind(),
                raw: handle.as_raw(),
            }),
        }
    }
}
