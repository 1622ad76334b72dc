//! Symbol - the graph construction and binding facade.
//!
//! A [`Symbol`] is a shared handle to one node (and the subgraph behind it)
//! inside an [`Engine`]. Symbols are immutable: composing them always
//! produces a new symbol.
//!
//! # Example
//!
//! ```
//! use std::collections::HashMap;
//! use burn::backend::NdArray;
//! use symgraph::prelude::*;
//!
//! let engine = ReferenceEngine::<NdArray>::new(Default::default()).into_shared();
//! let a = Symbol::variable(&engine, "a").unwrap();
//! let b = Symbol::variable(&engine, "b").unwrap();
//! let sum = (&a + &b).unwrap();
//! assert_eq!(sum.list_arguments().unwrap(), vec!["a", "b"]);
//!
//! let shapes = sum
//!     .infer_shape(&HashMap::from([("a".to_string(), vec![2, 3])]))
//!     .unwrap();
//! assert_eq!(shapes.out_shapes, vec![vec![2, 3]]);
//! ```

use std::collections::HashMap;
use std::fmt;
use std::ops;
use std::sync::Arc;

use crate::base::{Context, OpReqType, Shape, SymbolHandle};
use crate::engine::{Engine, InferredShapes, same_engine};
use crate::errors::GraphError;
use crate::executor::{Executor, ExecutorArrays};
use crate::ndarray::NDArray;

/// Exclusive owner of one symbol handle.
///
/// Dropping the blob releases the handle exactly once, null included. The
/// blob cannot be cloned; share it through [`Symbol`].
pub struct SymBlob {
    handle: SymbolHandle,
    engine: Arc<dyn Engine>,
}

impl SymBlob {
    /// A blob holding the null handle.
    pub fn null(engine: Arc<dyn Engine>) -> Self {
        Self::new(engine, SymbolHandle::NULL)
    }

    /// Takes ownership of `handle`.
    pub fn new(engine: Arc<dyn Engine>, handle: SymbolHandle) -> Self {
        Self { handle, engine }
    }

    pub fn handle(&self) -> SymbolHandle {
        self.handle
    }
}

impl Drop for SymBlob {
    fn drop(&mut self) {
        if let Err(e) = self.engine.symbol_free(self.handle) {
            log::warn!("failed to free {}: {}", self.handle, e);
        }
    }
}

impl fmt::Debug for SymBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SymBlob").field(&self.handle).finish()
    }
}

/// A node or subgraph in a computation graph.
///
/// Cloning is cheap and shares the underlying handle.
#[derive(Clone, Debug)]
pub struct Symbol {
    blob: Arc<SymBlob>,
}

impl Symbol {
    /// Takes ownership of an existing handle issued by `engine`.
    pub fn from_handle(engine: Arc<dyn Engine>, handle: SymbolHandle) -> Self {
        Self {
            blob: Arc::new(SymBlob::new(engine, handle)),
        }
    }

    /// Creates a variable. An empty name lets the engine generate one.
    pub fn variable(engine: &Arc<dyn Engine>, name: &str) -> Result<Self, GraphError> {
        let handle = engine.symbol_create_variable(name)?;
        Ok(Self::from_handle(Arc::clone(engine), handle))
    }

    /// Creates an operator node.
    ///
    /// `input_keys`/`input_values` and `config_keys`/`config_values` are
    /// parallel sequences; inputs left out become fresh variables named
    /// `{name}_{input}`.
    pub fn from_operator(
        engine: &Arc<dyn Engine>,
        operator_name: &str,
        name: &str,
        input_keys: &[&str],
        input_values: &[&Symbol],
        config_keys: &[&str],
        config_values: &[&str],
    ) -> Result<Self, GraphError> {
        if input_keys.len() != input_values.len() {
            return Err(GraphError::MismatchedLengths {
                what: "input",
                keys: input_keys.len(),
                values: input_values.len(),
            });
        }
        if config_keys.len() != config_values.len() {
            return Err(GraphError::MismatchedLengths {
                what: "config",
                keys: config_keys.len(),
                values: config_values.len(),
            });
        }
        let inputs = input_handles(engine, input_values)?;

        let handle = engine.symbol_create_atomic(
            operator_name,
            name,
            input_keys,
            &inputs,
            config_keys,
            config_values,
        )?;
        Ok(Self::from_handle(Arc::clone(engine), handle))
    }

    /// The underlying handle. Do not free it.
    pub fn handle(&self) -> SymbolHandle {
        self.blob.handle
    }

    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.blob.engine
    }

    /// Name of the head node.
    pub fn name(&self) -> Result<String, GraphError> {
        self.engine().symbol_name(self.handle())
    }

    /// Deep copy with its own handle and lifetime.
    pub fn copy(&self) -> Result<Self, GraphError> {
        let handle = self.engine().symbol_copy(self.handle())?;
        Ok(Self::from_handle(Arc::clone(self.engine()), handle))
    }

    fn binary(&self, operator_name: &str, rhs: &Symbol) -> Result<Self, GraphError> {
        Self::from_operator(
            self.engine(),
            operator_name,
            "",
            &["lhs", "rhs"],
            &[self, rhs],
            &[],
            &[],
        )
    }

    /// Elementwise `self + rhs`.
    pub fn plus(&self, rhs: &Symbol) -> Result<Self, GraphError> {
        self.binary("_Plus", rhs)
    }

    /// Elementwise `self - rhs`.
    pub fn minus(&self, rhs: &Symbol) -> Result<Self, GraphError> {
        self.binary("_Minus", rhs)
    }

    /// Elementwise `self * rhs`.
    pub fn multiply(&self, rhs: &Symbol) -> Result<Self, GraphError> {
        self.binary("_Mul", rhs)
    }

    /// Elementwise `self / rhs`.
    pub fn divide(&self, rhs: &Symbol) -> Result<Self, GraphError> {
        self.binary("_Div", rhs)
    }

    /// Argument names in positional binding order. Unnamed slots are empty.
    pub fn list_arguments(&self) -> Result<Vec<String>, GraphError> {
        self.engine().symbol_list_arguments(self.handle())
    }

    pub fn list_outputs(&self) -> Result<Vec<String>, GraphError> {
        self.engine().symbol_list_outputs(self.handle())
    }

    pub fn list_auxiliary_states(&self) -> Result<Vec<String>, GraphError> {
        self.engine().symbol_list_auxiliary_states(self.handle())
    }

    /// Infers every argument, auxiliary and output shape from the known
    /// argument shapes.
    pub fn infer_shape(
        &self,
        arg_shapes: &HashMap<String, Shape>,
    ) -> Result<InferredShapes, GraphError> {
        let known: Vec<(&str, &[usize])> = arg_shapes
            .iter()
            .map(|(name, shape)| (name.as_str(), shape.as_slice()))
            .collect();
        self.engine().symbol_infer_shape(self.handle(), &known)
    }

    /// Known shapes for the entries of `arrays` that name an argument.
    fn known_shapes(
        &self,
        arg_names: &[String],
        arrays: &HashMap<String, NDArray>,
    ) -> Result<HashMap<String, Shape>, GraphError> {
        let mut shapes = HashMap::new();
        for name in arg_names {
            if let Some(array) = arrays.get(name) {
                shapes.insert(name.clone(), array.shape()?);
            }
        }
        Ok(shapes)
    }

    fn sampled_array(&self, shape: &[usize], context: Context) -> Result<NDArray, GraphError> {
        let array = NDArray::new(self.engine(), shape, context)?;
        array.sample_gaussian(0.0, 1.0)?;
        Ok(array)
    }

    /// Completes `known_args` into an array for every argument.
    ///
    /// Missing arguments are allocated on `context` with their inferred shape
    /// and sampled from N(0, 1). Entries that name no argument are ignored.
    pub fn infer_args_map(
        &self,
        context: Context,
        known_args: &HashMap<String, NDArray>,
    ) -> Result<HashMap<String, NDArray>, GraphError> {
        let arg_names = self.list_arguments()?;
        let shapes = self.infer_shape(&self.known_shapes(&arg_names, known_args)?)?;

        let mut args_map = HashMap::with_capacity(arg_names.len());
        for (name, shape) in arg_names.into_iter().zip(shapes.arg_shapes) {
            let array = match known_args.get(&name) {
                Some(array) => array.clone(),
                None => self.sampled_array(&shape, context)?,
            };
            args_map.insert(name, array);
        }
        Ok(args_map)
    }

    /// Infers every array an executor needs.
    ///
    /// For each argument: the array comes from `args_map` or is sampled from
    /// N(0, 1); the request comes from `grad_req_type` or defaults to
    /// [`OpReqType::WriteTo`]; the gradient buffer comes from
    /// `arg_grad_store` or is zero-allocated, except that `NullOp` arguments
    /// without a supplied buffer get none. Auxiliary states come from
    /// `args_map` or are zero-allocated.
    pub fn infer_executor_arrays(
        &self,
        context: Context,
        args_map: &HashMap<String, NDArray>,
        arg_grad_store: &HashMap<String, NDArray>,
        grad_req_type: &HashMap<String, OpReqType>,
    ) -> Result<ExecutorArrays, GraphError> {
        let arg_names = self.list_arguments()?;
        let aux_names = self.list_auxiliary_states()?;
        let shapes = self.infer_shape(&self.known_shapes(&arg_names, args_map)?)?;

        let mut arrays = ExecutorArrays::default();
        for (name, shape) in arg_names.iter().zip(&shapes.arg_shapes) {
            let array = match args_map.get(name) {
                Some(array) => array.clone(),
                None => self.sampled_array(shape, context)?,
            };
            let req = grad_req_type.get(name).copied().unwrap_or_default();
            let grad = match arg_grad_store.get(name) {
                Some(grad) => Some(grad.clone()),
                None if req == OpReqType::NullOp => None,
                None => Some(NDArray::new(self.engine(), shape, context)?),
            };
            arrays.arg_arrays.push(array);
            arrays.grad_arrays.push(grad);
            arrays.grad_reqs.push(req);
        }

        for (name, shape) in aux_names.iter().zip(&shapes.aux_shapes) {
            let array = match args_map.get(name) {
                Some(array) => array.clone(),
                None => NDArray::new(self.engine(), shape, context)?,
            };
            arrays.aux_arrays.push(array);
        }

        Ok(arrays)
    }

    /// Infers the missing arrays, then binds.
    ///
    /// The returned executor is owned by the caller and released on drop.
    pub fn simple_bind(
        &self,
        context: Context,
        args_map: &HashMap<String, NDArray>,
        arg_grad_store: &HashMap<String, NDArray>,
        grad_req_type: &HashMap<String, OpReqType>,
    ) -> Result<Executor, GraphError> {
        let arrays =
            self.infer_executor_arrays(context, args_map, arg_grad_store, grad_req_type)?;
        Executor::bind(self.clone(), context, arrays)
    }

    /// Binds fully-formed arrays, ordered like [`Symbol::list_arguments`] and
    /// [`Symbol::list_auxiliary_states`].
    ///
    /// The returned executor is owned by the caller and released on drop.
    pub fn bind(
        &self,
        context: Context,
        arg_arrays: &[NDArray],
        grad_arrays: &[Option<NDArray>],
        grad_reqs: &[OpReqType],
        aux_arrays: &[NDArray],
    ) -> Result<Executor, GraphError> {
        let arrays = ExecutorArrays {
            arg_arrays: arg_arrays.to_vec(),
            grad_arrays: grad_arrays.to_vec(),
            grad_reqs: grad_reqs.to_vec(),
            aux_arrays: aux_arrays.to_vec(),
        };
        Executor::bind(self.clone(), context, arrays)
    }

    /// Serializes the graph to the engine's JSON format.
    pub fn to_json(&self) -> Result<String, GraphError> {
        self.engine().symbol_save_to_json(self.handle())
    }

    /// Loads a graph saved by [`Symbol::to_json`].
    pub fn from_json(engine: &Arc<dyn Engine>, json: &str) -> Result<Self, GraphError> {
        let handle = engine.symbol_create_from_json(json)?;
        Ok(Self::from_handle(Arc::clone(engine), handle))
    }
}

/// Handles of `inputs`, all of which must belong to `engine`.
pub(crate) fn input_handles(
    engine: &Arc<dyn Engine>,
    inputs: &[&Symbol],
) -> Result<Vec<SymbolHandle>, GraphError> {
    inputs
        .iter()
        .map(|s| {
            if same_engine(engine, s.engine()) {
                Ok(s.handle())
            } else {
                Err(GraphError::EngineMismatch)
            }
        })
        .collect()
}

macro_rules! impl_symbol_op {
    ($trait:ident, $method:ident, $call:ident) => {
        impl ops::$trait<&Symbol> for &Symbol {
            type Output = Result<Symbol, GraphError>;

            fn $method(self, rhs: &Symbol) -> Self::Output {
                self.$call(rhs)
            }
        }

        impl ops::$trait<Symbol> for Symbol {
            type Output = Result<Symbol, GraphError>;

            fn $method(self, rhs: Symbol) -> Self::Output {
                (&self).$call(&rhs)
            }
        }
    };
}

impl_symbol_op!(Add, add, plus);
impl_symbol_op!(Sub, sub, minus);
impl_symbol_op!(Mul, mul, multiply);
impl_symbol_op!(Div, div, divide);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ReferenceEngine;
    use burn::backend::NdArray as NdArrayBackend;

    fn engine() -> Arc<dyn Engine> {
        ReferenceEngine::<NdArrayBackend>::new(Default::default()).into_shared()
    }

    #[test]
    fn test_variable_lists_its_name() {
        let engine = engine();
        let x = Symbol::variable(&engine, "x").unwrap();
        assert_eq!(x.list_arguments().unwrap(), vec!["x"]);
        assert_eq!(x.list_outputs().unwrap(), vec!["x"]);
        assert!(x.list_auxiliary_states().unwrap().is_empty());
        assert_eq!(x.name().unwrap(), "x");
    }

    #[test]
    fn test_unnamed_variable_gets_generated_name() {
        let engine = engine();
        let x = Symbol::variable(&engine, "").unwrap();
        let args = x.list_arguments().unwrap();
        assert_eq!(args.len(), 1);
        assert!(!args[0].is_empty());
    }

    #[test]
    fn test_operators_do_not_mutate_operands() {
        let engine = engine();
        let a = Symbol::variable(&engine, "a").unwrap();
        let b = Symbol::variable(&engine, "b").unwrap();

        for result in [&a + &b, &a - &b, &a * &b, &a / &b] {
            let composed = result.unwrap();
            assert_eq!(composed.list_arguments().unwrap(), vec!["a", "b"]);
            assert_ne!(composed.handle(), a.handle());
        }
        assert_eq!(a.list_arguments().unwrap(), vec!["a"]);
        assert_eq!(b.list_arguments().unwrap(), vec!["b"]);
    }

    #[test]
    fn test_owned_operators() {
        let engine = engine();
        let a = Symbol::variable(&engine, "a").unwrap();
        let b = Symbol::variable(&engine, "b").unwrap();
        let quotient = (a / b).unwrap();
        assert_eq!(quotient.list_arguments().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_operands_from_different_engines() {
        let first = engine();
        let second = engine();
        let a = Symbol::variable(&first, "a").unwrap();
        let b = Symbol::variable(&second, "b").unwrap();
        assert!(matches!(&a + &b, Err(GraphError::EngineMismatch)));
    }

    #[test]
    fn test_mismatched_operator_lengths() {
        let engine = engine();
        let x = Symbol::variable(&engine, "x").unwrap();

        let inputs = Symbol::from_operator(&engine, "_Plus", "p", &["lhs", "rhs"], &[&x], &[], &[])
            .unwrap_err();
        assert!(matches!(
            inputs,
            GraphError::MismatchedLengths {
                what: "input",
                keys: 2,
                values: 1
            }
        ));

        let config = Symbol::from_operator(
            &engine,
            "FullyConnected",
            "fc",
            &["data"],
            &[&x],
            &["num_hidden", "no_bias"],
            &["4"],
        )
        .unwrap_err();
        assert!(matches!(
            config,
            GraphError::MismatchedLengths { what: "config", .. }
        ));
    }

    #[test]
    fn test_copy_is_independent() {
        let engine = engine();
        let x = Symbol::variable(&engine, "x").unwrap();
        let fc = Symbol::from_operator(
            &engine,
            "FullyConnected",
            "fc",
            &["data"],
            &[&x],
            &["num_hidden"],
            &["3"],
        )
        .unwrap();

        let copy = fc.copy().unwrap();
        assert_ne!(copy.handle(), fc.handle());
        assert_eq!(copy.list_arguments().unwrap(), fc.list_arguments().unwrap());
        assert_eq!(copy.list_outputs().unwrap(), fc.list_outputs().unwrap());

        drop(copy);
        assert_eq!(fc.list_arguments().unwrap(), vec!["x", "fc_weight", "fc_bias"]);
    }

    #[test]
    fn test_infer_shape_elementwise() {
        let engine = engine();
        let a = Symbol::variable(&engine, "a").unwrap();
        let b = Symbol::variable(&engine, "b").unwrap();
        let product = (&a * &b).unwrap();

        let shapes = product
            .infer_shape(&HashMap::from([("b".to_string(), vec![4, 2])]))
            .unwrap();
        assert_eq!(shapes.arg_shapes, vec![vec![4, 2], vec![4, 2]]);
        assert_eq!(shapes.out_shapes, vec![vec![4, 2]]);
    }

    #[test]
    fn test_infer_shape_without_information_fails() {
        let engine = engine();
        let a = Symbol::variable(&engine, "a").unwrap();
        let b = Symbol::variable(&engine, "b").unwrap();
        let sum = (&a + &b).unwrap();
        assert!(matches!(
            sum.infer_shape(&HashMap::new()),
            Err(GraphError::IncompleteShapes { .. })
        ));
    }

    #[test]
    fn test_infer_args_map_fills_missing() {
        let engine = engine();
        let x = Symbol::variable(&engine, "x").unwrap();
        let fc = Symbol::from_operator(
            &engine,
            "FullyConnected",
            "fc",
            &["data"],
            &[&x],
            &["num_hidden"],
            &["2"],
        )
        .unwrap();
        let data = NDArray::new(&engine, &[5, 3], Context::cpu()).unwrap();
        let unrelated = NDArray::new(&engine, &[1], Context::cpu()).unwrap();
        let known = HashMap::from([
            ("x".to_string(), data.clone()),
            ("label".to_string(), unrelated),
        ]);

        let args = fc.infer_args_map(Context::cpu(), &known).unwrap();
        assert_eq!(args.len(), 3);
        assert_eq!(args["x"].handle(), data.handle());
        assert_eq!(args["fc_weight"].shape().unwrap(), vec![2, 3]);
        assert_eq!(args["fc_bias"].shape().unwrap(), vec![2]);
    }

    #[test]
    fn test_generated_names_keep_arguments_distinct() {
        let engine = engine();
        let chosen = Symbol::variable(&engine, "var0").unwrap();
        let generated = Symbol::variable(&engine, "").unwrap();
        let sum = (&chosen + &generated).unwrap();

        let known = HashMap::from([(
            "var0".to_string(),
            NDArray::new(&engine, &[2], Context::cpu()).unwrap(),
        )]);
        let args = sum.infer_args_map(Context::cpu(), &known).unwrap();
        assert_eq!(args.len(), 2);
        assert_eq!(args[&generated.name().unwrap()].shape().unwrap(), vec![2]);
    }

    #[test]
    fn test_infer_executor_arrays_grad_requests() {
        let engine = engine();
        let x = Symbol::variable(&engine, "x").unwrap();
        let bn = Symbol::from_operator(&engine, "BatchNorm", "bn", &["data"], &[&x], &[], &[])
            .unwrap();
        let data = NDArray::new(&engine, &[4, 3], Context::cpu()).unwrap();
        let gamma_grad = NDArray::new(&engine, &[3], Context::cpu()).unwrap();

        let arrays = bn
            .infer_executor_arrays(
                Context::cpu(),
                &HashMap::from([("x".to_string(), data)]),
                &HashMap::from([("bn_gamma".to_string(), gamma_grad.clone())]),
                &HashMap::from([
                    ("x".to_string(), OpReqType::NullOp),
                    ("bn_gamma".to_string(), OpReqType::AddTo),
                ]),
            )
            .unwrap();

        assert_eq!(
            arrays.grad_reqs,
            vec![OpReqType::NullOp, OpReqType::AddTo, OpReqType::WriteTo]
        );
        assert!(arrays.grad_arrays[0].is_none());
        assert_eq!(
            arrays.grad_arrays[1].as_ref().unwrap().handle(),
            gamma_grad.handle()
        );
        assert_eq!(
            arrays.grad_arrays[2].as_ref().unwrap().shape().unwrap(),
            vec![3]
        );
        assert_eq!(arrays.aux_arrays.len(), 2);
        assert_eq!(arrays.aux_arrays[0].to_vec().unwrap(), vec![0.0; 3]);
    }

    #[test]
    fn test_json_round_trip() {
        let engine = engine();
        let a = Symbol::variable(&engine, "a").unwrap();
        let b = Symbol::variable(&engine, "b").unwrap();
        let diff = (&a - &b).unwrap();

        let loaded = Symbol::from_json(&engine, &diff.to_json().unwrap()).unwrap();
        assert_ne!(loaded.handle(), diff.handle());
        assert_eq!(loaded.list_arguments().unwrap(), vec!["a", "b"]);
        assert_eq!(loaded.name().unwrap(), diff.name().unwrap());
    }

    #[test]
    fn test_null_blob_drop_is_safe() {
        let engine = engine();
        let blob = SymBlob::null(Arc::clone(&engine));
        assert!(blob.handle().is_null());
        drop(blob);
    }
}
