//! Tensor storage behind ndarray handles.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use burn::tensor::{Distribution, Tensor, backend::Backend};

use crate::base::{Context, Shape, shape_size};
use crate::errors::GraphError;

/// Storage shared by every handle (and executor) that aliases one array.
pub type Storage<B> = Arc<Mutex<ArrayData<B>>>;

/// A flat tensor plus the logical shape it represents.
#[derive(Clone)]
pub struct ArrayData<B: Backend> {
    pub shape: Shape,
    pub context: Context,
    pub values: Tensor<B, 1>,
}

impl<B: Backend> fmt::Debug for ArrayData<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArrayData")
            .field("shape", &self.shape)
            .field("context", &self.context)
            .finish()
    }
}

impl<B: Backend> ArrayData<B> {
    pub fn zeros(
        shape: &[usize],
        context: Context,
        device: &B::Device,
    ) -> Result<Self, GraphError> {
        Ok(Self {
            shape: shape.to_vec(),
            context,
            values: Tensor::zeros([shape_size(shape)?], device),
        })
    }

    pub fn into_storage(self) -> Storage<B> {
        Arc::new(Mutex::new(self))
    }

    /// Number of stored elements.
    pub fn size(&self) -> usize {
        let [len] = self.values.dims();
        len
    }

    pub fn copy_from(&mut self, data: &[f32]) -> Result<(), GraphError> {
        if data.len() != self.size() {
            return Err(GraphError::Tensor(format!(
                "cannot copy {} values into an array of shape {:?}",
                data.len(),
                self.shape
            )));
        }
        let device = self.values.device();
        self.values = Tensor::from_floats(data, &device);
        Ok(())
    }

    pub fn to_vec(&self) -> Result<Vec<f32>, GraphError> {
        self.values
            .to_data()
            .to_vec()
            .map_err(|e| GraphError::Tensor(format!("{e:?}")))
    }

    pub fn sample_gaussian(&mut self, mean: f32, std: f32) {
        let device = self.values.device();
        self.values = Tensor::random(
            [self.size()],
            Distribution::Normal(mean as f64, std as f64),
            &device,
        );
    }

    /// Replaces the values, keeping shape and context.
    pub fn write(&mut self, values: Tensor<B, 1>) -> Result<(), GraphError> {
        let [len] = values.dims();
        if len != self.size() {
            return Err(GraphError::Tensor(format!(
                "cannot write {} values into an array of shape {:?}",
                len, self.shape
            )));
        }
        self.values = values;
        Ok(())
    }
}

/// Locks a mutex, reporting poisoning as an engine state error.
pub fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, GraphError> {
    mutex
        .lock()
        .map_err(|_| GraphError::EngineState("lock poisoned by a panicking thread".to_string()))
}
