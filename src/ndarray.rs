//! NDArray - shared handle to engine-owned tensor storage.

use std::fmt;
use std::sync::Arc;

use crate::base::{Context, NDArrayHandle, Shape, shape_size};
use crate::engine::Engine;
use crate::errors::GraphError;

/// Exclusive owner of one ndarray handle.
struct NDBlob {
    handle: NDArrayHandle,
    engine: Arc<dyn Engine>,
}

impl Drop for NDBlob {
    fn drop(&mut self) {
        if let Err(e) = self.engine.ndarray_free(self.handle) {
            log::warn!("failed to free {}: {}", self.handle, e);
        }
    }
}

/// A tensor living inside an engine.
///
/// Cloning shares the same storage; the handle is released when the last
/// clone is dropped.
#[derive(Clone)]
pub struct NDArray {
    blob: Arc<NDBlob>,
}

impl fmt::Debug for NDArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("NDArray").field(&self.blob.handle).finish()
    }
}

impl NDArray {
    /// Takes ownership of an existing handle.
    pub fn from_handle(engine: Arc<dyn Engine>, handle: NDArrayHandle) -> Self {
        Self {
            blob: Arc::new(NDBlob { handle, engine }),
        }
    }

    /// Allocates a zero-filled array.
    pub fn new(
        engine: &Arc<dyn Engine>,
        shape: &[usize],
        context: Context,
    ) -> Result<Self, GraphError> {
        let handle = engine.ndarray_create(shape, context)?;
        Ok(Self::from_handle(Arc::clone(engine), handle))
    }

    /// Allocates an array and fills it with `data`, laid out row-major.
    pub fn from_slice(
        engine: &Arc<dyn Engine>,
        data: &[f32],
        shape: &[usize],
        context: Context,
    ) -> Result<Self, GraphError> {
        if data.len() != shape_size(shape)? {
            return Err(GraphError::Tensor(format!(
                "{} values do not fill shape {:?}",
                data.len(),
                shape
            )));
        }
        let array = Self::new(engine, shape, context)?;
        array.sync_copy_from(data)?;
        Ok(array)
    }

    /// The underlying handle. Do not free it.
    pub fn handle(&self) -> NDArrayHandle {
        self.blob.handle
    }

    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.blob.engine
    }

    pub fn shape(&self) -> Result<Shape, GraphError> {
        self.engine().ndarray_shape(self.handle())
    }

    /// Number of elements.
    pub fn size(&self) -> Result<usize, GraphError> {
        shape_size(&self.shape()?)
    }

    pub fn context(&self) -> Result<Context, GraphError> {
        self.engine().ndarray_context(self.handle())
    }

    /// Overwrites the contents with `data`.
    pub fn sync_copy_from(&self, data: &[f32]) -> Result<(), GraphError> {
        self.engine().ndarray_sync_copy_from(self.handle(), data)
    }

    /// Copies the contents out, row-major.
    pub fn to_vec(&self) -> Result<Vec<f32>, GraphError> {
        self.engine().ndarray_sync_copy_to(self.handle())
    }

    /// Refills the array with samples from N(mean, std^2).
    pub fn sample_gaussian(&self, mean: f32, std: f32) -> Result<(), GraphError> {
        self.engine()
            .ndarray_sample_gaussian(self.handle(), mean, std)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ReferenceEngine;
    use burn::backend::NdArray as NdArrayBackend;

    fn engine() -> Arc<dyn Engine> {
        ReferenceEngine::<NdArrayBackend>::new(Default::default()).into_shared()
    }

    #[test]
    fn test_new_array_is_zeroed() {
        let engine = engine();
        let array = NDArray::new(&engine, &[2, 3], Context::cpu()).unwrap();
        assert_eq!(array.shape().unwrap(), vec![2, 3]);
        assert_eq!(array.size().unwrap(), 6);
        assert_eq!(array.context().unwrap(), Context::cpu());
        assert_eq!(array.to_vec().unwrap(), vec![0.0; 6]);
    }

    #[test]
    fn test_from_slice() {
        let engine = engine();
        let array = NDArray::from_slice(&engine, &[1.0, 2.0], &[2, 1], Context::cpu()).unwrap();
        assert_eq!(array.to_vec().unwrap(), vec![1.0, 2.0]);

        let err = NDArray::from_slice(&engine, &[1.0], &[2, 1], Context::cpu()).unwrap_err();
        assert!(matches!(err, GraphError::Tensor(_)));
    }

    #[test]
    fn test_overflowing_shapes_are_rejected() {
        let engine = engine();
        let err = NDArray::new(&engine, &[usize::MAX, 2], Context::cpu()).unwrap_err();
        assert!(matches!(err, GraphError::Tensor(_)));

        let err =
            NDArray::from_slice(&engine, &[1.0], &[usize::MAX, 2], Context::cpu()).unwrap_err();
        assert!(matches!(err, GraphError::Tensor(_)));
    }

    #[test]
    fn test_clones_share_storage() {
        let engine = engine();
        let array = NDArray::new(&engine, &[2], Context::cpu()).unwrap();
        let alias = array.clone();
        alias.sync_copy_from(&[3.0, 4.0]).unwrap();
        assert_eq!(array.to_vec().unwrap(), vec![3.0, 4.0]);
        assert_eq!(array.handle(), alias.handle());
    }

    #[test]
    fn test_last_drop_frees_handle() {
        let engine = engine();
        let array = NDArray::new(&engine, &[2], Context::cpu()).unwrap();
        let handle = array.handle();
        let alias = array.clone();
        drop(array);
        assert!(engine.ndarray_shape(handle).is_ok());
        drop(alias);
        assert!(matches!(
            engine.ndarray_shape(handle),
            Err(GraphError::InvalidHandle { .. })
        ));
    }
}
