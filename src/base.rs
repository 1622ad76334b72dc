//! Handle, device and gradient-request types shared by every layer.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::GraphError;

/// Tensor shape, outermost dimension first.
pub type Shape = Vec<usize>;

macro_rules! engine_handle {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u64);

        impl $name {
            /// The null handle. Releasing it is a no-op.
            pub const NULL: Self = Self(0);

            /// Wraps a raw engine handle value.
            pub const fn from_raw(raw: u64) -> Self {
                Self(raw)
            }

            /// Returns the raw engine handle value.
            pub const fn as_raw(self) -> u64 {
                self.0
            }

            pub const fn is_null(self) -> bool {
                self.0 == 0
            }

            /// Handle kind, used in error messages.
            pub const fn kind() -> &'static str {
                $kind
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}#{}", $kind, self.0)
            }
        }
    };
}

engine_handle!(
    /// Opaque engine handle for a graph node or subgraph.
    SymbolHandle,
    "symbol"
);
engine_handle!(
    /// Opaque engine handle for tensor storage.
    NDArrayHandle,
    "ndarray"
);
engine_handle!(
    /// Opaque engine handle for a bound executor.
    ExecutorHandle,
    "executor"
);

/// Kind of device an array or executor lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    #[default]
    Cpu,
    Gpu,
}

/// Device placement descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct Context {
    pub device_type: DeviceType,
    pub device_id: u32,
}

impl Context {
    pub const fn new(device_type: DeviceType, device_id: u32) -> Self {
        Self {
            device_type,
            device_id,
        }
    }

    /// CPU context with device id 0.
    pub const fn cpu() -> Self {
        Self::new(DeviceType::Cpu, 0)
    }

    pub const fn gpu(device_id: u32) -> Self {
        Self::new(DeviceType::Gpu, device_id)
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.device_type {
            DeviceType::Cpu => "cpu",
            DeviceType::Gpu => "gpu",
        };
        write!(f, "{}({})", kind, self.device_id)
    }
}

/// How an executor writes the gradient of an argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum OpReqType {
    /// No gradient is computed.
    NullOp,
    /// Overwrite the gradient buffer.
    #[default]
    WriteTo,
    /// Accumulate into the gradient buffer.
    AddTo,
}

/// Number of elements described by a shape.
pub(crate) fn shape_size(shape: &[usize]) -> Result<usize, GraphError> {
    shape
        .iter()
        .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
        .ok_or_else(|| GraphError::Tensor(format!("shape {shape:?} has too many elements")))
}
