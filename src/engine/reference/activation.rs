//! Activation functions for the `Activation` operator.

use burn::tensor::{Tensor, backend::Backend};
use serde::{Deserialize, Serialize};

/// Supported `act_type` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    /// Rectified Linear Unit: f(x) = max(0, x)
    Relu,
    /// Sigmoid: f(x) = 1 / (1 + exp(-x))
    Sigmoid,
    /// Hyperbolic tangent: f(x) = tanh(x)
    Tanh,
    /// Smooth ReLU: f(x) = ln(1 + exp(x))
    SoftRelu,
    /// Softsign: f(x) = x / (1 + |x|)
    SoftSign,
}

impl Activation {
    /// Applies the activation function to a tensor.
    pub fn apply<B: Backend, const D: usize>(&self, tensor: Tensor<B, D>) -> Tensor<B, D> {
        match self {
            Activation::Relu => burn::tensor::activation::relu(tensor),
            Activation::Sigmoid => burn::tensor::activation::sigmoid(tensor),
            Activation::Tanh => burn::tensor::activation::tanh(tensor),
            Activation::SoftRelu => (tensor.exp() + 1.0).log(),
            Activation::SoftSign => {
                let denominator = tensor.clone().abs() + 1.0;
                tensor.div(denominator)
            }
        }
    }

    /// Returns the `act_type` string.
    pub fn name(&self) -> &'static str {
        match self {
            Activation::Relu => "relu",
            Activation::Sigmoid => "sigmoid",
            Activation::Tanh => "tanh",
            Activation::SoftRelu => "softrelu",
            Activation::SoftSign => "softsign",
        }
    }

    /// Parses an `act_type` string.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "relu" => Some(Activation::Relu),
            "sigmoid" => Some(Activation::Sigmoid),
            "tanh" => Some(Activation::Tanh),
            "softrelu" => Some(Activation::SoftRelu),
            "softsign" => Some(Activation::SoftSign),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::backend::Backend;

    type TestBackend = NdArray;

    #[test]
    fn test_serde_names_match_act_type() {
        for act in [
            Activation::Relu,
            Activation::Sigmoid,
            Activation::Tanh,
            Activation::SoftRelu,
            Activation::SoftSign,
        ] {
            let json = serde_json::to_string(&act).unwrap();
            assert_eq!(json, format!("\"{}\"", act.name()));
            let back: Activation = serde_json::from_str(&json).unwrap();
            assert_eq!(back, act);
        }
    }

    #[test]
    fn test_activation_names() {
        for act in [
            Activation::Relu,
            Activation::Sigmoid,
            Activation::Tanh,
            Activation::SoftRelu,
            Activation::SoftSign,
        ] {
            assert_eq!(Activation::from_name(act.name()), Some(act));
        }
        assert_eq!(Activation::from_name("RELU"), Some(Activation::Relu));
        assert_eq!(Activation::from_name("gelu"), None);
    }

    #[test]
    fn test_relu_activation() {
        let device = <TestBackend as Backend>::Device::default();
        let input = Tensor::<TestBackend, 1>::from_floats([-1.0, 0.0, 2.5], &device);
        let result: Vec<f32> = Activation::Relu.apply(input).to_data().to_vec().unwrap();
        assert_eq!(result, vec![0.0, 0.0, 2.5]);
    }

    #[test]
    fn test_softrelu_activation() {
        let device = <TestBackend as Backend>::Device::default();
        let input = Tensor::<TestBackend, 1>::from_floats([0.0, 1.0], &device);
        let result: Vec<f32> = Activation::SoftRelu
            .apply(input)
            .to_data()
            .to_vec()
            .unwrap();
        assert!((result[0] - 2.0_f32.ln()).abs() < 1e-5);
        assert!((result[1] - (1.0 + 1.0_f32.exp()).ln()).abs() < 1e-5);
    }

    #[test]
    fn test_softsign_activation() {
        let device = <TestBackend as Backend>::Device::default();
        let input = Tensor::<TestBackend, 1>::from_floats([-3.0, 0.0, 1.0], &device);
        let result: Vec<f32> = Activation::SoftSign
            .apply(input)
            .to_data()
            .to_vec()
            .unwrap();
        assert!((result[0] - (-0.75)).abs() < 1e-5);
        assert!((result[1] - 0.0).abs() < 1e-5);
        assert!((result[2] - 0.5).abs() < 1e-5);
    }
}
