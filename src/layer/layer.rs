use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{
    error::{CrnnError, Result},
    tensor::{Tensor, TensorDesc},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ForwardMode {
    // Batch statistics, caches activations for backward
    Train,
    // Running statistics, nothing cached
    Eval,
}

/// A named parameter buffer with its gradient.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    pub desc: TensorDesc,
    pub value: Vec<f32>,
    #[serde(skip)]
    pub grad: Vec<f32>,
}

impl Param {
    pub fn new(name: &str, desc: TensorDesc, value: Vec<f32>) -> Self {
        let grad = vec![0.0; value.len()];
        Self {
            name: name.to_string(),
            desc,
            value,
            grad,
        }
    }

    pub fn len(&self) -> usize {
        self.value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    pub fn zero_grad(&mut self) {
        self.grad.clear();
        self.grad.resize(self.value.len(), 0.0);
    }

    /// Copies values from a snapshot after checking the shape matches.
    pub fn load_from(&mut self, other: &Param) -> Result<()> {
        if other.desc != self.desc || other.value.len() != self.value.len() {
            return Err(CrnnError::ShapeMismatch {
                context: format!("restoring parameter {}", self.name),
                expected: self.desc.to_string(),
                actual: other.desc.to_string(),
            });
        }
        self.value.copy_from_slice(&other.value);
        Ok(())
    }
}

pub trait Layer: Send {
    // Shape of the single output given the single input
    fn output_shape(&self, input_shape: &TensorDesc) -> Result<TensorDesc>;

    fn forward(&mut self, input: &Tensor, mode: ForwardMode) -> Result<Tensor>;

    // Consumes the activations cached by the last Train forward
    fn backward(&mut self, grad_output: &Tensor) -> Result<Tensor>;

    // Trainable parameters, in a stable order
    fn parameters(&self) -> Vec<&Param> {
        Vec::new()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Param> {
        Vec::new()
    }

    // Non-trainable buffers that still belong in a snapshot
    fn state(&self) -> Vec<&Param> {
        Vec::new()
    }

    fn state_mut(&mut self) -> Vec<&mut Param> {
        Vec::new()
    }

    fn requires_parameters(&self) -> bool {
        self.parameter_count() > 0
    }

    fn parameter_count(&self) -> usize {
        self.parameters().iter().map(|p| p.len()).sum()
    }

    // Parameters, their gradients and the activation + its gradient
    fn memory_requirements(&self, output_shape: &TensorDesc) -> u64 {
        let parameter_bytes = (self.parameter_count() * std::mem::size_of::<f32>()) as u64;
        parameter_bytes * 2 + output_shape.size_in_bytes() as u64 * 2
    }

    fn name(&self) -> String;

    fn config_string(&self) -> Option<String> {
        None
    }
}

impl fmt::Display for dyn Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.config_string() {
            Some(config) => write!(f, "{}({})", self.name(), config),
            None => write!(f, "{}", self.name()),
        }
    }
}

pub(crate) fn missing_cache(layer: &str) -> CrnnError {
    CrnnError::Layer(format!("{} backward called without a training forward pass", layer))
}

pub(crate) fn expect_same_shape(context: &str, expected: &TensorDesc, actual: &TensorDesc) -> Result<()> {
    if expected != actual {
        return Err(CrnnError::ShapeMismatch {
            context: context.to_string(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        });
    }
    Ok(())
}
