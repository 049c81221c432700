use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{
    error::Result,
    tensor::{Tensor, TensorDesc},
};

use super::layer::{expect_same_shape, missing_cache, ForwardMode, Layer};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivationType {
    ReLU,
    // Normalises over the innermost axis
    Softmax,
}

impl ActivationType {
    pub fn name(&self) -> String {
        match self {
            ActivationType::ReLU => "ReLU".to_string(),
            ActivationType::Softmax => "Softmax".to_string(),
        }
    }
}

fn innermost(desc: &TensorDesc) -> usize {
    desc.to_dims().last().copied().unwrap_or(1).max(1)
}

#[derive(Clone)]
pub struct ActivationLayer {
    pub activation_type: ActivationType,
    // ReLU keeps its input, Softmax keeps its output
    cached: Option<Tensor>,
}

impl ActivationLayer {
    pub fn new(activation_type: ActivationType) -> Self {
        Self {
            activation_type,
            cached: None,
        }
    }
}

impl Layer for ActivationLayer {
    fn output_shape(&self, input_shape: &TensorDesc) -> Result<TensorDesc> {
        Ok(input_shape.clone())
    }

    fn forward(&mut self, input: &Tensor, mode: ForwardMode) -> Result<Tensor> {
        let output = match self.activation_type {
            ActivationType::ReLU => {
                let data = input.data.par_iter().map(|v| v.max(0.0)).collect();
                Tensor::new(input.desc.clone(), data)?
            }
            ActivationType::Softmax => {
                let width = innermost(&input.desc);
                let mut data = input.data.clone();
                data.par_chunks_mut(width).for_each(|row| {
                    let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                    let mut sum = 0.0;
                    for v in row.iter_mut() {
                        *v = (*v - max).exp();
                        sum += *v;
                    }
                    for v in row.iter_mut() {
                        *v /= sum;
                    }
                });
                Tensor::new(input.desc.clone(), data)?
            }
        };

        self.cached = match (mode, self.activation_type) {
            (ForwardMode::Eval, _) => None,
            (ForwardMode::Train, ActivationType::ReLU) => Some(input.clone()),
            (ForwardMode::Train, ActivationType::Softmax) => Some(output.clone()),
        };
        Ok(output)
    }

    fn backward(&mut self, grad_output: &Tensor) -> Result<Tensor> {
        let cached = self
            .cached
            .as_ref()
            .ok_or_else(|| missing_cache(&self.activation_type.name()))?;
        expect_same_shape("activation gradient", &cached.desc, &grad_output.desc)?;

        let data = match self.activation_type {
            ActivationType::ReLU => cached
                .data
                .par_iter()
                .zip(grad_output.data.par_iter())
                .map(|(x, g)| if *x > 0.0 { *g } else { 0.0 })
                .collect(),
            ActivationType::Softmax => {
                // dx = y * (dy - <dy, y>)
                let width = innermost(&cached.desc);
                let mut grad = grad_output.data.clone();
                grad.par_chunks_mut(width)
                    .zip(cached.data.par_chunks(width))
                    .for_each(|(g, y)| {
                        let dot: f32 = g.iter().zip(y).map(|(a, b)| a * b).sum();
                        for (gi, yi) in g.iter_mut().zip(y) {
                            *gi = yi * (*gi - dot);
                        }
                    });
                grad
            }
        };
        Tensor::new(cached.desc.clone(), data)
    }

    fn memory_requirements(&self, output_shape: &TensorDesc) -> u64 {
        output_shape.size_in_bytes() as u64 * 2
    }

    fn name(&self) -> String {
        self.activation_type.name()
    }

    fn config_string(&self) -> Option<String> {
        match self.activation_type {
            ActivationType::Softmax => Some("axis=-1".to_string()),
            ActivationType::ReLU => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::layer::gradcheck;
    use approx::assert_abs_diff_eq;

    fn sequence(data: Vec<f32>, steps: usize, features: usize) -> Tensor {
        Tensor::new(TensorDesc::new_sequence(1, steps, features), data).unwrap()
    }

    #[test]
    fn relu_clamps_negatives() {
        let mut layer = ActivationLayer::new(ActivationType::ReLU);
        let out = layer
            .forward(&sequence(vec![-1.0, 0.5, 2.0, -0.1], 2, 2), ForwardMode::Eval)
            .unwrap();
        assert_eq!(out.data, vec![0.0, 0.5, 2.0, 0.0]);
    }

    #[test]
    fn softmax_rows_sum_to_one() {
        let mut layer = ActivationLayer::new(ActivationType::Softmax);
        let out = layer
            .forward(&sequence(vec![1.0, 2.0, 3.0, 1000.0, 1000.0, 1000.0], 2, 3), ForwardMode::Eval)
            .unwrap();
        for row in out.data.chunks(3) {
            assert_abs_diff_eq!(row.iter().sum::<f32>(), 1.0, epsilon = 1e-5);
            assert!(row.iter().all(|v| *v > 0.0));
        }
        assert_abs_diff_eq!(out.data[3], 1.0 / 3.0, epsilon = 1e-5);
    }

    #[test]
    fn softmax_gradient_matches_finite_differences() {
        let mut layer = ActivationLayer::new(ActivationType::Softmax);
        let input = sequence(vec![0.3, -0.2, 0.9, 0.1, 0.0, -0.7, 0.4, 0.2], 2, 4);
        gradcheck::check_input_grad(&mut layer, &input, 1e-2);
    }

    #[test]
    fn relu_gradient_is_masked() {
        let mut layer = ActivationLayer::new(ActivationType::ReLU);
        let input = sequence(vec![-1.0, 2.0], 1, 2);
        layer.forward(&input, ForwardMode::Train).unwrap();
        let grad = layer.backward(&sequence(vec![5.0, 5.0], 1, 2)).unwrap();
        assert_eq!(grad.data, vec![0.0, 5.0]);
    }

    #[test]
    fn backward_without_forward_fails() {
        let mut layer = ActivationLayer::new(ActivationType::ReLU);
        assert!(layer.backward(&sequence(vec![1.0], 1, 1)).is_err());
    }
}
