use rand::Rng;
use rayon::prelude::*;

use crate::{
    error::{CrnnError, Result},
    model::weight_init::WeightInit,
    tensor::{Tensor, TensorDesc},
};

use super::layer::{expect_same_shape, missing_cache, ForwardMode, Layer, Param};

/// Fully connected layer applied independently to every row of a matrix or
/// every timestep of a sequence.
pub struct LinearLayer {
    pub in_features: usize,
    pub out_features: usize,
    weights: Param, // [in, out]
    biases: Param,
    cached_input: Option<Tensor>,
}

impl LinearLayer {
    pub fn new<R: Rng + ?Sized>(in_features: usize, out_features: usize, init: WeightInit, rng: &mut R) -> Self {
        let weight_desc = TensorDesc::new_matrix(in_features, out_features);
        Self {
            in_features,
            out_features,
            weights: Param::new("kernel", weight_desc.clone(), init.init(&weight_desc, rng)),
            biases: Param::new("bias", TensorDesc::new_vector(out_features), vec![0.0; out_features]),
            cached_input: None,
        }
    }

    fn check_features(&self, features: usize) -> Result<()> {
        if features != self.in_features {
            return Err(CrnnError::ShapeMismatch {
                context: "Linear input features".into(),
                expected: self.in_features.to_string(),
                actual: features.to_string(),
            });
        }
        Ok(())
    }
}

impl Layer for LinearLayer {
    fn output_shape(&self, input_shape: &TensorDesc) -> Result<TensorDesc> {
        match input_shape {
            TensorDesc::Matrix { rows, cols } => {
                self.check_features(*cols)?;
                Ok(TensorDesc::new_matrix(*rows, self.out_features))
            }
            TensorDesc::Sequence { batch, steps, features } => {
                self.check_features(*features)?;
                Ok(TensorDesc::new_sequence(*batch, *steps, self.out_features))
            }
            _ => Err(CrnnError::Layer(format!(
                "Linear layer requires matrix or sequence input, got {:?}",
                input_shape
            ))),
        }
    }

    fn forward(&mut self, input: &Tensor, mode: ForwardMode) -> Result<Tensor> {
        let out_desc = self.output_shape(&input.desc)?;
        let (n_in, n_out) = (self.in_features, self.out_features);
        let weights = &self.weights.value;
        let biases = &self.biases.value;

        let mut output = vec![0.0f32; out_desc.num_elements()];
        output
            .par_chunks_mut(n_out)
            .zip(input.data.par_chunks(n_in))
            .for_each(|(out, x)| {
                out.copy_from_slice(biases);
                for (i, xi) in x.iter().enumerate() {
                    let row = &weights[i * n_out..][..n_out];
                    for (o, w) in out.iter_mut().zip(row) {
                        *o += xi * w;
                    }
                }
            });

        self.cached_input = match mode {
            ForwardMode::Train => Some(input.clone()),
            ForwardMode::Eval => None,
        };
        Tensor::new(out_desc, output)
    }

    fn backward(&mut self, grad_output: &Tensor) -> Result<Tensor> {
        let input = self.cached_input.as_ref().ok_or_else(|| missing_cache("Linear"))?;
        expect_same_shape("Linear gradient", &self.output_shape(&input.desc)?, &grad_output.desc)?;
        let (n_in, n_out) = (self.in_features, self.out_features);
        let weights = &self.weights.value;

        let mut grad_input = vec![0.0f32; input.len()];
        grad_input
            .par_chunks_mut(n_in)
            .zip(grad_output.data.par_chunks(n_out))
            .for_each(|(dx, dy)| {
                for (i, d) in dx.iter_mut().enumerate() {
                    let row = &weights[i * n_out..][..n_out];
                    *d = row.iter().zip(dy).map(|(w, g)| w * g).sum();
                }
            });

        // dW[i, o] = Σ_rows x[i] · dy[o]
        let mut weight_grad = vec![0.0f32; n_in * n_out];
        weight_grad
            .par_chunks_mut(n_out)
            .enumerate()
            .for_each(|(i, dw)| {
                for (x, dy) in input.data.chunks(n_in).zip(grad_output.data.chunks(n_out)) {
                    let xi = x[i];
                    for (w, g) in dw.iter_mut().zip(dy) {
                        *w += xi * g;
                    }
                }
            });

        let mut bias_grad = vec![0.0f32; n_out];
        for dy in grad_output.data.chunks(n_out) {
            for (b, g) in bias_grad.iter_mut().zip(dy) {
                *b += g;
            }
        }

        self.weights.grad = weight_grad;
        self.biases.grad = bias_grad;
        Tensor::new(input.desc.clone(), grad_input)
    }

    fn parameters(&self) -> Vec<&Param> {
        vec![&self.weights, &self.biases]
    }

    fn parameters_mut(&mut self) -> Vec<&mut Param> {
        vec![&mut self.weights, &mut self.biases]
    }

    fn name(&self) -> String {
        "Linear".to_string()
    }

    fn config_string(&self) -> Option<String> {
        Some(format!("in_features={}, out_features={}", self.in_features, self.out_features))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::layer::gradcheck;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn applies_per_timestep() {
        let mut rng = StdRng::seed_from_u64(0);
        let layer = LinearLayer::new(6, 3, WeightInit::Xavier, &mut rng);
        let out = layer.output_shape(&TensorDesc::new_sequence(2, 5, 6)).unwrap();
        assert_eq!(out, TensorDesc::new_sequence(2, 5, 3));
        assert!(layer.output_shape(&TensorDesc::new_sequence(2, 5, 4)).is_err());
    }

    #[test]
    fn constant_weights_sum_inputs() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut layer = LinearLayer::new(3, 2, WeightInit::Constant(1.0), &mut rng);
        let x = Tensor::new(TensorDesc::new_matrix(1, 3), vec![1.0, 2.0, 3.0]).unwrap();
        let out = layer.forward(&x, ForwardMode::Eval).unwrap();
        assert_eq!(out.data, vec![6.0, 6.0]);
    }

    #[test]
    fn gradients_match_finite_differences() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut layer = LinearLayer::new(4, 3, WeightInit::Xavier, &mut rng);
        let desc = TensorDesc::new_sequence(2, 3, 4);
        let x = Tensor::new(desc, (0..24).map(|i| (i as f32 * 0.37).sin()).collect()).unwrap();
        gradcheck::check_input_grad(&mut layer, &x, 1e-2);
        gradcheck::check_param_grads(&mut layer, &x, 1e-2);
    }
}
