use rayon::prelude::*;

use crate::{
    error::{CrnnError, Result},
    tensor::{Tensor, TensorDesc},
};

use super::layer::{expect_same_shape, missing_cache, ForwardMode, Layer, Param};

pub const DEFAULT_MOMENTUM: f32 = 0.99;
pub const DEFAULT_EPSILON: f32 = 1e-3;

struct BatchNormCache {
    input_desc: TensorDesc,
    normalized: Vec<f32>,
    inv_std: Vec<f32>,
}

/// Normalizes over the channel axis of a 4D tensor or the feature axis of a
/// sequence. Statistics are taken over every other axis.
pub struct BatchNormLayer {
    pub features: usize,
    pub momentum: f32,
    pub epsilon: f32,
    gamma: Param,
    beta: Param,
    moving_mean: Param,
    moving_variance: Param,
    cache: Option<BatchNormCache>,
}

impl BatchNormLayer {
    pub fn new(features: usize) -> Self {
        Self::new_with(features, DEFAULT_MOMENTUM, DEFAULT_EPSILON)
    }

    pub fn new_with(features: usize, momentum: f32, epsilon: f32) -> Self {
        let desc = TensorDesc::new_vector(features);
        Self {
            features,
            momentum,
            epsilon,
            gamma: Param::new("gamma", desc.clone(), vec![1.0; features]),
            beta: Param::new("beta", desc.clone(), vec![0.0; features]),
            moving_mean: Param::new("moving_mean", desc.clone(), vec![0.0; features]),
            moving_variance: Param::new("moving_variance", desc, vec![1.0; features]),
            cache: None,
        }
    }

    // (outer, channels, inner) view of the buffer
    fn layout(&self, desc: &TensorDesc) -> Result<(usize, usize)> {
        let (outer, channels, inner) = match desc {
            TensorDesc::Tensor4D { batch, channels, height, width } => (*batch, *channels, height * width),
            TensorDesc::Sequence { batch, steps, features } => (batch * steps, *features, 1),
            TensorDesc::Matrix { rows, cols } => (*rows, *cols, 1),
            TensorDesc::Vector { .. } => {
                return Err(CrnnError::Layer("BatchNorm requires a batched input".into()))
            }
        };
        if channels != self.features {
            return Err(CrnnError::ShapeMismatch {
                context: "BatchNorm features".into(),
                expected: self.features.to_string(),
                actual: channels.to_string(),
            });
        }
        Ok((outer, inner))
    }

    fn channel_values<'a>(
        data: &'a [f32],
        c: usize,
        channels: usize,
        outer: usize,
        inner: usize,
    ) -> impl Iterator<Item = (usize, f32)> + 'a {
        (0..outer).flat_map(move |o| {
            let base = (o * channels + c) * inner;
            (base..base + inner).map(move |i| (i, data[i]))
        })
    }
}

impl Layer for BatchNormLayer {
    fn output_shape(&self, input_shape: &TensorDesc) -> Result<TensorDesc> {
        self.layout(input_shape)?;
        Ok(input_shape.clone())
    }

    fn forward(&mut self, input: &Tensor, mode: ForwardMode) -> Result<Tensor> {
        let (outer, inner) = self.layout(&input.desc)?;
        let channels = self.features;
        let count = (outer * inner) as f32;
        let data = &input.data;

        let (mean, var): (Vec<f32>, Vec<f32>) = match mode {
            ForwardMode::Train => (0..channels)
                .into_par_iter()
                .map(|c| {
                    let mean = Self::channel_values(data, c, channels, outer, inner)
                        .map(|(_, v)| v)
                        .sum::<f32>()
                        / count;
                    let var = Self::channel_values(data, c, channels, outer, inner)
                        .map(|(_, v)| (v - mean) * (v - mean))
                        .sum::<f32>()
                        / count;
                    (mean, var)
                })
                .unzip(),
            ForwardMode::Eval => (self.moving_mean.value.clone(), self.moving_variance.value.clone()),
        };

        let inv_std: Vec<f32> = var.iter().map(|v| 1.0 / (v + self.epsilon).sqrt()).collect();
        let mut normalized = vec![0.0f32; data.len()];
        normalized
            .par_chunks_mut(inner)
            .zip(data.par_chunks(inner))
            .enumerate()
            .for_each(|(idx, (dst, src))| {
                let c = idx % channels;
                for (d, s) in dst.iter_mut().zip(src) {
                    *d = (s - mean[c]) * inv_std[c];
                }
            });

        let mut output = normalized.clone();
        output.par_chunks_mut(inner).enumerate().for_each(|(idx, dst)| {
            let c = idx % channels;
            let (g, b) = (self.gamma.value[c], self.beta.value[c]);
            for d in dst.iter_mut() {
                *d = *d * g + b;
            }
        });

        if mode == ForwardMode::Train {
            let m = self.momentum;
            for c in 0..channels {
                self.moving_mean.value[c] = m * self.moving_mean.value[c] + (1.0 - m) * mean[c];
                self.moving_variance.value[c] = m * self.moving_variance.value[c] + (1.0 - m) * var[c];
            }
            self.cache = Some(BatchNormCache {
                input_desc: input.desc.clone(),
                normalized,
                inv_std,
            });
        } else {
            self.cache = None;
        }

        Tensor::new(input.desc.clone(), output)
    }

    fn backward(&mut self, grad_output: &Tensor) -> Result<Tensor> {
        let cache = self.cache.as_ref().ok_or_else(|| missing_cache("BatchNorm"))?;
        expect_same_shape("BatchNorm gradient", &cache.input_desc, &grad_output.desc)?;
        let (outer, inner) = self.layout(&cache.input_desc)?;
        let channels = self.features;
        let count = (outer * inner) as f32;
        let dy = &grad_output.data;
        let xhat = &cache.normalized;

        // Per channel: Σdy and Σdy·x̂
        let sums: Vec<(f32, f32)> = (0..channels)
            .into_par_iter()
            .map(|c| {
                Self::channel_values(dy, c, channels, outer, inner)
                    .fold((0.0, 0.0), |(s, sx), (i, g)| (s + g, sx + g * xhat[i]))
            })
            .collect();

        let gamma = &self.gamma.value;
        let inv_std = &cache.inv_std;
        let mut grad_input = vec![0.0f32; dy.len()];
        grad_input
            .par_chunks_mut(inner)
            .enumerate()
            .for_each(|(idx, dst)| {
                let c = idx % channels;
                let (sum_dy, sum_dy_xhat) = sums[c];
                let scale = gamma[c] * inv_std[c] / count;
                let base = idx * inner;
                for (k, d) in dst.iter_mut().enumerate() {
                    let i = base + k;
                    *d = scale * (count * dy[i] - sum_dy - xhat[i] * sum_dy_xhat);
                }
            });

        self.beta.grad = sums.iter().map(|(s, _)| *s).collect();
        self.gamma.grad = sums.iter().map(|(_, sx)| *sx).collect();
        Tensor::new(cache.input_desc.clone(), grad_input)
    }

    fn parameters(&self) -> Vec<&Param> {
        vec![&self.gamma, &self.beta]
    }

    fn parameters_mut(&mut self) -> Vec<&mut Param> {
        vec![&mut self.gamma, &mut self.beta]
    }

    fn state(&self) -> Vec<&Param> {
        vec![&self.moving_mean, &self.moving_variance]
    }

    fn state_mut(&mut self) -> Vec<&mut Param> {
        vec![&mut self.moving_mean, &mut self.moving_variance]
    }

    fn name(&self) -> String {
        "BatchNorm".to_string()
    }

    fn config_string(&self) -> Option<String> {
        Some(format!(
            "features={}, momentum={}, epsilon={}",
            self.features, self.momentum, self.epsilon
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::layer::gradcheck;
    use approx::assert_abs_diff_eq;

    fn input() -> Tensor {
        let desc = TensorDesc::new_tensor4d(2, 3, 2, 2);
        let n = desc.num_elements();
        Tensor::new(desc, (0..n).map(|i| ((i * 5) % 7) as f32 * 0.3 - 0.8).collect()).unwrap()
    }

    #[test]
    fn training_output_is_normalized_per_channel() {
        let mut layer = BatchNormLayer::new(3);
        let out = layer.forward(&input(), ForwardMode::Train).unwrap();
        for c in 0..3 {
            let values: Vec<f32> = BatchNormLayer::channel_values(&out.data, c, 3, 2, 4)
                .map(|(_, v)| v)
                .collect();
            let mean = values.iter().sum::<f32>() / values.len() as f32;
            assert_abs_diff_eq!(mean, 0.0, epsilon = 1e-5);
        }
    }

    #[test]
    fn running_statistics_track_batches() {
        let mut layer = BatchNormLayer::new_with(3, 0.5, 1e-3);
        let x = Tensor::new(TensorDesc::new_matrix(2, 3), vec![1.0, 2.0, 3.0, 3.0, 4.0, 5.0]).unwrap();
        layer.forward(&x, ForwardMode::Train).unwrap();
        // mean (2,3,4), var 1 each
        assert_abs_diff_eq!(layer.moving_mean.value[0], 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(layer.moving_mean.value[2], 2.0, epsilon = 1e-6);
        assert_abs_diff_eq!(layer.moving_variance.value[1], 1.0, epsilon = 1e-6);
    }

    #[test]
    fn eval_uses_running_statistics() {
        let mut layer = BatchNormLayer::new(2);
        let x = Tensor::new(TensorDesc::new_sequence(1, 1, 2), vec![4.0, -2.0]).unwrap();
        let out = layer.forward(&x, ForwardMode::Eval).unwrap();
        let scale = 1.0 / (1.0f32 + DEFAULT_EPSILON).sqrt();
        assert_abs_diff_eq!(out.data[0], 4.0 * scale, epsilon = 1e-5);
        assert_abs_diff_eq!(out.data[1], -2.0 * scale, epsilon = 1e-5);
        assert_eq!(layer.moving_mean.value, vec![0.0, 0.0]);
    }

    #[test]
    fn gradients_match_finite_differences() {
        let mut layer = BatchNormLayer::new(3);
        layer.gamma.value = vec![0.5, 1.5, -1.0];
        layer.beta.value = vec![0.1, 0.0, -0.2];
        gradcheck::check_input_grad(&mut layer, &input(), 3e-2);
        gradcheck::check_param_grads(&mut layer, &input(), 3e-2);
    }

    #[test]
    fn sequence_layout_uses_feature_axis() {
        let layer = BatchNormLayer::new(4);
        assert!(layer.output_shape(&TensorDesc::new_sequence(2, 5, 4)).is_ok());
        assert!(layer.output_shape(&TensorDesc::new_sequence(2, 4, 5)).is_err());
    }
}
