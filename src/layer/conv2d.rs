use rand::Rng;
use rayon::prelude::*;

use crate::{
    error::{CrnnError, Result},
    model::weight_init::WeightInit,
    tensor::{Tensor, TensorDesc},
};

use super::layer::{expect_same_shape, missing_cache, ForwardMode, Layer, Param};

pub struct Conv2DLayer {
    pub in_features: usize,  // Input channels
    pub out_features: usize, // Output channels
    pub kernel_h: usize,
    pub kernel_w: usize,
    pub stride_h: usize,
    pub stride_w: usize,
    pub padding_h: usize,
    pub padding_w: usize,
    weights: Param,
    biases: Param,
    cached_input: Option<Tensor>,
}

impl Conv2DLayer {
    /// 3×3 kernel, stride 1, "same" padding.
    pub fn new<R: Rng + ?Sized>(in_features: usize, out_features: usize, init: WeightInit, rng: &mut R) -> Self {
        Self::new_with(in_features, out_features, (3, 3), (1, 1), (1, 1), init, rng)
    }

    pub fn new_with<R: Rng + ?Sized>(
        in_features: usize,
        out_features: usize,
        kernel: (usize, usize),
        stride: (usize, usize),
        padding: (usize, usize),
        init: WeightInit,
        rng: &mut R,
    ) -> Self {
        let weight_desc = TensorDesc::new_tensor4d(out_features, in_features, kernel.0, kernel.1);
        let weights = Param::new("kernel", weight_desc.clone(), init.init(&weight_desc, rng));
        let biases = Param::new("bias", TensorDesc::new_vector(out_features), vec![0.0; out_features]);

        Self {
            in_features,
            out_features,
            kernel_h: kernel.0,
            kernel_w: kernel.1,
            stride_h: stride.0,
            stride_w: stride.1,
            padding_h: padding.0,
            padding_w: padding.1,
            weights,
            biases,
            cached_input: None,
        }
    }

    fn input_dims(&self, desc: &TensorDesc) -> Result<(usize, usize, usize)> {
        match desc {
            TensorDesc::Tensor4D { batch, channels, height, width } => {
                if *channels != self.in_features {
                    return Err(CrnnError::ShapeMismatch {
                        context: "Conv2D input channels".into(),
                        expected: self.in_features.to_string(),
                        actual: channels.to_string(),
                    });
                }
                Ok((*batch, *height, *width))
            }
            _ => Err(CrnnError::Layer(format!("Conv2D requires 4D input tensor, got {:?}", desc))),
        }
    }

    fn output_hw(&self, h_in: usize, w_in: usize) -> Result<(usize, usize)> {
        if h_in + 2 * self.padding_h < self.kernel_h || w_in + 2 * self.padding_w < self.kernel_w {
            return Err(CrnnError::Layer(format!(
                "Conv2D kernel {}×{} does not fit padded input {}×{}",
                self.kernel_h, self.kernel_w, h_in, w_in
            )));
        }
        let h_out = ((h_in + 2 * self.padding_h - self.kernel_h) / self.stride_h) + 1;
        let w_out = ((w_in + 2 * self.padding_w - self.kernel_w) / self.stride_w) + 1;
        Ok((h_out, w_out))
    }

    // Input coordinate feeding output position `o` through kernel tap `k`
    #[inline]
    fn source(o: usize, k: usize, stride: usize, padding: usize, limit: usize) -> Option<usize> {
        let pos = (o * stride + k) as isize - padding as isize;
        if pos >= 0 && (pos as usize) < limit {
            Some(pos as usize)
        } else {
            None
        }
    }
}

impl Layer for Conv2DLayer {
    fn output_shape(&self, input_shape: &TensorDesc) -> Result<TensorDesc> {
        let (batch, h_in, w_in) = self.input_dims(input_shape)?;
        let (h_out, w_out) = self.output_hw(h_in, w_in)?;
        Ok(TensorDesc::new_tensor4d(batch, self.out_features, h_out, w_out))
    }

    fn forward(&mut self, input: &Tensor, mode: ForwardMode) -> Result<Tensor> {
        let (_, h_in, w_in) = self.input_dims(&input.desc)?;
        let out_desc = self.output_shape(&input.desc)?;
        let (h_out, w_out) = self.output_hw(h_in, w_in)?;

        let (c_in, c_out) = (self.in_features, self.out_features);
        let (kh, kw) = (self.kernel_h, self.kernel_w);
        let (sh, sw, ph, pw) = (self.stride_h, self.stride_w, self.padding_h, self.padding_w);
        let weights = &self.weights.value;
        let biases = &self.biases.value;
        let in_plane = h_in * w_in;

        let mut output = vec![0.0f32; out_desc.num_elements()];
        output
            .par_chunks_mut(h_out * w_out)
            .enumerate()
            .for_each(|(idx, plane)| {
                let (b, oc) = (idx / c_out, idx % c_out);
                plane.fill(biases[oc]);
                for ic in 0..c_in {
                    let src = &input.data[(b * c_in + ic) * in_plane..][..in_plane];
                    for ky in 0..kh {
                        for kx in 0..kw {
                            let w = weights[((oc * c_in + ic) * kh + ky) * kw + kx];
                            for oy in 0..h_out {
                                let Some(iy) = Self::source(oy, ky, sh, ph, h_in) else { continue };
                                let row = &src[iy * w_in..][..w_in];
                                let out_row = &mut plane[oy * w_out..][..w_out];
                                for (ox, out) in out_row.iter_mut().enumerate() {
                                    if let Some(ix) = Self::source(ox, kx, sw, pw, w_in) {
                                        *out += w * row[ix];
                                    }
                                }
                            }
                        }
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
        let input = self.cached_input.as_ref().ok_or_else(|| missing_cache("Conv2D"))?;
        let (batch, h_in, w_in) = self.input_dims(&input.desc)?;
        let out_desc = self.output_shape(&input.desc)?;
        expect_same_shape("Conv2D gradient", &out_desc, &grad_output.desc)?;
        let (h_out, w_out) = self.output_hw(h_in, w_in)?;

        let (c_in, c_out) = (self.in_features, self.out_features);
        let (kh, kw) = (self.kernel_h, self.kernel_w);
        let (sh, sw, ph, pw) = (self.stride_h, self.stride_w, self.padding_h, self.padding_w);
        let in_plane = h_in * w_in;
        let out_plane = h_out * w_out;
        let gout = &grad_output.data;

        // Bias: sum over batch and spatial positions
        let bias_grad: Vec<f32> = (0..c_out)
            .into_par_iter()
            .map(|oc| {
                (0..batch)
                    .map(|b| gout[(b * c_out + oc) * out_plane..][..out_plane].iter().sum::<f32>())
                    .sum()
            })
            .collect();

        // Kernel: one output channel per task
        let mut weight_grad = vec![0.0f32; self.weights.len()];
        weight_grad
            .par_chunks_mut(c_in * kh * kw)
            .enumerate()
            .for_each(|(oc, wg)| {
                for b in 0..batch {
                    let g_plane = &gout[(b * c_out + oc) * out_plane..][..out_plane];
                    for ic in 0..c_in {
                        let src = &input.data[(b * c_in + ic) * in_plane..][..in_plane];
                        for ky in 0..kh {
                            for kx in 0..kw {
                                let mut acc = 0.0f32;
                                for oy in 0..h_out {
                                    let Some(iy) = Self::source(oy, ky, sh, ph, h_in) else { continue };
                                    let row = &src[iy * w_in..][..w_in];
                                    let g_row = &g_plane[oy * w_out..][..w_out];
                                    for (ox, g) in g_row.iter().enumerate() {
                                        if let Some(ix) = Self::source(ox, kx, sw, pw, w_in) {
                                            acc += g * row[ix];
                                        }
                                    }
                                }
                                wg[(ic * kh + ky) * kw + kx] += acc;
                            }
                        }
                    }
                }
            });

        // Input: one (sample, input channel) plane per task
        let weights = &self.weights.value;
        let mut grad_input = vec![0.0f32; input.len()];
        grad_input
            .par_chunks_mut(in_plane)
            .enumerate()
            .for_each(|(idx, gi)| {
                let (b, ic) = (idx / c_in, idx % c_in);
                for oc in 0..c_out {
                    let g_plane = &gout[(b * c_out + oc) * out_plane..][..out_plane];
                    for ky in 0..kh {
                        for kx in 0..kw {
                            let w = weights[((oc * c_in + ic) * kh + ky) * kw + kx];
                            for oy in 0..h_out {
                                let Some(iy) = Self::source(oy, ky, sh, ph, h_in) else { continue };
                                let g_row = &g_plane[oy * w_out..][..w_out];
                                let gi_row = &mut gi[iy * w_in..][..w_in];
                                for (ox, g) in g_row.iter().enumerate() {
                                    if let Some(ix) = Self::source(ox, kx, sw, pw, w_in) {
                                        gi_row[ix] += w * g;
                                    }
                                }
                            }
                        }
                    }
                }
            });

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
        "Conv2D".to_string()
    }

    fn config_string(&self) -> Option<String> {
        Some(format!(
            "in_channels={}, out_channels={}, kernel={}×{}, stride={}×{}, padding={}×{}",
            self.in_features, self.out_features,
            self.kernel_h, self.kernel_w,
            self.stride_h, self.stride_w,
            self.padding_h, self.padding_w,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::layer::gradcheck;
    use approx::assert_abs_diff_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn ramp(desc: TensorDesc) -> Tensor {
        let n = desc.num_elements();
        Tensor::new(desc, (0..n).map(|i| ((i % 11) as f32 - 5.0) / 7.0).collect()).unwrap()
    }

    #[test]
    fn same_padding_keeps_spatial_dims() {
        let mut rng = StdRng::seed_from_u64(1);
        let layer = Conv2DLayer::new(1, 4, WeightInit::He, &mut rng);
        let out = layer.output_shape(&TensorDesc::new_tensor4d(2, 1, 32, 128)).unwrap();
        assert_eq!(out, TensorDesc::new_tensor4d(2, 4, 32, 128));
    }

    #[test]
    fn rejects_wrong_channel_count() {
        let mut rng = StdRng::seed_from_u64(1);
        let layer = Conv2DLayer::new(3, 4, WeightInit::He, &mut rng);
        assert!(layer.output_shape(&TensorDesc::new_tensor4d(1, 1, 8, 8)).is_err());
    }

    #[test]
    fn identity_kernel_copies_input() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut layer = Conv2DLayer::new(1, 1, WeightInit::Constant(0.0), &mut rng);
        layer.weights.value[4] = 1.0; // centre tap
        let input = ramp(TensorDesc::new_tensor4d(1, 1, 3, 4));
        let out = layer.forward(&input, ForwardMode::Eval).unwrap();
        for (a, b) in out.data.iter().zip(&input.data) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-6);
        }
    }

    #[test]
    fn gradients_match_finite_differences() {
        let mut rng = StdRng::seed_from_u64(9);
        let mut layer = Conv2DLayer::new(2, 3, WeightInit::He, &mut rng);
        let input = ramp(TensorDesc::new_tensor4d(2, 2, 4, 5));
        gradcheck::check_input_grad(&mut layer, &input, 2e-2);
        gradcheck::check_param_grads(&mut layer, &input, 2e-2);
    }

    #[test]
    fn strided_gradients_match_finite_differences() {
        let mut rng = StdRng::seed_from_u64(4);
        let mut layer = Conv2DLayer::new_with(1, 2, (2, 2), (2, 1), (0, 1), WeightInit::He, &mut rng);
        let input = ramp(TensorDesc::new_tensor4d(1, 1, 5, 4));
        gradcheck::check_input_grad(&mut layer, &input, 2e-2);
        gradcheck::check_param_grads(&mut layer, &input, 2e-2);
    }
}
