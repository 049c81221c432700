use rayon::prelude::*;

use crate::{
    error::{CrnnError, Result},
    tensor::{Tensor, TensorDesc},
};

use super::layer::{expect_same_shape, missing_cache, ForwardMode, Layer};

struct PoolCache {
    input_desc: TensorDesc,
    // Flat input index chosen for each output element
    argmax: Vec<usize>,
}

/// Max pooling with "valid" padding: windows that would overhang are dropped.
pub struct MaxPool2DLayer {
    pub pool_h: usize,
    pub pool_w: usize,
    pub stride_h: usize,
    pub stride_w: usize,
    cache: Option<PoolCache>,
}

impl MaxPool2DLayer {
    pub fn new(pool: (usize, usize), stride: (usize, usize)) -> Self {
        Self {
            pool_h: pool.0,
            pool_w: pool.1,
            stride_h: stride.0,
            stride_w: stride.1,
            cache: None,
        }
    }

    fn output_hw(&self, h_in: usize, w_in: usize) -> Result<(usize, usize)> {
        if h_in < self.pool_h || w_in < self.pool_w {
            return Err(CrnnError::Layer(format!(
                "MaxPool2D window {}×{} larger than input {}×{}",
                self.pool_h, self.pool_w, h_in, w_in
            )));
        }
        Ok((
            (h_in - self.pool_h) / self.stride_h + 1,
            (w_in - self.pool_w) / self.stride_w + 1,
        ))
    }
}

impl Layer for MaxPool2DLayer {
    fn output_shape(&self, input_shape: &TensorDesc) -> Result<TensorDesc> {
        match input_shape {
            TensorDesc::Tensor4D { batch, channels, height, width } => {
                let (h, w) = self.output_hw(*height, *width)?;
                Ok(TensorDesc::new_tensor4d(*batch, *channels, h, w))
            }
            _ => Err(CrnnError::Layer(format!("MaxPool2D requires 4D input tensor, got {:?}", input_shape))),
        }
    }

    fn forward(&mut self, input: &Tensor, mode: ForwardMode) -> Result<Tensor> {
        let out_desc = self.output_shape(&input.desc)?;
        let (h_in, w_in) = (input.dims()[2], input.dims()[3]);
        let (h_out, w_out) = self.output_hw(h_in, w_in)?;
        let in_plane = h_in * w_in;
        let out_plane = h_out * w_out;

        let mut output = vec![0.0f32; out_desc.num_elements()];
        let mut argmax = vec![0usize; out_desc.num_elements()];
        output
            .par_chunks_mut(out_plane)
            .zip(argmax.par_chunks_mut(out_plane))
            .enumerate()
            .for_each(|(plane_idx, (out, arg))| {
                let base = plane_idx * in_plane;
                for oy in 0..h_out {
                    for ox in 0..w_out {
                        let mut best = f32::NEG_INFINITY;
                        let mut best_idx = base;
                        for py in 0..self.pool_h {
                            for px in 0..self.pool_w {
                                let idx = base + (oy * self.stride_h + py) * w_in + ox * self.stride_w + px;
                                if input.data[idx] > best {
                                    best = input.data[idx];
                                    best_idx = idx;
                                }
                            }
                        }
                        out[oy * w_out + ox] = best;
                        arg[oy * w_out + ox] = best_idx;
                    }
                }
            });

        self.cache = match mode {
            ForwardMode::Train => Some(PoolCache {
                input_desc: input.desc.clone(),
                argmax,
            }),
            ForwardMode::Eval => None,
        };
        Tensor::new(out_desc, output)
    }

    fn backward(&mut self, grad_output: &Tensor) -> Result<Tensor> {
        let cache = self.cache.as_ref().ok_or_else(|| missing_cache("MaxPool2D"))?;
        let out_desc = self.output_shape(&cache.input_desc)?;
        expect_same_shape("MaxPool2D gradient", &out_desc, &grad_output.desc)?;

        // Windows may overlap when stride < pool, so scatter sequentially
        let mut grad_input = vec![0.0f32; cache.input_desc.num_elements()];
        for (g, idx) in grad_output.data.iter().zip(&cache.argmax) {
            grad_input[*idx] += g;
        }
        Tensor::new(cache.input_desc.clone(), grad_input)
    }

    fn memory_requirements(&self, output_shape: &TensorDesc) -> u64 {
        // Activation, gradient and the argmax indices
        output_shape.size_in_bytes() as u64 * 2 + (output_shape.num_elements() * std::mem::size_of::<usize>()) as u64
    }

    fn name(&self) -> String {
        "MaxPool2D".to_string()
    }

    fn config_string(&self) -> Option<String> {
        Some(format!(
            "pool={}×{}, stride={}×{}",
            self.pool_h, self.pool_w, self.stride_h, self.stride_w
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_padding_floors() {
        let layer = MaxPool2DLayer::new((2, 2), (2, 2));
        let out = layer.output_shape(&TensorDesc::new_tensor4d(1, 8, 5, 7)).unwrap();
        assert_eq!(out, TensorDesc::new_tensor4d(1, 8, 2, 3));

        let layer = MaxPool2DLayer::new((2, 1), (2, 1));
        let out = layer.output_shape(&TensorDesc::new_tensor4d(1, 8, 4, 32)).unwrap();
        assert_eq!(out, TensorDesc::new_tensor4d(1, 8, 2, 32));
    }

    #[test]
    fn picks_window_maximum_and_routes_gradient() {
        let mut layer = MaxPool2DLayer::new((2, 2), (2, 2));
        let input = Tensor::new(
            TensorDesc::new_tensor4d(1, 1, 2, 4),
            vec![1.0, 5.0, -1.0, -3.0, 2.0, 0.0, -2.0, -0.5],
        )
        .unwrap();
        let out = layer.forward(&input, ForwardMode::Train).unwrap();
        assert_eq!(out.data, vec![5.0, -0.5]);

        let grad = layer
            .backward(&Tensor::new(out.desc.clone(), vec![1.0, 2.0]).unwrap())
            .unwrap();
        assert_eq!(grad.data, vec![0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 2.0]);
    }

    #[test]
    fn window_larger_than_input_is_an_error() {
        let layer = MaxPool2DLayer::new((2, 2), (2, 2));
        assert!(layer.output_shape(&TensorDesc::new_tensor4d(1, 1, 1, 4)).is_err());
    }
}
