use rayon::prelude::*;

use crate::{
    error::{CrnnError, Result},
    tensor::{Tensor, TensorDesc},
};

use super::layer::{expect_same_shape, missing_cache, ForwardMode, Layer};

/// Turns a feature map [B, C, H, W] into a sequence [B, W, C·H].
///
/// Each image column becomes one timestep; its features are ordered channel
/// major, so feature `c * H + h` holds channel `c` at row `h`.
#[derive(Clone, Default)]
pub struct ToSequenceLayer {
    input_desc: Option<TensorDesc>,
}

impl ToSequenceLayer {
    pub fn new() -> Self {
        Self::default()
    }

    fn dims(desc: &TensorDesc) -> Result<(usize, usize, usize, usize)> {
        match desc {
            TensorDesc::Tensor4D { batch, channels, height, width } => Ok((*batch, *channels, *height, *width)),
            _ => Err(CrnnError::Layer(format!("ToSequence requires 4D input tensor, got {:?}", desc))),
        }
    }
}

impl Layer for ToSequenceLayer {
    fn output_shape(&self, input_shape: &TensorDesc) -> Result<TensorDesc> {
        let (b, c, h, w) = Self::dims(input_shape)?;
        Ok(TensorDesc::new_sequence(b, w, c * h))
    }

    fn forward(&mut self, input: &Tensor, mode: ForwardMode) -> Result<Tensor> {
        let (_, c, h, w) = Self::dims(&input.desc)?;
        let out_desc = self.output_shape(&input.desc)?;
        let features = c * h;

        let mut output = vec![0.0f32; input.len()];
        output
            .par_chunks_mut(w * features)
            .zip(input.data.par_chunks(c * h * w))
            .for_each(|(dst, src)| {
                for t in 0..w {
                    for f in 0..features {
                        // f = ch * h + row, and src is [ch][row][col]
                        dst[t * features + f] = src[f * w + t];
                    }
                }
            });

        self.input_desc = match mode {
            ForwardMode::Train => Some(input.desc.clone()),
            ForwardMode::Eval => None,
        };
        Tensor::new(out_desc, output)
    }

    fn backward(&mut self, grad_output: &Tensor) -> Result<Tensor> {
        let input_desc = self.input_desc.clone().ok_or_else(|| missing_cache("ToSequence"))?;
        let (_, c, h, w) = Self::dims(&input_desc)?;
        expect_same_shape("ToSequence gradient", &self.output_shape(&input_desc)?, &grad_output.desc)?;
        let features = c * h;

        let mut grad_input = vec![0.0f32; grad_output.len()];
        grad_input
            .par_chunks_mut(c * h * w)
            .zip(grad_output.data.par_chunks(w * features))
            .for_each(|(dst, src)| {
                for f in 0..features {
                    for t in 0..w {
                        dst[f * w + t] = src[t * features + f];
                    }
                }
            });
        Tensor::new(input_desc, grad_input)
    }

    fn memory_requirements(&self, output_shape: &TensorDesc) -> u64 {
        output_shape.size_in_bytes() as u64 * 2
    }

    fn name(&self) -> String {
        "ToSequence".to_string()
    }

    fn config_string(&self) -> Option<String> {
        Some("steps=width, features=channels×height".to_string())
    }
}
