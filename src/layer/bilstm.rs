use rand::Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{
    error::{CrnnError, Result},
    model::weight_init::WeightInit,
    tensor::{Tensor, TensorDesc},
};

use super::layer::{expect_same_shape, missing_cache, ForwardMode, Layer, Param};

/// How the forward and backward passes are combined per timestep.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergeMode {
    Sum,
    Concat,
}

#[inline]
fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

// Activations of one direction for the whole batch, indexed by time
struct DirectionTrace {
    gates: Vec<f32>,  // [B, T, 4U] post-activation i, f, g, o
    cell: Vec<f32>,   // [B, T, U]
    hidden: Vec<f32>, // [B, T, U]
}

struct LstmDirection {
    reverse: bool,
    input_features: usize,
    units: usize,
    kernel: Param,    // [F, 4U]
    recurrent: Param, // [U, 4U]
    bias: Param,      // [4U], forget slice starts at 1
}

impl LstmDirection {
    fn new<R: Rng + ?Sized>(prefix: &str, reverse: bool, input_features: usize, units: usize, rng: &mut R) -> Self {
        let kernel_desc = TensorDesc::new_matrix(input_features, 4 * units);
        let recurrent_desc = TensorDesc::new_matrix(units, 4 * units);
        let mut bias = vec![0.0; 4 * units];
        bias[units..2 * units].fill(1.0);

        Self {
            reverse,
            input_features,
            units,
            kernel: Param::new(&format!("{}_kernel", prefix), kernel_desc.clone(), WeightInit::He.init(&kernel_desc, rng)),
            recurrent: Param::new(
                &format!("{}_recurrent_kernel", prefix),
                recurrent_desc.clone(),
                WeightInit::Orthogonal.init(&recurrent_desc, rng),
            ),
            bias: Param::new(&format!("{}_bias", prefix), TensorDesc::new_vector(4 * units), bias),
        }
    }

    // Timestep visited at processing step `s`
    #[inline]
    fn time(&self, s: usize, steps: usize) -> usize {
        if self.reverse {
            steps - 1 - s
        } else {
            s
        }
    }

    /// Runs one sample. `x` is [T, F]; outputs are [T, ·] indexed by time.
    fn run(&self, x: &[f32], steps: usize, gates: &mut [f32], cell: &mut [f32], hidden: &mut [f32]) {
        let (f_in, u) = (self.input_features, self.units);
        let g4 = 4 * u;
        let (w, r, b) = (&self.kernel.value, &self.recurrent.value, &self.bias.value);
        let mut z = vec![0.0f32; g4];
        let mut h_prev = vec![0.0f32; u];
        let mut c_prev = vec![0.0f32; u];

        for s in 0..steps {
            let t = self.time(s, steps);
            z.copy_from_slice(b);
            for (fi, xv) in x[t * f_in..][..f_in].iter().enumerate() {
                if *xv != 0.0 {
                    for (zj, wj) in z.iter_mut().zip(&w[fi * g4..][..g4]) {
                        *zj += xv * wj;
                    }
                }
            }
            for (ui, hv) in h_prev.iter().enumerate() {
                for (zj, rj) in z.iter_mut().zip(&r[ui * g4..][..g4]) {
                    *zj += hv * rj;
                }
            }

            let gate = &mut gates[t * g4..][..g4];
            for k in 0..u {
                let i = sigmoid(z[k]);
                let f = sigmoid(z[u + k]);
                let g = z[2 * u + k].tanh();
                let o = sigmoid(z[3 * u + k]);
                let c = f * c_prev[k] + i * g;
                let h = o * c.tanh();
                gate[k] = i;
                gate[u + k] = f;
                gate[2 * u + k] = g;
                gate[3 * u + k] = o;
                cell[t * u + k] = c;
                hidden[t * u + k] = h;
                c_prev[k] = c;
                h_prev[k] = h;
            }
        }
    }

    /// Backpropagates through time for one sample.
    ///
    /// `dh_out` is the sample's output gradient [T, width] of which this
    /// direction reads `units` columns starting at `offset`. Writes the gate
    /// pre-activation gradients into `dz` [T, 4U] and adds to `dx` [T, F].
    #[allow(clippy::too_many_arguments)]
    fn backprop(
        &self,
        steps: usize,
        gates: &[f32],
        cell: &[f32],
        dh_out: &[f32],
        width: usize,
        offset: usize,
        dz: &mut [f32],
        dx: &mut [f32],
    ) {
        let (f_in, u) = (self.input_features, self.units);
        let g4 = 4 * u;
        let (w, r) = (&self.kernel.value, &self.recurrent.value);
        let mut dh_next = vec![0.0f32; u];
        let mut dc_next = vec![0.0f32; u];

        for s in (0..steps).rev() {
            let t = self.time(s, steps);
            let prev_t = if s > 0 { Some(self.time(s - 1, steps)) } else { None };
            let gate = &gates[t * g4..][..g4];
            let dzt = &mut dz[t * g4..][..g4];

            for k in 0..u {
                let (i, f, g, o) = (gate[k], gate[u + k], gate[2 * u + k], gate[3 * u + k]);
                let c = cell[t * u + k];
                let c_prev = prev_t.map_or(0.0, |p| cell[p * u + k]);
                let tc = c.tanh();

                let dh = dh_out[t * width + offset + k] + dh_next[k];
                let d_o = dh * tc;
                let dc = dh * o * (1.0 - tc * tc) + dc_next[k];
                dc_next[k] = dc * f;

                dzt[k] = dc * g * i * (1.0 - i);
                dzt[u + k] = dc * c_prev * f * (1.0 - f);
                dzt[2 * u + k] = dc * i * (1.0 - g * g);
                dzt[3 * u + k] = d_o * o * (1.0 - o);
            }

            for (ui, d) in dh_next.iter_mut().enumerate() {
                *d = r[ui * g4..][..g4].iter().zip(dzt.iter()).map(|(a, b)| a * b).sum();
            }
            for (fi, d) in dx[t * f_in..][..f_in].iter_mut().enumerate() {
                *d += w[fi * g4..][..g4].iter().zip(dzt.iter()).map(|(a, b)| a * b).sum::<f32>();
            }
        }
    }

    /// Reduces per-sample gate gradients into parameter gradients.
    fn accumulate_grads(&mut self, x: &[f32], trace: &DirectionTrace, dz: &[f32], batch: usize, steps: usize) {
        let (f_in, u) = (self.input_features, self.units);
        let g4 = 4 * u;

        let mut kernel_grad = vec![0.0f32; f_in * g4];
        kernel_grad.par_chunks_mut(g4).enumerate().for_each(|(fi, row)| {
            for bt in 0..batch * steps {
                let xv = x[bt * f_in + fi];
                if xv != 0.0 {
                    for (gj, dj) in row.iter_mut().zip(&dz[bt * g4..][..g4]) {
                        *gj += xv * dj;
                    }
                }
            }
        });

        let mut recurrent_grad = vec![0.0f32; u * g4];
        recurrent_grad.par_chunks_mut(g4).enumerate().for_each(|(ui, row)| {
            for b in 0..batch {
                for s in 1..steps {
                    let t = self.time(s, steps);
                    let prev_t = self.time(s - 1, steps);
                    let hv = trace.hidden[(b * steps + prev_t) * u + ui];
                    for (gj, dj) in row.iter_mut().zip(&dz[(b * steps + t) * g4..][..g4]) {
                        *gj += hv * dj;
                    }
                }
            }
        });

        let mut bias_grad = vec![0.0f32; g4];
        for chunk in dz.chunks(g4) {
            for (gb, d) in bias_grad.iter_mut().zip(chunk) {
                *gb += d;
            }
        }

        self.kernel.grad = kernel_grad;
        self.recurrent.grad = recurrent_grad;
        self.bias.grad = bias_grad;
    }

    fn params(&self) -> [&Param; 3] {
        [&self.kernel, &self.recurrent, &self.bias]
    }

    fn params_mut(&mut self) -> [&mut Param; 3] {
        [&mut self.kernel, &mut self.recurrent, &mut self.bias]
    }
}

struct BiLstmCache {
    input: Tensor,
    forward: DirectionTrace,
    backward: DirectionTrace,
}

/// Bidirectional LSTM over a [B, T, F] sequence, returning every timestep.
pub struct BiLstmLayer {
    pub input_features: usize,
    pub units: usize,
    pub merge: MergeMode,
    forward_dir: LstmDirection,
    backward_dir: LstmDirection,
    cache: Option<BiLstmCache>,
}

impl BiLstmLayer {
    pub fn new<R: Rng + ?Sized>(input_features: usize, units: usize, merge: MergeMode, rng: &mut R) -> Self {
        Self {
            input_features,
            units,
            merge,
            forward_dir: LstmDirection::new("forward", false, input_features, units, rng),
            backward_dir: LstmDirection::new("backward", true, input_features, units, rng),
            cache: None,
        }
    }

    fn output_width(&self) -> usize {
        match self.merge {
            MergeMode::Sum => self.units,
            MergeMode::Concat => 2 * self.units,
        }
    }

    fn sequence_dims(&self, desc: &TensorDesc) -> Result<(usize, usize)> {
        match desc {
            TensorDesc::Sequence { batch, steps, features } => {
                if *features != self.input_features {
                    return Err(CrnnError::ShapeMismatch {
                        context: "BiLSTM input features".into(),
                        expected: self.input_features.to_string(),
                        actual: features.to_string(),
                    });
                }
                Ok((*batch, *steps))
            }
            _ => Err(CrnnError::Layer(format!("BiLSTM requires sequence input, got {:?}", desc))),
        }
    }

    fn run_direction(dir: &LstmDirection, input: &Tensor, batch: usize, steps: usize) -> DirectionTrace {
        let u = dir.units;
        let mut trace = DirectionTrace {
            gates: vec![0.0; batch * steps * 4 * u],
            cell: vec![0.0; batch * steps * u],
            hidden: vec![0.0; batch * steps * u],
        };
        trace
            .gates
            .par_chunks_mut(steps * 4 * u)
            .zip(trace.cell.par_chunks_mut(steps * u))
            .zip(trace.hidden.par_chunks_mut(steps * u))
            .zip(input.data.par_chunks(steps * dir.input_features))
            .for_each(|(((gates, cell), hidden), x)| dir.run(x, steps, gates, cell, hidden));
        trace
    }
}

impl Layer for BiLstmLayer {
    fn output_shape(&self, input_shape: &TensorDesc) -> Result<TensorDesc> {
        let (batch, steps) = self.sequence_dims(input_shape)?;
        Ok(TensorDesc::new_sequence(batch, steps, self.output_width()))
    }

    fn forward(&mut self, input: &Tensor, mode: ForwardMode) -> Result<Tensor> {
        let (batch, steps) = self.sequence_dims(&input.desc)?;
        let out_desc = self.output_shape(&input.desc)?;
        let u = self.units;
        let width = self.output_width();

        let fwd = Self::run_direction(&self.forward_dir, input, batch, steps);
        let bwd = Self::run_direction(&self.backward_dir, input, batch, steps);

        let mut output = vec![0.0f32; out_desc.num_elements()];
        output
            .par_chunks_mut(width)
            .zip(fwd.hidden.par_chunks(u))
            .zip(bwd.hidden.par_chunks(u))
            .for_each(|((out, hf), hb)| match self.merge {
                MergeMode::Sum => {
                    for ((o, a), b) in out.iter_mut().zip(hf).zip(hb) {
                        *o = a + b;
                    }
                }
                MergeMode::Concat => {
                    out[..u].copy_from_slice(hf);
                    out[u..].copy_from_slice(hb);
                }
            });

        self.cache = match mode {
            ForwardMode::Train => Some(BiLstmCache {
                input: input.clone(),
                forward: fwd,
                backward: bwd,
            }),
            ForwardMode::Eval => None,
        };
        Tensor::new(out_desc, output)
    }

    fn backward(&mut self, grad_output: &Tensor) -> Result<Tensor> {
        let cache = self.cache.take().ok_or_else(|| missing_cache("BiLSTM"))?;
        let (batch, steps) = self.sequence_dims(&cache.input.desc)?;
        expect_same_shape("BiLSTM gradient", &self.output_shape(&cache.input.desc)?, &grad_output.desc)?;

        let u = self.units;
        let g4 = 4 * u;
        let f_in = self.input_features;
        let width = self.output_width();
        let backward_offset = match self.merge {
            MergeMode::Sum => 0,
            MergeMode::Concat => u,
        };

        let mut grad_input = vec![0.0f32; cache.input.len()];
        let mut dz_fwd = vec![0.0f32; batch * steps * g4];
        let mut dz_bwd = vec![0.0f32; batch * steps * g4];
        {
            let (fwd_dir, bwd_dir) = (&self.forward_dir, &self.backward_dir);
            let (fwd, bwd) = (&cache.forward, &cache.backward);
            grad_input
                .par_chunks_mut(steps * f_in)
                .zip(dz_fwd.par_chunks_mut(steps * g4))
                .zip(dz_bwd.par_chunks_mut(steps * g4))
                .zip(grad_output.data.par_chunks(steps * width))
                .enumerate()
                .for_each(|(b, (((dx, dzf), dzb), dh))| {
                    let gate_range = b * steps * g4..(b + 1) * steps * g4;
                    let cell_range = b * steps * u..(b + 1) * steps * u;
                    fwd_dir.backprop(steps, &fwd.gates[gate_range.clone()], &fwd.cell[cell_range.clone()], dh, width, 0, dzf, dx);
                    bwd_dir.backprop(steps, &bwd.gates[gate_range], &bwd.cell[cell_range], dh, width, backward_offset, dzb, dx);
                });
        }

        self.forward_dir
            .accumulate_grads(&cache.input.data, &cache.forward, &dz_fwd, batch, steps);
        self.backward_dir
            .accumulate_grads(&cache.input.data, &cache.backward, &dz_bwd, batch, steps);

        let desc = cache.input.desc.clone();
        self.cache = Some(cache);
        Tensor::new(desc, grad_input)
    }

    fn parameters(&self) -> Vec<&Param> {
        let mut params: Vec<&Param> = self.forward_dir.params().into();
        params.extend(self.backward_dir.params());
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Param> {
        let mut params: Vec<&mut Param> = self.forward_dir.params_mut().into();
        params.extend(self.backward_dir.params_mut());
        params
    }

    fn memory_requirements(&self, output_shape: &TensorDesc) -> u64 {
        // Gate, cell and hidden traces per direction on top of the default
        let param_bytes = (self.parameter_count() * std::mem::size_of::<f32>()) as u64;
        let steps_total = output_shape.num_elements() / self.output_width().max(1);
        let trace_bytes = (steps_total * 6 * self.units * 2 * std::mem::size_of::<f32>()) as u64;
        param_bytes * 2 + output_shape.size_in_bytes() as u64 * 2 + trace_bytes
    }

    fn name(&self) -> String {
        "BiLSTM".to_string()
    }

    fn config_string(&self) -> Option<String> {
        Some(format!(
            "in_features={}, units={}, merge={:?}",
            self.input_features, self.units, self.merge
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::layer::gradcheck;
    use approx::assert_abs_diff_eq;
    use rand::{rngs::StdRng, SeedableRng};

    fn sequence(batch: usize, steps: usize, features: usize) -> Tensor {
        let desc = TensorDesc::new_sequence(batch, steps, features);
        let n = desc.num_elements();
        Tensor::new(desc, (0..n).map(|i| (i as f32 * 0.61).sin() * 0.8).collect()).unwrap()
    }

    #[test]
    fn merge_mode_sets_output_width() {
        let mut rng = StdRng::seed_from_u64(0);
        let sum = BiLstmLayer::new(8, 4, MergeMode::Sum, &mut rng);
        let concat = BiLstmLayer::new(8, 4, MergeMode::Concat, &mut rng);
        let input = TensorDesc::new_sequence(2, 6, 8);
        assert_eq!(sum.output_shape(&input).unwrap(), TensorDesc::new_sequence(2, 6, 4));
        assert_eq!(concat.output_shape(&input).unwrap(), TensorDesc::new_sequence(2, 6, 8));
        assert_eq!(sum.parameter_count(), 2 * (8 * 16 + 4 * 16 + 16));
    }

    #[test]
    fn forget_bias_starts_at_one() {
        let mut rng = StdRng::seed_from_u64(0);
        let layer = BiLstmLayer::new(3, 2, MergeMode::Sum, &mut rng);
        assert_eq!(layer.forward_dir.bias.value, vec![0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn samples_are_independent() {
        let mut rng = StdRng::seed_from_u64(2);
        let mut layer = BiLstmLayer::new(3, 4, MergeMode::Concat, &mut rng);
        let batch = sequence(2, 5, 3);
        let single = Tensor::new(TensorDesc::new_sequence(1, 5, 3), batch.data[15..].to_vec()).unwrap();
        let out_batch = layer.forward(&batch, ForwardMode::Eval).unwrap();
        let out_single = layer.forward(&single, ForwardMode::Eval).unwrap();
        for (a, b) in out_batch.data[40..].iter().zip(&out_single.data) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-6);
        }
    }

    #[test]
    fn reverse_direction_sees_future_inputs() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut layer = BiLstmLayer::new(2, 3, MergeMode::Concat, &mut rng);
        let a = sequence(1, 4, 2);
        let mut b = a.clone();
        // Change only the last timestep
        b.data[6] += 1.0;
        let out_a = layer.forward(&a, ForwardMode::Eval).unwrap();
        let out_b = layer.forward(&b, ForwardMode::Eval).unwrap();
        // t = 0: forward half unchanged, backward half changed
        assert_eq!(&out_a.data[..3], &out_b.data[..3]);
        assert!(out_a.data[3..6].iter().zip(&out_b.data[3..6]).any(|(x, y)| (x - y).abs() > 1e-6));
    }

    #[test]
    fn gradients_match_finite_differences() {
        for merge in [MergeMode::Sum, MergeMode::Concat] {
            let mut rng = StdRng::seed_from_u64(11);
            let mut layer = BiLstmLayer::new(3, 2, merge, &mut rng);
            let input = sequence(2, 4, 3);
            gradcheck::check_input_grad(&mut layer, &input, 2e-2);
            gradcheck::check_param_grads(&mut layer, &input, 2e-2);
        }
    }
}
