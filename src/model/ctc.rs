use rayon::prelude::*;
use tracing::warn;

use crate::{
    dataloader::charset::BLANK_INDEX,
    error::{CrnnError, Result},
    tensor::{Tensor, TensorDesc},
};

/// Added to every probability before taking its log.
pub const PROB_EPSILON: f64 = 1e-7;

#[inline]
fn log_add(a: f64, b: f64) -> f64 {
    if a == f64::NEG_INFINITY {
        return b;
    }
    if b == f64::NEG_INFINITY {
        return a;
    }
    let (hi, lo) = if a > b { (a, b) } else { (b, a) };
    hi + (lo - hi).exp().ln_1p()
}

/// Connectionist temporal classification loss over softmax outputs.
///
/// Works on probabilities rather than logits: every probability is offset by
/// [`PROB_EPSILON`] and the forward-backward recursions run in log space.
/// Returns one loss per sample together with the gradient of each loss with
/// respect to the probabilities.
#[derive(Clone, Debug)]
pub struct CtcLoss {
    pub blank: usize,
    // Report infeasible alignments as 0 instead of +inf
    pub zero_infinity: bool,
}

impl Default for CtcLoss {
    fn default() -> Self {
        Self {
            blank: BLANK_INDEX as usize,
            zero_infinity: false,
        }
    }
}

/// Label and length inputs for one batch, all flattened row-major.
pub struct CtcTargets<'a> {
    pub labels: &'a [i64],   // [B, L]
    pub max_label_length: usize,
    pub predicted_lengths: &'a [i64], // [B]
    pub true_lengths: &'a [i64],      // [B]
}

impl CtcLoss {
    pub fn new(blank: usize, zero_infinity: bool) -> Self {
        Self { blank, zero_infinity }
    }

    fn validate(&self, probs: &TensorDesc, targets: &CtcTargets) -> Result<(usize, usize, usize)> {
        let (batch, steps, classes) = match probs {
            TensorDesc::Sequence { batch, steps, features } => (*batch, *steps, *features),
            other => {
                return Err(CrnnError::ShapeMismatch {
                    context: "CTC probabilities".into(),
                    expected: "[batch, steps, classes]".into(),
                    actual: other.to_string(),
                })
            }
        };
        if self.blank >= classes {
            return Err(CrnnError::InvalidConfig(format!(
                "CTC blank index {} outside {} classes",
                self.blank, classes
            )));
        }

        let check_len = |name: &str, expected: usize, actual: usize| -> Result<()> {
            if expected != actual {
                return Err(CrnnError::ShapeMismatch {
                    context: format!("CTC {}", name),
                    expected: expected.to_string(),
                    actual: actual.to_string(),
                });
            }
            Ok(())
        };
        check_len("labels", batch * targets.max_label_length, targets.labels.len())?;
        check_len("predicted lengths", batch, targets.predicted_lengths.len())?;
        check_len("true lengths", batch, targets.true_lengths.len())?;

        for b in 0..batch {
            let predicted = targets.predicted_lengths[b];
            let true_length = targets.true_lengths[b];
            if predicted < 1 || predicted as usize > steps {
                return Err(CrnnError::ShapeMismatch {
                    context: format!("CTC predicted length of sample {}", b),
                    expected: format!("1..={}", steps),
                    actual: predicted.to_string(),
                });
            }
            if true_length < 0 || true_length as usize > targets.max_label_length {
                return Err(CrnnError::ShapeMismatch {
                    context: format!("CTC true length of sample {}", b),
                    expected: format!("0..={}", targets.max_label_length),
                    actual: true_length.to_string(),
                });
            }
            if true_length > predicted {
                return Err(CrnnError::LengthInvariant {
                    sample: b,
                    true_length,
                    predicted_length: predicted,
                });
            }
            let row = &targets.labels[b * targets.max_label_length..][..true_length as usize];
            if let Some(bad) = row
                .iter()
                .find(|&&v| v < 0 || v as usize >= classes || v as usize == self.blank)
            {
                return Err(CrnnError::ShapeMismatch {
                    context: format!("CTC label value of sample {}", b),
                    expected: format!("non-blank class below {}", classes),
                    actual: bad.to_string(),
                });
            }
        }
        Ok((batch, steps, classes))
    }

    /// Per-sample losses only.
    pub fn forward(&self, probs: &Tensor, targets: &CtcTargets) -> Result<Vec<f32>> {
        Ok(self.forward_backward(probs, targets)?.0)
    }

    /// Per-sample losses and dloss/dprobs for each sample's own loss.
    pub fn forward_backward(&self, probs: &Tensor, targets: &CtcTargets) -> Result<(Vec<f32>, Tensor)> {
        let (_, steps, classes) = self.validate(&probs.desc, targets)?;
        let max_len = targets.max_label_length;

        let mut grad = vec![0.0f32; probs.len()];
        let losses: Vec<f32> = grad
            .par_chunks_mut(steps * classes)
            .zip(probs.data.par_chunks(steps * classes))
            .enumerate()
            .map(|(b, (g, y))| {
                let label_len = targets.true_lengths[b] as usize;
                let label: Vec<usize> = targets.labels[b * max_len..][..label_len]
                    .iter()
                    .map(|&v| v as usize)
                    .collect();
                let frames = targets.predicted_lengths[b] as usize;
                let loss = self.sample(&y[..frames * classes], classes, &label, &mut g[..frames * classes]);
                if loss.is_infinite() {
                    warn!(sample = b, frames, label_len, "CTC alignment is infeasible");
                    if self.zero_infinity {
                        return 0.0;
                    }
                }
                loss
            })
            .collect();

        Ok((losses, Tensor::new(probs.desc.clone(), grad)?))
    }

    // Loss of one sample over its first `frames` rows; writes the gradient
    fn sample(&self, y: &[f32], classes: usize, label: &[usize], grad: &mut [f32]) -> f32 {
        let frames = y.len() / classes;
        let log_y: Vec<f64> = y.iter().map(|&p| (p as f64 + PROB_EPSILON).ln()).collect();

        // Blank-interleaved label
        let mut ext = Vec::with_capacity(2 * label.len() + 1);
        ext.push(self.blank);
        for &c in label {
            ext.push(c);
            ext.push(self.blank);
        }
        let s_len = ext.len();
        let skip_allowed = |s: usize| s >= 2 && ext[s] != self.blank && ext[s] != ext[s - 2];
        let ly = |t: usize, s: usize| log_y[t * classes + ext[s]];

        let mut alpha = vec![f64::NEG_INFINITY; frames * s_len];
        alpha[0] = ly(0, 0);
        if s_len > 1 {
            alpha[1] = ly(0, 1);
        }
        for t in 1..frames {
            for s in 0..s_len {
                let prev = &alpha[(t - 1) * s_len..t * s_len];
                let mut acc = prev[s];
                if s >= 1 {
                    acc = log_add(acc, prev[s - 1]);
                }
                if skip_allowed(s) {
                    acc = log_add(acc, prev[s - 2]);
                }
                if acc != f64::NEG_INFINITY {
                    alpha[t * s_len + s] = acc + ly(t, s);
                }
            }
        }

        let last = (frames - 1) * s_len;
        let mut log_likelihood = alpha[last + s_len - 1];
        if s_len > 1 {
            log_likelihood = log_add(log_likelihood, alpha[last + s_len - 2]);
        }
        if log_likelihood == f64::NEG_INFINITY {
            grad.fill(0.0);
            return f32::INFINITY;
        }

        let mut beta = vec![f64::NEG_INFINITY; frames * s_len];
        beta[last + s_len - 1] = ly(frames - 1, s_len - 1);
        if s_len > 1 {
            beta[last + s_len - 2] = ly(frames - 1, s_len - 2);
        }
        for t in (0..frames - 1).rev() {
            for s in 0..s_len {
                let next = &beta[(t + 1) * s_len..(t + 2) * s_len];
                let mut acc = next[s];
                if s + 1 < s_len {
                    acc = log_add(acc, next[s + 1]);
                }
                if s + 2 < s_len && skip_allowed(s + 2) {
                    acc = log_add(acc, next[s + 2]);
                }
                if acc != f64::NEG_INFINITY {
                    beta[t * s_len + s] = acc + ly(t, s);
                }
            }
        }

        // dL/dy(t,k) = -Σ_{s: ext[s]=k} α·β / (P · y²)
        let mut occupancy = vec![f64::NEG_INFINITY; classes];
        for t in 0..frames {
            occupancy.fill(f64::NEG_INFINITY);
            for s in 0..s_len {
                let ab = alpha[t * s_len + s] + beta[t * s_len + s];
                occupancy[ext[s]] = log_add(occupancy[ext[s]], ab);
            }
            for k in 0..classes {
                grad[t * classes + k] = if occupancy[k] == f64::NEG_INFINITY {
                    0.0
                } else {
                    -(occupancy[k] - 2.0 * log_y[t * classes + k] - log_likelihood).exp() as f32
                };
            }
        }

        -log_likelihood as f32
    }
}
