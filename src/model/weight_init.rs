use rand::distributions::{Distribution, Uniform};
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::tensor::TensorDesc;

// Truncated normal at two standard deviations has this std for a unit normal
const TRUNCATED_NORMAL_STD: f32 = 0.879_625_7;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum WeightInit {
    Xavier,              // Glorot uniform, dense projections
    He,                  // Truncated normal, ReLU stacks
    Orthogonal,          // Recurrent kernels
    UniformRandom {      // Simple uniform random in range
        min: f32,
        max: f32,
    },
    Constant(f32),
}

impl WeightInit {
    // Matrix kernels are [in, out]; conv kernels are [out, in, kh, kw]
    fn fans(desc: &TensorDesc) -> (usize, usize) {
        match desc {
            TensorDesc::Matrix { rows, cols } => (*rows, *cols),
            TensorDesc::Tensor4D { batch, channels, height, width } => {
                let kernel_size = height * width;
                (channels * kernel_size, batch * kernel_size)
            }
            TensorDesc::Sequence { steps, features, .. } => (*steps, *features),
            TensorDesc::Vector { length } => (1, *length),
        }
    }

    fn truncated_normal<R: Rng + ?Sized>(rng: &mut R, std_dev: f32) -> f32 {
        loop {
            let z: f32 = rng.sample(StandardNormal);
            if z.abs() <= 2.0 {
                return z * std_dev;
            }
        }
    }

    pub fn init<R: Rng + ?Sized>(&self, desc: &TensorDesc, rng: &mut R) -> Vec<f32> {
        let total_elements = desc.num_elements();
        let (fan_in, fan_out) = Self::fans(desc);

        match self {
            WeightInit::Xavier => {
                let limit = (6.0 / (fan_in + fan_out).max(1) as f32).sqrt();
                let dist = Uniform::new_inclusive(-limit, limit);
                (0..total_elements).map(|_| dist.sample(rng)).collect()
            }

            WeightInit::He => {
                let std_dev = (2.0 / fan_in.max(1) as f32).sqrt() / TRUNCATED_NORMAL_STD;
                (0..total_elements)
                    .map(|_| Self::truncated_normal(rng, std_dev))
                    .collect()
            }

            WeightInit::Orthogonal => Self::orthogonal(fan_in, fan_out, rng),

            WeightInit::UniformRandom { min, max } => {
                let dist = Uniform::new(*min, *max);
                (0..total_elements).map(|_| dist.sample(rng)).collect()
            }

            WeightInit::Constant(value) => vec![*value; total_elements],
        }
    }

    // Gram-Schmidt over the shorter side, transposed back when rows > cols
    fn orthogonal<R: Rng + ?Sized>(rows: usize, cols: usize, rng: &mut R) -> Vec<f32> {
        let (count, len) = if rows <= cols { (rows, cols) } else { (cols, rows) };
        let mut basis: Vec<Vec<f32>> = Vec::with_capacity(count);

        while basis.len() < count {
            let mut v: Vec<f32> = (0..len).map(|_| rng.sample(StandardNormal)).collect();
            for b in &basis {
                let dot: f32 = v.iter().zip(b).map(|(x, y)| x * y).sum();
                v.iter_mut().zip(b).for_each(|(x, y)| *x -= dot * y);
            }
            let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
            // Degenerate draw, try again
            if norm < 1e-6 {
                continue;
            }
            v.iter_mut().for_each(|x| *x /= norm);
            basis.push(v);
        }

        let mut out = vec![0.0; rows * cols];
        for r in 0..rows {
            for c in 0..cols {
                out[r * cols + c] = if rows <= cols { basis[r][c] } else { basis[c][r] };
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn he_respects_truncation_bound() {
        let mut rng = StdRng::seed_from_u64(7);
        let desc = TensorDesc::new_tensor4d(8, 4, 3, 3);
        let w = WeightInit::He.init(&desc, &mut rng);
        let bound = 2.0 * (2.0f32 / 36.0).sqrt() / TRUNCATED_NORMAL_STD;
        assert_eq!(w.len(), 8 * 4 * 9);
        assert!(w.iter().all(|v| v.abs() <= bound + 1e-6));
    }

    #[test]
    fn orthogonal_rows_are_orthonormal() {
        let mut rng = StdRng::seed_from_u64(3);
        let (rows, cols) = (4, 16);
        let w = WeightInit::Orthogonal.init(&TensorDesc::new_matrix(rows, cols), &mut rng);
        for a in 0..rows {
            for b in 0..rows {
                let dot: f32 = (0..cols).map(|c| w[a * cols + c] * w[b * cols + c]).sum();
                assert_abs_diff_eq!(dot, if a == b { 1.0 } else { 0.0 }, epsilon = 1e-4);
            }
        }
    }

    #[test]
    fn orthogonal_tall_matrix_has_orthonormal_columns() {
        let mut rng = StdRng::seed_from_u64(5);
        let (rows, cols) = (12, 3);
        let w = WeightInit::Orthogonal.init(&TensorDesc::new_matrix(rows, cols), &mut rng);
        for a in 0..cols {
            let norm: f32 = (0..rows).map(|r| w[r * cols + a].powi(2)).sum();
            assert_abs_diff_eq!(norm, 1.0, epsilon = 1e-4);
        }
    }

    #[test]
    fn seeded_init_is_reproducible() {
        let desc = TensorDesc::new_matrix(5, 7);
        let a = WeightInit::Xavier.init(&desc, &mut StdRng::seed_from_u64(11));
        let b = WeightInit::Xavier.init(&desc, &mut StdRng::seed_from_u64(11));
        assert_eq!(a, b);
    }
}
