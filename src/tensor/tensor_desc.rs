use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TensorDesc {
    // For vectors/1D tensors (e.g., biases)
    Vector { length: usize },

    // For matrices/2D tensors (e.g., dense and recurrent kernels)
    Matrix { rows: usize, cols: usize },

    // [batch, steps, features] sequences fed to the recurrent stack
    Sequence {
        batch: usize,
        steps: usize,
        features: usize,
    },

    // For 4D tensors (e.g., conv layer weights, image batches)
    Tensor4D {
        batch: usize,
        channels: usize,
        height: usize,
        width: usize,
    },
}

impl TensorDesc {
    pub fn new_vector(length: usize) -> Self {
        Self::Vector { length }
    }

    pub fn new_matrix(rows: usize, cols: usize) -> Self {
        Self::Matrix { rows, cols }
    }

    pub fn new_sequence(batch: usize, steps: usize, features: usize) -> Self {
        Self::Sequence { batch, steps, features }
    }

    pub fn new_tensor4d(batch: usize, channels: usize, height: usize, width: usize) -> Self {
        Self::Tensor4D { batch, channels, height, width }
    }

    pub fn size_in_bytes(&self) -> usize {
        self.num_elements() * std::mem::size_of::<f32>()
    }

    pub fn num_elements(&self) -> usize {
        self.to_dims().iter().product()
    }

    pub fn to_dims(&self) -> Vec<usize> {
        match self {
            Self::Vector { length } => vec![*length],
            Self::Matrix { rows, cols } => vec![*rows, *cols],
            Self::Sequence { batch, steps, features } => vec![*batch, *steps, *features],
            Self::Tensor4D { batch, channels, height, width } => {
                vec![*batch, *channels, *height, *width]
            }
        }
    }

    /// Leading batch dimension for activation tensors.
    pub fn batch(&self) -> Option<usize> {
        match self {
            Self::Sequence { batch, .. } | Self::Tensor4D { batch, .. } => Some(*batch),
            Self::Matrix { rows, .. } => Some(*rows),
            Self::Vector { .. } => None,
        }
    }

    /// Same shape with a different leading batch dimension.
    pub fn with_batch(&self, batch: usize) -> Self {
        match self {
            Self::Vector { length } => Self::Vector { length: *length },
            Self::Matrix { cols, .. } => Self::Matrix { rows: batch, cols: *cols },
            Self::Sequence { steps, features, .. } => Self::Sequence {
                batch,
                steps: *steps,
                features: *features,
            },
            Self::Tensor4D { channels, height, width, .. } => Self::Tensor4D {
                batch,
                channels: *channels,
                height: *height,
                width: *width,
            },
        }
    }
}

impl fmt::Display for TensorDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dims = self
            .to_dims()
            .iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>()
            .join("×");
        write!(f, "{}", dims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_dims_and_size() {
        let desc = TensorDesc::new_sequence(2, 32, 512);
        assert_eq!(desc.to_dims(), vec![2, 32, 512]);
        assert_eq!(desc.num_elements(), 2 * 32 * 512);
        assert_eq!(desc.size_in_bytes(), 2 * 32 * 512 * 4);
        assert_eq!(desc.to_string(), "2×32×512");
    }

    #[test]
    fn with_batch_keeps_trailing_dims() {
        let desc = TensorDesc::new_tensor4d(8, 64, 16, 64).with_batch(1);
        assert_eq!(desc, TensorDesc::new_tensor4d(1, 64, 16, 64));
        assert_eq!(desc.batch(), Some(1));
        assert_eq!(TensorDesc::new_vector(3).batch(), None);
    }
}
