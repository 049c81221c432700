use serde::{Deserialize, Serialize};

use crate::{
    error::{CrnnError, Result},
    layer::{
        batch_norm::{DEFAULT_EPSILON, DEFAULT_MOMENTUM},
        bilstm::MergeMode,
    },
    tensor::TensorDesc,
};

use super::weight_init::WeightInit;

pub const CONV_FILTERS: [usize; 7] = [64, 128, 256, 256, 512, 512, 512];
pub const LSTM_UNITS: usize = 256;

/// One record of the ordered layer list. Input sizes are resolved when the
/// graph is built, so a record only carries what it adds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum LayerSpec {
    Conv2D {
        out_channels: usize,
        kernel: (usize, usize),
        stride: (usize, usize),
        padding: (usize, usize),
        init: WeightInit,
    },
    BatchNorm {
        momentum: f32,
        epsilon: f32,
    },
    ReLU,
    MaxPool2D {
        pool: (usize, usize),
        stride: (usize, usize),
    },
    ToSequence,
    BiLstm {
        units: usize,
        merge: MergeMode,
    },
    Dense {
        units: usize,
        init: WeightInit,
    },
    Softmax,
}

impl LayerSpec {
    /// 3×3 convolution, stride 1, "same" padding, He-normal kernel.
    pub fn conv3x3(out_channels: usize) -> Self {
        Self::Conv2D {
            out_channels,
            kernel: (3, 3),
            stride: (1, 1),
            padding: (1, 1),
            init: WeightInit::He,
        }
    }

    pub fn batch_norm() -> Self {
        Self::BatchNorm {
            momentum: DEFAULT_MOMENTUM,
            epsilon: DEFAULT_EPSILON,
        }
    }

    // Pool sizes are (height, width)
    pub fn max_pool(pool: (usize, usize)) -> Self {
        Self::MaxPool2D { pool, stride: pool }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Conv2D { .. } => "Conv2D",
            Self::BatchNorm { .. } => "BatchNorm",
            Self::ReLU => "ReLU",
            Self::MaxPool2D { .. } => "MaxPool2D",
            Self::ToSequence => "ToSequence",
            Self::BiLstm { .. } => "BiLSTM",
            Self::Dense { .. } => "Dense",
            Self::Softmax => "Softmax",
        }
    }

    /// Factor by which this layer shrinks the width axis.
    pub fn width_stride(&self) -> usize {
        match self {
            Self::Conv2D { stride, .. } | Self::MaxPool2D { stride, .. } => stride.1,
            _ => 1,
        }
    }

    /// Shape arithmetic only; nothing is allocated.
    pub fn output_shape(&self, input: &TensorDesc) -> Result<TensorDesc> {
        let collapse = || {
            CrnnError::InvalidConfig(format!("{} collapses input of shape {} to nothing", self.name(), input))
        };
        match (self, input) {
            (
                Self::Conv2D { out_channels, kernel, stride, padding, .. },
                TensorDesc::Tensor4D { batch, height, width, .. },
            ) => {
                let h = (height + 2 * padding.0).checked_sub(kernel.0).ok_or_else(collapse)? / stride.0 + 1;
                let w = (width + 2 * padding.1).checked_sub(kernel.1).ok_or_else(collapse)? / stride.1 + 1;
                Ok(TensorDesc::new_tensor4d(*batch, *out_channels, h, w))
            }
            (Self::MaxPool2D { pool, stride }, TensorDesc::Tensor4D { batch, channels, height, width }) => {
                let h = height.checked_sub(pool.0).ok_or_else(collapse)? / stride.0 + 1;
                let w = width.checked_sub(pool.1).ok_or_else(collapse)? / stride.1 + 1;
                Ok(TensorDesc::new_tensor4d(*batch, *channels, h, w))
            }
            (Self::ToSequence, TensorDesc::Tensor4D { batch, channels, height, width }) => {
                Ok(TensorDesc::new_sequence(*batch, *width, channels * height))
            }
            (Self::BiLstm { units, merge }, TensorDesc::Sequence { batch, steps, .. }) => {
                let features = match merge {
                    MergeMode::Sum => *units,
                    MergeMode::Concat => 2 * units,
                };
                Ok(TensorDesc::new_sequence(*batch, *steps, features))
            }
            (Self::Dense { units, .. }, TensorDesc::Sequence { batch, steps, .. }) => {
                Ok(TensorDesc::new_sequence(*batch, *steps, *units))
            }
            (Self::Dense { units, .. }, TensorDesc::Matrix { rows, .. }) => Ok(TensorDesc::new_matrix(*rows, *units)),
            (Self::BatchNorm { .. } | Self::ReLU | Self::Softmax, _) => Ok(input.clone()),
            _ => Err(CrnnError::Layer(format!("{} cannot consume input of shape {}", self.name(), input))),
        }
    }

    /// The recognizer: seven conv blocks, column sequence, two BiLSTMs and a
    /// per-timestep softmax classifier.
    pub fn crnn(num_classes: usize) -> Vec<LayerSpec> {
        let mut specs = Vec::new();
        for (block, filters) in CONV_FILTERS.iter().enumerate() {
            specs.push(Self::conv3x3(*filters));
            specs.push(Self::batch_norm());
            specs.push(Self::ReLU);
            match block {
                0 | 1 => specs.push(Self::max_pool((2, 2))),
                3 | 5 | 6 => specs.push(Self::max_pool((2, 1))),
                _ => {}
            }
        }
        specs.push(Self::ToSequence);
        specs.push(Self::BiLstm {
            units: LSTM_UNITS,
            merge: MergeMode::Sum,
        });
        specs.push(Self::batch_norm());
        specs.push(Self::BiLstm {
            units: LSTM_UNITS,
            merge: MergeMode::Concat,
        });
        specs.push(Self::Dense {
            units: num_classes,
            init: WeightInit::Xavier,
        });
        specs.push(Self::Softmax);
        specs
    }
}
