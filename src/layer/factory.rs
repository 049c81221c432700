use rand::Rng;

use crate::{
    error::{CrnnError, Result},
    model::{layer_spec::LayerSpec, weight_init::WeightInit},
    tensor::TensorDesc,
};

use super::{
    activations::{ActivationLayer, ActivationType},
    batch_norm::BatchNormLayer,
    bilstm::{BiLstmLayer, MergeMode},
    conv2d::Conv2DLayer,
    layer::Layer,
    linear::LinearLayer,
    pooling::MaxPool2DLayer,
    reshape::ToSequenceLayer,
};

pub struct Layers;

impl Layers {
    pub fn conv2d<R: Rng + ?Sized>(in_channels: usize, out_channels: usize, rng: &mut R) -> Box<dyn Layer> {
        Box::new(Conv2DLayer::new(in_channels, out_channels, WeightInit::He, rng))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn conv2d_with<R: Rng + ?Sized>(
        in_channels: usize,
        out_channels: usize,
        kernel: (usize, usize),
        stride: (usize, usize),
        padding: (usize, usize),
        init: WeightInit,
        rng: &mut R,
    ) -> Box<dyn Layer> {
        Box::new(Conv2DLayer::new_with(in_channels, out_channels, kernel, stride, padding, init, rng))
    }

    pub fn batch_norm(features: usize) -> Box<dyn Layer> {
        Box::new(BatchNormLayer::new(features))
    }

    pub fn batch_norm_with(features: usize, momentum: f32, epsilon: f32) -> Box<dyn Layer> {
        Box::new(BatchNormLayer::new_with(features, momentum, epsilon))
    }

    pub fn max_pool2d(pool: (usize, usize), stride: (usize, usize)) -> Box<dyn Layer> {
        Box::new(MaxPool2DLayer::new(pool, stride))
    }

    pub fn to_sequence() -> Box<dyn Layer> {
        Box::new(ToSequenceLayer::new())
    }

    pub fn bilstm<R: Rng + ?Sized>(in_features: usize, units: usize, merge: MergeMode, rng: &mut R) -> Box<dyn Layer> {
        Box::new(BiLstmLayer::new(in_features, units, merge, rng))
    }

    pub fn linear<R: Rng + ?Sized>(in_features: usize, out_features: usize, init: WeightInit, rng: &mut R) -> Box<dyn Layer> {
        Box::new(LinearLayer::new(in_features, out_features, init, rng))
    }

    pub fn relu() -> Box<dyn Layer> {
        Box::new(ActivationLayer::new(ActivationType::ReLU))
    }

    pub fn softmax() -> Box<dyn Layer> {
        Box::new(ActivationLayer::new(ActivationType::Softmax))
    }

    /// Instantiates a layer record against the shape it will receive.
    pub fn from_spec<R: Rng + ?Sized>(spec: &LayerSpec, input: &TensorDesc, rng: &mut R) -> Result<Box<dyn Layer>> {
        let layer = match spec {
            LayerSpec::Conv2D { out_channels, kernel, stride, padding, init } => {
                let in_channels = match input {
                    TensorDesc::Tensor4D { channels, .. } => *channels,
                    _ => return Err(Self::unexpected(spec, input)),
                };
                Self::conv2d_with(in_channels, *out_channels, *kernel, *stride, *padding, *init, rng)
            }
            LayerSpec::BatchNorm { momentum, epsilon } => {
                Self::batch_norm_with(Self::feature_axis(spec, input)?, *momentum, *epsilon)
            }
            LayerSpec::ReLU => Self::relu(),
            LayerSpec::MaxPool2D { pool, stride } => Self::max_pool2d(*pool, *stride),
            LayerSpec::ToSequence => Self::to_sequence(),
            LayerSpec::BiLstm { units, merge } => {
                Self::bilstm(Self::feature_axis(spec, input)?, *units, *merge, rng)
            }
            LayerSpec::Dense { units, init } => {
                Self::linear(Self::feature_axis(spec, input)?, *units, *init, rng)
            }
            LayerSpec::Softmax => Self::softmax(),
        };
        Ok(layer)
    }

    // Channels of a feature map, features of a sequence or row
    fn feature_axis(spec: &LayerSpec, input: &TensorDesc) -> Result<usize> {
        match input {
            TensorDesc::Tensor4D { channels, .. } => Ok(*channels),
            TensorDesc::Sequence { features, .. } => Ok(*features),
            TensorDesc::Matrix { cols, .. } => Ok(*cols),
            TensorDesc::Vector { .. } => Err(Self::unexpected(spec, input)),
        }
    }

    fn unexpected(spec: &LayerSpec, input: &TensorDesc) -> CrnnError {
        CrnnError::Layer(format!("{} cannot consume input of shape {}", spec.name(), input))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn conv_spec_reads_channels_from_input() {
        let mut rng = StdRng::seed_from_u64(0);
        let layer = Layers::from_spec(&LayerSpec::conv3x3(16), &TensorDesc::new_tensor4d(1, 3, 8, 8), &mut rng).unwrap();
        assert_eq!(layer.parameter_count(), 16 * 3 * 9 + 16);
    }

    #[test]
    fn conv_spec_rejects_sequences() {
        let mut rng = StdRng::seed_from_u64(0);
        let result = Layers::from_spec(&LayerSpec::conv3x3(16), &TensorDesc::new_sequence(1, 4, 4), &mut rng);
        assert!(result.is_err());
    }

    #[test]
    fn batch_norm_spec_follows_sequence_features() {
        let mut rng = StdRng::seed_from_u64(0);
        let layer = Layers::from_spec(&LayerSpec::batch_norm(), &TensorDesc::new_sequence(2, 5, 7), &mut rng).unwrap();
        assert_eq!(layer.parameter_count(), 14);
        assert_eq!(layer.state().len(), 2);
    }

    #[test]
    fn layers_display_name_and_config() {
        assert_eq!(Layers::max_pool2d((2, 1), (2, 1)).to_string(), "MaxPool2D(pool=2×1, stride=2×1)");
        assert_eq!(Layers::relu().to_string(), "ReLU");
        assert_eq!(format!("{}", Layers::softmax()), "Softmax(axis=-1)");
    }
}
