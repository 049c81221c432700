use serde::{Deserialize, Serialize};

use crate::{
    error::{CrnnError, Result},
    tensor::TensorDesc,
};

use super::layer_spec::LayerSpec;

/// Ordered description of the recognizer for a fixed input size.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelDesc {
    pub image_size: (usize, usize), // (width, height)
    pub num_classes: usize,
    pub layers: Vec<LayerSpec>,
}

impl ModelDesc {
    pub fn new(image_size: (usize, usize), num_classes: usize) -> Self {
        Self {
            image_size,
            num_classes,
            layers: Vec::new(),
        }
    }

    pub fn crnn(image_size: (usize, usize), num_classes: usize) -> Self {
        let mut desc = Self::new(image_size, num_classes);
        desc.add_layers(LayerSpec::crnn(num_classes));
        desc
    }

    pub fn add_layer(&mut self, layer: LayerSpec) {
        self.layers.push(layer);
    }

    pub fn add_layers(&mut self, layers: Vec<LayerSpec>) {
        for layer in layers.into_iter() {
            self.add_layer(layer);
        }
    }

    /// Grayscale image batch as NCHW.
    pub fn input_desc(&self, batch: usize) -> TensorDesc {
        TensorDesc::new_tensor4d(batch, 1, self.image_size.1, self.image_size.0)
    }

    /// Output shape after every layer, in order.
    pub fn output_shapes(&self, batch: usize) -> Result<Vec<TensorDesc>> {
        let mut current = self.input_desc(batch);
        let mut shapes = Vec::with_capacity(self.layers.len());
        for spec in &self.layers {
            current = spec.output_shape(&current)?;
            if current.num_elements() == 0 {
                return Err(CrnnError::InvalidConfig(format!(
                    "{} produces an empty tensor for image size {}×{}",
                    spec.name(),
                    self.image_size.0,
                    self.image_size.1
                )));
            }
            shapes.push(current.clone());
        }
        Ok(shapes)
    }

    /// Product of the width strides; the ratio of image columns to output steps.
    pub fn down_sample_factor(&self) -> usize {
        self.layers.iter().map(|l| l.width_stride()).product()
    }

    /// Number of timesteps T the network emits for one image.
    pub fn output_steps(&self) -> Result<usize> {
        match self.output_shapes(1)?.last() {
            Some(TensorDesc::Sequence { steps, .. }) => Ok(*steps),
            Some(other) => Err(CrnnError::InvalidConfig(format!(
                "model ends in {} instead of a sequence",
                other
            ))),
            None => Err(CrnnError::InvalidConfig("model has no layers".into())),
        }
    }
}

/// A few-parameter stand-in for the full recognizer.
#[cfg(test)]
pub(crate) fn tiny_desc(num_classes: usize) -> ModelDesc {
    use super::weight_init::WeightInit;
    use crate::layer::bilstm::MergeMode;

    let mut desc = ModelDesc::new((8, 4), num_classes);
    desc.add_layers(vec![
        LayerSpec::conv3x3(2),
        LayerSpec::batch_norm(),
        LayerSpec::ReLU,
        LayerSpec::max_pool((2, 2)),
        LayerSpec::ToSequence,
        LayerSpec::BiLstm { units: 2, merge: MergeMode::Sum },
        LayerSpec::Dense { units: num_classes, init: WeightInit::Xavier },
        LayerSpec::Softmax,
    ]);
    desc
}
