use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::{debug, warn};

use crate::{
    dataloader::batch::Batch,
    error::{CrnnError, Result},
    layer::{ForwardMode, Layer, Layers, Param},
    tensor::{Tensor, TensorDesc},
};

use super::{
    ctc::{CtcLoss, CtcTargets},
    model_desc::ModelDesc,
};

pub const TRUE_LABELS: &str = "true_labels";
pub const IMAGES: &str = "images";
pub const PREDICTED_LENGTHS: &str = "predicted_lengths";
pub const TRUE_LENGTHS: &str = "true_lengths";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Training,
    Inference,
}

/// Image to per-timestep class probabilities.
pub struct Predictor {
    desc: ModelDesc,
    layers: Vec<Box<dyn Layer>>,
    output_steps: usize,
}

impl Predictor {
    pub fn new<R: Rng + ?Sized>(desc: ModelDesc, rng: &mut R) -> Result<Self> {
        let output_steps = desc.output_steps()?;
        let mut current = desc.input_desc(1);
        let mut layers = Vec::with_capacity(desc.layers.len());
        for spec in &desc.layers {
            let layer = Layers::from_spec(spec, &current, rng)?;
            current = layer.output_shape(&current)?;
            debug!(layer = %layer, shape = %current, "built layer");
            layers.push(layer);
        }
        Ok(Self {
            desc,
            layers,
            output_steps,
        })
    }

    pub fn desc(&self) -> &ModelDesc {
        &self.desc
    }

    pub fn layers(&self) -> &[Box<dyn Layer>] {
        &self.layers
    }

    pub fn layers_mut(&mut self) -> &mut [Box<dyn Layer>] {
        &mut self.layers
    }

    pub fn input_names(&self) -> &'static [&'static str] {
        &[IMAGES]
    }

    pub fn output_steps(&self) -> usize {
        self.output_steps
    }

    /// Per-sample output shape [T, num_classes].
    pub fn output_shape(&self) -> (usize, usize) {
        (self.output_steps, self.desc.num_classes)
    }

    fn check_images(&self, images: &TensorDesc) -> Result<()> {
        let batch = images.batch().unwrap_or(0);
        let expected = self.desc.input_desc(batch);
        if *images != expected || batch == 0 {
            return Err(CrnnError::ShapeMismatch {
                context: IMAGES.into(),
                expected: format!("[B, {}, {}, 1] with B ≥ 1", self.desc.image_size.1, self.desc.image_size.0),
                actual: images.to_string(),
            });
        }
        Ok(())
    }

    pub fn forward(&mut self, images: &Tensor, mode: ForwardMode) -> Result<Tensor> {
        self.check_images(&images.desc)?;
        let mut x = images.clone();
        for layer in self.layers.iter_mut() {
            x = layer.forward(&x, mode)?;
        }
        Ok(x)
    }

    /// Probabilities [B, T, num_classes] using running statistics.
    pub fn predict(&mut self, images: &Tensor) -> Result<Tensor> {
        self.forward(images, ForwardMode::Eval)
    }

    /// Backpropagates a gradient w.r.t. the probabilities, leaving parameter
    /// gradients on every layer.
    pub fn backward(&mut self, grad_output: &Tensor) -> Result<()> {
        let mut grad = grad_output.clone();
        for layer in self.layers.iter_mut().rev() {
            grad = layer.backward(&grad)?;
        }
        Ok(())
    }

    pub fn parameters_mut(&mut self) -> Vec<&mut Param> {
        self.layers.iter_mut().flat_map(|l| l.parameters_mut()).collect()
    }

    pub fn parameter_count(&self) -> usize {
        self.layers.iter().map(|l| l.parameter_count()).sum()
    }
}

/// Predictor wrapped with the CTC loss; one loss per sample.
pub struct TrainingModel {
    predictor: Predictor,
    loss: CtcLoss,
    max_label_length: usize,
}

impl TrainingModel {
    pub fn new(predictor: Predictor, max_label_length: usize) -> Self {
        Self {
            predictor,
            loss: CtcLoss::default(),
            max_label_length,
        }
    }

    pub fn with_loss(mut self, loss: CtcLoss) -> Self {
        self.loss = loss;
        self
    }

    pub fn input_names(&self) -> &'static [&'static str] {
        &[TRUE_LABELS, IMAGES, PREDICTED_LENGTHS, TRUE_LENGTHS]
    }

    pub fn predictor(&self) -> &Predictor {
        &self.predictor
    }

    pub fn predictor_mut(&mut self) -> &mut Predictor {
        &mut self.predictor
    }

    pub fn into_predictor(self) -> Predictor {
        self.predictor
    }

    pub fn max_label_length(&self) -> usize {
        self.max_label_length
    }

    /// Checks the four inputs against the graph before any compute.
    pub fn validate_batch(&self, batch: &Batch) -> Result<()> {
        self.predictor.check_images(&batch.images.desc)?;
        let size = batch.len();
        let mismatch = |name: &str, expected: String, actual: String| CrnnError::ShapeMismatch {
            context: name.to_string(),
            expected,
            actual,
        };

        if batch.max_label_length != self.max_label_length || batch.true_labels.len() != size * self.max_label_length {
            return Err(mismatch(
                TRUE_LABELS,
                format!("[{}, {}]", size, self.max_label_length),
                format!("{} values with width {}", batch.true_labels.len(), batch.max_label_length),
            ));
        }
        if batch.predicted_lengths.len() != size {
            return Err(mismatch(
                PREDICTED_LENGTHS,
                format!("[{}, 1]", size),
                format!("{} values", batch.predicted_lengths.len()),
            ));
        }
        if batch.true_lengths.len() != size {
            return Err(mismatch(
                TRUE_LENGTHS,
                format!("[{}, 1]", size),
                format!("{} values", batch.true_lengths.len()),
            ));
        }

        let steps = self.predictor.output_steps as i64;
        for (sample, (&true_length, &predicted)) in batch.true_lengths.iter().zip(&batch.predicted_lengths).enumerate() {
            if true_length < 0 || true_length as usize > self.max_label_length {
                return Err(CrnnError::LabelTooLong {
                    label: format!("sample {}", sample),
                    length: true_length.max(0) as usize,
                    max: self.max_label_length,
                });
            }
            if true_length > predicted {
                return Err(CrnnError::LengthInvariant {
                    sample,
                    true_length,
                    predicted_length: predicted,
                });
            }
            if predicted < 1 || predicted > steps {
                return Err(mismatch(
                    PREDICTED_LENGTHS,
                    format!("1..={}", steps),
                    predicted.to_string(),
                ));
            }
        }
        Ok(())
    }

    fn targets<'a>(&self, batch: &'a Batch) -> CtcTargets<'a> {
        CtcTargets {
            labels: &batch.true_labels,
            max_label_length: self.max_label_length,
            predicted_lengths: &batch.predicted_lengths,
            true_lengths: &batch.true_lengths,
        }
    }

    /// Per-sample losses as a [B, 1] tensor.
    pub fn forward(&mut self, batch: &Batch, mode: ForwardMode) -> Result<Tensor> {
        self.validate_batch(batch)?;
        let probs = self.predictor.forward(&batch.images, mode)?;
        let losses = self.loss.forward(&probs, &self.targets(batch))?;
        Tensor::new(TensorDesc::new_matrix(batch.len(), 1), losses)
    }

    /// One forward/backward pass. Returns the mean loss; parameter gradients
    /// are left on the layers for the optimizer.
    pub fn train_step(&mut self, batch: &Batch) -> Result<f32> {
        self.validate_batch(batch)?;
        let probs = self.predictor.forward(&batch.images, ForwardMode::Train)?;
        let (losses, mut grad) = self.loss.forward_backward(&probs, &self.targets(batch))?;

        // The mean of the per-sample losses seeds each sample with 1/B
        let scale = 1.0 / batch.len() as f32;
        grad.data.iter_mut().for_each(|g| *g *= scale);
        self.predictor.backward(&grad)?;

        let mean = mean_loss(&losses);
        debug!(batch = batch.batch_number, loss = mean, "train step");
        Ok(mean)
    }

    /// Mean loss with running statistics; nothing is cached.
    pub fn evaluate(&mut self, batch: &Batch) -> Result<f32> {
        let losses = self.forward(batch, ForwardMode::Eval)?;
        Ok(mean_loss(&losses.data))
    }
}

pub fn mean_loss(losses: &[f32]) -> f32 {
    if losses.is_empty() {
        return 0.0;
    }
    losses.iter().sum::<f32>() / losses.len() as f32
}

pub enum Graph {
    Training(TrainingModel),
    Inference(Predictor),
}

impl Graph {
    pub fn mode(&self) -> Mode {
        match self {
            Graph::Training(_) => Mode::Training,
            Graph::Inference(_) => Mode::Inference,
        }
    }

    pub fn input_names(&self) -> &'static [&'static str] {
        match self {
            Graph::Training(model) => model.input_names(),
            Graph::Inference(predictor) => predictor.input_names(),
        }
    }

    pub fn predictor(&self) -> &Predictor {
        match self {
            Graph::Training(model) => model.predictor(),
            Graph::Inference(predictor) => predictor,
        }
    }

    pub fn into_training(self) -> Option<TrainingModel> {
        match self {
            Graph::Training(model) => Some(model),
            Graph::Inference(_) => None,
        }
    }

    pub fn into_inference(self) -> Predictor {
        match self {
            Graph::Training(model) => model.into_predictor(),
            Graph::Inference(predictor) => predictor,
        }
    }
}

fn validate(image_size: (usize, usize), num_classes: usize, max_label_length: usize) -> Result<()> {
    if image_size.0 == 0 || image_size.1 == 0 {
        return Err(CrnnError::InvalidConfig(format!(
            "image size must be positive, got {}×{}",
            image_size.0, image_size.1
        )));
    }
    if num_classes < 2 {
        return Err(CrnnError::InvalidConfig(format!(
            "num_classes must be at least 2 (blank + one symbol), got {}",
            num_classes
        )));
    }
    if max_label_length < 1 {
        return Err(CrnnError::InvalidConfig("max_label_length must be at least 1".into()));
    }
    Ok(())
}

/// Builds the recognizer with fresh random weights.
pub fn build(image_size: (usize, usize), num_classes: usize, max_label_length: usize, mode: Mode) -> Result<Graph> {
    build_with_rng(image_size, num_classes, max_label_length, mode, &mut StdRng::from_entropy())
}

/// Same as [`build`] with reproducible weights.
pub fn build_seeded(
    image_size: (usize, usize),
    num_classes: usize,
    max_label_length: usize,
    mode: Mode,
    seed: u64,
) -> Result<Graph> {
    build_with_rng(image_size, num_classes, max_label_length, mode, &mut StdRng::seed_from_u64(seed))
}

fn build_with_rng<R: Rng + ?Sized>(
    image_size: (usize, usize),
    num_classes: usize,
    max_label_length: usize,
    mode: Mode,
    rng: &mut R,
) -> Result<Graph> {
    validate(image_size, num_classes, max_label_length)?;
    let desc = ModelDesc::crnn(image_size, num_classes);
    desc.output_shapes(1)?;
    let predictor = Predictor::new(desc, rng)?;

    if max_label_length > predictor.output_steps() {
        warn!(
            max_label_length,
            steps = predictor.output_steps(),
            "labels may be longer than the output sequence"
        );
    }

    Ok(match mode {
        Mode::Training => Graph::Training(TrainingModel::new(predictor, max_label_length)),
        Mode::Inference => Graph::Inference(predictor),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_invalid_configuration() {
        assert!(matches!(build_seeded((0, 32), 5, 4, Mode::Inference, 0), Err(CrnnError::InvalidConfig(_))));
        assert!(matches!(build_seeded((8, 32), 1, 4, Mode::Inference, 0), Err(CrnnError::InvalidConfig(_))));
        assert!(matches!(build_seeded((8, 32), 5, 0, Mode::Training, 0), Err(CrnnError::InvalidConfig(_))));
        assert!(build_seeded((8, 16), 5, 1, Mode::Inference, 0).is_err());
    }

    #[test]
    fn input_names_depend_on_mode() {
        let training = build_seeded((8, 32), 4, 2, Mode::Training, 1).unwrap();
        assert_eq!(training.mode(), Mode::Training);
        assert_eq!(training.input_names(), &[TRUE_LABELS, IMAGES, PREDICTED_LENGTHS, TRUE_LENGTHS]);

        let inference = build_seeded((8, 32), 4, 2, Mode::Inference, 1).unwrap();
        assert_eq!(inference.input_names(), &[IMAGES]);
        assert!(inference.into_training().is_none());
    }

    #[test]
    fn mean_loss_of_empty_batch_is_zero() {
        assert_eq!(mean_loss(&[]), 0.0);
        assert_eq!(mean_loss(&[1.0, 3.0]), 2.0);
    }
}
