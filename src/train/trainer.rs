use std::{
    io,
    path::{Path, PathBuf},
};

use tracing::{info, warn};

use crate::{
    dataloader::{dataset::load_splits, info::log_generator_info, BatchGenerator, BatchSource, Charset},
    error::{CrnnError, Result},
    model::{build, build_seeded, ctc::CtcLoss, graph::mean_loss, summary::log_model_stats, Mode, Predictor, TrainingModel},
};

use super::{
    checkpoint::{save_checkpoint, save_model, ModelArtifact, FINAL_MODEL_NAME},
    cleanup::clean_cache,
    config::TrainConfig,
    optimizer::Adam,
    schedule::ReduceLrOnPlateau,
};

#[derive(Clone, Debug, PartialEq)]
pub struct EpochStats {
    pub epoch: usize,
    pub loss: f32,
    pub val_loss: f32,
    pub learning_rate: f32,
    pub checkpoint: Option<PathBuf>,
}

/// Outcome of [`train`].
#[derive(Debug)]
pub struct TrainReport {
    pub history: Vec<EpochStats>,
    pub model_path: PathBuf,
    pub cache_removed: bool,
}

/// Validation passes needed to see every validation entry once.
pub fn validation_steps(data_nbr: usize, batch_size: usize) -> usize {
    (data_nbr / batch_size.max(1)).max(1)
}

/// Adam on the CTC model with a plateau schedule on validation loss.
pub struct Trainer {
    model: TrainingModel,
    optimizer: Adam,
    schedule: ReduceLrOnPlateau,
    // Best checkpoints go here; None keeps them in memory only
    checkpoint_dir: Option<PathBuf>,
    best_val_loss: f32,
}

impl Trainer {
    pub fn new(model: TrainingModel, optimizer: Adam, schedule: ReduceLrOnPlateau) -> Self {
        Self {
            model,
            optimizer,
            schedule,
            checkpoint_dir: None,
            best_val_loss: f32::INFINITY,
        }
    }

    pub fn with_checkpoint_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.checkpoint_dir = Some(dir.into());
        self
    }

    pub fn model(&self) -> &TrainingModel {
        &self.model
    }

    pub fn into_model(self) -> TrainingModel {
        self.model
    }

    pub fn learning_rate(&self) -> f32 {
        self.optimizer.learning_rate
    }

    pub fn train_epoch(&mut self, train: &mut dyn BatchSource, steps: usize) -> Result<f32> {
        let mut losses = Vec::with_capacity(steps);
        for _ in 0..steps {
            let batch = train.next_batch()?;
            let loss = self.model.train_step(&batch)?;
            self.optimizer.step(self.model.predictor_mut().parameters_mut());
            losses.push(loss);
        }
        Ok(mean_loss(&losses))
    }

    pub fn validate(&mut self, val: &mut dyn BatchSource, steps: usize) -> Result<f32> {
        let mut losses = Vec::with_capacity(steps);
        for _ in 0..steps {
            let batch = val.next_batch()?;
            losses.push(self.model.evaluate(&batch)?);
        }
        Ok(mean_loss(&losses))
    }

    /// Runs `epochs` epochs of `steps_per_epoch` training steps, each
    /// followed by `validation_steps` validation batches.
    pub fn fit(
        &mut self,
        epochs: usize,
        train: &mut dyn BatchSource,
        val: &mut dyn BatchSource,
        steps_per_epoch: usize,
        validation_steps: usize,
    ) -> Result<Vec<EpochStats>> {
        let mut history = Vec::with_capacity(epochs);
        for epoch in 1..=epochs {
            let learning_rate = self.optimizer.learning_rate;
            let loss = self.train_epoch(train, steps_per_epoch)?;
            let val_loss = self.validate(val, validation_steps)?;

            let mut checkpoint = None;
            if val_loss < self.best_val_loss {
                info!(epoch, from = self.best_val_loss, to = val_loss, "val_loss improved");
                self.best_val_loss = val_loss;
                if let Some(dir) = &self.checkpoint_dir {
                    checkpoint = Some(save_checkpoint(dir, epoch, loss, val_loss, self.model.predictor())?);
                }
            }

            info!(epoch, epochs, loss, val_loss, learning_rate, "epoch finished");
            let next_rate = self.schedule.step(val_loss, learning_rate);
            if next_rate < learning_rate {
                info!(epoch, learning_rate = next_rate, "reducing learning rate");
            }
            self.optimizer.learning_rate = next_rate;

            history.push(EpochStats {
                epoch,
                loss,
                val_loss,
                learning_rate,
                checkpoint,
            });
        }
        Ok(history)
    }
}

fn source(generator: BatchGenerator, prefetch: bool) -> Box<dyn BatchSource> {
    if prefetch {
        Box::new(generator.prefetch())
    } else {
        Box::new(generator)
    }
}

/// Full run: scan and split the dataset, build generators and model, fit,
/// write the final model, then deal with the augmentation cache.
pub fn train(config: TrainConfig) -> Result<TrainReport> {
    let config = config.build()?;
    std::fs::create_dir_all(&config.save_dir)?;

    let (train_samples, val_samples) = load_splits(&config.dataset)?;
    let charset = match config.charset.clone() {
        Some(charset) => charset,
        None => Charset::from_labels(train_samples.iter().chain(&val_samples).map(|(_, label)| label.as_str()))?,
    };
    info!(charset = %charset.as_string(), num_classes = charset.num_classes(), "charset");

    let train_gen = BatchGenerator::new(train_samples, &charset, config.generator_config(true))?;
    let val_gen = BatchGenerator::new(val_samples, &charset, config.generator_config(false))?;
    log_generator_info("train", train_gen.data_nbr(), config.batch_size);
    log_generator_info("validation", val_gen.data_nbr(), config.batch_size);

    let cache_path = train_gen.cache().map(|cache| cache.path().to_path_buf());
    if let Some(size) = train_gen.cache_size_bytes() {
        info!("augmentation cache size: {:.2} MB", super::cleanup::size_in_mb(size));
    }
    let validation_steps = config
        .validation_steps
        .unwrap_or_else(|| validation_steps(val_gen.data_nbr(), config.batch_size));

    let graph = match config.seed {
        Some(seed) => build_seeded(config.image_size, charset.num_classes(), config.max_label_length, Mode::Training, seed)?,
        None => build(config.image_size, charset.num_classes(), config.max_label_length, Mode::Training)?,
    };
    let model = graph
        .into_training()
        .ok_or_else(|| CrnnError::InvalidConfig("training graph expected".into()))?
        .with_loss(CtcLoss {
            zero_infinity: config.zero_infinity,
            ..Default::default()
        });
    log_model_stats(model.predictor(), config.batch_size);

    let mut trainer = Trainer::new(
        model,
        Adam::new(config.learning_rate),
        ReduceLrOnPlateau::new(config.lr_reduce_factor, config.lr_patience),
    )
    .with_checkpoint_dir(&config.save_dir);

    let history = {
        let mut train_source = source(train_gen, config.prefetch);
        let mut val_source = source(val_gen, config.prefetch);
        trainer.fit(
            config.epochs,
            train_source.as_mut(),
            val_source.as_mut(),
            config.steps_per_epoch,
            validation_steps,
        )?
        // Generators and their cache handles are dropped here
    };

    let model_path = config.save_dir.join(FINAL_MODEL_NAME);
    let model = trainer.into_model();
    let artifact = ModelArtifact::new(model.predictor(), model.max_label_length(), charset);
    save_model(&model_path, &artifact)?;

    let cache_removed = match cache_path {
        Some(path) => clean_cache(&path, config.cache_policy, io::stdin().lock(), io::stdout()),
        None => false,
    };
    Ok(TrainReport {
        history,
        model_path,
        cache_removed,
    })
}

/// Loads a trained model for inference.
pub fn load_predictor(path: &Path) -> Result<(Predictor, Charset)> {
    let artifact = super::checkpoint::load_model(path)?;
    if artifact.charset.num_classes() != artifact.model.num_classes {
        warn!(
            charset = artifact.charset.num_classes(),
            model = artifact.model.num_classes,
            "charset does not match the model output"
        );
    }
    let charset = artifact.charset.clone();
    Ok((artifact.into_predictor()?, charset))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dataloader::Batch,
        model::model_desc::tiny_desc,
        tensor::{Tensor, TensorDesc},
    };
    use rand::{rngs::StdRng, Rng, SeedableRng};

    // Replays the same batch forever
    struct FixedSource {
        batch: Batch,
    }

    impl BatchSource for FixedSource {
        fn next_batch(&mut self) -> Result<Batch> {
            Ok(self.batch.clone())
        }

        fn data_nbr(&self) -> usize {
            self.batch.len()
        }
    }

    fn fixed_source(seed: u64) -> FixedSource {
        let mut rng = StdRng::seed_from_u64(seed);
        let pixels: Vec<f32> = (0..2 * 4 * 8).map(|_| rng.gen()).collect();
        let images = Tensor::new(TensorDesc::new_tensor4d(2, 1, 4, 8), pixels).unwrap();
        let batch = Batch::new(vec![1, 2, 2, 0], images, vec![4, 4], vec![2, 1], 2, 0).unwrap();
        FixedSource { batch }
    }

    fn trainer(learning_rate: f32) -> Trainer {
        let predictor = Predictor::new(tiny_desc(3), &mut StdRng::seed_from_u64(11)).unwrap();
        Trainer::new(
            TrainingModel::new(predictor, 2),
            Adam::new(learning_rate),
            ReduceLrOnPlateau::default(),
        )
    }

    #[test]
    fn training_loss_goes_down_on_a_fixed_batch() {
        let mut trainer = trainer(0.02);
        let mut train = fixed_source(1);
        let mut val = fixed_source(2);
        let history = trainer.fit(4, &mut train, &mut val, 15, 1).unwrap();

        assert_eq!(history.len(), 4);
        assert!(history.iter().all(|e| e.loss.is_finite() && e.val_loss.is_finite()));
        assert!(history[3].loss < history[0].loss, "{:?}", history);
    }

    #[test]
    fn checkpoints_follow_val_improvement() {
        let dir = tempfile::tempdir().unwrap();
        let mut trainer = trainer(0.01).with_checkpoint_dir(dir.path());
        let history = trainer.fit(2, &mut fixed_source(1), &mut fixed_source(2), 2, 1).unwrap();

        // The first epoch always beats the initial infinite best
        let first = history[0].checkpoint.as_ref().unwrap();
        assert!(first.exists());
        let saved = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(saved, history.iter().filter(|e| e.checkpoint.is_some()).count());
        for epoch in &history {
            if let Some(path) = &epoch.checkpoint {
                let name = path.file_name().unwrap().to_string_lossy().to_string();
                assert!(name.starts_with(&format!("ep{:03}-loss", epoch.epoch)), "{}", name);
            }
        }
    }

    #[test]
    fn validation_steps_cover_the_split() {
        assert_eq!(validation_steps(100, 32), 3);
        assert_eq!(validation_steps(10, 32), 1);
    }
}
