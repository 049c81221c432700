use std::{fs::File, io::BufReader, path::{Path, PathBuf}};

use serde::{Deserialize, Serialize};

use crate::{
    dataloader::{dataset::DatasetConfig, AugmentationConfig, Charset, GeneratorConfig},
    error::{CrnnError, Result},
    model::ModelDesc,
};

use super::{cleanup::CleanupPolicy, optimizer::DEFAULT_LEARNING_RATE};

pub const AUGMENTATION_CACHE_NAME: &str = "augmentation_cache.bin";

/// Everything a training run needs, loadable from JSON. Missing fields take
/// their defaults.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub dataset: DatasetConfig,
    pub save_dir: PathBuf,
    pub image_size: (usize, usize), // (width, height)
    pub batch_size: usize,
    pub max_label_length: usize,
    // Derived from the dataset labels when absent
    pub charset: Option<Charset>,
    pub epochs: usize,
    pub steps_per_epoch: usize,
    // val.data_nbr / batch_size when absent
    pub validation_steps: Option<usize>,
    pub learning_rate: f32,
    pub lr_reduce_factor: f32,
    pub lr_patience: usize,
    pub augmentation: Option<AugmentationConfig>,
    pub cache_policy: CleanupPolicy,
    pub prefetch: bool,
    pub threads: usize, // 0 = one per core
    pub seed: Option<u64>,
    pub zero_infinity: bool,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            dataset: DatasetConfig::default(),
            save_dir: PathBuf::from("models"),
            image_size: (128, 32),
            batch_size: 32,
            max_label_length: 10,
            charset: None,
            epochs: 100,
            steps_per_epoch: 200,
            validation_steps: None,
            learning_rate: DEFAULT_LEARNING_RATE,
            lr_reduce_factor: 0.1,
            lr_patience: 3,
            augmentation: Some(AugmentationConfig::default()),
            cache_policy: CleanupPolicy::Ask,
            prefetch: true,
            threads: 0,
            seed: None,
            zero_infinity: false,
        }
    }
}

impl TrainConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }

    pub fn build(mut self) -> Result<Self> {
        self.dataset = self.dataset.build()?;
        if self.epochs == 0 {
            return Err(CrnnError::InvalidConfig("epochs must be positive".into()));
        }
        if self.steps_per_epoch == 0 {
            return Err(CrnnError::InvalidConfig("steps_per_epoch must be positive".into()));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(CrnnError::InvalidConfig(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if !(self.lr_reduce_factor > 0.0 && self.lr_reduce_factor < 1.0) {
            return Err(CrnnError::InvalidConfig(format!(
                "lr_reduce_factor must lie in (0, 1), got {}",
                self.lr_reduce_factor
            )));
        }
        // Generator settings are checked by the same rules the generator uses
        self.generator_config(true).build()?;
        Ok(self)
    }

    pub fn threads(&self) -> usize {
        if self.threads == 0 {
            num_cpus::get()
        } else {
            self.threads
        }
    }

    pub fn cache_path(&self) -> Option<PathBuf> {
        self.augmentation
            .as_ref()
            .map(|aug| aug.cache_path.clone().unwrap_or_else(|| self.save_dir.join(AUGMENTATION_CACHE_NAME)))
    }

    /// Generator settings for one split. Only the training split is augmented.
    pub fn generator_config(&self, training: bool) -> GeneratorConfig {
        let augmentation = if training {
            self.augmentation.clone().map(|aug| AugmentationConfig {
                cache_path: self.cache_path(),
                ..aug
            })
        } else {
            None
        };
        GeneratorConfig {
            image_shape: self.image_size,
            down_sample_factor: ModelDesc::crnn(self.image_size, 2).down_sample_factor(),
            batch_size: self.batch_size,
            max_label_length: self.max_label_length,
            shuffle: true,
            shuffle_seed: self.seed.map(|s| if training { s } else { s.wrapping_add(1) }),
            augmentation,
        }
    }
}
