use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{CrnnError, Result};

/// Random distortions for training data. A bound of 0 disables its transform.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AugmentationConfig {
    pub max_augmentations_per_sample: usize,
    pub width_shift_range: f32,  // pixels
    pub height_shift_range: f32, // pixels
    pub zoom_range: f32,         // percent
    pub shear_range: f32,        // degrees
    pub rotation_range: f32,     // degrees
    pub blur_factor: u32,        // largest odd Gaussian kernel
    pub add_noise_factor: f32,   // noise std in [0, 1] intensity units
    pub cache_path: Option<PathBuf>,
}

impl AugmentationConfig {
    pub fn build(self) -> Result<Self> {
        let ranges = [
            ("width_shift_range", self.width_shift_range),
            ("height_shift_range", self.height_shift_range),
            ("zoom_range", self.zoom_range),
            ("shear_range", self.shear_range),
            ("rotation_range", self.rotation_range),
            ("add_noise_factor", self.add_noise_factor),
        ];
        if let Some((name, value)) = ranges.iter().find(|(_, v)| !v.is_finite() || *v < 0.0) {
            return Err(CrnnError::InvalidConfig(format!("{} must be a non-negative number, got {}", name, value)));
        }
        if self.zoom_range >= 100.0 {
            return Err(CrnnError::InvalidConfig(format!(
                "zoom_range is a percentage below 100, got {}",
                self.zoom_range
            )));
        }
        if self.shear_range >= 90.0 {
            return Err(CrnnError::InvalidConfig(format!(
                "shear_range must stay below 90 degrees, got {}",
                self.shear_range
            )));
        }
        Ok(self)
    }

    /// True when at least one transform can change an image.
    pub fn is_active(&self) -> bool {
        self.width_shift_range > 0.0
            || self.height_shift_range > 0.0
            || self.zoom_range > 0.0
            || self.shear_range > 0.0
            || self.rotation_range > 0.0
            || self.blur_factor >= 3
            || self.add_noise_factor > 0.0
    }
}

impl Default for AugmentationConfig {
    fn default() -> Self {
        Self {
            max_augmentations_per_sample: 3,
            width_shift_range: 15.0,
            height_shift_range: 10.0,
            zoom_range: 12.0,
            shear_range: 15.0,
            rotation_range: 20.0,
            blur_factor: 5,
            add_noise_factor: 0.01,
            cache_path: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    pub image_shape: (usize, usize), // (width, height)
    pub down_sample_factor: usize,
    pub batch_size: usize,
    pub max_label_length: usize,
    pub shuffle: bool,
    pub shuffle_seed: Option<u64>,
    // Only set for the training generator
    pub augmentation: Option<AugmentationConfig>,
}

impl GeneratorConfig {
    pub fn build(mut self) -> Result<Self> {
        let (width, height) = self.image_shape;
        if width == 0 || height == 0 {
            return Err(CrnnError::InvalidConfig(format!(
                "image_shape must be positive, got {}×{}",
                width, height
            )));
        }
        if self.down_sample_factor == 0 {
            return Err(CrnnError::InvalidConfig("down_sample_factor must be positive".into()));
        }
        if self.batch_size == 0 {
            return Err(CrnnError::InvalidConfig("batch_size must be positive".into()));
        }
        if self.max_label_length == 0 {
            return Err(CrnnError::InvalidConfig("max_label_length must be positive".into()));
        }
        if self.predicted_length() < self.max_label_length {
            return Err(CrnnError::InvalidConfig(format!(
                "image width {} / down_sample_factor {} gives {} timesteps, fewer than max_label_length {}",
                width,
                self.down_sample_factor,
                self.predicted_length(),
                self.max_label_length
            )));
        }
        self.augmentation = self.augmentation.map(AugmentationConfig::build).transpose()?;
        Ok(self)
    }

    /// Timesteps the network emits for one image of this width.
    pub fn predicted_length(&self) -> usize {
        self.image_shape.0 / self.down_sample_factor.max(1)
    }

    /// Variants stored per source image: the clean one plus the augmented ones.
    pub fn variants_per_sample(&self) -> usize {
        match &self.augmentation {
            Some(aug) => 1 + aug.max_augmentations_per_sample,
            None => 1,
        }
    }
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            image_shape: (128, 32),
            down_sample_factor: 4,
            batch_size: 32,
            max_label_length: 10,
            shuffle: true,
            shuffle_seed: None,
            augmentation: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = GeneratorConfig::default().build().unwrap();
        assert_eq!(config.predicted_length(), 32);
        assert_eq!(config.variants_per_sample(), 1);
    }

    #[test]
    fn rejects_too_few_timesteps() {
        let config = GeneratorConfig {
            image_shape: (32, 32),
            max_label_length: 9,
            ..Default::default()
        };
        assert!(matches!(config.build(), Err(CrnnError::InvalidConfig(_))));
    }

    #[test]
    fn rejects_zero_sizes() {
        for config in [
            GeneratorConfig { batch_size: 0, ..Default::default() },
            GeneratorConfig { down_sample_factor: 0, ..Default::default() },
            GeneratorConfig { image_shape: (0, 32), ..Default::default() },
            GeneratorConfig { max_label_length: 0, ..Default::default() },
        ] {
            assert!(config.build().is_err());
        }
    }

    #[test]
    fn augmentation_bounds_are_checked() {
        let bad = AugmentationConfig { zoom_range: 120.0, ..Default::default() };
        assert!(bad.build().is_err());
        let negative = AugmentationConfig { rotation_range: -1.0, ..Default::default() };
        assert!(negative.build().is_err());
        assert!(AugmentationConfig::default().build().unwrap().is_active());
    }

    #[test]
    fn augmented_variants_extend_samples() {
        let config = GeneratorConfig {
            augmentation: Some(AugmentationConfig { max_augmentations_per_sample: 2, ..Default::default() }),
            ..Default::default()
        };
        assert_eq!(config.variants_per_sample(), 3);
    }
}
