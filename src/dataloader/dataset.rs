use std::{
    collections::HashSet,
    path::{Path, PathBuf},
};

use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CrnnError, Result};

pub type Sample = (PathBuf, String);

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    pub src_dir: PathBuf,
    pub train_ratio: f32,
    pub sort_dataset: bool,
    pub shuffle: bool,
    pub shuffle_seed: Option<u64>,
}

impl DatasetConfig {
    pub fn build(self) -> Result<Self> {
        if !(self.train_ratio > 0.0 && self.train_ratio < 1.0) {
            return Err(CrnnError::InvalidSplitRatio { train: self.train_ratio });
        }
        Ok(self)
    }
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            src_dir: PathBuf::from("data"),
            train_ratio: 0.9,
            sort_dataset: true,
            shuffle: true,
            shuffle_seed: None,
        }
    }
}

/// Label encoded in a file name: the stem up to the first `_`.
pub fn label_from_path(path: &Path) -> Option<String> {
    let stem = path.file_stem()?.to_str()?;
    let label = stem.split('_').next().unwrap_or(stem);
    (!label.is_empty()).then(|| label.to_string())
}

fn valid_extensions() -> HashSet<String> {
    image::ImageFormat::all()
        .flat_map(|format| format.extensions_str())
        .map(|ext| ext.to_string())
        .collect()
}

/// Every image in `dir` with its label. Files without a usable label are skipped.
pub fn scan_dataset(dir: &Path, sort: bool) -> Result<Vec<Sample>> {
    if !dir.is_dir() {
        return Err(CrnnError::DirectoryNotFound(dir.to_path_buf()));
    }
    let extensions = valid_extensions();

    let mut samples: Vec<Sample> = std::fs::read_dir(dir)?
        .filter_map(std::result::Result::ok)
        .map(|entry| entry.path())
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| extensions.contains(&ext.to_lowercase()))
                .unwrap_or(false)
        })
        .filter_map(|path| {
            let label = label_from_path(&path);
            if label.is_none() {
                debug!(path = %path.display(), "skipping file without label");
            }
            label.map(|label| (path, label))
        })
        .collect();

    if samples.is_empty() {
        return Err(CrnnError::EmptyDataset(dir.to_path_buf()));
    }

    // read_dir order depends on the filesystem
    if sort {
        samples.sort_unstable();
    }
    Ok(samples)
}

/// Optionally shuffles, then splits into (train, validation).
///
/// Returns the seed actually used so the split can be reproduced.
pub fn train_val_split(mut samples: Vec<Sample>, config: &DatasetConfig) -> Result<(Vec<Sample>, Vec<Sample>, u64)> {
    let seed = config.shuffle_seed.unwrap_or_else(|| rand::thread_rng().gen());
    if config.shuffle {
        samples.shuffle(&mut StdRng::seed_from_u64(seed));
    }

    let train_size = (samples.len() as f32 * config.train_ratio) as usize;
    if train_size == 0 || train_size == samples.len() {
        return Err(CrnnError::InvalidConfig(format!(
            "{} samples with train_ratio {} leaves one split empty",
            samples.len(),
            config.train_ratio
        )));
    }
    let val = samples.split_off(train_size);
    Ok((samples, val, seed))
}

/// Scan, split and report.
pub fn load_splits(config: &DatasetConfig) -> Result<(Vec<Sample>, Vec<Sample>)> {
    let samples = scan_dataset(&config.src_dir, config.sort_dataset)?;
    let (train, val, seed) = train_val_split(samples, config)?;
    super::info::log_dataset_info(config, train.len(), val.len(), seed);
    Ok((train, val))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch_images(dir: &Path, names: &[&str]) {
        for name in names {
            image::GrayImage::new(4, 4).save(dir.join(name)).unwrap();
        }
    }

    #[test]
    fn labels_come_from_the_stem_prefix() {
        assert_eq!(label_from_path(Path::new("x/AB12_0003.png")).as_deref(), Some("AB12"));
        assert_eq!(label_from_path(Path::new("plain.jpg")).as_deref(), Some("plain"));
        assert_eq!(label_from_path(Path::new("_7.png")), None);
    }

    #[test]
    fn scan_keeps_images_only() {
        let dir = tempfile::tempdir().unwrap();
        touch_images(dir.path(), &["b_1.png", "a_2.png"]);
        std::fs::write(dir.path().join("notes.txt"), "x").unwrap();

        let samples = scan_dataset(dir.path(), true).unwrap();
        let labels: Vec<&str> = samples.iter().map(|(_, l)| l.as_str()).collect();
        assert_eq!(labels, vec!["a", "b"]);
    }

    #[test]
    fn missing_and_empty_directories_fail() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(scan_dataset(dir.path(), true), Err(CrnnError::EmptyDataset(_))));
        assert!(matches!(
            scan_dataset(&dir.path().join("nope"), true),
            Err(CrnnError::DirectoryNotFound(_))
        ));
    }

    #[test]
    fn split_is_deterministic_per_seed() {
        let samples: Vec<Sample> = (0..20).map(|i| (PathBuf::from(format!("{}.png", i)), i.to_string())).collect();
        let config = DatasetConfig {
            shuffle_seed: Some(727),
            ..Default::default()
        };
        let (train_a, val_a, seed) = train_val_split(samples.clone(), &config).unwrap();
        let (train_b, val_b, _) = train_val_split(samples, &config).unwrap();
        assert_eq!(seed, 727);
        assert_eq!(train_a.len(), 18);
        assert_eq!(val_a.len(), 2);
        assert_eq!((train_a, val_a), (train_b, val_b));
    }

    #[test]
    fn split_ratio_is_validated() {
        assert!(DatasetConfig { train_ratio: 1.0, ..Default::default() }.build().is_err());
        assert!(DatasetConfig { train_ratio: 0.0, ..Default::default() }.build().is_err());
    }
}
