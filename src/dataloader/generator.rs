use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use image::{imageops::FilterType, GrayImage};
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
use rayon::prelude::*;
use tracing::{debug, info};

use crate::{
    error::{CrnnError, Result},
    tensor::{Tensor, TensorDesc},
};

use super::{
    augment::Augmenter,
    batch::Batch,
    cache::{CacheReader, CacheWriter},
    charset::Charset,
    config::GeneratorConfig,
    par_iter::PrefetchIterator,
};

// Samples materialized per parallel round while filling the cache
const CACHE_CHUNK: usize = 64;

/// Anything the trainer can pull batches from.
pub trait BatchSource {
    fn next_batch(&mut self) -> Result<Batch>;

    /// Entries in one pass over the data.
    fn data_nbr(&self) -> usize;
}

/// Decodes an image as 8-bit grayscale at the configured size.
pub fn load_gray(path: &Path, (width, height): (usize, usize)) -> Result<GrayImage> {
    let image = image::open(path)
        .map_err(|source| CrnnError::ImageLoad {
            path: path.to_path_buf(),
            source,
        })?
        .to_luma8();
    if image.dimensions() == (width as u32, height as u32) {
        return Ok(image);
    }
    Ok(image::imageops::resize(&image, width as u32, height as u32, FilterType::Triangle))
}

/// Infinite stream of batches over a labelled image list.
///
/// Each source image contributes `1 + max_augmentations_per_sample` entries
/// when augmentation is configured: the clean image and its augmented
/// variants. Entries are visited in a seeded order that is reshuffled every
/// time the list wraps; a batch may span two epochs.
#[derive(Debug)]
pub struct BatchGenerator {
    samples: Vec<(PathBuf, String)>,
    labels: Vec<Vec<i64>>,
    true_lengths: Vec<i64>,
    config: GeneratorConfig,
    augmenter: Option<Augmenter>,
    cache: Option<Arc<CacheReader>>,
    order: Vec<usize>,
    cursor: usize,
    epoch: usize,
    batch_number: usize,
    seed: u64,
    rng: StdRng,
}

impl BatchGenerator {
    pub fn new(samples: Vec<(PathBuf, String)>, charset: &Charset, config: GeneratorConfig) -> Result<Self> {
        let config = config.build()?;
        if samples.is_empty() {
            return Err(CrnnError::InvalidConfig("batch generator needs at least one sample".into()));
        }

        let mut labels = Vec::with_capacity(samples.len());
        let mut true_lengths = Vec::with_capacity(samples.len());
        for (path, label) in &samples {
            let encoded = charset.encode(label, config.max_label_length).map_err(|e| {
                tracing::error!(path = %path.display(), "unusable label");
                e
            })?;
            labels.push(encoded);
            true_lengths.push(label.chars().count() as i64);
        }

        let seed = config.shuffle_seed.unwrap_or_else(|| rand::thread_rng().gen());
        let augmenter = config.augmentation.clone().map(Augmenter::new);

        let mut generator = Self {
            samples,
            labels,
            true_lengths,
            config,
            augmenter,
            cache: None,
            order: Vec::new(),
            cursor: 0,
            epoch: 0,
            batch_number: 0,
            seed,
            rng: StdRng::seed_from_u64(seed),
        };

        if let Some(path) = generator
            .config
            .augmentation
            .as_ref()
            .and_then(|aug| aug.cache_path.clone())
        {
            generator.materialize_cache(&path)?;
        }
        generator.reset();

        info!(
            samples = generator.samples.len(),
            data_nbr = generator.data_nbr(),
            augmented = generator.augmenter.is_some(),
            seed,
            "batch generator ready"
        );
        Ok(generator)
    }

    pub fn config(&self) -> &GeneratorConfig {
        &self.config
    }

    pub fn samples(&self) -> &[(PathBuf, String)] {
        &self.samples
    }

    pub fn variants_per_sample(&self) -> usize {
        self.config.variants_per_sample()
    }

    pub fn data_nbr(&self) -> usize {
        self.samples.len() * self.variants_per_sample()
    }

    /// Full batches per pass over the data.
    pub fn steps_per_epoch(&self) -> usize {
        self.data_nbr() / self.config.batch_size
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn cache_path(&self) -> Option<&Path> {
        self.cache.as_deref().map(CacheReader::path)
    }

    pub fn cache_size_bytes(&self) -> Option<u64> {
        self.cache.as_deref().map(CacheReader::size_bytes)
    }

    /// Shared handle on the cache so it can be cleaned up after training.
    pub fn cache(&self) -> Option<Arc<CacheReader>> {
        self.cache.clone()
    }

    /// Back to the first batch of the first epoch with the original seed.
    pub fn reset(&mut self) {
        self.rng = StdRng::seed_from_u64(self.seed);
        self.order = (0..self.data_nbr()).collect();
        if self.config.shuffle {
            self.order.shuffle(&mut self.rng);
        }
        self.cursor = 0;
        self.epoch = 0;
        self.batch_number = 0;
    }

    fn next_entry(&mut self) -> usize {
        if self.cursor == self.order.len() {
            self.cursor = 0;
            self.epoch += 1;
            if self.config.shuffle {
                self.order.shuffle(&mut self.rng);
            }
            debug!(epoch = self.epoch, "batch generator wrapped");
        }
        let entry = self.order[self.cursor];
        self.cursor += 1;
        entry
    }

    // u8 pixels of one entry; augmented variants are drawn with `seed`
    fn entry_pixels(&self, entry: usize, seed: u64) -> Result<Vec<u8>> {
        if let Some(cache) = &self.cache {
            let mut buf = vec![0u8; cache.record_len()];
            cache.read_record(entry as u64, &mut buf)?;
            return Ok(buf);
        }

        let variants = self.variants_per_sample();
        let (sample, variant) = (entry / variants, entry % variants);
        let image = load_gray(&self.samples[sample].0, self.config.image_shape)?;
        let image = match (&self.augmenter, variant) {
            (Some(augmenter), v) if v > 0 => augmenter.augment(&image, &mut StdRng::seed_from_u64(seed)),
            _ => image,
        };
        Ok(image.into_raw())
    }

    pub fn next_batch(&mut self) -> Result<Batch> {
        let batch_size = self.config.batch_size;
        let (width, height) = self.config.image_shape;
        let max_len = self.config.max_label_length;

        let entries: Vec<usize> = (0..batch_size).map(|_| self.next_entry()).collect();
        let seeds: Vec<u64> = (0..batch_size).map(|_| self.rng.gen()).collect();

        let mut pixels = vec![0.0f32; batch_size * height * width];
        pixels
            .par_chunks_exact_mut(height * width)
            .zip(entries.par_iter().zip(seeds.par_iter()))
            .try_for_each(|(chunk, (&entry, &seed))| -> Result<()> {
                let raw = self.entry_pixels(entry, seed)?;
                for (dst, src) in chunk.iter_mut().zip(&raw) {
                    *dst = *src as f32 / 255.0;
                }
                Ok(())
            })?;

        let variants = self.variants_per_sample();
        let mut true_labels = Vec::with_capacity(batch_size * max_len);
        let mut true_lengths = Vec::with_capacity(batch_size);
        for &entry in &entries {
            let sample = entry / variants;
            true_labels.extend_from_slice(&self.labels[sample]);
            true_lengths.push(self.true_lengths[sample]);
        }
        let predicted_lengths = vec![self.config.predicted_length() as i64; batch_size];

        let images = Tensor::new(TensorDesc::new_tensor4d(batch_size, 1, height, width), pixels)?;
        let batch = Batch::new(
            true_labels,
            images,
            predicted_lengths,
            true_lengths,
            max_len,
            self.batch_number,
        )?;
        self.batch_number += 1;
        Ok(batch)
    }

    /// Borrowing, never-ending stream of batches.
    pub fn flow(&mut self) -> impl Iterator<Item = Result<Batch>> + '_ {
        std::iter::repeat_with(move || self.next_batch())
    }

    /// Moves the generator onto a background thread that assembles the next
    /// batch while the current one is consumed.
    pub fn prefetch(mut self) -> PrefetchedGenerator {
        let data_nbr = self.data_nbr();
        let cache = self.cache();
        PrefetchedGenerator {
            data_nbr,
            cache,
            batches: PrefetchIterator::spawn(move || Some(self.next_batch())),
        }
    }

    fn materialize_cache(&mut self, path: &Path) -> Result<()> {
        let Some(augmenter) = self.augmenter.clone() else {
            return Ok(());
        };
        let variants = self.variants_per_sample();
        let (width, height) = self.config.image_shape;
        let records = self.data_nbr() as u64;
        info!(path = %path.display(), records, "writing augmentation cache");

        // One seed per sample, drawn up front so the parallel fill is reproducible
        let seeds: Vec<u64> = (0..self.samples.len()).map(|_| self.rng.gen()).collect();
        let mut writer = CacheWriter::create(path, width as u32, height as u32, variants as u32, records)?;

        for (chunk_idx, chunk) in self.samples.chunks(CACHE_CHUNK).enumerate() {
            let base = chunk_idx * CACHE_CHUNK;
            let rendered: Vec<Vec<Vec<u8>>> = chunk
                .par_iter()
                .enumerate()
                .map(|(i, (path, _))| -> Result<Vec<Vec<u8>>> {
                    let clean = load_gray(path, (width, height))?;
                    let mut rng = StdRng::seed_from_u64(seeds[base + i]);
                    let mut out = Vec::with_capacity(variants);
                    for _ in 1..variants {
                        out.push(augmenter.augment(&clean, &mut rng).into_raw());
                    }
                    out.insert(0, clean.into_raw());
                    Ok(out)
                })
                .collect::<Result<_>>()?;

            for record in rendered.iter().flatten() {
                writer.write_record(record)?;
            }
        }

        self.cache = Some(Arc::new(writer.finish()?));
        Ok(())
    }
}

impl BatchSource for BatchGenerator {
    fn next_batch(&mut self) -> Result<Batch> {
        BatchGenerator::next_batch(self)
    }

    fn data_nbr(&self) -> usize {
        BatchGenerator::data_nbr(self)
    }
}

/// A generator running one batch ahead on its own thread.
pub struct PrefetchedGenerator {
    data_nbr: usize,
    cache: Option<Arc<CacheReader>>,
    batches: PrefetchIterator<Result<Batch>>,
}

impl PrefetchedGenerator {
    pub fn cache(&self) -> Option<Arc<CacheReader>> {
        self.cache.clone()
    }
}

impl BatchSource for PrefetchedGenerator {
    fn next_batch(&mut self) -> Result<Batch> {
        self.batches.recv()?
    }

    fn data_nbr(&self) -> usize {
        self.data_nbr
    }
}

impl Iterator for PrefetchedGenerator {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        self.batches.next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataloader::config::AugmentationConfig;
    use image::Luma;

    fn write_samples(dir: &Path, labels: &[&str]) -> Vec<(PathBuf, String)> {
        labels
            .iter()
            .enumerate()
            .map(|(i, label)| {
                let path = dir.join(format!("{}_{}.png", label, i));
                GrayImage::from_fn(16, 8, |x, y| Luma([((x * 13 + y * 7 + i as u32 * 31) % 256) as u8]))
                    .save(&path)
                    .unwrap();
                (path, label.to_string())
            })
            .collect()
    }

    fn config() -> GeneratorConfig {
        GeneratorConfig {
            image_shape: (16, 8),
            down_sample_factor: 4,
            batch_size: 3,
            max_label_length: 3,
            shuffle: true,
            shuffle_seed: Some(5),
            augmentation: None,
        }
    }

    #[test]
    fn cycles_every_entry_once_per_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let samples = write_samples(dir.path(), &["a", "b", "c", "ab", "ba", "cc"]);
        let charset = Charset::new("abc").unwrap();
        let mut generator = BatchGenerator::new(samples, &charset, config()).unwrap();

        let mut seen: Vec<Vec<i64>> = Vec::new();
        for _ in 0..2 {
            let batch = generator.next_batch().unwrap();
            seen.extend((0..batch.len()).map(|i| batch.label(i).to_vec()));
        }
        seen.sort();
        let mut expected: Vec<Vec<i64>> = ["a", "b", "c", "ab", "ba", "cc"]
            .iter()
            .map(|l| charset.encode(l, 3).unwrap())
            .collect();
        expected.sort();
        assert_eq!(seen, expected);
        assert_eq!(generator.epoch(), 0);
        generator.next_batch().unwrap();
        assert_eq!(generator.epoch(), 1);
    }

    #[test]
    fn reset_replays_the_same_order() {
        let dir = tempfile::tempdir().unwrap();
        let samples = write_samples(dir.path(), &["a", "b", "c", "ab"]);
        let charset = Charset::new("abc").unwrap();
        let mut generator = BatchGenerator::new(samples, &charset, config()).unwrap();

        let first: Vec<Vec<i64>> = generator.flow().take(3).map(|b| b.unwrap().true_labels).collect();
        generator.reset();
        let again: Vec<Vec<i64>> = generator.flow().take(3).map(|b| b.unwrap().true_labels).collect();
        assert_eq!(first, again);
    }

    #[test]
    fn small_dataset_repeats_within_a_batch() {
        let dir = tempfile::tempdir().unwrap();
        let samples = write_samples(dir.path(), &["a"]);
        let charset = Charset::new("a").unwrap();
        let mut generator = BatchGenerator::new(samples, &charset, config()).unwrap();
        let batch = generator.next_batch().unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(batch.true_lengths, vec![1, 1, 1]);
    }

    #[test]
    fn augmentation_extends_the_dataset() {
        let dir = tempfile::tempdir().unwrap();
        let samples = write_samples(dir.path(), &["a", "b"]);
        let charset = Charset::new("ab").unwrap();
        let config = GeneratorConfig {
            augmentation: Some(AugmentationConfig {
                max_augmentations_per_sample: 2,
                ..Default::default()
            }),
            ..config()
        };
        let generator = BatchGenerator::new(samples, &charset, config).unwrap();
        assert_eq!(generator.data_nbr(), 6);
        assert_eq!(generator.steps_per_epoch(), 2);
    }

    #[test]
    fn cached_variants_match_their_clean_source() {
        let dir = tempfile::tempdir().unwrap();
        let samples = write_samples(dir.path(), &["a", "b"]);
        let charset = Charset::new("ab").unwrap();
        let cache_path = dir.path().join("cache").join("aug.bin");
        let config = GeneratorConfig {
            shuffle: false,
            batch_size: 2,
            augmentation: Some(AugmentationConfig {
                max_augmentations_per_sample: 1,
                cache_path: Some(cache_path.clone()),
                ..Default::default()
            }),
            ..config()
        };
        let mut generator = BatchGenerator::new(samples.clone(), &charset, config).unwrap();
        assert_eq!(generator.cache_path(), Some(cache_path.as_path()));
        assert_eq!(generator.cache_size_bytes(), Some(std::fs::metadata(&cache_path).unwrap().len()));

        // Unshuffled: entry 0 is the clean first sample
        let batch = generator.next_batch().unwrap();
        let clean = load_gray(&samples[0].0, (16, 8)).unwrap();
        let expected: Vec<f32> = clean.into_raw().iter().map(|v| *v as f32 / 255.0).collect();
        assert_eq!(batch.image(0), expected.as_slice());
    }

    #[test]
    fn unreadable_image_names_its_path() {
        let dir = tempfile::tempdir().unwrap();
        let bogus = dir.path().join("a_0.png");
        std::fs::write(&bogus, b"not an image").unwrap();
        let charset = Charset::new("a").unwrap();
        let mut generator = BatchGenerator::new(vec![(bogus.clone(), "a".into())], &charset, config()).unwrap();
        match generator.next_batch() {
            Err(CrnnError::ImageLoad { path, .. }) => assert_eq!(path, bogus),
            other => panic!("expected image error, got {:?}", other.map(|b| b.len())),
        }
    }

    #[test]
    fn prefetched_batches_follow_the_same_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let samples = write_samples(dir.path(), &["a", "b", "c"]);
        let charset = Charset::new("abc").unwrap();
        let mut direct = BatchGenerator::new(samples.clone(), &charset, config()).unwrap();
        let mut prefetched = BatchGenerator::new(samples, &charset, config()).unwrap().prefetch();
        for _ in 0..3 {
            let a = direct.next_batch().unwrap();
            let b = BatchSource::next_batch(&mut prefetched).unwrap();
            assert_eq!(a.true_labels, b.true_labels);
            assert_eq!(a.images, b.images);
        }
    }

    #[test]
    fn dropping_prefetched_generator_releases_the_cache() {
        let dir = tempfile::tempdir().unwrap();
        let samples = write_samples(dir.path(), &["a", "b"]);
        let charset = Charset::new("ab").unwrap();
        let config = GeneratorConfig {
            augmentation: Some(AugmentationConfig {
                max_augmentations_per_sample: 1,
                cache_path: Some(dir.path().join("aug.bin")),
                ..Default::default()
            }),
            ..config()
        };
        let mut prefetched = BatchGenerator::new(samples, &charset, config).unwrap().prefetch();
        let cache = prefetched.cache().unwrap();
        BatchSource::next_batch(&mut prefetched).unwrap();
        drop(prefetched);
        assert_eq!(Arc::strong_count(&cache), 1);
    }
}
