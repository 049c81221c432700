use tracing::info;

use super::dataset::DatasetConfig;

pub fn log_dataset_info(config: &DatasetConfig, train_size: usize, val_size: usize, seed: u64) {
    let total_size = train_size + val_size;

    info!("Dataset Information:");
    info!("Source: {}", config.src_dir.display());
    info!("Total size: {}", total_size);
    info!("Train split: {} ({:.2}%)", train_size, config.train_ratio * 100.0);
    info!("Validation split: {} ({:.2}%)", val_size, (1.0 - config.train_ratio) * 100.0);
    info!("Sorted: {}", config.sort_dataset);
    info!("Shuffle: {}", config.shuffle);
    info!("Seed: {}", seed);
}

/// Batch arithmetic for one split, mirroring what the trainer will run.
pub fn log_generator_info(name: &str, data_nbr: usize, batch_size: usize) {
    let full_batches = data_nbr / batch_size.max(1);
    info!(
        split = name,
        data_nbr,
        batch_size,
        full_batches,
        last_batch_size = data_nbr % batch_size.max(1),
        "generator"
    );
}
