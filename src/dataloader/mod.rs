pub mod augment;
pub mod batch;
pub mod cache;
pub mod charset;
pub mod config;
pub mod dataset;
pub mod generator;
pub mod info;
pub mod par_iter;

pub use batch::Batch;
pub use charset::{Charset, BLANK_INDEX};
pub use config::{AugmentationConfig, GeneratorConfig};
pub use generator::{BatchGenerator, BatchSource, PrefetchedGenerator};
