pub mod checkpoint;
pub mod cleanup;
pub mod config;
pub mod optimizer;
pub mod schedule;
pub mod trainer;

pub use cleanup::CleanupPolicy;
pub use config::TrainConfig;
pub use trainer::{train, Trainer};
