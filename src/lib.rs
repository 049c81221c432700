pub mod dataloader;
pub mod error;
pub mod layer;
pub mod logging;
pub mod model;
pub mod tensor;
pub mod train;

pub use error::{CrnnError, Result};
