use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CrnnError>;

#[derive(Error, Debug)]
pub enum CrnnError {
    // Construction time
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid dataset split ratio: train {train}")]
    InvalidSplitRatio { train: f32 },

    // Shapes flowing through layers or submitted with a batch
    #[error("Shape mismatch in {context}: expected {expected}, got {actual}")]
    ShapeMismatch {
        context: String,
        expected: String,
        actual: String,
    },

    #[error("Layer error: {0}")]
    Layer(String),

    // Labels and length bookkeeping
    #[error("Label {label:?} has {length} characters but max_label_length is {max}")]
    LabelTooLong {
        label: String,
        length: usize,
        max: usize,
    },

    #[error("Label {label:?} contains character {character:?} that is not in the charset")]
    UnknownCharacter { label: String, character: char },

    #[error("Sample {sample}: true length {true_length} exceeds predicted length {predicted_length}")]
    LengthInvariant {
        sample: usize,
        true_length: i64,
        predicted_length: i64,
    },

    // IO and data
    #[error("Directory not found: {0}")]
    DirectoryNotFound(PathBuf),

    #[error("No images found in {0}")]
    EmptyDataset(PathBuf),

    #[error("Failed to load image {path}: {source}")]
    ImageLoad {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("Augmentation cache {path} is corrupt: {reason}")]
    CorruptCache { path: PathBuf, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Batch producer stopped unexpectedly")]
    ProducerDisconnected,
}
