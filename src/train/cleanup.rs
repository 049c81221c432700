use std::{
    io::{BufRead, Write},
    path::Path,
};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// What to do with the augmentation cache once training is over.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum CleanupPolicy {
    #[default]
    Ask,
    Yes,
    No,
}

pub fn size_in_mb(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}

/// Reports the cache size and removes it when the policy (or the answer to
/// the prompt) allows. Returns whether the file was removed; failures are
/// logged, never returned.
pub fn clean_cache<R: BufRead, W: Write>(path: &Path, policy: CleanupPolicy, mut input: R, mut output: W) -> bool {
    let size = match std::fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "augmentation cache not readable");
            return false;
        }
    };
    info!(path = %path.display(), "augmentation cache takes {:.2} MB", size_in_mb(size));

    let remove = match policy {
        CleanupPolicy::Yes => true,
        CleanupPolicy::No => false,
        CleanupPolicy::Ask => {
            let _ = write!(output, "Delete augmentation cache {} ({:.2} MB)? [y/n]: ", path.display(), size_in_mb(size));
            let _ = output.flush();
            let mut answer = String::new();
            match input.read_line(&mut answer) {
                Ok(_) => matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"),
                Err(e) => {
                    warn!(error = %e, "could not read answer, keeping cache");
                    false
                }
            }
        }
    };
    if !remove {
        return false;
    }

    match std::fs::remove_file(path) {
        Ok(()) => {
            info!(path = %path.display(), "removed augmentation cache");
            true
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to remove augmentation cache");
            false
        }
    }
}
