use std::{
    fs::File,
    io::{BufReader, BufWriter},
    path::{Path, PathBuf},
};

use rand::{rngs::StdRng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    dataloader::Charset,
    error::{CrnnError, Result},
    layer::Param,
    model::{ModelDesc, Predictor},
};

pub const FINAL_MODEL_NAME: &str = "crnn_model.json";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LayerWeights {
    pub name: String,
    pub params: Vec<Param>,
    // BatchNorm running statistics
    pub state: Vec<Param>,
}

/// Every layer's parameters and statistics, in layer order.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WeightsSnapshot {
    pub layers: Vec<LayerWeights>,
}

impl WeightsSnapshot {
    pub fn capture(predictor: &Predictor) -> Self {
        let layers = predictor
            .layers()
            .iter()
            .map(|layer| LayerWeights {
                name: layer.name(),
                params: layer.parameters().into_iter().cloned().collect(),
                state: layer.state().into_iter().cloned().collect(),
            })
            .collect();
        Self { layers }
    }

    pub fn restore(&self, predictor: &mut Predictor) -> Result<()> {
        if self.layers.len() != predictor.layers().len() {
            return Err(CrnnError::ShapeMismatch {
                context: "weights snapshot".into(),
                expected: format!("{} layers", predictor.layers().len()),
                actual: format!("{} layers", self.layers.len()),
            });
        }
        for (saved, layer) in self.layers.iter().zip(predictor.layers_mut()) {
            if saved.name != layer.name() {
                return Err(CrnnError::ShapeMismatch {
                    context: "weights snapshot layer".into(),
                    expected: layer.name(),
                    actual: saved.name.clone(),
                });
            }
            restore_group(&saved.params, layer.parameters_mut(), &saved.name)?;
            restore_group(&saved.state, layer.state_mut(), &saved.name)?;
        }
        Ok(())
    }
}

fn restore_group(saved: &[Param], target: Vec<&mut Param>, layer: &str) -> Result<()> {
    if saved.len() != target.len() {
        return Err(CrnnError::ShapeMismatch {
            context: format!("{} parameter count", layer),
            expected: target.len().to_string(),
            actual: saved.len().to_string(),
        });
    }
    for (src, dst) in saved.iter().zip(target) {
        dst.load_from(src)?;
    }
    Ok(())
}

/// Everything needed to rebuild the predictor for inference.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub model: ModelDesc,
    pub max_label_length: usize,
    pub charset: Charset,
    pub weights: WeightsSnapshot,
}

impl ModelArtifact {
    pub fn new(predictor: &Predictor, max_label_length: usize, charset: Charset) -> Self {
        Self {
            model: predictor.desc().clone(),
            max_label_length,
            charset,
            weights: WeightsSnapshot::capture(predictor),
        }
    }

    pub fn into_predictor(self) -> Result<Predictor> {
        // Initial values are overwritten by the snapshot
        let mut predictor = Predictor::new(self.model, &mut StdRng::seed_from_u64(0))?;
        self.weights.restore(&mut predictor)?;
        Ok(predictor)
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer(writer, value)?;
    Ok(())
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let reader = BufReader::new(File::open(path)?);
    Ok(serde_json::from_reader(reader)?)
}

pub fn checkpoint_name(epoch: usize, loss: f32, val_loss: f32) -> String {
    format!("ep{:03}-loss{:.3}-val_loss{:.3}.json", epoch, loss, val_loss)
}

pub fn save_checkpoint(dir: &Path, epoch: usize, loss: f32, val_loss: f32, predictor: &Predictor) -> Result<PathBuf> {
    let path = dir.join(checkpoint_name(epoch, loss, val_loss));
    write_json(&path, &WeightsSnapshot::capture(predictor))?;
    info!(path = %path.display(), "saved checkpoint");
    Ok(path)
}

pub fn load_checkpoint(path: &Path) -> Result<WeightsSnapshot> {
    read_json(path)
}

pub fn save_model(path: &Path, artifact: &ModelArtifact) -> Result<()> {
    write_json(path, artifact)?;
    info!(path = %path.display(), "saved model");
    Ok(())
}

pub fn load_model(path: &Path) -> Result<ModelArtifact> {
    read_json(path)
}
