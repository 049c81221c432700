use tracing::info;

use super::graph::Predictor;

fn format_memory_mb(bytes: u64) -> String {
    format!("{:.2} MB", bytes as f64 / (1024.0 * 1024.0))
}

/// One row per layer: name with config, parameters, memory and output shape.
pub fn layer_rows(predictor: &Predictor, batch_size: usize) -> Vec<(String, usize, u64, String)> {
    let mut rows = Vec::with_capacity(predictor.layers().len());
    let mut shape = predictor.desc().input_desc(batch_size);
    for layer in predictor.layers() {
        // Shapes were checked when the predictor was built
        let Ok(next) = layer.output_shape(&shape) else { break };
        shape = next;
        let dims = shape
            .to_dims()
            .iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>()
            .join("×");
        rows.push((
            layer.to_string(),
            layer.parameter_count(),
            layer.memory_requirements(&shape),
            dims,
        ));
    }
    rows
}

pub fn log_model_stats(predictor: &Predictor, batch_size: usize) {
    let mut total_params = 0usize;
    let mut total_memory = 0u64;

    info!("Model Statistics");
    info!(
        "Input: {}×{} grayscale, {} classes, batch size {}",
        predictor.desc().image_size.0,
        predictor.desc().image_size.1,
        predictor.desc().num_classes,
        batch_size
    );
    info!("{:<4} {:<72} {:<12} {:<12} {:<18}", "ID", "Layer", "Parameters", "Memory", "Output Shape");

    for (id, (name, params, memory, dims)) in layer_rows(predictor, batch_size).into_iter().enumerate() {
        info!("{:<4} {:<72} {:<12} {:<12} {:<18}", id, name, params, format_memory_mb(memory), dims);
        total_params += params;
        total_memory += memory;
    }

    let (steps, classes) = predictor.output_shape();
    info!(
        total_params,
        memory = %format_memory_mb(total_memory),
        steps,
        classes,
        "Model summary"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::graph::{build_seeded, Mode};

    #[test]
    fn rows_cover_every_layer_and_all_parameters() {
        let predictor = build_seeded((8, 32), 6, 2, Mode::Inference, 0).unwrap().into_inference();
        let rows = layer_rows(&predictor, 2);
        assert_eq!(rows.len(), predictor.layers().len());
        let params: usize = rows.iter().map(|r| r.1).sum();
        assert_eq!(params, predictor.parameter_count());
        assert_eq!(rows.last().unwrap().3, "2×2×6");
    }

    #[test]
    fn memory_is_formatted_in_megabytes() {
        assert_eq!(format_memory_mb(1024 * 1024 * 3), "3.00 MB");
    }
}
