use approx::assert_abs_diff_eq;
use crnn_ctc::{
    dataloader::{Batch, GeneratorConfig},
    model::{
        build_seeded,
        graph::{IMAGES, PREDICTED_LENGTHS, TRUE_LABELS, TRUE_LENGTHS},
        Mode,
    },
    tensor::{Tensor, TensorDesc},
    CrnnError,
};

#[test]
fn generator_lengths_match_model_steps() {
    for width in [32usize, 64, 128] {
        let config = GeneratorConfig {
            image_shape: (width, 32),
            max_label_length: 4,
            ..Default::default()
        }
        .build()
        .unwrap();
        let graph = build_seeded((width, 32), 11, 4, Mode::Inference, 0).unwrap();
        assert_eq!(config.predicted_length(), graph.predictor().output_steps());
    }
}

#[test]
fn inference_graph_takes_only_images() {
    let graph = build_seeded((32, 32), 11, 4, Mode::Inference, 3).unwrap();
    assert_eq!(graph.mode(), Mode::Inference);
    assert_eq!(graph.input_names(), &[IMAGES]);
    assert!(graph.into_training().is_none());

    let mut predictor = build_seeded((32, 32), 11, 4, Mode::Inference, 3).unwrap().into_inference();
    assert_eq!(predictor.output_shape(), (8, 11));

    let pixels: Vec<f32> = (0..32 * 32).map(|i| (i % 7) as f32 / 7.0).collect();
    let images = Tensor::new(TensorDesc::new_tensor4d(1, 1, 32, 32), pixels).unwrap();
    let probs = predictor.predict(&images).unwrap();
    assert_eq!(probs.dims(), vec![1, 8, 11]);
    for step in probs.data.chunks(11) {
        assert_abs_diff_eq!(step.iter().sum::<f32>(), 1.0, epsilon = 1e-4);
    }
}

#[test]
fn training_graph_names_all_four_inputs() {
    let graph = build_seeded((32, 32), 5, 4, Mode::Training, 0).unwrap();
    assert_eq!(graph.mode(), Mode::Training);
    assert_eq!(graph.input_names(), &[TRUE_LABELS, IMAGES, PREDICTED_LENGTHS, TRUE_LENGTHS]);
}

#[test]
fn training_graph_reports_one_loss_per_sample() {
    let mut model = build_seeded((32, 32), 5, 4, Mode::Training, 1)
        .unwrap()
        .into_training()
        .unwrap();
    let images = Tensor::new(TensorDesc::new_tensor4d(2, 1, 32, 32), vec![0.5; 2 * 32 * 32]).unwrap();
    let batch = Batch::new(vec![1, 2, 0, 0, 3, 3, 4, 0], images, vec![8, 8], vec![2, 3], 4, 0).unwrap();

    let losses = model.forward(&batch, crnn_ctc::layer::ForwardMode::Eval).unwrap();
    assert_eq!(losses.dims(), vec![2, 1]);
    assert!(losses.data.iter().all(|l| l.is_finite() && *l > 0.0));
}

#[test]
fn wrong_image_size_is_rejected_at_submission() {
    let mut model = build_seeded((32, 32), 5, 4, Mode::Training, 1)
        .unwrap()
        .into_training()
        .unwrap();
    let images = Tensor::new(TensorDesc::new_tensor4d(1, 1, 32, 64), vec![0.0; 32 * 64]).unwrap();
    let batch = Batch::new(vec![1, 0, 0, 0], images, vec![8], vec![1], 4, 0).unwrap();
    assert!(matches!(model.train_step(&batch), Err(CrnnError::ShapeMismatch { .. })));
}

#[test]
fn images_too_short_for_the_conv_stack_fail_to_build() {
    assert!(build_seeded((32, 8), 5, 4, Mode::Inference, 0).is_err());
}
