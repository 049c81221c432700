use crnn_ctc::train::{
    checkpoint::FINAL_MODEL_NAME, config::AUGMENTATION_CACHE_NAME, trainer::load_predictor, train, CleanupPolicy,
    TrainConfig,
};
use image::{GrayImage, Luma};

#[test]
fn short_run_writes_model_and_removes_cache() {
    let data = tempfile::tempdir().unwrap();
    let save = tempfile::tempdir().unwrap();
    for (i, label) in ["AB", "BA", "A", "B", "AAB", "BB", "AB", "BAA", "A", "BA"].iter().enumerate() {
        GrayImage::from_fn(24, 40, |x, y| Luma([((x * 17 + y * 3 + i as u32 * 29) % 256) as u8]))
            .save(data.path().join(format!("{}_{:04}.png", label, i)))
            .unwrap();
    }

    let mut config = TrainConfig {
        save_dir: save.path().to_path_buf(),
        image_size: (16, 32),
        batch_size: 2,
        max_label_length: 3,
        epochs: 1,
        steps_per_epoch: 2,
        cache_policy: CleanupPolicy::Yes,
        seed: Some(4),
        ..Default::default()
    };
    config.dataset.src_dir = data.path().to_path_buf();
    config.dataset.train_ratio = 0.8;
    config.dataset.shuffle_seed = Some(4);

    let report = train(config).unwrap();
    assert_eq!(report.history.len(), 1);
    assert!(report.history[0].loss.is_finite());
    assert!(report.history[0].checkpoint.as_ref().is_some_and(|p| p.exists()));
    assert_eq!(report.model_path, save.path().join(FINAL_MODEL_NAME));
    assert!(report.cache_removed);
    assert!(!save.path().join(AUGMENTATION_CACHE_NAME).exists());

    let (predictor, charset) = load_predictor(&report.model_path).unwrap();
    assert_eq!(charset.as_string(), "AB");
    assert_eq!(predictor.output_shape(), (4, 3));
}
