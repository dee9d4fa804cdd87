//! Engine round trips through the public API

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rf_flow::{ChunkConfig, FlowConfig, SubnetConfig};
use rf_karaoke::{
    RecordingSink, RunMode, SeparationConfig, SeparationEngine, SeparationError, SongWindow,
    TrainingContext,
};
use tempfile::tempdir;

fn small_config(seed: u64) -> SeparationConfig {
    SeparationConfig {
        flow: FlowConfig {
            num_flows: 3,
            emit_steps: vec![1],
            subnet: SubnetConfig {
                depth: 2,
                width: 8,
                ..SubnetConfig::default()
            },
            ..FlowConfig::default()
        },
        chunking: ChunkConfig {
            chunk_size: 64,
            context_margin: 16,
            parallel: true,
        },
        ..SeparationConfig::default()
    }
    .with_seed(seed)
}

fn song(samples: usize) -> (Vec<f32>, Vec<f32>) {
    let accompaniment: Vec<f32> = (0..samples).map(|i| (i as f32 * 0.02).sin() * 0.4).collect();
    let vocals: Vec<f32> = (0..samples).map(|i| (i as f32 * 0.13).sin() * 0.3).collect();
    let mixed = accompaniment.iter().zip(&vocals).map(|(a, v)| a + v).collect();
    (mixed, accompaniment)
}

#[test]
fn test_same_seed_same_model() {
    let a = SeparationEngine::new(small_config(3)).unwrap();
    let b = SeparationEngine::new(small_config(3)).unwrap();
    let c = SeparationEngine::new(small_config(4)).unwrap();

    assert_eq!(a.parameters(), b.parameters());
    assert_ne!(a.parameters(), c.parameters());
}

#[test]
fn test_weights_roundtrip_through_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("weights.json");

    let source = SeparationEngine::new(small_config(10)).unwrap();
    source.save_weights(&path).unwrap();

    let mut target = SeparationEngine::new(small_config(11)).unwrap();
    target.load_weights(&path).unwrap();
    assert_eq!(source.parameters(), target.parameters());

    let (mixed, _) = song(200);
    let mut rng_a = ChaCha8Rng::seed_from_u64(0);
    let mut rng_b = ChaCha8Rng::seed_from_u64(0);
    assert_eq!(
        source.separate_with_rng(&mixed, &mut rng_a).unwrap(),
        target.separate_with_rng(&mixed, &mut rng_b).unwrap()
    );
}

#[test]
fn test_weights_for_other_layout_are_rejected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("weights.json");
    SeparationEngine::new(small_config(1))
        .unwrap()
        .save_weights(&path)
        .unwrap();

    let mut other = SeparationEngine::new(SeparationConfig::lightweight().with_seed(1)).unwrap();
    let before = other.parameters();
    assert!(matches!(
        other.load_weights(&path),
        Err(SeparationError::Flow(_))
    ));
    assert_eq!(other.parameters(), before);

    assert!(matches!(
        other.load_weights(dir.path().join("missing.json")),
        Err(SeparationError::Io(_))
    ));
}

#[test]
fn test_config_file_roundtrip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("config.json");

    let config = small_config(9).with_debug(true);
    config.to_json_file(&path).unwrap();
    assert_eq!(SeparationConfig::from_json_file(&path).unwrap(), config);

    std::fs::write(&path, "{ not json").unwrap();
    assert!(matches!(
        SeparationConfig::from_json_file(&path),
        Err(SeparationError::Serialization(_))
    ));
}

#[test]
fn test_train_batch_over_song_windows() {
    let engine = SeparationEngine::new(small_config(5).with_debug(true)).unwrap();
    let (mixed, target) = song(256);
    let windows = SongWindow::split_song("demo", &mixed, &target, 64).unwrap();
    assert_eq!(windows.len(), 4);

    let mut ctx = TrainingContext::with_sink(RunMode::Train, RecordingSink::new());
    let first = engine.train_batch(&mut ctx, &windows[..2]).unwrap();
    let second = engine.train_batch(&mut ctx, &windows[2..]).unwrap();

    assert!(first.is_finite() && second.is_finite());
    assert_eq!(ctx.step(), 2);
    assert_eq!(ctx.sink().values("loss_train/total"), vec![first, second]);
    assert!(ctx.sink().last("reverse/all").unwrap() < 1e-4);
    assert!(ctx.sink().last("reverse/coupling_2").is_some());
}

#[test]
fn test_training_rejects_ragged_windows() {
    let engine = SeparationEngine::new(small_config(6)).unwrap();
    let (mixed, target) = song(60);
    let windows = SongWindow::split_song("demo", &mixed, &target, 30).unwrap();

    let mut ctx = TrainingContext::train();
    assert!(matches!(
        engine.train_batch(&mut ctx, &windows),
        Err(SeparationError::ShapeMismatch { .. })
    ));
}

#[test]
fn test_long_signal_separation() {
    let mut engine = SeparationEngine::new(small_config(7)).unwrap();
    let (mixed, _) = song(1_003);

    let out = engine.separate(&mixed).unwrap();
    assert_eq!(out.target.len(), 1_003);
    assert!(out.target.iter().all(|v| v.is_finite() && v.abs() <= 1.0));

    // the internal noise stream moves on between calls
    let again = engine.separate(&mixed).unwrap();
    assert_ne!(out.residual, again.residual);
}
