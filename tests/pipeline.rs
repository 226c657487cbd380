use anyhow::Result;
use std::fs;
use tpforge::{
    AcceleratorConfig, Buckets, CompilerConfig, DataType, HandleState, KvCacheSharding,
    LoadOptions, ModelConfig, ModelHandle, ModelWeights, SamplingParams,
};
use tpforge_artifacts::{graph_file_name, MANIFEST_FILE};
use tpforge_ir::GraphKind;

fn quick() -> CompilerConfig {
    CompilerConfig {
        autotune_warmup_runs: 0,
        autotune_runs: 1,
        ..CompilerConfig::default()
    }
}

fn handle_with(
    accel: AcceleratorConfig,
    buckets: &[usize],
    tp: usize,
    dtype: DataType,
) -> Result<ModelHandle> {
    let model = ModelConfig::tiny();
    let weights = ModelWeights::random(&model, 2024);
    let options = LoadOptions::new(Buckets::new(buckets.iter().copied())?, tp, dtype);
    Ok(ModelHandle::from_weights(model, weights, accel, options)?.with_compiler_config(quick()))
}

fn replicated() -> AcceleratorConfig {
    AcceleratorConfig::default().with_kv_cache_sharding(KvCacheSharding::ReplicatedHeads)
}

fn prompt(len: usize) -> Vec<usize> {
    (0..len).map(|i| (i * 37 + 11) % 256).collect()
}

#[test]
fn save_then_load_reproduces_samples() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let params = SamplingParams::new(24, 10).with_seed(99);
    let prompts = vec![prompt(5)];

    let mut first = handle_with(replicated(), &[8, 16, 32], 4, DataType::BF16)?;
    first.compile()?;
    let expected = first.sample(&prompts, &params)?;
    first.save(dir.path())?;
    assert!(dir.path().join(MANIFEST_FILE).exists());
    assert!(dir
        .path()
        .join(graph_file_name(GraphKind::TokenGeneration, 32))
        .exists());

    let mut second = handle_with(replicated(), &[8, 16, 32], 4, DataType::BF16)?;
    second.load(dir.path())?;
    second.compile()?;
    assert_eq!(second.state(), HandleState::Ready { persisted: true });
    let actual = second.sample(&prompts, &params)?;
    assert_eq!(expected.sequences, actual.sequences);
    Ok(())
}

#[test]
fn pretrained_directory_matches_in_memory_weights() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let model = ModelConfig::tiny();
    let weights = ModelWeights::random(&model, 2024);
    weights.save_dir(dir.path(), &model)?;

    let options = LoadOptions::new(Buckets::new([8, 16])?, 2, DataType::F32);
    let mut from_disk =
        ModelHandle::from_pretrained(dir.path(), AcceleratorConfig::default(), options)?
            .with_compiler_config(quick());
    let mut in_memory = handle_with(AcceleratorConfig::default(), &[8, 16], 2, DataType::F32)?;
    from_disk.compile()?;
    in_memory.compile()?;

    let params = SamplingParams::greedy(16);
    let a = from_disk.sample(&[prompt(3)], &params)?;
    let b = in_memory.sample(&[prompt(3)], &params)?;
    assert_eq!(a.sequences, b.sequences);
    Ok(())
}

#[test]
fn missing_model_directory_is_an_error() {
    let options = LoadOptions::new(Buckets::new([8]).unwrap(), 1, DataType::F32);
    let result = ModelHandle::from_pretrained(
        std::path::Path::new("/nonexistent/tpforge-model"),
        AcceleratorConfig::default(),
        options,
    );
    assert!(result.is_err());
}

#[test]
fn sampled_sequences_extend_the_prompt_within_max_length() -> Result<()> {
    let mut handle = handle_with(AcceleratorConfig::default(), &[8, 16], 2, DataType::F32)?;
    handle.compile()?;
    for (len, max_length) in [(1, 2), (3, 8), (7, 16), (16, 16)] {
        let input = prompt(len);
        let params = SamplingParams::new(max_length, 10).with_seed(len as u64);
        let out = handle.sample(&[input.clone()], &params)?;
        let sequence = &out.sequences[0];
        assert!(sequence.starts_with(&input));
        assert!(sequence.len() <= max_length);
        assert_eq!(sequence.len(), max_length);
    }
    Ok(())
}

#[test]
fn eos_token_stops_generation_early() -> Result<()> {
    let mut handle = handle_with(AcceleratorConfig::default(), &[16], 1, DataType::F32)?;
    handle.compile()?;
    let input = prompt(4);
    let greedy = handle.sample(&[input.clone()], &SamplingParams::greedy(16))?;
    let first = greedy.sequences[0][4];

    let params = SamplingParams::greedy(16).with_eos_token(first);
    let stopped = handle.sample(&[input.clone()], &params)?;
    assert_eq!(stopped.sequences[0].len(), 5);
    assert_eq!(stopped.sequences[0][4], first);
    Ok(())
}

#[test]
fn load_rejects_a_different_tp_degree() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut saved = handle_with(replicated(), &[8, 16], 2, DataType::F32)?;
    saved.compile()?;
    saved.save(dir.path())?;

    let mut other = handle_with(replicated(), &[8, 16], 4, DataType::F32)?;
    let err = other.load(dir.path()).unwrap_err();
    assert!(format!("{:#}", err).contains("tp_degree"));
    assert_eq!(other.state(), HandleState::Uninitialized);
    Ok(())
}

#[test]
fn load_rejects_other_buckets_or_precision() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut saved = handle_with(AcceleratorConfig::default(), &[8, 16], 2, DataType::F32)?;
    saved.compile()?;
    saved.save(dir.path())?;

    let mut buckets = handle_with(AcceleratorConfig::default(), &[8, 32], 2, DataType::F32)?;
    assert!(buckets.load(dir.path()).is_err());
    let mut precision = handle_with(AcceleratorConfig::default(), &[8, 16], 2, DataType::F16)?;
    assert!(precision.load(dir.path()).is_err());
    let mut accel =
        handle_with(AcceleratorConfig::default().with_fuse_qkv(true), &[8, 16], 2, DataType::F32)?;
    assert!(accel.load(dir.path()).is_err());
    Ok(())
}

#[test]
fn load_rejects_incomplete_directories() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut saved = handle_with(AcceleratorConfig::default(), &[8, 16], 1, DataType::F32)?;
    saved.compile()?;
    saved.save(dir.path())?;
    fs::remove_file(
        dir.path()
            .join(graph_file_name(GraphKind::ContextEncoding, 16)),
    )?;

    let mut other = handle_with(AcceleratorConfig::default(), &[8, 16], 1, DataType::F32)?;
    assert!(other.load(dir.path()).is_err());
    Ok(())
}

#[test]
fn max_length_beyond_largest_bucket_fails() -> Result<()> {
    let mut handle = handle_with(AcceleratorConfig::default(), &[8, 16], 1, DataType::F32)?;
    handle.compile()?;
    let result = handle.sample(&[prompt(4)], &SamplingParams::new(17, 10));
    assert!(result.is_err());
    Ok(())
}

#[test]
fn core_memory_budget_is_a_fatal_compile_error() -> Result<()> {
    let model = ModelConfig::tiny();
    let weights = ModelWeights::random(&model, 1);
    let options =
        LoadOptions::new(Buckets::new([8, 16])?, 2, DataType::F32).with_core_memory_bytes(1024);
    let mut handle = ModelHandle::from_weights(model, weights, replicated(), options)?;
    let err = handle.compile().unwrap_err();
    assert!(err.to_string().contains("core budget"));
    assert_eq!(handle.state(), HandleState::Uninitialized);
    Ok(())
}

#[test]
fn invalid_head_split_is_rejected_at_compile() -> Result<()> {
    // 2 kv heads cannot be sharded over 4 cores without replication
    let mut handle = handle_with(AcceleratorConfig::default(), &[8], 4, DataType::F32)?;
    assert!(handle.compile().is_err());
    // 8 attention heads do not split over 3 cores
    let mut handle = handle_with(replicated(), &[8], 3, DataType::F32)?;
    assert!(handle.compile().is_err());
    Ok(())
}

#[test]
fn long_prompt_scaled_scenario() -> Result<()> {
    let mut handle = handle_with(
        AcceleratorConfig::long_context(),
        &[8, 16, 32, 64],
        4,
        DataType::BF16,
    )?;
    handle.compile()?;
    let input = prompt(56);
    let out = handle.sample(&[input.clone()], &SamplingParams::new(64, 10).with_seed(5))?;

    let sequence = &out.sequences[0];
    assert!(sequence.starts_with(&input));
    assert!(sequence.len() <= 64);
    assert_eq!(out.metrics.bucket_usage["ctx_b64"], 1);
    assert_eq!(out.metrics.padded_positions, 8);
    Ok(())
}

#[test]
#[ignore = "full-size scenario; runs for a long time"]
fn long_prompt_full_scenario() -> Result<()> {
    let model = ModelConfig {
        vocab_size: 256,
        hidden_size: 64,
        num_hidden_layers: 1,
        num_attention_heads: 32,
        num_key_value_heads: Some(8),
        intermediate_size: 128,
        max_position_embeddings: 65536,
        ..ModelConfig::tiny()
    };
    let weights = ModelWeights::random(&model, 7);
    let buckets = Buckets::new([2048, 4096, 8192, 16384, 32768, 65536])?;
    let options = LoadOptions::new(buckets, 32, DataType::BF16);
    let mut handle =
        ModelHandle::from_weights(model, weights, AcceleratorConfig::long_context(), options)?
            .with_compiler_config(quick());
    handle.compile()?;

    let input = prompt(56_000);
    let out = handle.sample(&[input.clone()], &SamplingParams::new(65536, 10))?;
    let sequence = &out.sequences[0];
    assert!(sequence.starts_with(&input));
    assert!(sequence.len() <= 65536);
    Ok(())
}
