//! CLI wiring for the tpforge toolkit.

use crate::eval::{EvaluationReport, EvaluationSuite};
use crate::metrics::MetricsFile;
use crate::pipeline::{CompilerConfig, CompilerPipeline};
use crate::session::ModelHandle;
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::{json, Map};
use std::fs;
use std::path::{Path, PathBuf};
use tpforge_artifacts::MANIFEST_FILE;
use tpforge_config::{AcceleratorConfig, Buckets, DataType, LoadOptions};
use tpforge_ir::{GraphKind, LoweredGraph, ShardLayout};
use tpforge_llm::weights::CONFIG_FILE;
use tpforge_llm::{ModelConfig, ModelWeights, SamplingParams};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "tpforge", about = "Bucketed tensor-parallel compile and sampling toolkit")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct LoadArgs {
    /// Directory holding config.json and *.safetensors.
    #[arg(long)]
    pub model: PathBuf,
    #[arg(long, default_value_t = 1)]
    pub tp_degree: usize,
    /// Comma separated bucket lengths.
    #[arg(long, default_value = "128,256,512")]
    pub buckets: Buckets,
    #[arg(long, default_value = "f32")]
    pub amp: DataType,
    #[arg(long, default_value_t = 1)]
    pub batch_size: usize,
    /// Per-core memory budget in GiB.
    #[arg(long)]
    pub core_memory_gib: Option<u64>,
    /// JSON accelerator config; overrides --long-context.
    #[arg(long)]
    pub accelerator_config: Option<PathBuf>,
    #[arg(long, default_value_t = false)]
    pub long_context: bool,
}

impl LoadArgs {
    fn accelerator(&self) -> Result<AcceleratorConfig> {
        match &self.accelerator_config {
            Some(path) => {
                let blob = fs::read_to_string(path).with_context(|| {
                    format!("failed to read accelerator config {}", path.display())
                })?;
                Ok(AcceleratorConfig::from_json(&blob)?)
            }
            None if self.long_context => Ok(AcceleratorConfig::long_context()),
            None => Ok(AcceleratorConfig::default()),
        }
    }

    fn options(&self) -> Result<LoadOptions> {
        let options = LoadOptions::new(self.buckets.clone(), self.tp_degree, self.amp)
            .with_batch_size(self.batch_size);
        match self.core_memory_gib {
            Some(gib) => {
                let bytes = gib
                    .checked_mul(1 << 30)
                    .with_context(|| format!("--core-memory-gib {} overflows a byte count", gib))?;
                Ok(options.with_core_memory_bytes(bytes))
            }
            None => Ok(options),
        }
    }

    fn handle(&self) -> Result<ModelHandle> {
        ModelHandle::from_pretrained(&self.model, self.accelerator()?, self.options()?)
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum GraphKindArg {
    Ctx,
    Tkg,
}

impl From<GraphKindArg> for GraphKind {
    fn from(value: GraphKindArg) -> GraphKind {
        match value {
            GraphKindArg::Ctx => GraphKind::ContextEncoding,
            GraphKindArg::Tkg => GraphKind::TokenGeneration,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Write a tiny randomly initialized checkpoint.
    InitRandom {
        #[arg(long)]
        out: PathBuf,
        #[arg(long, default_value_t = 0)]
        seed: u64,
    },
    /// Compile the model for the given buckets and save the artifacts.
    Compile {
        #[command(flatten)]
        load: LoadArgs,
        #[arg(long)]
        artifacts: PathBuf,
    },
    /// Sample a continuation of comma separated token ids.
    Sample {
        #[command(flatten)]
        load: LoadArgs,
        /// Load compiled artifacts from here if present, save them otherwise.
        #[arg(long)]
        artifacts: Option<PathBuf>,
        #[arg(long)]
        tokens: String,
        #[arg(long)]
        max_length: usize,
        #[arg(long, default_value_t = 10)]
        top_k: usize,
        #[arg(long, default_value_t = 1.0)]
        temperature: f32,
        #[arg(long, default_value_t = 0)]
        seed: u64,
        #[arg(long)]
        eos_token: Option<usize>,
    },
    /// Print the rewritten graph and its per-core schedule for one bucket.
    EmitGraph {
        #[command(flatten)]
        load: LoadArgs,
        #[arg(long)]
        bucket: usize,
        #[arg(long, value_enum, default_value = "ctx")]
        kind: GraphKindArg,
    },
    /// Sample over a sweep of prompt lengths and emit a JSON report.
    BenchmarkSuite {
        #[command(flatten)]
        load: LoadArgs,
        #[arg(long)]
        output: Option<PathBuf>,
        #[arg(long)]
        baseline: Option<PathBuf>,
        /// Results file to append metrics to.
        #[arg(long)]
        metrics_file: Option<PathBuf>,
    },
}

pub fn run_cli(cli: Cli) -> Result<()> {
    tracing_subscriber::fmt::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .init();

    match cli.command {
        Command::InitRandom { out, seed } => {
            let config = ModelConfig::tiny();
            let weights = ModelWeights::random(&config, seed);
            weights.save_dir(&out, &config)?;
            info!(
                dir = %out.display(),
                parameters = weights.parameter_count(),
                "random checkpoint written"
            );
        }
        Command::Compile { load, artifacts } => {
            let mut handle = load.handle()?;
            handle.compile()?;
            handle.save(&artifacts)?;
            print_memory(&handle);
        }
        Command::Sample {
            load,
            artifacts,
            tokens,
            max_length,
            top_k,
            temperature,
            seed,
            eos_token,
        } => {
            let prompt = parse_tokens(&tokens)?;
            let mut handle = load.handle()?;
            let reuse = artifacts.as_deref().filter(|dir| dir.join(MANIFEST_FILE).exists());
            if let Some(dir) = reuse {
                handle.load(dir)?;
            }
            handle.compile()?;
            if let (Some(dir), None) = (&artifacts, reuse) {
                handle.save(dir)?;
            }

            let mut params = SamplingParams::new(max_length, top_k)
                .with_temperature(temperature)
                .with_seed(seed);
            if let Some(token) = eos_token {
                params = params.with_eos_token(token);
            }
            let prompts = vec![prompt; handle.options().batch_size];
            let generation = handle.sample(&prompts, &params)?;
            for sequence in &generation.sequences {
                println!("{}", join_tokens(sequence));
            }
            println!("{}", serde_json::to_string_pretty(&generation.metrics)?);
        }
        Command::EmitGraph { load, bucket, kind } => {
            let model = ModelConfig::from_file(&load.model.join(CONFIG_FILE))?;
            let dims = model.dims()?;
            let accelerator = load.accelerator()?;
            let options = load.options()?;
            let layout =
                ShardLayout::new(&dims, &accelerator, options.tp_degree, &options.buckets)?;
            let compiler = CompilerConfig {
                dtype: options.precision,
                ..CompilerConfig::default()
            };
            let pipeline = CompilerPipeline::new(&accelerator, compiler);
            let graph = pipeline.build_graph(&dims, kind.into(), bucket)?;
            println!("{}", graph.to_text());
            print_schedule(&LoweredGraph::lower(
                &graph,
                &layout,
                dims.hidden_size,
                options.precision,
            ));
        }
        Command::BenchmarkSuite {
            load,
            output,
            baseline,
            metrics_file,
        } => {
            let mut handle = load.handle()?;
            let suite = EvaluationSuite::bucket_sweep(handle.options().buckets.largest());
            let report = suite.run(&mut handle)?;

            println!(
                "tp_degree={}, amp={}, cases={}",
                report.tp_degree,
                report.precision,
                report.cases.len()
            );
            for case in &report.cases {
                println!(
                    "- {}: prompt={} generated={} latency_ms={:.3} tokens_per_sec={:.2} padded={}",
                    case.case,
                    case.prompt_len,
                    case.tokens_generated,
                    case.latency_ms,
                    case.tokens_per_sec,
                    case.padded_positions
                );
            }

            if let Some(path) = baseline {
                if path.exists() {
                    let baseline_report = read_report(&path)?;
                    for (name, delta) in report.diff(&baseline_report) {
                        println!(
                            "delta {}: latency_ms={:+.3} tokens_per_sec={:+.2}",
                            name, delta.latency_ms_delta, delta.tokens_per_sec_delta
                        );
                    }
                } else {
                    info!(path = %path.display(), "baseline report not found; skipping diff");
                }
            }

            if let Some(path) = output {
                fs::write(&path, serde_json::to_string_pretty(&report)?)?;
            }

            if let Some(path) = metrics_file {
                let file = MetricsFile::new(path);
                let mut parameters = Map::new();
                parameters.insert("tp_degree".into(), json!(report.tp_degree));
                parameters.insert("amp".into(), json!(report.precision));
                parameters.insert("buckets".into(), json!(handle.options().buckets));
                parameters.insert("accelerator".into(), json!(handle.accelerator()));
                file.store_parameters(parameters)?;
                file.store_metrics(&report.metrics())?;
            }
        }
    }
    Ok(())
}

fn read_report(path: &Path) -> Result<EvaluationReport> {
    let blob = fs::read_to_string(path)?;
    serde_json::from_str(&blob)
        .with_context(|| format!("baseline {} is not an evaluation report", path.display()))
}

fn print_memory(handle: &ModelHandle) {
    for core in handle.core_memory() {
        println!(
            "core {}: {} / {} bytes",
            core.core, core.allocated_bytes, core.budget_bytes
        );
    }
}

fn print_schedule(graph: &LoweredGraph) {
    println!("// per-core schedule, tp_degree={}", graph.tp_degree);
    for op in &graph.operations {
        let shapes = op
            .matmuls
            .iter()
            .map(|p| format!("{}x{}x{}", p.m, p.n, p.k))
            .collect::<Vec<_>>()
            .join(" ");
        println!("// {:<24} {:<28} {}", op.name, op.schedule, shapes);
    }
}

pub fn parse_tokens(text: &str) -> Result<Vec<usize>> {
    text.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<usize>()
                .with_context(|| format!("invalid token id '{}'", part))
        })
        .collect()
}

fn join_tokens(tokens: &[usize]) -> String {
    tokens
        .iter()
        .map(usize::to_string)
        .collect::<Vec<_>>()
        .join(",")
}
