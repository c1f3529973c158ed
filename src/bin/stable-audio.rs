//! Stable Audio CLI: on-device text-to-audio generation.
//!
//! Runs the three exported stage models from a local directory, one model
//! resident at a time.
//!
//! # Output
//!
//! `generate` writes a 32-bit float stereo WAV to --output and prints a
//! one-line JSON summary to stdout on success:
//!
//! ```json
//! {"path":"/tmp/pad.wav","duration_s":5.0,"samples":220500,"sample_rate":44100,"channels":2}
//! ```
//!
//! Exit code 0 on success, non-zero on error.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use stable_audio_rs::config::PipelineConfig;
use stable_audio_rs::pipeline::{AudioPipeline, GenerationRequest};
use stable_audio_rs::runtime::onnx::OnnxRuntime;
use stable_audio_rs::tokenizer::{PromptTokenizer, T5PromptTokenizer};

#[derive(Parser, Debug)]
#[command(
    name = "stable-audio",
    about = "Memory-constrained text-to-audio generation",
    long_about = "Generate short stereo audio clips from a text prompt using an\n\
                  encoder, diffusion and decoder model exported to ONNX.\n\
                  Only one model is resident at a time."
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate audio from a prompt and write it as WAV.
    Generate(GenerateArgs),
    /// Load each stage model and print its declared tensors.
    Inspect(ModelArgs),
    /// Compile and cache the GPU path of the diffuser and decoder.
    PrepareAccelerator(ModelArgs),
}

#[derive(Args, Debug)]
struct ModelArgs {
    /// Directory holding the stage models and tokenizer.json.
    #[arg(long, short = 'm')]
    model_dir: PathBuf,

    /// JSON pipeline configuration. Defaults apply to omitted fields.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Inference threads per stage (the decoder always uses one).
    #[arg(long, short = 't')]
    threads: Option<usize>,

    /// Try the GPU delegate for the diffuser and decoder.
    #[arg(long)]
    gpu: bool,
}

#[derive(Args, Debug)]
struct GenerateArgs {
    #[command(flatten)]
    model: ModelArgs,

    /// Text description of the sound.
    #[arg(long, short = 'p')]
    prompt: String,

    /// Duration in seconds. Clamped to the configured range (default 0.5–11).
    #[arg(long, short = 'd', default_value_t = 5.0)]
    duration: f32,

    /// Sampler steps. Clamped to the configured range (default 1–100).
    #[arg(long, short = 'n', default_value_t = 8)]
    steps: usize,

    /// Random seed. Omit for a time-derived seed.
    #[arg(long, short = 's')]
    seed: Option<u64>,

    /// Output WAV path.
    #[arg(long, short = 'o')]
    output: PathBuf,
}

impl ModelArgs {
    fn pipeline(&self) -> anyhow::Result<AudioPipeline<OnnxRuntime>> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::from_json_file(path)?,
            None => PipelineConfig::default(),
        };
        if let Some(threads) = self.threads {
            config.num_threads = threads;
        }
        config.use_accelerator |= self.gpu;
        AudioPipeline::new(&self.model_dir, config, OnnxRuntime::new())
            .map_err(|e| anyhow::anyhow!("failed to set up pipeline: {e}"))
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    match Cli::parse().command {
        Command::Generate(args) => generate(args),
        Command::Inspect(args) => {
            let report = args.pipeline()?.inspect()?;
            print!("{report}");
            Ok(())
        }
        Command::PrepareAccelerator(mut args) => {
            args.gpu = true;
            let pipeline = args.pipeline()?;
            if !pipeline.accelerator_available() {
                anyhow::bail!("no GPU delegate in this build; enable the cuda, nnapi or coreml feature");
            }
            pipeline.prepare_accelerator()?;
            tracing::info!("accelerator ready");
            Ok(())
        }
    }
}

fn generate(args: GenerateArgs) -> anyhow::Result<()> {
    let pipeline = args.model.pipeline()?;
    let tokenizer = T5PromptTokenizer::from_file(&pipeline.paths().tokenizer)?;
    let token_ids = tokenizer.encode(&args.prompt)?;

    let seed = args.seed.unwrap_or_else(time_seed);
    let request = GenerationRequest {
        token_ids,
        duration_s: args.duration,
        steps: args.steps,
        seed,
    };

    tracing::info!(seed, "generating {:.1}s of audio", pipeline.config().clamp_duration(args.duration));
    let written = pipeline
        .generate_to_file(&request, &args.output)
        .map_err(|e| anyhow::anyhow!("generation failed: {e}"))?;

    let summary = serde_json::json!({
        "path": written.path,
        "duration_s": written.duration_s,
        "samples": written.frames,
        "sample_rate": written.sample_rate,
        "channels": written.channels,
    });
    println!("{summary}");
    Ok(())
}

fn time_seed() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}
