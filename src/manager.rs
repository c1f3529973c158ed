//! Generation manager: owns a pipeline on a worker thread and queues requests.
//!
//! Callers submit requests from async code; the worker runs them one at a
//! time on a blocking thread. The [`GenerationControl`] handle returned by
//! [`GenerationManager::control`] lets a UI poll progress and cancel the
//! request currently running.
//!
//! # Example
//!
//! ```no_run
//! use stable_audio_rs::manager::{GenerationManager, ManagerConfig, PromptRequest};
//! use stable_audio_rs::runtime::onnx::OnnxRuntime;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = ManagerConfig::new("models/stable-audio-open-small");
//!     let manager = GenerationManager::start(config, OnnxRuntime::new()).await.unwrap();
//!     let audio = manager
//!         .generate_prompt(PromptRequest::new("warm analog synth pad"))
//!         .await
//!         .unwrap();
//! }
//! ```

use std::path::PathBuf;

use tokio::sync::{mpsc, oneshot};

use crate::config::PipelineConfig;
use crate::pipeline::{AudioPipeline, GeneratedAudio, GenerationControl, GenerationRequest};
use crate::runtime::GraphRuntime;
use crate::tokenizer::{PromptTokenizer, T5PromptTokenizer};
use crate::{Error, Result};

/// Configuration for the generation manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Directory holding the three stage models and `tokenizer.json`.
    pub model_dir: PathBuf,

    pub pipeline: PipelineConfig,

    /// Maximum number of requests waiting behind the running one.
    ///
    /// Default: 16.
    pub queue_depth: usize,

    /// Load the prompt tokenizer so [`GenerationManager::generate_prompt`]
    /// works. Without it only pre-tokenized requests are accepted.
    pub load_tokenizer: bool,
}

impl ManagerConfig {
    pub fn new(model_dir: impl Into<PathBuf>) -> Self {
        Self {
            model_dir: model_dir.into(),
            pipeline: PipelineConfig::default(),
            queue_depth: 16,
            load_tokenizer: true,
        }
    }
}

/// A text prompt with generation parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptRequest {
    pub prompt: String,
    pub duration_s: f32,
    pub steps: usize,
    pub seed: u64,
}

impl PromptRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        let defaults = GenerationRequest::new(Vec::new());
        Self {
            prompt: prompt.into(),
            duration_s: defaults.duration_s,
            steps: defaults.steps,
            seed: defaults.seed,
        }
    }
}

enum Job {
    Tokens(GenerationRequest),
    Prompt(PromptRequest),
}

/// A submitted generation request.
struct PendingRequest {
    job: Job,
    reply: oneshot::Sender<Result<GeneratedAudio>>,
}

/// Handle for submitting generation requests to a running manager.
#[derive(Clone)]
pub struct GenerationManager {
    tx: mpsc::Sender<PendingRequest>,
    control: GenerationControl,
}

impl GenerationManager {
    /// Build the pipeline and start the worker.
    ///
    /// Fails when a model file or the tokenizer is missing; no model is
    /// loaded until the first request.
    pub async fn start<R>(config: ManagerConfig, runtime: R) -> Result<Self>
    where
        R: GraphRuntime + 'static,
    {
        let queue_depth = config.queue_depth.max(1);
        let (pipeline, tokenizer) = tokio::task::spawn_blocking(move || -> Result<_> {
            let pipeline = AudioPipeline::new(&config.model_dir, config.pipeline, runtime)?;
            let tokenizer: Option<Box<dyn PromptTokenizer>> = if config.load_tokenizer {
                Some(Box::new(T5PromptTokenizer::from_file(&pipeline.paths().tokenizer)?))
            } else {
                None
            };
            Ok((pipeline, tokenizer))
        })
        .await
        .map_err(|join_error| Error::Manager(format!("pipeline setup task panicked: {join_error}")))??;

        let control = pipeline.control();
        let (tx, rx) = mpsc::channel::<PendingRequest>(queue_depth);

        tokio::task::spawn_blocking(move || run_manager(pipeline, tokenizer, rx));

        Ok(Self { tx, control })
    }

    /// Progress and cancellation of the request currently running.
    pub fn control(&self) -> GenerationControl {
        self.control.clone()
    }

    /// Submit a pre-tokenized request and wait for the result.
    pub async fn generate(&self, request: GenerationRequest) -> Result<GeneratedAudio> {
        self.submit(Job::Tokens(request)).await
    }

    /// Tokenize `request.prompt` on the worker, then generate.
    pub async fn generate_prompt(&self, request: PromptRequest) -> Result<GeneratedAudio> {
        self.submit(Job::Prompt(request)).await
    }

    async fn submit(&self, job: Job) -> Result<GeneratedAudio> {
        let (reply_tx, reply_rx) = oneshot::channel::<Result<GeneratedAudio>>();
        self.tx
            .send(PendingRequest { job, reply: reply_tx })
            .await
            .map_err(|_| Error::Manager("manager has shut down".into()))?;

        reply_rx
            .await
            .map_err(|_| Error::Manager("manager dropped reply channel".into()))?
    }
}

/// The manager loop; runs on a dedicated blocking thread until every handle
/// is dropped.
fn run_manager<R: GraphRuntime>(
    pipeline: AudioPipeline<R>,
    tokenizer: Option<Box<dyn PromptTokenizer>>,
    mut rx: mpsc::Receiver<PendingRequest>,
) {
    while let Some(request) = rx.blocking_recv() {
        let result = match request.job {
            Job::Tokens(tokens) => pipeline.generate(&tokens),
            Job::Prompt(prompt) => tokenize(tokenizer.as_deref(), &prompt)
                .and_then(|tokens| pipeline.generate(&tokens)),
        };
        // Caller may have given up waiting.
        let _ = request.reply.send(result);
    }
    tracing::info!("generation manager shut down");
}

fn tokenize(
    tokenizer: Option<&dyn PromptTokenizer>,
    request: &PromptRequest,
) -> Result<GenerationRequest> {
    let tokenizer =
        tokenizer.ok_or_else(|| Error::Manager("manager started without a tokenizer".into()))?;
    let token_ids = tokenizer.encode(&request.prompt)?;
    tracing::debug!(tokens = token_ids.len(), "prompt tokenized");
    Ok(GenerationRequest {
        token_ids,
        duration_s: request.duration_s,
        steps: request.steps,
        seed: request.seed,
    })
}
