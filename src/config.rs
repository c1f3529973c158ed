//! Pipeline configuration.
//!
//! Defaults match the int8 on-device export of Stable Audio Open Small:
//! 44.1 kHz stereo output, up to 11 s of audio, a 1.0 maximum sigma.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Names of the files expected inside the model directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelFiles {
    #[serde(default = "default_encoder_file")]
    pub encoder: String,
    #[serde(default = "default_diffuser_file")]
    pub diffuser: String,
    #[serde(default = "default_decoder_file")]
    pub decoder: String,
    #[serde(default = "default_tokenizer_file")]
    pub tokenizer: String,
}

impl Default for ModelFiles {
    fn default() -> Self {
        Self {
            encoder: default_encoder_file(),
            diffuser: default_diffuser_file(),
            decoder: default_decoder_file(),
            tokenizer: default_tokenizer_file(),
        }
    }
}

/// Top-level configuration for [`AudioPipeline`](crate::pipeline::AudioPipeline).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub files: ModelFiles,

    /// Intra-op threads for the encoder and diffuser. The decoder always runs
    /// single-threaded.
    #[serde(default = "default_num_threads")]
    pub num_threads: usize,

    /// Try the GPU delegate for the diffuser and decoder.
    #[serde(default)]
    pub use_accelerator: bool,

    /// First value of the noise schedule, in (0, 1].
    #[serde(default = "default_sigma_max")]
    pub sigma_max: f32,

    /// Output sample rate of the decoder.
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    #[serde(default = "default_min_duration_s")]
    pub min_duration_s: f32,
    #[serde(default = "default_max_duration_s")]
    pub max_duration_s: f32,

    #[serde(default = "default_min_steps")]
    pub min_steps: usize,
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,

    /// Added to `seed + step` when seeding the sampler's per-step noise.
    #[serde(default = "default_noise_seed_offset")]
    pub noise_seed_offset: u64,

    #[serde(default)]
    pub accelerator: AcceleratorConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            files: ModelFiles::default(),
            num_threads: default_num_threads(),
            use_accelerator: false,
            sigma_max: default_sigma_max(),
            sample_rate: default_sample_rate(),
            min_duration_s: default_min_duration_s(),
            max_duration_s: default_max_duration_s(),
            min_steps: default_min_steps(),
            max_steps: default_max_steps(),
            noise_seed_offset: default_noise_seed_offset(),
            accelerator: AcceleratorConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Load a JSON config file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.sigma_max > 0.0 && self.sigma_max <= 1.0) {
            return Err(Error::Config(format!(
                "sigma_max must be in (0, 1], got {}",
                self.sigma_max
            )));
        }
        if self.sample_rate == 0 {
            return Err(Error::Config("sample_rate must be non-zero".into()));
        }
        if !(self.min_duration_s > 0.0 && self.min_duration_s <= self.max_duration_s) {
            return Err(Error::Config(format!(
                "invalid duration range [{}, {}]",
                self.min_duration_s, self.max_duration_s
            )));
        }
        if self.min_steps == 0 || self.min_steps > self.max_steps {
            return Err(Error::Config(format!(
                "invalid step range [{}, {}]",
                self.min_steps, self.max_steps
            )));
        }
        Ok(())
    }

    /// Thread count with `0` coerced to the default.
    pub fn threads(&self) -> usize {
        if self.num_threads == 0 {
            default_num_threads()
        } else {
            self.num_threads
        }
    }

    pub fn clamp_duration(&self, duration_s: f32) -> f32 {
        if duration_s.is_nan() {
            return self.min_duration_s;
        }
        duration_s.clamp(self.min_duration_s, self.max_duration_s)
    }

    pub fn clamp_steps(&self, steps: usize) -> usize {
        steps.clamp(self.min_steps, self.max_steps)
    }
}

/// Accelerator shader cache settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceleratorConfig {
    /// Cache directory, relative to the model directory.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: String,
    /// Marker written once compiled shaders are cached.
    #[serde(default = "default_ready_marker")]
    pub ready_marker: String,
    /// Token identifying this model family in the shader cache.
    #[serde(default = "default_model_token")]
    pub model_token: String,
}

impl Default for AcceleratorConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            ready_marker: default_ready_marker(),
            model_token: default_model_token(),
        }
    }
}

/// Absolute paths of every file the pipeline consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelPaths {
    pub directory: PathBuf,
    pub encoder: PathBuf,
    pub diffuser: PathBuf,
    pub decoder: PathBuf,
    pub tokenizer: PathBuf,
}

impl ModelPaths {
    pub fn resolve(directory: impl AsRef<Path>, files: &ModelFiles) -> Self {
        let directory = directory.as_ref().to_path_buf();
        Self {
            encoder: directory.join(&files.encoder),
            diffuser: directory.join(&files.diffuser),
            decoder: directory.join(&files.decoder),
            tokenizer: directory.join(&files.tokenizer),
            directory,
        }
    }

    /// Check that every file exists without opening any of them.
    pub fn verify(&self) -> Result<()> {
        let required = [
            ("encoder model", &self.encoder),
            ("diffusion model", &self.diffuser),
            ("decoder model", &self.decoder),
            ("tokenizer model", &self.tokenizer),
        ];
        for (what, path) in required {
            if !path.is_file() {
                return Err(Error::ResourceMissing {
                    what,
                    path: path.clone(),
                });
            }
        }
        Ok(())
    }
}

fn default_encoder_file() -> String {
    "conditioners_int8.onnx".to_string()
}

fn default_diffuser_file() -> String {
    "dit_model_int8.onnx".to_string()
}

fn default_decoder_file() -> String {
    "autoencoder_model_int8.onnx".to_string()
}

fn default_tokenizer_file() -> String {
    "tokenizer.json".to_string()
}

fn default_num_threads() -> usize {
    2
}

fn default_sigma_max() -> f32 {
    1.0
}

fn default_sample_rate() -> u32 {
    44_100
}

fn default_min_duration_s() -> f32 {
    0.5
}

fn default_max_duration_s() -> f32 {
    11.0
}

fn default_min_steps() -> usize {
    1
}

fn default_max_steps() -> usize {
    100
}

fn default_noise_seed_offset() -> u64 {
    4564
}

fn default_cache_dir() -> String {
    "gpu_cache".to_string()
}

fn default_ready_marker() -> String {
    ".shaders_ready".to_string()
}

fn default_model_token() -> String {
    "stable_audio_v1".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.sample_rate, 44_100);
        assert_eq!(cfg.sigma_max, 1.0);
        assert_eq!(cfg.threads(), 2);
        assert_eq!(cfg.noise_seed_offset, 4564);
        assert!(!cfg.use_accelerator);
        cfg.validate().unwrap();
    }

    #[test]
    fn test_clamping() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.clamp_duration(0.2), 0.5);
        assert_eq!(cfg.clamp_duration(30.0), 11.0);
        assert_eq!(cfg.clamp_duration(2.0), 2.0);
        assert_eq!(cfg.clamp_duration(f32::NAN), 0.5);
        assert_eq!(cfg.clamp_steps(0), 1);
        assert_eq!(cfg.clamp_steps(500), 100);
        assert_eq!(cfg.clamp_steps(8), 8);
    }

    #[test]
    fn test_zero_threads_coerced() {
        let cfg = PipelineConfig {
            num_threads: 0,
            ..Default::default()
        };
        assert_eq!(cfg.threads(), 2);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let cfg: PipelineConfig =
            serde_json::from_str(r#"{"num_threads": 4, "files": {"encoder": "t5.onnx"}}"#).unwrap();
        assert_eq!(cfg.num_threads, 4);
        assert_eq!(cfg.files.encoder, "t5.onnx");
        assert_eq!(cfg.files.decoder, "autoencoder_model_int8.onnx");
        assert_eq!(cfg.accelerator.ready_marker, ".shaders_ready");
    }

    #[test]
    fn test_invalid_sigma_rejected() {
        for sigma_max in [0.0, -0.5, 1.5] {
            let cfg = PipelineConfig {
                sigma_max,
                ..Default::default()
            };
            assert!(cfg.validate().is_err(), "sigma_max={sigma_max}");
        }
    }

    #[test]
    fn test_verify_reports_first_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let files = ModelFiles::default();
        let paths = ModelPaths::resolve(dir.path(), &files);
        std::fs::write(&paths.encoder, b"x").unwrap();

        match paths.verify() {
            Err(Error::ResourceMissing { what, path }) => {
                assert_eq!(what, "diffusion model");
                assert_eq!(path, paths.diffuser);
            }
            other => panic!("expected ResourceMissing, got {other:?}"),
        }
    }
}
