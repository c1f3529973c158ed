//! Memory-constrained text-to-audio generation in Rust.
//!
//! Runs a three-stage diffusion model (text conditioner, diffusion
//! transformer, autoencoder decoder) exported as separate graphs, keeping
//! at most one of them resident at any time so generation fits on phones
//! and small boards.
//!
//! ## Architecture
//!
//! ```text
//! prompt → tokenizer → Encoder ──┐ cross-attention + global conditioning
//!                                 ↓
//!                      Diffuser (PingPong sampler, N steps)
//!                                 ↓ latent
//!                      Decoder → planar stereo → 32-bit float WAV
//! ```
//!
//! Each stage is loaded, run and unloaded before the next one loads; only
//! host-side buffers cross stage boundaries.
//!
//! ## Modules
//!
//! - [`pipeline`]: the orchestrator, progress and cancellation
//! - [`stage`]: per-stage load/unload lifecycle and the three stages
//! - [`slots`]: finding the right tensor for each role in an exported graph
//! - [`scheduler`]: noise schedule and the PingPong sampler
//! - [`runtime`]: graph runtime seam and the ONNX Runtime backend
//! - [`audio`]: stereo buffers and WAV output
//! - [`tokenizer`], [`config`], [`accelerator`], [`manager`]

pub mod accelerator;
pub mod audio;
pub mod config;
pub mod manager;
pub mod pipeline;
pub mod runtime;
pub mod scheduler;
pub mod slots;
pub mod stage;
pub mod tokenizer;

mod error;

pub use error::{Error, ErrorKind, Result};
