//! Prompt tokenization.
//!
//! The pipeline itself consumes token ids. [`PromptTokenizer`] is the seam
//! to whatever produces them; [`T5PromptTokenizer`] loads the HuggingFace
//! `tokenizer.json` shipped next to the models.

use std::path::Path;

use tokenizers::Tokenizer;

use crate::Result;

/// End-of-sequence id of the T5 vocabulary.
pub const EOS_TOKEN_ID: i64 = 1;

pub trait PromptTokenizer: Send + Sync {
    /// Encode `prompt` into ids. The sequence always ends in [`EOS_TOKEN_ID`].
    fn encode(&self, prompt: &str) -> Result<Vec<i64>>;
}

pub struct T5PromptTokenizer {
    inner: Tokenizer,
}

impl T5PromptTokenizer {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let inner = Tokenizer::from_file(path.as_ref())?;
        tracing::debug!(path = %path.as_ref().display(), vocab = inner.get_vocab_size(true), "tokenizer loaded");
        Ok(Self { inner })
    }
}

impl PromptTokenizer for T5PromptTokenizer {
    fn encode(&self, prompt: &str) -> Result<Vec<i64>> {
        // Special tokens are added by `with_eos` so exports without a
        // post-processor behave the same.
        let encoding = self.inner.encode(prompt, false)?;
        let ids = encoding.get_ids().iter().map(|&id| id as i64).collect();
        Ok(with_eos(ids))
    }
}

/// Append the end-of-sequence id unless the sequence already ends with it.
pub fn with_eos(mut ids: Vec<i64>) -> Vec<i64> {
    if ids.last() != Some(&EOS_TOKEN_ID) {
        ids.push(EOS_TOKEN_ID);
    }
    ids
}
