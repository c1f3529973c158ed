//! Accelerator shader cache.
//!
//! The GPU delegate serializes compiled shaders into a directory next to the
//! models. Once a full compile has succeeded a marker file is written so later
//! runs can tell that the accelerator path will start quickly.

use std::path::{Path, PathBuf};

use crate::Result;
use crate::config::AcceleratorConfig;

#[derive(Debug, Clone)]
pub struct ShaderCache {
    dir: PathBuf,
    marker: PathBuf,
    model_token: String,
}

impl ShaderCache {
    pub fn new(model_dir: impl AsRef<Path>, config: &AcceleratorConfig) -> Self {
        let dir = model_dir.as_ref().join(&config.cache_dir);
        let marker = dir.join(&config.ready_marker);
        Self {
            dir,
            marker,
            model_token: config.model_token.clone(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn model_token(&self) -> &str {
        &self.model_token
    }

    /// Create the cache directory if it does not exist yet.
    pub fn ensure_dir(&self) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.marker.is_file()
    }

    pub fn mark_ready(&self) -> Result<()> {
        self.ensure_dir()?;
        std::fs::write(&self.marker, b"1")?;
        tracing::info!(dir = %self.dir.display(), "accelerator shader cache marked ready");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ShaderCache::new(dir.path(), &AcceleratorConfig::default());
        assert!(!cache.is_ready());
        assert_eq!(cache.dir(), dir.path().join("gpu_cache"));

        cache.mark_ready().unwrap();
        assert!(cache.is_ready());
        assert!(dir.path().join("gpu_cache/.shaders_ready").is_file());
    }
}
