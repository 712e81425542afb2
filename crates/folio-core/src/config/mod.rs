mod env;
mod types;

#[cfg(test)]
mod tests;

pub use types::*;

use std::path::{Path, PathBuf};

use anyhow::{Context, bail};

impl Config {
    /// Load configuration from a TOML file with env var overrides.
    ///
    /// Falls back to defaults when the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str::<Self>(&content).context("failed to parse config file")?
        } else {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Check cross-field invariants that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.chunker
            .validate()
            .map_err(|e| anyhow::anyhow!(e))
            .context("invalid [chunker] section")?;
        self.index
            .validate()
            .map_err(|e| anyhow::anyhow!(e))
            .context("invalid [index] section")?;
        if self.embedding.batch_size == 0 {
            bail!("embedding.batch_size must be positive");
        }
        if self.embedding.max_in_flight == 0 {
            bail!("embedding.max_in_flight must be positive");
        }
        if self.retrieval.top_k == 0 {
            bail!("retrieval.top_k must be positive");
        }
        if self.retrieval.overfetch_factor == 0 {
            bail!("retrieval.overfetch_factor must be at least 1");
        }
        if !self.retrieval.score_threshold.is_finite() {
            bail!("retrieval.score_threshold must be finite");
        }
        if self.retrieval.context_budget_chars == 0 {
            bail!("retrieval.context_budget_chars must be positive");
        }
        if self.llm.embedding_dimensions == Some(0) {
            bail!("llm.embedding_dimensions must be positive");
        }
        if self.timeouts.query_seconds == 0 || self.timeouts.ingest_seconds == 0 {
            bail!("timeouts must be positive");
        }
        Ok(())
    }
}

/// `--config <path>` from the command line, then `FOLIO_CONFIG`, then `config/default.toml`.
#[must_use]
pub fn resolve_config_path(cli: Option<&Path>) -> PathBuf {
    if let Some(path) = cli {
        return path.to_path_buf();
    }
    if let Ok(path) = std::env::var("FOLIO_CONFIG") {
        return PathBuf::from(path);
    }
    PathBuf::from("config/default.toml")
}
