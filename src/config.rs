//! Per-run configuration.
//!
//! Every pipeline run carries its own `RunConfig` value; there is no
//! process-wide key or model selection state.

use crate::error::{PipelineError, Result};
use serde::Serialize;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_CATALOG: &str = "db";

/// Total execution attempts per run: the initial query plus two corrections.
pub const MAX_ATTEMPTS: u8 = 3;

#[derive(Debug, Clone, Serialize)]
pub struct RunConfig {
    #[serde(skip_serializing)]
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    /// Logical name the target database is attached under; every generated
    /// query references tables as `<catalog>.<table>`.
    pub catalog: String,
    pub max_attempts: u8,
}

impl RunConfig {
    pub fn new(api_key: String, model: String) -> Self {
        Self {
            api_key,
            model,
            base_url: DEFAULT_BASE_URL.to_string(),
            catalog: DEFAULT_CATALOG.to_string(),
            max_attempts: MAX_ATTEMPTS,
        }
    }

    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url;
        self
    }

    pub fn with_catalog(mut self, catalog: String) -> Self {
        self.catalog = catalog;
        self
    }

    /// A missing question or API key aborts before any stage runs.
    pub fn validate(&self, question: &str) -> Result<()> {
        if question.trim().is_empty() {
            return Err(PipelineError::Config("Question is required".to_string()));
        }
        if self.api_key.trim().is_empty() {
            return Err(PipelineError::Config("API key is required".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_rejects_empty_question() {
        let config = RunConfig::new("sk-test".to_string(), DEFAULT_MODEL.to_string());
        assert!(config.validate("  ").is_err());
        assert!(config.validate("List customers").is_ok());
    }

    #[test]
    fn test_validate_rejects_missing_api_key() {
        let config = RunConfig::new(String::new(), DEFAULT_MODEL.to_string());
        assert!(config.validate("List customers").is_err());
    }
}
