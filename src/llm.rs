//! LLM client for the OpenAI-compatible chat completions API.
//!
//! One call in, raw text out. The client never retries on its own: all retry
//! policy belongs to the pipeline orchestrator.

use crate::error::{PipelineError, Result};
use tracing::warn;

#[derive(Clone)]
pub struct LlmClient {
    api_key: String,
    base_url: String,
    model: String,
    client: reqwest::Client,
}

impl LlmClient {
    pub fn new(api_key: String, model: String, base_url: String) -> Self {
        Self {
            api_key,
            base_url,
            model,
            client: reqwest::Client::new(),
        }
    }

    /// Send one prompt and return the raw completion text.
    ///
    /// When `structured` is true the request asks the service for strict JSON
    /// output; callers still validate the parse, since not every backend
    /// honors the mode.
    pub async fn complete(&self, prompt: &str, structured: bool) -> Result<String> {
        let system = if structured {
            "Return JSON only, no text."
        } else {
            "You are an expert SQL engineer. Return only what is asked for, no commentary."
        };

        let mut body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": prompt}
            ],
            "temperature": 0.1,
        });

        if structured {
            body["response_format"] = serde_json::json!({"type": "json_object"});
        }

        // Use max_completion_tokens for newer models, max_tokens for older ones.
        // Reasoning models spend reasoning tokens on top of completion tokens.
        if self.model.starts_with("gpt-5") || self.model.contains("o1") {
            body["max_completion_tokens"] = serde_json::json!(2000);
        } else if self.model.starts_with("gpt-4") {
            body["max_completion_tokens"] = serde_json::json!(1000);
        } else {
            body["max_tokens"] = serde_json::json!(1000);
        }

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| PipelineError::Llm(format!("LLM API call failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(PipelineError::Llm(format!(
                "LLM API error ({}): {}",
                status, error_text
            )));
        }

        let response_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| PipelineError::Llm(format!("Failed to parse LLM response: {}", e)))?;

        if let Some(error) = response_json.get("error") {
            return Err(PipelineError::Llm(format!("LLM API error: {}", error)));
        }

        let choices = response_json
            .get("choices")
            .and_then(|c| c.as_array())
            .filter(|c| !c.is_empty())
            .ok_or_else(|| PipelineError::Llm("No choices in LLM response".to_string()))?;

        if let Some(finish_reason) = choices[0].get("finish_reason").and_then(|r| r.as_str()) {
            if finish_reason == "length" {
                warn!("LLM response was truncated due to length limit");
            } else if finish_reason == "content_filter" {
                return Err(PipelineError::Llm(
                    "LLM response was filtered by content policy".to_string(),
                ));
            }
        }

        let content = choices[0]["message"]["content"]
            .as_str()
            .ok_or_else(|| PipelineError::Llm("No content in LLM response".to_string()))?;

        if content.is_empty() {
            return Err(PipelineError::Llm("Empty content in LLM response".to_string()));
        }

        Ok(content.to_string())
    }
}

/// Strip fenced code-block markers and surrounding whitespace from a raw
/// completion. Unstructured responses routinely arrive wrapped in
/// ```` ```sql ... ``` ```` fences.
pub fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();
    if !trimmed.starts_with("```") {
        return trimmed.to_string();
    }
    let mut inner = trimmed.trim_start_matches("```");
    // Drop a language tag on the opening fence ("sql", "json", ...).
    if let Some(newline) = inner.find('\n') {
        let tag = &inner[..newline];
        if !tag.trim().is_empty() && !tag.trim().contains(char::is_whitespace) {
            inner = &inner[newline + 1..];
        }
    }
    inner.trim_end_matches("```").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_plain_text_unchanged() {
        assert_eq!(strip_code_fences("SELECT 1"), "SELECT 1");
        assert_eq!(strip_code_fences("  SELECT 1\n"), "SELECT 1");
    }

    #[test]
    fn test_strip_bare_fences() {
        assert_eq!(strip_code_fences("```\nSELECT 1\n```"), "SELECT 1");
    }

    #[test]
    fn test_strip_language_tagged_fences() {
        assert_eq!(
            strip_code_fences("```sql\nSELECT * FROM db.customers\n```"),
            "SELECT * FROM db.customers"
        );
        assert_eq!(strip_code_fences("```json\n{\"a\": 1}\n```"), "{\"a\": 1}");
    }

    #[test]
    fn test_strip_keeps_multiline_body() {
        let sql = "```sql\nSELECT *\nFROM db.orders\nWHERE Total > 10\n```";
        assert_eq!(
            strip_code_fences(sql),
            "SELECT *\nFROM db.orders\nWHERE Total > 10"
        );
    }
}
