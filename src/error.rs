use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Parse error in {stage} output: {message}")]
    Parse { stage: String, message: String },

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    pub fn parse(stage: &str, message: impl Into<String>) -> Self {
        PipelineError::Parse {
            stage: stage.to_string(),
            message: message.into(),
        }
    }

    /// Parse failures outside schema linking are recoverable: the orchestrator
    /// substitutes a default structure and keeps going.
    pub fn is_parse(&self) -> bool {
        matches!(self, PipelineError::Parse { .. })
    }
}

impl From<rusqlite::Error> for PipelineError {
    fn from(err: rusqlite::Error) -> Self {
        PipelineError::Database(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
