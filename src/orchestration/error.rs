use crate::config::ConfigError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("unknown pipeline `{0}`")]
    UnknownPipeline(String),
    #[error("pipeline execution `{0}` not found")]
    UnknownExecution(String),
    #[error("approval token not found")]
    UnknownApprovalToken,
    #[error("approval token does not reference a step awaiting approval")]
    ApprovalNotPending,
    #[error("approval token expired")]
    ApprovalExpired,
    #[error("pipeline `{pipeline}` is missing required input `{input}`")]
    MissingRequiredInput { pipeline: String, input: String },
    #[error("pipeline execution `{execution_id}` is {status}, not resumable")]
    NotResumable {
        execution_id: String,
        status: String,
    },
    #[error("step execution failed for step `{step_id}`: {reason}")]
    StepExecution { step_id: String, reason: String },
    #[error("id generation failed: {0}")]
    IdGeneration(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("json error at {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

impl From<ConfigError> for EngineError {
    fn from(value: ConfigError) -> Self {
        match value {
            ConfigError::UnknownPipeline(name) => Self::UnknownPipeline(name),
            other => Self::Config(other.to_string()),
        }
    }
}

pub(crate) fn io_error(path: &std::path::Path, source: std::io::Error) -> EngineError {
    EngineError::Io {
        path: path.display().to_string(),
        source,
    }
}

pub(crate) fn json_error(path: &std::path::Path, source: serde_json::Error) -> EngineError {
    EngineError::Json {
        path: path.display().to_string(),
        source,
    }
}
