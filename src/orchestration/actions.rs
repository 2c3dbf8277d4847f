//! Collaborator seams: the engine calls out through these traits for
//! anything that leaves the orchestration core (shell/LLM/MCP actions,
//! headless agent spawning, pipeline definition loading).

use crate::config::{PipelineCatalog, PipelineDefinition};
use crate::orchestration::error::EngineError;
use crate::orchestration::event::Event;
use serde_json::{Map, Value};
use std::time::Duration;

#[derive(Debug)]
pub struct ActionContext<'a> {
    pub session_id: &'a str,
    pub event: &'a Event,
    pub variables: &'a Map<String, Value>,
}

/// Uniform result shape for trigger actions. `set_variables` entries are
/// merged into the session's workflow variables by the engine; `Abort`
/// stops the remaining actions of the trigger.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionOutcome {
    Continue { set_variables: Map<String, Value> },
    Abort { reason: String },
}

impl ActionOutcome {
    pub fn ok() -> Self {
        Self::Continue {
            set_variables: Map::new(),
        }
    }
}

pub trait ActionExecutor: Send + Sync {
    fn execute(
        &self,
        action: &str,
        params: &Map<String, Value>,
        context: &ActionContext<'_>,
    ) -> Result<ActionOutcome, String>;
}

/// Stock executor for deployments without an external action collaborator;
/// every action is a logged no-op.
#[derive(Debug, Default)]
pub struct NoopActionExecutor;

impl ActionExecutor for NoopActionExecutor {
    fn execute(
        &self,
        _action: &str,
        _params: &Map<String, Value>,
        _context: &ActionContext<'_>,
    ) -> Result<ActionOutcome, String> {
        Ok(ActionOutcome::ok())
    }
}

#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub prompt: String,
    pub project_id: String,
    pub provider: Option<String>,
    pub workflow: Option<String>,
    pub timeout: Duration,
}

pub trait AgentSpawner: Send + Sync {
    /// Runs a headless agent to completion and returns its output text.
    fn spawn_headless(&self, request: &SpawnRequest) -> Result<String, String>;
}

pub trait PromptRunner: Send + Sync {
    /// Delegates a rendered prompt step to the LLM collaborator.
    fn run_prompt(&self, prompt: &str, timeout: Duration) -> Result<String, String>;
}

/// Stand-ins for deployments without agent/LLM collaborators wired up;
/// any step or job that needs one fails with a clear message instead of
/// hanging or panicking.
#[derive(Debug, Default)]
pub struct UnconfiguredAgentSpawner;

impl AgentSpawner for UnconfiguredAgentSpawner {
    fn spawn_headless(&self, _request: &SpawnRequest) -> Result<String, String> {
        Err("no agent-spawn collaborator configured".to_string())
    }
}

#[derive(Debug, Default)]
pub struct UnconfiguredPromptRunner;

impl PromptRunner for UnconfiguredPromptRunner {
    fn run_prompt(&self, _prompt: &str, _timeout: Duration) -> Result<String, String> {
        Err("no prompt collaborator configured".to_string())
    }
}

pub trait PipelineLoader: Send + Sync {
    fn load_pipeline(&self, name: &str) -> Result<PipelineDefinition, EngineError>;
}

impl PipelineLoader for PipelineCatalog {
    fn load_pipeline(&self, name: &str) -> Result<PipelineDefinition, EngineError> {
        self.load(name).map_err(EngineError::from)
    }
}
