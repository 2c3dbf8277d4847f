use crate::orchestration::error::{io_error, json_error, EngineError};
use crate::shared::fs_atomic::atomic_write_file;
use crate::shared::ids::sanitize_id;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Per-session workflow state. Exactly one live record per session id;
/// created on first activation, deleted on clear/session teardown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowState {
    pub session_id: String,
    pub workflow_name: String,
    /// Current step name; None for lifecycle workflows and finished machines.
    #[serde(default)]
    pub step: Option<String>,
    #[serde(default)]
    pub step_action_count: u64,
    #[serde(default)]
    pub total_action_count: u64,
    /// Merged session + workflow scope, flat key -> value.
    #[serde(default)]
    pub variables: Map<String, Value>,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub artifacts: Map<String, Value>,
    #[serde(default)]
    pub task_list: Vec<Value>,
    #[serde(default)]
    pub reflection_pending: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl WorkflowState {
    pub fn new(session_id: &str, workflow_name: &str, now: i64) -> Self {
        Self {
            session_id: session_id.to_string(),
            workflow_name: workflow_name.to_string(),
            step: None,
            step_action_count: 0,
            total_action_count: 0,
            variables: Map::new(),
            disabled: false,
            artifacts: Map::new(),
            task_list: Vec::new(),
            reflection_pending: false,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkflowStateStore {
    state_root: PathBuf,
}

impl WorkflowStateStore {
    pub fn new(state_root: impl AsRef<Path>) -> Self {
        Self {
            state_root: state_root.as_ref().to_path_buf(),
        }
    }

    pub fn state_root(&self) -> &Path {
        &self.state_root
    }

    pub fn load(&self, session_id: &str) -> Result<Option<WorkflowState>, EngineError> {
        let path = self.session_path(session_id);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(io_error(&path, err)),
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|err| json_error(&path, err))
    }

    pub fn persist(&self, state: &WorkflowState) -> Result<(), EngineError> {
        let path = self.session_path(&state.session_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| io_error(parent, err))?;
        }
        let body =
            serde_json::to_vec_pretty(state).map_err(|err| json_error(&path, err))?;
        atomic_write_file(&path, &body).map_err(|err| io_error(&path, err))
    }

    /// Explicit clear; also used on session teardown.
    pub fn delete(&self, session_id: &str) -> Result<(), EngineError> {
        let path = self.session_path(session_id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_error(&path, err)),
        }
    }

    pub fn list_sessions(&self) -> Result<Vec<String>, EngineError> {
        let dir = self.sessions_dir();
        let mut sessions = Vec::new();
        if !dir.exists() {
            return Ok(sessions);
        }
        let entries = fs::read_dir(&dir).map_err(|err| io_error(&dir, err))?;
        for entry in entries {
            let path = entry.map_err(|err| io_error(&dir, err))?.path();
            if path.extension().and_then(|v| v.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|v| v.to_str()) {
                sessions.push(stem.to_string());
            }
        }
        sessions.sort();
        Ok(sessions)
    }

    fn sessions_dir(&self) -> PathBuf {
        self.state_root.join("workflows/sessions")
    }

    fn session_path(&self, session_id: &str) -> PathBuf {
        self.sessions_dir()
            .join(format!("{}.json", sanitize_id(session_id)))
    }
}
