//! Durable pipeline execution records. One JSON file per execution under
//! `pipelines/executions/`, holding the execution row plus its embedded
//! step rows; every mutation goes through an atomic whole-file rewrite so a
//! crash never leaves a half-written record.

use crate::orchestration::error::{io_error, json_error, EngineError};
use crate::shared::fs_atomic::atomic_write_file;
use crate::shared::ids::{generate_execution_id, sanitize_id};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    WaitingApproval,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::WaitingApproval => "waiting_approval",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    WaitingApproval,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::WaitingApproval => "waiting_approval",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

/// One row per pipeline step that has been reached. Exactly one record per
/// (execution, step id); retries and resumes update the record in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepExecution {
    pub id: u64,
    pub execution_id: String,
    pub step_id: String,
    pub status: StepStatus,
    #[serde(default)]
    pub started_at: Option<i64>,
    #[serde(default)]
    pub completed_at: Option<i64>,
    #[serde(default)]
    pub input_json: Option<Value>,
    #[serde(default)]
    pub output_json: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    /// Set while the step gates on approval; retained afterwards so a
    /// reused token resolves to "already approved" instead of "unknown".
    #[serde(default)]
    pub approval_token: Option<String>,
    #[serde(default)]
    pub approval_expires_at: Option<i64>,
    #[serde(default)]
    pub approved_by: Option<String>,
    #[serde(default)]
    pub approved_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineExecution {
    pub id: String,
    pub pipeline_name: String,
    pub project_id: String,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub inputs: Map<String, Value>,
    #[serde(default)]
    pub outputs: Map<String, Value>,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default)]
    pub completed_at: Option<i64>,
    /// Non-null iff status is waiting_approval; correlates the execution to
    /// the innermost step awaiting approval, including through nesting.
    #[serde(default)]
    pub resume_token: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub parent_execution_id: Option<String>,
    #[serde(default)]
    pub parent_step_id: Option<String>,
    #[serde(default)]
    pub steps: Vec<StepExecution>,
    #[serde(default = "first_rowid")]
    pub next_step_rowid: u64,
}

fn first_rowid() -> u64 {
    1
}

impl PipelineExecution {
    pub fn step_record(&self, step_id: &str) -> Option<&StepExecution> {
        self.steps.iter().find(|step| step.step_id == step_id)
    }

    /// Returns the mutable record for `step_id`, creating a pending one with
    /// the next rowid if the step has not been reached yet.
    pub fn upsert_step(&mut self, step_id: &str) -> &mut StepExecution {
        if let Some(index) = self.steps.iter().position(|step| step.step_id == step_id) {
            return &mut self.steps[index];
        }
        let record = StepExecution {
            id: self.next_step_rowid,
            execution_id: self.id.clone(),
            step_id: step_id.to_string(),
            status: StepStatus::Pending,
            started_at: None,
            completed_at: None,
            input_json: None,
            output_json: None,
            error: None,
            approval_token: None,
            approval_expires_at: None,
            approved_by: None,
            approved_at: None,
        };
        self.next_step_rowid += 1;
        self.steps.push(record);
        self.steps.last_mut().expect("just pushed")
    }
}

/// File-backed execution store. A store-level mutex serializes every
/// read-modify-write so approval-token claims are atomic: a token can move
/// from waiting to approved exactly once.
#[derive(Debug)]
pub struct PipelineExecutionStore {
    state_root: PathBuf,
    mutate: Mutex<()>,
}

impl PipelineExecutionStore {
    pub fn new(state_root: impl AsRef<Path>) -> Self {
        Self {
            state_root: state_root.as_ref().to_path_buf(),
            mutate: Mutex::new(()),
        }
    }

    pub fn state_root(&self) -> &Path {
        &self.state_root
    }

    pub fn create(
        &self,
        pipeline_name: &str,
        project_id: &str,
        inputs: Map<String, Value>,
        session_id: Option<&str>,
        parent: Option<(&str, &str)>,
        now: i64,
    ) -> Result<PipelineExecution, EngineError> {
        let id = generate_execution_id().map_err(EngineError::IdGeneration)?;
        let execution = PipelineExecution {
            id,
            pipeline_name: pipeline_name.to_string(),
            project_id: project_id.to_string(),
            status: ExecutionStatus::Pending,
            inputs,
            outputs: Map::new(),
            created_at: now,
            updated_at: now,
            completed_at: None,
            resume_token: None,
            session_id: session_id.map(str::to_string),
            parent_execution_id: parent.map(|(execution_id, _)| execution_id.to_string()),
            parent_step_id: parent.map(|(_, step_id)| step_id.to_string()),
            steps: Vec::new(),
            next_step_rowid: 1,
        };
        self.persist(&execution)?;
        Ok(execution)
    }

    pub fn load(&self, execution_id: &str) -> Result<PipelineExecution, EngineError> {
        self.try_load(execution_id)?
            .ok_or_else(|| EngineError::UnknownExecution(execution_id.to_string()))
    }

    pub fn try_load(&self, execution_id: &str) -> Result<Option<PipelineExecution>, EngineError> {
        let path = self.execution_path(execution_id);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(io_error(&path, err)),
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|err| json_error(&path, err))
    }

    pub fn persist(&self, execution: &PipelineExecution) -> Result<(), EngineError> {
        let path = self.execution_path(&execution.id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| io_error(parent, err))?;
        }
        let body =
            serde_json::to_vec_pretty(execution).map_err(|err| json_error(&path, err))?;
        atomic_write_file(&path, &body).map_err(|err| io_error(&path, err))
    }

    pub fn list_ids(&self) -> Result<Vec<String>, EngineError> {
        let dir = self.executions_dir();
        let mut ids = Vec::new();
        if !dir.exists() {
            return Ok(ids);
        }
        let entries = fs::read_dir(&dir).map_err(|err| io_error(&dir, err))?;
        for entry in entries {
            let path = entry.map_err(|err| io_error(&dir, err))?.path();
            if path.extension().and_then(|v| v.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|v| v.to_str()) {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Resolves an approval token to the execution holding it. Read-only;
    /// tokens never move between executions, so the returned id is a stable
    /// key to serialize the claim on.
    pub fn find_token_owner(&self, token: &str) -> Result<PipelineExecution, EngineError> {
        for id in self.list_ids()? {
            let Some(execution) = self.try_load(&id)? else {
                continue;
            };
            if execution
                .steps
                .iter()
                .any(|step| step.approval_token.as_deref() == Some(token))
            {
                return Ok(execution);
            }
        }
        Err(EngineError::UnknownApprovalToken)
    }

    /// Atomically claims an approval token: validates it references a step
    /// still waiting, marks the step completed with the approver identity,
    /// and moves the execution back to running. Runs under the store mutex
    /// so two concurrent approvals of the same token cannot both succeed.
    pub fn claim_approval(
        &self,
        token: &str,
        approved_by: Option<&str>,
        now: i64,
    ) -> Result<PipelineExecution, EngineError> {
        let _guard = self.mutate.lock().unwrap_or_else(|e| e.into_inner());

        let mut execution = self.find_token_owner(token)?;

        let index = execution
            .steps
            .iter()
            .position(|step| step.approval_token.as_deref() == Some(token))
            .ok_or(EngineError::UnknownApprovalToken)?;
        let step = &mut execution.steps[index];
        if step.status != StepStatus::WaitingApproval {
            return Err(EngineError::ApprovalNotPending);
        }
        if let Some(expires_at) = step.approval_expires_at {
            if now > expires_at {
                return Err(EngineError::ApprovalExpired);
            }
        }

        step.status = StepStatus::Completed;
        step.completed_at = Some(now);
        step.approved_by = approved_by.map(str::to_string);
        step.approved_at = Some(now);
        let mut approval = Map::new();
        approval.insert("approved".to_string(), Value::Bool(true));
        if let Some(approver) = approved_by {
            approval.insert(
                "approved_by".to_string(),
                Value::String(approver.to_string()),
            );
        }
        step.output_json = Some(Value::Object(approval));

        execution.status = ExecutionStatus::Running;
        execution.resume_token = None;
        execution.updated_at = now;
        self.persist(&execution)?;
        Ok(execution)
    }

    /// Finds the child execution spawned by a nested-pipeline step.
    pub fn find_child(
        &self,
        parent_execution_id: &str,
        parent_step_id: &str,
    ) -> Result<Option<PipelineExecution>, EngineError> {
        for id in self.list_ids()? {
            let Some(execution) = self.try_load(&id)? else {
                continue;
            };
            if execution.parent_execution_id.as_deref() == Some(parent_execution_id)
                && execution.parent_step_id.as_deref() == Some(parent_step_id)
            {
                return Ok(Some(execution));
            }
        }
        Ok(None)
    }

    fn executions_dir(&self) -> PathBuf {
        self.state_root.join("pipelines/executions")
    }

    fn execution_path(&self, execution_id: &str) -> PathBuf {
        self.executions_dir()
            .join(format!("{}.json", sanitize_id(execution_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, PipelineExecutionStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = PipelineExecutionStore::new(dir.path());
        (dir, store)
    }

    #[test]
    fn create_persist_load_round_trip() {
        let (_dir, store) = store();
        let mut execution = store
            .create("build", "proj", Map::new(), Some("sess-1"), None, 100)
            .expect("create");
        assert!(execution.id.starts_with("pe-"));
        assert_eq!(execution.status, ExecutionStatus::Pending);

        execution.status = ExecutionStatus::Running;
        execution.upsert_step("compile").status = StepStatus::Running;
        store.persist(&execution).expect("persist");

        let loaded = store.load(&execution.id).expect("load");
        assert_eq!(loaded.status, ExecutionStatus::Running);
        assert_eq!(loaded.steps.len(), 1);
        assert_eq!(loaded.steps[0].id, 1);
        assert_eq!(loaded.next_step_rowid, 2);
    }

    #[test]
    fn upsert_keeps_one_record_per_step() {
        let (_dir, store) = store();
        let mut execution = store
            .create("build", "proj", Map::new(), None, None, 100)
            .expect("create");
        execution.upsert_step("compile").status = StepStatus::Failed;
        execution.upsert_step("compile").status = StepStatus::Completed;
        assert_eq!(execution.steps.len(), 1);
        assert_eq!(execution.steps[0].status, StepStatus::Completed);
    }

    #[test]
    fn claim_approval_is_single_shot() {
        let (_dir, store) = store();
        let mut execution = store
            .create("deploy", "proj", Map::new(), None, None, 100)
            .expect("create");
        {
            let step = execution.upsert_step("ship");
            step.status = StepStatus::WaitingApproval;
            step.approval_token = Some("apv-test-token".to_string());
        }
        execution.status = ExecutionStatus::WaitingApproval;
        execution.resume_token = Some("apv-test-token".to_string());
        store.persist(&execution).expect("persist");

        let claimed = store
            .claim_approval("apv-test-token", Some("alice"), 200)
            .expect("claim");
        assert_eq!(claimed.status, ExecutionStatus::Running);
        assert_eq!(claimed.resume_token, None);
        let step = claimed.step_record("ship").expect("step");
        assert_eq!(step.status, StepStatus::Completed);
        assert_eq!(step.approved_by.as_deref(), Some("alice"));

        let reused = store.claim_approval("apv-test-token", Some("alice"), 201);
        assert!(matches!(reused, Err(EngineError::ApprovalNotPending)));
        let unknown = store.claim_approval("apv-no-such", None, 201);
        assert!(matches!(unknown, Err(EngineError::UnknownApprovalToken)));
    }

    #[test]
    fn expired_token_is_rejected_without_mutation() {
        let (_dir, store) = store();
        let mut execution = store
            .create("deploy", "proj", Map::new(), None, None, 100)
            .expect("create");
        {
            let step = execution.upsert_step("ship");
            step.status = StepStatus::WaitingApproval;
            step.approval_token = Some("apv-expiring".to_string());
            step.approval_expires_at = Some(150);
        }
        execution.status = ExecutionStatus::WaitingApproval;
        execution.resume_token = Some("apv-expiring".to_string());
        store.persist(&execution).expect("persist");

        let err = store.claim_approval("apv-expiring", None, 200);
        assert!(matches!(err, Err(EngineError::ApprovalExpired)));
        let reloaded = store.load(&execution.id).expect("load");
        assert_eq!(reloaded.status, ExecutionStatus::WaitingApproval);
    }

    #[test]
    fn find_child_matches_parent_step() {
        let (_dir, store) = store();
        let parent = store
            .create("outer", "proj", Map::new(), None, None, 100)
            .expect("create parent");
        let child = store
            .create(
                "inner",
                "proj",
                Map::new(),
                None,
                Some((&parent.id, "nested")),
                100,
            )
            .expect("create child");

        let found = store
            .find_child(&parent.id, "nested")
            .expect("scan")
            .expect("child exists");
        assert_eq!(found.id, child.id);
        assert!(store
            .find_child(&parent.id, "other-step")
            .expect("scan")
            .is_none());
    }
}
