//! The daemon-facing facade. Owns the workflow engine, pipeline executor
//! and job dispatcher. Hook events are serialized per session id here;
//! pipeline executions are serialized per execution id inside the
//! executor, and scheduler ticks never overlap each other.

use crate::config::{PipelineCatalog, WorkflowLibrary};
use crate::orchestration::actions::{ActionExecutor, AgentSpawner, PromptRunner};
use crate::orchestration::engine::WorkflowEngine;
use crate::orchestration::error::EngineError;
use crate::orchestration::event::{Decision, Event};
use crate::orchestration::state_store::{WorkflowState, WorkflowStateStore};
use crate::pipeline::executor::{ExecutionOutcome, PipelineExecutor};
use crate::pipeline::store::{PipelineExecution, PipelineExecutionStore};
use crate::scheduler::{CronRun, JobDispatcher, JobStore};
use crate::shared::keyed_lock::KeyedLock;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, Clone)]
pub struct CoreOptions {
    /// Root for all persisted state (sessions, executions, jobs, logs).
    pub state_root: PathBuf,
    /// Directory of workflow definition YAML files.
    pub workflows_dir: PathBuf,
    /// Directory of pipeline definition YAML files.
    pub pipelines_dir: PathBuf,
    /// Working directory for exec steps and shell jobs.
    pub work_dir: PathBuf,
}

impl CoreOptions {
    /// Conventional layout under one root: `workflows/definitions` and
    /// `pipelines/definitions` beside the persisted state.
    pub fn rooted(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref().to_path_buf();
        Self {
            workflows_dir: root.join("workflows/definitions"),
            pipelines_dir: root.join("pipelines/definitions"),
            work_dir: root.clone(),
            state_root: root,
        }
    }
}

pub struct OrchestratorCore {
    engine: WorkflowEngine,
    executor: PipelineExecutor,
    dispatcher: JobDispatcher,
    spawner: Box<dyn AgentSpawner>,
    session_locks: KeyedLock,
    tick_gate: Mutex<()>,
}

impl OrchestratorCore {
    pub fn new(
        options: CoreOptions,
        actions: Box<dyn ActionExecutor>,
        prompts: Box<dyn PromptRunner>,
        spawner: Box<dyn AgentSpawner>,
    ) -> Self {
        let library = WorkflowLibrary::load_dir(&options.workflows_dir);
        let catalog = PipelineCatalog::new(&options.pipelines_dir);
        let engine = WorkflowEngine::new(
            WorkflowStateStore::new(&options.state_root),
            library,
            actions,
        );
        let executor = PipelineExecutor::new(
            PipelineExecutionStore::new(&options.state_root),
            Box::new(catalog),
            prompts,
            &options.work_dir,
        );
        let dispatcher = JobDispatcher::new(JobStore::new(&options.state_root), &options.work_dir);
        Self {
            engine,
            executor,
            dispatcher,
            spawner,
            session_locks: KeyedLock::new(),
            tick_gate: Mutex::new(()),
        }
    }

    pub fn engine(&self) -> &WorkflowEngine {
        &self.engine
    }

    pub fn executor(&self) -> &PipelineExecutor {
        &self.executor
    }

    pub fn jobs(&self) -> &JobStore {
        self.dispatcher.store()
    }

    /// Hook-dispatch entry point. Events for one session are handled in
    /// arrival order; distinct sessions proceed concurrently.
    pub fn handle_event(&self, event: &Event) -> Result<Decision, EngineError> {
        let _guard = self.session_locks.acquire(&event.session_id);
        self.engine.handle_event(event)
    }

    pub fn activate_workflow(
        &self,
        session_id: &str,
        workflow_name: &str,
        now: i64,
    ) -> Result<WorkflowState, EngineError> {
        let _guard = self.session_locks.acquire(session_id);
        self.engine.activate(session_id, workflow_name, now)
    }

    pub fn clear_session(&self, session_id: &str) -> Result<(), EngineError> {
        let _guard = self.session_locks.acquire(session_id);
        self.engine.clear_session(session_id)
    }

    pub fn run_pipeline(
        &self,
        pipeline_name: &str,
        inputs: Map<String, Value>,
        project_id: &str,
        session_id: Option<&str>,
        now: i64,
    ) -> Result<ExecutionOutcome, EngineError> {
        self.executor
            .execute(pipeline_name, inputs, project_id, session_id, now)
    }

    /// Independently-triggered re-entry after an approval gate. The
    /// executor claims the token and resumes under the owning execution's
    /// lock, so concurrent callbacks and resumes queue up instead of
    /// re-running work.
    pub fn approve_pipeline_step(
        &self,
        token: &str,
        approved_by: Option<&str>,
        now: i64,
    ) -> Result<ExecutionOutcome, EngineError> {
        self.executor.approve(token, approved_by, now)
    }

    pub fn resume_pipeline(
        &self,
        execution_id: &str,
        now: i64,
    ) -> Result<ExecutionOutcome, EngineError> {
        self.executor.resume(execution_id, now)
    }

    pub fn execution_status(&self, execution_id: &str) -> Result<PipelineExecution, EngineError> {
        self.executor.store().load(execution_id)
    }

    /// One scheduler tick; ticks never overlap each other.
    pub fn run_due_jobs(&self, now: i64) -> Result<Vec<CronRun>, EngineError> {
        let _guard = self.tick_gate.lock().unwrap_or_else(|e| e.into_inner());
        self.dispatcher
            .run_due_jobs(&self.executor, self.spawner.as_ref(), now)
    }
}
