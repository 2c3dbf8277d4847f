//! Durable, resumable pipeline execution. `run` walks the definition's
//! steps against the persisted execution record: completed steps are
//! carried forward instead of re-run, so re-entering the same execution id
//! after an approval or a process restart resumes exactly where it left
//! off. Approval gates suspend by returning a tagged outcome, never by
//! blocking the calling thread.
//!
//! Mutation of one execution record is serialized on its execution id:
//! `execute`, `resume` and `approve` all take the per-id lock before
//! loading, so concurrent re-entries into the same execution queue up
//! instead of interleaving and re-running a step's side effects.

use crate::config::{ApprovalGate, PipelineDefinition, PipelineStep, PipelineStepKind};
use crate::expr;
use crate::orchestration::actions::{PipelineLoader, PromptRunner};
use crate::orchestration::error::EngineError;
use crate::pipeline::store::{
    ExecutionStatus, PipelineExecution, PipelineExecutionStore, StepStatus,
};
use crate::shared::ids::generate_approval_token;
use crate::shared::keyed_lock::KeyedLock;
use crate::shared::logging::{log_diagnostic, log_event};
use crate::shared::subprocess::run_shell;
use crate::shared::text::{bounded_error, bounded_output};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_STEP_TIMEOUT_SECONDS: u64 = 300;

/// Everything a caller needs to route an approval request: which execution
/// is suspended, at which step, and the token that resumes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalPending {
    pub execution_id: String,
    pub step_id: String,
    pub token: String,
    pub message: String,
}

/// Result of driving an execution as far as it can go in one call.
#[derive(Debug)]
pub enum ExecutionOutcome {
    Completed(PipelineExecution),
    Failed(PipelineExecution),
    WaitingApproval {
        execution: PipelineExecution,
        pending: ApprovalPending,
    },
}

impl ExecutionOutcome {
    pub fn execution(&self) -> &PipelineExecution {
        match self {
            Self::Completed(execution) | Self::Failed(execution) => execution,
            Self::WaitingApproval { execution, .. } => execution,
        }
    }

    pub fn into_execution(self) -> PipelineExecution {
        match self {
            Self::Completed(execution) | Self::Failed(execution) => execution,
            Self::WaitingApproval { execution, .. } => execution,
        }
    }

    pub fn pending(&self) -> Option<&ApprovalPending> {
        match self {
            Self::WaitingApproval { pending, .. } => Some(pending),
            _ => None,
        }
    }
}

enum StepResult {
    Done(Value),
    Failed(String),
    Suspended(ApprovalPending),
}

pub struct PipelineExecutor {
    store: PipelineExecutionStore,
    loader: Box<dyn PipelineLoader>,
    prompts: Box<dyn PromptRunner>,
    work_dir: PathBuf,
    locks: KeyedLock,
}

impl PipelineExecutor {
    pub fn new(
        store: PipelineExecutionStore,
        loader: Box<dyn PipelineLoader>,
        prompts: Box<dyn PromptRunner>,
        work_dir: impl AsRef<Path>,
    ) -> Self {
        Self {
            store,
            loader,
            prompts,
            work_dir: work_dir.as_ref().to_path_buf(),
            locks: KeyedLock::new(),
        }
    }

    pub fn store(&self) -> &PipelineExecutionStore {
        &self.store
    }

    /// Starts a fresh execution of the named pipeline.
    pub fn execute(
        &self,
        pipeline_name: &str,
        inputs: Map<String, Value>,
        project_id: &str,
        session_id: Option<&str>,
        now: i64,
    ) -> Result<ExecutionOutcome, EngineError> {
        let definition = self.loader.load_pipeline(pipeline_name)?;
        let inputs = resolve_inputs(&definition, inputs)?;
        let execution =
            self.store
                .create(&definition.name, project_id, inputs, session_id, None, now)?;
        log_event(
            self.store.state_root(),
            "pipeline.execution.started",
            &[
                ("executionId", Value::String(execution.id.clone())),
                ("pipeline", Value::String(definition.name.clone())),
            ],
        );
        let _guard = self.locks.acquire(&execution.id);
        self.run(&definition, execution, now)
    }

    /// Re-enters an existing execution, typically after a restart.
    pub fn resume(&self, execution_id: &str, now: i64) -> Result<ExecutionOutcome, EngineError> {
        let _guard = self.locks.acquire(execution_id);
        self.resume_locked(execution_id, now)
    }

    /// Resume body; the caller holds the execution's lock, so the record
    /// loaded here cannot change under us.
    fn resume_locked(
        &self,
        execution_id: &str,
        now: i64,
    ) -> Result<ExecutionOutcome, EngineError> {
        let execution = self.store.load(execution_id)?;
        match execution.status {
            ExecutionStatus::Completed => Ok(ExecutionOutcome::Completed(execution)),
            ExecutionStatus::Failed => Ok(ExecutionOutcome::Failed(execution)),
            ExecutionStatus::Cancelled => Err(EngineError::NotResumable {
                execution_id: execution_id.to_string(),
                status: execution.status.as_str().to_string(),
            }),
            _ => {
                let definition = self.loader.load_pipeline(&execution.pipeline_name)?;
                self.run(&definition, execution, now)
            }
        }
    }

    /// Claims an approval token, resumes the owning execution, then walks
    /// any ancestor chain so a nested approval unblocks the outer pipelines
    /// waiting on it. Returns the outermost resumed outcome.
    pub fn approve(
        &self,
        token: &str,
        approved_by: Option<&str>,
        now: i64,
    ) -> Result<ExecutionOutcome, EngineError> {
        // Resolve the token to its owner first: the claim must happen under
        // that execution's lock, or a concurrent resume could overwrite it
        // with a stale snapshot.
        let owner_id = self.store.find_token_owner(token)?.id;
        let mut outcome = {
            let _guard = self.locks.acquire(&owner_id);
            let execution = self.store.claim_approval(token, approved_by, now)?;
            log_event(
                self.store.state_root(),
                "pipeline.approval.granted",
                &[
                    ("executionId", Value::String(execution.id.clone())),
                    (
                        "approvedBy",
                        approved_by
                            .map(|by| Value::String(by.to_string()))
                            .unwrap_or(Value::Null),
                    ),
                ],
            );
            let definition = self.loader.load_pipeline(&execution.pipeline_name)?;
            self.run(&definition, execution, now)?
        };

        while !matches!(outcome, ExecutionOutcome::WaitingApproval { .. }) {
            let Some(parent_id) = outcome.execution().parent_execution_id.clone() else {
                break;
            };
            outcome = self.resume(&parent_id, now)?;
        }
        Ok(outcome)
    }

    fn run(
        &self,
        definition: &PipelineDefinition,
        mut execution: PipelineExecution,
        now: i64,
    ) -> Result<ExecutionOutcome, EngineError> {
        let state_root = self.store.state_root().to_path_buf();
        execution.status = ExecutionStatus::Running;
        execution.resume_token = None;
        execution.updated_at = now;
        self.store.persist(&execution)?;

        let mut variables = execution.inputs.clone();
        variables.insert(
            "inputs".to_string(),
            Value::Object(execution.inputs.clone()),
        );

        for step in &definition.steps {
            // Resume path: completed and skipped steps are carried forward,
            // never re-executed.
            if let Some(existing) = execution.step_record(&step.id) {
                match existing.status {
                    StepStatus::Completed => {
                        if let Some(output) = existing.output_json.clone() {
                            variables.insert(step.id.clone(), output);
                        }
                        continue;
                    }
                    StepStatus::Skipped => continue,
                    StepStatus::WaitingApproval => {
                        // A resume without an approval re-suspends on the
                        // original token. Nested-pipeline steps carry no
                        // token of their own and are re-driven instead.
                        if let Some(token) = existing.approval_token.clone() {
                            return self.suspend(
                                execution,
                                &step.id,
                                token,
                                approval_message(step),
                                now,
                            );
                        }
                    }
                    StepStatus::Pending | StepStatus::Running | StepStatus::Failed => {}
                }
            }

            if let Some(condition) = &step.condition {
                let pass = expr::evaluate_predicate(condition, &variables).unwrap_or_else(|err| {
                    log_diagnostic(
                        &state_root,
                        "pipeline_executor",
                        &format!(
                            "condition on step `{}` of `{}` failed to evaluate, skipping: {err}",
                            step.id, definition.name
                        ),
                    );
                    false
                });
                if !pass {
                    let record = execution.upsert_step(&step.id);
                    record.status = StepStatus::Skipped;
                    record.completed_at = Some(now);
                    execution.updated_at = now;
                    self.store.persist(&execution)?;
                    continue;
                }
            }

            let step_input = step
                .input
                .as_deref()
                .and_then(|reference| resolve_path(reference, &variables));
            let mut scope = variables.clone();
            if let Some(input) = &step_input {
                scope.insert("input".to_string(), input.clone());
            }

            // Approval gates suspend before the step's work is dispatched;
            // granting the approval is what completes the step.
            if let Some(gate) = step.approval.as_ref().filter(|gate| gate.required) {
                let token = generate_approval_token().map_err(EngineError::IdGeneration)?;
                {
                    let record = execution.upsert_step(&step.id);
                    record.status = StepStatus::WaitingApproval;
                    record.started_at = Some(now);
                    record.input_json = step_input.clone();
                    record.approval_token = Some(token.clone());
                    record.approval_expires_at = gate
                        .timeout_seconds
                        .map(|timeout| now.saturating_add(timeout as i64));
                }
                return self.suspend(execution, &step.id, token, gate_message(gate), now);
            }

            {
                let record = execution.upsert_step(&step.id);
                record.status = StepStatus::Running;
                record.started_at = Some(now);
                record.input_json = step_input.clone();
                record.error = None;
            }
            execution.updated_at = now;
            self.store.persist(&execution)?;

            let result = match &step.kind {
                PipelineStepKind::Exec(template) => self.run_exec(template, &scope, step),
                PipelineStepKind::Prompt(template) => self.run_prompt(template, &scope, step),
                PipelineStepKind::InvokePipeline(name) => {
                    self.run_nested(name, &execution, step, &step_input, now)?
                }
            };

            match result {
                StepResult::Done(output) => {
                    {
                        let record = execution.upsert_step(&step.id);
                        record.status = StepStatus::Completed;
                        record.completed_at = Some(now);
                        record.output_json = Some(output.clone());
                    }
                    variables.insert(step.id.clone(), output);
                    execution.updated_at = now;
                    self.store.persist(&execution)?;
                }
                StepResult::Failed(reason) => {
                    let reason = bounded_error(&reason);
                    {
                        let record = execution.upsert_step(&step.id);
                        record.status = StepStatus::Failed;
                        record.completed_at = Some(now);
                        record.error = Some(reason.clone());
                    }
                    execution.status = ExecutionStatus::Failed;
                    execution.completed_at = Some(now);
                    execution.updated_at = now;
                    self.store.persist(&execution)?;
                    log_event(
                        &state_root,
                        "pipeline.execution.failed",
                        &[
                            ("executionId", Value::String(execution.id.clone())),
                            ("stepId", Value::String(step.id.clone())),
                            ("error", Value::String(reason)),
                        ],
                    );
                    return Ok(ExecutionOutcome::Failed(execution));
                }
                StepResult::Suspended(pending) => {
                    {
                        let record = execution.upsert_step(&step.id);
                        record.status = StepStatus::WaitingApproval;
                        // Token lives on the nested step; the parent only
                        // tracks it through resume_token.
                        record.approval_token = None;
                    }
                    return self.suspend_nested(execution, pending, now);
                }
            }
        }

        let mut outputs = Map::new();
        for (name, expression) in &definition.outputs {
            let value = expr::evaluate(expression, &variables).unwrap_or_else(|err| {
                log_diagnostic(
                    &state_root,
                    "pipeline_executor",
                    &format!(
                        "output `{name}` of `{}` failed to evaluate: {err}",
                        definition.name
                    ),
                );
                Value::Null
            });
            outputs.insert(name.clone(), value);
        }
        execution.outputs = outputs;
        execution.status = ExecutionStatus::Completed;
        execution.completed_at = Some(now);
        execution.updated_at = now;
        self.store.persist(&execution)?;
        log_event(
            &state_root,
            "pipeline.execution.completed",
            &[("executionId", Value::String(execution.id.clone()))],
        );
        Ok(ExecutionOutcome::Completed(execution))
    }

    fn run_exec(
        &self,
        template: &str,
        scope: &Map<String, Value>,
        step: &PipelineStep,
    ) -> StepResult {
        let command = render_template(template, scope);
        let timeout =
            Duration::from_secs(step.timeout_seconds.unwrap_or(DEFAULT_STEP_TIMEOUT_SECONDS));
        match run_shell(&command, &self.work_dir, timeout) {
            Ok(output) if output.exit_code == 0 => {
                let mut result = Map::new();
                result.insert(
                    "stdout".to_string(),
                    Value::String(bounded_output(output.stdout.trim_end())),
                );
                result.insert("exit_code".to_string(), Value::from(0));
                StepResult::Done(Value::Object(result))
            }
            Ok(output) => StepResult::Failed(format!(
                "command exited with status {}: {}",
                output.exit_code,
                output.stderr.trim()
            )),
            Err(err) => StepResult::Failed(err.to_string()),
        }
    }

    fn run_prompt(
        &self,
        template: &str,
        scope: &Map<String, Value>,
        step: &PipelineStep,
    ) -> StepResult {
        let prompt = render_template(template, scope);
        let timeout =
            Duration::from_secs(step.timeout_seconds.unwrap_or(DEFAULT_STEP_TIMEOUT_SECONDS));
        match self.prompts.run_prompt(&prompt, timeout) {
            Ok(text) => {
                let mut result = Map::new();
                result.insert("text".to_string(), Value::String(bounded_output(&text)));
                StepResult::Done(Value::Object(result))
            }
            Err(err) => StepResult::Failed(err),
        }
    }

    /// Drives (or starts) the child execution behind an `invoke_pipeline`
    /// step. A waiting child propagates its token upward; the parent
    /// suspends without a token of its own.
    fn run_nested(
        &self,
        pipeline_name: &str,
        execution: &PipelineExecution,
        step: &PipelineStep,
        step_input: &Option<Value>,
        now: i64,
    ) -> Result<StepResult, EngineError> {
        let outcome = match self.store.find_child(&execution.id, &step.id)? {
            Some(child) => match child.status {
                ExecutionStatus::Completed => {
                    return Ok(StepResult::Done(Value::Object(child.outputs)))
                }
                ExecutionStatus::Failed => {
                    return Ok(StepResult::Failed(format!(
                        "nested pipeline `{}` failed",
                        child.pipeline_name
                    )))
                }
                ExecutionStatus::Cancelled => {
                    return Ok(StepResult::Failed(format!(
                        "nested pipeline `{}` was cancelled",
                        child.pipeline_name
                    )))
                }
                // Still in flight: re-drive it through `resume`, which takes
                // the child's own lock (always parent before child, so the
                // ordering cannot deadlock).
                _ => self.resume(&child.id, now)?,
            },
            None => {
                let definition = self.loader.load_pipeline(pipeline_name)?;
                // The `input` reference supplies the child's inputs when it
                // resolves to an object; otherwise the parent's inputs flow
                // through unchanged.
                let child_inputs = match step_input {
                    Some(Value::Object(map)) => map.clone(),
                    _ => execution.inputs.clone(),
                };
                let child_inputs = resolve_inputs(&definition, child_inputs)?;
                let child = self.store.create(
                    &definition.name,
                    &execution.project_id,
                    child_inputs,
                    execution.session_id.as_deref(),
                    Some((&execution.id, &step.id)),
                    now,
                )?;
                let _guard = self.locks.acquire(&child.id);
                self.run(&definition, child, now)?
            }
        };

        Ok(match outcome {
            ExecutionOutcome::Completed(child) => StepResult::Done(Value::Object(child.outputs)),
            ExecutionOutcome::Failed(child) => {
                StepResult::Failed(format!("nested pipeline `{}` failed", child.pipeline_name))
            }
            ExecutionOutcome::WaitingApproval { pending, .. } => StepResult::Suspended(pending),
        })
    }

    fn suspend(
        &self,
        mut execution: PipelineExecution,
        step_id: &str,
        token: String,
        message: String,
        now: i64,
    ) -> Result<ExecutionOutcome, EngineError> {
        execution.status = ExecutionStatus::WaitingApproval;
        execution.resume_token = Some(token.clone());
        execution.updated_at = now;
        self.store.persist(&execution)?;
        log_event(
            self.store.state_root(),
            "pipeline.approval.requested",
            &[
                ("executionId", Value::String(execution.id.clone())),
                ("stepId", Value::String(step_id.to_string())),
            ],
        );
        let pending = ApprovalPending {
            execution_id: execution.id.clone(),
            step_id: step_id.to_string(),
            token,
            message,
        };
        Ok(ExecutionOutcome::WaitingApproval { execution, pending })
    }

    fn suspend_nested(
        &self,
        mut execution: PipelineExecution,
        pending: ApprovalPending,
        now: i64,
    ) -> Result<ExecutionOutcome, EngineError> {
        execution.status = ExecutionStatus::WaitingApproval;
        execution.resume_token = Some(pending.token.clone());
        execution.updated_at = now;
        self.store.persist(&execution)?;
        Ok(ExecutionOutcome::WaitingApproval { execution, pending })
    }
}

fn resolve_inputs(
    definition: &PipelineDefinition,
    mut provided: Map<String, Value>,
) -> Result<Map<String, Value>, EngineError> {
    for (name, input) in &definition.inputs {
        if provided.contains_key(name) {
            continue;
        }
        if let Some(default) = &input.default {
            provided.insert(name.clone(), default.clone());
        } else if input.required {
            return Err(EngineError::MissingRequiredInput {
                pipeline: definition.name.clone(),
                input: name.clone(),
            });
        }
    }
    Ok(provided)
}

fn approval_message(step: &PipelineStep) -> String {
    step.approval
        .as_ref()
        .map(gate_message)
        .unwrap_or_default()
}

fn gate_message(gate: &ApprovalGate) -> String {
    if gate.message.is_empty() {
        "approval required".to_string()
    } else {
        gate.message.clone()
    }
}

/// Resolves a dotted path (`step_id` or `step_id.field`) against the
/// accumulated variable set.
fn resolve_path(reference: &str, variables: &Map<String, Value>) -> Option<Value> {
    let mut segments = reference.split('.');
    let mut current = variables.get(segments.next()?)?;
    for segment in segments {
        current = current.get(segment)?;
    }
    Some(current.clone())
}

/// Substitutes `{{ path }}` placeholders with values from the scope.
/// Strings render verbatim, other values as compact JSON; unresolved
/// placeholders render empty.
pub fn render_template(template: &str, scope: &Map<String, Value>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            out.push_str(&rest[start..]);
            return out;
        };
        let path = after[..end].trim();
        match resolve_path(path, scope) {
            Some(Value::String(text)) => out.push_str(&text),
            Some(value) => out.push_str(&serde_json::to_string(&value).unwrap_or_default()),
            None => {}
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope(entries: &[(&str, Value)]) -> Map<String, Value> {
        entries
            .iter()
            .map(|(key, value)| (key.to_string(), value.clone()))
            .collect()
    }

    #[test]
    fn template_renders_strings_and_json() {
        let scope = scope(&[
            ("name", json!("world")),
            ("build", json!({"stdout": "ok", "exit_code": 0})),
        ]);
        assert_eq!(render_template("hello {{ name }}", &scope), "hello world");
        assert_eq!(
            render_template("out={{ build.stdout }}", &scope),
            "out=ok"
        );
        assert_eq!(render_template("n={{ build.exit_code }}", &scope), "n=0");
        assert_eq!(render_template("missing=[{{ nope }}]", &scope), "missing=[]");
    }

    #[test]
    fn unterminated_placeholder_is_left_verbatim() {
        let scope = Map::new();
        assert_eq!(render_template("a {{ b", &scope), "a {{ b");
    }

    #[test]
    fn dotted_path_resolution() {
        let scope = scope(&[("step", json!({"out": {"code": 3}}))]);
        assert_eq!(resolve_path("step.out.code", &scope), Some(json!(3)));
        assert_eq!(resolve_path("step.missing", &scope), None);
    }
}
