//! The trigger dispatcher: advances per-session workflow state machines,
//! runs observers and trigger actions, and gates tool calls through the
//! rule engine.
//!
//! Failure policy: broken or missing policy configuration must never block
//! a legitimate session (fail-open, logged); persistence failures are the
//! one class surfaced to the caller.

use crate::config::{WorkflowLibrary, WorkflowStep};
use crate::expr;
use crate::orchestration::actions::{ActionContext, ActionExecutor, ActionOutcome};
use crate::orchestration::error::EngineError;
use crate::orchestration::event::{Decision, Event, EventKind};
use crate::orchestration::observers;
use crate::orchestration::rules::{self, RuleDecision};
use crate::orchestration::state_store::{WorkflowState, WorkflowStateStore};
use crate::shared::logging::{log_diagnostic, log_event};
use serde_json::{Map, Value};

pub struct WorkflowEngine {
    state_store: WorkflowStateStore,
    library: WorkflowLibrary,
    actions: Box<dyn ActionExecutor>,
}

impl WorkflowEngine {
    pub fn new(
        state_store: WorkflowStateStore,
        library: WorkflowLibrary,
        actions: Box<dyn ActionExecutor>,
    ) -> Self {
        Self {
            state_store,
            library,
            actions,
        }
    }

    pub fn library(&self) -> &WorkflowLibrary {
        &self.library
    }

    /// Explicitly activates a named workflow for a session, replacing any
    /// existing state.
    pub fn activate(
        &self,
        session_id: &str,
        workflow_name: &str,
        now: i64,
    ) -> Result<WorkflowState, EngineError> {
        let resolved = self
            .library
            .get(workflow_name)
            .ok_or_else(|| EngineError::Config(format!("unknown workflow `{workflow_name}`")))?;
        let mut state = WorkflowState::new(session_id, workflow_name, now);
        seed_state(&mut state, resolved);
        self.state_store.persist(&state)?;
        Ok(state)
    }

    /// Explicit clear: drops the session's workflow state.
    pub fn clear_session(&self, session_id: &str) -> Result<(), EngineError> {
        self.state_store.delete(session_id)
    }

    /// Hook-dispatch entry point: every session event flows through here.
    pub fn handle_event(&self, event: &Event) -> Result<Decision, EngineError> {
        let state_root = self.state_store.state_root().to_path_buf();

        let mut state = match self.state_store.load(&event.session_id)? {
            Some(state) => state,
            None => {
                let Some(default) = self.library.default_workflow() else {
                    // No state, no applicable definition: nothing to enforce.
                    return Ok(Decision::Allow);
                };
                let mut state = WorkflowState::new(
                    &event.session_id,
                    &default.definition.name,
                    event.timestamp,
                );
                seed_state(&mut state, default);
                state
            }
        };

        if state.disabled {
            return Ok(Decision::Allow);
        }

        let Some(resolved) = self.library.get(&state.workflow_name) else {
            log_diagnostic(
                &state_root,
                "workflow_engine",
                &format!(
                    "session `{}` references unresolved workflow `{}`; allowing event",
                    event.session_id, state.workflow_name
                ),
            );
            return Ok(Decision::Allow);
        };

        state.total_action_count += 1;
        if event.kind.is_tool_related() {
            state.step_action_count += 1;
        }

        observers::apply(&state_root, event, &resolved.observers, &mut state);

        if let Some(trigger_actions) = resolved.definition.triggers.get(&event.kind) {
            for action in trigger_actions {
                let context = ActionContext {
                    session_id: &event.session_id,
                    event,
                    variables: &state.variables,
                };
                match self.actions.execute(&action.action, &action.params, &context) {
                    Ok(ActionOutcome::Continue { set_variables }) => {
                        for (key, value) in set_variables {
                            state.variables.insert(key, value);
                        }
                    }
                    Ok(ActionOutcome::Abort { reason }) => {
                        log_event(
                            &state_root,
                            "workflow.trigger.aborted",
                            &[
                                ("sessionId", Value::String(event.session_id.clone())),
                                ("action", Value::String(action.action.clone())),
                                ("reason", Value::String(reason)),
                            ],
                        );
                        break;
                    }
                    Err(err) => {
                        // One bad action must not stall the session.
                        log_diagnostic(
                            &state_root,
                            "workflow_engine",
                            &format!(
                                "action `{}` failed for session `{}`: {err}",
                                action.action, event.session_id
                            ),
                        );
                    }
                }
            }
        }

        let mut decision = Decision::Allow;
        if event.kind == EventKind::BeforeToolCall {
            if let Some(tool_call) = &event.tool_call {
                let current_step = state
                    .step
                    .as_deref()
                    .and_then(|name| resolved.definition.step(name));
                decision = match current_step {
                    Some(step) => {
                        self.check_step_policy(&state_root, &state, step, resolved, tool_call, event)
                    }
                    None => Decision::Allow,
                };
            }
        }

        if let Some(step_name) = state.step.clone() {
            if let Some(step) = resolved.definition.step(&step_name) {
                let context = eval_context(&state, event);
                let mut transitioned = false;
                for transition in &step.transitions {
                    let fired = expr::evaluate_predicate(&transition.when, &context)
                        .unwrap_or_else(|err| {
                            log_diagnostic(
                                &state_root,
                                "workflow_engine",
                                &format!(
                                    "transition `{}` -> `{}` skipped: {err}",
                                    step_name, transition.to
                                ),
                            );
                            false
                        });
                    if fired {
                        log_event(
                            &state_root,
                            "workflow.step.transition",
                            &[
                                ("sessionId", Value::String(state.session_id.clone())),
                                ("from", Value::String(step_name.clone())),
                                ("to", Value::String(transition.to.clone())),
                            ],
                        );
                        state.step = Some(transition.to.clone());
                        state.step_action_count = 0;
                        transitioned = true;
                        break;
                    }
                }

                // Terminal condition: no viable transition and the
                // workflow-level exit condition holds. The machine goes
                // inert; the engine never forces a teardown.
                if !transitioned {
                    if let Some(exit) = &resolved.definition.exit_condition {
                        let done = expr::evaluate_predicate(exit, &context).unwrap_or(false);
                        if done {
                            log_event(
                                &state_root,
                                "workflow.completed",
                                &[
                                    ("sessionId", Value::String(state.session_id.clone())),
                                    ("workflow", Value::String(state.workflow_name.clone())),
                                ],
                            );
                            state.step = None;
                        }
                    }
                }
            }
        }

        state.updated_at = event.timestamp;
        if event.kind == EventKind::SessionStop {
            self.state_store.delete(&event.session_id)?;
        } else {
            self.state_store.persist(&state)?;
        }

        Ok(decision)
    }

    fn check_step_policy(
        &self,
        state_root: &std::path::Path,
        state: &WorkflowState,
        step: &WorkflowStep,
        resolved: &crate::config::ResolvedWorkflow,
        tool_call: &crate::orchestration::event::ToolCall,
        event: &Event,
    ) -> Decision {
        if let Some(allowed) = &step.allowed_tools {
            if !allowed.iter().any(|tool| tool == &tool_call.tool) {
                return Decision::Block {
                    reason: format!(
                        "tool `{}` is not permitted during step `{}`",
                        tool_call.tool, step.name
                    ),
                };
            }
        }

        let step_rules = resolved.step_rules(step);
        for missing in step
            .check_rules
            .iter()
            .filter(|name| !resolved.rule_definitions.contains_key(*name))
        {
            log_diagnostic(
                state_root,
                "rule_engine",
                &format!("step `{}` references unknown rule `{missing}`", step.name),
            );
        }

        let context = eval_context(state, event);
        let report = rules::check(tool_call, &step_rules, &context);
        for skipped in &report.skipped {
            log_diagnostic(state_root, "rule_engine", skipped);
        }
        match report.decision {
            RuleDecision::AllowDefault | RuleDecision::AllowRule { .. } => Decision::Allow,
            RuleDecision::Warn { rule, reason } => {
                log_event(
                    state_root,
                    "workflow.rule.warn",
                    &[
                        ("sessionId", Value::String(state.session_id.clone())),
                        ("rule", Value::String(rule)),
                    ],
                );
                Decision::Warn { reason }
            }
            RuleDecision::Block { rule, reason } => {
                log_event(
                    state_root,
                    "workflow.rule.block",
                    &[
                        ("sessionId", Value::String(state.session_id.clone())),
                        ("rule", Value::String(rule)),
                    ],
                );
                Decision::Block { reason }
            }
        }
    }
}

fn seed_state(state: &mut WorkflowState, resolved: &crate::config::ResolvedWorkflow) {
    for (key, value) in &resolved.definition.session_variables {
        state.variables.insert(key.clone(), value.clone());
    }
    for (key, value) in &resolved.definition.variables {
        state.variables.insert(key.clone(), value.clone());
    }
    state.step = resolved.definition.first_step_name().map(str::to_string);
}

/// Expression context visible to rule `when` clauses, transition conditions
/// and declarative observers: flat variables plus the event view and the
/// engine counters.
fn eval_context(state: &WorkflowState, event: &Event) -> Map<String, Value> {
    let mut context = state.variables.clone();
    context.insert(
        "step_action_count".to_string(),
        Value::from(state.step_action_count),
    );
    context.insert(
        "total_action_count".to_string(),
        Value::from(state.total_action_count),
    );
    if let Some(step) = &state.step {
        context.insert("step".to_string(), Value::String(step.clone()));
    }
    context.insert("event".to_string(), Value::Object(event.field_view()));
    context
}
