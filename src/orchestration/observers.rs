//! Observer dispatch: declarative variable mutations and engine-native
//! behaviors applied as a side effect of event handling. Observers never
//! block the event pipeline and never raise; failures are logged.

use crate::config::{BuiltinBehavior, DeclarativeObserver, Observer};
use crate::expr;
use crate::orchestration::event::{Event, EventKind};
use crate::orchestration::state_store::WorkflowState;
use crate::shared::logging::log_diagnostic;
use serde_json::Value;
use std::path::Path;

pub fn apply(
    state_root: &Path,
    event: &Event,
    observers: &[Observer],
    state: &mut WorkflowState,
) {
    for observer in observers {
        match observer {
            Observer::Declarative(declarative) => {
                apply_declarative(state_root, event, declarative, state);
            }
            Observer::Behavior(behavior) => apply_behavior(*behavior, event, state),
        }
    }
}

fn apply_declarative(
    state_root: &Path,
    event: &Event,
    observer: &DeclarativeObserver,
    state: &mut WorkflowState,
) {
    if event.kind != observer.on {
        return;
    }
    let view = event.field_view();
    for (field, expected) in &observer.match_fields {
        if view.get(field) != Some(expected) {
            return;
        }
    }

    let mut context = state.variables.clone();
    context.insert("event".to_string(), Value::Object(view));

    for (variable, expression) in &observer.set {
        match expr::evaluate(expression, &context) {
            Ok(value) => {
                state.variables.insert(variable.clone(), value.clone());
                // Later `set` entries in the same observer see the update.
                context.insert(variable.clone(), value);
            }
            Err(err) => {
                log_diagnostic(
                    state_root,
                    "observer",
                    &format!(
                        "set `{variable}` skipped for session `{}`: {err}",
                        state.session_id
                    ),
                );
            }
        }
    }
}

fn apply_behavior(behavior: BuiltinBehavior, event: &Event, state: &mut WorkflowState) {
    match behavior {
        BuiltinBehavior::TaskClaimTracker => track_task_claim(event, state),
        BuiltinBehavior::PlanModeTracker => track_plan_mode(event, state),
        BuiltinBehavior::EditedFileTracker => track_edited_files(event, state),
    }
}

/// Detects tool calls that claim a task: an mcp `claim_task` invocation or
/// a task update moving a task to `in_progress`.
fn track_task_claim(event: &Event, state: &mut WorkflowState) {
    if event.kind != EventKind::AfterToolCall {
        return;
    }
    let Some(call) = &event.tool_call else {
        return;
    };
    let claimed = call.tool == "claim_task"
        || call
            .arguments
            .get("status")
            .and_then(Value::as_str)
            .map(|status| status == "in_progress")
            .unwrap_or(false);
    if !claimed {
        return;
    }
    state
        .variables
        .insert("task_claimed".to_string(), Value::Bool(true));
    if let Some(task_id) = call.arguments.get("task_id") {
        state
            .artifacts
            .insert("claimed_task_id".to_string(), task_id.clone());
    }
}

fn track_plan_mode(event: &Event, state: &mut WorkflowState) {
    if !event.kind.is_tool_related() {
        return;
    }
    let Some(call) = &event.tool_call else {
        return;
    };
    match call.tool.as_str() {
        "EnterPlanMode" => {
            state
                .variables
                .insert("plan_mode".to_string(), Value::Bool(true));
        }
        "ExitPlanMode" => {
            state
                .variables
                .insert("plan_mode".to_string(), Value::Bool(false));
        }
        _ => {}
    }
}

const EDITING_TOOLS: &[&str] = &["Edit", "Write", "MultiEdit", "NotebookEdit"];

fn track_edited_files(event: &Event, state: &mut WorkflowState) {
    if event.kind != EventKind::AfterToolCall {
        return;
    }
    let Some(call) = &event.tool_call else {
        return;
    };
    if !EDITING_TOOLS.contains(&call.tool.as_str()) {
        return;
    }
    let Some(path) = call.arguments.get("file_path").and_then(Value::as_str) else {
        return;
    };

    let edited = state
        .artifacts
        .entry("edited_files".to_string())
        .or_insert_with(|| Value::Array(Vec::new()));
    if let Value::Array(files) = edited {
        if !files.iter().any(|file| file.as_str() == Some(path)) {
            files.push(Value::String(path.to_string()));
        }
        let count = files.len();
        state
            .variables
            .insert("files_edited".to_string(), Value::from(count as u64));
    }
}
