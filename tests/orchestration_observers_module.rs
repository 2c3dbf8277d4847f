use agentwarden::config::Observer;
use agentwarden::orchestration::event::{Event, EventKind, ToolCall};
use agentwarden::orchestration::observers::apply;
use agentwarden::orchestration::state_store::WorkflowState;
use serde_json::{json, Map, Value};
use tempfile::tempdir;

fn tool_event(kind: EventKind, tool: &str, arguments: &[(&str, Value)]) -> Event {
    Event {
        kind,
        session_id: "sess-1".to_string(),
        tool_call: Some(ToolCall {
            tool: tool.to_string(),
            mcp_server: None,
            command: None,
            arguments: arguments
                .iter()
                .map(|(key, value)| (key.to_string(), value.clone()))
                .collect(),
        }),
        fields: Map::new(),
        timestamp: 100,
    }
}

fn observer(yaml: &str) -> Observer {
    serde_yaml::from_str(yaml).expect("parse observer")
}

#[test]
fn observers_module_declarative_set_assigns_variables() {
    let temp = tempdir().expect("tempdir");
    let declarative = observer(
        r#"
on: after_tool_call
match:
  tool: Bash
set:
  ran_bash: "true"
  bash_runs: "bash_runs + 1"
"#,
    );
    let mut state = WorkflowState::new("sess-1", "review", 100);
    state.variables.insert("bash_runs".to_string(), json!(2));

    let event = tool_event(EventKind::AfterToolCall, "Bash", &[]);
    apply(temp.path(), &event, &[declarative.clone()], &mut state);
    assert_eq!(state.variables["ran_bash"], json!(true));
    assert_eq!(state.variables["bash_runs"], json!(3));

    // Different tool: the match map rejects the event.
    let other = tool_event(EventKind::AfterToolCall, "Edit", &[]);
    apply(temp.path(), &other, &[declarative], &mut state);
    assert_eq!(state.variables["bash_runs"], json!(3));
}

#[test]
fn observers_module_errors_are_swallowed_not_raised() {
    let temp = tempdir().expect("tempdir");
    let declarative = observer(
        r#"
on: after_tool_call
set:
  good: "1 + 1"
  bad: "1 +"
"#,
    );
    let mut state = WorkflowState::new("sess-1", "review", 100);

    let event = tool_event(EventKind::AfterToolCall, "Bash", &[]);
    apply(temp.path(), &event, &[declarative], &mut state);
    assert_eq!(state.variables["good"], json!(2));
    assert!(!state.variables.contains_key("bad"));
}

#[test]
fn observers_module_task_claim_tracker_sets_claimed_state() {
    let temp = tempdir().expect("tempdir");
    let behavior = observer("behavior: task_claim_tracker");
    let mut state = WorkflowState::new("sess-1", "review", 100);

    let event = tool_event(
        EventKind::AfterToolCall,
        "task_update",
        &[("status", json!("in_progress")), ("task_id", json!("T-9"))],
    );
    apply(temp.path(), &event, &[behavior], &mut state);
    assert_eq!(state.variables["task_claimed"], json!(true));
    assert_eq!(state.artifacts["claimed_task_id"], json!("T-9"));
}

#[test]
fn observers_module_edited_file_tracker_deduplicates_paths() {
    let temp = tempdir().expect("tempdir");
    let behavior = observer("behavior: edited_file_tracker");
    let mut state = WorkflowState::new("sess-1", "review", 100);

    for path in ["src/lib.rs", "src/main.rs", "src/lib.rs"] {
        let event = tool_event(
            EventKind::AfterToolCall,
            "Edit",
            &[("file_path", json!(path))],
        );
        apply(temp.path(), &event, std::slice::from_ref(&behavior), &mut state);
    }

    assert_eq!(
        state.artifacts["edited_files"],
        json!(["src/lib.rs", "src/main.rs"])
    );
    assert_eq!(state.variables["files_edited"], json!(2));
}

#[test]
fn observers_module_plan_mode_tracker_follows_entry_and_exit() {
    let temp = tempdir().expect("tempdir");
    let behavior = observer("behavior: plan_mode_tracker");
    let mut state = WorkflowState::new("sess-1", "review", 100);

    let enter = tool_event(EventKind::BeforeToolCall, "EnterPlanMode", &[]);
    apply(temp.path(), &enter, std::slice::from_ref(&behavior), &mut state);
    assert_eq!(state.variables["plan_mode"], json!(true));

    let exit = tool_event(EventKind::BeforeToolCall, "ExitPlanMode", &[]);
    apply(temp.path(), &exit, std::slice::from_ref(&behavior), &mut state);
    assert_eq!(state.variables["plan_mode"], json!(false));
}
