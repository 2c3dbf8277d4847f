use agentwarden::core::{CoreOptions, OrchestratorCore};
use agentwarden::orchestration::actions::{
    NoopActionExecutor, UnconfiguredAgentSpawner, UnconfiguredPromptRunner,
};
use agentwarden::orchestration::event::{Decision, Event, EventKind, ToolCall};
use agentwarden::pipeline::executor::ExecutionOutcome;
use agentwarden::pipeline::store::ExecutionStatus;
use agentwarden::scheduler::{NewJob, RunStatus, Schedule};
use serde_json::{json, Map};
use std::fs;
use tempfile::{tempdir, TempDir};

fn core() -> (TempDir, OrchestratorCore) {
    let root = tempdir().expect("tempdir");
    let workflows = root.path().join("workflows/definitions");
    let pipelines = root.path().join("pipelines/definitions");
    fs::create_dir_all(&workflows).expect("workflows dir");
    fs::create_dir_all(&pipelines).expect("pipelines dir");

    fs::write(
        workflows.join("guarded.yaml"),
        r#"
name: guarded
type: step
priority: 5
rule_definitions:
  no_edits:
    tools: [Edit]
    reason: read-only session
    action: block
steps:
  - name: main
    check_rules: [no_edits]
"#,
    )
    .expect("write workflow");

    fs::write(
        pipelines.join("release.yaml"),
        r#"
name: release
outputs:
  built: "build.stdout"
steps:
  - id: build
    exec: "echo build"
  - id: deploy
    exec: "echo deploy"
    approval:
      required: true
"#,
    )
    .expect("write pipeline");

    let core = OrchestratorCore::new(
        CoreOptions::rooted(root.path()),
        Box::new(NoopActionExecutor),
        Box::new(UnconfiguredPromptRunner),
        Box::new(UnconfiguredAgentSpawner),
    );
    (root, core)
}

fn edit_event(session: &str, now: i64) -> Event {
    Event {
        kind: EventKind::BeforeToolCall,
        session_id: session.to_string(),
        tool_call: Some(ToolCall {
            tool: "Edit".to_string(),
            mcp_server: None,
            command: None,
            arguments: Map::new(),
        }),
        fields: Map::new(),
        timestamp: now,
    }
}

#[test]
fn core_boundary_module_routes_hook_events_through_the_engine() {
    let (_root, core) = core();
    core.activate_workflow("sess-1", "guarded", 100)
        .expect("activate");

    let decision = core.handle_event(&edit_event("sess-1", 101)).expect("handle");
    assert_eq!(
        decision,
        Decision::Block {
            reason: "read-only session".to_string(),
        }
    );

    core.clear_session("sess-1").expect("clear");
    // With no state, the highest-priority definition applies to the fresh
    // session and the rule blocks again.
    let decision = core.handle_event(&edit_event("sess-1", 102)).expect("handle");
    assert!(decision.is_blocking());
}

#[test]
fn core_boundary_module_drives_a_pipeline_through_approval() {
    let (_root, core) = core();

    let outcome = core
        .run_pipeline("release", Map::new(), "proj", Some("sess-1"), 100)
        .expect("run pipeline");
    let ExecutionOutcome::WaitingApproval { execution, pending } = outcome else {
        panic!("expected suspension");
    };

    let status = core.execution_status(&execution.id).expect("status");
    assert_eq!(status.status, ExecutionStatus::WaitingApproval);
    assert_eq!(status.session_id.as_deref(), Some("sess-1"));

    let outcome = core
        .approve_pipeline_step(&pending.token, Some("ops"), 200)
        .expect("approve");
    let ExecutionOutcome::Completed(completed) = outcome else {
        panic!("expected completion");
    };
    assert_eq!(completed.outputs["built"], json!("build"));

    let outcome = core.resume_pipeline(&execution.id, 300).expect("resume");
    assert!(matches!(outcome, ExecutionOutcome::Completed(_)));
}

#[test]
fn core_boundary_module_ticks_jobs_from_the_shared_root() {
    let (_root, core) = core();
    let mut config = Map::new();
    config.insert("pipeline".to_string(), json!("release"));
    let job = NewJob {
        project_id: "proj".to_string(),
        schedule: Schedule::Once { run_at: 50 },
        action_type: "pipeline".to_string(),
        action_config: config,
        max_retries: 0,
        backoff_seconds: 0,
    };
    core.jobs().create(job, 0).expect("create job");

    let runs = core.run_due_jobs(100).expect("tick");
    assert_eq!(runs.len(), 1);
    // The release pipeline suspends on its approval gate; the job run
    // still completes with that status as its result.
    assert_eq!(runs[0].status, RunStatus::Completed);
    assert!(runs[0]
        .output
        .as_ref()
        .expect("output")
        .contains("waiting_approval"));
}
