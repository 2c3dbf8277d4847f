use agentwarden::config::{
    ConfigError, Observer, PipelineCatalog, WorkflowDefinition, WorkflowLibrary,
};
use std::fs;
use tempfile::tempdir;

fn definition(yaml: &str) -> WorkflowDefinition {
    serde_yaml::from_str(yaml).expect("parse definition")
}

#[test]
fn config_module_loads_valid_definitions_and_reports_broken_ones() {
    let temp = tempdir().expect("tempdir");
    fs::write(
        temp.path().join("review.yaml"),
        r#"
name: review
type: step
steps:
  - name: plan
"#,
    )
    .expect("write valid definition");
    fs::write(temp.path().join("broken.yaml"), "name: [unclosed")
        .expect("write broken definition");

    let library = WorkflowLibrary::load_dir(temp.path());
    assert!(library.get("review").is_some());
    assert_eq!(library.names(), vec!["review"]);
    assert!(!library.diagnostics.is_empty());
}

#[test]
fn config_module_merges_imported_rules_with_local_precedence() {
    let base = definition(
        r#"
name: base-policy
type: lifecycle
rule_definitions:
  no_rm:
    tools: [Bash]
    command_pattern: "rm -rf"
    reason: refusing recursive delete
    action: block
  shared:
    tools: [Edit]
    reason: imported reason
    action: warn
"#,
    );
    let child = definition(
        r#"
name: review
type: step
imports: [base-policy]
rule_definitions:
  shared:
    tools: [Edit]
    reason: local reason
    action: allow
steps:
  - name: work
    check_rules: [no_rm, shared]
"#,
    );

    let library = WorkflowLibrary::from_definitions(vec![base, child]);
    let resolved = library.get("review").expect("resolved workflow");
    assert!(resolved.rule_definitions.contains_key("no_rm"));
    assert_eq!(resolved.rule_definitions["shared"].reason, "local reason");
}

#[test]
fn config_module_unresolved_import_excludes_the_definition() {
    let child = definition(
        r#"
name: review
type: step
imports: [missing-policy]
steps:
  - name: work
"#,
    );

    let library = WorkflowLibrary::from_definitions(vec![child]);
    assert!(library.get("review").is_none());
    assert!(library
        .diagnostics
        .iter()
        .any(|diag| diag.contains("missing-policy")));
}

#[test]
fn config_module_default_workflow_prefers_highest_priority() {
    let low = definition("name: everyday\ntype: lifecycle\npriority: 1\n");
    let high = definition("name: strict\ntype: lifecycle\npriority: 10\n");
    let pipeline_kind = definition("name: deploys\ntype: pipeline\npriority: 99\n");

    let library = WorkflowLibrary::from_definitions(vec![low, high, pipeline_kind]);
    let default = library.default_workflow().expect("default workflow");
    assert_eq!(default.definition.name, "strict");
}

#[test]
fn config_module_observer_must_be_exactly_one_variant() {
    let both: Result<Observer, _> = serde_yaml::from_str(
        r#"
behavior: task_claim_tracker
on: after_tool_call
set:
  claimed: "true"
"#,
    );
    assert!(both.is_err());

    let neither: Result<Observer, _> = serde_yaml::from_str("{}");
    assert!(neither.is_err());

    let unknown: Result<Observer, _> = serde_yaml::from_str("behavior: telemetry_uploader");
    assert!(unknown.is_err());

    let behavior: Observer =
        serde_yaml::from_str("behavior: plan_mode_tracker").expect("behavior observer");
    assert!(matches!(behavior, Observer::Behavior(_)));
}

#[test]
fn config_module_transition_targets_are_validated() {
    let bad = definition(
        r#"
name: review
type: step
steps:
  - name: plan
    transitions:
      - to: nowhere
        when: "true"
"#,
    );
    let library = WorkflowLibrary::from_definitions(vec![bad]);
    assert!(library.get("review").is_none());
    assert!(library
        .diagnostics
        .iter()
        .any(|diag| diag.contains("nowhere")));
}

#[test]
fn config_module_pipeline_catalog_loads_and_validates() {
    let temp = tempdir().expect("tempdir");
    fs::write(
        temp.path().join("build.yaml"),
        r#"
name: build
steps:
  - id: compile
    exec: "make"
"#,
    )
    .expect("write pipeline");

    let catalog = PipelineCatalog::new(temp.path());
    let loaded = catalog.load("build").expect("load pipeline");
    assert_eq!(loaded.steps.len(), 1);

    assert!(matches!(
        catalog.load("missing"),
        Err(ConfigError::UnknownPipeline(_))
    ));
    assert!(matches!(
        catalog.load("../escape"),
        Err(ConfigError::Validation { .. })
    ));
    assert_eq!(catalog.list().expect("list"), vec!["build".to_string()]);
}

#[test]
fn config_module_pipeline_step_kind_is_exclusive() {
    let temp = tempdir().expect("tempdir");
    fs::write(
        temp.path().join("mixed.yaml"),
        r#"
name: mixed
steps:
  - id: both
    exec: "make"
    prompt: "summarize"
"#,
    )
    .expect("write pipeline");

    let catalog = PipelineCatalog::new(temp.path());
    assert!(matches!(
        catalog.load("mixed"),
        Err(ConfigError::Parse { .. })
    ));
}
