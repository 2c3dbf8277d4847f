//! Declarative configuration: workflow definitions (policy) and pipeline
//! definitions, loaded from YAML directories.
//!
//! Loading is fail-open per file: a malformed definition is excluded and
//! reported as a diagnostic, it never takes the daemon down.

use crate::orchestration::event::EventKind;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid definition `{name}`: {reason}")]
    Validation { name: String, reason: String },
    #[error("definition `{name}` imports unknown definition `{import}`")]
    UnresolvedImport { name: String, import: String },
    #[error("unknown pipeline `{0}`")]
    UnknownPipeline(String),
}

// ---------------------------------------------------------------------------
// Workflow definitions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowKind {
    /// Trigger-only definitions with no step progression.
    Lifecycle,
    /// Step-machine definitions that advance through `steps`.
    Step,
    /// Definitions that exist to drive pipelines; no tool policy.
    Pipeline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    Block,
    Allow,
    Warn,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDefinition {
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub mcp_tools: Vec<String>,
    #[serde(default)]
    pub when: Option<String>,
    #[serde(default)]
    pub command_pattern: Option<String>,
    #[serde(default)]
    pub command_not_pattern: Option<String>,
    #[serde(default)]
    pub reason: String,
    pub action: RuleAction,
}

/// Engine-native detections that are cheaper to implement in code than to
/// express declaratively. The set is closed; unknown names fail the
/// definition's load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuiltinBehavior {
    /// Sets `task_claimed` when a tool call claims a task.
    TaskClaimTracker,
    /// Tracks plan-mode entry/exit in `plan_mode`.
    PlanModeTracker,
    /// Accumulates edited file paths into the `edited_files` artifact.
    EditedFileTracker,
}

impl BuiltinBehavior {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "task_claim_tracker" => Some(Self::TaskClaimTracker),
            "plan_mode_tracker" => Some(Self::PlanModeTracker),
            "edited_file_tracker" => Some(Self::EditedFileTracker),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeclarativeObserver {
    pub on: EventKind,
    /// Field -> expected-value equality constraints; matches all events of
    /// the `on` kind when empty.
    pub match_fields: BTreeMap<String, Value>,
    /// Variable name -> expression evaluated against `{variables, event}`.
    pub set: BTreeMap<String, String>,
}

/// Exactly one of the two variants; the raw-struct deserializer rejects
/// observers that populate both or neither.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Observer {
    Behavior(BuiltinBehavior),
    Declarative(DeclarativeObserver),
}

#[derive(Debug, Clone, Deserialize)]
struct ObserverRaw {
    #[serde(default)]
    behavior: Option<String>,
    #[serde(default)]
    on: Option<EventKind>,
    #[serde(default, rename = "match")]
    match_fields: Option<BTreeMap<String, Value>>,
    #[serde(default)]
    set: Option<BTreeMap<String, String>>,
}

impl<'de> Deserialize<'de> for Observer {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = ObserverRaw::deserialize(deserializer)?;
        let declarative = raw.on.is_some() || raw.set.is_some() || raw.match_fields.is_some();
        match (raw.behavior, declarative) {
            (Some(_), true) => Err(D::Error::custom(
                "observer must use either `behavior` or `on`/`set`, not both",
            )),
            (None, false) => Err(D::Error::custom(
                "observer must declare `behavior` or `on`/`set`",
            )),
            (Some(name), false) => BuiltinBehavior::parse(&name)
                .map(Observer::Behavior)
                .ok_or_else(|| D::Error::custom(format!("unknown observer behavior `{name}`"))),
            (None, true) => {
                let on = raw
                    .on
                    .ok_or_else(|| D::Error::custom("declarative observer requires `on`"))?;
                let set = raw
                    .set
                    .ok_or_else(|| D::Error::custom("declarative observer requires `set`"))?;
                Ok(Observer::Declarative(DeclarativeObserver {
                    on,
                    match_fields: raw.match_fields.unwrap_or_default(),
                    set,
                }))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub to: String,
    pub when: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// None means every tool is permitted by step policy; rules still apply.
    #[serde(default)]
    pub allowed_tools: Option<Vec<String>>,
    #[serde(default)]
    pub check_rules: Vec<String>,
    #[serde(default)]
    pub transitions: Vec<Transition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerAction {
    pub action: String,
    #[serde(default)]
    pub params: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: WorkflowKind,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Higher wins when several lifecycle definitions could apply.
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub steps: Vec<WorkflowStep>,
    #[serde(default)]
    pub triggers: BTreeMap<EventKind, Vec<TriggerAction>>,
    #[serde(default)]
    pub rule_definitions: BTreeMap<String, RuleDefinition>,
    #[serde(default)]
    pub observers: Vec<Observer>,
    /// Defaults shared across workflows active in the same session.
    #[serde(default)]
    pub session_variables: Map<String, Value>,
    /// Defaults private to this definition.
    #[serde(default)]
    pub variables: Map<String, Value>,
    #[serde(default)]
    pub imports: Vec<String>,
    /// Workflow-level exit condition; once true on a step with no viable
    /// transitions, the machine is inert.
    #[serde(default)]
    pub exit_condition: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl WorkflowDefinition {
    pub fn step(&self, name: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|step| step.name == name)
    }

    pub fn first_step_name(&self) -> Option<&str> {
        match self.kind {
            WorkflowKind::Lifecycle => None,
            _ => self.steps.first().map(|step| step.name.as_str()),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::Validation {
            name: self.name.clone(),
            reason,
        };
        if self.name.trim().is_empty() {
            return Err(ConfigError::Validation {
                name: "<unnamed>".to_string(),
                reason: "definition name must be non-empty".to_string(),
            });
        }
        let mut seen = std::collections::BTreeSet::new();
        for step in &self.steps {
            if !seen.insert(step.name.as_str()) {
                return Err(invalid(format!("duplicate step `{}`", step.name)));
            }
        }
        for step in &self.steps {
            for transition in &step.transitions {
                if self.step(&transition.to).is_none() {
                    return Err(invalid(format!(
                        "step `{}` transitions to unknown step `{}`",
                        step.name, transition.to
                    )));
                }
            }
        }
        Ok(())
    }
}

/// A workflow definition after import resolution: the definition itself
/// plus the merged rule and observer sets referenced during dispatch.
#[derive(Debug, Clone)]
pub struct ResolvedWorkflow {
    pub definition: WorkflowDefinition,
    pub rule_definitions: BTreeMap<String, RuleDefinition>,
    pub observers: Vec<Observer>,
}

impl ResolvedWorkflow {
    /// Rules referenced by a step, in declared order, skipping names that
    /// resolve nowhere (reported by the engine as diagnostics).
    pub fn step_rules<'a>(
        &'a self,
        step: &'a WorkflowStep,
    ) -> Vec<(&'a str, &'a RuleDefinition)> {
        step.check_rules
            .iter()
            .filter_map(|name| {
                self.rule_definitions
                    .get(name)
                    .map(|rule| (name.as_str(), rule))
            })
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct WorkflowLibrary {
    resolved: BTreeMap<String, ResolvedWorkflow>,
    /// Per-file / per-definition load failures; operator-facing.
    pub diagnostics: Vec<String>,
}

impl WorkflowLibrary {
    pub fn from_definitions(definitions: Vec<WorkflowDefinition>) -> Self {
        let mut library = Self::default();
        let mut valid: BTreeMap<String, WorkflowDefinition> = BTreeMap::new();
        for definition in definitions {
            match definition.validate() {
                Ok(()) => {
                    if valid
                        .insert(definition.name.clone(), definition.clone())
                        .is_some()
                    {
                        library
                            .diagnostics
                            .push(format!("duplicate workflow definition `{}`", definition.name));
                    }
                }
                Err(err) => library.diagnostics.push(err.to_string()),
            }
        }

        for definition in valid.values() {
            match resolve_imports(definition, &valid) {
                Ok(resolved) => {
                    library
                        .resolved
                        .insert(definition.name.clone(), resolved);
                }
                Err(err) => library.diagnostics.push(err.to_string()),
            }
        }
        library
    }

    pub fn load_dir(dir: &Path) -> Self {
        let mut definitions = Vec::new();
        let mut io_diagnostics = Vec::new();
        match list_yaml_files(dir) {
            Ok(paths) => {
                for path in paths {
                    match load_yaml_file::<WorkflowDefinition>(&path) {
                        Ok(definition) => definitions.push(definition),
                        Err(err) => io_diagnostics.push(err.to_string()),
                    }
                }
            }
            Err(err) => io_diagnostics.push(err.to_string()),
        }
        let mut library = Self::from_definitions(definitions);
        library.diagnostics.splice(0..0, io_diagnostics);
        library
    }

    pub fn get(&self, name: &str) -> Option<&ResolvedWorkflow> {
        self.resolved.get(name)
    }

    /// Definition applied to sessions with no explicit workflow: highest
    /// priority enabled non-pipeline definition, name as tiebreaker.
    pub fn default_workflow(&self) -> Option<&ResolvedWorkflow> {
        self.resolved
            .values()
            .filter(|resolved| {
                resolved.definition.enabled
                    && resolved.definition.kind != WorkflowKind::Pipeline
            })
            .max_by(|a, b| {
                a.definition
                    .priority
                    .cmp(&b.definition.priority)
                    .then_with(|| b.definition.name.cmp(&a.definition.name))
            })
    }

    pub fn names(&self) -> Vec<&str> {
        self.resolved.keys().map(String::as_str).collect()
    }
}

fn resolve_imports(
    definition: &WorkflowDefinition,
    all: &BTreeMap<String, WorkflowDefinition>,
) -> Result<ResolvedWorkflow, ConfigError> {
    let mut rule_definitions = BTreeMap::new();
    let mut observers = Vec::new();

    for import in &definition.imports {
        let imported = all.get(import).ok_or_else(|| ConfigError::UnresolvedImport {
            name: definition.name.clone(),
            import: import.clone(),
        })?;
        for (name, rule) in &imported.rule_definitions {
            rule_definitions.insert(name.clone(), rule.clone());
        }
        observers.extend(imported.observers.iter().cloned());
    }

    // Local definitions win over imported ones.
    for (name, rule) in &definition.rule_definitions {
        rule_definitions.insert(name.clone(), rule.clone());
    }
    observers.extend(definition.observers.iter().cloned());

    for step in &definition.steps {
        for rule_name in &step.check_rules {
            let Some(rule) = rule_definitions.get(rule_name) else {
                return Err(ConfigError::Validation {
                    name: definition.name.clone(),
                    reason: format!(
                        "step `{}` references unknown rule `{rule_name}`",
                        step.name
                    ),
                });
            };
            if rule.tools.is_empty() && rule.mcp_tools.is_empty() {
                return Err(ConfigError::Validation {
                    name: definition.name.clone(),
                    reason: format!(
                        "referenced rule `{rule_name}` declares neither tools nor mcp_tools"
                    ),
                });
            }
        }
    }

    Ok(ResolvedWorkflow {
        definition: definition.clone(),
        rule_definitions,
        observers,
    })
}

// ---------------------------------------------------------------------------
// Pipeline definitions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineInput {
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalGate {
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub approvers: Vec<String>,
}

/// Exactly one kind per step; enforced by the raw deserializer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStepKind {
    /// Shell command template run with a bounded timeout.
    Exec(String),
    /// Prompt template delegated to the LLM collaborator.
    Prompt(String),
    /// Nested pipeline execution.
    InvokePipeline(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineStep {
    pub id: String,
    pub kind: PipelineStepKind,
    /// Reference to a prior step's output field, `step_id` or
    /// `step_id.field`; exposed to the template as `input`.
    pub input: Option<String>,
    /// Expression gating execution; false marks the step skipped.
    pub condition: Option<String>,
    pub timeout_seconds: Option<u64>,
    pub approval: Option<ApprovalGate>,
}

#[derive(Debug, Clone, Deserialize)]
struct PipelineStepRaw {
    id: String,
    #[serde(default)]
    exec: Option<String>,
    #[serde(default)]
    prompt: Option<String>,
    #[serde(default)]
    invoke_pipeline: Option<String>,
    #[serde(default)]
    input: Option<String>,
    #[serde(default)]
    condition: Option<String>,
    #[serde(default)]
    timeout_seconds: Option<u64>,
    #[serde(default)]
    approval: Option<ApprovalGate>,
}

impl<'de> Deserialize<'de> for PipelineStep {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = PipelineStepRaw::deserialize(deserializer)?;
        let kind = match (raw.exec, raw.prompt, raw.invoke_pipeline) {
            (Some(exec), None, None) => PipelineStepKind::Exec(exec),
            (None, Some(prompt), None) => PipelineStepKind::Prompt(prompt),
            (None, None, Some(name)) => PipelineStepKind::InvokePipeline(name),
            _ => {
                return Err(D::Error::custom(format!(
                    "pipeline step `{}` must declare exactly one of `exec`, `prompt`, `invoke_pipeline`",
                    raw.id
                )))
            }
        };
        Ok(PipelineStep {
            id: raw.id,
            kind,
            input: raw.input,
            condition: raw.condition,
            timeout_seconds: raw.timeout_seconds,
            approval: raw.approval,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub inputs: BTreeMap<String, PipelineInput>,
    /// Output name -> expression over the accumulated variable set.
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
    pub steps: Vec<PipelineStep>,
}

impl PipelineDefinition {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::Validation {
            name: self.name.clone(),
            reason,
        };
        if self.steps.is_empty() {
            return Err(invalid("pipeline must declare at least one step".to_string()));
        }
        let mut seen = std::collections::BTreeSet::new();
        for step in &self.steps {
            if !seen.insert(step.id.as_str()) {
                return Err(invalid(format!("duplicate step id `{}`", step.id)));
            }
        }
        Ok(())
    }
}

/// File-system pipeline catalog: `<root>/<name>.yaml`. This is the stock
/// implementation of the pipeline-loader collaborator.
#[derive(Debug, Clone)]
pub struct PipelineCatalog {
    root: PathBuf,
}

impl PipelineCatalog {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn load(&self, name: &str) -> Result<PipelineDefinition, ConfigError> {
        crate::shared::ids::validate_identifier_value("pipeline name", name)
            .map_err(|reason| ConfigError::Validation {
                name: name.to_string(),
                reason,
            })?;
        let path = self.root.join(format!("{name}.yaml"));
        if !path.exists() {
            return Err(ConfigError::UnknownPipeline(name.to_string()));
        }
        let definition: PipelineDefinition = load_yaml_file(&path)?;
        definition.validate()?;
        Ok(definition)
    }

    pub fn list(&self) -> Result<Vec<String>, ConfigError> {
        Ok(list_yaml_files(&self.root)?
            .into_iter()
            .filter_map(|path| {
                path.file_stem()
                    .and_then(|stem| stem.to_str())
                    .map(str::to_string)
            })
            .collect())
    }
}

fn list_yaml_files(dir: &Path) -> Result<Vec<PathBuf>, ConfigError> {
    let mut paths = Vec::new();
    if !dir.exists() {
        return Ok(paths);
    }
    let entries = fs::read_dir(dir).map_err(|source| ConfigError::Io {
        path: dir.display().to_string(),
        source,
    })?;
    for entry in entries {
        let entry = entry.map_err(|source| ConfigError::Io {
            path: dir.display().to_string(),
            source,
        })?;
        let path = entry.path();
        let is_yaml = matches!(
            path.extension().and_then(|v| v.to_str()),
            Some("yaml") | Some("yml")
        );
        if is_yaml {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

fn load_yaml_file<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observer_rejects_both_variants() {
        let raw = "behavior: plan_mode_tracker\non: session_start\nset:\n  x: '1'\n";
        let err = serde_yaml::from_str::<Observer>(raw).expect_err("must reject");
        assert!(err.to_string().contains("not both"));
    }

    #[test]
    fn observer_rejects_neither_variant() {
        let err = serde_yaml::from_str::<Observer>("{}").expect_err("must reject");
        assert!(err.to_string().contains("must declare"));
    }

    #[test]
    fn observer_rejects_unknown_behavior() {
        let err =
            serde_yaml::from_str::<Observer>("behavior: typo_tracker").expect_err("must reject");
        assert!(err.to_string().contains("unknown observer behavior"));
    }

    #[test]
    fn observer_accepts_each_variant() {
        let behavior: Observer =
            serde_yaml::from_str("behavior: task_claim_tracker").expect("behavior");
        assert_eq!(behavior, Observer::Behavior(BuiltinBehavior::TaskClaimTracker));

        let declarative: Observer = serde_yaml::from_str(
            "on: after_tool_call\nmatch:\n  tool: Edit\nset:\n  edits: 'edits + 1'\n",
        )
        .expect("declarative");
        match declarative {
            Observer::Declarative(observer) => {
                assert_eq!(observer.on, EventKind::AfterToolCall);
                assert_eq!(observer.set.get("edits").map(String::as_str), Some("edits + 1"));
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn pipeline_step_requires_exactly_one_kind() {
        let err = serde_yaml::from_str::<PipelineStep>(
            "id: build\nexec: make\nprompt: also this\n",
        )
        .expect_err("must reject");
        assert!(err.to_string().contains("exactly one"));

        let step: PipelineStep =
            serde_yaml::from_str("id: build\nexec: make\n").expect("single kind");
        assert_eq!(step.kind, PipelineStepKind::Exec("make".to_string()));
    }

    #[test]
    fn transition_targets_must_exist() {
        let definition: WorkflowDefinition = serde_yaml::from_str(
            r#"
name: wf
type: step
steps:
  - name: plan
    transitions:
      - to: missing
        when: "true"
"#,
        )
        .expect("parse");
        let library = WorkflowLibrary::from_definitions(vec![definition]);
        assert!(library.get("wf").is_none());
        assert_eq!(library.diagnostics.len(), 1);
        assert!(library.diagnostics[0].contains("unknown step"));
    }
}
