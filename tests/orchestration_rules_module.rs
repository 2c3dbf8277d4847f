use agentwarden::config::{RuleAction, RuleDefinition};
use agentwarden::orchestration::event::ToolCall;
use agentwarden::orchestration::rules::{check, RuleDecision};
use serde_json::{json, Map, Value};

fn rule(action: RuleAction) -> RuleDefinition {
    RuleDefinition {
        tools: vec!["Edit".to_string()],
        mcp_tools: Vec::new(),
        when: None,
        command_pattern: None,
        command_not_pattern: None,
        reason: String::new(),
        action,
    }
}

fn edit_call() -> ToolCall {
    ToolCall {
        tool: "Edit".to_string(),
        mcp_server: None,
        command: None,
        arguments: Map::new(),
    }
}

fn context(entries: &[(&str, Value)]) -> Map<String, Value> {
    entries
        .iter()
        .map(|(key, value)| (key.to_string(), value.clone()))
        .collect()
}

#[test]
fn rules_module_first_match_wins_in_declared_order() {
    let mut block = rule(RuleAction::Block);
    block.when = Some("not task_claimed".to_string());
    block.reason = "claim a task before editing".to_string();
    let allow = rule(RuleAction::Allow);
    let active = [("no_edit_before_claim", &block), ("allow_edit", &allow)];

    let unclaimed = context(&[("task_claimed", json!(false))]);
    let report = check(&edit_call(), &active, &unclaimed);
    assert_eq!(
        report.decision,
        RuleDecision::Block {
            rule: "no_edit_before_claim".to_string(),
            reason: "claim a task before editing".to_string(),
        }
    );

    let claimed = context(&[("task_claimed", json!(true))]);
    let report = check(&edit_call(), &active, &claimed);
    assert_eq!(
        report.decision,
        RuleDecision::AllowRule {
            rule: "allow_edit".to_string(),
        }
    );
}

#[test]
fn rules_module_no_match_is_allow_by_default() {
    let block = rule(RuleAction::Block);
    let bash_call = ToolCall {
        tool: "Bash".to_string(),
        mcp_server: None,
        command: Some("ls".to_string()),
        arguments: Map::new(),
    };
    let report = check(&bash_call, &[("edit_only", &block)], &Map::new());
    assert_eq!(report.decision, RuleDecision::AllowDefault);
}

#[test]
fn rules_module_command_patterns_constrain_bash_like_calls() {
    let mut danger = rule(RuleAction::Block);
    danger.tools = vec!["Bash".to_string()];
    danger.command_pattern = Some(r"rm\s+-rf".to_string());
    danger.command_not_pattern = Some(r"^rm\s+-rf\s+/tmp/".to_string());
    danger.reason = "refusing recursive delete".to_string();
    let active = [("no_recursive_delete", &danger)];

    let call = |command: &str| ToolCall {
        tool: "Bash".to_string(),
        mcp_server: None,
        command: Some(command.to_string()),
        arguments: Map::new(),
    };

    let report = check(&call("rm -rf /srv/data"), &active, &Map::new());
    assert!(matches!(report.decision, RuleDecision::Block { .. }));

    // The not-pattern carves out an exception.
    let report = check(&call("rm -rf /tmp/scratch"), &active, &Map::new());
    assert_eq!(report.decision, RuleDecision::AllowDefault);

    let report = check(&call("ls -la"), &active, &Map::new());
    assert_eq!(report.decision, RuleDecision::AllowDefault);
}

#[test]
fn rules_module_mcp_pairs_match_server_and_tool() {
    let mut mcp = rule(RuleAction::Warn);
    mcp.tools = Vec::new();
    mcp.mcp_tools = vec!["tasks:claim_task".to_string()];
    mcp.reason = "claiming via mcp".to_string();
    let active = [("mcp_claims", &mcp)];

    let call = ToolCall {
        tool: "claim_task".to_string(),
        mcp_server: Some("tasks".to_string()),
        command: None,
        arguments: Map::new(),
    };
    let report = check(&call, &active, &Map::new());
    assert!(matches!(report.decision, RuleDecision::Warn { .. }));

    let other_server = ToolCall {
        tool: "claim_task".to_string(),
        mcp_server: Some("other".to_string()),
        command: None,
        arguments: Map::new(),
    };
    let report = check(&other_server, &active, &Map::new());
    assert_eq!(report.decision, RuleDecision::AllowDefault);
}

#[test]
fn rules_module_broken_rules_are_skipped_fail_open() {
    let mut broken = rule(RuleAction::Block);
    broken.command_pattern = Some("(unclosed".to_string());
    let mut bad_when = rule(RuleAction::Block);
    bad_when.when = Some("1 +".to_string());
    let active = [("broken_pattern", &broken), ("broken_when", &bad_when)];

    let mut call = edit_call();
    call.command = Some("anything".to_string());
    let report = check(&call, &active, &Map::new());
    assert_eq!(report.decision, RuleDecision::AllowDefault);
    assert_eq!(report.skipped.len(), 2);
}
