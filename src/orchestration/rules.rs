//! Tool-use policy checks: ordered rule evaluation for before-tool-call
//! events. First matching rule wins; no match is allow-by-default.

use crate::config::{RuleAction, RuleDefinition};
use crate::expr;
use crate::orchestration::event::ToolCall;
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleDecision {
    /// No rule matched.
    AllowDefault,
    /// An allow rule matched and terminated evaluation.
    AllowRule { rule: String },
    Warn { rule: String, reason: String },
    Block { rule: String, reason: String },
}

impl RuleDecision {
    pub fn is_allow(&self) -> bool {
        matches!(self, Self::AllowDefault | Self::AllowRule { .. })
    }
}

/// Diagnostics for rules that were skipped because their pattern or `when`
/// could not be evaluated; the caller logs these (fail-open).
#[derive(Debug, Default)]
pub struct RuleCheckReport {
    pub decision: RuleDecision,
    pub skipped: Vec<String>,
}

impl Default for RuleDecision {
    fn default() -> Self {
        Self::AllowDefault
    }
}

pub fn check(
    tool_call: &ToolCall,
    rules: &[(&str, &RuleDefinition)],
    context: &Map<String, Value>,
) -> RuleCheckReport {
    let mut report = RuleCheckReport::default();

    for (name, rule) in rules {
        match rule_matches(tool_call, rule, context) {
            Ok(false) => continue,
            Ok(true) => {
                report.decision = match rule.action {
                    RuleAction::Allow => RuleDecision::AllowRule {
                        rule: (*name).to_string(),
                    },
                    RuleAction::Warn => RuleDecision::Warn {
                        rule: (*name).to_string(),
                        reason: rule.reason.clone(),
                    },
                    RuleAction::Block => RuleDecision::Block {
                        rule: (*name).to_string(),
                        reason: rule.reason.clone(),
                    },
                };
                return report;
            }
            Err(reason) => {
                report.skipped.push(format!("rule `{name}` skipped: {reason}"));
                continue;
            }
        }
    }

    report
}

fn rule_matches(
    tool_call: &ToolCall,
    rule: &RuleDefinition,
    context: &Map<String, Value>,
) -> Result<bool, String> {
    let tool_match = rule.tools.iter().any(|tool| tool == &tool_call.tool)
        || tool_call
            .mcp_pair()
            .map(|pair| rule.mcp_tools.iter().any(|tool| tool == &pair))
            .unwrap_or(false);
    if !tool_match {
        return Ok(false);
    }

    let command = tool_call.command.as_deref().unwrap_or("");
    if let Some(pattern) = &rule.command_pattern {
        let re = regex::Regex::new(pattern)
            .map_err(|err| format!("invalid command_pattern: {err}"))?;
        if !re.is_match(command) {
            return Ok(false);
        }
    }
    if let Some(pattern) = &rule.command_not_pattern {
        let re = regex::Regex::new(pattern)
            .map_err(|err| format!("invalid command_not_pattern: {err}"))?;
        if re.is_match(command) {
            return Ok(false);
        }
    }

    if let Some(when) = &rule.when {
        return expr::evaluate_predicate(when, context)
            .map_err(|err| format!("when-expression failed: {err}"));
    }

    Ok(true)
}
