use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Lifecycle events the daemon feeds into the workflow engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    SessionStart,
    SessionStop,
    BeforeToolCall,
    AfterToolCall,
    CronTick,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SessionStart => "session_start",
            Self::SessionStop => "session_stop",
            Self::BeforeToolCall => "before_tool_call",
            Self::AfterToolCall => "after_tool_call",
            Self::CronTick => "cron_tick",
        }
    }

    pub fn is_tool_related(self) -> bool {
        matches!(self, Self::BeforeToolCall | Self::AfterToolCall)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    pub tool: String,
    #[serde(default)]
    pub mcp_server: Option<String>,
    /// Textual command argument for Bash-like tools; rule command patterns
    /// match against this.
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

impl ToolCall {
    /// `server:tool` pair used for mcp rule matching.
    pub fn mcp_pair(&self) -> Option<String> {
        self.mcp_server
            .as_ref()
            .map(|server| format!("{server}:{}", self.tool))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub kind: EventKind,
    pub session_id: String,
    #[serde(default)]
    pub tool_call: Option<ToolCall>,
    /// Free-form payload fields (prompt text, agent id, exit status...).
    #[serde(default)]
    pub fields: Map<String, Value>,
    pub timestamp: i64,
}

impl Event {
    /// Flat field view used by observer `match` maps and exposed to
    /// expressions as the `event` object.
    pub fn field_view(&self) -> Map<String, Value> {
        let mut view = Map::new();
        view.insert(
            "type".to_string(),
            Value::String(self.kind.as_str().to_string()),
        );
        view.insert(
            "session_id".to_string(),
            Value::String(self.session_id.clone()),
        );
        if let Some(call) = &self.tool_call {
            view.insert("tool".to_string(), Value::String(call.tool.clone()));
            if let Some(server) = &call.mcp_server {
                view.insert("mcp_server".to_string(), Value::String(server.clone()));
            }
            if let Some(command) = &call.command {
                view.insert("command".to_string(), Value::String(command.clone()));
            }
            view.insert(
                "arguments".to_string(),
                Value::Object(call.arguments.clone()),
            );
        }
        for (key, value) in &self.fields {
            view.entry(key.clone()).or_insert_with(|| value.clone());
        }
        view
    }
}

/// The outcome of dispatching an event: the hook caller either proceeds,
/// proceeds with a surfaced warning, or refuses the tool call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    Allow,
    Warn { reason: String },
    Block { reason: String },
}

impl Decision {
    pub fn is_blocking(&self) -> bool {
        matches!(self, Decision::Block { .. })
    }
}
