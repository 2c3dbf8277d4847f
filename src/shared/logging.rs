use serde_json::{Map, Value};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

pub fn daemon_log_path(state_root: &Path) -> PathBuf {
    state_root.join("logs/daemon.log")
}

pub fn append_daemon_log_line(state_root: &Path, line: &str) -> std::io::Result<()> {
    let path = daemon_log_path(state_root);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)?;
    writeln!(file, "{line}")
}

/// Appends a structured JSON event line. Diagnostics must never fail the
/// caller, so write errors are dropped.
pub fn log_event(state_root: &Path, event: &str, fields: &[(&str, Value)]) {
    let mut payload = Map::new();
    payload.insert("event".to_string(), Value::String(event.to_string()));
    for (key, value) in fields {
        payload.insert((*key).to_string(), value.clone());
    }
    if let Ok(line) = serde_json::to_string(&Value::Object(payload)) {
        let _ = append_daemon_log_line(state_root, &line);
    }
}

/// Plain-text diagnostic for recovered internal failures (bad expression,
/// skipped rule, swallowed observer error).
pub fn log_diagnostic(state_root: &Path, component: &str, message: &str) {
    let _ = append_daemon_log_line(state_root, &format!("[{component}] {message}"));
}
