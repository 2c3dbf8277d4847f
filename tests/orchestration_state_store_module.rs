use agentwarden::orchestration::state_store::{WorkflowState, WorkflowStateStore};
use serde_json::json;
use tempfile::tempdir;

#[test]
fn state_store_module_persists_and_reloads_sessions() {
    let temp = tempdir().expect("tempdir");
    let store = WorkflowStateStore::new(temp.path());

    let mut state = WorkflowState::new("sess-1", "review", 100);
    state.step = Some("plan".to_string());
    state.step_action_count = 3;
    state.variables.insert("task_claimed".to_string(), json!(true));
    store.persist(&state).expect("persist");

    let loaded = store.load("sess-1").expect("load").expect("state exists");
    assert_eq!(loaded, state);
    assert!(store.load("sess-2").expect("load missing").is_none());
}

#[test]
fn state_store_module_delete_is_idempotent() {
    let temp = tempdir().expect("tempdir");
    let store = WorkflowStateStore::new(temp.path());

    let state = WorkflowState::new("sess-1", "review", 100);
    store.persist(&state).expect("persist");
    store.delete("sess-1").expect("delete");
    assert!(store.load("sess-1").expect("load").is_none());
    // Deleting an absent session is not an error.
    store.delete("sess-1").expect("delete again");
}

#[test]
fn state_store_module_lists_sessions_sorted() {
    let temp = tempdir().expect("tempdir");
    let store = WorkflowStateStore::new(temp.path());

    for session in ["sess-b", "sess-a"] {
        store
            .persist(&WorkflowState::new(session, "review", 100))
            .expect("persist");
    }
    assert_eq!(
        store.list_sessions().expect("list"),
        vec!["sess-a".to_string(), "sess-b".to_string()]
    );
}

#[test]
fn state_store_module_sanitizes_hostile_session_ids() {
    let temp = tempdir().expect("tempdir");
    let store = WorkflowStateStore::new(temp.path());

    let state = WorkflowState::new("../../etc/passwd", "review", 100);
    store.persist(&state).expect("persist");

    // The record round-trips under a sanitized file name inside the root.
    let loaded = store
        .load("../../etc/passwd")
        .expect("load")
        .expect("state exists");
    assert_eq!(loaded.session_id, "../../etc/passwd");
    assert!(temp.path().join("workflows/sessions").exists());
}
