use std::{collections::BTreeMap, fs, path::PathBuf};

use store::{
    StoreError, TaskStore,
    models::{CreateTask, EventKind, TaskEvent, TaskStatus, TaskUsage, UpdateBacklog},
};
use tempfile::TempDir;
use uuid::Uuid;

fn workspaces() -> Vec<PathBuf> {
    vec![PathBuf::from("/tmp/ws-a"), PathBuf::from("/tmp/ws-b")]
}

fn open_store(dir: &TempDir) -> TaskStore {
    TaskStore::open(dir.path(), &workspaces()).unwrap()
}

fn create(store: &TaskStore, prompt: &str) -> store::models::Task {
    store
        .create_task(CreateTask {
            prompt: prompt.into(),
            timeout_minutes: None,
        })
        .unwrap()
}

#[test]
fn create_and_get_roundtrip() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    let task = create(&store, "Hello");
    assert_eq!(task.status, TaskStatus::Backlog);
    assert_eq!(task.timeout_minutes, 5);
    assert!(task.branch_name.starts_with("task/"));

    let fetched = store.get_task(task.id).unwrap();
    assert_eq!(fetched.prompt, "Hello");
    assert_eq!(fetched.position, task.position);

    assert!(store.task_dir(task.id).join("task.json").exists());
}

#[test]
fn missing_task_is_not_found() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    assert!(matches!(
        store.get_task(Uuid::new_v4()),
        Err(StoreError::NotFound(_))
    ));
}

#[test]
fn list_orders_by_position() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    let a = create(&store, "a");
    let b = create(&store, "b");
    assert!(a.position < b.position);

    store.update_position(a.id, 10).unwrap();
    let listed = store.list_tasks(true);
    assert_eq!(listed.last().unwrap().id, a.id);
}

#[test]
fn restart_reload_matches_disk_state() {
    let dir = TempDir::new().unwrap();
    let (a_id, b_id) = {
        let store = open_store(&dir);
        let a = create(&store, "first");
        let b = create(&store, "second");
        store.update_status(a.id, TaskStatus::InProgress).unwrap();
        store
            .insert_event(
                a.id,
                EventKind::Output,
                TaskEvent::output_payload("did things", "end_turn", "sess-1"),
            )
            .unwrap();
        store.update_status(a.id, TaskStatus::Done).unwrap();
        store
            .accumulate_usage(
                a.id,
                &TaskUsage {
                    input_tokens: 42,
                    ..Default::default()
                },
            )
            .unwrap();
        (a.id, b.id)
    };

    let reopened = open_store(&dir);
    let a = reopened.get_task(a_id).unwrap();
    assert_eq!(a.status, TaskStatus::Done);
    assert_eq!(a.usage.input_tokens, 42);
    assert!(reopened.get_task(b_id).is_ok());

    let events = reopened.get_events(a_id).unwrap();
    let sequences: Vec<u64> = events.iter().map(|e| e.sequence).collect();
    assert_eq!(sequences, vec![1, 2, 3]);
    assert_eq!(events[0].kind, EventKind::StateChange);
    assert_eq!(events[1].kind, EventKind::Output);

    // A further event continues the sequence without gaps.
    let next = reopened
        .insert_event(a_id, EventKind::System, TaskEvent::system_payload("hi"))
        .unwrap();
    assert_eq!(next.sequence, 4);
}

#[test]
fn status_change_emits_exactly_one_event_with_both_ends() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let task = create(&store, "x");

    store.update_status(task.id, TaskStatus::InProgress).unwrap();
    // Re-writing the same status is a no-op, not a second event.
    store.update_status(task.id, TaskStatus::InProgress).unwrap();

    let events = store.get_events(task.id).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].payload["from"], "backlog");
    assert_eq!(events[0].payload["to"], "in_progress");
}

#[test]
fn cancelled_task_wins_the_terminal_write_race() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let task = create(&store, "x");

    store.update_status(task.id, TaskStatus::InProgress).unwrap();
    store.update_status(task.id, TaskStatus::Cancelled).unwrap();

    // The runner's belated terminal write yields ownership.
    let written = store
        .update_status_unless_cancelled(task.id, TaskStatus::Failed)
        .unwrap();
    assert!(!written);
    assert_eq!(store.get_task(task.id).unwrap().status, TaskStatus::Cancelled);
}

#[test]
fn backlog_edits_rejected_outside_backlog() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let task = create(&store, "original");

    store
        .update_backlog(
            task.id,
            UpdateBacklog {
                prompt: Some("edited".into()),
                timeout_minutes: Some(2000),
                fresh_start: Some(true),
            },
        )
        .unwrap();
    let task = store.get_task(task.id).unwrap();
    assert_eq!(task.prompt, "edited");
    assert_eq!(task.prompt_history, vec!["original".to_string()]);
    assert_eq!(task.timeout_minutes, 1440);
    assert!(task.fresh_start);

    store.update_status(task.id, TaskStatus::InProgress).unwrap();
    assert!(matches!(
        store.update_backlog(task.id, UpdateBacklog::default()),
        Err(StoreError::InvalidArgument(_))
    ));
}

#[test]
fn retry_preserves_session_unless_fresh_start() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let task = create(&store, "x");

    store.update_status(task.id, TaskStatus::InProgress).unwrap();
    store
        .update_result(task.id, "partial", "", Some("sess-9"))
        .unwrap();
    store
        .update_worktrees(
            task.id,
            BTreeMap::from([("/tmp/ws-a".to_string(), "/tmp/wt/x".to_string())]),
            &task.branch_name,
        )
        .unwrap();
    store.update_status(task.id, TaskStatus::Failed).unwrap();

    let reset = store.reset_for_retry(task.id, false).unwrap();
    assert_eq!(reset.status, TaskStatus::Backlog);
    assert_eq!(reset.session_id, "sess-9");
    assert!(reset.worktree_paths.is_empty());
    assert!(reset.result.is_empty());
    assert_eq!(reset.turns, 0);

    store.update_status(task.id, TaskStatus::InProgress).unwrap();
    store.update_status(task.id, TaskStatus::Failed).unwrap();
    let reset = store.reset_for_retry(task.id, true).unwrap();
    assert!(reset.session_id.is_empty());
    assert!(reset.fresh_start);
}

#[test]
fn retry_refused_from_in_progress() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let task = create(&store, "x");
    store.update_status(task.id, TaskStatus::InProgress).unwrap();
    assert!(matches!(
        store.reset_for_retry(task.id, false),
        Err(StoreError::InvalidArgument(_))
    ));
}

#[test]
fn archive_only_from_done_or_cancelled() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let task = create(&store, "x");

    assert!(store.set_archived(task.id, true).is_err());

    store.update_status(task.id, TaskStatus::InProgress).unwrap();
    store.update_status(task.id, TaskStatus::Done).unwrap();
    store.set_archived(task.id, true).unwrap();

    assert!(store.list_tasks(false).is_empty());
    assert_eq!(store.list_tasks(true).len(), 1);

    store.set_archived(task.id, false).unwrap();
    assert_eq!(store.list_tasks(false).len(), 1);
}

#[test]
fn resume_requires_failed_with_session() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let task = create(&store, "x");

    store.update_status(task.id, TaskStatus::InProgress).unwrap();
    store.update_status(task.id, TaskStatus::Failed).unwrap();
    assert!(matches!(
        store.resume_task(task.id),
        Err(StoreError::InvalidArgument(_))
    ));

    store.update_result(task.id, "", "", Some("sess-1")).unwrap();
    let resumed = store.resume_task(task.id).unwrap();
    assert_eq!(resumed.status, TaskStatus::InProgress);
}

#[test]
fn turn_outputs_saved_and_listed_in_order() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let task = create(&store, "x");

    store.save_turn_output(task.id, 2, "{\"b\":1}", "boom").unwrap();
    store.save_turn_output(task.id, 1, "{\"a\":1}", "").unwrap();

    let files: Vec<String> = store
        .list_turn_outputs(task.id)
        .iter()
        .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(
        files,
        vec!["turn-0001.json", "turn-0002.json", "turn-0002.stderr.txt"]
    );
}

#[test]
fn partial_task_dir_is_skipped_on_boot() {
    let dir = TempDir::new().unwrap();
    let id = Uuid::new_v4();
    {
        let store = open_store(&dir);
        // A directory that looks like a task but has no task.json yet.
        fs::create_dir_all(store.root().join(id.to_string())).unwrap();
        create(&store, "real task");
    }
    let reopened = open_store(&dir);
    assert_eq!(reopened.list_tasks(true).len(), 1);
    assert!(matches!(
        reopened.get_task(id),
        Err(StoreError::NotFound(_))
    ));
}

#[test]
fn corrupt_event_file_is_skipped_on_boot() {
    let dir = TempDir::new().unwrap();
    let task_id = {
        let store = open_store(&dir);
        let task = create(&store, "x");
        store.update_status(task.id, TaskStatus::InProgress).unwrap();
        fs::write(
            store.task_dir(task.id).join("traces").join("0002.json"),
            b"not json",
        )
        .unwrap();
        task.id
    };

    let reopened = open_store(&dir);
    let events = reopened.get_events(task_id).unwrap();
    assert_eq!(events.len(), 1);
}

#[test]
fn delete_removes_directory() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let task = create(&store, "x");
    let task_dir = store.task_dir(task.id);
    assert!(task_dir.exists());

    store.delete_task(task.id).unwrap();
    assert!(!task_dir.exists());
    assert!(store.get_events(task.id).is_err());
}

#[test]
fn distinct_workspace_sets_do_not_share_history() {
    let dir = TempDir::new().unwrap();
    let store_a = TaskStore::open(dir.path(), &[PathBuf::from("/tmp/a")]).unwrap();
    create(&store_a, "x");

    let store_b = TaskStore::open(dir.path(), &[PathBuf::from("/tmp/b")]).unwrap();
    assert!(store_b.list_tasks(true).is_empty());
}

#[test]
fn failure_writes_error_event_then_state_change() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let task = create(&store, "x");
    store.update_status(task.id, TaskStatus::InProgress).unwrap();

    store.fail_with_error(task.id, "container exploded").unwrap();

    let events = store.get_events(task.id).unwrap();
    let kinds: Vec<EventKind> = events.iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![EventKind::StateChange, EventKind::Error, EventKind::StateChange]
    );
    assert_eq!(events[1].payload["message"], "container exploded");
    assert_eq!(events[2].payload["to"], "failed");
}

#[test]
fn defer_guard_only_fires_while_running() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let task = create(&store, "x");

    // Not running: the guard is a no-op.
    assert!(!store.fail_if_running(task.id, "boom").unwrap());

    store.update_status(task.id, TaskStatus::InProgress).unwrap();
    assert!(store.fail_if_running(task.id, "boom").unwrap());
    assert_eq!(store.get_task(task.id).unwrap().status, TaskStatus::Failed);
}

#[tokio::test]
async fn mutations_notify_subscribers() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let mut sub = store.subscribe().unwrap();

    let task = create(&store, "x");
    assert!(sub.rx.recv().await.is_some());

    store.update_status(task.id, TaskStatus::InProgress).unwrap();
    assert!(sub.rx.recv().await.is_some());

    store.unsubscribe(sub.id);
}
