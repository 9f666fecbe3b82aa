mod common;

use std::{fs, path::PathBuf, process::Command};

use common::{ScriptedTurn, git_harness, wait_for_status};
use store::models::{CreateTask, EventKind, TaskStatus};

fn create_task(h: &common::Harness, prompt: &str) -> store::models::Task {
    h.lifecycle
        .create_task(CreateTask {
            prompt: prompt.into(),
            timeout_minutes: Some(5),
        })
        .unwrap()
}

/// Run a task to `waiting` so its worktree exists and can be edited.
async fn park_in_waiting(h: &common::Harness, prompt: &str) -> store::models::Task {
    let task = create_task(h, prompt);
    h.invoker.push_turn(ScriptedTurn::stop_reason(""));
    h.lifecycle.start_task(task.id).await.unwrap();
    wait_for_status(&h.store, task.id, TaskStatus::Waiting).await;
    h.store.get_task(task.id).unwrap()
}

fn worktree_of(task: &store::models::Task) -> PathBuf {
    PathBuf::from(task.worktree_paths.values().next().unwrap())
}

fn git_in(dir: &std::path::Path, args: &[&str]) {
    let out = Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(args)
        .output()
        .unwrap();
    assert!(
        out.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&out.stderr)
    );
}

// Mark-done on a waiting task commits the worktree changes, fast-forward
// merges them, records the hashes, and cleans up.
#[tokio::test]
async fn mark_done_commits_and_merges() {
    let h = git_harness();
    let task = park_in_waiting(&h, "change the file").await;
    let worktree = worktree_of(&task);
    fs::write(worktree.join("file.txt"), "changed by agent\n").unwrap();

    h.lifecycle.mark_done(task.id).await.unwrap();
    wait_for_status(&h.store, task.id, TaskStatus::Done).await;

    let cli = h.worktrees.cli();
    assert_eq!(cli.rev_list_count(&h.workspace, "HEAD").unwrap(), 2);
    assert_eq!(cli.merge_commit_count(&h.workspace, "HEAD").unwrap(), 0);
    assert_eq!(
        fs::read_to_string(h.workspace.join("file.txt")).unwrap(),
        "changed by agent\n"
    );
    let subject = cli.recent_subjects(&h.workspace, 1);
    assert_eq!(subject.trim(), "scripted commit message");

    let reloaded = h.store.get_task(task.id).unwrap();
    let ws_key = h.workspace.to_string_lossy().into_owned();
    assert!(reloaded.commit_hashes.contains_key(&ws_key));
    assert!(reloaded.base_commit_hashes.contains_key(&ws_key));
    assert!(reloaded.worktree_paths.is_empty());
    assert!(!h.worktrees.worktree_dir(task.id).exists());

    // The pipeline narrates its phases.
    let systems: Vec<String> = h
        .store
        .get_events(task.id)
        .unwrap()
        .into_iter()
        .filter(|e| e.kind == EventKind::System)
        .map(|e| e.payload["message"].as_str().unwrap().to_string())
        .collect();
    assert!(systems.iter().any(|m| m.contains("staging")));
    assert!(systems.iter().any(|m| m.contains("Commit pipeline completed")));
}

// Message generation failure falls back to the prompt-derived subject.
#[tokio::test]
async fn commit_message_falls_back_to_prompt() {
    let h = git_harness();
    let task = park_in_waiting(&h, "Fix the flux capacitor\nwith details").await;
    fs::write(worktree_of(&task).join("file.txt"), "fixed\n").unwrap();

    h.invoker.push_aux("msg", ScriptedTurn::ExecError(1));
    h.lifecycle.mark_done(task.id).await.unwrap();
    wait_for_status(&h.store, task.id, TaskStatus::Done).await;

    let subject = h.worktrees.cli().recent_subjects(&h.workspace, 1);
    assert_eq!(subject.trim(), "wallfacer: Fix the flux capacitor");
}

// Two tasks with overlapping edits: the second one's rebase conflicts, the
// resolver container fixes it, and history stays linear with three commits.
#[tokio::test]
async fn rebase_conflict_resolved_by_resolver() {
    let h = git_harness();

    let task_a = park_in_waiting(&h, "task A").await;
    let task_b = park_in_waiting(&h, "task B").await;

    fs::write(worktree_of(&task_a).join("file.txt"), "from A\n").unwrap();
    fs::write(worktree_of(&task_b).join("file.txt"), "from B\n").unwrap();

    // The resolver resolves the conflicted file and continues the rebase,
    // exactly what the real container is instructed to do.
    h.invoker.set_resolver_hook(Box::new(|req| {
        let worktree = req.worktree_overrides.values().next().unwrap().clone();
        let dir = std::path::Path::new(&worktree);
        fs::write(dir.join("file.txt"), "from A\nfrom B\n").unwrap();
        let add = Command::new("git")
            .arg("-C")
            .arg(dir)
            .args(["add", "file.txt"])
            .output()
            .unwrap();
        assert!(add.status.success());
        let cont = Command::new("git")
            .arg("-C")
            .arg(dir)
            .args(["-c", "core.editor=true", "rebase", "--continue"])
            .output()
            .unwrap();
        assert!(
            cont.status.success(),
            "rebase --continue failed: {}",
            String::from_utf8_lossy(&cont.stderr)
        );
    }));

    h.lifecycle.mark_done(task_a.id).await.unwrap();
    wait_for_status(&h.store, task_a.id, TaskStatus::Done).await;

    h.lifecycle.mark_done(task_b.id).await.unwrap();
    wait_for_status(&h.store, task_b.id, TaskStatus::Done).await;

    let cli = h.worktrees.cli();
    assert_eq!(cli.rev_list_count(&h.workspace, "HEAD").unwrap(), 3);
    assert_eq!(cli.merge_commit_count(&h.workspace, "HEAD").unwrap(), 0);
    assert_eq!(
        fs::read_to_string(h.workspace.join("file.txt")).unwrap(),
        "from A\nfrom B\n"
    );

    // The resolver ran against the conflicted worktree only, resuming the
    // task's session, and was told not to commit.
    let resolver_reqs: Vec<_> = h
        .invoker
        .requests
        .lock()
        .unwrap()
        .iter()
        .filter(|r| r.container_suffix.as_deref() == Some("fix"))
        .cloned()
        .collect();
    assert!(!resolver_reqs.is_empty());
    assert_eq!(resolver_reqs[0].workspaces.len(), 1);
    assert_eq!(resolver_reqs[0].session_id.as_deref(), Some("sess-1"));
    assert!(resolver_reqs[0].prompt.contains("Do NOT run `git commit`"));
}

// When the resolver cannot fix the conflict, retries are exhausted, the
// task fails, and the worktree is preserved for inspection.
#[tokio::test]
async fn unresolvable_conflict_fails_and_preserves_worktree() {
    let h = git_harness();

    let task_a = park_in_waiting(&h, "task A").await;
    let task_b = park_in_waiting(&h, "task B").await;

    fs::write(worktree_of(&task_a).join("file.txt"), "from A\n").unwrap();
    fs::write(worktree_of(&task_b).join("file.txt"), "from B\n").unwrap();

    // Resolver that never actually resolves anything.
    h.invoker.set_resolver_hook(Box::new(|_req| {}));

    h.lifecycle.mark_done(task_a.id).await.unwrap();
    wait_for_status(&h.store, task_a.id, TaskStatus::Done).await;

    h.lifecycle.mark_done(task_b.id).await.unwrap();
    wait_for_status(&h.store, task_b.id, TaskStatus::Failed).await;

    let reloaded = h.store.get_task(task_b.id).unwrap();
    assert!(!reloaded.worktree_paths.is_empty());
    assert!(worktree_of(&reloaded).exists());

    let events = h.store.get_events(task_b.id).unwrap();
    assert!(events.iter().any(|e| e.kind == EventKind::Error));

    // Clean up the half-rebased worktree so the tempdir can be dropped.
    git_in(&worktree_of(&reloaded), &["rebase", "--abort"]);
}

// A worktree with no commits ahead is skipped, not merged.
#[tokio::test]
async fn clean_worktree_is_skipped() {
    let h = git_harness();
    let task = park_in_waiting(&h, "no changes").await;

    h.lifecycle.mark_done(task.id).await.unwrap();
    wait_for_status(&h.store, task.id, TaskStatus::Done).await;

    let cli = h.worktrees.cli();
    assert_eq!(cli.rev_list_count(&h.workspace, "HEAD").unwrap(), 1);

    let systems: Vec<String> = h
        .store
        .get_events(task.id)
        .unwrap()
        .into_iter()
        .filter(|e| e.kind == EventKind::System)
        .map(|e| e.payload["message"].as_str().unwrap().to_string())
        .collect();
    assert!(systems.iter().any(|m| m.contains("nothing to commit")));
}

// Diffs come from the live worktree while it exists, and are reconstructed
// from the recorded hashes after the pipeline cleans it up.
#[tokio::test]
async fn diff_survives_worktree_cleanup() {
    use services::services::diff::task_diffs;

    let h = git_harness();
    let task = park_in_waiting(&h, "edit the file").await;
    fs::write(worktree_of(&task).join("file.txt"), "live change\n").unwrap();

    let live = task_diffs(h.store.clone(), h.worktrees.clone(), task.id)
        .await
        .unwrap();
    assert_eq!(live.len(), 1);
    assert!(live[0].diff.contains("live change"));

    h.lifecycle.mark_done(task.id).await.unwrap();
    wait_for_status(&h.store, task.id, TaskStatus::Done).await;

    let historical = task_diffs(h.store.clone(), h.worktrees.clone(), task.id)
        .await
        .unwrap();
    assert_eq!(historical.len(), 1);
    assert!(historical[0].diff.contains("live change"));
}

// The base-branch HEAD is captured even when nothing merges, so diff
// reconstruction can tell "no change" from "worktree gone".
#[tokio::test]
async fn base_hash_captured_even_without_merge() {
    let h = git_harness();
    let task = park_in_waiting(&h, "no changes").await;

    h.lifecycle.mark_done(task.id).await.unwrap();
    wait_for_status(&h.store, task.id, TaskStatus::Done).await;

    let reloaded = h.store.get_task(task.id).unwrap();
    let ws_key = h.workspace.to_string_lossy().into_owned();
    let head = h.worktrees.cli().rev_parse(&h.workspace, "HEAD").unwrap();
    assert_eq!(reloaded.base_commit_hashes.get(&ws_key), Some(&head));
    assert!(!reloaded.commit_hashes.contains_key(&ws_key));
}
