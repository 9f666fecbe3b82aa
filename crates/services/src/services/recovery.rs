//! Startup reconciliation of interrupted tasks against live containers.
//! Runs once before the lifecycle controller accepts requests. A restart
//! never moves a task straight to `failed` when partial output exists;
//! only an interrupted commit pipeline does (it is not resumable).

use std::{sync::Arc, time::Duration};

use sandbox::{AgentInvoker, container_matches_task};
use store::{
    TaskStore,
    models::{EventKind, TaskEvent, TaskStatus},
};
use tracing::{info, warn};
use uuid::Uuid;

const MONITOR_POLL_INTERVAL: Duration = Duration::from_secs(5);

pub async fn reconcile(store: Arc<TaskStore>, invoker: Arc<dyn AgentInvoker>) {
    let live = match invoker.list_live_containers().await {
        Ok(names) => names,
        Err(e) => {
            warn!("could not list live containers during recovery: {e}");
            Vec::new()
        }
    };

    for task in store.list_tasks(true) {
        match task.status {
            TaskStatus::Committing => {
                info!(task = %task.id, "recovery: commit pipeline was interrupted");
                if let Err(e) = store.fail_with_error(
                    task.id,
                    "server restarted during the commit pipeline; the pipeline is not resumable",
                ) {
                    warn!(task = %task.id, "recovery failed to mark task failed: {e}");
                }
            }
            TaskStatus::InProgress => {
                let container_alive = live.iter().any(|n| container_matches_task(n, &task.id));
                if container_alive {
                    info!(task = %task.id, "recovery: container still running, monitoring");
                    tokio::spawn(monitor_container(store.clone(), invoker.clone(), task.id));
                } else {
                    info!(task = %task.id, "recovery: container gone, moving to waiting");
                    move_to_waiting(
                        &store,
                        task.id,
                        "server restarted while the task was running; partial results were preserved",
                    );
                }
            }
            _ => {}
        }
    }
}

/// Poll the runtime until the task's container disappears, then move the
/// task to `waiting` (unless it was cancelled in the meantime).
async fn monitor_container(store: Arc<TaskStore>, invoker: Arc<dyn AgentInvoker>, task_id: Uuid) {
    loop {
        tokio::time::sleep(MONITOR_POLL_INTERVAL).await;
        let live = match invoker.list_live_containers().await {
            Ok(names) => names,
            Err(e) => {
                warn!(task = %task_id, "container monitor poll failed: {e}");
                continue;
            }
        };
        if live.iter().any(|n| container_matches_task(n, &task_id)) {
            continue;
        }
        info!(task = %task_id, "monitored container exited");
        move_to_waiting(
            &store,
            task_id,
            "container from a previous server run exited; review the output and continue",
        );
        return;
    }
}

fn move_to_waiting(store: &TaskStore, task_id: Uuid, message: &str) {
    match store.update_status_unless_cancelled(task_id, TaskStatus::Waiting) {
        Ok(true) => {
            if let Err(e) = store.insert_event(
                task_id,
                EventKind::System,
                TaskEvent::system_payload(message),
            ) {
                warn!(task = %task_id, "recovery failed to record system event: {e}");
            }
        }
        Ok(false) => {}
        Err(e) => warn!(task = %task_id, "recovery transition failed: {e}"),
    }
}
