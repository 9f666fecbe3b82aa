//! Task log streaming. Running tasks (`in_progress`, `committing`) tail the
//! live log file, polling for growth; everything else streams the saved
//! per-turn artifacts in filename order. The HTTP layer adds the periodic
//! keepalive on top of this stream.

use std::{io::SeekFrom, sync::Arc, time::Duration};

use store::TaskStore;
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt},
    sync::mpsc,
};
use tracing::debug;
use uuid::Uuid;

const TAIL_POLL_INTERVAL: Duration = Duration::from_millis(500);
pub const NO_OUTPUT_MARKER: &str = "(no output saved for this task)";

/// Stream a task's output as text chunks. The receiver side ends when the
/// live log is removed (the runner deletes it on exit), when the saved
/// artifacts are exhausted, or when the subscriber goes away.
pub fn stream_task_logs(store: Arc<TaskStore>, task_id: Uuid) -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(async move {
        let Ok(task) = store.get_task(task_id) else {
            return;
        };
        if task.status.is_running() {
            tail_live_log(store, task_id, tx).await;
        } else {
            stream_saved_outputs(store, task_id, tx).await;
        }
    });
    rx
}

async fn stream_saved_outputs(store: Arc<TaskStore>, task_id: Uuid, tx: mpsc::Sender<String>) {
    let files = store.list_turn_outputs(task_id);
    if files.is_empty() {
        let _ = tx.send(NO_OUTPUT_MARKER.to_string()).await;
        return;
    }
    for file in files {
        match tokio::fs::read_to_string(&file).await {
            Ok(content) => {
                if tx.send(content).await.is_err() {
                    return;
                }
            }
            Err(e) => debug!("skipping unreadable output file {}: {e}", file.display()),
        }
    }
}

async fn tail_live_log(store: Arc<TaskStore>, task_id: Uuid, tx: mpsc::Sender<String>) {
    let path = store.live_log_path(task_id);
    let mut position: u64 = 0;
    let mut seen_file = false;

    loop {
        if tx.is_closed() {
            return;
        }
        match tokio::fs::metadata(&path).await {
            Ok(meta) => {
                seen_file = true;
                let len = meta.len();
                if len > position {
                    match read_from(&path, position, len).await {
                        Ok(chunk) => {
                            position = len;
                            if tx.send(chunk).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            debug!(task = %task_id, "live log read failed: {e}");
                            return;
                        }
                    }
                }
            }
            Err(_) if seen_file => return, // runner removed it on exit
            Err(_) => {
                // Not created yet. Keep waiting only while the task still
                // reads as running.
                match store.get_task(task_id) {
                    Ok(task) if task.status.is_running() => {}
                    _ => return,
                }
            }
        }
        tokio::time::sleep(TAIL_POLL_INTERVAL).await;
    }
}

async fn read_from(path: &std::path::Path, from: u64, to: u64) -> std::io::Result<String> {
    let mut file = File::open(path).await?;
    file.seek(SeekFrom::Start(from)).await?;
    let mut buf = vec![0u8; (to - from) as usize];
    file.read_exact(&mut buf).await?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}
