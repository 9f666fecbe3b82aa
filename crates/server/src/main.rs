use std::{collections::HashSet, sync::Arc};

use git::WorktreeManager;
use sandbox::{AgentInvoker, DockerInvoker};
use server::{AppState, routes};
use services::services::{
    commit::CommitPipeline,
    config::Config,
    env_file,
    instructions::InstructionFiles,
    lifecycle::Lifecycle,
    recovery,
    runner::Runner,
};
use store::TaskStore;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let filter_string = format!(
        "warn,server={level},services={level},store={level},sandbox={level},git={level},utils={level}",
        level = log_level
    );
    let env_filter = EnvFilter::try_new(filter_string)?;
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let config = Arc::new(Config::from_env());
    utils::fs::ensure_dir(&config.data_dir)?;
    utils::fs::ensure_dir(&config.worktrees_dir)?;
    tracing::info!(
        workspaces = ?config.workspaces,
        data_dir = %config.data_dir.display(),
        "starting wallfacer"
    );

    let env_file = env_file::write_from_config(&config)?;
    if env_file.is_none() {
        tracing::warn!("no agent credentials configured; tasks cannot be started until they are");
    }

    let store = Arc::new(TaskStore::open(&config.data_dir, &config.workspaces)?);
    let worktrees = WorktreeManager::new(config.worktrees_dir.clone(), config.workspaces.clone());
    let invoker: Arc<dyn AgentInvoker> =
        Arc::new(DockerInvoker::new(config.sandbox_profile(env_file.clone())));

    // Reconcile interrupted work before the controller accepts requests.
    let known: HashSet<Uuid> = store.list_tasks(true).iter().map(|t| t.id).collect();
    if let Err(e) = worktrees.prune_orphans(&known).await {
        tracing::warn!("worktree orphan pruning failed: {e}");
    }
    recovery::reconcile(store.clone(), invoker.clone()).await;

    let pipeline = Arc::new(CommitPipeline::new(
        store.clone(),
        worktrees.clone(),
        invoker.clone(),
    ));
    let instructions = InstructionFiles::new(config.workspaces.clone());
    let runner = Arc::new(Runner::new(
        store.clone(),
        worktrees.clone(),
        invoker.clone(),
        pipeline.clone(),
        instructions.clone(),
    ));
    let lifecycle = Lifecycle::new(
        store.clone(),
        worktrees.clone(),
        invoker.clone(),
        runner,
        pipeline,
    );

    let state = AppState {
        store,
        lifecycle,
        worktrees,
        config: config.clone(),
        instructions,
        env_file,
    };
    let app = routes::router(state);

    let listener = match tokio::net::TcpListener::bind(&config.listen_addr).await {
        Ok(listener) => listener,
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
            // Fall back to a kernel-assigned port on the same host.
            let host = config
                .listen_addr
                .rsplit_once(':')
                .map(|(host, _)| host)
                .unwrap_or("127.0.0.1");
            tracing::warn!(
                "{} is taken, falling back to a kernel-assigned port",
                config.listen_addr
            );
            tokio::net::TcpListener::bind(format!("{host}:0")).await?
        }
        Err(e) => return Err(e.into()),
    };
    tracing::info!("server running on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {e}");
        }
    };

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let terminate = async {
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
            } else {
                tracing::error!("failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        };

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await;
    }
}
