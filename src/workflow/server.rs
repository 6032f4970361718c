use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use super::api::{self, AppState};
use super::db::{DbHandle, StateDb};
use super::monitor::Monitor;
use super::orchestrator::Orchestrator;
use super::runner::{ClaudeStageRunner, StageRunner};
use super::worktree::GitWorktreeManager;
use crate::config::RuntimeConfig;

/// Options for `pipewright serve` that are not part of the config file.
#[derive(Debug, Clone, Default)]
pub struct ServeOptions {
    /// Bind on all interfaces and allow any origin.
    pub dev_mode: bool,
    /// Leave stage completion to `POST /api/instances/{id}/advance`.
    pub external_runner: bool,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    api::api_router().with_state(state)
}

/// Wire the orchestrator from configuration: SQLite state, git worktrees and
/// (unless disabled) the agent CLI runner.
pub fn build_orchestrator(config: &RuntimeConfig, options: &ServeOptions) -> Result<Orchestrator> {
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    let db = StateDb::new(&config.db_path).context("Failed to initialize state database")?;
    let copies = Arc::new(GitWorktreeManager::new(config));
    let runner: Option<Arc<dyn StageRunner>> = if options.external_runner {
        None
    } else {
        Some(Arc::new(ClaudeStageRunner::from_config(config)))
    };
    Ok(Orchestrator::new(config.clone(), DbHandle::new(db), copies, runner))
}

pub async fn start_server(config: RuntimeConfig, options: ServeOptions) -> Result<()> {
    let orch = build_orchestrator(&config, &options)?;
    let monitor_cancel = CancellationToken::new();
    let monitor = Monitor::new(orch.clone()).spawn(monitor_cancel.clone());

    let state = Arc::new(AppState { orch: orch.clone() });
    let mut app = build_router(state);
    if options.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let host = if options.dev_mode { "0.0.0.0" } else { "127.0.0.1" };
    let addr = format!("{}:{}", host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    tracing::info!(
        addr = %local_addr,
        repo = %config.repo_path.display(),
        external_runner = options.external_runner,
        "pipewright listening"
    );
    println!("pipewright running at http://{}", local_addr);

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error");

    monitor_cancel.cancel();
    if let Err(e) = monitor.await {
        tracing::warn!(error = %e, "monitor task ended abnormally");
    }
    orch.shutdown().await;
    println!("Server shut down gracefully.");
    served
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    println!("\nShutting down...");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::orchestrator::test_support::harness;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_health_via_full_router() {
        let h = harness(true);
        let app = build_router(Arc::new(AppState { orch: h.orch.clone() }));
        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let h = harness(true);
        let app = build_router(Arc::new(AppState { orch: h.orch.clone() }));
        let req = Request::builder()
            .uri("/api/projects")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_build_orchestrator_creates_database() {
        let dir = tempfile::tempdir().unwrap();
        let config = RuntimeConfig::for_project(dir.path());
        let orch = build_orchestrator(
            &config,
            &ServeOptions {
                dev_mode: false,
                external_runner: true,
            },
        )
        .unwrap();
        assert!(config.db_path.exists());
        assert!(orch.list(Default::default()).await.unwrap().is_empty());
    }
}
