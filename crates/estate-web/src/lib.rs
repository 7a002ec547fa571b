//! Axum admin surface: manual sync triggers and a liveness probe.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use estate_core::{EntityKind, PassOutcome};
use estate_sync::{SyncSupervisor, SyncWorker};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "estate-web";

#[derive(Clone)]
pub struct AppState {
    pub workers: BTreeMap<EntityKind, Arc<SyncWorker>>,
    pub cancel: CancellationToken,
}

impl AppState {
    pub fn new(workers: BTreeMap<EntityKind, Arc<SyncWorker>>, cancel: CancellationToken) -> Self {
        Self { workers, cancel }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/admin/sync/{kind}", post(trigger_sync_handler))
        .with_state(Arc::new(state))
}

/// Serve the admin router until `state.cancel` fires.
pub async fn serve(addr: &str, state: AppState) -> anyhow::Result<()> {
    let cancel = state.cancel.clone();
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding admin server to {addr}"))?;
    info!(addr = %listener.local_addr()?, "admin server listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

/// Serve the admin router next to `supervisor`'s workers until `shutdown`
/// resolves or the server stops on its own. Either way the workers are
/// cancelled and joined before returning.
pub async fn run_service(
    addr: &str,
    supervisor: SyncSupervisor,
    shutdown: impl Future<Output = ()>,
) -> anyhow::Result<()> {
    let state = AppState::new(supervisor.workers(), supervisor.cancel_token());
    let mut server = tokio::spawn({
        let addr = addr.to_string();
        async move { serve(&addr, state).await }
    });

    let early_exit = tokio::select! {
        _ = shutdown => {
            info!("shutdown requested");
            None
        }
        served = &mut server => Some(served),
    };

    let stopped_early = early_exit.is_some();
    supervisor.shutdown().await;
    let served = match early_exit {
        Some(served) => served,
        None => server.await,
    };
    let served = served.context("admin server task").and_then(|r| r);
    match &served {
        Err(err) => error!(
            error = %format!("{err:#}"),
            "admin server failed; sync workers stopped"
        ),
        Ok(()) if stopped_early => warn!("admin server stopped; sync workers stopped"),
        Ok(()) => {}
    }
    served
}

async fn health_handler() -> &'static str {
    "ok"
}

/// Runs one pass and reports on its fetch step. Per-record and store
/// failures are in the logs, not in the status code.
async fn trigger_sync_handler(
    State(state): State<Arc<AppState>>,
    Path(raw_kind): Path<String>,
) -> Response {
    let Some(worker) = raw_kind
        .parse::<EntityKind>()
        .ok()
        .and_then(|kind| state.workers.get(&kind))
    else {
        warn!(kind = %raw_kind, "manual sync requested for unknown or disabled kind");
        return (
            StatusCode::NOT_FOUND,
            Json(json!({
                "status": "error",
                "kind": raw_kind,
                "error": "unknown or disabled kind",
            })),
        )
            .into_response();
    };

    info!(kind = %worker.kind(), "manual sync triggered");
    let pass = worker.run_once(&state.cancel).await;
    match &pass.outcome {
        PassOutcome::FetchFailed { error } => (
            StatusCode::BAD_GATEWAY,
            Json(json!({ "status": "error", "kind": pass.kind, "error": error })),
        )
            .into_response(),
        outcome => Json(json!({
            "status": "ok",
            "kind": pass.kind,
            "pass_id": pass.pass_id.to_string(),
            "fetched": pass.fetched,
            "outcome": outcome,
        }))
        .into_response(),
    }
}
