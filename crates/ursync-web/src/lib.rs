//! Axum ingress endpoints for ursync: webhook push paths and the manual sync trigger.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tokio::net::TcpListener;
use tracing::{error, info};
use ursync_core::{candidate_from_value, candidates_from_values, FailureReason, Outcome};
use ursync_sync::{
    maybe_build_scheduler, ReconcileReport, ReconciliationEngine, SyncConfig, SyncCycle,
    SyncRuntime,
};

pub const CRATE_NAME: &str = "ursync-web";

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ReconciliationEngine>,
    pub cycle: Arc<SyncCycle>,
}

impl AppState {
    pub fn new(cycle: Arc<SyncCycle>) -> Self {
        Self {
            engine: cycle.engine().clone(),
            cycle,
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/webhook", post(webhook_handler))
        .route("/webhook_batch", post(webhook_batch_handler))
        .route("/sincronizar", get(sync_handler))
        .with_state(Arc::new(state))
}

/// Connect, migrate, start the scheduler and serve until Ctrl-C.
pub async fn serve_from_env() -> anyhow::Result<()> {
    let runtime = SyncRuntime::connect(SyncConfig::from_env()).await?;
    runtime.store.migrate().await?;

    let mut scheduler = maybe_build_scheduler(&runtime.config, runtime.cycle.clone()).await?;
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting scheduler")?;
        info!(cron = %runtime.config.sync_cron, "scheduler started");
    }

    let port = runtime.config.web_port;
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!(port, "listening");
    axum::serve(listener, app(AppState::new(runtime.cycle.clone())))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving http")?;

    if let Some(sched) = scheduler.as_mut() {
        sched.shutdown().await.context("stopping scheduler")?;
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
    }
}

// Reconciliation runs on its own task so a client disconnect cannot cut a
// candidate off between its insert and its audit event.

async fn webhook_handler(
    State(state): State<Arc<AppState>>,
    Json(value): Json<serde_json::Value>,
) -> Response {
    let slot = candidate_from_value(value);
    let is_malformed = slot.is_err();
    let engine = state.engine.clone();
    let outcome = tokio::spawn(async move { engine.reconcile_slot(&slot).await }).await;

    match outcome {
        Ok(Outcome::Inserted) => (StatusCode::OK, "Datos recibidos y guardados").into_response(),
        Ok(Outcome::SkippedDuplicate) => {
            (StatusCode::OK, "Usuario ya existente, no insertado").into_response()
        }
        Ok(Outcome::Failed(FailureReason::Validation)) if is_malformed => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Error al insertar datos: formato de usuario inválido",
        )
            .into_response(),
        Ok(Outcome::Failed(FailureReason::Validation)) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Error al insertar datos: falta el campo nombre",
        )
            .into_response(),
        Ok(Outcome::Failed(FailureReason::StoreError)) => {
            (StatusCode::INTERNAL_SERVER_ERROR, "Error al insertar datos").into_response()
        }
        Err(err) => {
            error!(error = %err, "webhook reconcile task failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "Error al insertar datos").into_response()
        }
    }
}

async fn webhook_batch_handler(
    State(state): State<Arc<AppState>>,
    Json(values): Json<Vec<serde_json::Value>>,
) -> Response {
    let slots = candidates_from_values(values);
    let received = slots.len();
    let engine = state.engine.clone();
    let outcomes = match tokio::spawn(async move { engine.reconcile_slots(&slots).await }).await {
        Ok(outcomes) => outcomes,
        Err(err) => {
            error!(error = %err, "webhook batch task failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Error al procesar usuarios").into_response();
        }
    };
    let report = ReconcileReport::from_outcomes(&outcomes);
    info!(
        received,
        inserted = report.inserted,
        skipped = report.skipped_duplicate,
        failed = report.failed,
        "webhook batch processed"
    );
    (StatusCode::OK, "Procesamiento de usuarios completado").into_response()
}

async fn sync_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.cycle.run_once().await {
        Ok(summary) => {
            info!(run_id = %summary.run_id, fetched = summary.fetched, "manual sync completed");
            (StatusCode::OK, "Sincronización completada").into_response()
        }
        Err(err) => (
            StatusCode::BAD_GATEWAY,
            format!("Error al sincronizar: {err}"),
        )
            .into_response(),
    }
}
