use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{State, rejection::JsonRejection},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};

use crate::{
    compile::{
        metrics::MetricsRegistry,
        models::{CompileFailure, CompileRequest, CompileResult, ErrorKind},
        pipeline::CompilePipeline,
        queue::{JobKind, JobOutcome, Scheduler},
    },
    error::{ApiError, ApiResult},
};

#[derive(Clone)]
pub struct CompileState {
    pipeline: Arc<CompilePipeline>,
    scheduler: Scheduler,
    metrics: Arc<MetricsRegistry>,
}

pub fn routes(
    pipeline: Arc<CompilePipeline>,
    scheduler: Scheduler,
    metrics: Arc<MetricsRegistry>,
) -> Router {
    let state = CompileState {
        pipeline,
        scheduler,
        metrics,
    };
    Router::new()
        .route("/healthz", get(health))
        .route("/metrics", get(metrics_text))
        .route("/api/compile", post(compile).fallback(method_not_allowed))
        .route("/api/run", post(run).fallback(method_not_allowed))
        .with_state(state)
}

async fn health(State(state): State<CompileState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "ok": true,
        "toolchain": state.pipeline.toolchain_status().is_ok(),
        "sandbox": state.pipeline.sandbox_name(),
    }))
}

async fn metrics_text(State(state): State<CompileState>) -> (StatusCode, String) {
    (StatusCode::OK, state.metrics.render_prometheus())
}

async fn method_not_allowed() -> ApiError {
    ApiError::MethodNotAllowed
}

/// Responds with the loader script itself.
async fn compile(
    State(state): State<CompileState>,
    payload: Result<Json<CompileRequest>, JsonRejection>,
) -> ApiResult<Response> {
    let source = required_code(payload)?;
    ensure_toolchain(&state)?;

    match submit(&state, JobKind::CompileOnly, source).await? {
        JobOutcome::Script(Ok(script)) => Ok((
            [(header::CONTENT_TYPE, "application/javascript; charset=utf-8")],
            script,
        )
            .into_response()),
        JobOutcome::Script(Err(failure)) => Err(ApiError::Compile(failure)),
        JobOutcome::Run(_) => Err(ApiError::Internal("worker returned a run outcome".into())),
    }
}

/// Compiles and executes; failures are reported in the body with a 200, the
/// way the desktop channel always resolved.
async fn run(
    State(state): State<CompileState>,
    payload: Result<Json<CompileRequest>, JsonRejection>,
) -> ApiResult<Json<CompileResult>> {
    let source = required_code(payload)?;
    ensure_toolchain(&state)?;

    match submit(&state, JobKind::Run, source).await? {
        JobOutcome::Run(result) => Ok(Json(result)),
        JobOutcome::Script(_) => Err(ApiError::Internal("worker returned a script outcome".into())),
    }
}

fn required_code(payload: Result<Json<CompileRequest>, JsonRejection>) -> ApiResult<String> {
    let Json(request) =
        payload.map_err(|rejection| ApiError::InvalidRequest(rejection.body_text()))?;
    match request.code {
        Some(code) if !code.trim().is_empty() => Ok(code),
        _ => Err(ApiError::InvalidRequest("C++ code is required.".to_string())),
    }
}

fn ensure_toolchain(state: &CompileState) -> ApiResult<()> {
    state.pipeline.toolchain_status().map_err(|reason| {
        ApiError::Compile(CompileFailure::new(ErrorKind::ConfigurationError, reason))
    })
}

async fn submit(state: &CompileState, kind: JobKind, source: String) -> ApiResult<JobOutcome> {
    let reply = state.scheduler.submit(kind, source)?;
    reply
        .await
        .map_err(|_| ApiError::Internal("worker dropped the job".to_string()))
}
