use crate::{
    ami::{AmiError, OriginateOptions},
    app::AppState,
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tracing::{info, warn};

pub fn ami_router(app_state: AppState) -> Router {
    let r = Router::new()
        .route("/status", get(status_handler))
        .route("/calls", get(list_calls))
        .route("/calls/{id}", get(get_call))
        .route("/calls/{id}/answer", post(answer_call))
        .route("/calls/{id}/reject", post(reject_call))
        .route("/calls/{id}/hangup", post(hangup_call))
        .route("/calls/{id}/transfer", post(transfer_call))
        .route("/calls/{id}/hold", post(hold_call))
        .route("/originate", post(originate_handler))
        .route("/extensions", get(list_extensions))
        .route("/extensions/{ext}", get(extension_status))
        .route("/sipconfig/{ext}", get(sip_config))
        .route("/shutdown", post(shutdown_handler));
    Router::new().nest("/ami/v1", r).with_state(app_state)
}

#[derive(Debug, Deserialize)]
pub struct OriginateRequest {
    pub from: String,
    pub to: String,
    #[serde(flatten)]
    pub options: OriginateOptions,
}

#[derive(Debug, Deserialize)]
pub struct TargetRequest {
    pub extension: String,
}

#[derive(Debug, Deserialize)]
pub struct HoldRequest {
    #[serde(default = "default_hold")]
    pub hold: bool,
}

fn default_hold() -> bool {
    true
}

fn error_response(err: AmiError) -> Response {
    let status = match err {
        AmiError::CallNotFound { .. } => StatusCode::NOT_FOUND,
        AmiError::NotConnected | AmiError::Connection { .. } => StatusCode::SERVICE_UNAVAILABLE,
        AmiError::ActionTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        AmiError::ActionRejected { .. } | AmiError::Authentication { .. } => {
            StatusCode::BAD_GATEWAY
        }
        AmiError::NotImplemented { .. } => StatusCode::NOT_IMPLEMENTED,
    };
    let body = serde_json::json!({
        "error": err.to_string(),
        "detail": err,
    });
    (status, Json(body)).into_response()
}

fn reply_response<T: serde::Serialize>(result: Result<T, AmiError>) -> Response {
    match result {
        Ok(value) => Json(value).into_response(),
        Err(e) => error_response(e),
    }
}

pub(super) async fn status_handler(State(state): State<AppState>) -> Response {
    Json(serde_json::json!({
        "status": "running",
        "uptime": state.uptime_secs(),
        "version": crate::version::get_useragent(),
        "ami": state.client.get_status(),
    }))
    .into_response()
}

async fn list_calls(State(state): State<AppState>) -> Response {
    Json(state.client.get_active_calls()).into_response()
}

async fn get_call(Path(id): Path<String>, State(state): State<AppState>) -> Response {
    match state.client.get_call(&id) {
        Some(call) => Json(call).into_response(),
        None => error_response(AmiError::call_not_found(&id)),
    }
}

async fn answer_call(
    Path(id): Path<String>,
    State(state): State<AppState>,
    Json(req): Json<TargetRequest>,
) -> Response {
    reply_response(state.client.answer(&id, &req.extension).await)
}

async fn reject_call(Path(id): Path<String>, State(state): State<AppState>) -> Response {
    reply_response(state.client.reject(&id).await)
}

async fn hangup_call(Path(id): Path<String>, State(state): State<AppState>) -> Response {
    reply_response(state.client.hang_up(&id).await)
}

async fn transfer_call(
    Path(id): Path<String>,
    State(state): State<AppState>,
    Json(req): Json<TargetRequest>,
) -> Response {
    reply_response(state.client.transfer(&id, &req.extension).await)
}

async fn hold_call(
    Path(id): Path<String>,
    State(state): State<AppState>,
    body: Option<Json<HoldRequest>>,
) -> Response {
    let hold = body.map(|Json(req)| req.hold).unwrap_or_else(default_hold);
    reply_response(state.client.hold(&id, hold).await)
}

async fn originate_handler(
    State(state): State<AppState>,
    Json(req): Json<OriginateRequest>,
) -> Response {
    info!(from = %req.from, to = %req.to, "originate requested");
    reply_response(state.client.originate(&req.from, &req.to, req.options).await)
}

async fn list_extensions(State(state): State<AppState>) -> Response {
    Json(state.client.get_extensions()).into_response()
}

async fn extension_status(Path(ext): Path<String>, State(state): State<AppState>) -> Response {
    reply_response(state.client.get_extension_status(&ext).await)
}

async fn sip_config(Path(ext): Path<String>, State(state): State<AppState>) -> Response {
    Json(state.client.get_sip_config(&ext)).into_response()
}

async fn shutdown_handler(State(state): State<AppState>) -> Response {
    warn!("Shutdown initiated via /shutdown endpoint");
    state.token.cancel();
    Json(serde_json::json!({"status": "shutdown initiated"})).into_response()
}
