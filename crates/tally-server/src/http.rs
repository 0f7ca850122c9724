use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::header::{self, HeaderValue};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};

use tally_core::SessionError;
use tally_tools::Credential;
use tally_types::ChatRequest;
use tally_wire::WireErrorBody;

use crate::AppState;

pub const MESSAGE_ID_HEADER: &str = "x-tally-message-id";

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let app = app_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "tally server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_err() {
                futures::future::pending::<()>().await;
            }
        })
        .await?;
    Ok(())
}

pub fn app_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers([header::HeaderName::from_static(MESSAGE_ID_HEADER)]);

    Router::new()
        .route("/global/health", get(global_health))
        .route("/api/chat", post(chat))
        .route("/api/tools", get(list_tools))
        .route("/api/providers", get(list_providers))
        .layer(cors)
        .with_state(state)
}

async fn global_health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "healthy": true,
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeMs": state.uptime_ms(),
        "providers": state.orchestrator.providers().list().len(),
        "tools": state.orchestrator.tools().schemas().len(),
    }))
}

async fn list_tools(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "tools": state.orchestrator.tools().schemas() }))
}

async fn list_providers(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "providers": state.orchestrator.providers().list() }))
}

/// Streams one assistant message as server-sent events. Failures detected
/// before the first frame are answered with a JSON error instead.
async fn chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<ChatRequest>, JsonRejection>,
) -> Response {
    let request = match body {
        Ok(Json(request)) => request,
        Err(rejection) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "INVALID_REQUEST",
                &rejection.body_text(),
            );
        }
    };
    let credential = credential_from_headers(&headers);
    let session = match state.orchestrator.open(request, credential).await {
        Ok(session) => session,
        Err(err) => {
            tracing::warn!(code = err.code(), error = %err, "chat request rejected");
            return session_error_response(&err);
        }
    };

    let message_id = session.message_id().to_string();
    let (frames, report) = session.split();
    tokio::spawn(async move {
        if let Some(report) = report.wait().await {
            tracing::debug!(
                message_id = %report.message_id,
                frames = report.frames.len(),
                tool_calls = report.tool_calls,
                termination = ?report.termination,
                "chat stream finished"
            );
        }
    });

    let events = frames.map(|payload| Ok::<_, Infallible>(Event::default().data(payload)));
    let mut response = Sse::new(events)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(10)))
        .into_response();
    if let Ok(value) = HeaderValue::from_str(&message_id) {
        response.headers_mut().insert(MESSAGE_ID_HEADER, value);
    }
    response
}

/// The caller's own credential, passed through to the record API untouched.
fn credential_from_headers(headers: &HeaderMap) -> Credential {
    let read = |name: header::HeaderName| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(ToString::to_string)
    };
    Credential {
        authorization: read(header::AUTHORIZATION),
        cookie: read(header::COOKIE),
    }
}

fn session_error_response(err: &SessionError) -> Response {
    let status = match err {
        SessionError::EmptyConversation | SessionError::NoProvider(_) => StatusCode::BAD_REQUEST,
        SessionError::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        SessionError::Backend(fault) if fault.code() == "TOOL_SCHEMA_INVALID" => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
        SessionError::Backend(_) => StatusCode::BAD_GATEWAY,
    };
    error_response(status, err.code(), &err.to_string())
}

fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
    (status, Json(WireErrorBody::new(code, message).to_value())).into_response()
}
