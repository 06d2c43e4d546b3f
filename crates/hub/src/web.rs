use anyhow::{Context, Result};
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::info;

use crate::plugs::Switch;
use crate::state::{now, SharedState};

type Params = Query<HashMap<String, String>>;

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/lights/status", get(lights_status))
        .route("/lights/schedule", get(lights_schedule))
        .route("/lights/set", get(lights_set))
        .route("/lights/enable", get(lights_enable))
        .route("/lights/disable", get(lights_disable))
        .route("/lights/add", get(lights_add))
        .route("/lights/delete", get(lights_delete))
        .route("/lights/events", get(lights_events))
        .with_state(state)
}

/// An empty document means the render overflowed: report it as transient.
fn json_document(doc: Option<String>) -> Response {
    match doc {
        Some(body) => ([(header::CONTENT_TYPE, "application/json")], body).into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "status unavailable").into_response(),
    }
}

fn reject(code: StatusCode, msg: impl Into<String>) -> Response {
    (code, msg.into()).into_response()
}

async fn lights_status(State(state): State<SharedState>) -> Response {
    let st = state.read().await;
    json_document(st.status_document(now()))
}

async fn lights_schedule(State(state): State<SharedState>) -> Response {
    let st = state.read().await;
    json_document(st.schedule_document(now()))
}

async fn lights_events(State(state): State<SharedState>) -> impl IntoResponse {
    let st = state.read().await;
    Json(st.events(now()))
}

async fn lights_set(State(state): State<SharedState>, Query(params): Params) -> Response {
    // ── Parameters ──────────────────────────────────────────────
    let Some(device) = params.get("device") else {
        return reject(StatusCode::NOT_FOUND, "missing device");
    };
    let Some(requested) = params.get("state") else {
        return reject(StatusCode::BAD_REQUEST, "missing state");
    };
    let Some(switch) = Switch::parse(requested) else {
        return reject(StatusCode::BAD_REQUEST, format!("invalid state {requested}"));
    };
    let pulse = match params.get("pulse").map(|p| p.parse::<i64>()) {
        None => 0,
        Some(Ok(p)) if p >= 0 => p,
        Some(_) => return reject(StatusCode::BAD_REQUEST, "invalid pulse"),
    };
    let cause = params.get("cause").map(String::as_str).unwrap_or("MANUAL");

    let now = now();
    let mut st = state.write().await;
    st.command(device, switch, pulse, cause, now);
    json_document(st.status_document(now))
}

async fn lights_enable(State(state): State<SharedState>) -> Response {
    let now = now();
    let mut st = state.write().await;
    st.set_schedule_enabled(true, now);
    json_document(st.schedule_document(now))
}

async fn lights_disable(State(state): State<SharedState>) -> Response {
    let now = now();
    let mut st = state.write().await;
    st.set_schedule_enabled(false, now);
    json_document(st.schedule_document(now))
}

async fn lights_add(State(state): State<SharedState>, Query(params): Params) -> Response {
    let (Some(device), Some(on)) = (params.get("device"), params.get("on")) else {
        return reject(StatusCode::BAD_REQUEST, "missing device or on time");
    };
    let days = match params.get("days").map(|d| d.parse::<u8>()) {
        None => 0,
        Some(Ok(d)) => d,
        Some(Err(_)) => return reject(StatusCode::BAD_REQUEST, "invalid days"),
    };

    let now = now();
    let mut st = state.write().await;
    let id = st.add_rule(device, on, params.get("off").map(String::as_str), days, now);
    info!(id, device = %device, "rule added");
    json_document(st.schedule_document(now))
}

async fn lights_delete(State(state): State<SharedState>, Query(params): Params) -> Response {
    let Some(id) = params.get("id").and_then(|id| id.parse::<u32>().ok()) else {
        return reject(StatusCode::BAD_REQUEST, "missing or invalid id");
    };

    let now = now();
    let mut st = state.write().await;
    if st.delete_rule(id, now) {
        info!(id, "rule deleted");
    }
    json_document(st.schedule_document(now))
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn bind(port: u16) -> Result<TcpListener> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;
    info!(%addr, "web api listening");
    Ok(listener)
}

pub async fn serve(listener: TcpListener, state: SharedState) -> Result<()> {
    axum::serve(listener, router(state))
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================
