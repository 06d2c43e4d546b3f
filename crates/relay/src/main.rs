mod sim;

use anyhow::{Context, Result};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use std::collections::HashMap;
use std::net::SocketAddr;
use chrono::Utc;
use std::{env, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::info;
use tracing_subscriber::EnvFilter;

use sim::{RelaySim, SetError};

#[derive(Clone)]
struct AppState {
    host: Arc<str>,
    sim: Arc<Mutex<RelaySim>>,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

fn router(state: AppState) -> Router {
    Router::new()
        .route("/relay/status", get(relay_status))
        .route("/relay/set", get(relay_set))
        .with_state(state)
}

async fn relay_status(
    State(app): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let sim = app.sim.lock().await;
    let known = params.get("known").and_then(|k| k.parse().ok());
    if sim.is_current(known) {
        return StatusCode::NOT_MODIFIED.into_response();
    }
    Json(sim.status(&app.host, Utc::now().timestamp())).into_response()
}

async fn relay_set(
    State(app): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let point = params.get("point").map(String::as_str).unwrap_or_default();
    let state = params.get("state").map(String::as_str).unwrap_or_default();
    let pulse = params
        .get("pulse")
        .and_then(|p| p.parse().ok())
        .unwrap_or(0);
    let cause = params.get("cause").map(String::as_str).unwrap_or("MANUAL");

    let now = Utc::now().timestamp();
    let mut sim = app.sim.lock().await;
    if sim.should_fail() {
        return (StatusCode::SERVICE_UNAVAILABLE, "simulated failure").into_response();
    }
    match sim.set(point, state, pulse, cause, now) {
        Ok(()) => Json(sim.status(&app.host, now)).into_response(),
        Err(SetError::UnknownPoint) => {
            (StatusCode::NOT_FOUND, format!("unknown point {point}")).into_response()
        }
        Err(SetError::InvalidState) => {
            (StatusCode::BAD_REQUEST, format!("invalid state {state}")).into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// Entry-point
// ---------------------------------------------------------------------------

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let port: u16 = env::var("RELAY_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8081);
    let plugs = env::var("RELAY_PLUGS").unwrap_or_else(|_| "porch,garden,garage".to_string());
    let failure_rate: f32 = env::var("RELAY_FAILURE_RATE")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0.0);
    let host = env::var("RELAY_HOST").unwrap_or_else(|_| "relay-sim".to_string());

    let sim = RelaySim::from_list(&plugs, failure_rate);
    info!(plugs = sim.point_count(), failure_rate, "relay simulator ready");

    let app = AppState {
        host: host.into(),
        sim: Arc::new(Mutex::new(sim)),
    };

    // ── Pulse expiry ────────────────────────────────────────────────
    let expiry = Arc::clone(&app.sim);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            ticker.tick().await;
            expiry.lock().await.expire(Utc::now().timestamp());
        }
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind relay port {port}"))?;
    info!(%addr, "relay listening on http://{addr}/relay");

    axum::serve(listener, router(app))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("relay server error")
}

// ===========================================================================
// Tests
// ===========================================================================
