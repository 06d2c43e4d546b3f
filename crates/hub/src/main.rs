mod almanac;
mod client;
mod config;
mod discovery;
mod events;
mod plugs;
mod providers;
mod schedule;
mod state;
mod store;
mod web;

use anyhow::Result;
use std::{env, sync::Arc, time::Duration};
use tokio::sync::RwLock;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use client::Dispatcher;
use state::SystemState;
use store::ConfigStore;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Settings ────────────────────────────────────────────────────
    let settings_path = env::var("HUB_SETTINGS").unwrap_or_else(|_| "hub.toml".to_string());
    let settings = config::load(&settings_path)?;

    // ── Lights config (schedules) ───────────────────────────────────
    let store = ConfigStore::load(&settings.lights_config)?;
    info!(path = %store.path().display(), "lights config ready");

    // ── Shared state ────────────────────────────────────────────────
    let (dispatcher, mut completions) =
        Dispatcher::new(Duration::from_secs(settings.request_timeout_sec))?;
    let shared = Arc::new(RwLock::new(SystemState::new(&settings, store, dispatcher)));
    {
        let st = shared.read().await;
        st.log.event_local(
            "SERVICE",
            &st.host,
            "STARTED",
            format!("{} SCHEDULES", st.schedule.rules().len()),
        );
    }

    // ── Web server ──────────────────────────────────────────────────
    let listener = web::bind(settings.web.port).await?;
    let web_state = Arc::clone(&shared);
    tokio::spawn(async move {
        if let Err(e) = web::serve(listener, web_state).await {
            error!("{e:#}");
        }
    });

    // ── Controller loop ─────────────────────────────────────────────
    // Ticks and replies are handled one at a time, each to completion.
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                shared.write().await.tick(state::now());
            }
            Some(completion) = completions.recv() => {
                shared.write().await.on_completion(completion, state::now());
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
        }
    }

    Ok(())
}
