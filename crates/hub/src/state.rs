//! Shared controller state and the glue between the engine parts.
//!
//! Every entry point takes the lock, runs one synchronous engine call to the
//! end, then dispatches whatever requests it queued.

use serde::Serialize;
use serde_json::value::RawValue;
use std::sync::Arc;
use std::time::Instant;
use sysinfo::System;
use tokio::sync::RwLock;

use crate::almanac::Almanac;
use crate::client::{Completion, Dispatcher};
use crate::config::Settings;
use crate::discovery::{DiscoveryDriver, StaticDirectory};
use crate::events::{EventLog, LogEntry};
use crate::plugs::{Reconciler, Switch};
use crate::schedule::Schedule;
use crate::store::ConfigStore;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

/// Engine clock, unix seconds.
pub fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct SystemState {
    pub started_at: Instant,
    pub host: String,
    pub proxy: String,
    capacity: usize,
    pub log: EventLog,
    pub plugs: Reconciler,
    pub schedule: Schedule,
    discovery: DiscoveryDriver,
    almanac: Box<dyn Almanac>,
    store: ConfigStore,
    dispatcher: Dispatcher,
}

// ---------------------------------------------------------------------------
// JSON documents (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct Envelope<'a> {
    host: &'a str,
    proxy: &'a str,
    timestamp: i64,
    lights: &'a RawValue,
}

#[derive(Serialize)]
pub struct EventsResponse {
    pub host: String,
    pub timestamp: i64,
    pub uptime_secs: u64,
    pub events: Vec<LogEntry>,
}

// ---------------------------------------------------------------------------
// Construction
// ---------------------------------------------------------------------------

impl SystemState {
    pub fn new(settings: &Settings, store: ConfigStore, dispatcher: Dispatcher) -> Self {
        let log = EventLog::new();
        let directory = StaticDirectory::new(settings.discovery.control.clone());

        let mut state = Self {
            started_at: Instant::now(),
            host: System::host_name().unwrap_or_else(|| "localhost".to_string()),
            proxy: settings.proxy.clone(),
            capacity: settings.status_capacity,
            plugs: Reconciler::new(log.clone()),
            schedule: Schedule::new(log.clone()),
            discovery: DiscoveryDriver::new(Box::new(directory)),
            almanac: Box::new(settings.almanac()),
            store,
            dispatcher,
            log,
        };
        state.reload_schedule(now());
        state
    }

    /// Replace every rule with the ones in the lights config.
    pub fn reload_schedule(&mut self, now: i64) {
        let lights = self.store.lights();
        self.schedule.replace_rules(&lights, now);
    }

    fn flush(&mut self) {
        let batch = self.plugs.take_outbound();
        if !batch.is_empty() {
            self.dispatcher.dispatch(batch);
        }
    }

    // ── Background loop ─────────────────────────────────────────────

    /// One-second housekeeping: discovery cadence, then schedule.
    pub fn tick(&mut self, now: i64) {
        self.plugs.periodic_tick(now, &self.discovery);
        self.schedule
            .evaluate(now, self.almanac.as_ref(), &mut self.plugs);
        self.flush();
    }

    pub fn on_completion(&mut self, completion: Completion, now: i64) {
        match completion {
            Completion::Control {
                plug,
                provider,
                reply,
            } => self.plugs.on_control_reply(plug, &provider, reply, now),
            Completion::Status { provider, reply } => {
                self.discovery
                    .on_status_response(&mut self.plugs, &provider, reply, now)
            }
        }
        self.flush();
    }

    // ── Commands ────────────────────────────────────────────────────

    pub fn command(&mut self, device: &str, state: Switch, pulse: i64, cause: &str, now: i64) {
        self.plugs.command_plug(device, state, pulse, true, cause, now);
        self.flush();
    }

    pub fn add_rule(
        &mut self,
        device: &str,
        on: &str,
        off: Option<&str>,
        days: u8,
        now: i64,
    ) -> u32 {
        let id = self.schedule.add_rule(device, Some(on), off, days, now);
        // The new plug may not be known yet.
        self.plugs.periodic_tick(0, &self.discovery);
        self.save_schedule(now);
        id
    }

    pub fn delete_rule(&mut self, id: u32, now: i64) -> bool {
        let deleted = self.schedule.delete_rule(id);
        if deleted {
            self.save_schedule(now);
        }
        deleted
    }

    pub fn set_schedule_enabled(&mut self, enabled: bool, now: i64) {
        if enabled {
            self.schedule.enable();
        } else {
            self.schedule.disable();
        }
        self.save_schedule(now);
    }

    /// The schedule document is the config format: write it back as is.
    fn save_schedule(&mut self, now: i64) {
        let Some(text) = self.schedule_document(now) else {
            return;
        };
        if let Err(e) = self.store.save(&text) {
            self.log.failure("CONFIG", format!("{e:#}"));
        }
    }

    // ── Documents ───────────────────────────────────────────────────

    /// `None` when the lights section overflowed.
    pub fn status_document(&self, now: i64) -> Option<String> {
        self.envelope(self.plugs.render_status(self.capacity), now)
    }

    pub fn schedule_document(&self, now: i64) -> Option<String> {
        self.envelope(self.schedule.render(self.capacity), now)
    }

    pub fn events(&self, now: i64) -> EventsResponse {
        EventsResponse {
            host: self.host.clone(),
            timestamp: now,
            uptime_secs: self.started_at.elapsed().as_secs(),
            events: self.log.entries(),
        }
    }

    fn envelope(&self, lights: String, now: i64) -> Option<String> {
        if lights.is_empty() {
            return None;
        }
        let lights = match RawValue::from_string(lights) {
            Ok(raw) => raw,
            Err(e) => {
                self.log.failure("BUFFER", format!("invalid document: {e}"));
                return None;
            }
        };
        let doc = Envelope {
            host: &self.host,
            proxy: &self.proxy,
            timestamp: now,
            lights: &lights,
        };
        match serde_json::to_string(&doc) {
            Ok(text) => Some(text),
            Err(e) => {
                self.log.failure("BUFFER", format!("cannot serialize: {e}"));
                None
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const NOW: i64 = 1_760_000_000;

    fn state_in(dir: &tempfile::TempDir, lights: Option<&str>) -> SystemState {
        let path = dir.path().join("lights.json");
        if let Some(text) = lights {
            std::fs::write(&path, text).unwrap();
        }
        let settings = Settings {
            discovery: crate::config::DiscoverySettings { control: vec![] },
            ..Settings::default()
        };
        let store = ConfigStore::load(&path).unwrap();
        let (dispatcher, _rx) = Dispatcher::new(Duration::from_secs(1)).unwrap();
        SystemState::new(&settings, store, dispatcher)
    }

    #[tokio::test]
    async fn schedule_is_loaded_from_lights_config() {
        let dir = tempfile::tempdir().unwrap();
        let st = state_in(
            &dir,
            Some(r#"{"lights":{"mode":"manual","schedules":[{"device":"porch","on":"21:00","off":"23:00"}]}}"#),
        );
        assert!(!st.schedule.is_enabled());
        assert_eq!(st.schedule.rules().len(), 1);
    }

    #[tokio::test]
    async fn saved_schedule_reloads_identically() {
        let dir = tempfile::tempdir().unwrap();
        let mut st = state_in(&dir, None);
        st.add_rule("porch", "+00:30", Some("23:00"), 62, NOW);
        st.set_schedule_enabled(false, NOW);

        let mut reloaded = state_in(&dir, None);
        reloaded.reload_schedule(NOW);
        assert!(!reloaded.schedule.is_enabled());
        let rule = &reloaded.schedule.rules()[0];
        assert_eq!(rule.device, "porch");
        assert_eq!(rule.on.to_string(), "+00:30");
        assert_eq!(rule.off.to_string(), "23:00");
        assert_eq!(rule.days, 62);
    }

    #[tokio::test]
    async fn status_document_wraps_lights() {
        let dir = tempfile::tempdir().unwrap();
        let mut st = state_in(&dir, None);
        st.command("porch", Switch::On, 30, "MANUAL", NOW);

        let doc: serde_json::Value =
            serde_json::from_str(&st.status_document(NOW).unwrap()).unwrap();
        assert_eq!(doc["timestamp"], NOW);
        assert_eq!(doc["host"], st.host.as_str());
        assert_eq!(doc["lights"]["plugs"][0]["name"], "porch");
    }

    #[tokio::test]
    async fn overflow_yields_no_document() {
        let dir = tempfile::tempdir().unwrap();
        let mut st = state_in(&dir, None);
        st.capacity = 16;
        st.command("porch", Switch::On, 30, "MANUAL", NOW);
        assert!(st.status_document(NOW).is_none());
    }

    #[tokio::test]
    async fn delete_unknown_rule_does_not_save() {
        let dir = tempfile::tempdir().unwrap();
        let mut st = state_in(&dir, None);
        assert!(!st.delete_rule(42, NOW));
        assert!(!dir.path().join("lights.json").exists());
    }
}
