//! Plug registry and control reconciler.
//!
//! The registry is not configured by the user: it learns about a plug the
//! first time something names it (a discovery payload or a command). Its job
//! is to find which provider controls each plug and to keep pushing the
//! commanded state until the provider reports it.
//!
//! ## Per-plug status
//!
//! ```text
//! Unmapped ──[discovered]──▶ Idle ──[command]──▶ Active
//!                             ▲                    │
//!                             └──[state reached, or HTTP 200]──┘
//! Idle/Active ──[HTTP error]──▶ Error ──[HTTP 200, or state reached]──▶ Idle
//! ```
//!
//! Providers may serve more than lights: points whose `gear` is anything
//! other than `"light"` are ignored.
//!
//! Nothing here performs I/O. Requests are queued in an outbox that the
//! runtime drains after every call.

use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

use crate::client::{Outbound, Reply};
use crate::discovery::DiscoveryDriver;
use crate::events::EventLog;
use crate::providers::ProviderRegistry;

/// Never leave a light on for longer than this, even without a pulse.
pub const PLUG_ON_LIMIT: i64 = 8 * 60 * 60;

/// Stop retrying a control this long after it was requested.
pub const PLUG_CONTROL_EXPIRATION: i64 = 60;

/// Observed state of a plug that reports no controllable state.
pub const SILENT: &str = "silent";

/// Discovery cycles without a mention before a plug is pruned.
const MAX_LIFE: u32 = 3;

const STATE_MAX_LEN: usize = 7;

// Discovery cadence, in seconds.
const PENDING_CHECK_INTERVAL: i64 = 2;
const FAST_SCAN_INTERVAL: i64 = 15;
const SLOW_SCAN_INTERVAL: i64 = 60;
const FAST_START_PERIOD: i64 = 120;
const PROVIDER_REFRESH_INTERVAL: i64 = 300;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Switch {
    On,
    Off,
}

impl Switch {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::On => "on",
            Self::Off => "off",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "on" => Some(Self::On),
            "off" => Some(Self::Off),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PlugStatus {
    #[serde(rename = "u")]
    Unmapped,
    #[serde(rename = "i")]
    Idle,
    #[serde(rename = "a")]
    Active,
    #[serde(rename = "e")]
    Error,
}

#[derive(Debug, Clone)]
pub struct Plug {
    pub name: String,
    /// Base URL of the controlling provider. Empty while unmapped.
    pub url: String,
    /// Last state reported by the provider. Empty until first acquisition.
    pub state: String,
    pub commanded: Option<Switch>,
    pub deadline: Option<i64>,
    pub cause: String,
    pub manual: bool,
    pub requested: i64,
    submitted: i64,
    pub countdown: u32,
    pub status: PlugStatus,
    /// The provider tagged this point as light gear.
    pub light: bool,
}

impl Plug {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            url: String::new(),
            state: String::new(),
            commanded: None,
            deadline: None,
            cause: String::new(),
            manual: false,
            requested: 0,
            submitted: 0,
            countdown: MAX_LIFE,
            status: PlugStatus::Unmapped,
            light: false,
        }
    }

    /// True when a control still needs to be pushed to the provider.
    pub fn control_pending(&self, now: i64) -> bool {
        let Some(commanded) = self.commanded else {
            return false;
        };
        if self.requested + PLUG_CONTROL_EXPIRATION < now {
            return false;
        }
        if matches!(self.deadline, Some(d) if d <= now) {
            return false;
        }
        self.state != commanded.as_str() && self.state != SILENT
    }

    fn lapsed(&self, now: i64) -> bool {
        match self.deadline {
            Some(d) => d <= now,
            None => self.requested + PLUG_CONTROL_EXPIRATION < now,
        }
    }
}

/// Handle to a plug slot. The generation makes a handle held by an in-flight
/// request go stale once its plug is pruned, even if the slot is reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PlugId {
    slot: usize,
    generation: u64,
}

#[derive(Debug)]
struct Slot {
    generation: u64,
    plug: Option<Plug>,
}

/// The command API the scheduler drives.
pub trait PlugCommander {
    fn command_plug(
        &mut self,
        name: &str,
        state: Switch,
        pulse: i64,
        manual: bool,
        cause: &str,
        now: i64,
    );
}

// ---------------------------------------------------------------------------
// Reconciler
// ---------------------------------------------------------------------------

pub struct Reconciler {
    slots: Vec<Slot>,
    index: HashMap<String, usize>,
    next_generation: u64,
    providers: ProviderRegistry,
    outbox: Vec<Outbound>,
    log: EventLog,
    started: i64,
    last_discovery: i64,
    providers_built: i64,
}

impl Reconciler {
    pub fn new(log: EventLog) -> Self {
        Self {
            slots: Vec::new(),
            index: HashMap::new(),
            next_generation: 1,
            providers: ProviderRegistry::new(),
            outbox: Vec::new(),
            log,
            started: 0,
            last_discovery: 0,
            providers_built: 0,
        }
    }

    // ── Lookup ──────────────────────────────────────────────────────

    pub fn get(&self, name: &str) -> Option<&Plug> {
        let slot = *self.index.get(name)?;
        self.slots[slot].plug.as_ref()
    }

    pub fn plugs(&self) -> impl Iterator<Item = &Plug> {
        self.slots.iter().filter_map(|s| s.plug.as_ref())
    }

    pub fn id_of(&self, name: &str) -> Option<PlugId> {
        let slot = *self.index.get(name)?;
        Some(PlugId {
            slot,
            generation: self.slots[slot].generation,
        })
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    pub fn providers_mut(&mut self) -> &mut ProviderRegistry {
        &mut self.providers
    }

    pub fn log(&self) -> &EventLog {
        &self.log
    }

    /// Drain every request queued since the last call.
    pub fn take_outbound(&mut self) -> Vec<Outbound> {
        std::mem::take(&mut self.outbox)
    }

    pub(crate) fn enqueue(&mut self, outbound: Outbound) {
        self.outbox.push(outbound);
    }

    fn lookup_mut(slots: &mut [Slot], id: PlugId) -> Option<&mut Plug> {
        let slot = slots.get_mut(id.slot)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.plug.as_mut()
    }

    /// Returns the plug's handle and whether it was just created.
    fn find_or_create(&mut self, name: &str) -> (PlugId, bool) {
        if let Some(id) = self.id_of(name) {
            return (id, false);
        }
        let generation = self.next_generation;
        self.next_generation += 1;

        let slot = match self.slots.iter().position(|s| s.plug.is_none()) {
            Some(free) => {
                self.slots[free] = Slot {
                    generation,
                    plug: Some(Plug::new(name)),
                };
                free
            }
            None => {
                self.slots.push(Slot {
                    generation,
                    plug: Some(Plug::new(name)),
                });
                self.slots.len() - 1
            }
        };
        self.index.insert(name.to_string(), slot);
        (PlugId { slot, generation }, true)
    }

    // ── Commands ────────────────────────────────────────────────────

    /// Record a commanded state and push it to the provider if known.
    /// A `pulse` of zero or less means "no pulse"; an "on" without a pulse
    /// is still bounded by `PLUG_ON_LIMIT`.
    pub fn command_plug(
        &mut self,
        name: &str,
        state: Switch,
        pulse: i64,
        manual: bool,
        cause: &str,
        now: i64,
    ) {
        let (id, created) = self.find_or_create(name);
        if created {
            // Incremental replies only list plugs that changed, so a new
            // name needs a full status from every provider.
            self.providers.reset_cursors();
        }
        let Some(plug) = Self::lookup_mut(&mut self.slots, id) else {
            return;
        };

        debug!(
            plug = %name,
            state = state.as_str(),
            pulse,
            manual,
            cause,
            "control requested"
        );

        plug.requested = now;
        plug.commanded = Some(state);
        plug.manual = manual;
        plug.cause = cause.to_string();

        plug.deadline = if pulse > 0 {
            Some(now + pulse)
        } else if state == Switch::On {
            Some(now + PLUG_ON_LIMIT)
        } else {
            None
        };

        // Scheduled controls are logged by the scheduler, once per edge.
        if manual {
            let detail = if pulse > 0 {
                format!("{} FOR {pulse} SECONDS", state.as_str().to_uppercase())
            } else {
                state.as_str().to_uppercase()
            };
            self.log.event("PLUG", name, "CONTROLLED", detail);
        }

        if plug.url.is_empty() {
            self.log
                .event_local("PLUG", name, "DEFERRED", "PROVIDER NOT DISCOVERED YET");
            return;
        }
        self.submit_control(id, now);
    }

    /// Queue the `/set` request for a plug's commanded state.
    fn submit_control(&mut self, id: PlugId, now: i64) {
        let Some(plug) = Self::lookup_mut(&mut self.slots, id) else {
            return;
        };
        let Some(commanded) = plug.commanded else {
            return;
        };
        if plug.url.is_empty() {
            return;
        }

        let pulse = plug.deadline.map(|d| (d - now).max(0)).unwrap_or(0);
        let mut url = match reqwest::Url::parse(&format!("{}/set", plug.url)) {
            Ok(u) => u,
            Err(e) => {
                self.log.failure(
                    &plug.name,
                    format!("invalid provider url {}: {e}", plug.url),
                );
                return;
            }
        };
        url.query_pairs_mut()
            .append_pair("point", &plug.name)
            .append_pair("state", commanded.as_str())
            .append_pair("pulse", &pulse.to_string())
            .append_pair("cause", &plug.cause);

        debug!(plug = %plug.name, manual = plug.manual, pulse, "control submitted");
        plug.submitted = now;
        if plug.status == PlugStatus::Idle {
            plug.status = PlugStatus::Active;
        }
        let provider = plug.url.clone();
        self.outbox.push(Outbound::Control {
            plug: id,
            provider,
            url: url.into(),
        });
    }

    /// Handle the reply to a `/set` request.
    pub fn on_control_reply(
        &mut self,
        id: PlugId,
        provider: &str,
        reply: Result<Reply, String>,
        now: i64,
    ) {
        let reply = match reply {
            Ok(r) => r,
            Err(e) => {
                // No retry here: the discovery cycle retries pending controls.
                let subject = Self::lookup_mut(&mut self.slots, id)
                    .map(|p| p.name.clone())
                    .unwrap_or_else(|| provider.to_string());
                self.log.failure(&subject, e);
                return;
            }
        };

        let context = match Self::lookup_mut(&mut self.slots, id) {
            Some(plug) => {
                if reply.status != 200 {
                    if plug.status != PlugStatus::Error {
                        plug.status = PlugStatus::Error;
                        self.log
                            .failure(&plug.name, format!("HTTP code {}", reply.status));
                    }
                    return;
                }
                plug.status = PlugStatus::Idle;
                plug.url.clone()
            }
            // Pruned while the request was in flight: the reply still
            // describes real plugs, so it is ingested anyway.
            None => {
                if reply.status != 200 {
                    self.log
                        .failure(provider, format!("HTTP code {}", reply.status));
                    return;
                }
                provider.to_string()
            }
        };

        if !reply.body.trim().is_empty() {
            self.ingest_discovery_payload(&context, &reply.body, now);
        }
    }

    // ── Discovery payloads ──────────────────────────────────────────

    /// Merge a provider's `control.status` report into the registry.
    pub fn ingest_discovery_payload(&mut self, provider: &str, body: &str, now: i64) {
        let doc: Value = match serde_json::from_str(body) {
            Ok(v) => v,
            Err(e) => {
                self.log
                    .failure(provider, format!("JSON syntax error, {e}"));
                return;
            }
        };
        let Some(controls) = doc.pointer("/control/status").and_then(Value::as_object) else {
            self.log.failure(provider, "no plug data");
            return;
        };
        if controls.is_empty() {
            self.log.failure(provider, "empty plug data");
            return;
        }

        let latest = doc.get("latest").and_then(Value::as_u64);
        self.providers.record_response(provider, latest, now);

        for (name, point) in controls {
            // Points without a gear tag are still accepted as lights.
            let gear = point.get("gear");
            if gear.is_some_and(|g| g.as_str() != Some("light")) {
                continue;
            }
            let state = point.get("state").and_then(Value::as_str);
            self.apply_point(provider, name, state, gear.is_some(), now);
        }
    }

    fn apply_point(
        &mut self,
        provider: &str,
        name: &str,
        state: Option<&str>,
        light: bool,
        now: i64,
    ) {
        let (id, _) = self.find_or_create(name);
        let Some(plug) = Self::lookup_mut(&mut self.slots, id) else {
            return;
        };
        plug.light = light;

        if let Some(state) = state.map(truncate_state) {
            if plug.state != state {
                let had_state = !plug.state.is_empty();
                plug.state = state;
                // The initial acquisition is not a change.
                if had_state {
                    self.log
                        .event("PLUG", name, "CHANGED", format!("TO {}", plug.state));
                }
            }
        }

        if plug.url != provider {
            if plug.url.is_empty() {
                self.log
                    .event_local("PLUG", name, "ROUTE", format!("SET TO {provider}"));
            } else {
                // A change of provider is unusual: keep it in the history.
                self.log.event(
                    "PLUG",
                    name,
                    "ROUTE",
                    format!("CHANGED FROM {} TO {provider}", plug.url),
                );
            }
            plug.url = provider.to_string();
            if plug.status == PlugStatus::Unmapped {
                plug.status = PlugStatus::Idle;
            }
        }

        if matches!(plug.status, PlugStatus::Active | PlugStatus::Error)
            && plug.commanded.is_some_and(|c| plug.state == c.as_str())
        {
            plug.status = PlugStatus::Idle;
        }
        plug.countdown = MAX_LIFE;

        // At most one submission per plug per second, so a provider that is
        // slow to switch does not turn every reply into a new request.
        if plug.control_pending(now) && plug.submitted < now {
            let commanded = plug.commanded.map(Switch::as_str).unwrap_or_default();
            self.log.event("PLUG", name, "RETRY", commanded);
            self.submit_control(id, now);
        }
    }

    /// A provider answered "not modified": its plugs are still alive.
    pub fn refresh_provider(&mut self, provider: &str, now: i64) {
        self.providers.record_response(provider, None, now);
        for slot in &mut self.slots {
            if let Some(plug) = &mut slot.plug {
                if plug.url == provider {
                    plug.countdown = MAX_LIFE;
                }
            }
        }
    }

    // ── Periodic work ───────────────────────────────────────────────

    /// Drive the discovery cadence. `now == 0` resets the cadence (after a
    /// configuration change) without any I/O.
    pub fn periodic_tick(&mut self, now: i64, driver: &DiscoveryDriver) {
        if now == 0 {
            self.started = 0;
            self.last_discovery = 0;
            self.providers.reset_cursors();
            return;
        }
        if self.started == 0 {
            self.started = now;
        }

        self.expire_commands(now);

        // A control waiting on its provider warrants a quick poll, but not in
        // the same second the command was issued.
        if now >= self.last_discovery + PENDING_CHECK_INTERVAL {
            let waiting = self
                .plugs()
                .any(|p| !p.url.is_empty() && p.control_pending(now) && now > p.requested);
            if waiting {
                self.last_discovery = 0;
            }
        }

        // Scan every 15s for the first 2 minutes so the house recovers fast
        // after an outage, then every minute.
        if now <= self.last_discovery + FAST_SCAN_INTERVAL {
            return;
        }
        if now <= self.last_discovery + SLOW_SCAN_INTERVAL
            && now >= self.started + FAST_START_PERIOD
        {
            return;
        }
        self.last_discovery = now;

        if now >= self.providers_built + PROVIDER_REFRESH_INTERVAL {
            self.providers.reset_all();
            self.providers_built = now;
        }

        debug!(now, "proceeding with discovery");
        driver.request_scan(self, now);
        self.prune_stale(now);
    }

    /// Forget commands that are neither pending nor holding a live pulse.
    fn expire_commands(&mut self, now: i64) {
        for slot in &mut self.slots {
            let Some(plug) = &mut slot.plug else {
                continue;
            };
            if plug.commanded.is_some() && plug.lapsed(now) && !plug.control_pending(now) {
                plug.commanded = None;
                plug.deadline = None;
                if plug.status == PlugStatus::Active {
                    plug.status = PlugStatus::Idle;
                }
            }
        }
    }

    /// One discovery cycle worth of aging. Plugs with a pending control are
    /// never pruned.
    pub fn prune_stale(&mut self, now: i64) {
        for slot in &mut self.slots {
            let expired = match &mut slot.plug {
                Some(plug) if !plug.control_pending(now) => {
                    plug.countdown = plug.countdown.saturating_sub(1);
                    plug.countdown == 0
                }
                _ => false,
            };
            if expired {
                if let Some(plug) = slot.plug.take() {
                    self.log
                        .event("PLUG", &plug.name, "PRUNE", format!("FROM {}", plug.url));
                    self.index.remove(&plug.name);
                }
            }
        }
        while matches!(self.slots.last(), Some(Slot { plug: None, .. })) {
            self.slots.pop();
        }
    }

    // ── Status ──────────────────────────────────────────────────────

    /// Serialize providers and plugs. Returns an empty string when the
    /// document would not fit in `capacity` bytes: callers must treat that
    /// as a transient failure, not as "no plugs".
    pub fn render_status(&self, capacity: usize) -> String {
        let doc = PlugsStatus {
            servers: self.providers.iter().map(|p| p.url.as_str()).collect(),
            plugs: self
                .plugs()
                .map(|p| {
                    let command = match (p.commanded, p.deadline) {
                        (Some(c), Some(d)) => Some((c.as_str(), d)),
                        _ => None,
                    };
                    PlugEntry {
                        name: &p.name,
                        status: p.status,
                        state: &p.state,
                        light: p.light,
                        url: (!p.url.is_empty()).then_some(p.url.as_str()),
                        command: command.map(|(c, _)| c),
                        expires: command.map(|(_, d)| d),
                    }
                })
                .collect(),
        };
        render_bounded(&doc, capacity, &self.log)
    }
}

impl PlugCommander for Reconciler {
    fn command_plug(
        &mut self,
        name: &str,
        state: Switch,
        pulse: i64,
        manual: bool,
        cause: &str,
        now: i64,
    ) {
        Reconciler::command_plug(self, name, state, pulse, manual, cause, now);
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct PlugsStatus<'a> {
    servers: Vec<&'a str>,
    plugs: Vec<PlugEntry<'a>>,
}

#[derive(Serialize)]
struct PlugEntry<'a> {
    name: &'a str,
    status: PlugStatus,
    state: &'a str,
    light: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    url: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    command: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    expires: Option<i64>,
}

/// Serialize `doc`, or log an overflow and return an empty string.
pub(crate) fn render_bounded<T: Serialize>(doc: &T, capacity: usize, log: &EventLog) -> String {
    match serde_json::to_string(doc) {
        Ok(text) if text.len() <= capacity => text,
        Ok(_) => {
            log.failure("BUFFER", "overflow");
            String::new()
        }
        Err(e) => {
            log.failure("BUFFER", format!("cannot serialize: {e}"));
            String::new()
        }
    }
}

fn truncate_state(s: &str) -> String {
    let mut end = 0;
    for (i, c) in s.char_indices() {
        if i + c.len_utf8() > STATE_MAX_LEN {
            break;
        }
        end = i + c.len_utf8();
    }
    s[..end].to_string()
}

// ===========================================================================
// Tests
// ===========================================================================
