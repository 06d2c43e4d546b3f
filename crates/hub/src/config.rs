//! TOML settings file loading and validation.

use anyhow::{bail, Context, Result};
use chrono::NaiveTime;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use tracing::{info, warn};

use crate::almanac::FixedAlmanac;

// ---------------------------------------------------------------------------
// Settings file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub web: WebSettings,
    pub discovery: DiscoverySettings,
    pub almanac: Option<AlmanacSettings>,
    /// Reported as `proxy` in every status document.
    pub proxy: String,
    /// Path of the JSON lights configuration.
    pub lights_config: String,
    /// Largest status or schedule document, in bytes.
    pub status_capacity: usize,
    pub request_timeout_sec: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebSettings {
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DiscoverySettings {
    /// Base URLs of the control providers.
    pub control: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlmanacSettings {
    /// Local time of day, `HH:MM`.
    pub sunrise: String,
    pub sunset: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            web: WebSettings::default(),
            discovery: DiscoverySettings::default(),
            almanac: None,
            proxy: String::new(),
            lights_config: "/etc/house/lights.json".to_string(),
            status_capacity: 65536,
            request_timeout_sec: 10,
        }
    }
}

impl Default for WebSettings {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            control: vec!["http://localhost/relay".to_string()],
        }
    }
}

const MIN_STATUS_CAPACITY: usize = 1024;
const MAX_REQUEST_TIMEOUT_SEC: u64 = 300;

fn parse_time(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M").ok()
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Settings {
    /// Validate every section. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_web(&mut errors);
        self.validate_discovery(&mut errors);
        self.validate_almanac(&mut errors);

        if self.lights_config.trim().is_empty() {
            errors.push("lights_config is empty".to_string());
        }
        if self.status_capacity < MIN_STATUS_CAPACITY {
            errors.push(format!(
                "status_capacity {} is below the minimum of {MIN_STATUS_CAPACITY}",
                self.status_capacity
            ));
        }
        if !(1..=MAX_REQUEST_TIMEOUT_SEC).contains(&self.request_timeout_sec) {
            errors.push(format!(
                "request_timeout_sec {} out of range [1, {MAX_REQUEST_TIMEOUT_SEC}]",
                self.request_timeout_sec
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "settings validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_web(&self, errors: &mut Vec<String>) {
        if self.web.port == 0 {
            errors.push("web.port must not be 0".to_string());
        }
    }

    fn validate_discovery(&self, errors: &mut Vec<String>) {
        let mut seen: HashSet<&str> = HashSet::new();

        for (i, url) in self.discovery.control.iter().enumerate() {
            let trimmed = url.trim_end_matches('/');
            match reqwest::Url::parse(trimmed) {
                Ok(u) if matches!(u.scheme(), "http" | "https") => {}
                Ok(u) => errors.push(format!(
                    "discovery.control[{i}]: unsupported scheme '{}' in {url}",
                    u.scheme()
                )),
                Err(e) => errors.push(format!("discovery.control[{i}]: invalid url {url}: {e}")),
            }
            if !seen.insert(trimmed) {
                errors.push(format!("discovery.control[{i}]: duplicate url {url}"));
            }
        }
    }

    fn validate_almanac(&self, errors: &mut Vec<String>) {
        let Some(almanac) = &self.almanac else {
            return;
        };
        let sunrise = parse_time(&almanac.sunrise);
        let sunset = parse_time(&almanac.sunset);

        // ── Format ──────────────────────────────────────────────
        if sunrise.is_none() {
            errors.push(format!(
                "almanac.sunrise '{}' is not a HH:MM time",
                almanac.sunrise
            ));
        }
        if sunset.is_none() {
            errors.push(format!(
                "almanac.sunset '{}' is not a HH:MM time",
                almanac.sunset
            ));
        }

        // ── Ordering ────────────────────────────────────────────
        if let (Some(rise), Some(set)) = (sunrise, sunset) {
            if rise >= set {
                errors.push(format!(
                    "almanac.sunrise ({}) must be earlier than almanac.sunset ({})",
                    almanac.sunrise, almanac.sunset
                ));
            }
        }
    }

    /// The almanac these settings describe. Not ready when unconfigured.
    pub fn almanac(&self) -> FixedAlmanac {
        self.almanac
            .as_ref()
            .and_then(|a| Some(FixedAlmanac::new(parse_time(&a.sunrise)?, parse_time(&a.sunset)?)))
            .unwrap_or_else(FixedAlmanac::unavailable)
    }

    /// Apply `WEB_PORT` and `LIGHTS_CONFIG` overrides.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(port) = lookup("WEB_PORT") {
            match port.parse() {
                Ok(p) => self.web.port = p,
                Err(_) => warn!(value = %port, "ignoring invalid WEB_PORT"),
            }
        }
        if let Some(path) = lookup("LIGHTS_CONFIG") {
            self.lights_config = path;
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, apply environment overrides, and validate the settings file.
/// A missing file yields the defaults.
pub fn load(path: &str) -> Result<Settings> {
    let mut settings = if Path::new(path).exists() {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read settings: {path}"))?;
        toml::from_str(&contents).with_context(|| format!("failed to parse settings: {path}"))?
    } else {
        info!(path, "no settings file, using defaults");
        Settings::default()
    };

    settings.apply_env(|key| std::env::var(key).ok());
    settings
        .validate()
        .with_context(|| format!("invalid settings: {path}"))?;

    info!(
        port = settings.web.port,
        providers = settings.discovery.control.len(),
        almanac = settings.almanac.is_some(),
        lights_config = %settings.lights_config,
        "settings loaded"
    );
    Ok(settings)
}

// ===========================================================================
// Tests
// ===========================================================================
