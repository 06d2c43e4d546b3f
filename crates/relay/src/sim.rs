//! Simulated plug provider for local development.
//!
//! Models what the hub relies on from a real plug service:
//! - a change counter reported as `latest`, so incremental polls work
//! - pulses that switch a plug back off when they expire
//! - "silent" plugs that never report a controllable state
//! - random failures, to exercise the hub's error path

use serde::Serialize;
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Point {
    name: String,
    silent: bool,
    on: bool,
    deadline: Option<i64>,
    cause: String,
}

impl Point {
    fn state(&self) -> &'static str {
        match (self.silent, self.on) {
            (true, _) => "silent",
            (false, true) => "on",
            (false, false) => "off",
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum SetError {
    UnknownPoint,
    InvalidState,
}

#[derive(Debug, Serialize)]
pub struct StatusMsg {
    pub host: String,
    pub timestamp: i64,
    pub latest: u64,
    pub control: Value,
}

pub struct RelaySim {
    points: Vec<Point>,
    latest: u64,
    failure_rate: f32,
    rng: fastrand::Rng,
}

// ---------------------------------------------------------------------------
// Simulator
// ---------------------------------------------------------------------------

impl RelaySim {
    /// Build from a comma list such as `porch,garden,garage:silent`.
    pub fn from_list(list: &str, failure_rate: f32) -> Self {
        let points = list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|entry| {
                let (name, silent) = match entry.split_once(':') {
                    Some((name, flag)) => (name, flag == "silent"),
                    None => (entry, false),
                };
                Point {
                    name: name.to_string(),
                    silent,
                    on: false,
                    deadline: None,
                    cause: String::new(),
                }
            })
            .collect();

        Self {
            points,
            latest: 1,
            failure_rate: failure_rate.clamp(0.0, 1.0),
            rng: fastrand::Rng::new(),
        }
    }

    pub fn latest(&self) -> u64 {
        self.latest
    }

    pub fn point_count(&self) -> usize {
        self.points.len()
    }

    /// True when the caller's cursor is current: nothing to send.
    pub fn is_current(&self, known: Option<u64>) -> bool {
        known == Some(self.latest)
    }

    pub fn status(&self, host: &str, now: i64) -> StatusMsg {
        let status: Map<String, Value> = self
            .points
            .iter()
            .map(|p| {
                let mode = if p.deadline.is_some() { "pulse" } else { "manual" };
                (
                    p.name.clone(),
                    serde_json::json!({ "state": p.state(), "mode": mode, "gear": "light" }),
                )
            })
            .collect();

        StatusMsg {
            host: host.to_string(),
            timestamp: now,
            latest: self.latest,
            control: serde_json::json!({ "status": status }),
        }
    }

    /// Apply a control. A positive pulse arms an expiry back to off.
    pub fn set(
        &mut self,
        point: &str,
        state: &str,
        pulse: i64,
        cause: &str,
        now: i64,
    ) -> Result<(), SetError> {
        let on = match state {
            "on" => true,
            "off" => false,
            _ => return Err(SetError::InvalidState),
        };
        let p = self
            .points
            .iter_mut()
            .find(|p| p.name == point)
            .ok_or(SetError::UnknownPoint)?;

        p.deadline = (pulse > 0 && on).then_some(now + pulse);
        p.cause = cause.to_string();
        if p.on != on {
            p.on = on;
            self.latest += 1;
            tracing::info!(point, state, pulse, cause, "switched");
        }
        Ok(())
    }

    /// Switch off every plug whose pulse has expired. Returns how many.
    pub fn expire(&mut self, now: i64) -> usize {
        let mut expired = 0;
        for p in &mut self.points {
            if matches!(p.deadline, Some(d) if d <= now) {
                p.deadline = None;
                if p.on {
                    p.on = false;
                    expired += 1;
                    tracing::info!(point = %p.name, cause = %p.cause, "pulse expired");
                }
            }
        }
        if expired > 0 {
            self.latest += 1;
        }
        expired
    }

    /// Draw whether the next control should fail.
    pub fn should_fail(&mut self) -> bool {
        self.failure_rate > 0.0 && self.rng.f32() < self.failure_rate
    }
}

// ===========================================================================
// Tests
// ===========================================================================
