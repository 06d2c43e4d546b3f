//! Time-window schedule evaluator.
//!
//! Each rule keeps one plug on between an "on" and an "off" time on selected
//! days. While a window is active the plug gets a short pulse on every
//! evaluation, so lights go off on their own when nothing refreshes them.

use chrono::{Datelike, Local, TimeZone};
use serde::Serialize;
use std::fmt;
use thiserror::Error;

use crate::almanac::Almanac;
use crate::events::EventLog;
use crate::plugs::{render_bounded, PlugCommander, Switch};
use crate::store::LightsConfig;

/// Minimum time between two evaluations.
const EVALUATION_INTERVAL: i64 = 30;

/// Pulse sent on every evaluation of an active window.
pub const SCHEDULE_PULSE: i64 = 40;
pub const SCHEDULE_CAUSE: &str = "SCHEDULE";

const JITTER_RANGE: i64 = 300;
const JITTER_PERIOD: i64 = 300;

const MAX_WINDOW: i64 = 12 * 60 * 60;

const ALL_DAYS: u8 = 0x7f;
const RULE_ID_BASE: u32 = 0x100_0000;

// ---------------------------------------------------------------------------
// Time specifications
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeSpec {
    Never,
    /// Time of day. Negative minutes count back from the hour.
    Fixed { hour: u8, minutes: i32 },
    /// Minutes from sunrise, negative is before.
    Sunrise { offset: i32 },
    /// Minutes from sunset, positive is after.
    Sunset { offset: i32 },
}

/// Leading integer, like C `atoi`: garbage yields 0.
fn leading_int(s: &str) -> i32 {
    let s = s.trim_start();
    let (sign, digits) = match s.strip_prefix('-') {
        Some(rest) => (-1, rest),
        None => (1, s.strip_prefix('+').unwrap_or(s)),
    };
    let end = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len());
    sign * digits[..end].parse::<i32>().unwrap_or(0)
}

/// Split `hh[:mm]` and clamp both fields.
fn hours_minutes(s: &str) -> (i32, i32) {
    let (h, m) = match s.split_once(':') {
        Some((h, m)) => (leading_int(h), leading_int(m)),
        None => (leading_int(s), 0),
    };
    (h.clamp(0, 23), m.clamp(-30, 59))
}

impl TimeSpec {
    pub fn import(text: Option<&str>) -> Self {
        let Some(text) = text.map(str::trim) else {
            return Self::Never;
        };
        if text.is_empty() || text == "never" {
            return Self::Never;
        }

        // Legacy forms: "sunrise[:mm]" and "sunset[:mm]".
        for (word, sunrise) in [("sunrise", true), ("sunset", false)] {
            if let Some(rest) = text.strip_prefix(word) {
                let offset = rest
                    .strip_prefix(':')
                    .map(leading_int)
                    .unwrap_or(0)
                    .clamp(-30, 59);
                return if sunrise {
                    Self::Sunrise { offset }
                } else {
                    Self::Sunset { offset }
                };
            }
        }

        if let Some(rest) = text.strip_prefix('-') {
            let (h, m) = hours_minutes(rest);
            return Self::Sunrise {
                offset: -(h * 60 + m),
            };
        }
        if let Some(rest) = text.strip_prefix('+') {
            let (h, m) = hours_minutes(rest);
            return Self::Sunset { offset: h * 60 + m };
        }

        let (h, m) = hours_minutes(text);
        Self::Fixed {
            hour: h as u8,
            minutes: m,
        }
    }

    /// `'-'` for sunrise, `'+'` for sunset, `None` otherwise.
    pub fn base(&self) -> Option<char> {
        match self {
            Self::Sunrise { .. } => Some('-'),
            Self::Sunset { .. } => Some('+'),
            _ => None,
        }
    }

    pub fn is_relative(&self) -> bool {
        self.base().is_some()
    }

    /// Absolute instant for today. `anchors` is the almanac's
    /// `(sunset, sunrise)` pair the rule is resolved against.
    fn resolve(&self, midnight: i64, anchors: Option<(i64, i64)>) -> Option<i64> {
        match *self {
            Self::Never => None,
            Self::Fixed { hour, minutes } => {
                Some(midnight + i64::from(hour) * 3600 + i64::from(minutes) * 60)
            }
            Self::Sunrise { offset } => anchors.map(|(_, rise)| rise + i64::from(offset) * 60),
            Self::Sunset { offset } => anchors.map(|(set, _)| set + i64::from(offset) * 60),
        }
    }
}

impl fmt::Display for TimeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Never => f.write_str("never"),
            Self::Fixed { hour, minutes } => write!(f, "{hour:02}:{minutes:02}"),
            Self::Sunrise { offset } if offset <= 0 => {
                write!(f, "-{:02}:{:02}", -offset / 60, -offset % 60)
            }
            Self::Sunrise { offset } => write!(f, "sunrise:{offset}"),
            Self::Sunset { offset } if offset >= 0 => {
                write!(f, "+{:02}:{:02}", offset / 60, offset % 60)
            }
            Self::Sunset { offset } => write!(f, "sunset:{offset}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Windows
// ---------------------------------------------------------------------------

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WindowError {
    #[error("on time is not before off time ({on} >= {off})")]
    InvertedWindow { on: i64, off: i64 },
    #[error("window of {minutes} minutes exceeds 12 hours")]
    TooLong { minutes: i64 },
}

/// Validate a resolved window and return its duration in seconds.
pub fn check_window(on: i64, off: i64) -> Result<i64, WindowError> {
    if on >= off {
        return Err(WindowError::InvertedWindow { on, off });
    }
    let duration = off - on;
    if duration > MAX_WINDOW {
        return Err(WindowError::TooLong {
            minutes: duration / 60,
        });
    }
    Ok(duration)
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RuleState {
    #[serde(rename = "i")]
    Idle,
    #[serde(rename = "a")]
    Active,
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub id: u32,
    pub device: String,
    pub on: TimeSpec,
    pub off: TimeSpec,
    /// Bit 0 is Sunday.
    pub days: u8,
    pub state: RuleState,
}

pub struct Schedule {
    rules: Vec<Rule>,
    enabled: bool,
    sequence: u32,
    last_evaluation: i64,
    jitter: i64,
    jitter_drawn: i64,
    rng: fastrand::Rng,
    log: EventLog,
}

impl Schedule {
    pub fn new(log: EventLog) -> Self {
        Self::with_rng(log, fastrand::Rng::new())
    }

    pub fn with_rng(log: EventLog, rng: fastrand::Rng) -> Self {
        Self {
            rules: Vec::new(),
            enabled: true,
            sequence: 0,
            last_evaluation: 0,
            jitter: 0,
            jitter_drawn: 0,
            rng,
            log,
        }
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn enable(&mut self) {
        self.enabled = true;
    }

    pub fn disable(&mut self) {
        self.enabled = false;
    }

    /// Append a rule and return its id. `days == 0` means every day.
    pub fn add_rule(
        &mut self,
        device: &str,
        on: Option<&str>,
        off: Option<&str>,
        days: u8,
        now: i64,
    ) -> u32 {
        let mut id = RULE_ID_BASE + ((now as u32) & 0xff_ff00) + self.sequence;
        while self.rules.iter().any(|r| r.id == id) {
            id += 1;
        }
        self.sequence += 1;

        self.rules.push(Rule {
            id,
            device: device.to_string(),
            on: TimeSpec::import(on),
            off: TimeSpec::import(off),
            days: if days & ALL_DAYS == 0 {
                ALL_DAYS
            } else {
                days & ALL_DAYS
            },
            state: RuleState::Idle,
        });
        id
    }

    pub fn delete_rule(&mut self, id: u32) -> bool {
        let before = self.rules.len();
        self.rules.retain(|r| r.id != id);
        self.rules.len() != before
    }

    /// Reload every rule from configuration. A missing mode means auto.
    pub fn replace_rules(&mut self, config: &LightsConfig, now: i64) {
        self.enabled = config.mode.as_deref().map_or(true, |m| m == "auto");
        self.rules.clear();
        for entry in &config.schedules {
            let (Some(device), Some(on), Some(off)) = (&entry.device, &entry.on, &entry.off)
            else {
                continue;
            };
            self.add_rule(
                device,
                Some(on.as_str()),
                Some(off.as_str()),
                (entry.days & 0x7f) as u8,
                now,
            );
        }
        tracing::info!(
            rules = self.rules.len(),
            enabled = self.enabled,
            "schedule loaded"
        );
    }

    /// Turn on the plugs of every active window. Runs at most once every
    /// 30 seconds.
    pub fn evaluate(&mut self, now: i64, almanac: &dyn Almanac, commander: &mut dyn PlugCommander) {
        if !self.enabled {
            return;
        }
        if now < self.last_evaluation + EVALUATION_INTERVAL {
            return;
        }
        self.last_evaluation = now;

        if now >= self.jitter_drawn + JITTER_PERIOD {
            self.jitter = self.rng.i64(-JITTER_RANGE..=JITTER_RANGE);
            self.jitter_drawn = now;
        }

        let Some((midnight, weekday)) = local_day(now) else {
            self.log.failure("SCHEDULE", format!("no local time for {now}"));
            return;
        };
        let (tonight, today) = if almanac.ready() {
            (almanac.tonight(now), almanac.today(now))
        } else {
            (None, None)
        };

        let jitter = self.jitter;
        for rule in &mut self.rules {
            // A night window spans two dates. A window with a fixed end stays
            // on the date of that end.
            let anchors = match (rule.on.is_relative(), rule.off.is_relative()) {
                (false, false) => None,
                (true, true) => tonight,
                _ => today,
            };
            if (rule.on.is_relative() || rule.off.is_relative()) && anchors.is_none() {
                continue;
            }

            let window = rule
                .on
                .resolve(midnight, anchors)
                .zip(rule.off.resolve(midnight, anchors))
                .map(|(on, off)| (on + jitter, off + jitter));

            let (active, duration) = match window {
                None => (false, 0),
                Some((on, off)) => match check_window(on, off) {
                    Ok(duration) => (
                        on <= now && now < off && rule.days & (1 << weekday) != 0,
                        duration,
                    ),
                    Err(e) => {
                        self.log.failure(&rule.device, e.to_string());
                        continue;
                    }
                },
            };

            if active {
                commander.command_plug(
                    &rule.device,
                    Switch::On,
                    SCHEDULE_PULSE,
                    false,
                    SCHEDULE_CAUSE,
                    now,
                );
                if rule.state != RuleState::Active {
                    self.log.event(
                        "PLUG",
                        &rule.device,
                        "SCHEDULED",
                        format!("ON FOR {} MINUTES", duration / 60),
                    );
                    rule.state = RuleState::Active;
                }
            } else if rule.state != RuleState::Idle {
                // No explicit off: the last pulse lapses on its own.
                self.log.event("PLUG", &rule.device, "SCHEDULED", "OFF");
                rule.state = RuleState::Idle;
            }
        }
    }

    /// `{"mode":..,"schedules":[..]}`, empty on overflow.
    pub fn render(&self, capacity: usize) -> String {
        let doc = ScheduleStatus {
            mode: if self.enabled { "auto" } else { "manual" },
            schedules: self
                .rules
                .iter()
                .map(|r| RuleEntry {
                    id: r.id,
                    device: &r.device,
                    state: r.state,
                    on: r.on.to_string(),
                    off: r.off.to_string(),
                    days: r.days,
                })
                .collect(),
        };
        render_bounded(&doc, capacity, &self.log)
    }
}

#[derive(Serialize)]
struct ScheduleStatus<'a> {
    mode: &'static str,
    schedules: Vec<RuleEntry<'a>>,
}

#[derive(Serialize)]
struct RuleEntry<'a> {
    id: u32,
    device: &'a str,
    state: RuleState,
    on: String,
    off: String,
    days: u8,
}

/// Local midnight (unix seconds) and day of week (0 = Sunday).
fn local_day(now: i64) -> Option<(i64, u32)> {
    let local = Local.timestamp_opt(now, 0).single()?;
    let midnight = local.date_naive().and_hms_opt(0, 0, 0)?;
    let midnight = Local.from_local_datetime(&midnight).earliest()?.timestamp();
    Some((midnight, local.weekday().num_days_from_sunday()))
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::almanac::FixedAlmanac;
    use crate::store::ScheduleEntry;
    use chrono::NaiveTime;

    // 2026-06-17 is a Wednesday.
    const WEDNESDAY: u8 = 1 << 3;

    fn at(h: u32, m: u32) -> i64 {
        Local
            .with_ymd_and_hms(2026, 6, 17, h, m, 0)
            .earliest()
            .unwrap()
            .timestamp()
    }

    fn hm(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[derive(Default)]
    struct Recorder {
        calls: Vec<(String, Switch, i64, bool, String)>,
    }

    impl PlugCommander for Recorder {
        fn command_plug(
            &mut self,
            name: &str,
            state: Switch,
            pulse: i64,
            manual: bool,
            cause: &str,
            _now: i64,
        ) {
            self.calls
                .push((name.to_string(), state, pulse, manual, cause.to_string()));
        }
    }

    struct Night(Option<(i64, i64)>);

    impl Almanac for Night {
        fn ready(&self) -> bool {
            self.0.is_some()
        }
        fn tonight(&self, _now: i64) -> Option<(i64, i64)> {
            self.0
        }
        fn today(&self, _now: i64) -> Option<(i64, i64)> {
            self.0.map(|(set, rise)| (set, rise - 24 * 3600))
        }
    }

    fn schedule() -> Schedule {
        Schedule::with_rng(EventLog::new(), fastrand::Rng::with_seed(7))
    }

    fn summer_night() -> Night {
        Night(Some((at(21, 0), at(21, 0) + 8 * 3600)))
    }

    // -- TimeSpec -----------------------------------------------------------

    #[test]
    fn import_fixed_time() {
        let t = TimeSpec::import(Some("21:30"));
        assert_eq!(
            t,
            TimeSpec::Fixed {
                hour: 21,
                minutes: 30
            }
        );
        assert_eq!(t.base(), None);
        assert_eq!(
            TimeSpec::import(Some("7")),
            TimeSpec::Fixed { hour: 7, minutes: 0 }
        );
        assert_eq!(
            TimeSpec::import(Some("12:-20")),
            TimeSpec::Fixed {
                hour: 12,
                minutes: -20
            }
        );
    }

    #[test]
    fn import_relative_times() {
        let t = TimeSpec::import(Some("-0:15"));
        assert_eq!(t, TimeSpec::Sunrise { offset: -15 });
        assert_eq!(t.base(), Some('-'));

        let t = TimeSpec::import(Some("+1:30"));
        assert_eq!(t, TimeSpec::Sunset { offset: 90 });
        assert_eq!(t.base(), Some('+'));

        assert_eq!(
            TimeSpec::import(Some("sunset:-20")),
            TimeSpec::Sunset { offset: -20 }
        );
        assert_eq!(
            TimeSpec::import(Some("sunrise")),
            TimeSpec::Sunrise { offset: 0 }
        );
    }

    #[test]
    fn import_absent_is_never() {
        assert_eq!(TimeSpec::import(None), TimeSpec::Never);
        assert_eq!(TimeSpec::import(Some("never")), TimeSpec::Never);
    }

    #[test]
    fn import_clamps_fields() {
        assert_eq!(
            TimeSpec::import(Some("25:99")),
            TimeSpec::Fixed {
                hour: 23,
                minutes: 59
            }
        );
        assert_eq!(
            TimeSpec::import(Some("10:-45")),
            TimeSpec::Fixed {
                hour: 10,
                minutes: -30
            }
        );
        assert_eq!(
            TimeSpec::import(Some("junk")),
            TimeSpec::Fixed { hour: 0, minutes: 0 }
        );
    }

    #[test]
    fn display_is_canonical() {
        for text in ["21:30", "06:00", "12:-20", "-00:15", "+01:30", "sunset:-20", "sunrise:5", "never"] {
            assert_eq!(TimeSpec::import(Some(text)).to_string(), text);
        }
        assert_eq!(TimeSpec::import(Some("7")).to_string(), "07:00");
    }

    // -- Windows ------------------------------------------------------------

    #[test]
    fn window_checks() {
        assert_eq!(check_window(100, 200), Ok(100));
        assert_eq!(
            check_window(200, 100),
            Err(WindowError::InvertedWindow { on: 200, off: 100 })
        );
        assert!(matches!(
            check_window(0, MAX_WINDOW + 60),
            Err(WindowError::TooLong { .. })
        ));
        assert!(check_window(0, MAX_WINDOW).is_ok());
    }

    // -- Rules --------------------------------------------------------------

    #[test]
    fn add_rule_ids_and_days() {
        let mut s = schedule();
        let now = 0x1234_5678;
        let a = s.add_rule("porch", Some("21:00"), Some("23:00"), 0, now);
        let b = s.add_rule("garage", Some("21:00"), Some("23:00"), WEDNESDAY, now);
        assert_eq!(a, 0x100_0000 + 0x34_5600);
        assert_eq!(b, a + 1);
        assert_eq!(s.rules()[0].days, 0x7f);
        assert_eq!(s.rules()[1].days, WEDNESDAY);
    }

    #[test]
    fn delete_rule_by_id() {
        let mut s = schedule();
        let id = s.add_rule("porch", Some("21:00"), Some("23:00"), 0, at(12, 0));
        assert!(!s.delete_rule(id + 100));
        assert!(s.delete_rule(id));
        assert!(s.rules().is_empty());
    }

    #[test]
    fn replace_rules_from_config() {
        let mut s = schedule();
        s.add_rule("old", Some("1"), Some("2"), 0, at(12, 0));
        let config = LightsConfig {
            mode: Some("manual".into()),
            schedules: vec![
                ScheduleEntry {
                    device: Some("porch".into()),
                    on: Some("+00:30".into()),
                    off: Some("23:00".into()),
                    days: 0,
                },
                ScheduleEntry {
                    device: Some("garage".into()),
                    on: Some("21:00".into()),
                    off: None,
                    days: 0,
                },
            ],
        };
        s.replace_rules(&config, at(12, 0));
        assert!(!s.is_enabled());
        assert_eq!(s.rules().len(), 1);
        assert_eq!(s.rules()[0].device, "porch");
        assert_eq!(s.rules()[0].days, 0x7f);

        s.replace_rules(&LightsConfig::default(), at(12, 0));
        assert!(s.is_enabled());
        assert!(s.rules().is_empty());
    }

    // -- Evaluation ---------------------------------------------------------

    #[test]
    fn active_window_commands_a_pulse() {
        let mut s = schedule();
        s.add_rule("porch", Some("21:00"), Some("23:00"), WEDNESDAY, at(12, 0));
        let mut rec = Recorder::default();

        s.evaluate(at(22, 0), &summer_night(), &mut rec);
        assert_eq!(
            rec.calls,
            vec![(
                "porch".to_string(),
                Switch::On,
                SCHEDULE_PULSE,
                false,
                SCHEDULE_CAUSE.to_string()
            )]
        );
        assert_eq!(s.rules()[0].state, RuleState::Active);
        assert_eq!(s.log.count_action("SCHEDULED"), 1);
        assert_eq!(s.log.entries()[0].detail, "ON FOR 120 MINUTES");

        // Refreshed on each evaluation, logged once.
        s.evaluate(at(22, 1), &summer_night(), &mut rec);
        assert_eq!(rec.calls.len(), 2);
        assert_eq!(s.log.count_action("SCHEDULED"), 1);
    }

    #[test]
    fn evaluation_is_throttled() {
        let mut s = schedule();
        s.add_rule("porch", Some("21:00"), Some("23:00"), 0, at(12, 0));
        let mut rec = Recorder::default();
        let now = at(22, 0);

        s.evaluate(now, &summer_night(), &mut rec);
        s.evaluate(now + 10, &summer_night(), &mut rec);
        assert_eq!(rec.calls.len(), 1);
        s.evaluate(now + EVALUATION_INTERVAL, &summer_night(), &mut rec);
        assert_eq!(rec.calls.len(), 2);
    }

    #[test]
    fn disabled_schedule_does_nothing() {
        let mut s = schedule();
        s.add_rule("porch", Some("21:00"), Some("23:00"), 0, at(12, 0));
        s.disable();
        let mut rec = Recorder::default();
        s.evaluate(at(22, 0), &summer_night(), &mut rec);
        assert!(rec.calls.is_empty());
    }

    #[test]
    fn other_day_is_not_active() {
        let mut s = schedule();
        s.add_rule("porch", Some("21:00"), Some("23:00"), 1, at(12, 0));
        let mut rec = Recorder::default();
        s.evaluate(at(22, 0), &summer_night(), &mut rec);
        assert!(rec.calls.is_empty());
    }

    #[test]
    fn falling_edge_logs_off_without_command() {
        let mut s = schedule();
        s.add_rule("porch", Some("21:00"), Some("23:00"), 0, at(12, 0));
        let mut rec = Recorder::default();
        s.evaluate(at(22, 0), &summer_night(), &mut rec);
        s.evaluate(at(23, 30), &summer_night(), &mut rec);

        assert_eq!(rec.calls.len(), 1);
        assert_eq!(s.rules()[0].state, RuleState::Idle);
        let entries = s.log.entries();
        assert_eq!(entries[0].action, "SCHEDULED");
        assert_eq!(entries[0].detail, "OFF");
    }

    #[test]
    fn inverted_window_is_rejected() {
        let mut s = schedule();
        s.add_rule("porch", Some("23:00"), Some("21:00"), 0, at(12, 0));
        let mut rec = Recorder::default();
        s.evaluate(at(23, 30), &summer_night(), &mut rec);
        assert!(rec.calls.is_empty());
        assert_eq!(s.log.count_failures(), 1);
    }

    #[test]
    fn overlong_window_is_rejected() {
        let mut s = schedule();
        s.add_rule("porch", Some("06:00"), Some("20:00"), 0, at(12, 0));
        let mut rec = Recorder::default();
        s.evaluate(at(12, 0), &summer_night(), &mut rec);
        assert!(rec.calls.is_empty());
        assert_eq!(s.log.count_failures(), 1);
    }

    #[test]
    fn never_spec_never_activates() {
        let mut s = schedule();
        s.add_rule("porch", Some("21:00"), None, 0, at(12, 0));
        let mut rec = Recorder::default();
        s.evaluate(at(22, 0), &summer_night(), &mut rec);
        assert!(rec.calls.is_empty());
        assert_eq!(s.log.count_failures(), 0);
    }

    #[test]
    fn relative_window_uses_almanac() {
        let mut s = schedule();
        // From 30 minutes after sunset to 1 hour before sunrise.
        s.add_rule("porch", Some("+00:30"), Some("-01:00"), 0, at(12, 0));
        let mut rec = Recorder::default();
        s.evaluate(at(23, 0), &summer_night(), &mut rec);
        assert_eq!(rec.calls.len(), 1);
    }

    #[test]
    fn mixed_window_is_quiet_overnight() {
        let mut s = schedule();
        s.add_rule("porch", Some("+00:30"), Some("23:00"), 0, at(12, 0));
        let almanac = FixedAlmanac::new(hm(6, 0), hm(20, 0));
        let mut rec = Recorder::default();

        let mut now = at(0, 1);
        while now < at(6, 0) {
            s.evaluate(now, &almanac, &mut rec);
            now += EVALUATION_INTERVAL;
        }
        assert!(rec.calls.is_empty());
        assert_eq!(s.log.count_failures(), 0);

        // Sunset is 20:00, so the window opens around 20:30.
        s.evaluate(at(21, 0), &almanac, &mut rec);
        assert_eq!(rec.calls.len(), 1);
        assert_eq!(s.log.count_failures(), 0);
    }

    #[test]
    fn night_window_spans_midnight() {
        let mut s = schedule();
        s.add_rule("porch", Some("+00:30"), Some("-01:00"), 0, at(12, 0));
        let almanac = FixedAlmanac::new(hm(6, 0), hm(20, 0));
        let mut rec = Recorder::default();

        // Still inside the window that opened yesterday evening.
        s.evaluate(at(2, 0), &almanac, &mut rec);
        assert_eq!(rec.calls.len(), 1);
        assert_eq!(s.log.count_failures(), 0);
    }

    #[test]
    fn relative_rule_waits_for_almanac() {
        let mut s = schedule();
        s.add_rule("porch", Some("+00:30"), Some("-01:00"), 0, at(12, 0));
        let mut rec = Recorder::default();
        s.evaluate(at(23, 0), &Night(None), &mut rec);
        assert!(rec.calls.is_empty());
        assert_eq!(s.log.count_failures(), 0);
        assert_eq!(s.rules()[0].state, RuleState::Idle);
    }

    // -- Render -------------------------------------------------------------

    #[test]
    fn render_lists_rules() {
        let mut s = schedule();
        let id = s.add_rule("porch", Some("+00:30"), Some("23:00"), 62, at(12, 0));
        let doc: serde_json::Value = serde_json::from_str(&s.render(4096)).unwrap();
        assert_eq!(doc["mode"], "auto");
        let rule = &doc["schedules"][0];
        assert_eq!(rule["id"], id);
        assert_eq!(rule["device"], "porch");
        assert_eq!(rule["state"], "i");
        assert_eq!(rule["on"], "+00:30");
        assert_eq!(rule["off"], "23:00");
        assert_eq!(rule["days"], 62);
    }

    #[test]
    fn render_overflow_is_empty() {
        let mut s = schedule();
        for i in 0..20 {
            s.add_rule(&format!("plug-{i}"), Some("21:00"), Some("23:00"), 0, at(12, 0));
        }
        assert!(s.render(128).is_empty());
        assert_eq!(s.log.count_failures(), 1);
    }
}
