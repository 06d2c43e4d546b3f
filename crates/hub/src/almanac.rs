//! Sunset and sunrise times for relative schedules.

use chrono::{Local, NaiveDate, NaiveTime, TimeZone};

pub trait Almanac: Send + Sync {
    /// False until the almanac has data to offer.
    fn ready(&self) -> bool;

    /// Tonight's `(sunset, sunrise)` in unix seconds. Before today's sunrise
    /// "tonight" is the night that is ending; after it, the coming one.
    fn tonight(&self, now: i64) -> Option<(i64, i64)>;

    /// Today's `(sunset, sunrise)`, both on the local date of `now`.
    fn today(&self, now: i64) -> Option<(i64, i64)>;
}

/// Same sunrise and sunset every day, from the settings file.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedAlmanac {
    times: Option<(NaiveTime, NaiveTime)>,
}

impl FixedAlmanac {
    pub fn new(sunrise: NaiveTime, sunset: NaiveTime) -> Self {
        Self {
            times: Some((sunrise, sunset)),
        }
    }

    /// An almanac that never becomes ready.
    pub fn unavailable() -> Self {
        Self { times: None }
    }
}

fn at(date: NaiveDate, time: NaiveTime) -> Option<i64> {
    Local
        .from_local_datetime(&date.and_time(time))
        .earliest()
        .map(|t| t.timestamp())
}

impl Almanac for FixedAlmanac {
    fn ready(&self) -> bool {
        self.times.is_some()
    }

    fn tonight(&self, now: i64) -> Option<(i64, i64)> {
        let (sunrise, sunset) = self.times?;
        let today = Local.timestamp_opt(now, 0).single()?.date_naive();

        let sunrise_today = at(today, sunrise)?;
        if now < sunrise_today {
            Some((at(today.pred_opt()?, sunset)?, sunrise_today))
        } else {
            Some((at(today, sunset)?, at(today.succ_opt()?, sunrise)?))
        }
    }

    fn today(&self, now: i64) -> Option<(i64, i64)> {
        let (sunrise, sunset) = self.times?;
        let today = Local.timestamp_opt(now, 0).single()?.date_naive();
        Some((at(today, sunset)?, at(today, sunrise)?))
    }
}

// ===========================================================================
// Tests
// ===========================================================================
