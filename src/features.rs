//! Calendar and difference columns derived from the unified series.

use chrono::{DateTime, Datelike, NaiveDate, Timelike, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::series::UnifiedSeries;

pub const WEEKDAYS: [Weekday; 7] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
    Weekday::Sun,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarFields {
    pub date: NaiveDate,
    pub hour: u32,
    pub minute: u32,
    pub weekday: Weekday,
    pub weekday_index: u32,
    pub is_weekend: bool,
}

impl CalendarFields {
    pub fn from_time(time: &DateTime<Tz>) -> Self {
        let weekday = time.weekday();
        Self {
            date: time.date_naive(),
            hour: time.hour(),
            minute: time.minute(),
            weekday,
            weekday_index: weekday.num_days_from_monday(),
            is_weekend: is_weekend(weekday),
        }
    }

    pub fn weekday_name(&self) -> &'static str {
        weekday_name(self.weekday)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnrichedSample {
    pub time: DateTime<Tz>,
    pub available_stores: Option<i64>,
    pub calendar: CalendarFields,
    pub delta: Option<f64>,
    pub pct_change: Option<f64>,
}

impl EnrichedSample {
    pub fn value(&self) -> Option<f64> {
        self.available_stores.map(|v| v as f64)
    }
}

pub fn enrich(series: &UnifiedSeries) -> Vec<EnrichedSample> {
    let mut out = Vec::with_capacity(series.len());
    let mut previous: Option<Option<i64>> = None;

    for sample in series.samples() {
        let delta = match (previous.flatten(), sample.available_stores) {
            (Some(prev), Some(current)) => Some((current - prev) as f64),
            _ => None,
        };
        let pct_change = match (previous.flatten(), delta) {
            (Some(prev), Some(delta)) if prev != 0 => Some(delta / prev as f64 * 100.0),
            _ => None,
        };

        out.push(EnrichedSample {
            time: sample.time,
            available_stores: sample.available_stores,
            calendar: CalendarFields::from_time(&sample.time),
            delta,
            pct_change,
        });
        previous = Some(sample.available_stores);
    }

    out
}

pub fn is_weekend(weekday: Weekday) -> bool {
    matches!(weekday, Weekday::Sat | Weekday::Sun)
}

pub fn weekday_name(weekday: Weekday) -> &'static str {
    match weekday {
        Weekday::Mon => "Monday",
        Weekday::Tue => "Tuesday",
        Weekday::Wed => "Wednesday",
        Weekday::Thu => "Thursday",
        Weekday::Fri => "Friday",
        Weekday::Sat => "Saturday",
        Weekday::Sun => "Sunday",
    }
}

/// Accepts full English names and three-letter abbreviations, any case.
pub fn parse_weekday_name(raw: &str) -> Option<Weekday> {
    let lowered = raw.trim().to_ascii_lowercase();
    WEEKDAYS.into_iter().find(|day| {
        let name = weekday_name(*day).to_ascii_lowercase();
        lowered == name || (lowered.len() == 3 && name.starts_with(&lowered))
    })
}
