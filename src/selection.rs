//! User filter selection over the enriched series.

use std::collections::BTreeSet;

use chrono::{NaiveDate, Weekday};
use serde::Serialize;
use thiserror::Error;

use crate::features::{weekday_name, EnrichedSample, WEEKDAYS};

pub const MAX_HOUR: u32 = 23;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectionError {
    #[error("hour window {from}..={to} is outside 0..=23 or reversed")]
    InvalidHourWindow { from: u32, to: u32 },
    #[error("date range {from}..={to} is reversed")]
    InvalidDateRange { from: NaiveDate, to: NaiveDate },
}

/// Date range, hour window and weekday set, all inclusive and combined
/// conjunctively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionFilter {
    date_from: NaiveDate,
    date_to: NaiveDate,
    hour_from: u32,
    hour_to: u32,
    weekdays: BTreeSet<u32>,
}

impl SelectionFilter {
    pub fn new(
        date_from: NaiveDate,
        date_to: NaiveDate,
        hour_from: u32,
        hour_to: u32,
        weekdays: impl IntoIterator<Item = Weekday>,
    ) -> Result<Self, SelectionError> {
        if hour_from > hour_to || hour_to > MAX_HOUR {
            return Err(SelectionError::InvalidHourWindow {
                from: hour_from,
                to: hour_to,
            });
        }
        if date_from > date_to {
            return Err(SelectionError::InvalidDateRange {
                from: date_from,
                to: date_to,
            });
        }

        Ok(Self {
            date_from,
            date_to,
            hour_from,
            hour_to,
            weekdays: weekdays
                .into_iter()
                .map(|day| day.num_days_from_monday())
                .collect(),
        })
    }

    /// Every sample of `[date_from, date_to]`, all hours and all weekdays.
    pub fn all_days(date_from: NaiveDate, date_to: NaiveDate) -> Result<Self, SelectionError> {
        Self::new(date_from, date_to, 0, MAX_HOUR, WEEKDAYS)
    }

    pub fn date_from(&self) -> NaiveDate {
        self.date_from
    }

    pub fn date_to(&self) -> NaiveDate {
        self.date_to
    }

    pub fn hour_window(&self) -> (u32, u32) {
        (self.hour_from, self.hour_to)
    }

    pub fn weekdays(&self) -> Vec<Weekday> {
        WEEKDAYS
            .into_iter()
            .filter(|day| self.weekdays.contains(&day.num_days_from_monday()))
            .collect()
    }

    pub fn weekday_names(&self) -> Vec<&'static str> {
        self.weekdays().into_iter().map(weekday_name).collect()
    }

    pub fn matches(&self, sample: &EnrichedSample) -> bool {
        let cal = &sample.calendar;
        cal.date >= self.date_from
            && cal.date <= self.date_to
            && cal.hour >= self.hour_from
            && cal.hour <= self.hour_to
            && self.weekdays.contains(&cal.weekday_index)
    }
}

/// Samples of the enriched series that pass a [`SelectionFilter`], in
/// series order. Borrows; never copies or mutates the series.
#[derive(Debug, Clone, Default)]
pub struct FilteredView<'a> {
    samples: Vec<&'a EnrichedSample>,
}

impl<'a> FilteredView<'a> {
    pub fn new(samples: Vec<&'a EnrichedSample>) -> Self {
        Self { samples }
    }

    pub fn samples(&self) -> &[&'a EnrichedSample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Values of samples that carry one.
    pub fn values(&self) -> Vec<f64> {
        self.samples.iter().filter_map(|s| s.value()).collect()
    }

    pub fn first(&self) -> Option<&'a EnrichedSample> {
        self.samples.first().copied()
    }

    pub fn last(&self) -> Option<&'a EnrichedSample> {
        self.samples.last().copied()
    }
}

pub fn apply_filter<'a>(series: &'a [EnrichedSample], filter: &SelectionFilter) -> FilteredView<'a> {
    FilteredView::new(series.iter().filter(|s| filter.matches(s)).collect())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SeriesBounds {
    pub first_date: NaiveDate,
    pub last_date: NaiveDate,
}

pub fn series_bounds(series: &[EnrichedSample]) -> Option<SeriesBounds> {
    Some(SeriesBounds {
        first_date: series.first()?.calendar.date,
        last_date: series.last()?.calendar.date,
    })
}
