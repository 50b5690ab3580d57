use chrono::{Duration, NaiveDate, TimeZone, Weekday};
use chrono_tz::America::Bogota;
use storewatch::{
    apply_filter, enrich, resample, EnrichedSample, FilteredView, Granularity, Sample,
    SelectionFilter, UnifiedSeries, WEEKDAYS,
};

fn minute_series(day: u32, hour: u32, values: &[i64]) -> Vec<EnrichedSample> {
    let start = Bogota
        .with_ymd_and_hms(2026, 2, day, hour, 0, 0)
        .single()
        .unwrap();
    let samples = values
        .iter()
        .enumerate()
        .map(|(idx, v)| Sample::new(start + Duration::minutes(idx as i64), Some(*v)));
    enrich(&UnifiedSeries::from_records(samples).0)
}

fn date(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 2, day).unwrap()
}

#[test]
fn fifteen_minutes_resample_into_three_five_minute_buckets() {
    let series = minute_series(
        2,
        10,
        &[10, 12, 11, 14, 13, 15, 16, 14, 15, 17, 18, 16, 17, 19, 20],
    );
    let view = FilteredView::new(series.iter().collect());
    let out = resample(&view, Granularity::Minute5);

    assert_eq!(out.len(), 3);
    let counts: Vec<usize> = out.points.iter().map(|p| p.count).collect();
    assert_eq!(counts, vec![5, 5, 5]);
    let starts: Vec<String> = out
        .points
        .iter()
        .map(|p| p.time.format("%H:%M").to_string())
        .collect();
    assert_eq!(starts, vec!["10:00", "10:05", "10:10"]);
    assert_eq!(out.values(), vec![12.0, 15.0, 18.0]);
    assert_eq!(out.points[1].mean, 15.4);
}

#[test]
fn weekend_filter_on_weekday_data_is_empty() {
    // 2026-02-02 .. 2026-02-06 are Monday to Friday
    let mut series = Vec::new();
    for day in 2..=6 {
        series.extend(minute_series(day, 12, &[100, 101, 102]));
    }
    let filter =
        SelectionFilter::new(date(1), date(11), 0, 23, [Weekday::Sat, Weekday::Sun]).unwrap();
    let view = apply_filter(&series, &filter);

    assert!(view.is_empty());
    assert!(resample(&view, Granularity::Minute5).is_empty());
    assert!(resample(&view, Granularity::Raw).is_empty());
}

#[test]
fn filters_combine_date_hours_and_weekdays() {
    let mut series = Vec::new();
    for day in 2..=8 {
        for hour in [5, 9, 22] {
            series.extend(minute_series(day, hour, &[day as i64 * 100 + hour as i64]));
        }
    }

    let filter = SelectionFilter::new(date(3), date(7), 6, 23, [Weekday::Tue, Weekday::Sat])
        .unwrap();
    let view = apply_filter(&series, &filter);
    let kept: Vec<i64> = view
        .samples()
        .iter()
        .filter_map(|s| s.available_stores)
        .collect();

    assert_eq!(kept, vec![309, 322, 709, 722]);
}

#[test]
fn every_granularity_keeps_order_and_excludes_missing_values() {
    let start = Bogota
        .with_ymd_and_hms(2026, 2, 4, 8, 0, 0)
        .single()
        .unwrap();
    let samples = (0..360).map(|i| {
        let value = if i % 7 == 0 { None } else { Some(1000 + i) };
        Sample::new(start + Duration::seconds(10 * i), value)
    });
    let series = enrich(&UnifiedSeries::from_records(samples).0);
    let filter = SelectionFilter::new(date(4), date(4), 0, 23, WEEKDAYS).unwrap();
    let view = apply_filter(&series, &filter);

    for granularity in [
        Granularity::Minute1,
        Granularity::Minute5,
        Granularity::Minute15,
        Granularity::Minute30,
        Granularity::Hour1,
    ] {
        let out = resample(&view, granularity);
        let width = granularity.width_seconds().unwrap();
        let total: usize = out.points.iter().map(|p| p.count).sum();

        assert_eq!(total, view.values().len());
        assert!(out.points.windows(2).all(|w| w[0].time < w[1].time));
        assert!(out.points.iter().all(|p| p.time.timestamp() % width == 0));
    }
}
