use chrono::{Datelike, Duration, NaiveDate, TimeZone, Weekday};
use chrono_tz::America::Bogota;
use storewatch::{
    apply_filter, comparison_series, compute_kpis, day_of_week_aggregates, detect_anomalies,
    enrich, hourly_heatmap, hourly_period_distribution, hourly_profile, period_comparison,
    resample, rolling_trend, velocity, AnalyticsError, ComparisonMode, DayPeriod,
    EnrichedSample, FilteredView, Granularity, Sample, SelectionFilter, UnifiedSeries, WEEKDAYS,
};

fn five_minute_series(day: u32, hour: u32, values: &[i64]) -> Vec<EnrichedSample> {
    let start = Bogota
        .with_ymd_and_hms(2026, 2, day, hour, 0, 0)
        .single()
        .unwrap();
    let samples = values
        .iter()
        .enumerate()
        .map(|(idx, v)| Sample::new(start + Duration::minutes(5 * idx as i64), Some(*v)));
    enrich(&UnifiedSeries::from_records(samples).0)
}

fn date(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 2, day).unwrap()
}

fn whole(series: &[EnrichedSample]) -> FilteredView<'_> {
    FilteredView::new(series.iter().collect())
}

#[test]
fn kpis_summarise_the_view() {
    let series = five_minute_series(2, 12, &[100, 300, 200, 250]);
    let view = whole(&series);
    let display = resample(&view, Granularity::Minute5);
    let kpis = compute_kpis(&view, &series, &display).unwrap();

    assert_eq!(kpis.latest, 250);
    assert_eq!(kpis.peak, 300);
    assert_eq!(kpis.minimum, 100);
    assert_eq!(kpis.average, 212.5);
    assert_eq!(kpis.data_points, 4);
    assert!(kpis.stability_index > 0.0);
}

#[test]
fn kpis_on_empty_view_are_an_error() {
    let series = five_minute_series(2, 12, &[100, 300]);
    let view = FilteredView::default();
    let display = resample(&view, Granularity::Minute5);
    assert_eq!(
        compute_kpis(&view, &series, &display).unwrap_err(),
        AnalyticsError::EmptyResult
    );
}

#[test]
fn period_delta_compares_with_preceding_window() {
    // 12:00..12:15 at 100, 12:20..12:35 at 150
    let series = five_minute_series(2, 12, &[100, 100, 100, 100, 150, 150, 150, 150]);
    let filter_view = FilteredView::new(series[4..].iter().collect());

    let comparison = period_comparison(&filter_view, &series).unwrap();
    assert_eq!(comparison.current_mean, 150.0);
    // window is [12:05, 12:20): three samples at 100
    assert_eq!(comparison.previous_points, 3);
    assert_eq!(comparison.previous_mean, Some(100.0));
    assert_eq!(comparison.delta_pct, 50.0);

    let first_only = FilteredView::new(series[..4].iter().collect());
    let comparison = period_comparison(&first_only, &series).unwrap();
    assert_eq!(comparison.previous_points, 0);
    assert_eq!(comparison.delta_pct, 0.0);
}

#[test]
fn day_of_week_keeps_monday_first_and_absent_days() {
    let mut series = five_minute_series(4, 9, &[10, 20]);
    series.extend(five_minute_series(8, 9, &[40]));
    let stats = day_of_week_aggregates(&whole(&series));

    let names: Vec<&str> = stats.iter().map(|d| d.name).collect();
    assert_eq!(
        names,
        vec!["Monday", "Tuesday", "Wednesday", "Thursday", "Friday", "Saturday", "Sunday"]
    );
    assert_eq!(stats[2].stats.unwrap().mean, 15.0);
    assert_eq!(stats[6].stats.unwrap().mean, 40.0);
    assert!(stats[6].is_weekend);
    assert!(stats[0].stats.is_none());
}

#[test]
fn isolated_spike_is_flagged() {
    let mut values = vec![1000; 30];
    values[15] = 2000;
    let series = five_minute_series(2, 8, &values);
    let report = detect_anomalies(&whole(&series), 2.5).unwrap();

    assert_eq!(report.window, 12);
    assert_eq!(report.anomaly_count, 1);
    let flagged: Vec<i64> = report.anomalies().map(|p| p.value).collect();
    assert_eq!(flagged, vec![2000]);
    // flat windows have zero spread and produce no score
    assert!(report.points[8].z_score.is_none());
}

#[test]
fn spikes_near_either_end_are_never_flagged() {
    let len = 40;
    let spiked = |at: usize| {
        let mut values: Vec<i64> = (0..len).map(|i| 1000 + (i as i64 % 2) * 10).collect();
        values[at] = 3000;
        values
    };

    // window 12 covers [i-6, i+5]: the first 6 and last 5 points have no full window
    for at in (0..6).chain(len - 5..len) {
        let series = five_minute_series(2, 8, &spiked(at));
        let report = detect_anomalies(&whole(&series), 2.5).unwrap();
        assert_eq!(report.points[at].z_score, None, "index {at}");
        assert!(!report.points[at].is_anomaly, "index {at}");
    }

    for at in [6, 20, len - 6] {
        let series = five_minute_series(2, 8, &spiked(at));
        let report = detect_anomalies(&whole(&series), 2.5).unwrap();
        assert!(report.points[at].is_anomaly, "index {at}");
        assert!(report.points[at].z_score.unwrap() > 2.5);
    }
}

#[test]
fn anomaly_detection_needs_ten_points_and_valid_sigma() {
    let series = five_minute_series(2, 8, &[1000; 9]);
    assert_eq!(
        detect_anomalies(&whole(&series), 2.5).unwrap_err(),
        AnalyticsError::InsufficientData {
            derivation: "anomaly detection",
            required: 10,
            actual: 9
        }
    );

    let series = five_minute_series(2, 8, &[1000; 20]);
    assert_eq!(
        detect_anomalies(&whole(&series), 0.5).unwrap_err(),
        AnalyticsError::InvalidSigma(0.5)
    );
}

#[test]
fn velocity_reports_ramps() {
    let series = five_minute_series(2, 6, &[100, 150, 140, 300, 290]);
    let report = velocity(&whole(&series)).unwrap();

    let deltas: Vec<i64> = report.points.iter().map(|p| p.delta).collect();
    assert_eq!(deltas, vec![50, -10, 160, -10]);
    assert_eq!(report.max_ramp_up, 160);
    assert_eq!(report.max_ramp_down, -10);

    let short = five_minute_series(2, 6, &[100, 150]);
    assert!(matches!(
        velocity(&whole(&short)),
        Err(AnalyticsError::InsufficientData { required: 3, .. })
    ));
}

#[test]
fn trend_appears_only_above_twenty_points() {
    let series = five_minute_series(2, 6, &(0..20).collect::<Vec<i64>>());
    let display = resample(&whole(&series), Granularity::Minute5);
    assert!(rolling_trend(&display.points).is_none());

    let series = five_minute_series(2, 6, &(0..21).collect::<Vec<i64>>());
    let display = resample(&whole(&series), Granularity::Minute5);
    let trend = rolling_trend(&display.points).unwrap();
    assert_eq!(trend.window, 6);
    assert_eq!(trend.values.len(), 21);
    assert_eq!(trend.values[2], None);
    // window of 6 at index 3 covers 0..=5
    assert_eq!(trend.values[3], Some(2.5));
}

#[test]
fn hourly_profile_band_is_clipped_at_zero() {
    let series = five_minute_series(2, 3, &[0, 0, 0, 30]);
    let profile = hourly_profile(&whole(&series));

    assert_eq!(profile.len(), 1);
    assert_eq!(profile[0].hour, 3);
    assert_eq!(profile[0].band_lower, 0.0);
    assert!(profile[0].band_upper > profile[0].stats.mean);
}

#[test]
fn comparison_modes_split_traces() {
    // Friday 6th and Saturday 7th
    let mut series = five_minute_series(6, 10, &[100, 110]);
    series.extend(five_minute_series(7, 10, &[50, 55]));
    let filter = SelectionFilter::new(date(1), date(11), 0, 23, WEEKDAYS).unwrap();
    let view = apply_filter(&series, &filter);
    let display = resample(&view, Granularity::Minute5);

    let single = comparison_series(&display.points, ComparisonMode::None);
    assert_eq!(single.len(), 1);
    assert_eq!(single[0].points.len(), 4);

    let split = comparison_series(&display.points, ComparisonMode::WeekdayVsWeekend);
    assert_eq!(split[0].name, "Weekday");
    assert_eq!(split[0].points.len(), 2);
    assert_eq!(split[1].name, "Weekend");

    let by_day = comparison_series(&display.points, ComparisonMode::DayOverDay);
    let names: Vec<&str> = by_day.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["2026-02-06 (Fri)", "2026-02-07 (Sat)"]);
    assert_eq!(by_day[1].points[1].hour_of_day, 10.0 + 5.0 / 60.0);
}

#[test]
fn heatmap_is_date_by_hour_mean() {
    let mut series = five_minute_series(2, 9, &[10, 20]);
    series.extend(five_minute_series(3, 9, &[40]));
    let cells = hourly_heatmap(&whole(&series));

    assert_eq!(cells.len(), 2);
    assert_eq!(cells[0].date, date(2));
    assert_eq!(cells[0].mean, 15.0);
    assert_eq!(cells[1].date.weekday(), Weekday::Tue);
}


#[test]
fn hourly_boxes_split_weekday_and_weekend() {
    // Friday 6th and Saturday 7th
    let mut series = five_minute_series(6, 10, &[100, 120, 110]);
    series.extend(five_minute_series(6, 11, &[200]));
    series.extend(five_minute_series(7, 10, &[50, 60]));
    let boxes = hourly_period_distribution(&whole(&series));

    let keys: Vec<(u32, DayPeriod)> = boxes.iter().map(|b| (b.hour, b.period)).collect();
    assert_eq!(
        keys,
        vec![
            (10, DayPeriod::Weekday),
            (10, DayPeriod::Weekend),
            (11, DayPeriod::Weekday)
        ]
    );
    assert_eq!(boxes[0].stats.median, 110.0);
    assert_eq!(boxes[0].stats.q1, 105.0);
    assert_eq!(boxes[0].stats.max, 120.0);
    assert_eq!(boxes[1].stats.median, 55.0);
    assert_eq!(boxes[1].stats.count, 2);
    assert_eq!(boxes[2].stats.min, 200.0);
}
