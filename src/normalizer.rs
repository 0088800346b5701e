//! Reduces raw series to the single values the sensors show.
//!
//! Published data lags real time by one to two days, so the most recent
//! points of a series are routinely `null`. Nothing here ever turns a
//! missing value into zero: an empty result is `None`.

use crate::series::RawSeries;
use chrono::{DateTime, Days, NaiveDate, TimeDelta, Utc};
use chrono_tz::Tz;
use serde_derive::Serialize;

const WEEK_DAYS: u64 = 7;

/// A value together with the time of the interval it was reported for
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Reading {
    pub value: f64,
    pub at: DateTime<Utc>,
}

impl Reading {
    pub fn new(value: f64, at: DateTime<Utc>) -> Self {
        Self { value, at }
    }
}

/// Latest non-null point no older than `max_lookback`. Points stamped after
/// `now` are ignored.
pub fn latest_valid(series: &RawSeries, max_lookback: TimeDelta, now: DateTime<Utc>) -> Option<Reading> {
    let oldest_allowed = now - max_lookback;
    series
        .points()
        .iter()
        .rev()
        .filter(|p| p.at <= now)
        .find_map(|p| p.value.map(|value| Reading::new(value, p.at)))
        .filter(|r| r.at >= oldest_allowed)
}

/// Sum of the non-null daily points of the seven days ending at the latest
/// published day. The reading is stamped with that day.
pub fn weekly_total(
    series: &RawSeries,
    max_lookback: TimeDelta,
    now: DateTime<Utc>,
    tz: Tz,
) -> Option<Reading> {
    let latest = latest_valid(series, max_lookback, now)?;
    let last_day = local_date(latest.at, tz);
    let first_day = last_day - Days::new(WEEK_DAYS - 1);

    let total = series
        .points()
        .iter()
        .filter(|p| {
            let day = local_date(p.at, tz);
            day >= first_day && day <= last_day
        })
        .filter_map(|p| p.value)
        .sum();

    Some(Reading::new(total, latest.at))
}

/// Highest non-null load-curve point of the current local day.
pub fn max_power_today(series: &RawSeries, now: DateTime<Utc>, tz: Tz) -> Option<Reading> {
    let today = local_date(now, tz);
    series
        .points()
        .iter()
        .filter(|p| p.at <= now && local_date(p.at, tz) == today)
        .filter_map(|p| p.value.map(|value| Reading::new(value, p.at)))
        .fold(None, |best: Option<Reading>, candidate| match best {
            Some(b) if b.value > candidate.value => Some(b),
            _ => Some(candidate),
        })
}

pub fn local_date(at: DateTime<Utc>, tz: Tz) -> NaiveDate {
    at.with_timezone(&tz).date_naive()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::series::TimeSeriesPoint;
    use chrono::TimeZone;
    use chrono_tz::Europe::Paris;

    fn paris(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Paris
            .with_ymd_and_hms(y, m, d, h, min, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    fn daily(values: &[Option<f64>]) -> RawSeries {
        // One point per day starting 2024-01-01, local midnight
        RawSeries::new(
            values
                .iter()
                .enumerate()
                .map(|(i, v)| TimeSeriesPoint::new(paris(2024, 1, 1 + i as u32, 0, 0), *v))
                .collect(),
        )
    }

    #[test]
    fn test_latest_valid_prefers_latest_not_largest() {
        let series = daily(&[Some(9000.0), Some(100.0), None]);
        let now = paris(2024, 1, 4, 12, 0);
        let reading = latest_valid(&series, TimeDelta::days(7), now).unwrap();
        assert_eq!(reading.value, 100.0);
        assert_eq!(reading.at, paris(2024, 1, 2, 0, 0));
    }

    #[test]
    fn test_latest_valid_skips_trailing_nulls() {
        let series = daily(&[Some(11776.0), Some(14401.0), None, None]);
        let now = paris(2024, 1, 5, 8, 0);
        let reading = latest_valid(&series, TimeDelta::days(7), now).unwrap();
        assert_eq!(reading.value, 14401.0);
    }

    #[test]
    fn test_all_null_is_unavailable_not_zero() {
        let series = daily(&[None, None, None]);
        let now = paris(2024, 1, 4, 0, 0);
        assert_eq!(latest_valid(&series, TimeDelta::days(7), now), None);
        assert_eq!(weekly_total(&series, TimeDelta::days(7), now, Paris), None);
    }

    #[test]
    fn test_latest_valid_respects_lookback() {
        let series = daily(&[Some(500.0), None, None]);
        let now = paris(2024, 1, 10, 0, 0);
        assert_eq!(latest_valid(&series, TimeDelta::days(3), now), None);
        assert!(latest_valid(&series, TimeDelta::days(10), now).is_some());
    }

    #[test]
    fn test_latest_valid_ignores_future_points() {
        let series = daily(&[Some(1.0), Some(2.0), Some(3.0)]);
        let now = paris(2024, 1, 2, 12, 0);
        let reading = latest_valid(&series, TimeDelta::days(7), now).unwrap();
        assert_eq!(reading.value, 2.0);
    }

    #[test]
    fn test_empty_series() {
        let series = RawSeries::default();
        let now = paris(2024, 1, 2, 12, 0);
        assert_eq!(latest_valid(&series, TimeDelta::days(7), now), None);
        assert_eq!(max_power_today(&series, now, Paris), None);
    }

    #[test]
    fn test_weekly_total_sums_only_published_days() {
        let series = daily(&[
            Some(100.0),
            None,
            Some(200.0),
            None,
            Some(300.0),
            None,
            Some(400.0),
        ]);
        let now = paris(2024, 1, 8, 9, 0);
        let total = weekly_total(&series, TimeDelta::days(7), now, Paris).unwrap();
        assert_eq!(total.value, 1000.0);
        assert_eq!(total.at, paris(2024, 1, 7, 0, 0));
    }

    #[test]
    fn test_weekly_total_window_ends_at_latest_published_day() {
        // Nine days, the last one unpublished: the window covers days 2..=8
        let series = daily(&[
            Some(1000.0),
            Some(1.0),
            Some(1.0),
            Some(1.0),
            Some(1.0),
            Some(1.0),
            Some(1.0),
            Some(1.0),
            None,
        ]);
        let now = paris(2024, 1, 10, 9, 0);
        let total = weekly_total(&series, TimeDelta::days(7), now, Paris).unwrap();
        assert_eq!(total.value, 7.0);
    }

    #[test]
    fn test_max_power_today_only_counts_today() {
        let series = RawSeries::new(vec![
            TimeSeriesPoint::new(paris(2024, 1, 6, 23, 30), Some(9000.0)),
            TimeSeriesPoint::new(paris(2024, 1, 7, 0, 0), Some(450.0)),
            TimeSeriesPoint::new(paris(2024, 1, 7, 0, 30), Some(380.0)),
            TimeSeriesPoint::new(paris(2024, 1, 7, 1, 0), Some(520.0)),
            TimeSeriesPoint::new(paris(2024, 1, 7, 1, 30), None),
        ]);
        let now = paris(2024, 1, 7, 3, 0);
        let max = max_power_today(&series, now, Paris).unwrap();
        assert_eq!(max.value, 520.0);
        assert_eq!(max.at, paris(2024, 1, 7, 1, 0));
    }

    #[test]
    fn test_max_power_today_unavailable_before_first_point() {
        let series = RawSeries::new(vec![TimeSeriesPoint::new(
            paris(2024, 1, 6, 23, 30),
            Some(700.0),
        )]);
        let now = paris(2024, 1, 7, 0, 10);
        assert_eq!(max_power_today(&series, now, Paris), None);
    }

    #[test]
    fn test_local_date_uses_meter_time_zone() {
        // 23:30 UTC on Jan 6 is already Jan 7 in Paris
        let at = Utc.with_ymd_and_hms(2024, 1, 6, 23, 30, 0).unwrap();
        assert_eq!(
            local_date(at, Paris),
            NaiveDate::from_ymd_opt(2024, 1, 7).unwrap()
        );
    }
}
