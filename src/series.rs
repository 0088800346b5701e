use chrono::{DateTime, Days, NaiveDate, Utc};
use std::fmt;

/// Which side of the meter a series measures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MetricKind {
    Consumption,
    Production,
}

impl MetricKind {
    /// Conso API endpoint for the daily energy series
    pub fn daily_endpoint(&self) -> &'static str {
        match self {
            MetricKind::Consumption => "daily_consumption",
            MetricKind::Production => "daily_production",
        }
    }

    /// Conso API endpoint for the 30 minute power series
    pub fn load_curve_endpoint(&self) -> &'static str {
        match self {
            MetricKind::Consumption => "consumption_load_curve",
            MetricKind::Production => "production_load_curve",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricKind::Consumption => write!(f, "consumption"),
            MetricKind::Production => write!(f, "production"),
        }
    }
}

/// Calendar date range, `end` exclusive, as the API expects it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    /// The `days` full days before `today`, today excluded.
    pub fn trailing_days(today: NaiveDate, days: u64) -> Self {
        Self {
            start: today - Days::new(days),
            end: today,
        }
    }

    /// The `days` days before `today` plus today itself.
    pub fn through_today(today: NaiveDate, days: u64) -> Self {
        Self {
            start: today - Days::new(days),
            end: today + Days::new(1),
        }
    }
}

/// One reported interval. `value == None` means not yet published, which is
/// not the same thing as zero.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeSeriesPoint {
    pub at: DateTime<Utc>,
    pub value: Option<f64>,
}

impl TimeSeriesPoint {
    pub fn new(at: DateTime<Utc>, value: Option<f64>) -> Self {
        Self { at, value }
    }
}

/// Points for one metric over the requested range, oldest first
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawSeries {
    pub usage_point_id: Option<String>,
    pub quality: Option<String>,
    pub unit: Option<String>,
    points: Vec<TimeSeriesPoint>,
}

impl RawSeries {
    pub fn new(mut points: Vec<TimeSeriesPoint>) -> Self {
        points.sort_by_key(|p| p.at);
        Self {
            points,
            ..Default::default()
        }
    }

    pub fn with_metadata(mut self, usage_point_id: Option<String>, quality: Option<String>) -> Self {
        self.usage_point_id = usage_point_id;
        self.quality = quality;
        self
    }

    pub fn points(&self) -> &[TimeSeriesPoint] {
        &self.points
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_series_is_sorted_on_construction() {
        let late = Utc.with_ymd_and_hms(2024, 1, 7, 0, 0, 0).unwrap();
        let early = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let series = RawSeries::new(vec![
            TimeSeriesPoint::new(late, Some(1.0)),
            TimeSeriesPoint::new(early, None),
        ]);
        assert_eq!(series.points()[0].at, early);
        assert_eq!(series.points()[1].at, late);
    }

    #[test]
    fn test_date_ranges() {
        let today = NaiveDate::from_ymd_opt(2024, 1, 8).unwrap();
        let daily = DateRange::trailing_days(today, 7);
        assert_eq!(daily.start, NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
        assert_eq!(daily.end, today);

        let curve = DateRange::through_today(today, 1);
        assert_eq!(curve.start, NaiveDate::from_ymd_opt(2024, 1, 7).unwrap());
        assert_eq!(curve.end, NaiveDate::from_ymd_opt(2024, 1, 9).unwrap());
    }

    #[test]
    fn test_endpoints() {
        assert_eq!(MetricKind::Consumption.daily_endpoint(), "daily_consumption");
        assert_eq!(
            MetricKind::Production.load_curve_endpoint(),
            "production_load_curve"
        );
    }
}
