use crate::normalizer::Reading;
use chrono::{DateTime, Utc};
use serde_derive::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// The six values a meter exposes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    DailyConsumption,
    WeeklyConsumption,
    CurrentPower,
    MaxPowerToday,
    DailyProduction,
    CurrentProductionPower,
}

impl Metric {
    pub const ALL: [Metric; 6] = [
        Metric::DailyConsumption,
        Metric::WeeklyConsumption,
        Metric::CurrentPower,
        Metric::MaxPowerToday,
        Metric::DailyProduction,
        Metric::CurrentProductionPower,
    ];

    /// Stable key used in entity identifiers
    pub fn key(&self) -> &'static str {
        match self {
            Metric::DailyConsumption => "daily_consumption",
            Metric::WeeklyConsumption => "total_consumption_week",
            Metric::CurrentPower => "current_power",
            Metric::MaxPowerToday => "max_power",
            Metric::DailyProduction => "daily_production",
            Metric::CurrentProductionPower => "current_production_power",
        }
    }

    /// Max power is derived from the load curve, which carries average active
    /// power per interval, so it is reported in W rather than VA like the
    /// subscribed apparent-power peak.
    pub fn unit(&self) -> Unit {
        match self {
            Metric::DailyConsumption | Metric::WeeklyConsumption | Metric::DailyProduction => {
                Unit::WattHour
            }
            Metric::CurrentPower | Metric::MaxPowerToday | Metric::CurrentProductionPower => {
                Unit::Watt
            }
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(
            self,
            Metric::DailyProduction | Metric::CurrentProductionPower
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Unit {
    #[serde(rename = "Wh")]
    WattHour,
    #[serde(rename = "W")]
    Watt,
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Unit::WattHour => write!(f, "Wh"),
            Unit::Watt => write!(f, "W"),
        }
    }
}

/// Why a metric has no value. `NoDataYet` is the normal state for intervals
/// the grid operator has not published; everything else means something is
/// broken or switched off.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum UnavailableReason {
    NoDataYet,
    ProductionDisabled,
    NotFetchedYet,
    Authentication,
    Misconfigured(String),
    MalformedResponse(String),
    FetchFailed(String),
    Stale,
}

impl UnavailableReason {
    pub fn is_broken(&self) -> bool {
        !matches!(
            self,
            UnavailableReason::NoDataYet
                | UnavailableReason::ProductionDisabled
                | UnavailableReason::NotFetchedYet
        )
    }
}

impl fmt::Display for UnavailableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnavailableReason::NoDataYet => write!(f, "no data published yet"),
            UnavailableReason::ProductionDisabled => write!(f, "production disabled"),
            UnavailableReason::NotFetchedYet => write!(f, "not fetched yet"),
            UnavailableReason::Authentication => write!(f, "authentication"),
            UnavailableReason::Misconfigured(detail) => write!(f, "misconfigured: {detail}"),
            UnavailableReason::MalformedResponse(detail) => {
                write!(f, "malformed response: {detail}")
            }
            UnavailableReason::FetchFailed(detail) => write!(f, "fetch failed: {detail}"),
            UnavailableReason::Stale => write!(f, "data expired"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum MetricState {
    Available(Reading),
    Unavailable(UnavailableReason),
}

impl MetricState {
    pub fn reading(&self) -> Option<&Reading> {
        match self {
            MetricState::Available(reading) => Some(reading),
            MetricState::Unavailable(_) => None,
        }
    }
}

/// Series metadata surfaced as sensor attributes
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SeriesInfo {
    pub usage_point_id: Option<String>,
    pub quality: Option<String>,
}

/// One fully assembled poll result. Never mutated after construction; the
/// coordinator swaps in a new one each successful cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    fetched_at: DateTime<Utc>,
    metrics: BTreeMap<Metric, MetricState>,
    info: BTreeMap<Metric, SeriesInfo>,
    /// Newest reading ever reported per metric, kept across unavailable cycles
    last_reported: BTreeMap<Metric, Reading>,
}

impl Snapshot {
    /// Builds the snapshot for a cycle that fetched at `fetched_at`.
    ///
    /// A fresh reading older than the newest one any earlier snapshot reported
    /// for the same metric is replaced by that reading, so per-metric
    /// timestamps never go backwards, even across cycles where the metric was
    /// unavailable.
    pub fn assemble(
        fetched_at: DateTime<Utc>,
        fresh: BTreeMap<Metric, MetricState>,
        info: BTreeMap<Metric, SeriesInfo>,
        previous: Option<&Snapshot>,
    ) -> Self {
        let mut metrics = BTreeMap::new();
        let mut last_reported = BTreeMap::new();
        for metric in Metric::ALL {
            let state = fresh
                .get(&metric)
                .cloned()
                .unwrap_or(MetricState::Unavailable(UnavailableReason::NoDataYet));
            let earlier = previous.and_then(|p| p.last_reported(metric)).copied();
            let state = match (state, earlier) {
                (MetricState::Available(new), Some(old)) if new.at < old.at => {
                    MetricState::Available(old)
                }
                (state, _) => state,
            };
            if let Some(reported) = state.reading().copied().or(earlier) {
                last_reported.insert(metric, reported);
            }
            metrics.insert(metric, state);
        }

        Self {
            fetched_at,
            metrics,
            info,
            last_reported,
        }
    }

    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }

    pub fn get(&self, metric: Metric) -> &MetricState {
        static MISSING: MetricState = MetricState::Unavailable(UnavailableReason::NoDataYet);
        self.metrics.get(&metric).unwrap_or(&MISSING)
    }

    pub fn reading(&self, metric: Metric) -> Option<&Reading> {
        self.get(metric).reading()
    }

    /// Newest reading reported for `metric` by this or any earlier snapshot
    pub fn last_reported(&self, metric: Metric) -> Option<&Reading> {
        self.last_reported.get(&metric)
    }

    pub fn info(&self, metric: Metric) -> Option<&SeriesInfo> {
        self.info.get(&metric)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap()
    }

    fn fresh(metric: Metric, value: f64, day: u32) -> BTreeMap<Metric, MetricState> {
        [(metric, MetricState::Available(Reading::new(value, at(day))))].into()
    }

    #[test]
    fn test_missing_metrics_are_unavailable() {
        let snapshot = Snapshot::assemble(at(8), BTreeMap::new(), BTreeMap::new(), None);
        for metric in Metric::ALL {
            assert_eq!(
                snapshot.get(metric),
                &MetricState::Unavailable(UnavailableReason::NoDataYet)
            );
        }
    }

    #[test]
    fn test_timestamps_never_regress() {
        let first = Snapshot::assemble(
            at(8),
            fresh(Metric::DailyConsumption, 12100.0, 7),
            BTreeMap::new(),
            None,
        );
        // The API briefly serves an older day again
        let second = Snapshot::assemble(
            at(9),
            fresh(Metric::DailyConsumption, 15600.0, 6),
            BTreeMap::new(),
            Some(&first),
        );
        let reading = second.reading(Metric::DailyConsumption).unwrap();
        assert_eq!(reading.at, at(7));
        assert_eq!(reading.value, 12100.0);

        let third = Snapshot::assemble(
            at(10),
            fresh(Metric::DailyConsumption, 9000.0, 8),
            BTreeMap::new(),
            Some(&second),
        );
        assert_eq!(third.reading(Metric::DailyConsumption).unwrap().at, at(8));
    }

    #[test]
    fn test_unavailable_is_not_replaced_by_old_value() {
        let first = Snapshot::assemble(
            at(8),
            fresh(Metric::CurrentPower, 450.0, 7),
            BTreeMap::new(),
            None,
        );
        let second = Snapshot::assemble(at(9), BTreeMap::new(), BTreeMap::new(), Some(&first));
        assert_eq!(second.reading(Metric::CurrentPower), None);
    }

    #[test]
    fn test_timestamps_never_regress_across_unavailable_cycle() {
        let first = Snapshot::assemble(
            at(8),
            fresh(Metric::DailyConsumption, 12100.0, 7),
            BTreeMap::new(),
            None,
        );
        let gap = Snapshot::assemble(at(9), BTreeMap::new(), BTreeMap::new(), Some(&first));
        assert_eq!(gap.reading(Metric::DailyConsumption), None);
        assert_eq!(
            gap.last_reported(Metric::DailyConsumption).map(|r| r.at),
            Some(at(7))
        );

        // An older day comes back after the gap
        let third = Snapshot::assemble(
            at(10),
            fresh(Metric::DailyConsumption, 10500.0, 5),
            BTreeMap::new(),
            Some(&gap),
        );
        let reading = third.reading(Metric::DailyConsumption).unwrap();
        assert_eq!(reading.at, at(7));
        assert_eq!(reading.value, 12100.0);
    }

    #[test]
    fn test_reason_classification() {
        assert!(!UnavailableReason::NoDataYet.is_broken());
        assert!(!UnavailableReason::ProductionDisabled.is_broken());
        assert!(UnavailableReason::Authentication.is_broken());
        assert!(UnavailableReason::Stale.is_broken());
        assert_eq!(UnavailableReason::Authentication.to_string(), "authentication");
    }

    #[test]
    fn test_metric_units() {
        assert_eq!(Metric::WeeklyConsumption.unit(), Unit::WattHour);
        assert_eq!(Metric::CurrentProductionPower.unit(), Unit::Watt);
        assert_eq!(Metric::MaxPowerToday.unit(), Unit::Watt);
        assert_eq!(Unit::WattHour.to_string(), "Wh");
    }
}
