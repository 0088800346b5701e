//! Read-only sensor views over the coordinator state.
//!
//! A sensor never triggers a fetch. It projects one metric of the latest
//! published state into the value, availability and attributes a host
//! platform displays.

use crate::coordinator::CoordinatorState;
use crate::meters::MeterId;
use crate::snapshot::{Metric, MetricState, UnavailableReason, Unit};
use chrono::{DateTime, Utc};
use serde_derive::Serialize;

#[derive(Debug, Clone, PartialEq)]
pub struct SensorProjection {
    metric: Metric,
    meter: MeterId,
    production_enabled: bool,
}

/// What a sensor shows at one point in time
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorReading {
    pub unique_id: String,
    pub metric: Metric,
    pub value: Option<f64>,
    pub unit: Unit,
    pub available: bool,
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<UnavailableReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage_point_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<String>,
}

impl SensorProjection {
    pub fn new(metric: Metric, meter: MeterId, production_enabled: bool) -> Self {
        Self {
            metric,
            meter,
            production_enabled,
        }
    }

    /// One projection per metric for a configured meter
    pub fn for_entry(meter: &MeterId, production_enabled: bool) -> Vec<Self> {
        Metric::ALL
            .iter()
            .map(|metric| Self::new(*metric, meter.clone(), production_enabled))
            .collect()
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    /// Stable across restarts: meter and metric only
    pub fn unique_id(&self) -> String {
        format!("linky_{}_{}", self.meter, self.metric.key())
    }

    /// Staleness is judged against `now`, so a snapshot kept through failures
    /// goes unavailable even when no cycle has run since it expired.
    pub fn read(&self, state: &CoordinatorState, now: DateTime<Utc>) -> SensorReading {
        let metric_state = if self.metric.is_production() && !self.production_enabled {
            MetricState::Unavailable(UnavailableReason::ProductionDisabled)
        } else if let Some(reason) = state.blanket_unavailability(now) {
            MetricState::Unavailable(reason)
        } else {
            state
                .snapshot
                .as_ref()
                .map(|snapshot| snapshot.get(self.metric).clone())
                .unwrap_or(MetricState::Unavailable(UnavailableReason::NotFetchedYet))
        };

        let info = state
            .snapshot
            .as_ref()
            .and_then(|snapshot| snapshot.info(self.metric))
            .cloned()
            .unwrap_or_default();

        let (value, last_updated, reason) = match metric_state {
            MetricState::Available(reading) => (Some(reading.value), Some(reading.at), None),
            MetricState::Unavailable(reason) => (None, None, Some(reason)),
        };

        SensorReading {
            unique_id: self.unique_id(),
            metric: self.metric,
            value,
            unit: self.metric.unit(),
            available: value.is_some(),
            last_updated,
            reason,
            usage_point_id: info.usage_point_id,
            quality: info.quality,
        }
    }
}
