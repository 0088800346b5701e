use crate::error::{LinkyError, Result};
use crate::meters::{AuthToken, MeterId};
use crate::series::{DateRange, MetricKind, RawSeries, TimeSeriesPoint};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use reqwest::header::RETRY_AFTER;
use serde_derive::Deserialize;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_BASE_URL: &str = "https://conso.boris.sh/api";
const USER_AGENT: &str = concat!("linky_sensor_bridge/", env!("CARGO_PKG_VERSION"));

/// Where the coordinator gets its series from. Both calls are single
/// network requests with no retry of their own.
pub trait MeteringSource: Send + Sync + 'static {
    fn fetch_daily_series(
        &self,
        meter: &MeterId,
        token: &AuthToken,
        kind: MetricKind,
        range: DateRange,
    ) -> impl Future<Output = Result<RawSeries>> + Send;

    fn fetch_load_curve(
        &self,
        meter: &MeterId,
        token: &AuthToken,
        kind: MetricKind,
        range: DateRange,
    ) -> impl Future<Output = Result<RawSeries>> + Send;
}

/// Client for the Conso API (conso.boris.sh), a bearer-token proxy in front
/// of the Enedis metering data.
pub struct ConsoApi {
    endpoint_url: String,
    client: reqwest::Client,
    timezone: Tz,
}

impl ConsoApi {
    pub fn new(endpoint_url: &str, timeout: Duration, timezone: Tz) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self {
            endpoint_url: endpoint_url.trim_end_matches('/').to_string(),
            client,
            timezone,
        })
    }

    async fn get_series(
        &self,
        endpoint: &str,
        meter: &MeterId,
        token: &AuthToken,
        range: DateRange,
    ) -> Result<RawSeries> {
        debug!(%meter, endpoint, start = %range.start, end = %range.end, "Requesting series");
        let response = self
            .client
            .get(format!("{}/{}", self.endpoint_url, endpoint))
            .bearer_auth(token.expose())
            .query(&[
                ("prm", meter.as_str().to_string()),
                ("start", range.start.to_string()),
                ("end", range.end.to_string()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(LinkyError::from_status(status, retry_after));
        }

        let body = response.text().await?;
        parse_metering_data(&body, self.timezone)
    }
}

impl MeteringSource for ConsoApi {
    async fn fetch_daily_series(
        &self,
        meter: &MeterId,
        token: &AuthToken,
        kind: MetricKind,
        range: DateRange,
    ) -> Result<RawSeries> {
        self.get_series(kind.daily_endpoint(), meter, token, range)
            .await
    }

    async fn fetch_load_curve(
        &self,
        meter: &MeterId,
        token: &AuthToken,
        kind: MetricKind,
        range: DateRange,
    ) -> Result<RawSeries> {
        self.get_series(kind.load_curve_endpoint(), meter, token, range)
            .await
    }
}

#[derive(Debug, Deserialize)]
struct MeteringData {
    usage_point_id: Option<String>,
    quality: Option<String>,
    reading_type: Option<ReadingType>,
    #[serde(default)]
    interval_reading: Vec<IntervalReading>,
}

#[derive(Debug, Deserialize)]
struct ReadingType {
    unit: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IntervalReading {
    #[serde(default)]
    value: serde_json::Value,
    date: String,
}

/// Parses a metering response body. Unknown fields are ignored and a missing
/// `interval_reading` yields an empty series.
pub fn parse_metering_data(body: &str, timezone: Tz) -> Result<RawSeries> {
    let data: MeteringData = serde_json::from_str(body)?;

    let points = data
        .interval_reading
        .iter()
        .map(|reading| {
            Ok(TimeSeriesPoint::new(
                parse_reading_date(&reading.date, timezone)?,
                parse_reading_value(&reading.value)?,
            ))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut series =
        RawSeries::new(points).with_metadata(data.usage_point_id, data.quality);
    series.unit = data.reading_type.and_then(|r| r.unit);
    Ok(series)
}

fn parse_reading_value(value: &serde_json::Value) -> Result<Option<f64>> {
    let parsed = match value {
        serde_json::Value::Null => return Ok(None),
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) if s.trim().is_empty() => return Ok(None),
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match parsed {
        Some(v) if v.is_finite() && v >= 0.0 => Ok(Some(v)),
        Some(v) => {
            debug!(value = v, "Discarding out of range reading");
            Ok(None)
        }
        None => Err(LinkyError::malformed(format!(
            "reading value is not a number: {value}"
        ))),
    }
}

/// Dates come either as a calendar day or as a local timestamp without
/// offset; both are interpreted in the meter's time zone.
fn parse_reading_date(raw: &str, timezone: Tz) -> Result<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(with_offset) = DateTime::parse_from_rfc3339(raw) {
        return Ok(with_offset.with_timezone(&Utc));
    }

    let naive = if let Ok(day) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        day.and_hms_opt(0, 0, 0)
    } else {
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
            .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S"))
            .ok()
    }
    .ok_or_else(|| LinkyError::malformed(format!("unrecognised reading date `{raw}`")))?;

    timezone
        .from_local_datetime(&naive)
        .earliest()
        .map(|local| local.with_timezone(&Utc))
        .ok_or_else(|| LinkyError::malformed(format!("reading date `{raw}` does not exist locally")))
}
