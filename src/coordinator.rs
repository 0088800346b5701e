//! Polls the Conso API for one meter and publishes immutable snapshots.
//!
//! Each cycle fetches every series the entry needs, reduces them through the
//! normalizer and swaps the resulting [`Snapshot`] into a `watch` channel.
//! Subscribers are woken once per finished cycle, whether it succeeded or
//! failed. Only one cycle runs at a time; a refresh requested while another
//! is in flight is coalesced.

use crate::conso_api::MeteringSource;
use crate::error::{LinkyError, Result};
use crate::meters::{list_meters, AuthToken, MeterId};
use crate::normalizer::{self, local_date, Reading};
use crate::series::{DateRange, MetricKind, RawSeries};
use crate::snapshot::{Metric, MetricState, SeriesInfo, Snapshot, UnavailableReason};
use chrono::{DateTime, TimeDelta, Utc};
use chrono_tz::Tz;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Source of "now" for the coordinator
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Tuning shared by every coordinator
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub poll_interval: Duration,
    /// First retry delay after a transient failure; doubles per failure
    pub retry_initial: Duration,
    pub retry_max: Duration,
    /// Age after which a retained snapshot is no longer shown
    pub max_staleness: Duration,
    pub daily_lookback_days: u64,
    /// Days before today requested from the daily endpoints. Must cover the
    /// publication lag plus a full week for the weekly total.
    pub daily_history_days: u64,
    /// Days before today requested from the load curve
    pub load_curve_days: u64,
    pub load_curve_lookback_hours: i64,
    /// Pause between two API calls of the same cycle (API allows 5 req/s)
    pub request_spacing: Duration,
    pub timezone: Tz,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(6 * 3600),
            retry_initial: Duration::from_secs(5 * 60),
            retry_max: Duration::from_secs(3600),
            max_staleness: Duration::from_secs(24 * 3600),
            daily_lookback_days: 7,
            daily_history_days: 9,
            load_curve_days: 1,
            load_curve_lookback_hours: 48,
            request_spacing: Duration::from_millis(200),
            timezone: chrono_tz::Europe::Paris,
        }
    }
}

/// What the setup step hands over for one configured meter
#[derive(Debug, Clone)]
pub struct EntryConfig {
    pub token: AuthToken,
    pub meter: MeterId,
    pub production_enabled: bool,
    pub poll_interval_override: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// No cycle has finished yet
    Pending,
    Healthy,
    /// Transient failure, retrying with backoff
    Retrying { error: LinkyError },
    /// Token rejected; no automatic polling until a new token is supplied
    NeedsReauth,
    /// Meter unknown or API contract broken; polled at the normal period
    Fatal { error: LinkyError },
}

/// Everything subscribers see. Replaced as a whole, never mutated.
#[derive(Debug, Clone)]
pub struct CoordinatorState {
    pub snapshot: Option<Arc<Snapshot>>,
    pub condition: Condition,
    pub consecutive_failures: u32,
    pub last_attempt: Option<DateTime<Utc>>,
    /// Past this instant a snapshot kept through failures is no longer shown
    pub expires_at: Option<DateTime<Utc>>,
}

impl CoordinatorState {
    fn initial() -> Self {
        Self {
            snapshot: None,
            condition: Condition::Pending,
            consecutive_failures: 0,
            last_attempt: None,
            expires_at: None,
        }
    }

    /// True once failures have kept the snapshot past the staleness limit.
    /// Evaluated against the caller's clock, so it holds even while no cycle
    /// runs (for example while waiting for a new token).
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.consecutive_failures > 0 && self.expires_at.is_some_and(|at| now > at)
    }

    /// Reason that makes every metric of the meter unavailable, if any.
    pub fn blanket_unavailability(&self, now: DateTime<Utc>) -> Option<UnavailableReason> {
        match &self.condition {
            Condition::NeedsReauth => return Some(UnavailableReason::Authentication),
            Condition::Fatal {
                error: LinkyError::MalformedResponse { message },
            } => return Some(UnavailableReason::MalformedResponse(message.clone())),
            Condition::Fatal { error } => {
                return Some(UnavailableReason::Misconfigured(error.to_string()))
            }
            _ => {}
        }
        if self.is_expired(now) {
            return Some(UnavailableReason::Stale);
        }
        if self.snapshot.is_none() {
            return Some(match &self.condition {
                Condition::Retrying { error } => UnavailableReason::FetchFailed(error.to_string()),
                _ => UnavailableReason::NotFetchedYet,
            });
        }
        None
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    Succeeded,
    Failed(LinkyError),
    /// Another cycle was already in flight
    Coalesced,
    /// The coordinator was stopped; nothing was published
    Discarded,
}

/// Exponential retry delay: `initial` after the first failure, doubled per
/// further failure, never above `max`.
pub fn backoff_delay(failures: u32, initial: Duration, max: Duration) -> Duration {
    let exponent = failures.saturating_sub(1).min(16);
    initial.saturating_mul(1u32 << exponent).min(max)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Shape {
    Daily,
    LoadCurve,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct SeriesKey {
    kind: MetricKind,
    shape: Shape,
}

impl SeriesKey {
    fn for_metric(metric: Metric) -> Self {
        let (kind, shape) = match metric {
            Metric::DailyConsumption | Metric::WeeklyConsumption => {
                (MetricKind::Consumption, Shape::Daily)
            }
            Metric::CurrentPower | Metric::MaxPowerToday => {
                (MetricKind::Consumption, Shape::LoadCurve)
            }
            Metric::DailyProduction => (MetricKind::Production, Shape::Daily),
            Metric::CurrentProductionPower => (MetricKind::Production, Shape::LoadCurve),
        };
        Self { kind, shape }
    }
}

type CycleFetch = BTreeMap<SeriesKey, Result<RawSeries>>;

struct Shared<S> {
    source: S,
    meter: MeterId,
    production_enabled: bool,
    poll_interval: Duration,
    settings: CoordinatorSettings,
    token: RwLock<AuthToken>,
    clock: Clock,
    in_flight: AtomicBool,
    stopped: AtomicBool,
    wake: Notify,
    /// Runtime instant at which the retained snapshot expires, while failing
    expiry_alarm: Mutex<Option<Instant>>,
    state: watch::Sender<Arc<CoordinatorState>>,
}

/// Coordinates the periodic fetch for a single meter
pub struct UpdateCoordinator<S> {
    shared: Arc<Shared<S>>,
}

impl<S> Clone for UpdateCoordinator<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Resets the single-flight flag when a cycle ends, however it ends
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<S: MeteringSource> UpdateCoordinator<S> {
    pub fn new(source: S, entry: EntryConfig, settings: CoordinatorSettings) -> Self {
        Self::with_clock(source, entry, settings, Arc::new(Utc::now))
    }

    pub fn with_clock(
        source: S,
        entry: EntryConfig,
        settings: CoordinatorSettings,
        clock: Clock,
    ) -> Self {
        let (state, _) = watch::channel(Arc::new(CoordinatorState::initial()));
        let poll_interval = entry
            .poll_interval_override
            .unwrap_or(settings.poll_interval);
        Self {
            shared: Arc::new(Shared {
                source,
                meter: entry.meter,
                production_enabled: entry.production_enabled,
                poll_interval,
                settings,
                token: RwLock::new(entry.token),
                clock,
                in_flight: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                wake: Notify::new(),
                expiry_alarm: Mutex::new(None),
                state,
            }),
        }
    }

    /// Validates the entry and performs the first refresh.
    ///
    /// A token that does not cover the meter, or a first cycle failing with
    /// an authentication or not-found error, refuses the setup. Any other
    /// failure still yields a coordinator, which then retries with backoff.
    pub async fn setup(source: S, entry: EntryConfig, settings: CoordinatorSettings) -> Result<Self> {
        Self::setup_with_clock(source, entry, settings, Arc::new(Utc::now)).await
    }

    pub async fn setup_with_clock(
        source: S,
        entry: EntryConfig,
        settings: CoordinatorSettings,
        clock: Clock,
    ) -> Result<Self> {
        let meters = list_meters(&entry.token)?;
        if !meters.contains(&entry.meter) {
            return Err(LinkyError::not_found(format!(
                "meter {} is not accessible with this token",
                entry.meter
            )));
        }

        let coordinator = Self::with_clock(source, entry, settings, clock);
        match coordinator.refresh().await {
            CycleOutcome::Failed(err @ (LinkyError::Auth { .. } | LinkyError::NotFound { .. })) => {
                error!(meter = %coordinator.meter(), "Setup refused: {err}");
                Err(err)
            }
            CycleOutcome::Failed(err) => {
                warn!(meter = %coordinator.meter(), "First refresh failed, will retry: {err}");
                Ok(coordinator)
            }
            _ => Ok(coordinator),
        }
    }

    pub fn meter(&self) -> &MeterId {
        &self.shared.meter
    }

    pub fn production_enabled(&self) -> bool {
        self.shared.production_enabled
    }

    pub fn poll_interval(&self) -> Duration {
        self.shared.poll_interval
    }

    /// Current published state
    pub fn state(&self) -> Arc<CoordinatorState> {
        self.shared.state.borrow().clone()
    }

    /// Receiver woken once per finished cycle
    pub fn subscribe(&self) -> watch::Receiver<Arc<CoordinatorState>> {
        self.shared.state.subscribe()
    }

    pub fn is_fetching(&self) -> bool {
        self.shared.in_flight.load(Ordering::Acquire)
    }

    /// Replaces the token after an authentication failure and wakes the
    /// update loop for an immediate cycle.
    pub fn reauthenticate(&self, token: AuthToken) -> Result<()> {
        let meters = list_meters(&token)?;
        if !meters.contains(&self.shared.meter) {
            return Err(LinkyError::not_found(format!(
                "meter {} is not accessible with the new token",
                self.shared.meter
            )));
        }
        *self
            .shared
            .token
            .write()
            .unwrap_or_else(PoisonError::into_inner) = token;

        let current = self.state();
        if current.condition == Condition::NeedsReauth {
            self.shared.state.send_replace(Arc::new(CoordinatorState {
                condition: Condition::Pending,
                ..(*current).clone()
            }));
        }
        info!(meter = %self.shared.meter, "Token replaced, refreshing");
        self.shared.wake.notify_one();
        Ok(())
    }

    /// Delay before the next scheduled cycle given the current state.
    /// `None` means wait for a new token.
    pub fn next_delay(&self) -> Option<Duration> {
        let state = self.state();
        let settings = &self.shared.settings;
        match &state.condition {
            Condition::Healthy | Condition::Fatal { .. } => Some(self.shared.poll_interval),
            Condition::Pending => Some(settings.retry_initial),
            Condition::NeedsReauth => None,
            Condition::Retrying { error } => {
                let backoff = backoff_delay(
                    state.consecutive_failures,
                    settings.retry_initial,
                    settings.retry_max,
                );
                Some(match error {
                    LinkyError::RateLimited {
                        retry_after: Some(hint),
                    } => backoff.max(*hint).min(settings.retry_max),
                    _ => backoff,
                })
            }
        }
    }

    /// Runs one fetch cycle unless one is already in flight.
    pub async fn refresh(&self) -> CycleOutcome {
        let shared = &self.shared;
        if shared.stopped.load(Ordering::Acquire) {
            return CycleOutcome::Discarded;
        }
        if shared
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(meter = %shared.meter, "Cycle already in flight, coalescing");
            return CycleOutcome::Coalesced;
        }
        let _flight = InFlight(&shared.in_flight);

        let now = (shared.clock)();
        let token = shared
            .token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let fetched = self.fetch_cycle(&token, now).await;

        if shared.stopped.load(Ordering::Acquire) {
            debug!(meter = %shared.meter, "Coordinator stopped during fetch, discarding result");
            return CycleOutcome::Discarded;
        }

        let previous = self.state();
        match self.build_snapshot(&fetched, now, previous.snapshot.as_deref()) {
            Ok(snapshot) => {
                self.publish_success(snapshot, now, &previous);
                CycleOutcome::Succeeded
            }
            Err(err) => {
                self.publish_failure(err.clone(), now, &previous);
                CycleOutcome::Failed(err)
            }
        }
    }

    /// Starts the timer loop on the runtime.
    pub fn spawn(&self) -> CoordinatorHandle<S> {
        let coordinator = self.clone();
        let task = tokio::spawn(async move { coordinator.run().await });
        CoordinatorHandle {
            coordinator: self.clone(),
            task,
        }
    }

    async fn run(&self) {
        info!(
            meter = %self.shared.meter,
            interval_secs = self.shared.poll_interval.as_secs(),
            "Starting update loop"
        );

        loop {
            let delay = self.next_delay();
            let wait = async move {
                match delay {
                    Some(delay) => tokio::time::sleep(delay).await,
                    None => std::future::pending::<()>().await,
                }
            };
            let alarm = *self
                .shared
                .expiry_alarm
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let expiry = async move {
                match alarm {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                _ = wait => {}
                _ = expiry => {
                    self.announce_expiry();
                    continue;
                }
                _ = self.shared.wake.notified() => {}
            }

            if self.shared.stopped.load(Ordering::Acquire) {
                break;
            }
            if let CycleOutcome::Discarded = self.refresh().await {
                break;
            }
        }

        info!(meter = %self.shared.meter, "Update loop stopped");
    }

    async fn fetch_cycle(&self, token: &AuthToken, now: DateTime<Utc>) -> CycleFetch {
        let shared = &self.shared;
        let settings = &shared.settings;
        let today = local_date(now, settings.timezone);
        let daily_range = DateRange::trailing_days(today, settings.daily_history_days);
        let curve_range = DateRange::through_today(today, settings.load_curve_days);

        let mut kinds = vec![MetricKind::Consumption];
        if shared.production_enabled {
            kinds.push(MetricKind::Production);
        }
        let requests: Vec<SeriesKey> = kinds
            .into_iter()
            .flat_map(|kind| {
                [Shape::Daily, Shape::LoadCurve]
                    .into_iter()
                    .map(move |shape| SeriesKey { kind, shape })
            })
            .collect();

        let mut fetched = CycleFetch::new();
        for (index, key) in requests.into_iter().enumerate() {
            if index > 0 && !settings.request_spacing.is_zero() {
                tokio::time::sleep(settings.request_spacing).await;
            }
            let result = match key.shape {
                Shape::Daily => {
                    shared
                        .source
                        .fetch_daily_series(&shared.meter, token, key.kind, daily_range)
                        .await
                }
                Shape::LoadCurve => {
                    shared
                        .source
                        .fetch_load_curve(&shared.meter, token, key.kind, curve_range)
                        .await
                }
            };
            let rejected = matches!(result, Err(LinkyError::Auth { .. }));
            fetched.insert(key, result);
            if rejected {
                break;
            }
        }
        fetched
    }

    fn build_snapshot(
        &self,
        fetched: &CycleFetch,
        now: DateTime<Utc>,
        previous: Option<&Snapshot>,
    ) -> Result<Snapshot> {
        let errors = || fetched.values().filter_map(|r| r.as_ref().err());
        if let Some(auth) = errors().find(|e| matches!(e, LinkyError::Auth { .. })) {
            return Err(auth.clone());
        }
        if fetched.values().all(|r| r.is_err()) {
            return Err(errors()
                .max_by_key(|e| e.severity())
                .cloned()
                .unwrap_or_else(|| LinkyError::transient("no series were requested")));
        }

        let mut fresh = BTreeMap::new();
        let mut info = BTreeMap::new();
        for metric in Metric::ALL {
            if metric.is_production() && !self.shared.production_enabled {
                fresh.insert(
                    metric,
                    MetricState::Unavailable(UnavailableReason::ProductionDisabled),
                );
                continue;
            }

            let state = match fetched.get(&SeriesKey::for_metric(metric)) {
                Some(Ok(series)) => {
                    info.insert(
                        metric,
                        SeriesInfo {
                            usage_point_id: series.usage_point_id.clone(),
                            quality: series.quality.clone(),
                        },
                    );
                    match self.normalize(metric, series, now) {
                        Some(reading) => MetricState::Available(reading),
                        None => MetricState::Unavailable(UnavailableReason::NoDataYet),
                    }
                }
                Some(Err(err)) => self.degraded(metric, err, previous, now),
                None => MetricState::Unavailable(UnavailableReason::NotFetchedYet),
            };
            fresh.insert(metric, state);
        }

        Ok(Snapshot::assemble(now, fresh, info, previous))
    }

    fn normalize(&self, metric: Metric, series: &RawSeries, now: DateTime<Utc>) -> Option<Reading> {
        let settings = &self.shared.settings;
        match metric {
            Metric::DailyConsumption | Metric::DailyProduction => {
                normalizer::latest_valid(series, self.daily_lookback(), now)
            }
            Metric::WeeklyConsumption => {
                normalizer::weekly_total(series, self.daily_lookback(), now, settings.timezone)
            }
            Metric::CurrentPower | Metric::CurrentProductionPower => {
                normalizer::latest_valid(series, self.curve_lookback(), now)
            }
            Metric::MaxPowerToday => normalizer::max_power_today(series, now, settings.timezone),
        }
    }

    /// State of a metric whose series failed while the cycle as a whole
    /// succeeded. Transient failures keep the previous reading as long as it
    /// would still pass the look-back window.
    fn degraded(
        &self,
        metric: Metric,
        err: &LinkyError,
        previous: Option<&Snapshot>,
        now: DateTime<Utc>,
    ) -> MetricState {
        warn!(meter = %self.shared.meter, metric = metric.key(), "Series fetch failed: {err}");
        match err {
            LinkyError::RateLimited { .. } | LinkyError::Transient { .. } => previous
                .and_then(|p| p.reading(metric))
                .filter(|reading| self.still_current(metric, reading, now))
                .map(|reading| MetricState::Available(*reading))
                .unwrap_or_else(|| {
                    MetricState::Unavailable(UnavailableReason::FetchFailed(err.to_string()))
                }),
            LinkyError::NotFound { message } => {
                MetricState::Unavailable(UnavailableReason::Misconfigured(message.clone()))
            }
            LinkyError::MalformedResponse { message } => {
                MetricState::Unavailable(UnavailableReason::MalformedResponse(message.clone()))
            }
            LinkyError::Auth { .. } => MetricState::Unavailable(UnavailableReason::Authentication),
        }
    }

    fn still_current(&self, metric: Metric, reading: &Reading, now: DateTime<Utc>) -> bool {
        let tz = self.shared.settings.timezone;
        match metric {
            Metric::MaxPowerToday => local_date(reading.at, tz) == local_date(now, tz),
            Metric::CurrentPower | Metric::CurrentProductionPower => {
                reading.at >= now - self.curve_lookback()
            }
            _ => reading.at >= now - self.daily_lookback(),
        }
    }

    fn daily_lookback(&self) -> TimeDelta {
        TimeDelta::days(self.shared.settings.daily_lookback_days as i64)
    }

    fn curve_lookback(&self) -> TimeDelta {
        TimeDelta::hours(self.shared.settings.load_curve_lookback_hours)
    }

    fn publish_success(&self, snapshot: Snapshot, now: DateTime<Utc>, previous: &CoordinatorState) {
        if previous.consecutive_failures > 0 {
            info!(
                meter = %self.shared.meter,
                failures = previous.consecutive_failures,
                "Recovered after failures"
            );
        }
        debug!(meter = %self.shared.meter, "Publishing new snapshot");
        *self
            .shared
            .expiry_alarm
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
        let expires_at = TimeDelta::from_std(self.shared.settings.max_staleness)
            .ok()
            .and_then(|staleness| now.checked_add_signed(staleness));
        self.shared.state.send_replace(Arc::new(CoordinatorState {
            snapshot: Some(Arc::new(snapshot)),
            condition: Condition::Healthy,
            consecutive_failures: 0,
            last_attempt: Some(now),
            expires_at,
        }));
    }

    fn publish_failure(&self, err: LinkyError, now: DateTime<Utc>, previous: &CoordinatorState) {
        let meter = &self.shared.meter;
        let failures = previous.consecutive_failures.saturating_add(1);
        let condition = match &err {
            LinkyError::Auth { .. } => {
                error!(%meter, "Token rejected, re-authentication required: {err}");
                Condition::NeedsReauth
            }
            LinkyError::NotFound { .. } | LinkyError::MalformedResponse { .. } => {
                error!(%meter, failures, "Cycle failed: {err}");
                Condition::Fatal { error: err.clone() }
            }
            LinkyError::RateLimited { .. } | LinkyError::Transient { .. } => {
                warn!(%meter, failures, "Cycle failed, backing off: {err}");
                Condition::Retrying { error: err.clone() }
            }
        };

        self.arm_expiry(previous.expires_at, now, previous.consecutive_failures == 0);
        self.shared.state.send_replace(Arc::new(CoordinatorState {
            snapshot: previous.snapshot.clone(),
            condition,
            consecutive_failures: failures,
            last_attempt: Some(now),
            expires_at: previous.expires_at,
        }));
    }

    /// Schedules the wake-up that tells listeners the retained snapshot
    /// expired, in case no cycle runs before then.
    fn arm_expiry(&self, expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>, first_failure: bool) {
        let Some(expires_at) = expires_at else {
            return;
        };
        let mut alarm = self
            .shared
            .expiry_alarm
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match (expires_at - now).to_std() {
            Ok(left) => {
                alarm.get_or_insert_with(|| Instant::now() + left);
            }
            Err(_) => {
                if alarm.take().is_some() || first_failure {
                    warn!(meter = %self.shared.meter, "Last snapshot expired, readings now unavailable");
                }
            }
        }
    }

    /// Wakes listeners so they re-read the state once the snapshot expired.
    fn announce_expiry(&self) {
        *self
            .shared
            .expiry_alarm
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
        warn!(meter = %self.shared.meter, "Last snapshot expired, readings now unavailable");
        self.shared.state.send_modify(|_| {});
    }
}

/// Owns the spawned update loop of a coordinator
pub struct CoordinatorHandle<S> {
    coordinator: UpdateCoordinator<S>,
    task: JoinHandle<()>,
}

impl<S: MeteringSource> CoordinatorHandle<S> {
    pub fn coordinator(&self) -> &UpdateCoordinator<S> {
        &self.coordinator
    }

    /// Stops scheduling cycles. A cycle already in flight runs to completion
    /// and its result is thrown away.
    pub async fn stop(self) {
        let shared = &self.coordinator.shared;
        shared.stopped.store(true, Ordering::Release);
        shared.wake.notify_one();
        if let Err(e) = self.task.await {
            warn!(meter = %shared.meter, "Update loop ended abnormally: {e}");
        }
    }
}
