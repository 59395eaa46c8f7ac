//! Aggregation of raw beacon samples into per-provider status.

use crate::config::{AggregationSettings, MergeMode};
use crate::db::{
    DbError, Endpoint, EndpointRegistry, RawSample, RegionBreakdown, SampleStore, Status,
    StatusTable, StatusUpdate, Store,
};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};

/// Health metrics over one window of samples.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowMetrics {
    pub sample_count: usize,
    pub up_count: usize,
    pub average_latency: f64,
    pub up_percentage: f64,
}

impl WindowMetrics {
    /// Returns `None` for an empty sample set.
    pub fn compute(samples: &[RawSample]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }

        let n = samples.len();
        let total_latency: f64 = samples.iter().map(|s| s.latency_ms).sum();
        let up_count = samples.iter().filter(|s| s.is_up).count();

        Some(Self {
            sample_count: n,
            up_count,
            average_latency: total_latency / n as f64,
            up_percentage: (up_count as f64 / n as f64) * 100.0,
        })
    }

    pub fn status(&self) -> Status {
        Status::from_up_percentage(self.up_percentage)
    }
}

/// Classify each region seen in `samples` independently. Samples without a
/// region are ignored; `None` if no sample carries one.
pub fn region_breakdown(samples: &[RawSample]) -> Option<RegionBreakdown> {
    let mut by_region: BTreeMap<&str, (usize, usize)> = BTreeMap::new();
    for s in samples {
        if let Some(region) = s.region.as_deref() {
            let entry = by_region.entry(region).or_default();
            entry.0 += 1;
            if s.is_up {
                entry.1 += 1;
            }
        }
    }

    if by_region.is_empty() {
        return None;
    }

    Some(
        by_region
            .into_iter()
            .map(|(region, (total, up))| {
                let pct = (up as f64 / total as f64) * 100.0;
                (region.to_string(), Status::from_up_percentage(pct))
            })
            .collect(),
    )
}

/// Build the status row contents for a provider from a window of samples.
pub fn summarize(provider: &str, samples: &[RawSample]) -> Option<StatusUpdate> {
    let metrics = WindowMetrics::compute(samples)?;
    Some(StatusUpdate {
        provider: provider.to_string(),
        status: metrics.status(),
        average_latency: metrics.average_latency,
        region_breakdown: region_breakdown(samples),
    })
}

/// Outcome of one aggregation cycle.
///
/// `skipped_empty` and `failed` count endpoints in last-write-wins mode and
/// providers in pooled mode.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleReport {
    /// Active endpoints seen.
    pub endpoints: usize,
    /// Status rows written.
    pub updated: usize,
    pub skipped_empty: usize,
    pub failed: usize,
}

/// Start of the window ending at `now`.
pub fn window_start(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    ChronoDuration::from_std(window)
        .ok()
        .and_then(|w| now.checked_sub_signed(w))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Run one aggregation pass over every active endpoint.
///
/// Only a registry failure aborts the cycle; per-endpoint read or write
/// failures are logged and skipped. Providers without samples in the window
/// keep their existing row untouched.
pub fn run_aggregation_cycle<R, S, T>(
    registry: &R,
    samples: &S,
    statuses: &T,
    settings: &AggregationSettings,
    now: DateTime<Utc>,
) -> Result<CycleReport, DbError>
where
    R: EndpointRegistry + ?Sized,
    S: SampleStore + ?Sized,
    T: StatusTable + ?Sized,
{
    let endpoints = registry.list_active()?;
    let since = window_start(now, settings.window);

    let mut report = CycleReport {
        endpoints: endpoints.len(),
        ..Default::default()
    };

    match settings.merge {
        MergeMode::LastWriteWins => {
            for endpoint in &endpoints {
                let window = match read_window(samples, endpoint, since, settings.read_attempts) {
                    Ok(w) => w,
                    Err(e) => {
                        tracing::warn!(
                            endpoint_id = endpoint.id,
                            provider = %endpoint.provider,
                            "Aggregation: skipping endpoint, sample read failed: {}",
                            e
                        );
                        report.failed += 1;
                        continue;
                    }
                };

                match summarize(&endpoint.provider, &window) {
                    Some(update) => write_status(statuses, &update, now, &mut report),
                    None => report.skipped_empty += 1,
                }
            }
        }
        MergeMode::Pooled => {
            let mut by_provider: BTreeMap<&str, Vec<&Endpoint>> = BTreeMap::new();
            for endpoint in &endpoints {
                by_provider
                    .entry(endpoint.provider.as_str())
                    .or_default()
                    .push(endpoint);
            }

            'providers: for (provider, members) in by_provider {
                let mut pooled = Vec::new();
                for endpoint in members {
                    match read_window(samples, endpoint, since, settings.read_attempts) {
                        Ok(mut w) => pooled.append(&mut w),
                        Err(e) => {
                            tracing::warn!(
                                endpoint_id = endpoint.id,
                                provider = %provider,
                                "Aggregation: skipping provider, sample read failed: {}",
                                e
                            );
                            report.failed += 1;
                            continue 'providers;
                        }
                    }
                }

                match summarize(provider, &pooled) {
                    Some(update) => write_status(statuses, &update, now, &mut report),
                    None => report.skipped_empty += 1,
                }
            }
        }
    }

    Ok(report)
}

fn read_window<S>(
    samples: &S,
    endpoint: &Endpoint,
    since: DateTime<Utc>,
    attempts: u32,
) -> Result<Vec<RawSample>, DbError>
where
    S: SampleStore + ?Sized,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match samples.query_window(endpoint.id, since) {
            Ok(window) => return Ok(window),
            Err(e) if attempt < attempts => {
                tracing::debug!(
                    "Aggregation: read attempt {}/{} for endpoint {} failed: {}",
                    attempt,
                    attempts,
                    endpoint.id,
                    e
                );
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

fn write_status<T>(statuses: &T, update: &StatusUpdate, now: DateTime<Utc>, report: &mut CycleReport)
where
    T: StatusTable + ?Sized,
{
    match statuses.upsert(update, now) {
        Ok(row) => {
            tracing::debug!(
                "Aggregation: {} is {} (avg {:.1}ms)",
                row.provider,
                row.status,
                row.average_latency
            );
            report.updated += 1;
        }
        Err(e) => {
            tracing::warn!(provider = %update.provider, "Aggregation: status upsert failed: {}", e);
            report.failed += 1;
        }
    }
}

/// Runs aggregation cycles on a fixed period and on demand.
///
/// Cycles are serialised: a manual trigger waits for a scheduled cycle in
/// progress and vice versa.
pub struct AggregationManager {
    store: Arc<Store>,
    settings: AggregationSettings,
    interval: Duration,
    cycle_lock: Arc<Mutex<()>>,
    last_report: Arc<Mutex<HashMap<&'static str, CycleReport>>>,
}

impl AggregationManager {
    pub fn new(store: Arc<Store>, settings: AggregationSettings, interval: Duration) -> Self {
        Self {
            store,
            settings,
            interval,
            cycle_lock: Arc::new(Mutex::new(())),
            last_report: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Start the periodic aggregation task. A cycle in progress always
    /// finishes before the task observes a stop signal.
    pub fn start(self: &Arc<Self>, mut stop_rx: broadcast::Receiver<()>) {
        let manager = self.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(manager.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = stop_rx.recv() => break,
                    _ = interval.tick() => {
                        if let Err(e) = manager.run_cycle("scheduled", Utc::now()).await {
                            tracing::error!("AggregationManager: cycle aborted, cannot list endpoints: {}", e);
                        }
                    }
                }
            }
        });
    }

    /// Run one cycle now, after any cycle already in progress.
    pub async fn run_cycle(
        &self,
        trigger: &'static str,
        now: DateTime<Utc>,
    ) -> Result<CycleReport, DbError> {
        let _guard = self.cycle_lock.lock().await;

        let report = run_aggregation_cycle(
            self.store.as_ref(),
            self.store.as_ref(),
            self.store.as_ref(),
            &self.settings,
            now,
        )?;

        tracing::info!(
            "AggregationManager: {} cycle: {} endpoints, {} updated, {} empty, {} failed",
            trigger,
            report.endpoints,
            report.updated,
            report.skipped_empty,
            report.failed
        );

        self.last_report.lock().await.insert(trigger, report.clone());
        Ok(report)
    }

    /// Most recent report for a trigger kind (`"scheduled"` or `"manual"`).
    pub async fn last_report(&self, trigger: &str) -> Option<CycleReport> {
        self.last_report.lock().await.get(trigger).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::ProviderStatus;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::NamedTempFile;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn new_store() -> (NamedTempFile, Store) {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        (tmp, store)
    }

    fn add_endpoint(store: &Store, provider: &str, region: Option<&str>) -> Endpoint {
        let mut endpoint = Endpoint {
            provider: provider.to_string(),
            url: format!("https://{}.example.com/health", provider),
            region: region.map(str::to_string),
            ..Default::default()
        };
        store.add_endpoint(&mut endpoint).unwrap();
        endpoint
    }

    fn reading(endpoint: &Endpoint, minutes_ago: i64, is_up: bool, latency_ms: f64) -> RawSample {
        let timestamp = now() - ChronoDuration::minutes(minutes_ago);
        RawSample {
            provider: endpoint.provider.clone(),
            endpoint_id: endpoint.id,
            region: endpoint.region.clone(),
            dns_resolution_ms: None,
            server_response_ms: None,
            http_status: if is_up { 200 } else { 500 },
            latency_ms,
            is_up,
            timestamp,
            created_at: timestamp,
        }
    }

    fn run(store: &Store, at: DateTime<Utc>) -> CycleReport {
        run_aggregation_cycle(store, store, store, &AggregationSettings::default(), at).unwrap()
    }

    fn samples_with(k: usize, n: usize) -> Vec<RawSample> {
        let endpoint = Endpoint::default();
        (0..n).map(|i| reading(&endpoint, 1, i < k, 10.0)).collect()
    }

    #[test]
    fn test_average_latency() {
        let endpoint = Endpoint::default();
        let samples: Vec<_> = [100.0, 200.0, 300.0]
            .into_iter()
            .map(|l| reading(&endpoint, 1, true, l))
            .collect();
        let metrics = WindowMetrics::compute(&samples).unwrap();
        assert_eq!(metrics.average_latency, 200.0);

        let single = WindowMetrics::compute(&samples[..1]).unwrap();
        assert_eq!(single.average_latency, 100.0);
        assert!(WindowMetrics::compute(&[]).is_none());
    }

    #[test]
    fn test_up_percentage_is_exact_ratio() {
        for (k, n) in [(0, 1), (1, 1), (1, 3), (2, 3), (19, 20), (7, 13), (50, 100)] {
            let metrics = WindowMetrics::compute(&samples_with(k, n)).unwrap();
            let expected = 100.0 * k as f64 / n as f64;
            assert!(
                (metrics.up_percentage - expected).abs() < 1e-9,
                "k={} n={} got {}",
                k,
                n,
                metrics.up_percentage
            );
            assert_eq!(metrics.up_count, k);
            assert_eq!(metrics.sample_count, n);
        }
    }

    #[test]
    fn test_status_boundaries_from_samples() {
        assert_eq!(WindowMetrics::compute(&samples_with(19, 20)).unwrap().status(), Status::Up);
        assert_eq!(WindowMetrics::compute(&samples_with(18, 20)).unwrap().status(), Status::Degraded);
        assert_eq!(WindowMetrics::compute(&samples_with(1, 2)).unwrap().status(), Status::Degraded);
        assert_eq!(WindowMetrics::compute(&samples_with(9, 19)).unwrap().status(), Status::Down);
    }

    #[test]
    fn test_region_breakdown() {
        let east = Endpoint {
            region: Some("us-east".to_string()),
            ..Default::default()
        };
        let west = Endpoint {
            region: Some("us-west".to_string()),
            ..Default::default()
        };
        let nowhere = Endpoint::default();

        let samples = vec![
            reading(&east, 1, true, 10.0),
            reading(&east, 2, true, 10.0),
            reading(&west, 1, false, 10.0),
            reading(&west, 2, true, 10.0),
            reading(&nowhere, 1, false, 10.0),
        ];
        let breakdown = region_breakdown(&samples).unwrap();
        assert_eq!(breakdown.len(), 2);
        assert_eq!(breakdown["us-east"], Status::Up);
        assert_eq!(breakdown["us-west"], Status::Degraded);

        assert!(region_breakdown(&[reading(&nowhere, 1, true, 1.0)]).is_none());
    }

    #[test]
    fn test_end_to_end_twenty_readings() {
        let (_tmp, store) = new_store();
        let endpoint = add_endpoint(&store, "aws", None);

        let mut batch: Vec<_> = (0..19).map(|i| reading(&endpoint, i % 10, true, 50.0)).collect();
        batch.push(reading(&endpoint, 9, false, 5000.0));
        store.append_batch(&batch).unwrap();

        let report = run(&store, now());
        assert_eq!(report, CycleReport { endpoints: 1, updated: 1, skipped_empty: 0, failed: 0 });

        let status = store.get_status("aws").unwrap().unwrap();
        assert_eq!(status.status, Status::Up);
        assert_eq!(status.average_latency, 297.5);
        assert_eq!(status.last_checked, now());
        assert_eq!(status.updated_at, now());
    }

    #[test]
    fn test_provider_without_samples_is_untouched() {
        let (_tmp, store) = new_store();
        let quiet = add_endpoint(&store, "stripe", None);
        let busy = add_endpoint(&store, "vercel", None);

        store.append(&reading(&quiet, 5, false, 900.0)).unwrap();
        store.append(&reading(&busy, 5, true, 30.0)).unwrap();
        run(&store, now());
        let before: ProviderStatus = store.get_status("stripe").unwrap().unwrap();
        assert_eq!(before.status, Status::Down);

        // An hour later only vercel has fresh samples.
        let later = now() + ChronoDuration::hours(1);
        let mut fresh = reading(&busy, 0, true, 40.0);
        fresh.timestamp = later;
        store.append(&fresh).unwrap();

        let report = run(&store, later);
        assert_eq!(report.updated, 1);
        assert_eq!(report.skipped_empty, 1);
        assert_eq!(store.get_status("stripe").unwrap().unwrap(), before);
        assert_eq!(store.get_status("vercel").unwrap().unwrap().last_checked, later);
    }

    #[test]
    fn test_repeated_cycle_is_idempotent() {
        let (_tmp, store) = new_store();
        let endpoint = add_endpoint(&store, "cloudflare", Some("fra"));
        for i in 0..4 {
            store.append(&reading(&endpoint, i, i != 0, 20.0 * (i + 1) as f64)).unwrap();
        }

        run(&store, now());
        let first = store.get_status("cloudflare").unwrap().unwrap();
        let second_at = now() + ChronoDuration::seconds(1);
        run(&store, second_at);
        let second = store.get_status("cloudflare").unwrap().unwrap();

        assert_eq!(second.id, first.id);
        assert_eq!(second.status, first.status);
        assert_eq!(second.average_latency, first.average_latency);
        assert_eq!(second.region_breakdown, first.region_breakdown);
        assert_eq!(second.last_checked, second_at);
        assert_eq!(second.updated_at, second_at);
        assert!(second.last_checked > first.last_checked);
    }

    #[test]
    fn test_window_excludes_old_samples_and_is_inclusive() {
        let (_tmp, store) = new_store();
        let endpoint = add_endpoint(&store, "aws", None);

        // Exactly on the lower bound: counted.
        store.append(&reading(&endpoint, 15, true, 100.0)).unwrap();
        // Just outside: ignored.
        let mut stale = reading(&endpoint, 15, false, 9999.0);
        stale.timestamp -= ChronoDuration::milliseconds(1);
        store.append(&stale).unwrap();

        run(&store, now());
        let status = store.get_status("aws").unwrap().unwrap();
        assert_eq!(status.status, Status::Up);
        assert_eq!(status.average_latency, 100.0);
    }

    #[test]
    fn test_inactive_endpoint_is_skipped() {
        let (_tmp, store) = new_store();
        let mut endpoint = add_endpoint(&store, "aws", None);
        store.append(&reading(&endpoint, 1, false, 10.0)).unwrap();

        endpoint.active = false;
        store.update_endpoint(&endpoint).unwrap();

        let report = run(&store, now());
        assert_eq!(report.endpoints, 0);
        assert!(store.get_status("aws").unwrap().is_none());
        // Samples are kept.
        assert_eq!(store.count_samples().unwrap(), 1);
    }

    #[test]
    fn test_last_write_wins_for_shared_provider() {
        let (_tmp, store) = new_store();
        let first = add_endpoint(&store, "aws", Some("us-east-1"));
        let second = add_endpoint(&store, "aws", Some("eu-west-1"));

        store.append(&reading(&first, 1, true, 10.0)).unwrap();
        store.append(&reading(&second, 1, false, 30.0)).unwrap();

        let report = run(&store, now());
        assert_eq!(report.updated, 2);

        // Endpoints are processed in id order; the second overwrote the first.
        let status = store.get_status("aws").unwrap().unwrap();
        assert_eq!(status.status, Status::Down);
        assert_eq!(status.average_latency, 30.0);
        let regions = status.region_breakdown.unwrap();
        assert_eq!(regions.len(), 1);
        assert_eq!(regions["eu-west-1"], Status::Down);
        assert_eq!(store.list_all().unwrap().len(), 1);
    }

    #[test]
    fn test_pooled_merge_combines_endpoints() {
        let (_tmp, store) = new_store();
        let first = add_endpoint(&store, "aws", Some("us-east-1"));
        let second = add_endpoint(&store, "aws", Some("eu-west-1"));
        let empty = add_endpoint(&store, "gcp", None);

        store.append(&reading(&first, 1, true, 10.0)).unwrap();
        store.append(&reading(&second, 1, false, 30.0)).unwrap();

        let settings = AggregationSettings {
            merge: MergeMode::Pooled,
            ..Default::default()
        };
        let report = run_aggregation_cycle(&store, &store, &store, &settings, now()).unwrap();
        assert_eq!(report, CycleReport { endpoints: 3, updated: 1, skipped_empty: 1, failed: 0 });

        let status = store.get_status("aws").unwrap().unwrap();
        assert_eq!(status.status, Status::Degraded);
        assert_eq!(status.average_latency, 20.0);
        let regions = status.region_breakdown.unwrap();
        assert_eq!(regions["us-east-1"], Status::Up);
        assert_eq!(regions["eu-west-1"], Status::Down);
        assert!(store.get_status(&empty.provider).unwrap().is_none());
    }

    /// Sample reads for one endpoint fail a fixed number of times.
    struct FlakySamples<'a> {
        inner: &'a Store,
        endpoint_id: i64,
        failures_left: AtomicU32,
    }

    impl SampleStore for FlakySamples<'_> {
        fn append(&self, sample: &RawSample) -> Result<i64, DbError> {
            self.inner.append(sample)
        }

        fn query_window(&self, endpoint_id: i64, since: DateTime<Utc>) -> Result<Vec<RawSample>, DbError> {
            if endpoint_id == self.endpoint_id
                && self
                    .failures_left
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
            {
                return Err(DbError::Sqlite(rusqlite::Error::InvalidQuery));
            }
            self.inner.query_window(endpoint_id, since)
        }
    }

    #[test]
    fn test_read_failure_skips_only_that_endpoint() {
        let (_tmp, store) = new_store();
        let broken = add_endpoint(&store, "stripe", None);
        let healthy = add_endpoint(&store, "vercel", None);
        store.append(&reading(&broken, 1, false, 10.0)).unwrap();
        store.append(&reading(&healthy, 1, true, 10.0)).unwrap();

        let samples = FlakySamples {
            inner: &store,
            endpoint_id: broken.id,
            failures_left: AtomicU32::new(u32::MAX),
        };
        let report =
            run_aggregation_cycle(&store, &samples, &store, &AggregationSettings::default(), now())
                .unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(report.updated, 1);
        assert!(store.get_status("stripe").unwrap().is_none());
        assert!(store.get_status("vercel").unwrap().is_some());
    }

    #[test]
    fn test_pooled_read_failure_skips_whole_provider() {
        let (_tmp, store) = new_store();
        let healthy = add_endpoint(&store, "aws", Some("us-east-1"));
        let broken = add_endpoint(&store, "aws", Some("eu-west-1"));
        let other = add_endpoint(&store, "vercel", None);
        store.append(&reading(&healthy, 1, true, 10.0)).unwrap();
        store.append(&reading(&other, 1, true, 10.0)).unwrap();

        let samples = FlakySamples {
            inner: &store,
            endpoint_id: broken.id,
            failures_left: AtomicU32::new(u32::MAX),
        };
        let settings = AggregationSettings {
            merge: MergeMode::Pooled,
            ..Default::default()
        };
        let report = run_aggregation_cycle(&store, &samples, &store, &settings, now()).unwrap();

        assert_eq!(report, CycleReport { endpoints: 3, updated: 1, skipped_empty: 0, failed: 1 });
        // The healthy member's samples are not written on their own.
        assert!(store.get_status("aws").unwrap().is_none());
        assert!(store.get_status("vercel").unwrap().is_some());
    }

    #[test]
    fn test_read_retries_are_bounded() {
        let (_tmp, store) = new_store();
        let endpoint = add_endpoint(&store, "aws", None);
        store.append(&reading(&endpoint, 1, true, 10.0)).unwrap();

        // Two failures fit within three attempts.
        let samples = FlakySamples {
            inner: &store,
            endpoint_id: endpoint.id,
            failures_left: AtomicU32::new(2),
        };
        let report =
            run_aggregation_cycle(&store, &samples, &store, &AggregationSettings::default(), now())
                .unwrap();
        assert_eq!(report.updated, 1);

        // Three failures exhaust them.
        let samples = FlakySamples {
            inner: &store,
            endpoint_id: endpoint.id,
            failures_left: AtomicU32::new(3),
        };
        let report =
            run_aggregation_cycle(&store, &samples, &store, &AggregationSettings::default(), now())
                .unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.updated, 0);
    }

    struct UnreachableRegistry;

    impl EndpointRegistry for UnreachableRegistry {
        fn list_active(&self) -> Result<Vec<Endpoint>, DbError> {
            Err(DbError::Poisoned)
        }

        fn get_endpoint(&self, _id: i64) -> Result<Option<Endpoint>, DbError> {
            Err(DbError::Poisoned)
        }
    }

    #[test]
    fn test_registry_failure_aborts_cycle() {
        let (_tmp, store) = new_store();
        store
            .upsert(
                &StatusUpdate {
                    provider: "aws".to_string(),
                    status: Status::Up,
                    average_latency: 1.0,
                    region_breakdown: None,
                },
                now(),
            )
            .unwrap();
        let before = store.list_all().unwrap();

        let result = run_aggregation_cycle(
            &UnreachableRegistry,
            &store,
            &store,
            &AggregationSettings::default(),
            now() + ChronoDuration::minutes(5),
        );
        assert!(matches!(result, Err(DbError::Poisoned)));
        assert_eq!(store.list_all().unwrap(), before);
    }

    #[test]
    fn test_window_start_saturates() {
        assert_eq!(
            window_start(now(), Duration::from_secs(900)),
            now() - ChronoDuration::minutes(15)
        );
        assert_eq!(window_start(now(), Duration::MAX), DateTime::<Utc>::MIN_UTC);
    }

    #[tokio::test]
    async fn test_manager_records_reports() {
        let (_tmp, store) = new_store();
        let endpoint = add_endpoint(&store, "aws", None);
        store.append(&reading(&endpoint, 1, true, 10.0)).unwrap();

        let manager = AggregationManager::new(
            Arc::new(store.clone()),
            AggregationSettings::default(),
            Duration::from_secs(300),
        );
        assert!(manager.last_report("manual").await.is_none());

        let report = manager.run_cycle("manual", now()).await.unwrap();
        assert_eq!(report.updated, 1);
        assert_eq!(manager.last_report("manual").await, Some(report));
        assert!(manager.last_report("scheduled").await.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_cycles_are_serialised() {
        let (_tmp, store) = new_store();
        let endpoint = add_endpoint(&store, "aws", None);
        store.append(&reading(&endpoint, 1, true, 10.0)).unwrap();
        store.append(&reading(&endpoint, 2, false, 30.0)).unwrap();

        let manager = Arc::new(AggregationManager::new(
            Arc::new(store.clone()),
            AggregationSettings::default(),
            Duration::from_secs(300),
        ));

        // A cycle cannot start while another one holds the lock.
        let guard = manager.cycle_lock.lock().await;
        let waiting = tokio::spawn({
            let manager = manager.clone();
            async move { manager.run_cycle("manual", now()).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiting.is_finished());
        assert!(manager.last_report("manual").await.is_none());
        drop(guard);
        let report = waiting.await.unwrap().unwrap();
        assert_eq!(report.updated, 1);

        let (scheduled, manual) = tokio::join!(
            manager.run_cycle("scheduled", now()),
            manager.run_cycle("manual", now()),
        );
        let expected = CycleReport { endpoints: 1, updated: 1, skipped_empty: 0, failed: 0 };
        assert_eq!(scheduled.unwrap(), expected);
        assert_eq!(manual.unwrap(), expected);

        let status = store.get_status("aws").unwrap().unwrap();
        assert_eq!(status.status, Status::Degraded);
        assert_eq!(status.average_latency, 20.0);
        assert_eq!(store.list_all().unwrap().len(), 1);
    }
}
