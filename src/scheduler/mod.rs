//! Scheduler module for aggregating beacon data and running the built-in probe.

mod aggregation;
mod retention;

pub use aggregation::*;
pub use retention::*;

use crate::config::ServerConfig;
use crate::db::{EndpointRegistry, RawSample, Store};
use crate::probe::probe_endpoint;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Semaphore};

/// Maximum probes in flight at once.
const PROBE_CONCURRENCY: usize = 5;

/// Owns the periodic background tasks.
pub struct Scheduler {
    store: Arc<Store>,
    aggregation: Arc<AggregationManager>,
    retention: RetentionManager,
    probe: Option<ProbeSettings>,
    stop_tx: broadcast::Sender<()>,
}

#[derive(Debug, Clone, Copy)]
struct ProbeSettings {
    interval: Duration,
    timeout: Duration,
}

impl Scheduler {
    /// Create a new scheduler. Nothing runs until [`Scheduler::start`].
    pub fn new(store: Arc<Store>, cfg: &ServerConfig) -> Self {
        let aggregation = Arc::new(AggregationManager::new(
            store.clone(),
            cfg.aggregation,
            cfg.aggregation_interval,
        ));
        let retention = RetentionManager::new(store.clone(), cfg.raw_retention, cfg.retention_interval);
        let probe = cfg.probe_interval.map(|interval| ProbeSettings {
            interval,
            timeout: cfg.probe_timeout,
        });
        let (stop_tx, _) = broadcast::channel(1);

        Self {
            store,
            aggregation,
            retention,
            probe,
            stop_tx,
        }
    }

    /// Start aggregation, retention and, when enabled, the probe agent.
    pub async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let endpoints = self.store.list_active()?;

        tracing::info!("Starting scheduler with {} active endpoints", endpoints.len());

        self.aggregation.start(self.stop_tx.subscribe());
        self.retention.start(self.stop_tx.subscribe());

        if let Some(probe) = self.probe {
            tracing::info!(
                "Starting built-in probe every {:?} (timeout {:?})",
                probe.interval,
                probe.timeout
            );
            let (tx, rx) = mpsc::channel(1000);
            tokio::spawn(run_batch_writer(rx, self.store.clone()));
            tokio::spawn(run_probe_loop(
                self.store.clone(),
                probe,
                tx,
                self.stop_tx.subscribe(),
            ));
        }

        Ok(())
    }

    /// Signal every background task to stop after its current iteration.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(());
    }

    pub fn aggregation(&self) -> &Arc<AggregationManager> {
        &self.aggregation
    }
}

/// Probe every active endpoint once per tick.
async fn run_probe_loop(
    store: Arc<Store>,
    settings: ProbeSettings,
    tx: mpsc::Sender<RawSample>,
    mut stop_rx: broadcast::Receiver<()>,
) {
    let client = match reqwest::Client::builder().build() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Probe agent disabled, cannot build HTTP client: {}", e);
            return;
        }
    };

    let semaphore = Arc::new(Semaphore::new(PROBE_CONCURRENCY));

    let mut interval = tokio::time::interval(settings.interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = stop_rx.recv() => {
                break;
            }
            _ = interval.tick() => {
                // Re-read each tick so deactivated endpoints drop out immediately.
                let endpoints = match store.list_active() {
                    Ok(e) => e,
                    Err(e) => {
                        tracing::error!("Probe agent: Failed to list endpoints: {}", e);
                        continue;
                    }
                };

                for endpoint in endpoints {
                    let permit = match semaphore.clone().try_acquire_owned() {
                        Ok(p) => p,
                        Err(_) => {
                            tracing::warn!("Skipping probe for {} due to overlap limit", endpoint.url);
                            continue;
                        }
                    };

                    let client = client.clone();
                    let tx = tx.clone();
                    let timeout = settings.timeout;

                    tokio::spawn(async move {
                        let _permit = permit; // Hold permit until done

                        let sample = probe_endpoint(&client, &endpoint, timeout).await;
                        if tx.send(sample).await.is_err() {
                            tracing::error!("Failed to send sample for {}", endpoint.url);
                        }
                    });
                }
            }
        }
    }
}

/// Run the batch writer that accumulates and flushes probe samples.
async fn run_batch_writer(mut rx: mpsc::Receiver<RawSample>, store: Arc<Store>) {
    let mut buffer: Vec<RawSample> = Vec::with_capacity(100);
    let mut interval = tokio::time::interval(Duration::from_secs(2));

    loop {
        tokio::select! {
            sample = rx.recv() => {
                match sample {
                    Some(s) => {
                        buffer.push(s);
                        if buffer.len() >= 500 {
                            flush_buffer(&store, &mut buffer);
                        }
                    }
                    None => {
                        // Channel closed, flush remaining and exit
                        flush_buffer(&store, &mut buffer);
                        break;
                    }
                }
            }
            _ = interval.tick() => {
                flush_buffer(&store, &mut buffer);
            }
        }
    }
}

fn flush_buffer(store: &Store, buffer: &mut Vec<RawSample>) {
    if buffer.is_empty() {
        return;
    }

    if let Err(e) = store.append_batch(buffer) {
        tracing::error!("Failed to flush {} probe samples: {}", buffer.len(), e);
    }

    buffer.clear();
}
