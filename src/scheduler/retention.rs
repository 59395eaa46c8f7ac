//! Retention manager for pruning raw samples past the retention period.

use crate::db::{DbError, Store};

use super::window_start;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Manager for deleting raw samples older than the retention period.
pub struct RetentionManager {
    store: Arc<Store>,
    retention: Duration,
    interval: Duration,
}

impl RetentionManager {
    pub fn new(store: Arc<Store>, retention: Duration, interval: Duration) -> Self {
        Self {
            store,
            retention,
            interval,
        }
    }

    /// Start the retention manager background task.
    pub fn start(&self, mut stop_rx: broadcast::Receiver<()>) {
        let store = self.store.clone();
        let retention = self.retention;
        let period = self.interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);

            loop {
                tokio::select! {
                    _ = stop_rx.recv() => break,
                    _ = interval.tick() => {
                        if let Err(e) = process_retention(&store, retention, Utc::now()) {
                            tracing::error!("RetentionManager: Failed to prune raw samples: {}", e);
                        }
                    }
                }
            }
        });
    }
}

/// Delete raw samples observed more than `retention` before `now`.
pub fn process_retention(
    store: &Store,
    retention: Duration,
    now: DateTime<Utc>,
) -> Result<usize, DbError> {
    let cutoff = window_start(now, retention);
    let removed = store.delete_samples_before(cutoff)?;
    if removed > 0 {
        tracing::debug!("RetentionManager: Pruned {} raw samples before {}", removed, cutoff);
    }
    Ok(removed)
}
