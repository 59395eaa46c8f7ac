//! Configuration module for the Beacon Network service.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Default aggregation window (15 minutes).
pub const DEFAULT_WINDOW_MS: u64 = 900_000;

/// How status rows are derived when several active endpoints share a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergeMode {
    /// Each endpoint overwrites the provider row in turn; the last one processed wins.
    #[default]
    LastWriteWins,
    /// All endpoints of a provider are pooled into one sample set before classification.
    Pooled,
}

impl FromStr for MergeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "last-write-wins" | "lww" => Ok(MergeMode::LastWriteWins),
            "pooled" => Ok(MergeMode::Pooled),
            other => Err(format!("unknown merge mode: {}", other)),
        }
    }
}

impl fmt::Display for MergeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergeMode::LastWriteWins => f.write_str("last-write-wins"),
            MergeMode::Pooled => f.write_str("pooled"),
        }
    }
}

/// Parameters of one aggregation cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregationSettings {
    /// Trailing span of samples considered per cycle.
    pub window: Duration,
    /// Attempts per endpoint window read before the endpoint is skipped.
    pub read_attempts: u32,
    pub merge: MergeMode,
}

impl Default for AggregationSettings {
    fn default() -> Self {
        Self {
            window: Duration::from_millis(DEFAULT_WINDOW_MS),
            read_attempts: 3,
            merge: MergeMode::LastWriteWins,
        }
    }
}

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the web server (default: 8080)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "beacon.db")
    pub db_path: String,
    /// Shared secret expected in `X-Beacon-API-Key`. Requests are refused while unset.
    pub api_key: Option<String>,
    pub aggregation: AggregationSettings,
    /// Period of the scheduled aggregation trigger (default: 5 minutes)
    pub aggregation_interval: Duration,
    /// Raw samples older than this are pruned (default: 1 day)
    pub raw_retention: Duration,
    pub retention_interval: Duration,
    /// Period of the built-in probe agent; `None` disables it.
    pub probe_interval: Option<Duration>,
    pub probe_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            db_path: "beacon.db".to_string(),
            api_key: None,
            aggregation: AggregationSettings::default(),
            aggregation_interval: Duration::from_secs(300),
            raw_retention: Duration::from_secs(86_400),
            retention_interval: Duration::from_secs(60),
            probe_interval: None,
            probe_timeout: Duration::from_secs(10),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `BEACON_HTTP_PORT`: HTTP port (default: 8080)
    /// - `BEACON_DB_PATH`: Database file path (default: "beacon.db")
    /// - `BEACON_API_KEY`: shared secret for ingestion and administration
    /// - `BEACON_AGGREGATION_INTERVAL_SECS`: aggregation period (default: 300)
    /// - `BEACON_WINDOW_MS`: aggregation window (default: 900000)
    /// - `BEACON_SAMPLE_READ_ATTEMPTS`: attempts per window read (default: 3)
    /// - `BEACON_PROVIDER_MERGE`: `last-write-wins` or `pooled`
    /// - `BEACON_RAW_RETENTION_SECS`: raw sample retention (default: 86400)
    /// - `BEACON_RETENTION_INTERVAL_SECS`: pruning period (default: 60)
    /// - `BEACON_PROBE_INTERVAL_SECS`: built-in probe period, 0 disables (default: 0)
    /// - `BEACON_PROBE_TIMEOUT_SECS`: built-in probe timeout (default: 10)
    pub fn load() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        let parse = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());

        if let Some(port) = lookup("BEACON_HTTP_PORT").and_then(|v| v.trim().parse().ok()) {
            cfg.http_port = port;
        }

        if let Some(db_path) = lookup("BEACON_DB_PATH") {
            cfg.db_path = db_path;
        }

        cfg.api_key = lookup("BEACON_API_KEY").filter(|k| !k.is_empty());

        if let Some(secs) = parse("BEACON_AGGREGATION_INTERVAL_SECS").filter(|s| *s > 0) {
            cfg.aggregation_interval = Duration::from_secs(secs);
        }

        if let Some(ms) = parse("BEACON_WINDOW_MS").filter(|ms| *ms > 0) {
            cfg.aggregation.window = Duration::from_millis(ms);
        }

        if let Some(attempts) = parse("BEACON_SAMPLE_READ_ATTEMPTS").filter(|a| *a > 0) {
            cfg.aggregation.read_attempts = attempts.min(u32::MAX as u64) as u32;
        }

        if let Some(mode) = lookup("BEACON_PROVIDER_MERGE") {
            match mode.parse() {
                Ok(mode) => cfg.aggregation.merge = mode,
                Err(e) => tracing::warn!("Ignoring BEACON_PROVIDER_MERGE: {}", e),
            }
        }

        if let Some(secs) = parse("BEACON_RAW_RETENTION_SECS") {
            cfg.raw_retention = Duration::from_secs(secs);
        }
        if cfg.raw_retention < cfg.aggregation.window {
            tracing::warn!(
                "Raw retention {:?} is shorter than the aggregation window, using {:?}",
                cfg.raw_retention,
                cfg.aggregation.window
            );
            cfg.raw_retention = cfg.aggregation.window;
        }

        if let Some(secs) = parse("BEACON_RETENTION_INTERVAL_SECS").filter(|s| *s > 0) {
            cfg.retention_interval = Duration::from_secs(secs);
        }

        cfg.probe_interval = parse("BEACON_PROBE_INTERVAL_SECS")
            .filter(|s| *s > 0)
            .map(Duration::from_secs);

        if let Some(secs) = parse("BEACON_PROBE_TIMEOUT_SECS").filter(|s| *s > 0) {
            cfg.probe_timeout = Duration::from_secs(secs);
        }

        cfg
    }
}
