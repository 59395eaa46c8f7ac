//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub type EndpointId = i64;
pub type SampleId = i64;

/// Lower inclusive bound (percent of up samples) for [`Status::Up`].
pub const UP_THRESHOLD: f64 = 95.0;
/// Lower inclusive bound (percent of up samples) for [`Status::Degraded`].
pub const DEGRADED_THRESHOLD: f64 = 50.0;

/// A monitored probe target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    pub id: EndpointId,
    pub provider: String,
    pub url: String,
    pub region: Option<String>,
    #[serde(rename = "isActive")]
    pub active: bool,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
}

impl Default for Endpoint {
    fn default() -> Self {
        Self {
            id: 0,
            provider: String::new(),
            url: String::new(),
            region: None,
            active: true,
            created_at: DateTime::<Utc>::UNIX_EPOCH,
            updated_at: DateTime::<Utc>::UNIX_EPOCH,
        }
    }
}

/// A single health-check observation. Never updated once written.
#[derive(Debug, Clone, PartialEq)]
pub struct RawSample {
    pub provider: String,
    pub endpoint_id: EndpointId,
    pub region: Option<String>,
    pub dns_resolution_ms: Option<f64>,
    pub server_response_ms: Option<f64>,
    pub http_status: u16,
    pub latency_ms: f64,
    pub is_up: bool,
    /// When the probe observed the endpoint.
    pub timestamp: DateTime<Utc>,
    /// When the reading reached this service.
    pub created_at: DateTime<Utc>,
}

/// Aggregated health of a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Up,
    Degraded,
    Down,
}

impl Status {
    /// Classify an up-percentage. Thresholds are inclusive lower bounds,
    /// checked from healthiest down.
    pub fn from_up_percentage(up_percentage: f64) -> Self {
        if up_percentage >= UP_THRESHOLD {
            Status::Up
        } else if up_percentage >= DEGRADED_THRESHOLD {
            Status::Degraded
        } else {
            Status::Down
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Up => "UP",
            Status::Degraded => "DEGRADED",
            Status::Down => "DOWN",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UP" => Ok(Status::Up),
            "DEGRADED" => Ok(Status::Degraded),
            "DOWN" => Ok(Status::Down),
            other => Err(format!("unknown status: {}", other)),
        }
    }
}

/// Advisory per-region sub-status.
pub type RegionBreakdown = BTreeMap<String, Status>;

/// Current best-known status for one provider. One row per provider.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderStatus {
    pub id: i64,
    pub provider: String,
    pub status: Status,
    pub average_latency: f64,
    pub last_checked: DateTime<Utc>,
    pub region_breakdown: Option<RegionBreakdown>,
    pub updated_at: DateTime<Utc>,
}

/// The computed fields written by one upsert.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub provider: String,
    pub status: Status,
    pub average_latency: f64,
    pub region_breakdown: Option<RegionBreakdown>,
}

/// Public view of a provider status. Never carries raw samples.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSummary {
    pub provider: String,
    pub status: Status,
    pub average_latency: f64,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_checked: DateTime<Utc>,
}

impl From<&ProviderStatus> for StatusSummary {
    fn from(s: &ProviderStatus) -> Self {
        Self {
            provider: s.provider.clone(),
            status: s.status,
            average_latency: s.average_latency,
            last_checked: s.last_checked,
        }
    }
}
