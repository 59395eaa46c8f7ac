//! Ingestion boundary for beacon readings pushed by external probe agents.

use crate::db::{normalize_provider, DbError, EndpointId, EndpointRegistry, RawSample, SampleStore};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Header carrying the shared secret.
pub const API_KEY_HEADER: &str = "x-beacon-api-key";

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("no API key configured on the server")]
    NotConfigured,
    #[error("missing or invalid API key")]
    Unauthorized,
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error(transparent)]
    Store(#[from] DbError),
}

/// One reading as sent by a probe agent. Timestamps are Unix milliseconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BeaconReading {
    #[serde(default)]
    pub provider: Option<String>,
    pub endpoint_id: EndpointId,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub dns_resolution_time: Option<f64>,
    #[serde(default)]
    pub server_response_time: Option<f64>,
    pub http_status: u16,
    pub latency: f64,
    pub is_up: bool,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub accepted: usize,
    pub skipped: usize,
}

/// Check the caller's secret against the configured one in constant time.
pub fn authorize(expected: Option<&str>, provided: Option<&str>) -> Result<(), IngestError> {
    let expected = expected.ok_or(IngestError::NotConfigured)?;
    match provided {
        Some(key) if constant_time_eq(expected, key) => Ok(()),
        _ => Err(IngestError::Unauthorized),
    }
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }

    result == 0
}

/// Store every reading of a batch whose endpoint exists.
///
/// Readings that fail to parse or reference an unknown endpoint are skipped
/// individually. Only a payload that is not an array rejects the batch.
pub fn ingest_batch<R, S>(
    registry: &R,
    samples: &S,
    payload: Value,
    now: DateTime<Utc>,
) -> Result<IngestReport, IngestError>
where
    R: EndpointRegistry + ?Sized,
    S: SampleStore + ?Sized,
{
    let Value::Array(items) = payload else {
        return Err(IngestError::InvalidPayload(
            "expected an array of readings".to_string(),
        ));
    };

    let mut report = IngestReport::default();

    for (index, item) in items.into_iter().enumerate() {
        let reading: BeaconReading = match serde_json::from_value(item) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("Ingest: skipping malformed reading #{}: {}", index, e);
                report.skipped += 1;
                continue;
            }
        };

        let endpoint = match registry.get_endpoint(reading.endpoint_id)? {
            Some(endpoint) => endpoint,
            None => {
                tracing::warn!(
                    "Ingest: endpoint {} not found, skipping reading #{}",
                    reading.endpoint_id,
                    index
                );
                report.skipped += 1;
                continue;
            }
        };

        let provider = reading
            .provider
            .as_deref()
            .map(normalize_provider)
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| endpoint.provider.clone());
        if provider != endpoint.provider {
            tracing::debug!(
                "Ingest: reading for endpoint {} names provider {}, endpoint is {}",
                endpoint.id,
                provider,
                endpoint.provider
            );
        }

        let sample = RawSample {
            provider,
            endpoint_id: endpoint.id,
            region: reading.region,
            dns_resolution_ms: reading.dns_resolution_time,
            server_response_ms: reading.server_response_time,
            http_status: reading.http_status,
            latency_ms: reading.latency,
            is_up: reading.is_up,
            timestamp: reading.timestamp.unwrap_or(now),
            created_at: now,
        };
        samples.append(&sample)?;
        report.accepted += 1;
    }

    tracing::debug!(
        "Ingest: accepted {} readings, skipped {}",
        report.accepted,
        report.skipped
    );
    Ok(report)
}
