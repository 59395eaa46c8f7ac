//! HTTP probe implementation.

use std::time::{Duration, Instant};
use super::ProbeError;

/// What one HTTP probe observed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HttpObservation {
    pub status: u16,
    /// Time to the complete response body, in milliseconds.
    pub latency_ms: f64,
}

/// Run an HTTP GET probe against the given URL.
pub async fn run_http_probe(
    client: &reqwest::Client,
    url: &str,
    timeout: Duration,
) -> Result<HttpObservation, ProbeError> {
    let url = if url.starts_with("http://") || url.starts_with("https://") {
        url.to_string()
    } else {
        format!("https://{}", url)
    };

    let request = client
        .get(&url)
        .timeout(timeout)
        .build()
        .map_err(|e| ProbeError::Config(e.to_string()))?;

    let start = Instant::now();

    let response = client.execute(request).await.map_err(|e| {
        if e.is_timeout() {
            ProbeError::Timeout(timeout)
        } else {
            ProbeError::Network(e.to_string())
        }
    })?;
    let status = response.status().as_u16();

    // Read the full body to measure complete transfer time
    let _body = response.bytes().await.map_err(|e| {
        if e.is_timeout() {
            ProbeError::Timeout(timeout)
        } else {
            ProbeError::Network(e.to_string())
        }
    })?;

    Ok(HttpObservation {
        status,
        latency_ms: start.elapsed().as_secs_f64() * 1000.0,
    })
}
