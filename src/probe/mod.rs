//! Built-in beacon probe.
//!
//! Lets a single deployment produce its own readings when no external probe
//! agents are attached.

mod http;

pub use http::*;

use crate::db::{Endpoint, RawSample};

use chrono::Utc;
use std::time::Duration;
use thiserror::Error;

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Responses in the 2xx and 3xx range count as up.
pub fn is_up_status(status: u16) -> bool {
    (200..400).contains(&status)
}

/// Probe one endpoint and turn the outcome into a sample.
///
/// Failures are readings too: they produce a down sample with HTTP status 0.
pub async fn probe_endpoint(
    client: &reqwest::Client,
    endpoint: &Endpoint,
    timeout: Duration,
) -> RawSample {
    // Add jitter to avoid thundering herd
    let jitter = rand::random::<u64>() % 100;
    tokio::time::sleep(Duration::from_millis(jitter)).await;

    let started = Utc::now();
    let result = run_http_probe(client, &endpoint.url, timeout).await;

    let (http_status, latency_ms, is_up) = match result {
        Ok(obs) => (obs.status, obs.latency_ms, is_up_status(obs.status)),
        Err(ProbeError::Timeout(t)) => (0, t.as_secs_f64() * 1000.0, false),
        Err(e) => {
            tracing::debug!("Probe failed for {}: {}", endpoint.url, e);
            let elapsed = (Utc::now() - started).num_milliseconds().max(0) as f64;
            (0, elapsed, false)
        }
    };

    RawSample {
        provider: endpoint.provider.clone(),
        endpoint_id: endpoint.id,
        region: endpoint.region.clone(),
        dns_resolution_ms: None,
        server_response_ms: None,
        http_status,
        latency_ms,
        is_up,
        timestamp: started,
        created_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode, routing::get, Router};

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[test]
    fn test_is_up_status() {
        assert!(is_up_status(200));
        assert!(is_up_status(204));
        assert!(is_up_status(301));
        assert!(!is_up_status(404));
        assert!(!is_up_status(503));
        assert!(!is_up_status(0));
    }

    #[tokio::test]
    async fn test_probe_endpoint_records_status() {
        let base = serve(
            Router::new()
                .route("/ok", get(|| async { "ok" }))
                .route("/fail", get(|| async { StatusCode::SERVICE_UNAVAILABLE })),
        )
        .await;
        let client = reqwest::Client::new();

        let up = Endpoint {
            id: 7,
            provider: "vercel".to_string(),
            url: format!("{}/ok", base),
            region: Some("local".to_string()),
            ..Default::default()
        };
        let sample = probe_endpoint(&client, &up, Duration::from_secs(5)).await;
        assert!(sample.is_up);
        assert_eq!(sample.http_status, 200);
        assert_eq!(sample.endpoint_id, 7);
        assert_eq!(sample.provider, "vercel");
        assert_eq!(sample.region.as_deref(), Some("local"));
        assert!(sample.latency_ms >= 0.0);

        let down = Endpoint {
            url: format!("{}/fail", base),
            ..up
        };
        let sample = probe_endpoint(&client, &down, Duration::from_secs(5)).await;
        assert!(!sample.is_up);
        assert_eq!(sample.http_status, 503);
    }

    #[tokio::test]
    async fn test_probe_endpoint_unreachable() {
        let client = reqwest::Client::new();
        let endpoint = Endpoint {
            url: "http://256.256.256.256".to_string(),
            ..Default::default()
        };
        let sample = probe_endpoint(&client, &endpoint, Duration::from_millis(100)).await;
        assert!(!sample.is_up);
        assert_eq!(sample.http_status, 0);
    }
}
