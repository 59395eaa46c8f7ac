//! HTTP request handlers.

use super::{ApiError, AppState};
use crate::correlation::{correlate, CorrelationResult};
use crate::db::{Endpoint, EndpointId, EndpointRegistry, StatusSummary, StatusTable};
use crate::ingest::{authorize, ingest_batch, IngestReport, API_KEY_HEADER};
use crate::scheduler::CycleReport;

use axum::{
    body::Bytes,
    extract::{FromRequestParts, Path, State},
    http::{request::Parts, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Json},
};
use chrono::Utc;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

// ============================================================================
// Templates (using simple string replacement)
// ============================================================================

const STATUS_TEMPLATE: &str = include_str!("templates/status.html");
const LAYOUT_TEMPLATE: &str = include_str!("templates/layout.html");

/// Header carrying the caller identity resolved by the fronting gateway.
pub const CALLER_ID_HEADER: &str = "x-caller-id";

// ============================================================================
// Caller identity and shared secret
// ============================================================================

/// Pre-resolved identity of whoever is asking. Authentication happens
/// upstream; this service only requires that an identity was attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub id: String,
}

impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(CALLER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(|id| Caller { id: id.to_string() })
            .ok_or_else(|| ApiError::Unauthorized("Unauthorized".to_string()))
    }
}

fn require_api_key(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let provided = headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok());
    authorize(state.config.api_key.as_deref(), provided)?;
    Ok(())
}

/// Decode a JSON request body so failures carry the API's error shape.
fn parse_json<T: DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(format!("Invalid JSON: {}", e)))
}

// ============================================================================
// Status board
// ============================================================================

pub async fn handle_dashboard(State(state): State<AppState>) -> Result<Html<String>, ApiError> {
    let statuses = state.store.list_all()?;

    let rows = if statuses.is_empty() {
        r#"<tr><td colspan="4" class="empty">No provider data yet</td></tr>"#.to_string()
    } else {
        statuses
            .iter()
            .map(|s| {
                format!(
                    r#"<tr><td>{}</td><td class="status-{}">{}</td><td>{:.1} ms</td><td>{}</td></tr>"#,
                    escape_html(&s.provider),
                    s.status.as_str().to_lowercase(),
                    s.status,
                    s.average_latency,
                    s.last_checked.format("%Y-%m-%d %H:%M:%S UTC"),
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    };

    let content = STATUS_TEMPLATE.replace("{{rows}}", &rows);

    let page = LAYOUT_TEMPLATE
        .replace("{{title}}", "Beacon Network Status")
        .replace("{{content}}", &content);

    Ok(Html(page))
}

pub async fn handle_list_status(
    State(state): State<AppState>,
) -> Result<Json<Vec<StatusSummary>>, ApiError> {
    let statuses = state.store.list_all()?;
    Ok(Json(statuses.iter().map(StatusSummary::from).collect()))
}

pub async fn handle_get_status(
    State(state): State<AppState>,
    Path(provider): Path<String>,
) -> Result<Json<StatusSummary>, ApiError> {
    let provider = crate::db::normalize_provider(&provider);
    match state.store.get_status(&provider)? {
        Some(status) => Ok(Json(StatusSummary::from(&status))),
        None => Err(ApiError::NotFound(format!("No status for provider {}", provider))),
    }
}

// ============================================================================
// API: Beacon ingestion
// ============================================================================

pub async fn handle_ingest(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<IngestReport>, ApiError> {
    // Authenticate before looking at the payload at all.
    require_api_key(&state, &headers)?;

    let payload: serde_json::Value = parse_json(&body)?;

    let store = state.store.as_ref();
    let report = ingest_batch(store, store, payload, Utc::now())?;

    tracing::info!(
        "Ingested beacon batch: {} accepted, {} skipped",
        report.accepted,
        report.skipped
    );

    Ok(Json(report))
}

// ============================================================================
// API: Correlation
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CorrelateRequest {
    pub provider: String,
    #[serde(default)]
    pub error_message: String,
    #[serde(default)]
    pub resource_url: Option<String>,
}

pub async fn handle_correlate(
    State(state): State<AppState>,
    caller: Caller,
    body: Bytes,
) -> Result<Json<CorrelationResult>, ApiError> {
    let req: CorrelateRequest = parse_json(&body)?;
    if req.provider.trim().is_empty() {
        return Err(ApiError::BadRequest("provider is required".to_string()));
    }

    tracing::debug!("Correlation requested by {} for {}", caller.id, req.provider);

    let result = correlate(
        state.store.as_ref(),
        &req.provider,
        &req.error_message,
        req.resource_url.as_deref(),
    )?;

    Ok(Json(result))
}

// ============================================================================
// API: Endpoints
// ============================================================================

pub async fn handle_list_endpoints(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Endpoint>>, ApiError> {
    require_api_key(&state, &headers)?;
    Ok(Json(state.store.list_endpoints()?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateEndpointRequest {
    pub provider: String,
    pub url: String,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

/// Partial update; absent fields keep their stored value.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateEndpointRequest {
    pub provider: Option<String>,
    pub url: Option<String>,
    pub region: Option<String>,
    pub is_active: Option<bool>,
}

fn validate_endpoint(endpoint: &Endpoint) -> Result<(), ApiError> {
    if endpoint.provider.trim().is_empty() {
        return Err(ApiError::BadRequest("provider is required".to_string()));
    }
    if endpoint.url.trim().is_empty() {
        return Err(ApiError::BadRequest("url is required".to_string()));
    }
    if let Err(e) = reqwest::Url::parse(&endpoint.url) {
        return Err(ApiError::BadRequest(format!("Invalid url: {}", e)));
    }
    Ok(())
}

pub async fn handle_create_endpoint(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    require_api_key(&state, &headers)?;
    let req: CreateEndpointRequest = parse_json(&body)?;

    let now = Utc::now();
    let mut endpoint = Endpoint {
        id: 0,
        provider: req.provider,
        url: req.url.trim().to_string(),
        region: req.region.filter(|r| !r.trim().is_empty()),
        active: req.is_active,
        created_at: now,
        updated_at: now,
    };
    validate_endpoint(&endpoint)?;

    state.store.add_endpoint(&mut endpoint)?;
    tracing::info!("Added endpoint {} ({}) for {}", endpoint.id, endpoint.url, endpoint.provider);

    Ok((StatusCode::CREATED, Json(endpoint)))
}

pub async fn handle_update_endpoint(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<EndpointId>,
    body: Bytes,
) -> Result<Json<Endpoint>, ApiError> {
    require_api_key(&state, &headers)?;
    let req: UpdateEndpointRequest = parse_json(&body)?;

    let mut endpoint = state
        .store
        .get_endpoint(id)?
        .ok_or_else(|| ApiError::NotFound(format!("Endpoint {} not found", id)))?;

    if let Some(provider) = req.provider {
        endpoint.provider = crate::db::normalize_provider(&provider);
    }
    if let Some(url) = req.url {
        endpoint.url = url.trim().to_string();
    }
    if let Some(region) = req.region {
        endpoint.region = Some(region).filter(|r| !r.trim().is_empty());
    }
    if let Some(active) = req.is_active {
        endpoint.active = active;
    }
    endpoint.updated_at = Utc::now();
    validate_endpoint(&endpoint)?;

    state.store.update_endpoint(&endpoint)?;
    tracing::info!("Updated endpoint {} (active: {})", endpoint.id, endpoint.active);

    Ok(Json(endpoint))
}

// ============================================================================
// API: Aggregation
// ============================================================================

pub async fn handle_trigger_aggregation(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<CycleReport>, ApiError> {
    require_api_key(&state, &headers)?;

    let report = state
        .scheduler
        .aggregation()
        .run_cycle("manual", Utc::now())
        .await?;

    Ok(Json(report))
}

#[derive(Debug, Serialize)]
pub struct LastCycles {
    pub scheduled: Option<CycleReport>,
    pub manual: Option<CycleReport>,
}

pub async fn handle_last_cycles(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<LastCycles>, ApiError> {
    require_api_key(&state, &headers)?;

    let aggregation = state.scheduler.aggregation();
    Ok(Json(LastCycles {
        scheduled: aggregation.last_report("scheduled").await,
        manual: aggregation.last_report("manual").await,
    }))
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}
