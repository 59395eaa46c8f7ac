//! Classifies user-reported errors against the Beacon Network status table.

use crate::db::{normalize_provider, DbError, Status, StatusTable};

use serde::{Deserialize, Serialize};

pub const UNKNOWN_STATUS: &str = "UNKNOWN";

const USER_SPECIFIC_MESSAGE: &str = "Your app issue";
const GLOBAL_OUTAGE_MESSAGE: &str =
    "GLOBAL OUTAGE DETECTED - Our Beacon Network confirms this is a provider-wide issue";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Standard,
    Elevated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Correlation {
    UserSpecific,
    GlobalOutage,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CorrelationResult {
    pub alert_level: AlertLevel,
    pub correlation: Correlation,
    /// `UP`, `DEGRADED`, `DOWN`, or `UNKNOWN` when the provider has no row.
    pub provider_status: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub beacon_confirmation: Option<bool>,
}

/// Decide whether an error reported for `provider` is explained by a
/// provider-wide outage. A missing status row counts as no evidence of one.
pub fn correlate<T>(
    statuses: &T,
    provider: &str,
    error_message: &str,
    resource_url: Option<&str>,
) -> Result<CorrelationResult, DbError>
where
    T: StatusTable + ?Sized,
{
    let current = statuses.get_status(&normalize_provider(provider))?;
    let status = current.as_ref().map(|row| row.status);

    let result = match status {
        None | Some(Status::Up) => CorrelationResult {
            alert_level: AlertLevel::Standard,
            correlation: Correlation::UserSpecific,
            provider_status: status.map_or(UNKNOWN_STATUS, |s| s.as_str()).to_string(),
            message: USER_SPECIFIC_MESSAGE.to_string(),
            beacon_confirmation: None,
        },
        Some(s @ (Status::Degraded | Status::Down)) => CorrelationResult {
            alert_level: AlertLevel::Elevated,
            correlation: Correlation::GlobalOutage,
            provider_status: s.as_str().to_string(),
            message: GLOBAL_OUTAGE_MESSAGE.to_string(),
            beacon_confirmation: Some(true),
        },
    };

    tracing::debug!(
        provider,
        resource_url = resource_url.unwrap_or("-"),
        correlation = ?result.correlation,
        "Correlated reported error: {}",
        error_message
    );

    Ok(result)
}
