//! Storage contracts consumed by the aggregation engine and the ingestion boundary.

use chrono::{DateTime, Utc};

use super::models::*;
use super::DbError;

/// Read-only view of the configured probe targets.
pub trait EndpointRegistry {
    /// All endpoints whose active flag is set.
    fn list_active(&self) -> Result<Vec<Endpoint>, DbError>;

    fn get_endpoint(&self, id: EndpointId) -> Result<Option<Endpoint>, DbError>;
}

/// Append-only store of raw health-check samples.
pub trait SampleStore {
    /// Append a sample. Does not verify that the endpoint exists.
    fn append(&self, sample: &RawSample) -> Result<SampleId, DbError>;

    /// Samples for `endpoint_id` observed at or after `since`. No upper bound.
    fn query_window(
        &self,
        endpoint_id: EndpointId,
        since: DateTime<Utc>,
    ) -> Result<Vec<RawSample>, DbError>;
}

/// One status row per provider.
pub trait StatusTable {
    /// Create or overwrite the provider's row in place. `now` becomes both
    /// `last_checked` and `updated_at`.
    fn upsert(&self, update: &StatusUpdate, now: DateTime<Utc>) -> Result<ProviderStatus, DbError>;

    fn get_status(&self, provider: &str) -> Result<Option<ProviderStatus>, DbError>;

    fn list_all(&self) -> Result<Vec<ProviderStatus>, DbError>;
}
