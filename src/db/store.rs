//! SQLite database store implementation.

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, Type, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row, Statement};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use super::models::*;
use super::traits::*;

mod embedded {
    refinery::embed_migrations!("migrations");
}

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Not found")]
    NotFound,
    #[error("Database lock poisoned")]
    Poisoned,
}

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

const ENDPOINT_COLUMNS: &str = "id, provider, url, region, is_active, created_at, updated_at";
const SAMPLE_COLUMNS: &str = "provider, endpoint_id, region, dns_resolution_ms, server_response_ms, \
     http_status, latency_ms, is_up, timestamp, created_at";
const STATUS_COLUMNS: &str =
    "id, provider, status, average_latency, last_checked, region_breakdown, updated_at";

const INSERT_SAMPLE: &str = "INSERT INTO raw_samples (provider, endpoint_id, region, dns_resolution_ms, \
     server_response_ms, http_status, latency_ms, is_up, timestamp, created_at) \
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)";

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Apply embedded migrations.
    fn init(&self) -> Result<(), DbError> {
        let mut conn = self.conn()?;
        embedded::migrations::runner()
            .run(&mut *conn)
            .map_err(|e| DbError::Migration(e.to_string()))?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }

    // --- Endpoint administration ---

    /// Add a new endpoint and return its ID.
    pub fn add_endpoint(&self, endpoint: &mut Endpoint) -> Result<EndpointId, DbError> {
        endpoint.provider = normalize_provider(&endpoint.provider);

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO endpoints (provider, url, region, is_active, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                endpoint.provider,
                endpoint.url,
                endpoint.region,
                endpoint.active,
                endpoint.created_at.timestamp_millis(),
                endpoint.updated_at.timestamp_millis(),
            ],
        )?;
        let id = conn.last_insert_rowid();
        endpoint.id = id;
        Ok(id)
    }

    /// Update an existing endpoint. `created_at` is left as stored.
    pub fn update_endpoint(&self, endpoint: &Endpoint) -> Result<(), DbError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE endpoints SET provider=?1, url=?2, region=?3, is_active=?4, updated_at=?5 WHERE id=?6",
            params![
                normalize_provider(&endpoint.provider),
                endpoint.url,
                endpoint.region,
                endpoint.active,
                endpoint.updated_at.timestamp_millis(),
                endpoint.id,
            ],
        )?;
        if changed == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    /// Get all endpoints, active or not.
    pub fn list_endpoints(&self) -> Result<Vec<Endpoint>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM endpoints ORDER BY id ASC",
            ENDPOINT_COLUMNS
        ))?;
        let endpoints = stmt
            .query_map([], endpoint_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(endpoints)
    }

    // --- Raw samples ---

    /// Append samples in a single transaction.
    pub fn append_batch(&self, samples: &[RawSample]) -> Result<(), DbError> {
        if samples.is_empty() {
            return Ok(());
        }

        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;

        {
            let mut stmt = tx.prepare(INSERT_SAMPLE)?;
            for s in samples {
                insert_sample(&mut stmt, s)?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Delete raw samples observed before a cutoff. Returns the number removed.
    pub fn delete_samples_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError> {
        let conn = self.conn()?;
        let removed = conn.execute(
            "DELETE FROM raw_samples WHERE timestamp < ?1",
            params![cutoff.timestamp_millis()],
        )?;
        Ok(removed)
    }

    /// Total number of stored raw samples.
    #[cfg(test)]
    pub fn count_samples(&self) -> Result<i64, DbError> {
        let conn = self.conn()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM raw_samples", [], |r| r.get(0))?)
    }
}

impl EndpointRegistry for Store {
    /// Ordered by id so the processing order within a cycle is stable.
    fn list_active(&self) -> Result<Vec<Endpoint>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM endpoints WHERE is_active = 1 ORDER BY id ASC",
            ENDPOINT_COLUMNS
        ))?;
        let endpoints = stmt
            .query_map([], endpoint_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(endpoints)
    }

    fn get_endpoint(&self, id: EndpointId) -> Result<Option<Endpoint>, DbError> {
        let conn = self.conn()?;
        let endpoint = conn
            .query_row(
                &format!("SELECT {} FROM endpoints WHERE id = ?1", ENDPOINT_COLUMNS),
                params![id],
                endpoint_from_row,
            )
            .optional()?;
        Ok(endpoint)
    }
}

impl SampleStore for Store {
    fn append(&self, sample: &RawSample) -> Result<SampleId, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(INSERT_SAMPLE)?;
        insert_sample(&mut stmt, sample)?;
        Ok(conn.last_insert_rowid())
    }

    fn query_window(
        &self,
        endpoint_id: EndpointId,
        since: DateTime<Utc>,
    ) -> Result<Vec<RawSample>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM raw_samples WHERE endpoint_id = ?1 AND timestamp >= ?2 ORDER BY timestamp ASC",
            SAMPLE_COLUMNS
        ))?;
        let samples = stmt
            .query_map(params![endpoint_id, since.timestamp_millis()], |row| {
                Ok(RawSample {
                    provider: row.get(0)?,
                    endpoint_id: row.get(1)?,
                    region: row.get(2)?,
                    dns_resolution_ms: row.get(3)?,
                    server_response_ms: row.get(4)?,
                    http_status: row.get(5)?,
                    latency_ms: row.get(6)?,
                    is_up: row.get(7)?,
                    timestamp: time_at(row, 8)?,
                    created_at: time_at(row, 9)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(samples)
    }
}

impl StatusTable for Store {
    fn upsert(&self, update: &StatusUpdate, now: DateTime<Utc>) -> Result<ProviderStatus, DbError> {
        let breakdown = update
            .region_breakdown
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO provider_status (provider, status, average_latency, last_checked, region_breakdown, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?4) \
             ON CONFLICT(provider) DO UPDATE SET \
             status=excluded.status, average_latency=excluded.average_latency, \
             last_checked=excluded.last_checked, region_breakdown=excluded.region_breakdown, \
             updated_at=excluded.updated_at",
            params![
                update.provider,
                update.status,
                update.average_latency,
                now.timestamp_millis(),
                breakdown,
            ],
        )?;

        let row = conn.query_row(
            &format!("SELECT {} FROM provider_status WHERE provider = ?1", STATUS_COLUMNS),
            params![update.provider],
            status_from_row,
        )?;
        Ok(row)
    }

    fn get_status(&self, provider: &str) -> Result<Option<ProviderStatus>, DbError> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {} FROM provider_status WHERE provider = ?1", STATUS_COLUMNS),
                params![provider],
                status_from_row,
            )
            .optional()?;
        Ok(row)
    }

    fn list_all(&self) -> Result<Vec<ProviderStatus>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM provider_status ORDER BY provider ASC",
            STATUS_COLUMNS
        ))?;
        let rows = stmt
            .query_map([], status_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(rows)
    }
}

impl ToSql for Status {
    fn to_sql(&self) -> SqlResult<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for Status {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: String| FromSqlError::Other(e.into()))
    }
}

/// Provider tags are matched case-insensitively by storing them lower-cased.
pub fn normalize_provider(provider: &str) -> String {
    provider.trim().to_lowercase()
}

fn insert_sample(stmt: &mut Statement<'_>, s: &RawSample) -> SqlResult<usize> {
    stmt.execute(params![
        s.provider,
        s.endpoint_id,
        s.region,
        s.dns_resolution_ms,
        s.server_response_ms,
        s.http_status,
        s.latency_ms,
        s.is_up,
        s.timestamp.timestamp_millis(),
        s.created_at.timestamp_millis(),
    ])
}

fn time_at(row: &Row<'_>, idx: usize) -> SqlResult<DateTime<Utc>> {
    let ms: i64 = row.get(idx)?;
    DateTime::from_timestamp_millis(ms).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, ms))
}

fn endpoint_from_row(row: &Row<'_>) -> SqlResult<Endpoint> {
    Ok(Endpoint {
        id: row.get(0)?,
        provider: row.get(1)?,
        url: row.get(2)?,
        region: row.get(3)?,
        active: row.get(4)?,
        created_at: time_at(row, 5)?,
        updated_at: time_at(row, 6)?,
    })
}

fn status_from_row(row: &Row<'_>) -> SqlResult<ProviderStatus> {
    let breakdown: Option<String> = row.get(5)?;
    let region_breakdown = breakdown
        .map(|json| serde_json::from_str::<RegionBreakdown>(&json))
        .transpose()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e)))?;

    Ok(ProviderStatus {
        id: row.get(0)?,
        provider: row.get(1)?,
        status: row.get(2)?,
        average_latency: row.get(3)?,
        last_checked: time_at(row, 4)?,
        region_breakdown,
        updated_at: time_at(row, 6)?,
    })
}
