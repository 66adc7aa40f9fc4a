//! Record persistence, raw page archiving, and HTTP fetch utilities for HLT.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hlt_core::{Listing, PricePoint, Record, UpsertOutcome};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::info_span;
use uuid::Uuid;

pub const CRATE_NAME: &str = "hlt-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record store unavailable: {0}")]
    Unavailable(String),
    #[error("record store holds corrupt data: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Persisted collection of reconciled records, keyed by identity key.
///
/// `upsert` and `mark_outdated` are the only write paths; each call applies
/// as one indivisible operation, so no reader ever observes a partially
/// merged record.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Atomic conditional merge of one observed listing.
    ///
    /// Creates the record on first observation (`added_at` set once), appends
    /// to the price log only when the price differs from the latest stored
    /// entry, refreshes all current attributes, and unconditionally clears
    /// `expired_at` so a reappearing record is revived.
    async fn upsert(
        &self,
        key: i64,
        listing: &Listing,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StoreError>;

    /// Stamps `expired_at` on every live record whose key is absent from
    /// `observed`, all-or-nothing per invocation, and returns the pre-update
    /// snapshots. Already-expired records are never re-stamped.
    ///
    /// An empty `observed` set expires every live record; the cycle runner
    /// guards against that case, never this method.
    async fn mark_outdated(
        &self,
        observed: &HashSet<i64>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Record>, StoreError>;

    async fn get(&self, key: i64) -> Result<Option<Record>, StoreError>;
}

fn merge_listing(record: &mut Record, listing: &Listing, now: DateTime<Utc>) -> UpsertOutcome {
    let changed = record
        .last_price()
        .map(|price| price != listing.price)
        .unwrap_or(true);
    if changed {
        record.price_history.push(PricePoint {
            price: listing.price,
            observed_at: now,
        });
    }
    record.title = listing.title.clone();
    record.reference = listing.reference.clone();
    record.rooms = listing.rooms;
    record.area = listing.area;
    record.price = listing.price;
    record.price_per_area = listing.price_per_area;
    record.expired_at = None;
    if changed {
        UpsertOutcome::PriceChanged
    } else {
        UpsertOutcome::Unchanged
    }
}

/// JSON-on-disk record store.
///
/// The whole record set lives in one document rewritten through an atomic
/// temp-file rename; a mutex held across merge + persist keeps every call
/// indivisible. Suited to the small live-record counts this domain carries.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    state: Mutex<BTreeMap<i64, Record>>,
}

impl FileStore {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let records = match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|err| StoreError::Corrupt(format!("{}: {err}", path.display())))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => {
                return Err(StoreError::Unavailable(format!(
                    "reading {}: {err}",
                    path.display()
                )))
            }
        };
        Ok(Self {
            path,
            state: Mutex::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, records: &BTreeMap<i64, Record>) -> Result<(), StoreError> {
        let unavailable = |err: &dyn std::fmt::Display| {
            StoreError::Unavailable(format!("writing {}: {err}", self.path.display()))
        };
        let bytes = serde_json::to_vec_pretty(records)
            .map_err(|err| StoreError::Corrupt(err.to_string()))?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|err| unavailable(&err))?;
        }
        let temp_path = self
            .path
            .with_file_name(format!(".{}.tmp", Uuid::new_v4()));
        fs::write(&temp_path, &bytes)
            .await
            .map_err(|err| unavailable(&err))?;
        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(unavailable(&err));
        }
        Ok(())
    }
}

#[async_trait]
impl RecordStore for FileStore {
    async fn upsert(
        &self,
        key: i64,
        listing: &Listing,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StoreError> {
        let mut records = self.state.lock().await;
        // Merge into a working copy so a failed persist leaves no trace.
        let mut next = records.clone();
        let outcome = match next.get_mut(&key) {
            None => {
                next.insert(key, Record::from_listing(key, listing, now));
                UpsertOutcome::Created
            }
            Some(record) => merge_listing(record, listing, now),
        };
        self.persist(&next).await?;
        *records = next;
        Ok(outcome)
    }

    async fn mark_outdated(
        &self,
        observed: &HashSet<i64>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Record>, StoreError> {
        let mut records = self.state.lock().await;
        let mut next = records.clone();
        let mut expired = Vec::new();
        for (key, record) in next.iter_mut() {
            if record.expired_at.is_none() && !observed.contains(key) {
                expired.push(record.clone());
                record.expired_at = Some(now);
            }
        }
        if expired.is_empty() {
            return Ok(expired);
        }
        self.persist(&next).await?;
        *records = next;
        Ok(expired)
    }

    async fn get(&self, key: i64) -> Result<Option<Record>, StoreError> {
        let records = self.state.lock().await;
        Ok(records.get(&key).cloned())
    }
}

/// Postgres-backed record store.
///
/// Upserts run inside a row-locked transaction; staleness marking is a
/// single bulk `UPDATE`, so both write paths keep the all-or-nothing
/// contract of [`RecordStore`].
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        Ok(Self { pool })
    }

    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS listings (
                key BIGINT PRIMARY KEY,
                title TEXT NOT NULL,
                reference TEXT NOT NULL,
                rooms INTEGER NOT NULL,
                area DOUBLE PRECISION NOT NULL,
                price DOUBLE PRECISION NOT NULL,
                price_per_area DOUBLE PRECISION NOT NULL,
                price_history JSONB NOT NULL,
                added_at TIMESTAMPTZ NOT NULL,
                expired_at TIMESTAMPTZ
            )
            ",
        )
        .execute(&self.pool)
        .await
        .map_err(|err| StoreError::Unavailable(err.to_string()))?;

        // Staleness scans only ever touch live rows.
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS listings_live_idx ON listings (key) WHERE expired_at IS NULL",
        )
        .execute(&self.pool)
        .await
        .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        Ok(())
    }
}

fn pg_unavailable(err: sqlx::Error) -> StoreError {
    StoreError::Unavailable(err.to_string())
}

fn row_to_record(row: &PgRow) -> Result<Record, StoreError> {
    let corrupt = |err: &dyn std::fmt::Display| StoreError::Corrupt(err.to_string());
    let history: serde_json::Value = row.try_get("price_history").map_err(|e| corrupt(&e))?;
    let price_history: Vec<PricePoint> =
        serde_json::from_value(history).map_err(|e| corrupt(&e))?;
    Ok(Record {
        key: row.try_get("key").map_err(|e| corrupt(&e))?,
        title: row.try_get("title").map_err(|e| corrupt(&e))?,
        reference: row.try_get("reference").map_err(|e| corrupt(&e))?,
        rooms: row.try_get::<i32, _>("rooms").map_err(|e| corrupt(&e))? as u32,
        area: row.try_get("area").map_err(|e| corrupt(&e))?,
        price: row.try_get("price").map_err(|e| corrupt(&e))?,
        price_per_area: row.try_get("price_per_area").map_err(|e| corrupt(&e))?,
        price_history,
        added_at: row.try_get("added_at").map_err(|e| corrupt(&e))?,
        expired_at: row.try_get("expired_at").map_err(|e| corrupt(&e))?,
    })
}

fn history_json(history: &[PricePoint]) -> Result<serde_json::Value, StoreError> {
    serde_json::to_value(history).map_err(|err| StoreError::Corrupt(err.to_string()))
}

#[async_trait]
impl RecordStore for PgStore {
    async fn upsert(
        &self,
        key: i64,
        listing: &Listing,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StoreError> {
        let mut tx = self.pool.begin().await.map_err(pg_unavailable)?;

        let existing = sqlx::query("SELECT price_history FROM listings WHERE key = $1 FOR UPDATE")
            .bind(key)
            .fetch_optional(&mut *tx)
            .await
            .map_err(pg_unavailable)?;

        let outcome = match existing {
            None => {
                let history = vec![PricePoint {
                    price: listing.price,
                    observed_at: now,
                }];
                sqlx::query(
                    r"
                    INSERT INTO listings
                        (key, title, reference, rooms, area, price, price_per_area,
                         price_history, added_at, expired_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NULL)
                    ",
                )
                .bind(key)
                .bind(&listing.title)
                .bind(&listing.reference)
                .bind(listing.rooms as i32)
                .bind(listing.area)
                .bind(listing.price)
                .bind(listing.price_per_area)
                .bind(history_json(&history)?)
                .bind(now)
                .execute(&mut *tx)
                .await
                .map_err(pg_unavailable)?;
                UpsertOutcome::Created
            }
            Some(row) => {
                let stored: serde_json::Value = row
                    .try_get("price_history")
                    .map_err(|err| StoreError::Corrupt(err.to_string()))?;
                let mut history: Vec<PricePoint> = serde_json::from_value(stored)
                    .map_err(|err| StoreError::Corrupt(err.to_string()))?;
                let changed = history
                    .last()
                    .map(|point| point.price != listing.price)
                    .unwrap_or(true);
                if changed {
                    history.push(PricePoint {
                        price: listing.price,
                        observed_at: now,
                    });
                }
                sqlx::query(
                    r"
                    UPDATE listings
                    SET title = $2, reference = $3, rooms = $4, area = $5,
                        price = $6, price_per_area = $7, price_history = $8,
                        expired_at = NULL
                    WHERE key = $1
                    ",
                )
                .bind(key)
                .bind(&listing.title)
                .bind(&listing.reference)
                .bind(listing.rooms as i32)
                .bind(listing.area)
                .bind(listing.price)
                .bind(listing.price_per_area)
                .bind(history_json(&history)?)
                .execute(&mut *tx)
                .await
                .map_err(pg_unavailable)?;
                if changed {
                    UpsertOutcome::PriceChanged
                } else {
                    UpsertOutcome::Unchanged
                }
            }
        };

        tx.commit().await.map_err(pg_unavailable)?;
        Ok(outcome)
    }

    async fn mark_outdated(
        &self,
        observed: &HashSet<i64>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Record>, StoreError> {
        let observed: Vec<i64> = observed.iter().copied().collect();
        // Pre-update snapshots: only expired_at changes, returned as NULL.
        let rows = sqlx::query(
            r"
            UPDATE listings
            SET expired_at = $2
            WHERE expired_at IS NULL AND key <> ALL($1)
            RETURNING key, title, reference, rooms, area, price, price_per_area,
                      price_history, added_at, NULL::timestamptz AS expired_at
            ",
        )
        .bind(&observed)
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(pg_unavailable)?;
        rows.iter().map(row_to_record).collect()
    }

    async fn get(&self, key: i64) -> Result<Option<Record>, StoreError> {
        let row = sqlx::query(
            r"
            SELECT key, title, reference, rooms, area, price, price_per_area,
                   price_history, added_at, expired_at
            FROM listings WHERE key = $1
            ",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(pg_unavailable)?;
        row.as_ref().map(row_to_record).transpose()
    }
}

#[derive(Debug, Clone)]
pub struct PageSnapshot {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub already_archived: bool,
}

/// Immutable archive of fetched page bodies, hash-addressed per day and
/// source so a re-fetch of identical markup deduplicates.
#[derive(Debug, Clone)]
pub struct PageArchive {
    root: PathBuf,
}

impl PageArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn snapshot_relative_path(
        &self,
        fetched_at: DateTime<Utc>,
        source_id: &str,
        content_hash: &str,
    ) -> PathBuf {
        PathBuf::from(fetched_at.format("%Y%m%d").to_string())
            .join(source_id)
            .join(format!("{content_hash}.html"))
    }

    /// Stores a page body via atomic temp-file rename.
    pub async fn archive(
        &self,
        fetched_at: DateTime<Utc>,
        source_id: &str,
        body: &[u8],
    ) -> anyhow::Result<PageSnapshot> {
        let content_hash = Self::sha256_hex(body);
        let relative_path = self.snapshot_relative_path(fetched_at, source_id, &content_hash);
        let absolute_path = self.root.join(&relative_path);

        if let Some(parent) = absolute_path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating archive directory {}", parent.display()))?;
        }

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking snapshot path {}", absolute_path.display()))?
        {
            return Ok(PageSnapshot {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: body.len(),
                already_archived: true,
            });
        }

        let temp_path = absolute_path.with_file_name(format!(".{}.tmp", Uuid::new_v4()));
        fs::write(&temp_path, body)
            .await
            .with_context(|| format!("writing temp snapshot {}", temp_path.display()))?;

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(PageSnapshot {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: body.len(),
                already_archived: false,
            }),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(PageSnapshot {
                    content_hash,
                    relative_path,
                    absolute_path,
                    byte_size: body.len(),
                    already_archived: true,
                })
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "atomically renaming snapshot {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

/// Network-level fetch failure. Non-success HTTP statuses are returned as
/// values in [`FetchedResponse`], not errors: a redirect or client error is
/// how a source signals the end of pagination.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .redirect(reqwest::redirect::Policy::none())
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        Ok(Self {
            client: builder.build().context("building reqwest client")?,
            backoff: config.backoff,
        })
    }

    /// Fetches one URL, retrying transient failures (5xx, 429, connect and
    /// timeout errors) with exponential backoff.
    pub async fn fetch(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("page_fetch", %run_id, source_id, url);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    let final_url = resp.url().to_string();
                    let body = resp.bytes().await?.to_vec();
                    return Ok(FetchedResponse {
                        status,
                        final_url,
                        body,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn ts(rfc3339: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(rfc3339)
            .expect("ts")
            .with_timezone(&Utc)
    }

    fn listing(reference: &str, price: f64) -> Listing {
        Listing {
            reference: reference.to_string(),
            title: "Mieszkanie, Mokotów".to_string(),
            rooms: 3,
            price,
            price_per_area: price / 60.0,
            area: 60.0,
        }
    }

    async fn open_store(dir: &tempfile::TempDir) -> FileStore {
        FileStore::open(dir.path().join("records.json"))
            .await
            .expect("open store")
    }

    #[tokio::test]
    async fn first_observation_creates_a_record() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(&dir).await;
        let now = ts("2026-03-01T06:00:00Z");

        let outcome = store.upsert(7, &listing("m-7.html", 500_000.0), now).await.unwrap();
        assert_eq!(outcome, UpsertOutcome::Created);

        let record = store.get(7).await.unwrap().expect("record");
        assert_eq!(record.price_history.len(), 1);
        assert_eq!(record.added_at, now);
        assert!(record.expired_at.is_none());
    }

    #[tokio::test]
    async fn same_price_leaves_history_untouched() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(&dir).await;
        let t0 = ts("2026-03-01T06:00:00Z");
        let t1 = ts("2026-03-02T06:00:00Z");

        store.upsert(7, &listing("m-7.html", 500_000.0), t0).await.unwrap();
        let outcome = store.upsert(7, &listing("m-7.html", 500_000.0), t1).await.unwrap();
        assert_eq!(outcome, UpsertOutcome::Unchanged);

        let record = store.get(7).await.unwrap().unwrap();
        assert_eq!(record.price_history.len(), 1);
        assert_eq!(record.added_at, t0);
    }

    #[tokio::test]
    async fn price_change_appends_exactly_one_entry() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(&dir).await;
        let t0 = ts("2026-03-01T06:00:00Z");
        let t1 = ts("2026-03-02T06:00:00Z");

        store.upsert(7, &listing("m-7.html", 500_000.0), t0).await.unwrap();
        let outcome = store.upsert(7, &listing("m-7.html", 480_000.0), t1).await.unwrap();
        assert_eq!(outcome, UpsertOutcome::PriceChanged);

        let record = store.get(7).await.unwrap().unwrap();
        assert_eq!(record.price_history.len(), 2);
        assert_eq!(record.last_price(), Some(480_000.0));
        assert_eq!(record.price, 480_000.0);
        assert_eq!(record.price_history[0].price, 500_000.0);
    }

    #[tokio::test]
    async fn attributes_refresh_on_every_observation() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(&dir).await;
        let t0 = ts("2026-03-01T06:00:00Z");
        let t1 = ts("2026-03-02T06:00:00Z");

        store.upsert(7, &listing("m-7.html", 500_000.0), t0).await.unwrap();
        let mut reworded = listing("m-7-new.html", 500_000.0);
        reworded.title = "Mieszkanie po remoncie".to_string();
        store.upsert(7, &reworded, t1).await.unwrap();

        let record = store.get(7).await.unwrap().unwrap();
        assert_eq!(record.title, "Mieszkanie po remoncie");
        assert_eq!(record.reference, "m-7-new.html");
        assert_eq!(record.added_at, t0);
    }

    #[tokio::test]
    async fn revival_clears_expired_at_and_preserves_added_at() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(&dir).await;
        let t0 = ts("2026-03-01T06:00:00Z");
        let t1 = ts("2026-03-02T06:00:00Z");
        let t2 = ts("2026-03-03T06:00:00Z");

        store.upsert(7, &listing("m-7.html", 480_000.0), t0).await.unwrap();
        store.mark_outdated(&HashSet::new(), t1).await.unwrap();
        assert!(store.get(7).await.unwrap().unwrap().expired_at.is_some());

        let outcome = store.upsert(7, &listing("m-7.html", 480_000.0), t2).await.unwrap();
        assert_eq!(outcome, UpsertOutcome::Unchanged);

        let record = store.get(7).await.unwrap().unwrap();
        assert!(record.expired_at.is_none());
        assert_eq!(record.added_at, t0);
        assert_eq!(record.price_history.len(), 1);
    }

    #[tokio::test]
    async fn mark_outdated_selects_exactly_the_unobserved_live_records() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(&dir).await;
        let t0 = ts("2026-03-01T06:00:00Z");
        let t1 = ts("2026-03-02T06:00:00Z");

        store.upsert(1, &listing("m-1.html", 100.0), t0).await.unwrap();
        store.upsert(2, &listing("m-2.html", 200.0), t0).await.unwrap();
        store.upsert(3, &listing("m-3.html", 300.0), t0).await.unwrap();

        let observed: HashSet<i64> = [1, 3].into_iter().collect();
        let expired = store.mark_outdated(&observed, t1).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].key, 2);
        // Pre-update snapshot: the returned record is still live.
        assert!(expired[0].expired_at.is_none());
        assert_eq!(
            store.get(2).await.unwrap().unwrap().expired_at,
            Some(t1)
        );

        let again = store.mark_outdated(&observed, ts("2026-03-02T07:00:00Z")).await.unwrap();
        assert!(again.is_empty());
        // The original stamp survives the second pass.
        assert_eq!(store.get(2).await.unwrap().unwrap().expired_at, Some(t1));
    }

    #[tokio::test]
    async fn record_set_survives_reopen() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("records.json");
        let now = ts("2026-03-01T06:00:00Z");

        {
            let store = FileStore::open(&path).await.unwrap();
            store.upsert(9, &listing("m-9.html", 750_000.0), now).await.unwrap();
        }

        let reopened = FileStore::open(&path).await.unwrap();
        let record = reopened.get(9).await.unwrap().expect("record after reopen");
        assert_eq!(record.last_price(), Some(750_000.0));
        assert_eq!(record.added_at, now);
    }

    #[tokio::test]
    async fn corrupt_store_file_is_reported_as_corrupt() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("records.json");
        tokio::fs::write(&path, b"{ not json").await.unwrap();

        let err = FileStore::open(&path).await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn archive_deduplicates_identical_page_bodies() {
        let dir = tempdir().expect("tempdir");
        let archive = PageArchive::new(dir.path());
        let fetched_at = ts("2026-03-01T06:00:00Z");

        let first = archive
            .archive(fetched_at, "otodom", b"<html>same</html>")
            .await
            .expect("first archive");
        let second = archive
            .archive(fetched_at, "otodom", b"<html>same</html>")
            .await
            .expect("second archive");

        assert!(!first.already_archived);
        assert!(second.already_archived);
        assert_eq!(first.content_hash, second.content_hash);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first.absolute_path.exists());
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn retry_classification_covers_throttling_and_server_errors() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
        assert_eq!(
            classify_status(StatusCode::MOVED_PERMANENTLY),
            RetryDisposition::NonRetryable
        );
    }
}
