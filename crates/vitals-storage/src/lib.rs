//! Summary document storage: one JSON document per (collection, period key),
//! backed by Postgres `jsonb` or an in-process map, plus typed reads.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;
use vitals_core::{
    format_date, Collection, HealthMetrics, PeriodKind, Recent7Record, RecentMetrics, SummaryRecord,
    VitalsError,
};

pub const CRATE_NAME: &str = "vitals-storage";

pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub id: String,
    pub period_key: NaiveDate,
    pub body: JsonValue,
}

/// Inclusive key range plus an optional result cap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DocumentFilter {
    pub from: Option<NaiveDate>,
    pub until: Option<NaiveDate>,
    pub limit: Option<usize>,
}

impl DocumentFilter {
    pub fn limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }

    /// Both bounds of a calendar year, or `None` when the year lies outside
    /// the representable date range.
    pub fn year(year: i32) -> Option<Self> {
        Some(Self {
            from: Some(NaiveDate::from_ymd_opt(year, 1, 1)?),
            until: Some(NaiveDate::from_ymd_opt(year, 12, 31)?),
            limit: None,
        })
    }

    fn admits(&self, key: NaiveDate) -> bool {
        self.from.is_none_or(|from| key >= from) && self.until.is_none_or(|until| key <= until)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

impl SortOrder {
    fn sql(self) -> &'static str {
        match self {
            Self::Ascending => "ASC",
            Self::Descending => "DESC",
        }
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    fn backend(&self) -> &'static str;

    async fn find_by_key(
        &self,
        collection: Collection,
        key: NaiveDate,
    ) -> Result<Option<StoredDocument>, VitalsError>;

    /// Stores a new document and returns its id. A concurrent insert for the
    /// same key resolves to a single document carrying the last body written.
    async fn insert(
        &self,
        collection: Collection,
        key: NaiveDate,
        body: JsonValue,
    ) -> Result<String, VitalsError>;

    /// Replaces the body of an existing document; the id never changes.
    async fn replace(
        &self,
        collection: Collection,
        id: &str,
        key: NaiveDate,
        body: JsonValue,
    ) -> Result<(), VitalsError>;

    async fn list(
        &self,
        collection: Collection,
        filter: DocumentFilter,
        order: SortOrder,
    ) -> Result<Vec<StoredDocument>, VitalsError>;
}

#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    collections: Mutex<HashMap<Collection, BTreeMap<NaiveDate, StoredDocument>>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self, collection: Collection) -> usize {
        self.collections
            .lock()
            .await
            .get(&collection)
            .map_or(0, BTreeMap::len)
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn find_by_key(
        &self,
        collection: Collection,
        key: NaiveDate,
    ) -> Result<Option<StoredDocument>, VitalsError> {
        let guard = self.collections.lock().await;
        Ok(guard.get(&collection).and_then(|docs| docs.get(&key)).cloned())
    }

    async fn insert(
        &self,
        collection: Collection,
        key: NaiveDate,
        body: JsonValue,
    ) -> Result<String, VitalsError> {
        let mut guard = self.collections.lock().await;
        let docs = guard.entry(collection).or_default();
        let doc = docs.entry(key).or_insert_with(|| StoredDocument {
            id: Uuid::new_v4().to_string(),
            period_key: key,
            body: JsonValue::Null,
        });
        doc.body = body;
        Ok(doc.id.clone())
    }

    async fn replace(
        &self,
        collection: Collection,
        id: &str,
        key: NaiveDate,
        body: JsonValue,
    ) -> Result<(), VitalsError> {
        let mut guard = self.collections.lock().await;
        let docs = guard.entry(collection).or_default();
        let current_key = docs
            .iter()
            .find(|(_, doc)| doc.id == id)
            .map(|(k, _)| *k)
            .ok_or_else(|| VitalsError::not_found(format!("{collection} document"), id))?;
        if let Some(mut doc) = docs.remove(&current_key) {
            doc.period_key = key;
            doc.body = body;
            docs.insert(key, doc);
        }
        Ok(())
    }

    async fn list(
        &self,
        collection: Collection,
        filter: DocumentFilter,
        order: SortOrder,
    ) -> Result<Vec<StoredDocument>, VitalsError> {
        let guard = self.collections.lock().await;
        let Some(docs) = guard.get(&collection) else {
            return Ok(Vec::new());
        };
        let matching = docs.values().filter(|doc| filter.admits(doc.period_key));
        let limit = filter.limit.unwrap_or(usize::MAX);
        Ok(match order {
            SortOrder::Ascending => matching.take(limit).cloned().collect(),
            SortOrder::Descending => matching.rev().take(limit).cloned().collect(),
        })
    }
}

/// `summary_documents` table in Postgres; see `migrations/`.
#[derive(Debug, Clone)]
pub struct PgDocumentStore {
    pool: PgPool,
    timeout: Duration,
}

impl PgDocumentStore {
    pub async fn connect(database_url: &str, timeout: Duration) -> Result<Self, VitalsError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(timeout)
            .connect(database_url)
            .await
            .map_err(|err| VitalsError::store_unavailable("connecting to postgres", err))?;
        Ok(Self::from_pool(pool, timeout))
    }

    pub fn from_pool(pool: PgPool, timeout: Duration) -> Self {
        Self { pool, timeout }
    }

    pub async fn migrate(&self) -> Result<(), VitalsError> {
        MIGRATOR
            .run(&self.pool)
            .await
            .map_err(|err| VitalsError::store_unavailable("running migrations", err))?;
        info!("summary document migrations applied");
        Ok(())
    }

    async fn bounded<T, F>(&self, context: &str, fut: F) -> Result<T, VitalsError>
    where
        F: Future<Output = Result<T, sqlx::Error>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result.map_err(|err| VitalsError::store_unavailable(context, err)),
            Err(_) => Err(VitalsError::store_unavailable(
                context,
                format!("timed out after {:?}", self.timeout),
            )),
        }
    }
}

fn document_from_row(row: &PgRow) -> Result<StoredDocument, sqlx::Error> {
    let Json(body): Json<JsonValue> = row.try_get("body")?;
    Ok(StoredDocument {
        id: row.try_get("id")?,
        period_key: row.try_get("period_key")?,
        body,
    })
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn find_by_key(
        &self,
        collection: Collection,
        key: NaiveDate,
    ) -> Result<Option<StoredDocument>, VitalsError> {
        let row = self
            .bounded(
                "looking up summary document",
                sqlx::query(
                    r#"
                    SELECT id::text AS id, period_key, body
                      FROM summary_documents
                     WHERE collection = $1
                       AND period_key = $2
                    "#,
                )
                .bind(collection.name())
                .bind(key)
                .fetch_optional(&self.pool),
            )
            .await?;
        row.as_ref()
            .map(document_from_row)
            .transpose()
            .map_err(|err| VitalsError::store_unavailable("decoding summary document", err))
    }

    async fn insert(
        &self,
        collection: Collection,
        key: NaiveDate,
        body: JsonValue,
    ) -> Result<String, VitalsError> {
        let row = self
            .bounded(
                "inserting summary document",
                sqlx::query(
                    r#"
                    INSERT INTO summary_documents (id, collection, period_key, body)
                    VALUES ($1, $2, $3, $4)
                    ON CONFLICT (collection, period_key)
                    DO UPDATE SET body = EXCLUDED.body, updated_at = now()
                    RETURNING id::text AS id
                    "#,
                )
                .bind(Uuid::new_v4())
                .bind(collection.name())
                .bind(key)
                .bind(Json(body))
                .fetch_one(&self.pool),
            )
            .await?;
        let id: String = row
            .try_get("id")
            .map_err(|err| VitalsError::store_unavailable("decoding inserted id", err))?;
        debug!(%collection, key = %format_date(key), %id, "inserted summary document");
        Ok(id)
    }

    async fn replace(
        &self,
        collection: Collection,
        id: &str,
        key: NaiveDate,
        body: JsonValue,
    ) -> Result<(), VitalsError> {
        let uuid = Uuid::parse_str(id)
            .map_err(|_| VitalsError::not_found(format!("{collection} document"), id))?;
        let result = self
            .bounded(
                "replacing summary document",
                sqlx::query(
                    r#"
                    UPDATE summary_documents
                       SET period_key = $3, body = $4, updated_at = now()
                     WHERE collection = $1
                       AND id = $2
                    "#,
                )
                .bind(collection.name())
                .bind(uuid)
                .bind(key)
                .bind(Json(body))
                .execute(&self.pool),
            )
            .await?;
        if result.rows_affected() == 0 {
            return Err(VitalsError::not_found(format!("{collection} document"), id));
        }
        Ok(())
    }

    async fn list(
        &self,
        collection: Collection,
        filter: DocumentFilter,
        order: SortOrder,
    ) -> Result<Vec<StoredDocument>, VitalsError> {
        let query = format!(
            r#"
            SELECT id::text AS id, period_key, body
              FROM summary_documents
             WHERE collection = $1
               AND ($2::date IS NULL OR period_key >= $2)
               AND ($3::date IS NULL OR period_key <= $3)
             ORDER BY period_key {}
             LIMIT $4
            "#,
            order.sql()
        );
        let limit = filter.limit.map(|n| i64::try_from(n).unwrap_or(i64::MAX));
        let rows = self
            .bounded(
                "listing summary documents",
                sqlx::query(&query)
                    .bind(collection.name())
                    .bind(filter.from)
                    .bind(filter.until)
                    .bind(limit)
                    .fetch_all(&self.pool),
            )
            .await?;
        rows.iter()
            .map(document_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| VitalsError::store_unavailable("decoding summary documents", err))
    }
}

pub fn encode_body<T: Serialize>(value: &T) -> Result<JsonValue, VitalsError> {
    serde_json::to_value(value)
        .map_err(|err| VitalsError::store_unavailable("encoding summary document", err))
}

fn decode_body<T: DeserializeOwned>(doc: &StoredDocument) -> Result<T, VitalsError> {
    serde_json::from_value(doc.body.clone()).map_err(|err| {
        VitalsError::store_unavailable(format!("decoding summary document {}", doc.id), err)
    })
}

pub fn summary_from_document(
    kind: PeriodKind,
    doc: &StoredDocument,
) -> Result<SummaryRecord, VitalsError> {
    let metrics: HealthMetrics = decode_body(doc)?;
    Ok(SummaryRecord::new(kind, doc.period_key, metrics).with_id(doc.id.clone()))
}

pub fn recent_from_document(doc: &StoredDocument) -> Result<Recent7Record, VitalsError> {
    let metrics: RecentMetrics = decode_body(doc)?;
    Ok(Recent7Record {
        id: Some(doc.id.clone()),
        latest_day: doc.period_key,
        metrics,
    })
}

/// Typed, side-effect free reads over a [`DocumentStore`].
#[derive(Clone)]
pub struct SummaryReader {
    store: Arc<dyn DocumentStore>,
}

impl SummaryReader {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub async fn get_by_key(
        &self,
        kind: PeriodKind,
        key: NaiveDate,
    ) -> Result<SummaryRecord, VitalsError> {
        let key = kind.normalize(key);
        let doc = self
            .store
            .find_by_key(kind.collection(), key)
            .await?
            .ok_or_else(|| VitalsError::not_found(format!("{kind} summary"), format_date(key)))?;
        summary_from_document(kind, &doc)
    }

    pub async fn get_recent(&self, latest_day: NaiveDate) -> Result<Recent7Record, VitalsError> {
        let doc = self
            .store
            .find_by_key(Collection::RecentDailySummaries, latest_day)
            .await?
            .ok_or_else(|| VitalsError::not_found("recent summaries", format_date(latest_day)))?;
        recent_from_document(&doc)
    }

    /// Most recent first.
    pub async fn get_page(
        &self,
        kind: PeriodKind,
        limit: usize,
    ) -> Result<Vec<SummaryRecord>, VitalsError> {
        self.list(kind, DocumentFilter::limit(limit)).await
    }

    pub async fn get_by_year(
        &self,
        kind: PeriodKind,
        year: i32,
    ) -> Result<Vec<SummaryRecord>, VitalsError> {
        match DocumentFilter::year(year) {
            Some(filter) => self.list(kind, filter).await,
            None => Ok(Vec::new()),
        }
    }

    pub async fn months(&self, year: Option<i32>) -> Result<Vec<SummaryRecord>, VitalsError> {
        match year {
            Some(year) => self.get_by_year(PeriodKind::Month, year).await,
            None => self.list(PeriodKind::Month, DocumentFilter::default()).await,
        }
    }

    pub async fn years(&self) -> Result<Vec<SummaryRecord>, VitalsError> {
        self.list(PeriodKind::Year, DocumentFilter::default()).await
    }

    /// Day summaries keyed on or before `reference`, most recent first.
    pub async fn days_up_to(
        &self,
        reference: NaiveDate,
        limit: usize,
    ) -> Result<Vec<SummaryRecord>, VitalsError> {
        let filter = DocumentFilter {
            until: Some(reference),
            limit: Some(limit),
            ..DocumentFilter::default()
        };
        self.list(PeriodKind::Day, filter).await
    }

    pub async fn latest_day(&self) -> Result<Option<NaiveDate>, VitalsError> {
        let docs = self
            .store
            .list(Collection::CurrentDaySummaries, DocumentFilter::limit(1), SortOrder::Descending)
            .await?;
        Ok(docs.first().map(|doc| doc.period_key))
    }

    /// Every document of a collection in key order, as stored.
    pub async fn export(&self, collection: Collection) -> Result<Vec<StoredDocument>, VitalsError> {
        self.store
            .list(collection, DocumentFilter::default(), SortOrder::Ascending)
            .await
    }

    async fn list(
        &self,
        kind: PeriodKind,
        filter: DocumentFilter,
    ) -> Result<Vec<SummaryRecord>, VitalsError> {
        self.store
            .list(kind.collection(), filter, SortOrder::Descending)
            .await?
            .iter()
            .map(|doc| summary_from_document(kind, doc))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").expect("valid date")
    }

    async fn seeded(kind: PeriodKind, keys: &[&str]) -> (Arc<MemoryDocumentStore>, SummaryReader) {
        let store = Arc::new(MemoryDocumentStore::new());
        for (idx, key) in keys.iter().enumerate() {
            store
                .insert(kind.collection(), date(key), json!({ "steps": 1000 + idx }))
                .await
                .expect("insert");
        }
        let reader = SummaryReader::new(store.clone());
        (store, reader)
    }

    #[tokio::test]
    async fn memory_store_keeps_one_document_per_key() {
        let store = MemoryDocumentStore::new();
        let key = date("2025-01-30");
        let first = store
            .insert(Collection::CurrentDaySummaries, key, json!({ "steps": 1 }))
            .await
            .unwrap();
        let second = store
            .insert(Collection::CurrentDaySummaries, key, json!({ "steps": 2 }))
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(store.len(Collection::CurrentDaySummaries).await, 1);

        let doc = store
            .find_by_key(Collection::CurrentDaySummaries, key)
            .await
            .unwrap()
            .expect("present");
        assert_eq!(doc.body, json!({ "steps": 2 }));
        assert!(store
            .find_by_key(Collection::WeeklySummaries, key)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn replace_keeps_id_and_swaps_body() {
        let store = MemoryDocumentStore::new();
        let key = date("2025-01-30");
        let id = store
            .insert(Collection::CurrentDaySummaries, key, json!({ "steps": 1, "floors": 3 }))
            .await
            .unwrap();
        store
            .replace(Collection::CurrentDaySummaries, &id, key, json!({ "steps": 9 }))
            .await
            .unwrap();
        let doc = store
            .find_by_key(Collection::CurrentDaySummaries, key)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc.id, id);
        assert_eq!(doc.body, json!({ "steps": 9 }));

        let err = store
            .replace(Collection::CurrentDaySummaries, "missing", key, json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn pages_are_most_recent_first_and_capped() {
        let (_, reader) = seeded(
            PeriodKind::Day,
            &["2025-01-28", "2025-01-30", "2025-01-29", "2025-01-27"],
        )
        .await;
        let page = reader.get_page(PeriodKind::Day, 3).await.unwrap();
        let keys = page.iter().map(|r| format_date(r.period_key)).collect::<Vec<_>>();
        assert_eq!(keys, vec!["2025-01-30", "2025-01-29", "2025-01-28"]);
        assert!(page.iter().all(|r| r.id.is_some()));

        assert_eq!(reader.latest_day().await.unwrap(), Some(date("2025-01-30")));
        let older = reader.days_up_to(date("2025-01-28"), 7).await.unwrap();
        assert_eq!(older.len(), 2);

        let exported = reader.export(Collection::CurrentDaySummaries).await.unwrap();
        assert_eq!(exported.first().map(|d| d.period_key), Some(date("2025-01-27")));
        assert_eq!(exported.len(), 4);
    }

    #[tokio::test]
    async fn months_filter_by_year_and_sort_descending() {
        let (_, reader) = seeded(
            PeriodKind::Month,
            &["2024-11-01", "2025-01-01", "2025-03-01", "2025-02-01"],
        )
        .await;
        let months = reader.months(Some(2025)).await.unwrap();
        let keys = months.iter().map(|r| format_date(r.period_key)).collect::<Vec<_>>();
        assert_eq!(keys, vec!["2025-03-01", "2025-02-01", "2025-01-01"]);
        assert_eq!(reader.months(None).await.unwrap().len(), 4);
        assert!(reader.months(Some(2019)).await.unwrap().is_empty());
        assert!(reader.months(Some(300_000)).await.unwrap().is_empty());
        assert!(reader.months(Some(i32::MIN)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn year_bounds_are_inclusive_on_both_ends() {
        let (_, reader) = seeded(
            PeriodKind::Day,
            &["2024-12-31", "2025-01-01", "2025-06-15", "2025-12-31", "2026-01-01"],
        )
        .await;
        let days = reader.get_by_year(PeriodKind::Day, 2025).await.unwrap();
        let keys = days.iter().map(|r| format_date(r.period_key)).collect::<Vec<_>>();
        assert_eq!(keys, vec!["2025-12-31", "2025-06-15", "2025-01-01"]);
        assert!(reader.get_by_year(PeriodKind::Day, i32::MAX).await.unwrap().is_empty());

        assert!(DocumentFilter::year(300_000).is_none());
        let filter = DocumentFilter::year(2025).expect("representable year");
        assert!(filter.admits(date("2025-12-31")));
        assert!(!filter.admits(date("2026-01-01")));
    }

    #[tokio::test]
    async fn lookups_normalize_keys_and_report_absence() {
        let (_, reader) = seeded(PeriodKind::Month, &["2025-03-01"]).await;
        let record = reader
            .get_by_key(PeriodKind::Month, date("2025-03-17"))
            .await
            .expect("normalized lookup");
        assert_eq!(record.metrics.steps, Some(1000));

        let err = reader
            .get_by_key(PeriodKind::Day, date("2025-03-17"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");
        let err = reader.get_recent(date("2025-03-17")).await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn undecodable_bodies_surface_as_store_failures() {
        let store = Arc::new(MemoryDocumentStore::new());
        store
            .insert(Collection::YearlySummaries, date("2024-01-01"), json!({ "steps": "many" }))
            .await
            .unwrap();
        let err = SummaryReader::new(store).years().await.unwrap_err();
        assert_eq!(err.kind(), "store_unavailable");
    }
}
