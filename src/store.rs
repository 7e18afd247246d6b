//! Relational store seam.
//!
//! The pipeline only needs equality-filtered paginated reads, `IN` lookups,
//! plain inserts and upserts against a conflict target. `db::PgStore` is the
//! production implementation; `CachedStore` memoizes reads for a while.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

pub type Record = Map<String, Value>;

const TRANSIENT_PATTERNS: [&str; 4] = ["connection", "timeout", "ssl", "eof"];
const DUPLICATE_PATTERN: &str = "duplicate key value violates unique constraint";

#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    #[error("transient store error: {0}")]
    Transient(String),
    #[error("duplicate key: {0}")]
    DuplicateKey(String),
    #[error("store error: {0}")]
    Permanent(String),
}

impl StoreError {
    /// Classifies an error that only carries a message.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        if lower.contains(DUPLICATE_PATTERN) {
            StoreError::DuplicateKey(message)
        } else if TRANSIENT_PATTERNS.iter().any(|p| lower.contains(p)) {
            StoreError::Transient(message)
        } else {
            StoreError::Permanent(message)
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

/// A select with an optional column list and equality filters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Query {
    pub table: String,
    pub columns: Vec<String>,
    pub filters: Vec<(String, String)>,
}

impl Query {
    pub fn table(table: &str) -> Self {
        Self {
            table: table.to_string(),
            columns: Vec::new(),
            filters: Vec::new(),
        }
    }

    pub fn select(mut self, columns: &[&str]) -> Self {
        self.columns = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn eq(mut self, column: &str, value: &str) -> Self {
        self.filters.push((column.to_string(), value.to_string()));
        self
    }

    /// Keeps only the selected columns of a full record.
    pub fn project(&self, record: Record) -> Record {
        if self.columns.is_empty() {
            return record;
        }
        record
            .into_iter()
            .filter(|(key, _)| self.columns.contains(key))
            .collect()
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn select_page(
        &self,
        query: &Query,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Record>, StoreError>;

    async fn select_in(
        &self,
        table: &str,
        column: &str,
        values: &[String],
    ) -> Result<Vec<Record>, StoreError>;

    async fn insert(&self, table: &str, records: &[Record]) -> Result<u64, StoreError>;

    async fn upsert(
        &self,
        table: &str,
        records: &[Record],
        conflict: &[&str],
    ) -> Result<u64, StoreError>;
}

/// Reads every page of `query` until a short page comes back.
pub async fn fetch_all(
    store: &dyn Store,
    query: &Query,
    page_size: usize,
) -> Result<Vec<Record>, StoreError> {
    let page_size = page_size.max(1);
    let mut records = Vec::new();
    let mut offset = 0;
    loop {
        let page = store.select_page(query, offset, page_size).await?;
        let fetched = page.len();
        records.extend(page);
        debug!(table = %query.table, offset, fetched, "fetched page");
        if fetched < page_size {
            break;
        }
        offset += page_size;
    }
    Ok(records)
}

/// Memoizes paginated reads for `ttl`. Writes pass straight through and do
/// not invalidate anything, so cached reads may be stale.
pub struct CachedStore<S> {
    inner: S,
    ttl: Duration,
    pages: Mutex<HashMap<(Query, usize, usize), (Instant, Vec<Record>)>>,
}

impl<S: Store> CachedStore<S> {
    pub fn new(inner: S, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            pages: Mutex::new(HashMap::new()),
        }
    }

    fn cached(&self, key: &(Query, usize, usize)) -> Option<Vec<Record>> {
        let pages = self.pages.lock().ok()?;
        pages
            .get(key)
            .filter(|(at, _)| at.elapsed() < self.ttl)
            .map(|(_, records)| records.clone())
    }
}

#[async_trait]
impl<S: Store> Store for CachedStore<S> {
    async fn select_page(
        &self,
        query: &Query,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Record>, StoreError> {
        let key = (query.clone(), offset, limit);
        if let Some(records) = self.cached(&key) {
            debug!(table = %query.table, offset, "cache hit");
            return Ok(records);
        }
        let records = self.inner.select_page(query, offset, limit).await?;
        if let Ok(mut pages) = self.pages.lock() {
            pages.insert(key, (Instant::now(), records.clone()));
        }
        Ok(records)
    }

    async fn select_in(
        &self,
        table: &str,
        column: &str,
        values: &[String],
    ) -> Result<Vec<Record>, StoreError> {
        self.inner.select_in(table, column, values).await
    }

    async fn insert(&self, table: &str, records: &[Record]) -> Result<u64, StoreError> {
        self.inner.insert(table, records).await
    }

    async fn upsert(
        &self,
        table: &str,
        records: &[Record],
        conflict: &[&str],
    ) -> Result<u64, StoreError> {
        self.inner.upsert(table, records, conflict).await
    }
}

/// Text form of a stored value used for equality filters.
pub fn value_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}


#[cfg(test)]
mod tests {
    use super::memory::MemoryStore;
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        match value {
            Value::Object(map) => map,
            _ => Record::new(),
        }
    }

    fn students(count: usize) -> Vec<Record> {
        (0..count)
            .map(|i| {
                record(json!({
                    "корпоративная_почта": format!("s{i}@edu.hse.ru"),
                    "курс": if i % 2 == 0 { "Курс 4" } else { "Курс 3" },
                }))
            })
            .collect()
    }

    #[test]
    fn messages_are_classified() {
        assert!(StoreError::from_message("SSL SYSCALL error: EOF detected").is_transient());
        assert!(StoreError::from_message("Connection reset by peer").is_transient());
        assert!(matches!(
            StoreError::from_message(
                "duplicate key value violates unique constraint \"peresdachi_pkey\""
            ),
            StoreError::DuplicateKey(_)
        ));
        assert!(matches!(
            StoreError::from_message("column \"x\" does not exist"),
            StoreError::Permanent(_)
        ));
    }

    #[tokio::test]
    async fn fetch_all_walks_every_page() {
        let store = MemoryStore::new().with_rows("students", students(25));
        let all = fetch_all(&store, &Query::table("students"), 10).await.unwrap();
        assert_eq!(all.len(), 25);
        assert_eq!(store.reads(), 3);
    }

    #[tokio::test]
    async fn fetch_all_applies_filters_and_projection() {
        let store = MemoryStore::new().with_rows("students", students(6));
        let query = Query::table("students")
            .select(&["корпоративная_почта"])
            .eq("курс", "Курс 4");
        let rows = fetch_all(&store, &query, 1000).await.unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| r.len() == 1));
    }

    #[tokio::test]
    async fn cached_reads_skip_the_store_until_expiry() {
        let cached = CachedStore::new(
            MemoryStore::new().with_rows("students", students(3)),
            Duration::from_secs(300),
        );
        let query = Query::table("students");
        fetch_all(&cached, &query, 1000).await.unwrap();
        fetch_all(&cached, &query, 1000).await.unwrap();
        assert_eq!(cached.inner.reads(), 1);

        let expired = CachedStore::new(
            MemoryStore::new().with_rows("students", students(3)),
            Duration::ZERO,
        );
        fetch_all(&expired, &query, 1000).await.unwrap();
        fetch_all(&expired, &query, 1000).await.unwrap();
        assert_eq!(expired.inner.reads(), 2);
    }

    #[tokio::test]
    async fn writes_do_not_invalidate_cached_reads() {
        let cached = CachedStore::new(
            MemoryStore::new().with_rows("students", students(1)),
            Duration::from_secs(300),
        );
        let query = Query::table("students");
        assert_eq!(fetch_all(&cached, &query, 1000).await.unwrap().len(), 1);

        cached
            .upsert("students", &students(2), &["корпоративная_почта"])
            .await
            .unwrap();
        assert_eq!(fetch_all(&cached, &query, 1000).await.unwrap().len(), 1);
        assert_eq!(cached.inner.rows("students").len(), 2);
    }
}
