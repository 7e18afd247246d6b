use std::collections::HashSet;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::store::{value_text, Record, Store, StoreError};

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("batch {batch} of {total} failed: {source}")]
    BatchFailed {
        batch: usize,
        total: usize,
        #[source]
        source: StoreError,
    },
    #[error("record serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Insert or update on the conflict key.
    Upsert,
    /// Plain insert; rows that collide with stored keys are skipped.
    Insert,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteReport {
    pub written: u64,
    pub skipped_duplicates: usize,
    pub batches: usize,
}

pub struct Writer<'a> {
    store: &'a dyn Store,
    batch_size: usize,
    retry_delay: Duration,
}

impl<'a> Writer<'a> {
    pub fn new(store: &'a dyn Store, config: &Config) -> Self {
        Self {
            store,
            batch_size: config.write_batch_size.max(1),
            retry_delay: config.retry_delay,
        }
    }

    pub async fn write_rows<T: Serialize>(
        &self,
        table: &str,
        rows: &[T],
        conflict: &[&str],
        mode: WriteMode,
    ) -> Result<WriteReport, WriteError> {
        let records = rows
            .iter()
            .map(to_record)
            .collect::<Result<Vec<_>, _>>()?;
        self.write_records(table, records, conflict, mode).await
    }

    pub async fn write_records(
        &self,
        table: &str,
        records: Vec<Record>,
        conflict: &[&str],
        mode: WriteMode,
    ) -> Result<WriteReport, WriteError> {
        let records = prepare_records(records, conflict);
        let total = records.len().div_ceil(self.batch_size);
        let mut report = WriteReport::default();

        for (idx, batch) in records.chunks(self.batch_size).enumerate() {
            let number = idx + 1;
            match self.send_with_retry(table, batch, conflict, mode).await {
                Ok(written) => report.written += written,
                Err(StoreError::DuplicateKey(message)) if mode == WriteMode::Insert => {
                    debug!(table, batch = number, %message, "batch hit duplicates, inserting row by row");
                    let (written, skipped) = self.insert_one_by_one(table, batch, number, total).await?;
                    report.written += written;
                    report.skipped_duplicates += skipped;
                }
                Err(source) => {
                    return Err(WriteError::BatchFailed {
                        batch: number,
                        total,
                        source,
                    })
                }
            }
            report.batches += 1;
            debug!(table, batch = number, total, "batch written");
        }

        info!(
            table,
            written = report.written,
            skipped = report.skipped_duplicates,
            batches = report.batches,
            "write finished"
        );
        Ok(report)
    }

    async fn send(
        &self,
        table: &str,
        batch: &[Record],
        conflict: &[&str],
        mode: WriteMode,
    ) -> Result<u64, StoreError> {
        match mode {
            WriteMode::Upsert => self.store.upsert(table, batch, conflict).await,
            WriteMode::Insert => self.store.insert(table, batch).await,
        }
    }

    async fn send_with_retry(
        &self,
        table: &str,
        batch: &[Record],
        conflict: &[&str],
        mode: WriteMode,
    ) -> Result<u64, StoreError> {
        match self.send(table, batch, conflict, mode).await {
            Err(err) if err.is_transient() => {
                warn!(table, error = %err, delay_ms = self.retry_delay.as_millis() as u64, "transient write failure, retrying");
                tokio::time::sleep(self.retry_delay).await;
                self.send(table, batch, conflict, mode).await
            }
            other => other,
        }
    }

    async fn insert_one_by_one(
        &self,
        table: &str,
        batch: &[Record],
        number: usize,
        total: usize,
    ) -> Result<(u64, usize), WriteError> {
        let mut written = 0;
        let mut skipped = 0;
        for record in batch {
            let single = std::slice::from_ref(record);
            match self.send_with_retry(table, single, &[], WriteMode::Insert).await {
                Ok(count) => written += count,
                Err(StoreError::DuplicateKey(_)) => skipped += 1,
                Err(source) => {
                    return Err(WriteError::BatchFailed {
                        batch: number,
                        total,
                        source,
                    })
                }
            }
        }
        if skipped > 0 {
            warn!(table, batch = number, skipped, "skipped rows already stored");
        }
        Ok((written, skipped))
    }
}

fn to_record<T: Serialize>(row: &T) -> Result<Record, serde_json::Error> {
    match serde_json::to_value(row)? {
        Value::Object(map) => Ok(map),
        other => Err(serde::ser::Error::custom(format!(
            "expected a record, got {other}"
        ))),
    }
}

/// Nulls out stringified missing values and keeps the first record per
/// conflict key.
fn prepare_records(records: Vec<Record>, conflict: &[&str]) -> Vec<Record> {
    let mut seen = HashSet::new();
    records
        .into_iter()
        .map(|mut record| {
            for value in record.values_mut() {
                if matches!(value, Value::String(s) if s.trim().eq_ignore_ascii_case("nan")) {
                    *value = Value::Null;
                }
            }
            record
        })
        .filter(|record| {
            if conflict.is_empty() {
                return true;
            }
            let key: Vec<String> = conflict
                .iter()
                .map(|c| record.get(*c).map(value_text).unwrap_or_default())
                .collect();
            seen.insert(key)
        })
        .collect()
}
