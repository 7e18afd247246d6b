use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::config::Config;
use crate::store::{Query, Record, Store, StoreError};

pub async fn connect(config: &Config) -> anyhow::Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(config.database_url()?)
        .await
        .context("failed to connect to Postgres")
}

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Postgres-backed store. Rows travel as JSON objects keyed by column name,
/// so one code path serves every table.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn classify(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            StoreError::DuplicateKey(err.to_string())
        }
        sqlx::Error::Io(_) | sqlx::Error::Tls(_) | sqlx::Error::PoolTimedOut => {
            StoreError::Transient(err.to_string())
        }
        sqlx::Error::PoolClosed => StoreError::Permanent(err.to_string()),
        _ => StoreError::from_message(err.to_string()),
    }
}

fn into_records(values: Vec<Value>) -> Vec<Record> {
    values
        .into_iter()
        .filter_map(|value| match value {
            Value::Object(map) => Some(map),
            _ => None,
        })
        .collect()
}

/// Column list of a batch in first-seen order.
fn batch_columns(records: &[Record]) -> Vec<String> {
    let mut columns: Vec<String> = Vec::new();
    for record in records {
        for key in record.keys() {
            if !columns.contains(key) {
                columns.push(key.clone());
            }
        }
    }
    columns
}

fn select_sql(query: &Query) -> String {
    let mut sql = format!("SELECT to_jsonb(t) FROM {} AS t", quote_ident(&query.table));
    for (idx, (column, _)) in query.filters.iter().enumerate() {
        let keyword = if idx == 0 { "WHERE" } else { "AND" };
        sql.push_str(&format!(
            " {keyword} t.{}::text = ${}",
            quote_ident(column),
            idx + 1
        ));
    }
    let next = query.filters.len() + 1;
    sql.push_str(&format!(" ORDER BY t.ctid LIMIT ${next} OFFSET ${}", next + 1));
    sql
}

fn insert_sql(table: &str, columns: &[String], conflict: Option<&[&str]>) -> String {
    let table = quote_ident(table);
    let column_list = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let mut sql = format!(
        "INSERT INTO {table} ({column_list}) SELECT {column_list} FROM jsonb_populate_recordset(NULL::{table}, $1)"
    );

    if let Some(conflict) = conflict {
        let target = conflict
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        let updates = columns
            .iter()
            .filter(|c| !conflict.contains(&c.as_str()))
            .map(|c| format!("{col} = EXCLUDED.{col}", col = quote_ident(c)))
            .collect::<Vec<_>>();
        if updates.is_empty() {
            sql.push_str(&format!(" ON CONFLICT ({target}) DO NOTHING"));
        } else {
            sql.push_str(&format!(
                " ON CONFLICT ({target}) DO UPDATE SET {}",
                updates.join(", ")
            ));
        }
    }
    sql
}

impl PgStore {
    async fn write(
        &self,
        table: &str,
        records: &[Record],
        conflict: Option<&[&str]>,
    ) -> Result<u64, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }
        let columns = batch_columns(records);
        let payload = Value::Array(records.iter().cloned().map(Value::Object).collect());
        let result = sqlx::query(&insert_sql(table, &columns, conflict))
            .bind(payload)
            .execute(&self.pool)
            .await
            .map_err(classify)?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl Store for PgStore {
    async fn select_page(
        &self,
        query: &Query,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Record>, StoreError> {
        let sql = select_sql(query);
        let mut statement = sqlx::query_scalar::<_, Value>(&sql);
        for (_, value) in &query.filters {
            statement = statement.bind(value);
        }
        let rows = statement
            .bind(limit as i64)
            .bind(offset as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(classify)?;
        Ok(into_records(rows)
            .into_iter()
            .map(|record| query.project(record))
            .collect())
    }

    async fn select_in(
        &self,
        table: &str,
        column: &str,
        values: &[String],
    ) -> Result<Vec<Record>, StoreError> {
        if values.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT to_jsonb(t) FROM {} AS t WHERE t.{}::text = ANY($1)",
            quote_ident(table),
            quote_ident(column)
        );
        let rows = sqlx::query_scalar::<_, Value>(&sql)
            .bind(values)
            .fetch_all(&self.pool)
            .await
            .map_err(classify)?;
        Ok(into_records(rows))
    }

    async fn insert(&self, table: &str, records: &[Record]) -> Result<u64, StoreError> {
        self.write(table, records, None).await
    }

    async fn upsert(
        &self,
        table: &str,
        records: &[Record],
        conflict: &[&str],
    ) -> Result<u64, StoreError> {
        self.write(table, records, Some(conflict)).await
    }
}
