//! PostgreSQL storage implementation.

use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions, Postgres};
use sqlx::query::Query;
use sqlx::{Row, Transaction as SqlxTransaction};
use tracing::{debug, info};

use cms_core::{
    Batch, CmsError, Database, DatabaseConfig, Ident, ProcedureCall, QueryPage, Result,
    SqlValue, Statement, Transaction, SYNC_TOKEN_TABLE,
};

use crate::schema::{SCHEMA_EXISTS, READ_SNAPSHOT, TABLE_EXISTS};

/// PostgreSQL store backed by a sqlx connection pool.
///
/// The pool is created once and shared; every [`Batch`] runs in its own
/// transaction on one pooled connection.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

fn pool_options(config: &DatabaseConfig) -> PgPoolOptions {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .max_lifetime(Some(config.max_lifetime()))
        .idle_timeout(Some(config.idle_timeout()))
        .acquire_timeout(config.acquire_timeout())
}

fn db_error(context: &str) -> impl Fn(sqlx::Error) -> CmsError + '_ {
    move |e| CmsError::database(format!("{}: {}", context, e))
}

/// Bind parameters: scalars as nullable text, arrays as nullable text arrays.
/// Placeholders carry the cast to the target type.
fn bind_params<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    params: &[SqlValue],
) -> Query<'q, Postgres, PgArguments> {
    for param in params {
        query = match param {
            SqlValue::Array(items) => {
                query.bind(items.iter().map(SqlValue::to_sql_text).collect::<Vec<Option<String>>>())
            }
            other => query.bind(other.to_sql_text()),
        };
    }
    query
}

/// Rows per `CopyData` message of a `COPY ... FROM STDIN`.
pub const COPY_CHUNK_ROWS: usize = 500;

/// Encode rows as CSV for `COPY ... (FORMAT csv)`: NULL is an unquoted
/// empty field, every value is quoted.
pub fn encode_csv(rows: &[Vec<SqlValue>]) -> Vec<u8> {
    let mut out = String::new();
    for row in rows {
        let line = row
            .iter()
            .map(|value| match value.to_sql_text() {
                None => String::new(),
                Some(text) => format!("\"{}\"", text.replace('"', "\"\"")),
            })
            .collect::<Vec<_>>()
            .join(",");
        out.push_str(&line);
        out.push('\n');
    }
    out.into_bytes()
}

impl PgStore {
    /// Connect eagerly; fails if the first connection cannot be opened.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = pool_options(config)
            .connect(&config.url)
            .await
            .map_err(db_error("Failed to connect"))?;
        info!(max_connections = config.max_connections, "Database pool opened");
        Ok(Self { pool })
    }

    /// Create the pool without connecting. Connection failures surface on
    /// the acquire that hit them; later acquires try again.
    pub fn connect_lazy(config: &DatabaseConfig) -> Result<Self> {
        let pool = pool_options(config)
            .connect_lazy(&config.url)
            .map_err(db_error("Invalid database configuration"))?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn apply(tx: &mut SqlxTransaction<'static, Postgres>, statement: &Statement) -> Result<()> {
        if let Statement::CopyIn { table, rows, .. } = statement {
            for rendered in statement.render() {
                let mut copy = tx
                    .copy_in_raw(&rendered.sql)
                    .await
                    .map_err(db_error("COPY failed to start"))?;
                for chunk in rows.chunks(COPY_CHUNK_ROWS) {
                    let sent = copy.send(encode_csv(chunk)).await.map(|_| ());
                    if let Err(e) = sent {
                        let _ = copy.abort(e.to_string()).await;
                        return Err(db_error("COPY failed")(e));
                    }
                }
                let copied = copy.finish().await.map_err(db_error("COPY failed"))?;
                debug!(table = %table, rows = copied, "Copied rows");
            }
            return Ok(());
        }

        for rendered in statement.render() {
            bind_params(sqlx::query(&rendered.sql), &rendered.params)
                .execute(&mut **tx)
                .await
                .map_err(|e| CmsError::database(format!("{} failed: {}", statement.kind(), e)))?;
        }
        Ok(())
    }
}

/// Transaction on one pooled connection; sqlx rolls back on drop.
struct PgTransaction {
    tx: SqlxTransaction<'static, Postgres>,
    batches: usize,
    start: Instant,
}

#[async_trait]
impl Transaction for PgTransaction {
    async fn execute(&mut self, batch: Batch) -> Result<()> {
        for statement in batch.iter() {
            PgStore::apply(&mut self.tx, statement).await?;
        }
        self.batches += 1;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let PgTransaction { tx, batches, start } = *self;
        tx.commit()
            .await
            .map_err(db_error("Failed to commit transaction"))?;
        debug!(
            batches = batches,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Transaction committed"
        );
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx
            .rollback()
            .await
            .map_err(db_error("Failed to roll back transaction"))
    }
}

#[async_trait]
impl Database for PgStore {
    async fn execute(&self, batch: Batch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let start = Instant::now();
        let statements = batch.len();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(db_error("Failed to begin transaction"))?;

        for statement in batch.iter() {
            Self::apply(&mut tx, statement).await?;
        }

        tx.commit()
            .await
            .map_err(db_error("Failed to commit transaction"))?;

        debug!(
            statements = statements,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Batch committed"
        );
        Ok(())
    }

    async fn begin<'a>(&'a self) -> Result<Box<dyn Transaction + 'a>> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(db_error("Failed to begin transaction"))?;
        Ok(Box::new(PgTransaction {
            tx,
            batches: 0,
            start: Instant::now(),
        }))
    }

    async fn call(&self, call: &ProcedureCall) -> Result<QueryPage> {
        let count_sql = call.render_count();
        let items_sql = call.render_items();

        // Both statements read the same snapshot.
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(db_error("Failed to begin transaction"))?;
        sqlx::query(READ_SNAPSHOT)
            .execute(&mut *tx)
            .await
            .map_err(db_error("Failed to set isolation"))?;

        let count: i64 = bind_params(sqlx::query(&count_sql.sql), &count_sql.params)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_error("Count query failed"))?
            .try_get(0)
            .map_err(db_error("Count query failed"))?;

        let items: Value = bind_params(sqlx::query(&items_sql.sql), &items_sql.params)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_error("Items query failed"))?
            .try_get(0)
            .map_err(db_error("Items query failed"))?;

        tx.commit().await.map_err(db_error("Failed to end read"))?;

        Ok(QueryPage {
            count: count.max(0) as u64,
            items,
        })
    }

    async fn load_sync_token(&self, schema: &Ident) -> Result<Option<String>> {
        let table = format!("{}.\"{}\"", schema.quoted(), SYNC_TOKEN_TABLE);
        let exists: bool = sqlx::query(TABLE_EXISTS)
            .bind(&table)
            .fetch_one(&self.pool)
            .await
            .map_err(db_error("Failed to look up sync token table"))?
            .try_get(0)
            .map_err(db_error("Failed to look up sync token table"))?;
        if !exists {
            return Ok(None);
        }

        let row = sqlx::query(&format!("SELECT \"token\" FROM {} WHERE \"id\" = 0", table))
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("Failed to load sync token"))?;
        match row {
            Some(row) => Ok(Some(
                row.try_get::<String, _>(0)
                    .map_err(db_error("Failed to load sync token"))?,
            )),
            None => Ok(None),
        }
    }

    async fn schema_exists(&self, schema: &Ident) -> Result<bool> {
        sqlx::query(SCHEMA_EXISTS)
            .bind(schema.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(db_error("Failed to look up schema"))?
            .try_get(0)
            .map_err(db_error("Failed to look up schema"))
    }

    async fn close(&self) {
        self.pool.close().await;
        info!("Database pool closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_csv() {
        let rows = vec![
            vec![
                SqlValue::text("p1_en-US"),
                SqlValue::Null,
                SqlValue::text(""),
                SqlValue::text("say \"hi\", ok"),
            ],
            vec![
                SqlValue::Int(3),
                SqlValue::Array(vec![SqlValue::text("a"), SqlValue::text("b")]),
                SqlValue::Point { lon: 1.0, lat: 2.5 },
                SqlValue::Json(serde_json::json!({"k": "v"})),
            ],
        ];
        let csv = String::from_utf8(encode_csv(&rows)).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], "\"p1_en-US\",,\"\",\"say \"\"hi\"\", ok\"");
        assert_eq!(lines[1], "\"3\",\"{\"\"a\"\",\"\"b\"\"}\",\"(1,2.5)\",\"{\"\"k\"\":\"\"v\"\"}\"");
    }

    #[tokio::test]
    async fn test_connect_lazy_does_not_connect() {
        let config = DatabaseConfig {
            url: "postgres://nobody@127.0.0.1:1/none".to_string(),
            acquire_timeout_secs: 1,
            ..DatabaseConfig::default()
        };
        let store = PgStore::connect_lazy(&config).unwrap();
        assert!(store.schema_exists(&Ident::new("content").unwrap()).await.is_err());
        // A failed acquire does not poison the pool.
        assert!(store.schema_exists(&Ident::new("content").unwrap()).await.is_err());
        store.close().await;
    }
}
