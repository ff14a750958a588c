//! PostgreSQL target store
//!
//! Rows travel as JSON: inserts go through `jsonb_populate_recordset` so the
//! database performs all column type conversions (numeric strings, ISO
//! timestamps, enums), and selects come back as `to_jsonb(row)`.
//! Table and column names are validated identifiers and always quoted.

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, instrument};

use super::{Filter, Projection, Selected, TargetStore};
use crate::error::TargetError;
use crate::model::{Row, TargetId};

/// SQLSTATE codes worth retrying: serialization failure, deadlock, too many
/// connections, cannot connect now, lock not available
const TRANSIENT_SQLSTATES: &[&str] = &["40001", "40P01", "53300", "57P03", "55P03"];

static IDENTIFIER: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();

/// Double-quote a table or column name after checking it is a plain
/// identifier
fn quote_ident(name: &str) -> Result<String, TargetError> {
    let pattern = IDENTIFIER
        .get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$"))
        .as_ref()
        .map_err(|e| TargetError::Other(format!("identifier pattern: {e}")))?;
    if pattern.is_match(name) {
        Ok(format!("\"{name}\""))
    } else {
        Err(TargetError::Other(format!("invalid identifier: {name:?}")))
    }
}

/// Map a sqlx error onto the transient / constraint / other taxonomy
pub fn classify(table: &str, err: sqlx::Error) -> TargetError {
    match &err {
        sqlx::Error::Database(db) => {
            let code = db.code().map(|c| c.to_string()).unwrap_or_default();
            if code.starts_with("23") {
                TargetError::constraint(table, db.message())
            } else if TRANSIENT_SQLSTATES.contains(&code.as_str()) {
                TargetError::Transient(format!("{code}: {}", db.message()))
            } else {
                TargetError::Other(format!("{code}: {}", db.message()))
            }
        },
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => TargetError::Transient(err.to_string()),
        _ => TargetError::Other(err.to_string()),
    }
}

/// Target store backed by a PostgreSQL connection pool
#[derive(Debug, Clone)]
pub struct PgTargetStore {
    pool: PgPool,
}

impl PgTargetStore {
    /// Connect with a bounded pool
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, TargetError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .connect(database_url)
            .await
            .map_err(|e| classify("<connect>", e))?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &Filter) -> Result<(), TargetError> {
    match filter {
        Filter::All => {
            qb.push("TRUE");
        },
        Filter::Eq { column, value } => {
            qb.push(quote_ident(column)?).push("::text = ").push_bind(value.clone());
        },
        Filter::In { column, values } => {
            qb.push(quote_ident(column)?)
                .push("::text = ANY(")
                .push_bind(values.clone())
                .push(")");
        },
        Filter::Since { column, at } => {
            qb.push(quote_ident(column)?).push(" >= ").push_bind(*at);
        },
        Filter::And(filters) => {
            if filters.is_empty() {
                qb.push("TRUE");
            }
            for (i, f) in filters.iter().enumerate() {
                if i > 0 {
                    qb.push(" AND ");
                }
                qb.push("(");
                push_filter(qb, f)?;
                qb.push(")");
            }
        },
    }
    Ok(())
}

#[async_trait]
impl TargetStore for PgTargetStore {
    #[instrument(skip(self, rows), fields(rows = rows.len()))]
    async fn insert_batch(&self, table: &str, rows: &[Row]) -> Result<Vec<Row>, TargetError> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let quoted_table = quote_ident(table)?;

        let mut columns: Vec<&str> = Vec::new();
        for row in rows {
            for key in row.keys() {
                if !columns.contains(&key.as_str()) {
                    columns.push(key);
                }
            }
        }
        let column_list = columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Result<Vec<_>, _>>()?
            .join(", ");

        let sql = format!(
            "WITH inserted AS (\
                INSERT INTO {quoted_table} ({column_list}) \
                SELECT {column_list} FROM jsonb_populate_recordset(NULL::{quoted_table}, $1) \
                RETURNING *\
             ) SELECT to_jsonb(inserted) AS row FROM inserted"
        );
        let payload = Value::Array(rows.iter().cloned().map(Value::Object).collect());

        let returned: Vec<Json<Row>> = sqlx::query_scalar(&sql)
            .bind(Json(payload))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| classify(table, e))?;

        debug!(table, inserted = returned.len(), "Batch inserted");
        Ok(returned.into_iter().map(|Json(row)| row).collect())
    }

    #[instrument(skip(self, ids), fields(ids = ids.len()))]
    async fn delete_where(&self, table: &str, ids: &[TargetId]) -> Result<u64, TargetError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let sql = format!("DELETE FROM {} WHERE id::text = ANY($1)", quote_ident(table)?);
        let ids: Vec<String> = ids.iter().map(|id| id.as_str().to_string()).collect();

        let result = sqlx::query(&sql)
            .bind(ids)
            .execute(&self.pool)
            .await
            .map_err(|e| classify(table, e))?;
        Ok(result.rows_affected())
    }

    async fn select_where(
        &self,
        table: &str,
        filter: &Filter,
        projection: &Projection,
    ) -> Result<Selected, TargetError> {
        let quoted_table = quote_ident(table)?;
        let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new("SELECT ");

        match projection {
            Projection::CountOnly => {
                qb.push("COUNT(*) FROM ").push(&quoted_table).push(" WHERE ");
                push_filter(&mut qb, filter)?;
                let count: i64 = qb
                    .build_query_scalar()
                    .fetch_one(&self.pool)
                    .await
                    .map_err(|e| classify(table, e))?;
                Ok(Selected::Count(u64::try_from(count).unwrap_or(0)))
            },
            Projection::Fields(columns) => {
                for column in columns {
                    quote_ident(column)?;
                }
                qb.push("to_jsonb(t) FROM ")
                    .push(&quoted_table)
                    .push(" AS t WHERE ");
                push_filter(&mut qb, filter)?;
                qb.push(" ORDER BY id");

                let rows: Vec<Json<Row>> = qb
                    .build_query_scalar()
                    .fetch_all(&self.pool)
                    .await
                    .map_err(|e| classify(table, e))?;
                Ok(Selected::Rows(
                    rows.into_iter()
                        .map(|Json(row)| {
                            columns
                                .iter()
                                .map(|c| (c.clone(), row.get(c).cloned().unwrap_or(Value::Null)))
                                .collect()
                        })
                        .collect(),
                ))
            },
        }
    }
}
