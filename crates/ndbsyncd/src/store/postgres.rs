//! Client/server backend on PostgreSQL
//!
//! The store is driven synchronously from the dispatch thread and caller
//! threads, so the sqlx pool runs on a private current-thread tokio
//! runtime and every call blocks on it.

use super::{Backend, Statement};
use super::schema::Dialect;
use crate::error::{NdbError, Result};
use crate::types::{Record, Value};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Column, Row, TypeInfo, ValueRef};
use tokio::runtime::{Builder, Runtime};
use tracing::debug;

pub struct PostgresBackend {
    runtime: Runtime,
    pool: Option<PgPool>,
}

impl PostgresBackend {
    /// Connect to `url` with a single-connection pool
    pub fn open(url: &str) -> Result<Self> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        let pool = runtime.block_on(PgPoolOptions::new().max_connections(1).connect(url))?;
        debug!("Connected to postgres store");
        Ok(Self {
            runtime,
            pool: Some(pool),
        })
    }

    fn pool(&self) -> Result<&PgPool> {
        self.pool.as_ref().ok_or(NdbError::Closed)
    }
}

impl Backend for PostgresBackend {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<usize> {
        let pool = self.pool()?;
        let (sql, binds) = rewrite_placeholders(sql, params);
        let done = self.runtime.block_on(async {
            let mut query = sqlx::query(&sql);
            for value in &binds {
                query = match value {
                    Value::Integer(i) => query.bind(*i),
                    Value::Real(r) => query.bind(*r),
                    Value::Text(s) => query.bind(s.as_str()),
                    Value::Null => query,
                };
            }
            query.execute(pool).await
        })?;
        Ok(usize::try_from(done.rows_affected()).unwrap_or(usize::MAX))
    }

    fn execute_batch(&mut self, sql: &str) -> Result<()> {
        let pool = self.pool()?;
        self.runtime.block_on(sqlx::raw_sql(sql).execute(pool))?;
        Ok(())
    }

    fn execute_atomic(&mut self, statements: &[Statement]) -> Result<()> {
        let pool = self.pool()?;
        let rewritten: Vec<(String, Vec<Value>)> = statements
            .iter()
            .map(|(sql, params)| rewrite_placeholders(sql, params))
            .collect();
        self.runtime.block_on(async {
            let mut tx = pool.begin().await?;
            for (sql, binds) in &rewritten {
                let mut query = sqlx::query(sql);
                for value in binds {
                    query = match value {
                        Value::Integer(i) => query.bind(*i),
                        Value::Real(r) => query.bind(*r),
                        Value::Text(s) => query.bind(s.as_str()),
                        Value::Null => query,
                    };
                }
                query.execute(&mut *tx).await?;
            }
            tx.commit().await
        })?;
        Ok(())
    }

    fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Record>> {
        let pool = self.pool()?;
        let (sql, binds) = rewrite_placeholders(sql, params);
        let rows = self.runtime.block_on(async {
            let mut query = sqlx::query(&sql);
            for value in &binds {
                query = match value {
                    Value::Integer(i) => query.bind(*i),
                    Value::Real(r) => query.bind(*r),
                    Value::Text(s) => query.bind(s.as_str()),
                    Value::Null => query,
                };
            }
            query.fetch_all(pool).await
        })?;
        rows.iter().map(decode_row).collect()
    }

    fn commit(&mut self) -> Result<()> {
        // Statements run in autocommit mode
        self.pool().map(|_| ())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(pool) = self.pool.take() {
            self.runtime.block_on(pool.close());
        }
        Ok(())
    }
}

fn decode_row(row: &PgRow) -> Result<Record> {
    let mut record = Vec::with_capacity(row.len());
    for (i, column) in row.columns().iter().enumerate() {
        if row.try_get_raw(i)?.is_null() {
            record.push(Value::Null);
            continue;
        }
        let value = match column.type_info().name() {
            "INT2" => Value::Integer(i64::from(row.try_get::<i16, _>(i)?)),
            "INT4" => Value::Integer(i64::from(row.try_get::<i32, _>(i)?)),
            "INT8" => Value::Integer(row.try_get::<i64, _>(i)?),
            "BOOL" => Value::from(row.try_get::<bool, _>(i)?),
            "FLOAT4" => Value::Real(f64::from(row.try_get::<f32, _>(i)?)),
            "FLOAT8" => Value::Real(row.try_get::<f64, _>(i)?),
            _ => Value::Text(row.try_get::<String, _>(i)?),
        };
        record.push(value);
    }
    Ok(record)
}

/// Rewrite `?` placeholders to `$n`, inlining `NULL` parameters
///
/// Inlined nulls avoid binding an untyped parameter. Question marks inside
/// single-quoted literals are left alone.
fn rewrite_placeholders(sql: &str, params: &[Value]) -> (String, Vec<Value>) {
    let mut out = String::with_capacity(sql.len() + params.len() * 2);
    let mut binds = Vec::with_capacity(params.len());
    let mut args = params.iter();
    let mut quoted = false;
    for ch in sql.chars() {
        match ch {
            '\'' => {
                quoted = !quoted;
                out.push(ch);
            }
            '?' if !quoted => match args.next() {
                Some(Value::Null) | None => out.push_str("NULL"),
                Some(value) => {
                    binds.push(value.clone());
                    out.push_str(&format!("${}", binds.len()));
                }
            },
            _ => out.push(ch),
        }
    }
    (out, binds)
}
