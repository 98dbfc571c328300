//! Embedded backend on SQLite

use super::{Backend, Statement};
use super::schema::Dialect;
use crate::error::{NdbError, Result};
use crate::types::{Record, Value};
use rusqlite::types::{FromSql, FromSqlResult, ToSqlOutput, ValueRef};
use rusqlite::{Connection, ToSql, params_from_iter};
use tracing::debug;

/// Connection spec selecting a private in-memory database
pub const MEMORY: &str = ":memory:";

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Borrowed(ValueRef::Null),
            Value::Integer(i) => ToSqlOutput::Borrowed(ValueRef::Integer(*i)),
            Value::Real(r) => ToSqlOutput::Borrowed(ValueRef::Real(*r)),
            Value::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
        })
    }
}

impl FromSql for Value {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        Ok(match value {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(i) => Value::Integer(i),
            ValueRef::Real(r) => Value::Real(r),
            ValueRef::Text(t) | ValueRef::Blob(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
        })
    }
}

/// rusqlite connection in autocommit mode
pub struct SqliteBackend {
    conn: Option<Connection>,
}

impl SqliteBackend {
    /// Open `spec`: [`MEMORY`] or a database file path
    pub fn open(spec: &str) -> Result<Self> {
        let conn = if spec == MEMORY {
            Connection::open_in_memory()?
        } else {
            Connection::open(spec)?
        };
        debug!(spec, "Opened sqlite store");
        Ok(Self { conn: Some(conn) })
    }

    fn conn(&self) -> Result<&Connection> {
        self.conn.as_ref().ok_or(NdbError::Closed)
    }
}

impl Backend for SqliteBackend {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<usize> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(sql)?;
        Ok(stmt.execute(params_from_iter(params.iter()))?)
    }

    fn execute_batch(&mut self, sql: &str) -> Result<()> {
        Ok(self.conn()?.execute_batch(sql)?)
    }

    fn execute_atomic(&mut self, statements: &[Statement]) -> Result<()> {
        let conn = self.conn.as_mut().ok_or(NdbError::Closed)?;
        // A savepoint also nests inside a transaction a caller has opened
        let sp = conn.savepoint()?;
        for (sql, params) in statements {
            sp.prepare_cached(sql)?
                .execute(params_from_iter(params.iter()))?;
        }
        sp.commit()?;
        Ok(())
    }

    fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Record>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(sql)?;
        let width = stmt.column_count();
        let mut rows = stmt.query(params_from_iter(params.iter()))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let record = (0..width)
                .map(|i| row.get::<_, Value>(i))
                .collect::<rusqlite::Result<Record>>()?;
            out.push(record);
        }
        Ok(out)
    }

    fn commit(&mut self) -> Result<()> {
        let conn = self.conn()?;
        if !conn.is_autocommit() {
            conn.execute_batch("COMMIT")?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(conn) = self.conn.take() {
            conn.close().map_err(|(_, e)| NdbError::Sqlite(e))?;
        }
        Ok(())
    }
}
