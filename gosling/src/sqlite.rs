//! SQLite support via the [`rusqlite`](https://crates.io/crates/rusqlite) crate.
//!
//! SQLite supports transactional DDL, so a failed transactional migration leaves no trace.
//! Transactions are opened with `BEGIN IMMEDIATE` so that two processes racing for the
//! same file serialize on the write lock instead of failing at commit time.
//!
//! Session locks do not exist in SQLite; use [crate::lock::TableLocker] when several
//! processes may migrate the same database file.

use crate::db::{Database, Row, Value};
use crate::error::Error;
use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::{params_from_iter, Connection, ToSql};

// Re-export rusqlite types for use in code migrations
pub use rusqlite::Connection as SqliteConnection;

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(rusqlite::types::Value::Null),
            Value::Int(v) => ToSqlOutput::from(*v),
            Value::Bool(v) => ToSqlOutput::from(*v),
            Value::Text(v) => ToSqlOutput::from(v.as_str()),
            Value::Timestamp(v) => ToSqlOutput::from(v.format("%Y-%m-%d %H:%M:%S").to_string()),
        })
    }
}

fn decode(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(v) => Value::Int(v),
        ValueRef::Real(v) => Value::Text(v.to_string()),
        ValueRef::Text(v) | ValueRef::Blob(v) => Value::Text(String::from_utf8_lossy(v).into_owned()),
    }
}

impl Database for Connection {
    fn exec(&mut self, sql: &str, params: &[Value]) -> Result<u64, Error> {
        let affected = Connection::execute(self, sql, params_from_iter(params.iter()))?;
        Ok(affected as u64)
    }

    fn exec_script(&mut self, sql: &str) -> Result<(), Error> {
        Connection::execute_batch(self, sql)?;
        Ok(())
    }

    fn fetch_all(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>, Error> {
        let mut stmt = self.prepare(sql)?;
        let columns = stmt.column_count();
        let mut rows = stmt.query(params_from_iter(params.iter()))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(columns);
            for i in 0..columns {
                values.push(decode(row.get_ref(i)?));
            }
            out.push(Row::new(values));
        }
        Ok(out)
    }

    fn begin(&mut self) -> Result<(), Error> {
        Connection::execute_batch(self, "BEGIN IMMEDIATE")?;
        Ok(())
    }

    fn commit(&mut self) -> Result<(), Error> {
        Connection::execute_batch(self, "COMMIT")?;
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), Error> {
        if self.is_autocommit() {
            return Ok(());
        }
        Connection::execute_batch(self, "ROLLBACK")?;
        Ok(())
    }
}
