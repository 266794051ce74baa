//! The generic database handle used by the store, the lockers and code migrations.
//!
//! [Database] is implemented for the driver connections enabled by crate features
//! (`rusqlite::Connection`, `postgres::Client`, `mysql::Conn`), for an open
//! [Transaction], and for the context-checking wrapper handed to code migrations.
//! Anything that can run SQL can therefore be used interchangeably.

use crate::context::Context;
use crate::error::Error;
use chrono::{DateTime, NaiveDateTime, Utc};

/// A bind parameter or a decoded column value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int(i64),
    Bool(bool),
    Text(String),
    Timestamp(DateTime<Utc>),
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

/// One result row, decoded into driver-independent [Value]s.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    values: Vec<Value>,
}

impl Row {
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn get(&self, column: usize) -> Result<&Value, Error> {
        self.values.get(column).ok_or_else(|| Error::Decode {
            column,
            reason: format!("row has only {} columns", self.values.len()),
        })
    }

    pub fn is_null(&self, column: usize) -> Result<bool, Error> {
        Ok(matches!(self.get(column)?, Value::Null))
    }

    pub fn get_i64(&self, column: usize) -> Result<i64, Error> {
        match self.get(column)? {
            Value::Int(v) => Ok(*v),
            Value::Bool(v) => Ok(*v as i64),
            Value::Text(v) => v.trim().parse().map_err(|_| Error::Decode {
                column,
                reason: format!("expected an integer, found {:?}", v),
            }),
            other => Err(Error::Decode {
                column,
                reason: format!("expected an integer, found {:?}", other),
            }),
        }
    }

    pub fn get_opt_i64(&self, column: usize) -> Result<Option<i64>, Error> {
        if self.is_null(column)? {
            return Ok(None);
        }
        self.get_i64(column).map(Some)
    }

    /// Booleans arrive as integers from SQLite and MySQL.
    pub fn get_bool(&self, column: usize) -> Result<bool, Error> {
        match self.get(column)? {
            Value::Bool(v) => Ok(*v),
            Value::Int(v) => Ok(*v != 0),
            Value::Text(v) => match v.as_str() {
                "1" | "t" | "true" | "TRUE" => Ok(true),
                "0" | "f" | "false" | "FALSE" => Ok(false),
                _ => Err(Error::Decode {
                    column,
                    reason: format!("expected a boolean, found {:?}", v),
                }),
            },
            other => Err(Error::Decode {
                column,
                reason: format!("expected a boolean, found {:?}", other),
            }),
        }
    }

    pub fn get_string(&self, column: usize) -> Result<String, Error> {
        match self.get(column)? {
            Value::Text(v) => Ok(v.clone()),
            Value::Int(v) => Ok(v.to_string()),
            Value::Bool(v) => Ok(v.to_string()),
            Value::Timestamp(v) => Ok(v.to_rfc3339()),
            Value::Null => Err(Error::Decode {
                column,
                reason: "expected a string, found NULL".to_string(),
            }),
        }
    }

    /// SQLite stores timestamps as text, either `YYYY-MM-DD HH:MM:SS` or RFC 3339.
    pub fn get_timestamp(&self, column: usize) -> Result<DateTime<Utc>, Error> {
        match self.get(column)? {
            Value::Timestamp(v) => Ok(*v),
            Value::Text(v) => parse_timestamp(v).ok_or_else(|| Error::Decode {
                column,
                reason: format!("expected a timestamp, found {:?}", v),
            }),
            other => Err(Error::Decode {
                column,
                reason: format!("expected a timestamp, found {:?}", other),
            }),
        }
    }
}

fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// A handle capable of running SQL: a connection, a transaction, or a wrapper around either.
pub trait Database {
    /// Execute one parameterised statement, returning the number of affected rows.
    fn exec(&mut self, sql: &str, params: &[Value]) -> Result<u64, Error>;

    /// Execute raw SQL text without parameters. The text may carry comments.
    fn exec_script(&mut self, sql: &str) -> Result<(), Error>;

    /// Run a query and decode every row.
    fn fetch_all(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>, Error>;

    /// Run a query and decode the first row, if any.
    fn fetch_optional(&mut self, sql: &str, params: &[Value]) -> Result<Option<Row>, Error> {
        Ok(self.fetch_all(sql, params)?.into_iter().next())
    }

    fn begin(&mut self) -> Result<(), Error> {
        self.exec_script("BEGIN")
    }

    fn commit(&mut self) -> Result<(), Error> {
        self.exec_script("COMMIT")
    }

    fn rollback(&mut self) -> Result<(), Error> {
        self.exec_script("ROLLBACK")
    }
}

impl<D: Database + ?Sized> Database for Box<D> {
    fn exec(&mut self, sql: &str, params: &[Value]) -> Result<u64, Error> {
        (**self).exec(sql, params)
    }

    fn exec_script(&mut self, sql: &str) -> Result<(), Error> {
        (**self).exec_script(sql)
    }

    fn fetch_all(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>, Error> {
        (**self).fetch_all(sql, params)
    }

    fn fetch_optional(&mut self, sql: &str, params: &[Value]) -> Result<Option<Row>, Error> {
        (**self).fetch_optional(sql, params)
    }

    fn begin(&mut self) -> Result<(), Error> {
        (**self).begin()
    }

    fn commit(&mut self) -> Result<(), Error> {
        (**self).commit()
    }

    fn rollback(&mut self) -> Result<(), Error> {
        (**self).rollback()
    }
}

/// An open transaction on a borrowed [Database].
///
/// Dropping the guard without calling [Transaction::commit] rolls the transaction back,
/// so an early return through `?` never leaves a transaction open.
pub struct Transaction<'c> {
    conn: &'c mut dyn Database,
    finished: bool,
}

impl<'c> Transaction<'c> {
    pub fn begin(conn: &'c mut dyn Database) -> Result<Self, Error> {
        conn.begin()?;
        Ok(Self {
            conn,
            finished: false,
        })
    }

    pub fn commit(mut self) -> Result<(), Error> {
        self.finished = true;
        self.conn.commit()
    }

    pub fn rollback(mut self) -> Result<(), Error> {
        self.finished = true;
        self.conn.rollback()
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(_err) = self.conn.rollback() {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %_err, "Failed to roll back transaction");
            }
        }
    }
}

impl Database for Transaction<'_> {
    fn exec(&mut self, sql: &str, params: &[Value]) -> Result<u64, Error> {
        self.conn.exec(sql, params)
    }

    fn exec_script(&mut self, sql: &str) -> Result<(), Error> {
        self.conn.exec_script(sql)
    }

    fn fetch_all(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>, Error> {
        self.conn.fetch_all(sql, params)
    }

    fn fetch_optional(&mut self, sql: &str, params: &[Value]) -> Result<Option<Row>, Error> {
        self.conn.fetch_optional(sql, params)
    }

    fn begin(&mut self) -> Result<(), Error> {
        Err(Error::Generic(
            "a transaction is already open on this handle".to_string(),
        ))
    }

    fn commit(&mut self) -> Result<(), Error> {
        Err(Error::Generic(
            "commit the Transaction guard instead of the handle".to_string(),
        ))
    }

    fn rollback(&mut self) -> Result<(), Error> {
        Err(Error::Generic(
            "roll back the Transaction guard instead of the handle".to_string(),
        ))
    }
}

/// Wraps a handle so every call first checks a [Context].
///
/// Code migrations receive their handle through this wrapper, which is how the caller's
/// cancellation reaches the SQL a user function runs.
pub struct ContextDatabase<'a> {
    ctx: &'a Context,
    inner: &'a mut dyn Database,
}

impl<'a> ContextDatabase<'a> {
    pub fn new(ctx: &'a Context, inner: &'a mut dyn Database) -> Self {
        Self { ctx, inner }
    }

    pub fn context(&self) -> &Context {
        self.ctx
    }
}

impl Database for ContextDatabase<'_> {
    fn exec(&mut self, sql: &str, params: &[Value]) -> Result<u64, Error> {
        self.ctx.check()?;
        self.inner.exec(sql, params)
    }

    fn exec_script(&mut self, sql: &str) -> Result<(), Error> {
        self.ctx.check()?;
        self.inner.exec_script(sql)
    }

    fn fetch_all(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>, Error> {
        self.ctx.check()?;
        self.inner.fetch_all(sql, params)
    }

    fn fetch_optional(&mut self, sql: &str, params: &[Value]) -> Result<Option<Row>, Error> {
        self.ctx.check()?;
        self.inner.fetch_optional(sql, params)
    }

    fn begin(&mut self) -> Result<(), Error> {
        self.ctx.check()?;
        self.inner.begin()
    }

    fn commit(&mut self) -> Result<(), Error> {
        self.ctx.check()?;
        self.inner.commit()
    }

    // Rolling back must still work after cancellation.
    fn rollback(&mut self) -> Result<(), Error> {
        self.inner.rollback()
    }
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use super::*;
    use rusqlite::Connection;

    fn count(conn: &mut dyn Database) -> i64 {
        conn.fetch_optional("SELECT COUNT(*) FROM t", &[])
            .unwrap()
            .unwrap()
            .get_i64(0)
            .unwrap()
    }

    #[test]
    fn dropped_transaction_rolls_back() {
        let mut conn = Connection::open_in_memory().unwrap();
        let db: &mut dyn Database = &mut conn;
        db.exec_script("CREATE TABLE t (id INTEGER)").unwrap();
        {
            let mut tx = Transaction::begin(db).unwrap();
            tx.exec("INSERT INTO t (id) VALUES (?1)", &[Value::Int(1)])
                .unwrap();
        }
        assert_eq!(count(db), 0);

        let mut tx = Transaction::begin(db).unwrap();
        tx.exec("INSERT INTO t (id) VALUES (?1)", &[Value::Int(1)])
            .unwrap();
        tx.commit().unwrap();
        assert_eq!(count(db), 1);
    }

    #[test]
    fn context_database_refuses_work_after_cancel() {
        let mut conn = Connection::open_in_memory().unwrap();
        let ctx = Context::new();
        let mut db = ContextDatabase::new(&ctx, &mut conn);
        db.exec_script("CREATE TABLE t (id INTEGER)").unwrap();
        ctx.cancel();
        let err = db.exec("INSERT INTO t (id) VALUES (1)", &[]).unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[test]
    fn row_getters_coerce_engine_representations() {
        let row = Row::new(vec![
            Value::Int(1),
            Value::Text("2024-01-02 03:04:05".to_string()),
            Value::Null,
            Value::Text("42".to_string()),
        ]);
        assert!(row.get_bool(0).unwrap());
        assert_eq!(
            row.get_timestamp(1).unwrap().to_rfc3339(),
            "2024-01-02T03:04:05+00:00"
        );
        assert_eq!(row.get_opt_i64(2).unwrap(), None);
        assert_eq!(row.get_i64(3).unwrap(), 42);
        assert!(matches!(row.get(9), Err(Error::Decode { column: 9, .. })));
    }
}
