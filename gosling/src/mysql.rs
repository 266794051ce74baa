//!
//! # MySQL support
//!
//! MySQL commits implicitly around most DDL statements, so a transactional migration that
//! fails halfway through its DDL may leave part of its schema changes behind. The version
//! row is still only written when every statement succeeded.
//!
//! Session locks use `GET_LOCK` / `RELEASE_LOCK`, see [crate::lock::SessionLocker].

use crate::db::{Database, Row, Value};
use crate::error::Error;
use chrono::{Datelike, NaiveDate, Timelike};
use mysql::prelude::*;
use mysql::{Conn, Params};

// Re-export mysql types for use in code migrations
pub use mysql::Conn as MysqlConn;

fn to_mysql(value: &Value) -> mysql::Value {
    match value {
        Value::Null => mysql::Value::NULL,
        Value::Int(v) => mysql::Value::Int(*v),
        Value::Bool(v) => mysql::Value::Int(*v as i64),
        Value::Text(v) => mysql::Value::Bytes(v.clone().into_bytes()),
        Value::Timestamp(v) => mysql::Value::Date(
            v.year() as u16,
            v.month() as u8,
            v.day() as u8,
            v.hour() as u8,
            v.minute() as u8,
            v.second() as u8,
            v.timestamp_subsec_micros(),
        ),
    }
}

fn from_mysql(column: usize, value: mysql::Value) -> Result<Value, Error> {
    Ok(match value {
        mysql::Value::NULL => Value::Null,
        mysql::Value::Int(v) => Value::Int(v),
        mysql::Value::UInt(v) => Value::Int(i64::try_from(v).map_err(|_| Error::Decode {
            column,
            reason: format!("unsigned value {} overflows i64", v),
        })?),
        mysql::Value::Float(v) => Value::Text(v.to_string()),
        mysql::Value::Double(v) => Value::Text(v.to_string()),
        mysql::Value::Bytes(v) => Value::Text(String::from_utf8_lossy(&v).into_owned()),
        mysql::Value::Date(y, mo, d, h, mi, s, us) => {
            let ts = NaiveDate::from_ymd_opt(y as i32, mo as u32, d as u32)
                .and_then(|date| date.and_hms_micro_opt(h as u32, mi as u32, s as u32, us))
                .ok_or_else(|| Error::Decode {
                    column,
                    reason: "invalid DATETIME value".to_string(),
                })?;
            Value::Timestamp(ts.and_utc())
        }
        mysql::Value::Time(..) => {
            return Err(Error::Decode {
                column,
                reason: "TIME columns are not supported".to_string(),
            })
        }
    })
}

fn bind(params: &[Value]) -> Params {
    if params.is_empty() {
        Params::Empty
    } else {
        Params::Positional(params.iter().map(to_mysql).collect())
    }
}

fn decode_rows(rows: Vec<mysql::Row>) -> Result<Vec<Row>, Error> {
    rows.into_iter()
        .map(|row| {
            row.unwrap()
                .into_iter()
                .enumerate()
                .map(|(i, v)| from_mysql(i, v))
                .collect::<Result<Vec<_>, _>>()
                .map(Row::new)
        })
        .collect()
}

impl Database for Conn {
    fn exec(&mut self, sql: &str, params: &[Value]) -> Result<u64, Error> {
        if params.is_empty() {
            Queryable::query_drop(self, sql)?;
        } else {
            Queryable::exec_drop(self, sql, bind(params))?;
        }
        Ok(self.affected_rows())
    }

    fn exec_script(&mut self, sql: &str) -> Result<(), Error> {
        Queryable::query_drop(self, sql)?;
        Ok(())
    }

    fn fetch_all(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>, Error> {
        let rows: Vec<mysql::Row> = if params.is_empty() {
            Queryable::query(self, sql)?
        } else {
            Queryable::exec(self, sql, bind(params))?
        };
        decode_rows(rows)
    }

    fn begin(&mut self) -> Result<(), Error> {
        Queryable::query_drop(self, "START TRANSACTION")?;
        Ok(())
    }

    fn commit(&mut self) -> Result<(), Error> {
        Queryable::query_drop(self, "COMMIT")?;
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), Error> {
        Queryable::query_drop(self, "ROLLBACK")?;
        Ok(())
    }
}
