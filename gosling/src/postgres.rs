//! PostgreSQL support via the synchronous [`postgres`](https://crates.io/crates/postgres) crate.
//!
//! PostgreSQL fully supports transactional DDL. The following operations cannot be rolled
//! back even in PostgreSQL and must be placed in a `-- +goose NO TRANSACTION` migration:
//! - `CREATE DATABASE` / `DROP DATABASE`
//! - `CREATE INDEX CONCURRENTLY`
//! - `ALTER TYPE ... ADD VALUE` on older servers
//!
//! Session locks use `pg_try_advisory_lock`, see [crate::lock::SessionLocker].

use crate::db::{Database, Row, Value};
use crate::error::Error;
use bytes::BytesMut;
use chrono::{NaiveDateTime, Utc};
use postgres::types::{to_sql_checked, IsNull, ToSql, Type};
use postgres::Client;
use std::error::Error as StdError;

// Re-export postgres types for use in code migrations
pub use postgres::Client as PostgresClient;

impl ToSql for Value {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn StdError + Sync + Send>> {
        match self {
            Value::Null => Ok(IsNull::Yes),
            Value::Int(v) => match *ty {
                Type::INT2 => (*v as i16).to_sql(ty, out),
                Type::INT4 => (*v as i32).to_sql(ty, out),
                Type::BOOL => (*v != 0).to_sql(ty, out),
                _ => v.to_sql(ty, out),
            },
            Value::Bool(v) => v.to_sql(ty, out),
            Value::Text(v) => v.to_sql(ty, out),
            Value::Timestamp(v) => match *ty {
                Type::TIMESTAMP => v.naive_utc().to_sql(ty, out),
                _ => v.to_sql(ty, out),
            },
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

fn decode(row: &postgres::Row, i: usize) -> Result<Value, Error> {
    let ty = row.columns()[i].type_().clone();
    let value = match ty {
        Type::BOOL => row.try_get::<_, Option<bool>>(i)?.map(Value::Bool),
        Type::INT2 => row
            .try_get::<_, Option<i16>>(i)?
            .map(|v| Value::Int(v as i64)),
        Type::INT4 => row
            .try_get::<_, Option<i32>>(i)?
            .map(|v| Value::Int(v as i64)),
        Type::INT8 => row.try_get::<_, Option<i64>>(i)?.map(Value::Int),
        Type::TIMESTAMP => row
            .try_get::<_, Option<NaiveDateTime>>(i)?
            .map(|v| Value::Timestamp(v.and_utc())),
        Type::TIMESTAMPTZ => row
            .try_get::<_, Option<chrono::DateTime<Utc>>>(i)?
            .map(Value::Timestamp),
        Type::TEXT | Type::VARCHAR | Type::NAME | Type::BPCHAR => {
            row.try_get::<_, Option<String>>(i)?.map(Value::Text)
        }
        other => {
            return Err(Error::Decode {
                column: i,
                reason: format!("unsupported column type {}", other),
            })
        }
    };
    Ok(value.unwrap_or(Value::Null))
}

fn bind(params: &[Value]) -> Vec<&(dyn ToSql + Sync)> {
    params.iter().map(|p| p as &(dyn ToSql + Sync)).collect()
}

impl Database for Client {
    fn exec(&mut self, sql: &str, params: &[Value]) -> Result<u64, Error> {
        Ok(Client::execute(self, sql, &bind(params))?)
    }

    fn exec_script(&mut self, sql: &str) -> Result<(), Error> {
        Client::batch_execute(self, sql)?;
        Ok(())
    }

    fn fetch_all(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>, Error> {
        let rows = Client::query(self, sql, &bind(params))?;
        rows.iter()
            .map(|row| {
                (0..row.len())
                    .map(|i| decode(row, i))
                    .collect::<Result<Vec<_>, _>>()
                    .map(Row::new)
            })
            .collect()
    }

    fn begin(&mut self) -> Result<(), Error> {
        Client::batch_execute(self, "BEGIN")?;
        Ok(())
    }

    fn commit(&mut self) -> Result<(), Error> {
        Client::batch_execute(self, "COMMIT")?;
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), Error> {
        Client::batch_execute(self, "ROLLBACK")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::dialect::Dialect;
    use crate::lock::{Locker, SessionLocker, TableLocker};
    use crate::provider::Provider;
    use crate::result::State;
    use crate::source::{Collector, Directory};
    use crate::test_postgres::{connect, fresh_postgres_db, get_test_client};
    use std::path::Path;
    use std::time::Duration;

    fn write_migrations(dir: &Path) {
        std::fs::write(
            dir.join("00001_create_users.sql"),
            "-- +goose Up
CREATE TABLE users (id BIGSERIAL PRIMARY KEY, username TEXT NOT NULL);

-- +goose Down
DROP TABLE users;
",
        )
        .unwrap();
        std::fs::write(
            dir.join("00002_seed_users.sql"),
            "-- +goose Up
-- +goose StatementBegin
DO $$
BEGIN
    INSERT INTO users (username) VALUES ('alice');
    INSERT INTO users (username) VALUES ('bob');
END $$;
-- +goose StatementEnd

-- +goose Down
DELETE FROM users;
",
        )
        .unwrap();
        std::fs::write(
            dir.join("00003_index_users.sql"),
            "-- +goose NO TRANSACTION
-- +goose Up
CREATE INDEX CONCURRENTLY users_username ON users (username);

-- +goose Down
DROP INDEX CONCURRENTLY users_username;
",
        )
        .unwrap();
    }

    fn provider_for(dir: &Path) -> Provider {
        let catalog = Collector::new()
            .with_fs(Directory::new(dir))
            .collect()
            .unwrap();
        Provider::new(Dialect::Postgres, catalog)
    }

    fn users_table_exists(client: &mut Client) -> bool {
        let row = client
            .fetch_optional("SELECT to_regclass('public.users') IS NOT NULL", &[])
            .unwrap()
            .unwrap();
        row.get_bool(0).unwrap()
    }

    #[test]
    fn values_round_trip_through_client() {
        let mut client = get_test_client();
        let rows = client
            .fetch_all(
                "SELECT $1::BIGINT, $2::TEXT, $3::BOOLEAN, NULL::TEXT, $4::INT4",
                &[Value::Int(42), Value::from("hello"), Value::Bool(true), Value::Int(7)],
            )
            .unwrap();
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.get_i64(0).unwrap(), 42);
        assert_eq!(row.get_string(1).unwrap(), "hello");
        assert!(row.get_bool(2).unwrap());
        assert!(row.is_null(3).unwrap());
        assert_eq!(row.get_i64(4).unwrap(), 7);
    }

    #[test]
    fn up_and_down_against_postgres() {
        let dir = tempfile::tempdir().unwrap();
        write_migrations(dir.path());
        let provider = provider_for(dir.path());
        let ctx = Context::new();
        let mut client = get_test_client();

        let results = provider.up(&ctx, &mut client).unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(provider.get_db_version(&ctx, &mut client).unwrap(), 3);
        let count = client
            .fetch_optional("SELECT COUNT(*) FROM users", &[])
            .unwrap()
            .unwrap()
            .get_i64(0)
            .unwrap();
        assert_eq!(count, 2);

        let status = provider.status(&ctx, &mut client).unwrap();
        assert!(status.iter().all(|s| s.state == State::Applied && s.applied_at.is_some()));

        let results = provider.down_to(&ctx, &mut client, 0).unwrap();
        assert_eq!(results.len(), 3);
        assert!(!users_table_exists(&mut client));
        assert_eq!(provider.get_db_version(&ctx, &mut client).unwrap(), 0);
    }

    #[test]
    fn failed_transactional_migration_rolls_back_ddl() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("00001_broken.sql"),
            "-- +goose Up
CREATE TABLE users (id BIGINT);
INSERT INTO missing_table VALUES (1);
",
        )
        .unwrap();
        let provider = provider_for(dir.path());
        let ctx = Context::new();
        let mut client = get_test_client();

        let err = provider.up(&ctx, &mut client).unwrap_err();
        let partial = err.as_partial().unwrap();
        assert!(partial.applied.is_empty());
        assert_eq!(partial.failed.source.version, 1);
        assert!(!users_table_exists(&mut client));
        assert_eq!(provider.get_db_version(&ctx, &mut client).unwrap(), 0);
    }

    #[test]
    fn session_lock_excludes_other_sessions() {
        let db = fresh_postgres_db();
        let ctx = Context::new();
        let mut first = connect(&db);
        let mut second = connect(&db);

        let holder = SessionLocker::try_new(Dialect::Postgres).unwrap();
        let waiter = SessionLocker::try_new(Dialect::Postgres)
            .unwrap()
            .with_lock_retry(Duration::from_millis(20), 3)
            .with_unlock_retry(Duration::from_millis(20), 1);

        holder.lock(&ctx, &mut first).unwrap();
        assert!(matches!(
            waiter.lock(&ctx, &mut second),
            Err(crate::Error::LockTimeout(_))
        ));
        assert!(matches!(
            waiter.unlock(&ctx, &mut second),
            Err(crate::Error::Unlock(_))
        ));

        holder.unlock(&ctx, &mut first).unwrap();
        waiter.lock(&ctx, &mut second).unwrap();
        waiter.unlock(&ctx, &mut second).unwrap();
    }

    #[test]
    fn provider_with_session_locker_applies_migrations() {
        let dir = tempfile::tempdir().unwrap();
        write_migrations(dir.path());
        let provider = provider_for(dir.path())
            .with_locker(SessionLocker::try_new(Dialect::Postgres).unwrap());
        let ctx = Context::new();
        let mut client = get_test_client();

        assert_eq!(provider.up(&ctx, &mut client).unwrap().len(), 3);
        // The lock was released, so it can be taken again on this session.
        assert_eq!(provider.down(&ctx, &mut client).unwrap().unwrap().source.version, 3);
    }

    #[test]
    fn table_lock_on_postgres() {
        let db = fresh_postgres_db();
        let ctx = Context::new();
        let mut unused = connect(&db);

        let first = TableLocker::new(Dialect::Postgres, connect(&db))
            .with_retry_interval(Duration::from_millis(20))
            .with_lock_timeout(Duration::from_millis(300));
        let second = TableLocker::new(Dialect::Postgres, connect(&db))
            .with_retry_interval(Duration::from_millis(20))
            .with_lock_timeout(Duration::from_millis(300));

        first.lock(&ctx, &mut unused).unwrap();
        assert!(matches!(
            second.lock(&ctx, &mut unused),
            Err(crate::Error::LockTimeout(_))
        ));
        first.unlock(&ctx, &mut unused).unwrap();
        second.lock(&ctx, &mut unused).unwrap();
        second.unlock(&ctx, &mut unused).unwrap();
    }
}
