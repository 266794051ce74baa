//! Persistence of applied versions in the version table.
//!
//! Every state transition inserts a new row: applying a version inserts
//! `is_applied = true`, rolling it back inserts `is_applied = false`. The most recent row
//! for a version (highest `id`) is authoritative, so the table doubles as an audit log.

use crate::context::Context;
use crate::db::{Database, Transaction, Value};
use crate::dialect::Dialect;
use crate::error::Error;
use chrono::{DateTime, Utc};

/// Default name of the version table.
pub const DEFAULT_TABLE_NAME: &str = "gosling_db_version";

/// One row of the version table.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct VersionRecord {
    pub version: i64,
    pub is_applied: bool,
    pub timestamp: DateTime<Utc>,
}

/// Reads and writes the version table of one dialect.
#[derive(Debug, Clone)]
pub struct VersionStore {
    dialect: Dialect,
    table: String,
}

impl VersionStore {
    pub fn new(dialect: Dialect, table: impl Into<String>) -> Self {
        Self {
            dialect,
            table: table.into(),
        }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn table_name(&self) -> &str {
        &self.table
    }

    pub fn table_exists(&self, ctx: &Context, db: &mut dyn Database) -> Result<bool, Error> {
        ctx.check()?;
        let (sql, params) = self.dialect.table_exists(&self.table);
        match db.fetch_optional(&sql, &params)? {
            Some(row) => row.get_bool(0),
            None => Ok(false),
        }
    }

    /// Creates the version table and inserts the baseline version 0 in one transaction.
    pub fn create_version_table(&self, ctx: &Context, db: &mut dyn Database) -> Result<(), Error> {
        ctx.check()?;
        #[cfg(feature = "tracing")]
        tracing::info!(table = %self.table, "Creating version table");

        let mut tx = Transaction::begin(db)?;
        tx.exec_script(&self.dialect.create_version_table(&self.table))?;
        tx.exec(
            &self.dialect.insert_version(&self.table),
            &[Value::Int(0), Value::Bool(true)],
        )?;
        tx.commit()
    }

    /// Creates the version table if it does not exist yet.
    /// Returns true when the table was created by this call.
    pub fn ensure_version_table(&self, ctx: &Context, db: &mut dyn Database) -> Result<bool, Error> {
        if self.table_exists(ctx, db)? {
            return Ok(false);
        }
        self.create_version_table(ctx, db)?;
        Ok(true)
    }

    pub fn insert_version(
        &self,
        ctx: &Context,
        db: &mut dyn Database,
        version: i64,
    ) -> Result<(), Error> {
        ctx.check()?;
        db.exec(
            &self.dialect.insert_version(&self.table),
            &[Value::Int(version), Value::Bool(true)],
        )?;
        Ok(())
    }

    /// Records a rollback of `version`.
    pub fn delete_version(
        &self,
        ctx: &Context,
        db: &mut dyn Database,
        version: i64,
    ) -> Result<(), Error> {
        ctx.check()?;
        db.exec(
            &self.dialect.insert_version(&self.table),
            &[Value::Int(version), Value::Bool(false)],
        )?;
        Ok(())
    }

    /// The most recent record for `version`, `None` when it was never recorded.
    pub fn get_migration(
        &self,
        ctx: &Context,
        db: &mut dyn Database,
        version: i64,
    ) -> Result<Option<VersionRecord>, Error> {
        ctx.check()?;
        db.fetch_optional(&self.dialect.get_migration(&self.table), &[Value::Int(version)])?
            .map(|row| {
                Ok(VersionRecord {
                    version: row.get_i64(0)?,
                    is_applied: row.get_bool(1)?,
                    timestamp: row.get_timestamp(2)?,
                })
            })
            .transpose()
    }

    /// Every record, most recently inserted first.
    pub fn list_migrations(
        &self,
        ctx: &Context,
        db: &mut dyn Database,
    ) -> Result<Vec<VersionRecord>, Error> {
        ctx.check()?;
        db.fetch_all(&self.dialect.list_migrations(&self.table), &[])?
            .into_iter()
            .map(|row| {
                Ok(VersionRecord {
                    version: row.get_i64(0)?,
                    is_applied: row.get_bool(1)?,
                    timestamp: row.get_timestamp(2)?,
                })
            })
            .collect()
    }

    /// The highest applied version, `None` when the table holds no applied rows.
    pub fn get_latest_version(
        &self,
        ctx: &Context,
        db: &mut dyn Database,
    ) -> Result<Option<i64>, Error> {
        ctx.check()?;
        match db.fetch_optional(&self.dialect.get_latest_version(&self.table), &[])? {
            Some(row) => row.get_opt_i64(0),
            None => Ok(None),
        }
    }

    /// Currently applied versions (excluding the baseline 0), most recently applied first.
    pub fn applied_versions(
        &self,
        ctx: &Context,
        db: &mut dyn Database,
    ) -> Result<Vec<VersionRecord>, Error> {
        let mut seen = std::collections::HashSet::new();
        Ok(self
            .list_migrations(ctx, db)?
            .into_iter()
            .filter(|record| seen.insert(record.version))
            .filter(|record| record.is_applied && record.version != 0)
            .collect())
    }
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use super::*;
    use rusqlite::Connection;

    fn setup() -> (Context, Connection, VersionStore) {
        let ctx = Context::new();
        let mut conn = Connection::open_in_memory().unwrap();
        let store = VersionStore::new(Dialect::Sqlite, DEFAULT_TABLE_NAME);
        store.create_version_table(&ctx, &mut conn).unwrap();
        (ctx, conn, store)
    }

    #[test]
    fn created_table_starts_at_version_zero() {
        let (ctx, mut conn, store) = setup();
        assert!(store.table_exists(&ctx, &mut conn).unwrap());
        assert_eq!(store.get_latest_version(&ctx, &mut conn).unwrap(), Some(0));
        assert!(store.applied_versions(&ctx, &mut conn).unwrap().is_empty());
    }

    #[test]
    fn missing_table_is_reported_as_absent() {
        let ctx = Context::new();
        let mut conn = Connection::open_in_memory().unwrap();
        let store = VersionStore::new(Dialect::Sqlite, DEFAULT_TABLE_NAME);
        assert!(!store.table_exists(&ctx, &mut conn).unwrap());
        assert!(store.ensure_version_table(&ctx, &mut conn).unwrap());
        assert!(!store.ensure_version_table(&ctx, &mut conn).unwrap());
    }

    #[test]
    fn empty_table_has_no_latest_version() {
        let ctx = Context::new();
        let mut conn = Connection::open_in_memory().unwrap();
        let store = VersionStore::new(Dialect::Sqlite, "versions");
        conn.exec_script(&Dialect::Sqlite.create_version_table("versions"))
            .unwrap();
        assert_eq!(store.get_latest_version(&ctx, &mut conn).unwrap(), None);
    }

    #[test]
    fn latest_version_follows_rollbacks() {
        let (ctx, mut conn, store) = setup();
        for version in 1..=5 {
            store.insert_version(&ctx, &mut conn, version).unwrap();
        }
        assert_eq!(store.get_latest_version(&ctx, &mut conn).unwrap(), Some(5));

        for version in [5, 4, 3] {
            store.delete_version(&ctx, &mut conn, version).unwrap();
        }
        assert_eq!(store.get_latest_version(&ctx, &mut conn).unwrap(), Some(2));

        let record = store.get_migration(&ctx, &mut conn, 4).unwrap().unwrap();
        assert!(!record.is_applied);
        assert!(store.get_migration(&ctx, &mut conn, 42).unwrap().is_none());

        let applied: Vec<i64> = store
            .applied_versions(&ctx, &mut conn)
            .unwrap()
            .iter()
            .map(|r| r.version)
            .collect();
        assert_eq!(applied, vec![2, 1]);
    }

    #[test]
    fn list_is_newest_first() {
        let (ctx, mut conn, store) = setup();
        store.insert_version(&ctx, &mut conn, 1).unwrap();
        store.insert_version(&ctx, &mut conn, 2).unwrap();
        let versions: Vec<i64> = store
            .list_migrations(&ctx, &mut conn)
            .unwrap()
            .iter()
            .map(|r| r.version)
            .collect();
        assert_eq!(versions, vec![2, 1, 0]);
    }
}
