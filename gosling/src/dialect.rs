//! Dialect-specific SQL text.
//!
//! Everything that differs between database engines lives here as plain string
//! producers, so the store, the lockers and the provider stay dialect-agnostic.

use crate::db::Value;
use crate::error::Error;
use std::fmt;
use std::str::FromStr;

/// A supported database engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    Sqlite,
    Postgres,
    Mysql,
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Dialect::Sqlite => "sqlite",
            Dialect::Postgres => "postgres",
            Dialect::Mysql => "mysql",
        })
    }
}

impl FromStr for Dialect {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sqlite" | "sqlite3" => Ok(Dialect::Sqlite),
            "postgres" | "postgresql" | "pgx" | "pg" => Ok(Dialect::Postgres),
            "mysql" => Ok(Dialect::Mysql),
            other => Err(Error::Generic(format!(
                "unknown dialect {:?}, expected one of: sqlite, postgres, mysql",
                other
            ))),
        }
    }
}

/// Splits `schema.table` into its parts.
fn split_table(table: &str) -> (Option<&str>, &str) {
    match table.split_once('.') {
        Some((schema, name)) => (Some(schema), name),
        None => (None, table),
    }
}

impl Dialect {
    /// The placeholder for the `n`th (1-based) bind parameter.
    pub fn placeholder(&self, n: usize) -> String {
        match self {
            Dialect::Postgres => format!("${}", n),
            Dialect::Sqlite => format!("?{}", n),
            Dialect::Mysql => "?".to_string(),
        }
    }

    /// Whether the engine offers session-scoped advisory locks.
    pub fn supports_session_locks(&self) -> bool {
        !matches!(self, Dialect::Sqlite)
    }

    pub fn create_version_table(&self, table: &str) -> String {
        match self {
            Dialect::Sqlite => format!(
                "CREATE TABLE {table} (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    version_id INTEGER NOT NULL,
                    is_applied INTEGER NOT NULL,
                    tstamp TIMESTAMP DEFAULT (datetime('now'))
                )"
            ),
            Dialect::Postgres => format!(
                "CREATE TABLE {table} (
                    id integer PRIMARY KEY GENERATED BY DEFAULT AS IDENTITY,
                    version_id bigint NOT NULL,
                    is_applied boolean NOT NULL,
                    tstamp timestamp NOT NULL DEFAULT now()
                )"
            ),
            Dialect::Mysql => format!(
                "CREATE TABLE {table} (
                    id serial NOT NULL,
                    version_id bigint NOT NULL,
                    is_applied boolean NOT NULL,
                    tstamp timestamp NULL DEFAULT now(),
                    PRIMARY KEY(id)
                )"
            ),
        }
    }

    /// Params: version_id, is_applied.
    pub fn insert_version(&self, table: &str) -> String {
        format!(
            "INSERT INTO {table} (version_id, is_applied) VALUES ({}, {})",
            self.placeholder(1),
            self.placeholder(2)
        )
    }

    /// Latest row for one version. Params: version_id.
    pub fn get_migration(&self, table: &str) -> String {
        format!(
            "SELECT version_id, is_applied, tstamp FROM {table} WHERE version_id = {} ORDER BY id DESC LIMIT 1",
            self.placeholder(1)
        )
    }

    pub fn list_migrations(&self, table: &str) -> String {
        format!("SELECT version_id, is_applied, tstamp FROM {table} ORDER BY id DESC")
    }

    /// Highest version whose most recent row is marked applied.
    pub fn get_latest_version(&self, table: &str) -> String {
        format!(
            "SELECT MAX(t1.version_id) FROM {table} t1
             WHERE t1.is_applied = TRUE
               AND t1.id = (SELECT MAX(t2.id) FROM {table} t2 WHERE t2.version_id = t1.version_id)"
        )
    }

    /// Query returning a single boolean-ish column.
    pub fn table_exists(&self, table: &str) -> (String, Vec<Value>) {
        let (schema, name) = split_table(table);
        match (self, schema) {
            (Dialect::Sqlite, _) => (
                "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type = 'table' AND name = ?1"
                    .to_string(),
                vec![Value::from(name)],
            ),
            (Dialect::Postgres, Some(schema)) => (
                "SELECT EXISTS (SELECT 1 FROM pg_tables WHERE schemaname = $1 AND tablename = $2)"
                    .to_string(),
                vec![Value::from(schema), Value::from(name)],
            ),
            (Dialect::Postgres, None) => (
                "SELECT EXISTS (SELECT 1 FROM pg_tables WHERE (current_schema() IS NULL OR schemaname = current_schema()) AND tablename = $1)"
                    .to_string(),
                vec![Value::from(name)],
            ),
            (Dialect::Mysql, Some(schema)) => (
                "SELECT EXISTS (SELECT 1 FROM information_schema.tables WHERE table_schema = ? AND table_name = ?)"
                    .to_string(),
                vec![Value::from(schema), Value::from(name)],
            ),
            (Dialect::Mysql, None) => (
                "SELECT EXISTS (SELECT 1 FROM information_schema.tables WHERE table_schema = DATABASE() AND table_name = ?)"
                    .to_string(),
                vec![Value::from(name)],
            ),
        }
    }

    pub fn create_lock_table(&self, table: &str) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                lock_id BIGINT NOT NULL PRIMARY KEY,
                locked BOOLEAN NOT NULL DEFAULT FALSE,
                locked_at BIGINT NULL,
                locked_by VARCHAR(255) NULL,
                lease_expires_at BIGINT NULL,
                updated_at BIGINT NULL
            )"
        )
    }

    /// Params: lock_id.
    pub fn insert_lock_row(&self, table: &str) -> String {
        match self {
            Dialect::Sqlite => {
                format!("INSERT OR IGNORE INTO {table} (lock_id, locked) VALUES (?1, FALSE)")
            }
            Dialect::Postgres => format!(
                "INSERT INTO {table} (lock_id, locked) VALUES ($1, FALSE) ON CONFLICT (lock_id) DO NOTHING"
            ),
            Dialect::Mysql => {
                format!("INSERT IGNORE INTO {table} (lock_id, locked) VALUES (?, FALSE)")
            }
        }
    }

    /// Claims the row if it is free or its lease expired.
    /// Params: now, locked_by, lease_expires_at, now, lock_id, now.
    pub fn acquire_lock(&self, table: &str) -> String {
        let p = |n| self.placeholder(n);
        format!(
            "UPDATE {table} SET locked = TRUE, locked_at = {}, locked_by = {}, lease_expires_at = {}, updated_at = {}
             WHERE lock_id = {} AND (locked = FALSE OR lease_expires_at IS NULL OR lease_expires_at < {})",
            p(1),
            p(2),
            p(3),
            p(4),
            p(5),
            p(6)
        )
    }

    /// Params: lease_expires_at, now, lock_id, locked_by.
    pub fn heartbeat_lock(&self, table: &str) -> String {
        format!(
            "UPDATE {table} SET lease_expires_at = {}, updated_at = {} WHERE lock_id = {} AND locked = TRUE AND locked_by = {}",
            self.placeholder(1),
            self.placeholder(2),
            self.placeholder(3),
            self.placeholder(4)
        )
    }

    /// Params: now, lock_id, locked_by.
    pub fn release_lock(&self, table: &str) -> String {
        format!(
            "UPDATE {table} SET locked = FALSE, locked_at = NULL, locked_by = NULL, lease_expires_at = NULL, updated_at = {}
             WHERE lock_id = {} AND locked = TRUE AND locked_by = {}",
            self.placeholder(1),
            self.placeholder(2),
            self.placeholder(3)
        )
    }

    /// Non-blocking session lock attempt, returning a single truthy column on success.
    pub fn session_try_lock(&self) -> Option<&'static str> {
        match self {
            Dialect::Postgres => Some("SELECT pg_try_advisory_lock($1)"),
            Dialect::Mysql => Some("SELECT COALESCE(GET_LOCK(?, 0), 0)"),
            Dialect::Sqlite => None,
        }
    }

    /// Session unlock, returning a single truthy column when the lock was held by this session.
    pub fn session_unlock(&self) -> Option<&'static str> {
        match self {
            Dialect::Postgres => Some("SELECT pg_advisory_unlock($1)"),
            Dialect::Mysql => Some("SELECT COALESCE(RELEASE_LOCK(?), 0)"),
            Dialect::Sqlite => None,
        }
    }

    /// The bind value identifying `lock_id` for session lock statements.
    pub fn session_lock_key(&self, lock_id: i64) -> Value {
        match self {
            Dialect::Mysql => Value::Text(format!("gosling_{}", lock_id)),
            _ => Value::Int(lock_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_driver_aliases() {
        assert_eq!("sqlite3".parse::<Dialect>().unwrap(), Dialect::Sqlite);
        assert_eq!("pgx".parse::<Dialect>().unwrap(), Dialect::Postgres);
        assert_eq!("MySQL".parse::<Dialect>().unwrap(), Dialect::Mysql);
        assert!("oracle".parse::<Dialect>().is_err());
    }

    #[test]
    fn placeholders_follow_engine_syntax() {
        assert_eq!(
            Dialect::Postgres.insert_version("v"),
            "INSERT INTO v (version_id, is_applied) VALUES ($1, $2)"
        );
        assert_eq!(
            Dialect::Mysql.insert_version("v"),
            "INSERT INTO v (version_id, is_applied) VALUES (?, ?)"
        );
    }

    #[test]
    fn acquire_lock_binds_every_parameter_once() {
        let sql = Dialect::Mysql.acquire_lock("l");
        assert_eq!(sql.matches('?').count(), 6);
        let sql = Dialect::Postgres.acquire_lock("l");
        assert!(sql.contains("lease_expires_at < $6"));
    }

    #[test]
    fn schema_qualified_table_exists_uses_both_parts() {
        let (sql, params) = Dialect::Postgres.table_exists("audit.versions");
        assert!(sql.contains("schemaname = $1"));
        assert_eq!(
            params,
            vec![Value::from("audit"), Value::from("versions")]
        );
    }

    #[test]
    fn sqlite_has_no_session_locks() {
        assert!(Dialect::Sqlite.session_try_lock().is_none());
        assert!(!Dialect::Sqlite.supports_session_locks());
    }
}
