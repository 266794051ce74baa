//! The entrypoint for applying and rolling back a [Catalog] of migrations.
//!
//! ## Transaction Safety
//!
//! Each migration runs in its own transaction unless it opts out (`-- +goose NO TRANSACTION`
//! for SQL files, [crate::Registry::add_no_tx] for code). The version row is written in the
//! same transaction as the migration, so a failed transactional migration leaves neither
//! its changes nor a version record behind. A failed non-transactional migration keeps
//! whatever statements completed and is not recorded as applied.
//!
//! Transactions never span more than one migration: when migration N fails, migrations
//! 1..N-1 of the same batch stay applied and are reported through [crate::PartialError].
//!
//! ## Example
//!
//! ```
//! use gosling::{Collector, Context, Dialect, Provider, Registry};
//! use rusqlite::Connection;
//!
//! let mut registry = Registry::new();
//! registry
//!     .add_tx(
//!         1,
//!         |db| db.exec_script("CREATE TABLE users (id INTEGER PRIMARY KEY)"),
//!         |db| db.exec_script("DROP TABLE users"),
//!     )
//!     .unwrap();
//!
//! let catalog = Collector::new().with_registry(&registry).collect().unwrap();
//! let provider = Provider::try_new(Dialect::Sqlite, catalog).unwrap();
//!
//! let ctx = Context::new();
//! let mut conn = Connection::open_in_memory().unwrap();
//! let results = provider.up(&ctx, &mut conn).unwrap();
//! assert_eq!(results.len(), 1);
//! assert_eq!(provider.get_db_version(&ctx, &mut conn).unwrap(), 1);
//! ```

use crate::context::Context;
use crate::db::{Database, Transaction};
use crate::dialect::Dialect;
use crate::error::Error;
use crate::lock::Locker;
use crate::resolve::resolve;
use crate::result::{Direction, MigrationResult, MigrationStatus, PartialError, State};
use crate::source::{Catalog, Migration, Source};
use crate::store::{VersionStore, DEFAULT_TABLE_NAME};
use std::collections::HashMap;
use std::time::{Duration, Instant};

type StartHook = Box<dyn Fn(&Source, Direction) + Send + Sync>;
type CompleteHook = Box<dyn Fn(&MigrationResult) + Send + Sync>;
type ErrorHook = Box<dyn Fn(&Source, Direction, &Error) + Send + Sync>;

/// Applies and rolls back the migrations of one [Catalog] against a database.
///
/// Every mutating operation runs under the configured [Locker], if any, and the lock is
/// released before the operation returns, whether it succeeded or not.
pub struct Provider {
    catalog: Catalog,
    store: VersionStore,
    allow_missing: bool,
    locker: Option<Box<dyn Locker>>,
    on_migration_start: Option<StartHook>,
    on_migration_complete: Option<CompleteHook>,
    on_migration_error: Option<ErrorHook>,
}

impl std::fmt::Debug for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provider")
            .field("catalog", &self.catalog)
            .field("store", &self.store)
            .field("allow_missing", &self.allow_missing)
            .field("locker", &self.locker.is_some())
            .field(
                "on_migration_start",
                &self.on_migration_start.as_ref().map(|_| "<callback>"),
            )
            .field(
                "on_migration_complete",
                &self.on_migration_complete.as_ref().map(|_| "<callback>"),
            )
            .field(
                "on_migration_error",
                &self.on_migration_error.as_ref().map(|_| "<callback>"),
            )
            .finish()
    }
}

impl Provider {
    /// Create a new Provider. Returns [Error::NoMigrations] when the catalog is empty.
    pub fn try_new(dialect: Dialect, catalog: Catalog) -> Result<Self, Error> {
        if catalog.is_empty() {
            return Err(Error::NoMigrations);
        }
        Ok(Self {
            catalog,
            store: VersionStore::new(dialect, DEFAULT_TABLE_NAME),
            allow_missing: false,
            locker: None,
            on_migration_start: None,
            on_migration_complete: None,
            on_migration_error: None,
        })
    }

    /// Create a new Provider, panicking if the catalog is empty.
    /// For a non-panicking version, use `try_new`.
    pub fn new(dialect: Dialect, catalog: Catalog) -> Self {
        match Self::try_new(dialect, catalog) {
            Ok(provider) => provider,
            Err(err) => panic!("{}", err),
        }
    }

    /// Set a custom name for the version table.
    /// Defaults to "gosling_db_version".
    pub fn with_table_name(mut self, name: impl Into<String>) -> Self {
        self.store = VersionStore::new(self.store.dialect(), name);
        self
    }

    /// Apply versions lower than the current maximum that were never applied,
    /// instead of failing with [Error::MissingMigrations].
    pub fn with_allow_missing(mut self, allow_missing: bool) -> Self {
        self.allow_missing = allow_missing;
        self
    }

    pub fn with_locker(mut self, locker: impl Locker + 'static) -> Self {
        self.locker = Some(Box::new(locker));
        self
    }

    /// Set a callback to be invoked when a migration starts.
    pub fn on_migration_start<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Source, Direction) + Send + Sync + 'static,
    {
        self.on_migration_start = Some(Box::new(callback));
        self
    }

    /// Set a callback to be invoked when a migration completes successfully.
    pub fn on_migration_complete<F>(mut self, callback: F) -> Self
    where
        F: Fn(&MigrationResult) + Send + Sync + 'static,
    {
        self.on_migration_complete = Some(Box::new(callback));
        self
    }

    /// Set a callback to be invoked when a migration fails.
    pub fn on_migration_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Source, Direction, &Error) + Send + Sync + 'static,
    {
        self.on_migration_error = Some(Box::new(callback));
        self
    }

    pub fn dialect(&self) -> Dialect {
        self.store.dialect()
    }

    pub fn table_name(&self) -> &str {
        self.store.table_name()
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Every known migration source, ascending by version.
    pub fn list_sources(&self) -> Vec<Source> {
        self.catalog.sources()
    }

    /// Apply every pending migration.
    pub fn up(&self, ctx: &Context, db: &mut dyn Database) -> Result<Vec<MigrationResult>, Error> {
        self.up_to(ctx, db, i64::MAX)
    }

    /// Apply pending migrations up to and including `version`.
    /// A `version` of 0 applies nothing.
    pub fn up_to(
        &self,
        ctx: &Context,
        db: &mut dyn Database,
        version: i64,
    ) -> Result<Vec<MigrationResult>, Error> {
        if version < 0 {
            return Err(Error::Generic(format!(
                "invalid version {}: must not be negative",
                version
            )));
        }
        self.with_lock(ctx, db, |db| {
            let pending = self.pending(ctx, db, version)?;
            let plan = self.plan(&pending, Direction::Up)?;
            self.run_batch(ctx, db, &plan)
        })
    }

    /// Apply the next pending migration. Returns `None` when nothing is pending.
    pub fn up_by_one(
        &self,
        ctx: &Context,
        db: &mut dyn Database,
    ) -> Result<Option<MigrationResult>, Error> {
        self.with_lock(ctx, db, |db| {
            let pending = self.pending(ctx, db, i64::MAX)?;
            let Some(next) = pending.first() else {
                #[cfg(feature = "tracing")]
                tracing::info!("No pending migrations");
                return Ok(None);
            };
            let plan = self.plan(&[*next], Direction::Up)?;
            Ok(self.run_batch(ctx, db, &plan)?.pop())
        })
    }

    /// Roll back the most recently applied migration. Returns `None` when nothing is applied,
    /// and [Error::NoCurrentVersion] when that migration is no longer known.
    pub fn down(
        &self,
        ctx: &Context,
        db: &mut dyn Database,
    ) -> Result<Option<MigrationResult>, Error> {
        self.with_lock(ctx, db, |db| {
            self.store.ensure_version_table(ctx, db)?;
            let applied = self.store.applied_versions(ctx, db)?;
            let Some(latest) = applied.first() else {
                #[cfg(feature = "tracing")]
                tracing::info!("No applied migrations to roll back");
                return Ok(None);
            };
            let migration = self.catalog.current(latest.version)?;
            let plan = self.plan(&[migration.version()], Direction::Down)?;
            Ok(self.run_batch(ctx, db, &plan)?.pop())
        })
    }

    /// Roll back every applied migration above `version`, highest version first.
    /// A `version` of 0 rolls back everything.
    pub fn down_to(
        &self,
        ctx: &Context,
        db: &mut dyn Database,
        version: i64,
    ) -> Result<Vec<MigrationResult>, Error> {
        if version < 0 {
            return Err(Error::Generic(format!(
                "invalid version {}: must not be negative",
                version
            )));
        }
        self.with_lock(ctx, db, |db| {
            self.store.ensure_version_table(ctx, db)?;
            let mut rollback: Vec<i64> = self
                .store
                .applied_versions(ctx, db)?
                .iter()
                .map(|record| record.version)
                .filter(|v| *v > version)
                .collect();
            rollback.sort_unstable_by(|a, b| b.cmp(a));
            let plan = self.plan(&rollback, Direction::Down)?;
            self.run_batch(ctx, db, &plan)
        })
    }

    /// Roll back the most recently applied migration and apply it again.
    /// Returns both results, or nothing when no migration is applied.
    pub fn redo(&self, ctx: &Context, db: &mut dyn Database) -> Result<Vec<MigrationResult>, Error> {
        self.with_lock(ctx, db, |db| {
            self.store.ensure_version_table(ctx, db)?;
            let applied = self.store.applied_versions(ctx, db)?;
            let Some(latest) = applied.first() else {
                return Ok(Vec::new());
            };
            let migration = self.catalog.current(latest.version)?;
            migration.parsed_sql()?;
            self.run_batch(
                ctx,
                db,
                &[(migration, Direction::Down), (migration, Direction::Up)],
            )
        })
    }

    /// Apply or roll back exactly `version`, regardless of what else is applied.
    pub fn apply_version(
        &self,
        ctx: &Context,
        db: &mut dyn Database,
        version: i64,
        direction: Direction,
    ) -> Result<MigrationResult, Error> {
        let migration = self.lookup(version)?;
        self.with_lock(ctx, db, |db| {
            self.store.ensure_version_table(ctx, db)?;
            let applied = self
                .store
                .get_migration(ctx, db, version)?
                .map_or(false, |record| record.is_applied);
            match direction {
                Direction::Up if applied => return Err(Error::AlreadyApplied(version)),
                Direction::Down if !applied => return Err(Error::NotApplied(version)),
                _ => {}
            }
            let plan = self.plan(&[migration.version()], direction)?;
            self.run_batch(ctx, db, &plan)?
                .pop()
                .ok_or(Error::VersionNotFound(version))
        })
    }

    /// The current version of the database, creating the version table if needed.
    pub fn get_db_version(&self, ctx: &Context, db: &mut dyn Database) -> Result<i64, Error> {
        self.with_lock(ctx, db, |db| {
            self.store.ensure_version_table(ctx, db)?;
            Ok(self.store.get_latest_version(ctx, db)?.unwrap_or(0))
        })
    }

    /// The current database version and the highest known version. Does not create anything.
    pub fn get_versions(&self, ctx: &Context, db: &mut dyn Database) -> Result<(i64, i64), Error> {
        let target = self.catalog.last().map_or(0, Migration::version);
        if !self.store.table_exists(ctx, db)? {
            return Ok((0, target));
        }
        let current = self.store.get_latest_version(ctx, db)?.unwrap_or(0);
        Ok((current, target))
    }

    /// Whether [Provider::up] would apply anything. Does not create anything.
    pub fn has_pending(&self, ctx: &Context, db: &mut dyn Database) -> Result<bool, Error> {
        if !self.store.table_exists(ctx, db)? {
            return Ok(true);
        }
        if self.allow_missing {
            let applied: Vec<i64> = self
                .store
                .applied_versions(ctx, db)?
                .iter()
                .map(|record| record.version)
                .collect();
            return Ok(self.catalog.iter().any(|m| !applied.contains(&m.version())));
        }
        let (current, target) = self.get_versions(ctx, db)?;
        Ok(current < target)
    }

    /// The state of every known migration, ascending by version. Does not create anything.
    pub fn status(&self, ctx: &Context, db: &mut dyn Database) -> Result<Vec<MigrationStatus>, Error> {
        let mut latest = HashMap::new();
        if self.store.table_exists(ctx, db)? {
            for record in self.store.list_migrations(ctx, db)? {
                latest.entry(record.version).or_insert(record);
            }
        }
        Ok(self
            .catalog
            .iter()
            .map(|migration| {
                let record = latest
                    .get(&migration.version())
                    .filter(|record| record.is_applied);
                MigrationStatus {
                    source: migration.source().clone(),
                    state: if record.is_some() {
                        State::Applied
                    } else {
                        State::Pending
                    },
                    applied_at: record.map(|record| record.timestamp),
                }
            })
            .collect())
    }

    fn lookup(&self, version: i64) -> Result<&Migration, Error> {
        self.catalog
            .get(version)
            .ok_or(Error::VersionNotFound(version))
    }

    /// Versions to apply up to `target`. Creates the version table if needed.
    fn pending(&self, ctx: &Context, db: &mut dyn Database, target: i64) -> Result<Vec<i64>, Error> {
        self.store.ensure_version_table(ctx, db)?;
        let applied: Vec<i64> = self
            .store
            .applied_versions(ctx, db)?
            .iter()
            .map(|record| record.version)
            .collect();
        resolve(&self.catalog.versions(), &applied, target, self.allow_missing)
    }

    /// Looks up and parses every migration of a batch, so that a broken file fails the
    /// batch before anything runs.
    fn plan(&self, versions: &[i64], direction: Direction) -> Result<Vec<(&Migration, Direction)>, Error> {
        versions
            .iter()
            .map(|version| {
                let migration = self.lookup(*version)?;
                migration.parsed_sql()?;
                Ok((migration, direction))
            })
            .collect()
    }

    fn with_lock<T>(
        &self,
        ctx: &Context,
        db: &mut dyn Database,
        f: impl FnOnce(&mut dyn Database) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let Some(locker) = &self.locker else {
            return f(db);
        };
        locker.lock(ctx, &mut *db)?;
        let result = f(&mut *db);
        // Released even when the batch context was cancelled.
        let unlocked = locker.unlock(&Context::new(), db);
        match (result, unlocked) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(err)) => Err(err),
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(_unlock_err)) => {
                #[cfg(feature = "tracing")]
                tracing::error!(error = %_unlock_err, "Failed to release lock after failed batch");
                Err(err)
            }
        }
    }

    fn run_batch(
        &self,
        ctx: &Context,
        db: &mut dyn Database,
        plan: &[(&Migration, Direction)],
    ) -> Result<Vec<MigrationResult>, Error> {
        let mut applied: Vec<MigrationResult> = Vec::with_capacity(plan.len());

        for (migration, direction) in plan {
            let source = migration.source();
            #[cfg(feature = "tracing")]
            let _span = tracing::info_span!(
                "migration",
                version = source.version,
                direction = %direction,
                path = %source.path
            )
            .entered();

            #[cfg(feature = "tracing")]
            tracing::info!("Starting migration");

            if let Some(ref callback) = self.on_migration_start {
                callback(source, *direction);
            }

            let started = Instant::now();
            match self.run_migration(ctx, db, migration, *direction) {
                Ok(empty) => {
                    let result = MigrationResult {
                        source: source.clone(),
                        direction: *direction,
                        duration: started.elapsed(),
                        empty,
                    };

                    #[cfg(feature = "tracing")]
                    tracing::info!(duration_ms = result.duration.as_millis() as u64, empty, "Migration completed");

                    if let Some(ref callback) = self.on_migration_complete {
                        callback(&result);
                    }
                    applied.push(result);
                }
                Err(error) => {
                    #[cfg(feature = "tracing")]
                    tracing::error!(error = %error, "Migration failed");

                    if let Some(ref callback) = self.on_migration_error {
                        callback(source, *direction, &error);
                    }
                    return Err(PartialError {
                        applied,
                        failed: MigrationResult {
                            source: source.clone(),
                            direction: *direction,
                            duration: started.elapsed(),
                            empty: false,
                        },
                        source: error,
                    }
                    .into());
                }
            }
        }

        Ok(applied)
    }

    /// Runs one migration and records it. Returns true when it had nothing to run.
    fn run_migration(
        &self,
        ctx: &Context,
        db: &mut dyn Database,
        migration: &Migration,
        direction: Direction,
    ) -> Result<bool, Error> {
        ctx.check()?;
        let version = migration.version();

        if let Some(code) = migration.code_migration() {
            let func = match direction {
                Direction::Up => code.up.as_ref(),
                Direction::Down => code.down.as_ref(),
            };
            if code.use_tx() {
                let mut tx = Transaction::begin(db)?;
                if let Some(func) = func {
                    func.run.call(ctx, &mut tx)?;
                }
                self.record(ctx, &mut tx, version, direction)?;
                tx.commit()?;
            } else {
                if let Some(func) = func {
                    func.run.call(ctx, db)?;
                }
                self.record(ctx, db, version, direction)?;
            }
            return Ok(func.is_none());
        }

        let parsed = migration
            .parsed_sql()?
            .ok_or(Error::VersionNotFound(version))?;
        let statements = parsed.statements(direction);
        if parsed.use_tx {
            let mut tx = Transaction::begin(db)?;
            for statement in statements {
                ctx.check()?;
                tx.exec_script(statement)?;
            }
            self.record(ctx, &mut tx, version, direction)?;
            tx.commit()?;
        } else {
            for statement in statements {
                ctx.check()?;
                db.exec_script(statement)?;
            }
            self.record(ctx, db, version, direction)?;
        }
        Ok(statements.is_empty())
    }

    fn record(
        &self,
        ctx: &Context,
        db: &mut dyn Database,
        version: i64,
        direction: Direction,
    ) -> Result<(), Error> {
        match direction {
            Direction::Up => self.store.insert_version(ctx, db, version),
            Direction::Down => self.store.delete_version(ctx, db, version),
        }
    }
}

/// Total time spent by a batch.
pub fn total_duration(results: &[MigrationResult]) -> Duration {
    results.iter().map(|r| r.duration).sum()
}
