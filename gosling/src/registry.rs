//! Code migrations: Rust functions registered against a version number.
//!
//! A [Registry] is built explicitly and handed to the [crate::Collector]; there is no
//! process-wide state. Each migration has an optional up and down function and a
//! transaction mode shared by both directions.
//!
//! ```
//! use gosling::{Database, Error, Registry};
//!
//! fn up_add_users(db: &mut dyn Database) -> Result<(), Error> {
//!     db.exec_script("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)")
//! }
//!
//! fn down_add_users(db: &mut dyn Database) -> Result<(), Error> {
//!     db.exec_script("DROP TABLE users")
//! }
//!
//! let mut registry = Registry::new();
//! registry.add_tx(1, up_add_users, down_add_users).unwrap();
//! assert_eq!(registry.versions(), vec![1]);
//! ```

use crate::context::Context;
use crate::db::{ContextDatabase, Database};
use crate::error::Error;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::Location;
use std::sync::Arc;

pub type MigrationFn = Arc<dyn Fn(&mut dyn Database) -> Result<(), Error> + Send + Sync>;
pub type MigrationContextFn =
    Arc<dyn Fn(&Context, &mut dyn Database) -> Result<(), Error> + Send + Sync>;

/// A registered up or down function.
#[derive(Clone)]
pub enum CodeFn {
    Plain(MigrationFn),
    /// Receives the caller's [Context]; its SQL calls fail once the context is cancelled.
    WithContext(MigrationContextFn),
}

impl CodeFn {
    pub fn plain<F>(f: F) -> Self
    where
        F: Fn(&mut dyn Database) -> Result<(), Error> + Send + Sync + 'static,
    {
        CodeFn::Plain(Arc::new(f))
    }

    pub fn with_context<F>(f: F) -> Self
    where
        F: Fn(&Context, &mut dyn Database) -> Result<(), Error> + Send + Sync + 'static,
    {
        CodeFn::WithContext(Arc::new(f))
    }

    pub(crate) fn call(&self, ctx: &Context, db: &mut dyn Database) -> Result<(), Error> {
        ctx.check()?;
        match self {
            CodeFn::Plain(f) => f(db),
            CodeFn::WithContext(f) => f(ctx, &mut ContextDatabase::new(ctx, db)),
        }
    }
}

impl fmt::Debug for CodeFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CodeFn::Plain(_) => "CodeFn::Plain(<fn>)",
            CodeFn::WithContext(_) => "CodeFn::WithContext(<fn>)",
        })
    }
}

/// One direction of a code migration together with its transaction mode.
#[derive(Debug, Clone)]
pub struct CodeFunc {
    pub run: CodeFn,
    pub use_tx: bool,
}

/// A registered code migration.
#[derive(Debug, Clone)]
pub struct CodeMigration {
    pub version: i64,
    pub up: Option<CodeFunc>,
    pub down: Option<CodeFunc>,
    /// Where the migration was registered, for display.
    pub registered_at: String,
}

impl CodeMigration {
    #[track_caller]
    pub fn new(version: i64, up: Option<CodeFunc>, down: Option<CodeFunc>) -> Self {
        Self {
            version,
            up,
            down,
            registered_at: {
                let location = Location::caller();
                format!("{}:{}", location.file(), location.line())
            },
        }
    }

    /// The transaction mode of the migration. A migration with no functions runs in a transaction.
    pub fn use_tx(&self) -> bool {
        self.up
            .as_ref()
            .or(self.down.as_ref())
            .map_or(true, |f| f.use_tx)
    }

    fn validate(&self) -> Result<(), Error> {
        if self.version < 1 {
            return Err(Error::Registration {
                version: self.version,
                reason: "version must be greater than zero".to_string(),
            });
        }
        if let (Some(up), Some(down)) = (&self.up, &self.down) {
            if up.use_tx != down.use_tx {
                return Err(Error::Registration {
                    version: self.version,
                    reason: "up and down functions must use the same transaction mode".to_string(),
                });
            }
        }
        Ok(())
    }
}

/// An explicit collection of code migrations, keyed by version.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    migrations: BTreeMap<i64, CodeMigration>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fully built migration.
    pub fn add(&mut self, migration: CodeMigration) -> Result<&mut Self, Error> {
        migration.validate()?;
        if let Some(existing) = self.migrations.get(&migration.version) {
            return Err(Error::DuplicateVersion {
                version: migration.version,
                first: existing.registered_at.clone(),
                second: migration.registered_at,
            });
        }
        self.migrations.insert(migration.version, migration);
        Ok(self)
    }

    /// Register functions that run inside a transaction.
    #[track_caller]
    pub fn add_tx<U, D>(&mut self, version: i64, up: U, down: D) -> Result<&mut Self, Error>
    where
        U: Fn(&mut dyn Database) -> Result<(), Error> + Send + Sync + 'static,
        D: Fn(&mut dyn Database) -> Result<(), Error> + Send + Sync + 'static,
    {
        let migration = CodeMigration::new(
            version,
            Some(CodeFunc {
                run: CodeFn::plain(up),
                use_tx: true,
            }),
            Some(CodeFunc {
                run: CodeFn::plain(down),
                use_tx: true,
            }),
        );
        self.add(migration)
    }

    /// Register functions that run directly on the connection, without a transaction.
    #[track_caller]
    pub fn add_no_tx<U, D>(&mut self, version: i64, up: U, down: D) -> Result<&mut Self, Error>
    where
        U: Fn(&mut dyn Database) -> Result<(), Error> + Send + Sync + 'static,
        D: Fn(&mut dyn Database) -> Result<(), Error> + Send + Sync + 'static,
    {
        let migration = CodeMigration::new(
            version,
            Some(CodeFunc {
                run: CodeFn::plain(up),
                use_tx: false,
            }),
            Some(CodeFunc {
                run: CodeFn::plain(down),
                use_tx: false,
            }),
        );
        self.add(migration)
    }

    /// Like [Registry::add_tx], for functions that take the caller's [Context].
    #[track_caller]
    pub fn add_tx_context<U, D>(&mut self, version: i64, up: U, down: D) -> Result<&mut Self, Error>
    where
        U: Fn(&Context, &mut dyn Database) -> Result<(), Error> + Send + Sync + 'static,
        D: Fn(&Context, &mut dyn Database) -> Result<(), Error> + Send + Sync + 'static,
    {
        let migration = CodeMigration::new(
            version,
            Some(CodeFunc {
                run: CodeFn::with_context(up),
                use_tx: true,
            }),
            Some(CodeFunc {
                run: CodeFn::with_context(down),
                use_tx: true,
            }),
        );
        self.add(migration)
    }

    /// Like [Registry::add_no_tx], for functions that take the caller's [Context].
    #[track_caller]
    pub fn add_no_tx_context<U, D>(
        &mut self,
        version: i64,
        up: U,
        down: D,
    ) -> Result<&mut Self, Error>
    where
        U: Fn(&Context, &mut dyn Database) -> Result<(), Error> + Send + Sync + 'static,
        D: Fn(&Context, &mut dyn Database) -> Result<(), Error> + Send + Sync + 'static,
    {
        let migration = CodeMigration::new(
            version,
            Some(CodeFunc {
                run: CodeFn::with_context(up),
                use_tx: false,
            }),
            Some(CodeFunc {
                run: CodeFn::with_context(down),
                use_tx: false,
            }),
        );
        self.add(migration)
    }

    pub fn get(&self, version: i64) -> Option<&CodeMigration> {
        self.migrations.get(&version)
    }

    pub fn versions(&self) -> Vec<i64> {
        self.migrations.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CodeMigration> {
        self.migrations.values()
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }
}
