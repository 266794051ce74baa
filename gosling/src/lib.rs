#![cfg_attr(docsrs, feature(doc_cfg))]
//! `gosling` is a library for versioned database migrations written as annotated SQL
//! files or as Rust functions.
//!
//! Core concepts:
//! - Every migration has a positive integer version, taken from its file name prefix
//!   (`00001_create_users.sql`) or given when registering a code migration.
//! - Applied versions are recorded in a version table (`gosling_db_version` by default).
//!   Rollbacks insert a new row rather than deleting history.
//! - A [Provider] plans and runs migrations against anything that implements [Database].
//!
//! # SQL migrations
//!
//! ```sql
//! -- +goose Up
//! CREATE TABLE users (id INTEGER PRIMARY KEY, username TEXT);
//!
//! -- +goose Down
//! DROP TABLE users;
//! ```
//!
//! See [sqlparser] for the full annotation grammar, including `StatementBegin`/`StatementEnd`
//! blocks and `NO TRANSACTION`.
//!
//! # Code migrations
//!
//! Rust functions are added to an explicit [Registry] which is passed to the [Collector]
//! together with the migration directory.
//!
//! # Out-of-order migrations
//!
//! A version lower than the highest applied version that was never applied is "missing".
//! By default [Provider::up] refuses to run while any are missing; with
//! [Provider::with_allow_missing] they are applied first, in ascending order.
//!
//! # Locking
//!
//! Concurrent deployments coordinate through a [Locker]: [SessionLocker] uses database
//! advisory locks, [TableLocker] a lease row with a heartbeat.
//!
//! # Database support
//!
//! - [`SQLite`](sqlite) - available with the `sqlite` feature flag (default).
//! - [`PostgreSQL`](postgres) - available with the `postgres` feature flag.
//! - [`MySQL`](mysql) - available with the `mysql` feature flag.
//!
//! Migration files can be compiled into the binary with the `embed` feature, and
//! [tracing](https://crates.io/crates/tracing) integration is available with the `tracing`
//! feature flag (default).

mod context;
pub use context::Context;

mod create;
pub use create::{create, snake_case, TIMESTAMP_FORMAT};

mod db;
pub use db::{ContextDatabase, Database, Row, Transaction, Value};

mod dialect;
pub use dialect::Dialect;

mod error;
pub use error::Error;

mod fix;
pub use fix::{fix, is_timestamp, Renamed};

mod lock;
pub use lock::{Locker, SessionLocker, TableLocker, DEFAULT_LOCK_ID, DEFAULT_LOCK_TABLE};

mod provider;
pub use provider::{total_duration, Provider};

mod registry;
pub use registry::{CodeFn, CodeFunc, CodeMigration, MigrationContextFn, MigrationFn, Registry};

mod resolve;
pub use resolve::{missing_versions, resolve};

mod result;
pub use result::{Direction, MigrationResult, MigrationStatus, PartialError, State};

mod source;
#[cfg(feature = "embed")]
pub use source::Embedded;
pub use source::{
    parse_version, Catalog, Collector, Directory, Migration, MigrationFs, Source, SourceKind,
};

pub mod sqlparser;
pub use sqlparser::ParsedSql;

mod store;
pub use store::{VersionRecord, VersionStore, DEFAULT_TABLE_NAME};

mod validate;
pub use validate::validate;

#[cfg(feature = "sqlite")]
#[cfg_attr(docsrs, doc(cfg(feature = "sqlite")))]
pub mod sqlite;

#[cfg(feature = "mysql")]
#[cfg_attr(docsrs, doc(cfg(feature = "mysql")))]
pub mod mysql;

#[cfg(feature = "postgres")]
#[cfg_attr(docsrs, doc(cfg(feature = "postgres")))]
pub mod postgres;

#[cfg(all(test, feature = "postgres"))]
pub(crate) mod test_postgres;
