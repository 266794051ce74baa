use crate::result::PartialError;
use std::path::PathBuf;

/// Error type for the gosling crate.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[cfg(feature = "sqlite")]
    #[error("{0}")]
    Rusqlite(#[from] rusqlite::Error),
    #[cfg(feature = "postgres")]
    #[error("{0}")]
    Postgres(#[from] postgres::Error),
    #[cfg(feature = "mysql")]
    #[error("{0}")]
    Mysql(String),

    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Two sources claim the same version number.
    #[error("found duplicate migration version {version}:\n\tsource 1: {first}\n\tsource 2: {second}")]
    DuplicateVersion {
        version: i64,
        first: String,
        second: String,
    },

    #[error("{path}: {reason}")]
    InvalidFilename { path: String, reason: String },

    #[error("failed to parse SQL migration {path}: {message}")]
    SqlParse { path: String, message: String },

    #[error("found {count} unregistered code migration file{plural}: [{files}]", count = .0.len(), plural = plural(.0.len()), files = .0.join(", "))]
    Unregistered(Vec<String>),

    #[error("invalid code migration registration for version {version}: {reason}")]
    Registration { version: i64, reason: String },

    /// Versions below the highest applied version that were never applied.
    #[error("found {count} missing (out-of-order) migration{plural} lower than current max ({max}): [{list}]", count = .versions.len(), plural = plural(.versions.len()), list = join_versions(.versions))]
    MissingMigrations { versions: Vec<i64>, max: i64 },

    #[error("no migrations found")]
    NoMigrations,

    #[error("version {0} not found")]
    VersionNotFound(i64),

    #[error("no next version found")]
    NoNextVersion,

    #[error("no previous version found")]
    NoPreviousVersion,

    #[error("no current version found")]
    NoCurrentVersion,

    #[error("version {0} is already applied")]
    AlreadyApplied(i64),

    #[error("version {0} is not applied")]
    NotApplied(i64),

    #[error("failed to acquire lock: {0}")]
    LockTimeout(String),

    #[error("failed to release lock: {0}")]
    Unlock(String),

    #[error("{0} is not supported by the {1} dialect")]
    Unsupported(&'static str, crate::Dialect),

    #[error("context cancelled")]
    Cancelled,

    #[error("context deadline exceeded")]
    DeadlineExceeded,

    #[error("failed to decode column {column}: {reason}")]
    Decode { column: usize, reason: String },

    #[error(transparent)]
    Partial(Box<PartialError>),

    #[error("{0}")]
    Generic(String),
}

impl Error {
    /// True when the error only reports that there was nothing to do.
    pub fn is_no_next_version(&self) -> bool {
        matches!(self, Self::NoNextVersion)
    }

    /// The partial batch report, when a migration failed mid-batch.
    pub fn as_partial(&self) -> Option<&PartialError> {
        match self {
            Self::Partial(partial) => Some(partial),
            _ => None,
        }
    }
}

fn plural(count: usize) -> &'static str {
    if count == 1 {
        ""
    } else {
        "s"
    }
}

fn join_versions(versions: &[i64]) -> String {
    versions
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(feature = "mysql")]
impl From<mysql::Error> for Error {
    fn from(value: mysql::Error) -> Self {
        Self::Mysql(value.to_string())
    }
}

impl From<String> for Error {
    fn from(value: String) -> Self {
        Self::Generic(value)
    }
}

impl From<PartialError> for Error {
    fn from(value: PartialError) -> Self {
        Self::Partial(Box::new(value))
    }
}
