//! Creating new migration files from templates.

use crate::error::Error;
use crate::source::{parse_version, Directory, MigrationFs, SourceKind};
use chrono::Utc;
use std::path::{Path, PathBuf};

/// Version format of timestamped migrations.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

const SQL_TEMPLATE: &str = "\
-- +goose Up
-- +goose StatementBegin
SELECT 'up SQL query';
-- +goose StatementEnd

-- +goose Down
-- +goose StatementBegin
SELECT 'down SQL query';
-- +goose StatementEnd
";

const CODE_TEMPLATE: &str = "\
use gosling::{Database, Error, Registry};

/// Adds migration {version} to `registry`.
pub fn register(registry: &mut Registry) -> Result<(), Error> {
    registry.add_tx({version}, up_{name}, down_{name})?;
    Ok(())
}

fn up_{name}(db: &mut dyn Database) -> Result<(), Error> {
    // This code is executed when the migration is applied.
    let _ = db;
    Ok(())
}

fn down_{name}(db: &mut dyn Database) -> Result<(), Error> {
    // This code is executed when the migration is rolled back.
    let _ = db;
    Ok(())
}
";

/// Converts a free-form description like `AddUsers` or `add users` to `add_users`.
pub fn snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    let mut prev: Option<char> = None;
    for c in name.trim().chars() {
        if c.is_whitespace() || c == '-' || c == '_' {
            if !out.is_empty() && !out.ends_with('_') {
                out.push('_');
            }
        } else if c.is_alphanumeric() {
            if c.is_uppercase()
                && prev.map_or(false, |p| p.is_lowercase() || p.is_ascii_digit())
                && !out.ends_with('_')
            {
                out.push('_');
            }
            out.extend(c.to_lowercase());
        }
        prev = Some(c);
    }
    out.trim_end_matches('_').to_string()
}

/// The next sequential version for `dir`: one above the highest existing version.
fn next_sequential(dir: &Path) -> Result<i64, Error> {
    let highest = Directory::new(dir)
        .list()?
        .iter()
        .filter(|name| name.ends_with(".sql") || name.ends_with(".rs"))
        .filter_map(|name| parse_version(name).ok())
        .max()
        .unwrap_or(0);
    Ok(highest + 1)
}

/// Writes a new migration file into `dir` and returns its path.
///
/// The version is the current UTC time (`YYYYMMDDHHMMSS`), or with `sequential` the
/// next number after the highest existing version, zero-padded to five digits.
pub fn create(dir: &Path, name: &str, kind: SourceKind, sequential: bool) -> Result<PathBuf, Error> {
    let snake = snake_case(name);
    if snake.is_empty() {
        return Err(Error::InvalidFilename {
            path: name.to_string(),
            reason: "migration name must contain letters or digits".to_string(),
        });
    }

    std::fs::create_dir_all(dir).map_err(|source| Error::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let version = if sequential {
        format!("{:05}", next_sequential(dir)?)
    } else {
        Utc::now().format(TIMESTAMP_FORMAT).to_string()
    };

    let (extension, body) = match kind {
        SourceKind::Sql => ("sql", SQL_TEMPLATE.to_string()),
        SourceKind::Code => (
            "rs",
            CODE_TEMPLATE
                .replace("{version}", version.trim_start_matches('0'))
                .replace("{name}", &snake),
        ),
    };

    let path = dir.join(format!("{}_{}.{}", version, snake, extension));
    if path.exists() {
        return Err(Error::Io {
            path,
            source: std::io::Error::new(std::io::ErrorKind::AlreadyExists, "migration file already exists"),
        });
    }
    std::fs::write(&path, body).map_err(|source| Error::Io {
        path: path.clone(),
        source,
    })?;

    #[cfg(feature = "tracing")]
    tracing::info!(path = %path.display(), "Created new migration file");

    Ok(path)
}
