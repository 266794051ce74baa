//! Discovery of migration sources and the ordered catalog built from them.

use crate::error::Error;
use crate::registry::{CodeMigration, Registry};
use crate::sqlparser::{parse_sql, ParsedSql};
use once_cell::sync::OnceCell;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// What kind of migration a source is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Sql,
    Code,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            SourceKind::Sql => "sql",
            SourceKind::Code => "code",
        })
    }
}

/// Identifies a migration independently of its body.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize)]
pub struct Source {
    pub kind: SourceKind,
    pub path: String,
    pub version: i64,
}

/// Parses the version from a file name of the form `<digits>_<description>.<ext>`.
pub fn parse_version(name: &str) -> Result<i64, Error> {
    let base = Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(name);
    let invalid = |reason: &str| Error::InvalidFilename {
        path: name.to_string(),
        reason: reason.to_string(),
    };
    let (prefix, _) = base
        .split_once('_')
        .ok_or_else(|| invalid("no filename separator '_' found"))?;
    let version: i64 = prefix
        .parse()
        .map_err(|_| invalid("failed to parse version from migration file"))?;
    if version < 1 {
        return Err(invalid("migration version must be greater than zero"));
    }
    Ok(version)
}

fn kind_for(name: &str) -> Option<SourceKind> {
    match Path::new(name).extension().and_then(|e| e.to_str()) {
        Some("sql") => Some(SourceKind::Sql),
        Some("rs") => Some(SourceKind::Code),
        _ => None,
    }
}

/// A flat set of migration files.
pub trait MigrationFs: Send + Sync {
    /// File names (not paths) in the root, in any order.
    fn list(&self) -> Result<Vec<String>, Error>;

    fn read(&self, name: &str) -> Result<String, Error>;

    /// A human readable location for `name`.
    fn display(&self, name: &str) -> String;
}

/// Migration files in a directory on local disk. Subdirectories are not scanned.
#[derive(Debug, Clone)]
pub struct Directory {
    root: PathBuf,
}

impl Directory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl MigrationFs for Directory {
    fn list(&self) -> Result<Vec<String>, Error> {
        let io_err = |source| Error::Io {
            path: self.root.clone(),
            source,
        };
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.root).map_err(io_err)? {
            let entry = entry.map_err(io_err)?;
            if !entry.file_type().map_err(io_err)?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        Ok(names)
    }

    fn read(&self, name: &str) -> Result<String, Error> {
        let path = self.root.join(name);
        std::fs::read_to_string(&path).map_err(|source| Error::Io { path, source })
    }

    fn display(&self, name: &str) -> String {
        self.root.join(name).display().to_string()
    }
}

/// Migration files compiled into the binary with [`include_dir`](https://crates.io/crates/include_dir).
///
/// ```ignore
/// static MIGRATIONS: include_dir::Dir = include_dir::include_dir!("$CARGO_MANIFEST_DIR/migrations");
/// let fs = gosling::Embedded::new(&MIGRATIONS);
/// ```
#[cfg(feature = "embed")]
#[cfg_attr(docsrs, doc(cfg(feature = "embed")))]
#[derive(Debug, Clone, Copy)]
pub struct Embedded {
    dir: &'static include_dir::Dir<'static>,
}

#[cfg(feature = "embed")]
impl Embedded {
    pub fn new(dir: &'static include_dir::Dir<'static>) -> Self {
        Self { dir }
    }
}

#[cfg(feature = "embed")]
impl MigrationFs for Embedded {
    fn list(&self) -> Result<Vec<String>, Error> {
        Ok(self
            .dir
            .files()
            .filter_map(|f| f.path().file_name()?.to_str().map(str::to_string))
            .collect())
    }

    fn read(&self, name: &str) -> Result<String, Error> {
        let path = self.dir.path().join(name);
        let file = self.dir.get_file(&path).ok_or_else(|| Error::Io {
            path: path.clone(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "not embedded"),
        })?;
        file.contents_utf8()
            .map(str::to_string)
            .ok_or_else(|| Error::Io {
                path,
                source: std::io::Error::new(std::io::ErrorKind::InvalidData, "not valid UTF-8"),
            })
    }

    fn display(&self, name: &str) -> String {
        self.dir.path().join(name).display().to_string()
    }
}

enum Body {
    Sql {
        fs: Arc<dyn MigrationFs>,
        name: String,
        parsed: OnceCell<ParsedSql>,
    },
    Code(CodeMigration),
}

/// A migration in the catalog. SQL bodies are read and parsed on first use.
pub struct Migration {
    source: Source,
    body: Body,
}

impl fmt::Debug for Migration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Migration")
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

impl Migration {
    pub fn sql(fs: Arc<dyn MigrationFs>, name: &str) -> Result<Self, Error> {
        Ok(Self {
            source: Source {
                kind: SourceKind::Sql,
                path: fs.display(name),
                version: parse_version(name)?,
            },
            body: Body::Sql {
                fs,
                name: name.to_string(),
                parsed: OnceCell::new(),
            },
        })
    }

    /// A code migration, displayed as `path`.
    pub fn code(migration: CodeMigration, path: impl Into<String>) -> Self {
        Self {
            source: Source {
                kind: SourceKind::Code,
                path: path.into(),
                version: migration.version,
            },
            body: Body::Code(migration),
        }
    }

    pub fn source(&self) -> &Source {
        &self.source
    }

    pub fn version(&self) -> i64 {
        self.source.version
    }

    pub fn kind(&self) -> SourceKind {
        self.source.kind
    }

    pub fn path(&self) -> &str {
        &self.source.path
    }

    /// The parsed SQL body, `None` for code migrations.
    pub fn parsed_sql(&self) -> Result<Option<&ParsedSql>, Error> {
        match &self.body {
            Body::Sql { fs, name, parsed } => parsed
                .get_or_try_init(|| parse_sql(&self.source.path, &fs.read(name)?))
                .map(Some),
            Body::Code(_) => Ok(None),
        }
    }

    pub fn code_migration(&self) -> Option<&CodeMigration> {
        match &self.body {
            Body::Code(code) => Some(code),
            Body::Sql { .. } => None,
        }
    }

    /// Whether the migration runs inside a transaction. Parses SQL bodies.
    pub fn use_tx(&self) -> Result<bool, Error> {
        match &self.body {
            Body::Code(code) => Ok(code.use_tx()),
            Body::Sql { .. } => Ok(self.parsed_sql()?.map_or(true, |p| p.use_tx)),
        }
    }

    pub(crate) fn is_parsed(&self) -> bool {
        match &self.body {
            Body::Sql { parsed, .. } => parsed.get().is_some(),
            Body::Code(_) => true,
        }
    }
}

/// Migrations ordered by ascending version, unique per version.
#[derive(Debug, Default)]
pub struct Catalog {
    migrations: Vec<Migration>,
}

impl Catalog {
    pub fn new(mut migrations: Vec<Migration>) -> Result<Self, Error> {
        migrations.sort_by_key(Migration::version);
        for pair in migrations.windows(2) {
            if pair[0].version() == pair[1].version() {
                return Err(Error::DuplicateVersion {
                    version: pair[0].version(),
                    first: pair[0].path().to_string(),
                    second: pair[1].path().to_string(),
                });
            }
        }
        Ok(Self { migrations })
    }

    fn position(&self, version: i64) -> Result<usize, usize> {
        self.migrations
            .binary_search_by_key(&version, Migration::version)
    }

    pub fn get(&self, version: i64) -> Option<&Migration> {
        self.position(version).ok().map(|i| &self.migrations[i])
    }

    /// The migration with exactly `version`.
    pub fn current(&self, version: i64) -> Result<&Migration, Error> {
        self.get(version).ok_or(Error::NoCurrentVersion)
    }

    /// The first migration above `version`.
    pub fn next(&self, version: i64) -> Result<&Migration, Error> {
        let i = match self.position(version) {
            Ok(i) => i + 1,
            Err(i) => i,
        };
        self.migrations.get(i).ok_or(Error::NoNextVersion)
    }

    /// The last migration below `version`.
    pub fn previous(&self, version: i64) -> Result<&Migration, Error> {
        let i = match self.position(version) {
            Ok(i) | Err(i) => i,
        };
        i.checked_sub(1)
            .and_then(|i| self.migrations.get(i))
            .ok_or(Error::NoPreviousVersion)
    }

    pub fn last(&self) -> Option<&Migration> {
        self.migrations.last()
    }

    pub fn versions(&self) -> Vec<i64> {
        self.migrations.iter().map(Migration::version).collect()
    }

    pub fn sources(&self) -> Vec<Source> {
        self.migrations.iter().map(|m| m.source.clone()).collect()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Migration> {
        self.migrations.iter()
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }
}

impl<'a> IntoIterator for &'a Catalog {
    type Item = &'a Migration;
    type IntoIter = std::slice::Iter<'a, Migration>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Builds a [Catalog] from a [MigrationFs] and a [Registry].
///
/// `.sql` files become SQL migrations. `.rs` files with a version prefix must have a code
/// migration registered under the same version; every unmatched file is reported at once.
/// `.rs` files without a version prefix, such as `mod.rs`, are skipped. Registered
/// migrations without a file are included as they are.
#[derive(Default)]
pub struct Collector {
    fs: Option<Arc<dyn MigrationFs>>,
    registry: Registry,
    exclude_names: BTreeSet<String>,
    exclude_versions: BTreeSet<i64>,
}

impl fmt::Debug for Collector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collector")
            .field("has_fs", &self.fs.is_some())
            .field("registry", &self.registry.versions())
            .field("exclude_names", &self.exclude_names)
            .field("exclude_versions", &self.exclude_versions)
            .finish()
    }
}

impl Collector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fs(mut self, fs: impl MigrationFs + 'static) -> Self {
        self.fs = Some(Arc::new(fs));
        self
    }

    pub fn with_shared_fs(mut self, fs: Arc<dyn MigrationFs>) -> Self {
        self.fs = Some(fs);
        self
    }

    pub fn with_registry(mut self, registry: &Registry) -> Self {
        self.registry = registry.clone();
        self
    }

    /// Skip files with these base names.
    pub fn exclude_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude_names.extend(names.into_iter().map(Into::into));
        self
    }

    /// Skip these versions, whether they come from files or from the registry.
    pub fn exclude_versions(mut self, versions: impl IntoIterator<Item = i64>) -> Self {
        self.exclude_versions.extend(versions);
        self
    }

    pub fn collect(&self) -> Result<Catalog, Error> {
        let mut found: BTreeMap<i64, Migration> = BTreeMap::new();
        let mut unregistered = Vec::new();

        if let Some(fs) = &self.fs {
            let mut names = fs.list()?;
            names.sort();
            for name in names {
                let Some(kind) = kind_for(&name) else {
                    continue;
                };
                if self.exclude_names.contains(&name) {
                    continue;
                }
                let version = match (kind, parse_version(&name)) {
                    (_, Ok(version)) => version,
                    // mod.rs and other helper modules next to code migrations
                    (SourceKind::Code, Err(_)) => continue,
                    (SourceKind::Sql, Err(err)) => return Err(err),
                };
                if self.exclude_versions.contains(&version) {
                    continue;
                }
                let migration = match kind {
                    SourceKind::Sql => Migration::sql(Arc::clone(fs), &name)?,
                    SourceKind::Code => match self.registry.get(version) {
                        Some(code) => Migration::code(code.clone(), fs.display(&name)),
                        None => {
                            unregistered.push(name);
                            continue;
                        }
                    },
                };
                insert_unique(&mut found, migration)?;
            }
        }

        if !unregistered.is_empty() {
            return Err(Error::Unregistered(unregistered));
        }

        for code in self.registry.iter() {
            if self.exclude_versions.contains(&code.version) {
                continue;
            }
            match found.get(&code.version) {
                Some(existing) if existing.kind() == SourceKind::Code => {}
                Some(existing) => {
                    return Err(Error::DuplicateVersion {
                        version: code.version,
                        first: existing.path().to_string(),
                        second: code.registered_at.clone(),
                    })
                }
                None => {
                    let path = code.registered_at.clone();
                    found.insert(code.version, Migration::code(code.clone(), path));
                }
            }
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(count = found.len(), "Collected migrations");

        Catalog::new(found.into_values().collect())
    }
}

fn insert_unique(found: &mut BTreeMap<i64, Migration>, migration: Migration) -> Result<(), Error> {
    if let Some(existing) = found.get(&migration.version()) {
        return Err(Error::DuplicateVersion {
            version: migration.version(),
            first: existing.path().to_string(),
            second: migration.path().to_string(),
        });
    }
    found.insert(migration.version(), migration);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use std::fs;

    fn noop(_: &mut dyn Database) -> Result<(), Error> {
        Ok(())
    }

    fn write(dir: &Path, name: &str, body: &str) {
        fs::write(dir.join(name), body).unwrap();
    }

    #[test]
    fn parses_versions_from_file_names() {
        assert_eq!(parse_version("00001_init.sql").unwrap(), 1);
        assert_eq!(parse_version("/a/b/20240102030405_add_users.sql").unwrap(), 20240102030405);
        assert!(parse_version("init.sql").is_err());
        assert!(parse_version("abc_init.sql").is_err());
        assert!(parse_version("0_init.sql").is_err());
        assert!(parse_version("-5_init.sql").is_err());
    }

    #[test]
    fn collects_in_version_order_and_skips_other_files() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "00003_c.sql", "-- +goose Up\nSELECT 3;\n");
        write(dir.path(), "00001_a.sql", "-- +goose Up\nSELECT 1;\n");
        write(dir.path(), "00002_b.sql", "-- +goose Up\nSELECT 2;\n");
        write(dir.path(), "README.md", "not a migration");
        fs::create_dir(dir.path().join("00004_nested.sql")).unwrap();

        let catalog = Collector::new()
            .with_fs(Directory::new(dir.path()))
            .collect()
            .unwrap();
        assert_eq!(catalog.versions(), vec![1, 2, 3]);
        assert!(catalog.iter().all(|m| !m.is_parsed()));
        assert_eq!(
            catalog.get(2).unwrap().parsed_sql().unwrap().unwrap().up,
            vec!["SELECT 2;"]
        );
    }

    #[test]
    fn code_helper_modules_are_skipped_but_bad_sql_names_fail() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "00001_a.sql", "-- +goose Up\nSELECT 1;\n");
        write(dir.path(), "00002_b.rs", "");
        write(dir.path(), "mod.rs", "mod m00002_b;");
        write(dir.path(), "helpers.rs", "");

        let mut registry = Registry::new();
        registry.add_tx(2, noop, noop).unwrap();
        let catalog = Collector::new()
            .with_fs(Directory::new(dir.path()))
            .with_registry(&registry)
            .collect()
            .unwrap();
        assert_eq!(catalog.versions(), vec![1, 2]);

        write(dir.path(), "init.sql", "");
        let err = Collector::new()
            .with_fs(Directory::new(dir.path()))
            .with_registry(&registry)
            .collect()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidFilename { .. }), "{err}");
    }

    #[test]
    fn duplicate_versions_name_both_files() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "00001_a.sql", "");
        write(dir.path(), "1_b.sql", "");
        let err = Collector::new()
            .with_fs(Directory::new(dir.path()))
            .collect()
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("00001_a.sql"), "{message}");
        assert!(message.contains("1_b.sql"), "{message}");
    }

    #[test]
    fn excludes_by_name_and_version() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["00001_a.sql", "00002_b.sql", "00003_c.sql"] {
            write(dir.path(), name, "");
        }
        let catalog = Collector::new()
            .with_fs(Directory::new(dir.path()))
            .exclude_names(["00001_a.sql"])
            .exclude_versions([3])
            .collect()
            .unwrap();
        assert_eq!(catalog.versions(), vec![2]);
    }

    #[test]
    fn code_files_must_be_registered() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "00001_a.sql", "");
        write(dir.path(), "00002_b.rs", "");
        write(dir.path(), "00003_c.rs", "");

        let err = Collector::new()
            .with_fs(Directory::new(dir.path()))
            .collect()
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "found 2 unregistered code migration files: [00002_b.rs, 00003_c.rs]"
        );

        let mut registry = Registry::new();
        registry.add_tx(2, noop, noop).unwrap();
        registry.add_no_tx(3, noop, noop).unwrap();
        registry.add_tx(7, noop, noop).unwrap();
        let catalog = Collector::new()
            .with_fs(Directory::new(dir.path()))
            .with_registry(&registry)
            .collect()
            .unwrap();
        assert_eq!(catalog.versions(), vec![1, 2, 3, 7]);
        assert!(catalog.get(2).unwrap().path().ends_with("00002_b.rs"));
        assert_eq!(catalog.get(7).unwrap().kind(), SourceKind::Code);
        assert!(!catalog.get(3).unwrap().use_tx().unwrap());
    }

    #[test]
    fn registered_version_clashing_with_sql_file_is_a_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "00001_a.sql", "");
        let mut registry = Registry::new();
        registry.add_tx(1, noop, noop).unwrap();
        let err = Collector::new()
            .with_fs(Directory::new(dir.path()))
            .with_registry(&registry)
            .collect()
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateVersion { version: 1, .. }));
    }

    #[test]
    fn unreadable_directory_is_an_io_error() {
        let err = Collector::new()
            .with_fs(Directory::new("/definitely/not/here"))
            .collect()
            .unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
    }

    #[test]
    fn catalog_neighbours() {
        let mut registry = Registry::new();
        for version in [1, 2, 5] {
            registry.add_tx(version, noop, noop).unwrap();
        }
        let catalog = Collector::new().with_registry(&registry).collect().unwrap();
        assert_eq!(catalog.current(2).unwrap().version(), 2);
        assert!(matches!(catalog.current(3), Err(Error::NoCurrentVersion)));
        assert_eq!(catalog.next(0).unwrap().version(), 1);
        assert_eq!(catalog.next(2).unwrap().version(), 5);
        assert_eq!(catalog.next(3).unwrap().version(), 5);
        assert!(catalog.next(5).unwrap_err().is_no_next_version());
        assert_eq!(catalog.previous(5).unwrap().version(), 2);
        assert_eq!(catalog.previous(4).unwrap().version(), 2);
        assert!(matches!(catalog.previous(1), Err(Error::NoPreviousVersion)));
        assert_eq!(catalog.last().unwrap().version(), 5);
    }

    #[cfg(feature = "embed")]
    #[test]
    fn embedded_directory_is_collected() {
        static DIR: include_dir::Dir<'static> =
            include_dir::include_dir!("$CARGO_MANIFEST_DIR/testdata/basic");
        let catalog = Collector::new().with_fs(Embedded::new(&DIR)).collect().unwrap();
        assert_eq!(catalog.versions(), vec![1, 2, 3]);
        assert!(!catalog.get(1).unwrap().parsed_sql().unwrap().unwrap().up.is_empty());
    }
}
