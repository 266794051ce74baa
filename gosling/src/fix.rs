//! Renumbering timestamped migrations into the sequential scheme.
//!
//! Timestamped versions avoid merge conflicts while a migration is on a branch; once it
//! lands, [fix] renames it to the next sequential number so production history stays
//! dense. Registered code migrations keep their version in code and must be updated by
//! hand after their file is renamed.

use crate::create::TIMESTAMP_FORMAT;
use crate::error::Error;
use crate::source::{parse_version, Directory, MigrationFs};
use chrono::NaiveDateTime;
use std::path::{Path, PathBuf};

/// Whether `version` reads as a `YYYYMMDDHHMMSS` timestamp.
pub fn is_timestamp(version: i64) -> bool {
    NaiveDateTime::parse_from_str(&version.to_string(), TIMESTAMP_FORMAT).is_ok()
}

/// A file renamed by [fix].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Renamed {
    pub from: PathBuf,
    pub to: PathBuf,
    pub version: i64,
}

/// Renames every timestamped migration in `dir`, oldest first, to follow the highest
/// sequential version.
pub fn fix(dir: &Path) -> Result<Vec<Renamed>, Error> {
    let mut files = Vec::new();
    for name in Directory::new(dir).list()? {
        if name.ends_with(".sql") {
            files.push((parse_version(&name)?, name));
        } else if name.ends_with(".rs") {
            if let Ok(version) = parse_version(&name) {
                files.push((version, name));
            }
        }
    }
    files.sort();

    let mut next = files
        .iter()
        .map(|(version, _)| *version)
        .filter(|version| !is_timestamp(*version))
        .max()
        .unwrap_or(0);

    let mut renamed = Vec::new();
    for (version, name) in files.into_iter().filter(|(v, _)| is_timestamp(*v)) {
        next += 1;
        let rest = &name[version.to_string().len()..];
        let from = dir.join(&name);
        let to = dir.join(format!("{:05}{}", next, rest));
        if to.exists() {
            return Err(Error::Io {
                path: to,
                source: std::io::Error::new(std::io::ErrorKind::AlreadyExists, "rename target exists"),
            });
        }
        std::fs::rename(&from, &to).map_err(|source| Error::Io {
            path: from.clone(),
            source,
        })?;

        #[cfg(feature = "tracing")]
        tracing::info!(from = %from.display(), to = %to.display(), "Renamed migration");

        renamed.push(Renamed {
            from,
            to,
            version: next,
        });
    }
    Ok(renamed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn names(dir: &Path) -> Vec<String> {
        let mut names = Directory::new(dir).list().unwrap();
        names.sort();
        names
    }

    #[test]
    fn recognises_timestamps() {
        assert!(is_timestamp(20240131120000));
        assert!(!is_timestamp(20241331120000));
        assert!(!is_timestamp(1));
        assert!(!is_timestamp(99999));
    }

    #[test]
    fn renumbers_timestamped_files_after_the_highest_sequential_one() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "00001_init.sql",
            "00002_users.sql",
            "20240201090000_posts.sql",
            "20240101090000_tags.rs",
            "notes.txt",
        ] {
            fs::write(dir.path().join(name), "").unwrap();
        }

        let renamed = fix(dir.path()).unwrap();
        assert_eq!(renamed.len(), 2);
        assert_eq!(renamed[0].version, 3);
        assert!(renamed[0].from.ends_with("20240101090000_tags.rs"));
        assert!(renamed[0].to.ends_with("00003_tags.rs"));
        assert!(renamed[1].to.ends_with("00004_posts.sql"));

        assert_eq!(
            names(dir.path()),
            vec![
                "00001_init.sql",
                "00002_users.sql",
                "00003_tags.rs",
                "00004_posts.sql",
                "notes.txt"
            ]
        );
        assert!(fix(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn leaves_unversioned_code_modules_alone() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["00001_init.sql", "20240101090000_tags.rs", "mod.rs", "lib.rs"] {
            fs::write(dir.path().join(name), "").unwrap();
        }
        let renamed = fix(dir.path()).unwrap();
        assert_eq!(renamed.len(), 1);
        assert!(renamed[0].to.ends_with("00002_tags.rs"));
        assert_eq!(
            names(dir.path()),
            vec!["00001_init.sql", "00002_tags.rs", "lib.rs", "mod.rs"]
        );

        fs::write(dir.path().join("init.sql"), "").unwrap();
        assert!(matches!(fix(dir.path()), Err(Error::InvalidFilename { .. })));
    }

    #[test]
    fn all_timestamped_starts_at_one() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("20240101090000_a.sql"), "").unwrap();
        let renamed = fix(dir.path()).unwrap();
        assert!(renamed[0].to.ends_with("00001_a.sql"));
    }
}
