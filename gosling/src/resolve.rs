//! Works out which versions a batch must apply.

use crate::error::Error;
use std::collections::BTreeSet;

/// Versions known to the catalog that are lower than the highest applied version
/// but were never applied themselves, ascending.
pub fn missing_versions(all: &[i64], applied: &[i64]) -> Vec<i64> {
    let Some(max) = applied.iter().copied().max() else {
        return Vec::new();
    };
    let applied: BTreeSet<i64> = applied.iter().copied().collect();
    let mut missing: Vec<i64> = all
        .iter()
        .copied()
        .filter(|v| *v < max && !applied.contains(v))
        .collect();
    missing.sort_unstable();
    missing.dedup();
    missing
}

/// Returns the versions to apply, ascending, to move from `applied` to `target`.
///
/// Without `allow_missing`, any known version below the highest applied version that was
/// never applied is an error, whatever the target. With it, such versions are applied
/// alongside the new ones, as long as they are not above `target`.
pub fn resolve(
    all: &[i64],
    applied: &[i64],
    target: i64,
    allow_missing: bool,
) -> Result<Vec<i64>, Error> {
    let missing = missing_versions(all, applied);
    let max = applied.iter().copied().max().unwrap_or(0);

    if !missing.is_empty() && !allow_missing {
        return Err(Error::MissingMigrations {
            versions: missing,
            max,
        });
    }

    let applied: BTreeSet<i64> = applied.iter().copied().collect();
    let missing: BTreeSet<i64> = missing.into_iter().collect();
    let mut pending: Vec<i64> = all
        .iter()
        .copied()
        .filter(|v| *v > 0 && *v <= target && !applied.contains(v))
        .filter(|v| *v > max || missing.contains(v))
        .collect();
    pending.sort_unstable();
    pending.dedup();

    #[cfg(feature = "tracing")]
    tracing::debug!(
        max_applied = max,
        target_version = target,
        allow_missing,
        missing = ?missing,
        pending = ?pending,
        "Resolved pending versions"
    );

    Ok(pending)
}
