//! Checks migration sources without touching a database.

use crate::error::Error;
use crate::registry::Registry;
use crate::source::{Collector, MigrationFs, Source};

/// Collects every migration from `fs` and `registry` and parses each SQL file.
///
/// Returns the sources in version order, or the first collection or parse error.
pub fn validate(fs: impl MigrationFs + 'static, registry: &Registry) -> Result<Vec<Source>, Error> {
    let catalog = Collector::new()
        .with_fs(fs)
        .with_registry(registry)
        .collect()?;
    for migration in &catalog {
        migration.parsed_sql()?;
    }

    #[cfg(feature = "tracing")]
    tracing::info!(count = catalog.len(), "Validated migrations");

    Ok(catalog.sources())
}
