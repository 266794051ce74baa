use crate::error::Error;
use crate::source::Source;
use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;

/// Which way a migration is run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Direction::Up => "up",
            Direction::Down => "down",
        })
    }
}

/// The outcome of running one migration.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MigrationResult {
    pub source: Source,
    pub direction: Direction,
    pub duration: Duration,
    /// True when the migration had nothing to run in this direction.
    pub empty: bool,
}

impl fmt::Display for MigrationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.empty { "EMPTY" } else { "OK" };
        write!(
            f,
            "{:<6} {:<4} {} ({:.2?})",
            state, self.direction, self.source.path, self.duration
        )
    }
}

/// A batch that stopped at a failing migration.
///
/// `applied` holds every migration that completed before the failure, in execution order.
#[derive(thiserror::Error, Debug)]
#[error("partial migration error ({}, version {}): {source}", .failed.source.path, .failed.source.version)]
pub struct PartialError {
    pub applied: Vec<MigrationResult>,
    pub failed: MigrationResult,
    pub source: Error,
}

/// Whether a known migration has been applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum State {
    Pending,
    Applied,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            State::Pending => "pending",
            State::Applied => "applied",
        })
    }
}

/// One line of [crate::Provider::status].
#[derive(Debug, Clone, serde::Serialize)]
pub struct MigrationStatus {
    pub source: Source,
    pub state: State,
    pub applied_at: Option<DateTime<Utc>>,
}
