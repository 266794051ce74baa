//! Cooperative locking so that concurrent processes do not migrate the same database at once.
//!
//! Two independent strategies implement [Locker]:
//!
//! - [SessionLocker] takes a session-scoped advisory lock on the connection that runs the
//!   batch (`pg_try_advisory_lock` on PostgreSQL, `GET_LOCK` on MySQL). The database
//!   releases it when the session ends.
//! - [TableLocker] claims a row in a dedicated lock table with a conditional `UPDATE` and
//!   keeps a lease alive with a heartbeat thread. A crashed holder stops heartbeating and
//!   its lease becomes claimable once it expires, so the lock favours progress over strict
//!   exclusivity.

use crate::context::Context;
use crate::db::{Database, Value};
use crate::dialect::Dialect;
use crate::error::Error;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Identifies the gosling migration lock, both as advisory lock key and lock table row.
pub const DEFAULT_LOCK_ID: i64 = 5887940537704921958;

/// Default name of the lock table used by [TableLocker].
pub const DEFAULT_LOCK_TABLE: &str = "gosling_lock";

/// Mutual exclusion around a migration batch.
///
/// `db` is the connection the batch runs on. Implementations that need their own
/// connection may ignore it.
pub trait Locker: Send + Sync {
    fn lock(&self, ctx: &Context, db: &mut dyn Database) -> Result<(), Error>;
    fn unlock(&self, ctx: &Context, db: &mut dyn Database) -> Result<(), Error>;
}

/// Session-scoped advisory lock, retried at a fixed interval.
#[derive(Debug, Clone)]
pub struct SessionLocker {
    dialect: Dialect,
    lock_id: i64,
    lock_interval: Duration,
    lock_attempts: u32,
    unlock_interval: Duration,
    unlock_attempts: u32,
}

impl SessionLocker {
    /// Returns an error for dialects without session locks.
    pub fn try_new(dialect: Dialect) -> Result<Self, Error> {
        if !dialect.supports_session_locks() {
            return Err(Error::Unsupported("session locking", dialect));
        }
        Ok(Self {
            dialect,
            lock_id: DEFAULT_LOCK_ID,
            // 5s * 60 attempts = 5 minutes
            lock_interval: Duration::from_secs(5),
            lock_attempts: 60,
            // 2s * 30 attempts = 1 minute
            unlock_interval: Duration::from_secs(2),
            unlock_attempts: 30,
        })
    }

    pub fn with_lock_id(mut self, lock_id: i64) -> Self {
        self.lock_id = lock_id;
        self
    }

    /// Retry every `interval`, at most `attempts` times.
    pub fn with_lock_retry(mut self, interval: Duration, attempts: u32) -> Self {
        self.lock_interval = interval;
        self.lock_attempts = attempts.max(1);
        self
    }

    pub fn with_unlock_retry(mut self, interval: Duration, attempts: u32) -> Self {
        self.unlock_interval = interval;
        self.unlock_attempts = attempts.max(1);
        self
    }

    pub fn lock_id(&self) -> i64 {
        self.lock_id
    }
}

impl Locker for SessionLocker {
    fn lock(&self, ctx: &Context, db: &mut dyn Database) -> Result<(), Error> {
        let sql = self
            .dialect
            .session_try_lock()
            .ok_or(Error::Unsupported("session locking", self.dialect))?;
        let key = self.dialect.session_lock_key(self.lock_id);

        for attempt in 1..=self.lock_attempts {
            ctx.check()?;
            let acquired = match db.fetch_optional(sql, std::slice::from_ref(&key))? {
                Some(row) => row.get_bool(0)?,
                None => false,
            };
            if acquired {
                #[cfg(feature = "tracing")]
                tracing::debug!(lock_id = self.lock_id, attempt, "Acquired session lock");
                return Ok(());
            }
            #[cfg(feature = "tracing")]
            tracing::debug!(
                lock_id = self.lock_id,
                attempt,
                max_attempts = self.lock_attempts,
                "Session lock held elsewhere, retrying"
            );
            if attempt < self.lock_attempts {
                ctx.sleep(self.lock_interval)?;
            }
        }
        Err(Error::LockTimeout(format!(
            "session lock {} still held elsewhere after {} attempts",
            self.lock_id, self.lock_attempts
        )))
    }

    fn unlock(&self, ctx: &Context, db: &mut dyn Database) -> Result<(), Error> {
        let sql = self
            .dialect
            .session_unlock()
            .ok_or(Error::Unsupported("session locking", self.dialect))?;
        let key = self.dialect.session_lock_key(self.lock_id);

        let mut last_error = None;
        for attempt in 1..=self.unlock_attempts {
            ctx.check()?;
            match db.fetch_optional(sql, std::slice::from_ref(&key)) {
                Ok(row) => {
                    let released = match row {
                        Some(row) => row.get_bool(0)?,
                        None => false,
                    };
                    if released {
                        #[cfg(feature = "tracing")]
                        tracing::debug!(lock_id = self.lock_id, "Released session lock");
                        return Ok(());
                    }
                    return Err(Error::Unlock(format!(
                        "session lock {} is not held by this connection",
                        self.lock_id
                    )));
                }
                Err(err) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(error = %err, attempt, "Failed to release session lock, retrying");
                    last_error = Some(err);
                }
            }
            if attempt < self.unlock_attempts {
                ctx.sleep(self.unlock_interval)?;
            }
        }
        Err(Error::Unlock(format!(
            "session lock {}: {}",
            self.lock_id,
            last_error.map_or_else(|| "gave up".to_string(), |e| e.to_string())
        )))
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as i64)
}

type SharedConnection = Arc<Mutex<Box<dyn Database + Send>>>;

fn lock_conn(conn: &SharedConnection) -> MutexGuard<'_, Box<dyn Database + Send>> {
    // A panic while holding the guard leaves the connection usable.
    conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct Heartbeat {
    stop: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl Heartbeat {
    fn stop(self) {
        let _ = self.stop.send(());
        let _ = self.handle.join();
    }
}

/// Lease-based lock stored in a table, usable on every dialect.
///
/// The locker owns a dedicated connection, separate from the one the batch runs on, so the
/// heartbeat can renew the lease while a migration transaction is open.
pub struct TableLocker {
    conn: SharedConnection,
    dialect: Dialect,
    table: String,
    lock_id: i64,
    identity: String,
    lease: Duration,
    heartbeat_interval: Duration,
    retry_interval: Duration,
    lock_timeout: Duration,
    unlock_timeout: Duration,
    heartbeat: Mutex<Option<Heartbeat>>,
}

impl std::fmt::Debug for TableLocker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableLocker")
            .field("dialect", &self.dialect)
            .field("table", &self.table)
            .field("lock_id", &self.lock_id)
            .field("identity", &self.identity)
            .field("lease", &self.lease)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("retry_interval", &self.retry_interval)
            .field("lock_timeout", &self.lock_timeout)
            .field("unlock_timeout", &self.unlock_timeout)
            .finish_non_exhaustive()
    }
}

impl TableLocker {
    pub fn new(dialect: Dialect, conn: impl Database + Send + 'static) -> Self {
        Self {
            conn: Arc::new(Mutex::new(Box::new(conn))),
            dialect,
            table: DEFAULT_LOCK_TABLE.to_string(),
            lock_id: DEFAULT_LOCK_ID,
            identity: uuid::Uuid::new_v4().to_string(),
            lease: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(5),
            retry_interval: Duration::from_secs(5),
            lock_timeout: Duration::from_secs(5 * 60),
            unlock_timeout: Duration::from_secs(60),
            heartbeat: Mutex::new(None),
        }
    }

    pub fn with_table_name(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub fn with_lock_id(mut self, lock_id: i64) -> Self {
        self.lock_id = lock_id;
        self
    }

    /// Identifies this holder in the lock row. Defaults to a random UUID.
    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = identity.into();
        self
    }

    pub fn with_lease_duration(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_unlock_timeout(mut self, timeout: Duration) -> Self {
        self.unlock_timeout = timeout;
        self
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    fn ensure_table(&self, conn: &mut dyn Database) -> Result<(), Error> {
        conn.exec_script(&self.dialect.create_lock_table(&self.table))?;
        conn.exec(
            &self.dialect.insert_lock_row(&self.table),
            &[Value::Int(self.lock_id)],
        )?;
        Ok(())
    }

    fn try_acquire(&self, conn: &mut dyn Database) -> Result<bool, Error> {
        let now = now_millis();
        let expires = now + self.lease.as_millis() as i64;
        let affected = conn.exec(
            &self.dialect.acquire_lock(&self.table),
            &[
                Value::Int(now),
                Value::from(self.identity.as_str()),
                Value::Int(expires),
                Value::Int(now),
                Value::Int(self.lock_id),
                Value::Int(now),
            ],
        )?;
        Ok(affected == 1)
    }

    fn start_heartbeat(&self) {
        let (stop, stopped) = mpsc::channel::<()>();
        let conn = Arc::clone(&self.conn);
        let sql = self.dialect.heartbeat_lock(&self.table);
        let interval = self.heartbeat_interval;
        let lease = self.lease;
        let lock_id = self.lock_id;
        let identity = self.identity.clone();

        let handle = std::thread::spawn(move || loop {
            match stopped.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {}
                _ => return,
            }
            let now = now_millis();
            let params = [
                Value::Int(now + lease.as_millis() as i64),
                Value::Int(now),
                Value::Int(lock_id),
                Value::from(identity.as_str()),
            ];
            match lock_conn(&conn).exec(&sql, &params) {
                Ok(1) => {}
                Ok(_) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(lock_id, identity = %identity, "Lock lease lost, heartbeat found no row to renew");
                }
                Err(_err) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(lock_id, error = %_err, "Failed to renew lock lease");
                }
            }
        });

        let previous = self
            .heartbeat
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .replace(Heartbeat { stop, handle });
        if let Some(previous) = previous {
            previous.stop();
        }
    }

    fn stop_heartbeat(&self) {
        let heartbeat = self
            .heartbeat
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(heartbeat) = heartbeat {
            heartbeat.stop();
        }
    }
}

impl Locker for TableLocker {
    fn lock(&self, ctx: &Context, _db: &mut dyn Database) -> Result<(), Error> {
        let ctx = ctx.with_timeout(self.lock_timeout);
        let timed_out = |err: Error| match err {
            Error::DeadlineExceeded => Error::LockTimeout(format!(
                "table lock {} not acquired within {:?}",
                self.lock_id, self.lock_timeout
            )),
            other => other,
        };

        ctx.check().map_err(timed_out)?;
        self.ensure_table(lock_conn(&self.conn).as_mut())?;

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            ctx.check().map_err(timed_out)?;
            if self.try_acquire(lock_conn(&self.conn).as_mut())? {
                #[cfg(feature = "tracing")]
                tracing::debug!(lock_id = self.lock_id, identity = %self.identity, attempt, "Acquired table lock");
                self.start_heartbeat();
                return Ok(());
            }
            #[cfg(feature = "tracing")]
            tracing::debug!(lock_id = self.lock_id, attempt, "Table lock held elsewhere, retrying");
            ctx.sleep(self.retry_interval).map_err(timed_out)?;
        }
    }

    fn unlock(&self, ctx: &Context, _db: &mut dyn Database) -> Result<(), Error> {
        self.stop_heartbeat();

        let ctx = ctx.with_timeout(self.unlock_timeout);
        let sql = self.dialect.release_lock(&self.table);
        let mut last_error: Option<Error> = None;
        loop {
            if let Err(err) = ctx.check() {
                return Err(Error::Unlock(match last_error {
                    Some(last) => format!("table lock {}: {}", self.lock_id, last),
                    None => format!("table lock {}: {}", self.lock_id, err),
                }));
            }
            let result = lock_conn(&self.conn).exec(
                &sql,
                &[
                    Value::Int(now_millis()),
                    Value::Int(self.lock_id),
                    Value::from(self.identity.as_str()),
                ],
            );
            match result {
                Ok(1) => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(lock_id = self.lock_id, "Released table lock");
                    return Ok(());
                }
                Ok(_) => {
                    return Err(Error::Unlock(format!(
                        "table lock {} is not held by {}",
                        self.lock_id, self.identity
                    )))
                }
                Err(err) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(error = %err, "Failed to release table lock, retrying");
                    last_error = Some(err);
                }
            }
            let _ = ctx.sleep(self.retry_interval.min(Duration::from_secs(1)));
        }
    }
}

impl Drop for TableLocker {
    fn drop(&mut self) {
        self.stop_heartbeat();
    }
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use super::*;
    use rusqlite::Connection;

    fn open(path: &std::path::Path) -> Connection {
        let conn = Connection::open(path).unwrap();
        conn.busy_timeout(Duration::from_secs(10)).unwrap();
        conn
    }

    fn fast(locker: TableLocker) -> TableLocker {
        locker
            .with_retry_interval(Duration::from_millis(20))
            .with_heartbeat_interval(Duration::from_millis(20))
            .with_lock_timeout(Duration::from_millis(300))
    }

    #[test]
    fn second_holder_times_out_until_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock.db");
        let ctx = Context::new();
        let mut unused = Connection::open_in_memory().unwrap();

        let first = fast(TableLocker::new(Dialect::Sqlite, open(&path)));
        let second = fast(TableLocker::new(Dialect::Sqlite, open(&path)));

        first.lock(&ctx, &mut unused).unwrap();
        let err = second.lock(&ctx, &mut unused).unwrap_err();
        assert!(matches!(err, Error::LockTimeout(_)), "{err}");

        first.unlock(&ctx, &mut unused).unwrap();
        second.lock(&ctx, &mut unused).unwrap();
        second.unlock(&ctx, &mut unused).unwrap();
    }

    #[test]
    fn release_requires_the_same_identity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock.db");
        let ctx = Context::new();
        let mut unused = Connection::open_in_memory().unwrap();

        let holder = fast(TableLocker::new(Dialect::Sqlite, open(&path)).with_identity("a"));
        let other = fast(TableLocker::new(Dialect::Sqlite, open(&path)).with_identity("b"));
        holder.lock(&ctx, &mut unused).unwrap();
        assert!(matches!(
            other.unlock(&ctx, &mut unused),
            Err(Error::Unlock(_))
        ));
        holder.unlock(&ctx, &mut unused).unwrap();
    }

    #[test]
    fn expired_lease_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock.db");
        let ctx = Context::new();
        let mut unused = Connection::open_in_memory().unwrap();

        // A holder whose heartbeat never runs within the lease.
        let crashed = fast(TableLocker::new(Dialect::Sqlite, open(&path)))
            .with_lease_duration(Duration::from_millis(50))
            .with_heartbeat_interval(Duration::from_secs(3600));
        crashed.lock(&ctx, &mut unused).unwrap();

        let next = fast(TableLocker::new(Dialect::Sqlite, open(&path)))
            .with_lock_timeout(Duration::from_secs(5));
        next.lock(&ctx, &mut unused).unwrap();
        next.unlock(&ctx, &mut unused).unwrap();
        assert!(matches!(
            crashed.unlock(&ctx, &mut unused),
            Err(Error::Unlock(_))
        ));
    }

    #[test]
    fn heartbeat_extends_the_lease() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock.db");
        let ctx = Context::new();
        let mut unused = Connection::open_in_memory().unwrap();

        let holder = fast(TableLocker::new(Dialect::Sqlite, open(&path)))
            .with_lease_duration(Duration::from_millis(200));
        holder.lock(&ctx, &mut unused).unwrap();
        std::thread::sleep(Duration::from_millis(500));

        let contender = fast(TableLocker::new(Dialect::Sqlite, open(&path)));
        assert!(matches!(
            contender.lock(&ctx, &mut unused),
            Err(Error::LockTimeout(_))
        ));
        holder.unlock(&ctx, &mut unused).unwrap();
    }

    #[test]
    fn cancelled_context_stops_retrying() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock.db");
        let mut unused = Connection::open_in_memory().unwrap();

        let holder = fast(TableLocker::new(Dialect::Sqlite, open(&path)));
        holder.lock(&Context::new(), &mut unused).unwrap();

        let ctx = Context::new();
        ctx.cancel();
        let contender = fast(TableLocker::new(Dialect::Sqlite, open(&path)));
        assert!(matches!(
            contender.lock(&ctx, &mut unused),
            Err(Error::Cancelled)
        ));
        holder.unlock(&Context::new(), &mut unused).unwrap();
    }

    #[test]
    fn sqlite_has_no_session_locker() {
        assert!(matches!(
            SessionLocker::try_new(Dialect::Sqlite),
            Err(Error::Unsupported(_, Dialect::Sqlite))
        ));
    }
}
