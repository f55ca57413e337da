//! Cross-process write leases.
//!
//! A lease grants one holder exclusive permission to mutate a shared
//! resource (the graph store, and the vector writes paired with it) for the
//! span of a single write transaction. Leases live in a small SQLite table
//! that every process opens; `BEGIN IMMEDIATE` serializes the
//! check-and-claim step across processes.
//!
//! A lease is stale once it outlives `stale_after` or its holder process no
//! longer exists. The next acquirer reclaims a stale lease instead of waiting,
//! so a crashed holder can never block everyone else.
//!
//! ## Example
//!
//! ```rust,ignore
//! use mnemos_core::lock::{HolderIdentity, LeaseConfig, LeaseManager};
//!
//! let leases = LeaseManager::open("/tmp/mnemos/leases.db", LeaseConfig::default())?;
//! let holder = HolderIdentity::current("ingest");
//! {
//!     let _guard = leases.acquire_guard("graph", &holder, leases.config().acquire_timeout)?;
//!     // write both stores
//! } // released here, including on early return
//! ```

use crate::error::{Error, ErrorKind, Result};
use crate::memory::schema::{configure_connection, initialize_schema, SchemaComponent};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

/// Resource key guarding the graph store and paired vector writes.
pub const STORE_RESOURCE: &str = "memory-stores";

/// Lease timing configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaseConfig {
    /// Age after which a lease is stale regardless of its holder
    #[serde(with = "duration_millis")]
    pub stale_after: Duration,
    /// Default bounded wait for `acquire`
    #[serde(with = "duration_millis")]
    pub acquire_timeout: Duration,
    /// First retry delay
    #[serde(with = "duration_millis")]
    pub initial_backoff: Duration,
    /// Backoff ceiling
    #[serde(with = "duration_millis")]
    pub max_backoff: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(30),
            acquire_timeout: Duration::from_secs(5),
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(500),
        }
    }
}

/// Who is asking for a lease.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HolderIdentity {
    /// Unique per write transaction
    pub id: String,
    /// OS process that owns the transaction
    pub pid: u32,
}

impl HolderIdentity {
    /// A fresh identity in the current process.
    pub fn current(label: &str) -> Self {
        let pid = std::process::id();
        Self {
            id: format!("{}:{}:{}", label, pid, Uuid::new_v4().simple()),
            pid,
        }
    }
}

/// A granted lease.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub resource_key: String,
    pub holder_id: String,
    pub holder_pid: u32,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Previous holder when this lease was taken over from a stale one
    pub reclaimed_from: Option<String>,
}

impl Lease {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn was_reclaimed(&self) -> bool {
        self.reclaimed_from.is_some()
    }
}

/// Grants and reclaims leases stored in a shared SQLite table.
pub struct LeaseManager {
    conn: Arc<Mutex<Connection>>,
    config: LeaseConfig,
}

impl LeaseManager {
    /// Open or create the lease table at the given path.
    pub fn open(path: impl AsRef<Path>, config: LeaseConfig) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| Error::unavailable(e.to_string()))?;
        configure_connection(&conn)?;
        initialize_schema(&conn, SchemaComponent::Lease)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            config,
        })
    }

    /// In-memory lease table (single process, for testing).
    pub fn in_memory(config: LeaseConfig) -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| Error::unavailable(e.to_string()))?;
        initialize_schema(&conn, SchemaComponent::Lease)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            config,
        })
    }

    pub fn config(&self) -> &LeaseConfig {
        &self.config
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| Error::Internal(format!("Failed to lock lease connection: {}", e)))?;
        f(&mut conn)
    }

    /// Single attempt. Fails with `Contention` when a live holder owns the lease.
    pub fn try_acquire(&self, resource_key: &str, holder: &HolderIdentity) -> Result<Lease> {
        let stale_after_ms = self.config.stale_after.as_millis() as i64;

        self.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let now_ms = Utc::now().timestamp_millis();

            let existing = tx
                .query_row(
                    "SELECT resource_key, holder_id, holder_pid, acquired_at, expires_at
                     FROM leases WHERE resource_key = ?1",
                    params![resource_key],
                    row_to_lease,
                )
                .optional()?;

            let mut reclaimed_from = None;
            if let Some(current) = existing {
                if current.holder_id != holder.id {
                    let expired = now_ms >= current.expires_at.timestamp_millis();
                    let holder_alive = is_process_alive(current.holder_pid);
                    if !expired && holder_alive {
                        return Err(Error::contention(resource_key, current.holder_id));
                    }
                    warn!(
                        resource = resource_key,
                        previous_holder = %current.holder_id,
                        previous_pid = current.holder_pid,
                        age_ms = now_ms - current.acquired_at.timestamp_millis(),
                        expired,
                        holder_alive,
                        "Reclaiming stale lease"
                    );
                    reclaimed_from = Some(current.holder_id);
                }
            }

            let expires_ms = now_ms + stale_after_ms;
            tx.execute(
                "INSERT INTO leases (resource_key, holder_id, holder_pid, acquired_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(resource_key) DO UPDATE SET
                    holder_id = excluded.holder_id,
                    holder_pid = excluded.holder_pid,
                    acquired_at = excluded.acquired_at,
                    expires_at = excluded.expires_at",
                params![resource_key, holder.id, holder.pid as i64, now_ms, expires_ms],
            )?;
            tx.commit()?;

            debug!(resource = resource_key, holder = %holder.id, "Lease acquired");

            Ok(Lease {
                resource_key: resource_key.to_string(),
                holder_id: holder.id.clone(),
                holder_pid: holder.pid,
                acquired_at: millis_to_datetime(now_ms),
                expires_at: millis_to_datetime(expires_ms),
                reclaimed_from,
            })
        })
    }

    /// Retry with bounded exponential backoff until `timeout` elapses.
    ///
    /// Storage failures are returned immediately; only contention is retried.
    pub fn acquire(
        &self,
        resource_key: &str,
        holder: &HolderIdentity,
        timeout: Duration,
    ) -> Result<Lease> {
        let start = Instant::now();
        let mut backoff = self.config.initial_backoff;

        loop {
            match self.try_acquire(resource_key, holder) {
                Ok(lease) => return Ok(lease),
                Err(e) if e.kind() == ErrorKind::Contention => {
                    let elapsed = start.elapsed();
                    if elapsed >= timeout {
                        return Err(Error::lease_timeout(
                            resource_key,
                            elapsed.as_millis() as u64,
                        ));
                    }
                    let remaining = timeout - elapsed;
                    std::thread::sleep(backoff.min(remaining));
                    backoff = (backoff * 2).min(self.config.max_backoff);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Acquire and wrap in a guard that releases on drop.
    pub fn acquire_guard(
        &self,
        resource_key: &str,
        holder: &HolderIdentity,
        timeout: Duration,
    ) -> Result<LeaseGuard<'_>> {
        let lease = self.acquire(resource_key, holder, timeout)?;
        Ok(LeaseGuard {
            manager: self,
            lease,
            released: false,
        })
    }

    /// Non-blocking variant of [`acquire_guard`](Self::acquire_guard).
    pub fn try_acquire_guard(
        &self,
        resource_key: &str,
        holder: &HolderIdentity,
    ) -> Result<LeaseGuard<'_>> {
        let lease = self.try_acquire(resource_key, holder)?;
        Ok(LeaseGuard {
            manager: self,
            lease,
            released: false,
        })
    }

    /// Release a lease. Returns false if it had already been reclaimed.
    pub fn release(&self, lease: &Lease) -> Result<bool> {
        let released = self.with_conn(|conn| {
            let rows = conn.execute(
                "DELETE FROM leases WHERE resource_key = ?1 AND holder_id = ?2",
                params![lease.resource_key, lease.holder_id],
            )?;
            Ok(rows > 0)
        })?;

        if released {
            debug!(resource = %lease.resource_key, holder = %lease.holder_id, "Lease released");
        } else {
            warn!(
                resource = %lease.resource_key,
                holder = %lease.holder_id,
                "Lease was reclaimed before release"
            );
        }
        Ok(released)
    }

    /// The lease currently recorded for a resource, stale or not.
    pub fn current(&self, resource_key: &str) -> Result<Option<Lease>> {
        self.with_conn(|conn| {
            let lease = conn
                .query_row(
                    "SELECT resource_key, holder_id, holder_pid, acquired_at, expires_at
                     FROM leases WHERE resource_key = ?1",
                    params![resource_key],
                    row_to_lease,
                )
                .optional()?;
            Ok(lease)
        })
    }

    /// Number of recorded leases that are neither expired nor orphaned.
    pub fn active_count(&self) -> Result<usize> {
        let now = Utc::now();
        let leases = self.all()?;
        Ok(leases
            .iter()
            .filter(|l| !l.is_expired_at(now) && is_process_alive(l.holder_pid))
            .count())
    }

    /// Delete every stale lease. Returns how many were removed.
    pub fn reclaim_stale(&self) -> Result<usize> {
        let now = Utc::now();
        let stale: Vec<Lease> = self
            .all()?
            .into_iter()
            .filter(|l| l.is_expired_at(now) || !is_process_alive(l.holder_pid))
            .collect();

        let mut removed = 0;
        for lease in &stale {
            let deleted = self.with_conn(|conn| {
                // Only delete if nobody re-acquired in between
                let rows = conn.execute(
                    "DELETE FROM leases WHERE resource_key = ?1 AND holder_id = ?2",
                    params![lease.resource_key, lease.holder_id],
                )?;
                Ok(rows)
            })?;
            if deleted > 0 {
                warn!(resource = %lease.resource_key, holder = %lease.holder_id, "Swept stale lease");
                removed += deleted;
            }
        }
        Ok(removed)
    }

    fn all(&self) -> Result<Vec<Lease>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT resource_key, holder_id, holder_pid, acquired_at, expires_at FROM leases",
            )?;
            let rows = stmt.query_map([], row_to_lease)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }
}

/// Releases its lease when dropped.
pub struct LeaseGuard<'a> {
    manager: &'a LeaseManager,
    lease: Lease,
    released: bool,
}

impl LeaseGuard<'_> {
    pub fn lease(&self) -> &Lease {
        &self.lease
    }

    /// Release now and report whether the lease was still ours.
    pub fn release(mut self) -> Result<bool> {
        self.released = true;
        self.manager.release(&self.lease)
    }
}

impl Drop for LeaseGuard<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.manager.release(&self.lease) {
            warn!(resource = %self.lease.resource_key, error = %e, "Failed to release lease on drop");
        }
    }
}

fn row_to_lease(row: &rusqlite::Row) -> rusqlite::Result<Lease> {
    Ok(Lease {
        resource_key: row.get(0)?,
        holder_id: row.get(1)?,
        holder_pid: row.get::<_, i64>(2)? as u32,
        acquired_at: millis_to_datetime(row.get(3)?),
        expires_at: millis_to_datetime(row.get(4)?),
        reclaimed_from: None,
    })
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or_else(Utc::now)
}

/// Check if a process is alive by sending signal 0.
#[cfg(unix)]
pub fn is_process_alive(pid: u32) -> bool {
    if pid == 0 {
        return true;
    }
    if pid > i32::MAX as u32 {
        return false;
    }
    // SAFETY: signal 0 performs only the existence and permission check
    let rc = unsafe { libc::kill(pid as i32, 0) };
    if rc == 0 {
        return true;
    }
    // EPERM means the process exists but belongs to someone else
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Without a liveness check, rely on age-based staleness alone.
#[cfg(not(unix))]
pub fn is_process_alive(_pid: u32) -> bool {
    true
}

pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    /// A pid no real process can have on Linux or macOS.
    const DEAD_PID: u32 = 2_000_000_000;

    fn fast_config() -> LeaseConfig {
        LeaseConfig {
            stale_after: Duration::from_millis(200),
            acquire_timeout: Duration::from_millis(100),
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
        }
    }

    #[test]
    fn test_acquire_and_release() {
        let leases = LeaseManager::in_memory(LeaseConfig::default()).unwrap();
        let holder = HolderIdentity::current("test");

        let lease = leases.try_acquire("graph", &holder).unwrap();
        assert_eq!(lease.holder_id, holder.id);
        assert!(!lease.was_reclaimed());
        assert_eq!(leases.active_count().unwrap(), 1);

        assert!(leases.release(&lease).unwrap());
        assert!(leases.current("graph").unwrap().is_none());
    }

    #[test]
    fn test_live_holder_blocks_others() {
        let leases = LeaseManager::in_memory(LeaseConfig::default()).unwrap();
        let a = HolderIdentity::current("a");
        let b = HolderIdentity::current("b");

        let _lease = leases.try_acquire("graph", &a).unwrap();
        let err = leases.try_acquire("graph", &b).unwrap_err();
        assert!(matches!(err, Error::Contention { .. }));
        assert!(err.is_retryable());

        // Other resources are independent
        assert!(leases.try_acquire("other", &b).is_ok());
    }

    #[test]
    fn test_acquire_times_out_with_retryable_error() {
        let leases = LeaseManager::in_memory(fast_config()).unwrap();
        let a = HolderIdentity::current("a");
        let b = HolderIdentity::current("b");

        let _lease = leases.try_acquire("graph", &a).unwrap();
        let started = Instant::now();
        let err = leases
            .acquire("graph", &b, Duration::from_millis(50))
            .unwrap_err();
        assert!(matches!(err, Error::LeaseTimeout { .. }));
        assert!(err.is_retryable());
        assert!(started.elapsed() < Duration::from_millis(190));
    }

    #[test]
    fn test_dead_holder_is_reclaimed_immediately() {
        let leases = LeaseManager::in_memory(LeaseConfig::default()).unwrap();
        let crashed = HolderIdentity {
            id: "crashed".to_string(),
            pid: DEAD_PID,
        };
        let b = HolderIdentity::current("b");

        leases.try_acquire("graph", &crashed).unwrap();
        let lease = leases.try_acquire("graph", &b).unwrap();
        assert_eq!(lease.reclaimed_from.as_deref(), Some("crashed"));
    }

    #[test]
    fn test_expired_lease_is_reclaimed_after_threshold() {
        let leases = LeaseManager::in_memory(fast_config()).unwrap();
        let a = HolderIdentity::current("a");
        let b = HolderIdentity::current("b");

        leases.try_acquire("graph", &a).unwrap();
        assert!(leases.try_acquire("graph", &b).is_err());

        thread::sleep(Duration::from_millis(250));
        let lease = leases
            .acquire("graph", &b, Duration::from_millis(100))
            .unwrap();
        assert_eq!(lease.reclaimed_from.as_deref(), Some(a.id.as_str()));
    }

    #[test]
    fn test_release_after_reclaim_reports_false() {
        let leases = LeaseManager::in_memory(LeaseConfig::default()).unwrap();
        let crashed = HolderIdentity {
            id: "crashed".to_string(),
            pid: DEAD_PID,
        };
        let stale = leases.try_acquire("graph", &crashed).unwrap();
        let _new = leases
            .try_acquire("graph", &HolderIdentity::current("b"))
            .unwrap();

        assert!(!leases.release(&stale).unwrap());
        assert!(leases.current("graph").unwrap().is_some());
    }

    #[test]
    fn test_guard_releases_on_drop_and_early_return() {
        let leases = LeaseManager::in_memory(LeaseConfig::default()).unwrap();
        let holder = HolderIdentity::current("guard");

        fn failing_write(leases: &LeaseManager, holder: &HolderIdentity) -> Result<()> {
            let _guard = leases.acquire_guard("graph", holder, Duration::from_millis(10))?;
            Err(Error::unavailable("disk gone"))
        }

        assert!(failing_write(&leases, &holder).is_err());
        assert!(leases.current("graph").unwrap().is_none());

        let guard = leases.try_acquire_guard("graph", &holder).unwrap();
        assert_eq!(guard.lease().resource_key, "graph");
        assert!(guard.release().unwrap());
        assert!(leases.current("graph").unwrap().is_none());
    }

    #[test]
    fn test_reclaim_stale_sweeps_dead_holders() {
        let leases = LeaseManager::in_memory(LeaseConfig::default()).unwrap();
        leases
            .try_acquire(
                "a",
                &HolderIdentity {
                    id: "dead".into(),
                    pid: DEAD_PID,
                },
            )
            .unwrap();
        leases
            .try_acquire("b", &HolderIdentity::current("live"))
            .unwrap();

        assert_eq!(leases.reclaim_stale().unwrap(), 1);
        assert!(leases.current("a").unwrap().is_none());
        assert!(leases.current("b").unwrap().is_some());
    }

    #[test]
    fn test_current_process_is_alive() {
        assert!(is_process_alive(std::process::id()));
        #[cfg(unix)]
        assert!(!is_process_alive(DEAD_PID));
    }

    #[test]
    fn test_mutual_exclusion_across_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leases.db");
        // Initialize once so concurrent opens only attach
        LeaseManager::open(&path, LeaseConfig::default()).unwrap();

        let inside = Arc::new(AtomicUsize::new(0));
        let acquisitions = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();

        for worker in 0..6 {
            let path = path.clone();
            let inside = Arc::clone(&inside);
            let acquisitions = Arc::clone(&acquisitions);
            handles.push(thread::spawn(move || {
                // Separate connection per worker, like separate processes
                let leases = LeaseManager::open(&path, LeaseConfig::default()).unwrap();
                for _ in 0..5 {
                    let holder = HolderIdentity::current(&format!("w{}", worker));
                    let guard = leases
                        .acquire_guard("graph", &holder, Duration::from_secs(20))
                        .unwrap();
                    let before = inside.fetch_add(1, Ordering::SeqCst);
                    assert_eq!(before, 0, "two holders inside the critical section");
                    thread::sleep(Duration::from_millis(2));
                    inside.fetch_sub(1, Ordering::SeqCst);
                    acquisitions.fetch_add(1, Ordering::SeqCst);
                    assert!(guard.release().unwrap());
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(acquisitions.load(Ordering::SeqCst), 30);
    }
}
