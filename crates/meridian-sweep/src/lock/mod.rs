//! The cross-process persistent lock.
//!
//! Sweeping and backups must not overlap: a sweep that deletes versions
//! while a backup streams the same table produces a backup that never
//! existed. Both sides take this lock first. Unlike the lease-based row
//! locks, the persistent lock lives in the store itself, survives
//! restarts, and is held until explicitly released.
//!
//! The lock is one CAS-managed row whose value is either the
//! distinguished open entry or the holder's entry. Acquisition swaps
//! open for a fresh holder entry; release swaps the caller's own entry
//! back. A crashed holder leaves the row taken until an operator
//! force-releases it.

use std::sync::Arc;

use meridian_common::types::{Cell, TableRef, Timestamp, Value};
use meridian_common::{MeridianError, MeridianResult, CAS_CELL_TIMESTAMP, PERSISTED_LOCKS_TABLE};
use meridian_kvs::{CheckAndSetRequest, KeyValueService, TableSchema};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Contents of the persistent lock row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockEntry {
    lock_id: u64,
    instance_id: u64,
    reason: String,
}

impl LockEntry {
    /// The distinguished entry meaning "nobody holds the lock".
    #[must_use]
    pub fn open() -> Self {
        Self {
            lock_id: 0,
            instance_id: 0,
            reason: String::new(),
        }
    }

    fn fresh(reason: &str) -> Self {
        Self {
            lock_id: rand::random(),
            instance_id: rand::random(),
            reason: reason.to_string(),
        }
    }

    /// True for the open entry.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.lock_id == 0 && self.instance_id == 0
    }

    /// The reason the holder recorded when acquiring.
    #[must_use]
    pub fn reason(&self) -> &str {
        &self.reason
    }

    fn encode(&self) -> MeridianResult<Value> {
        let bytes = bincode::serialize(self)
            .map_err(|err| MeridianError::internal(format!("lock entry encoding failed: {err}")))?;
        Ok(Value::from_vec(bytes))
    }

    fn decode(value: &Value) -> MeridianResult<Self> {
        bincode::deserialize(value.as_bytes()).map_err(|err| {
            MeridianError::corruption(format!("persistent lock row is unreadable: {err}"))
        })
    }

    fn describe(&self) -> String {
        if self.is_open() {
            "open".to_string()
        } else {
            format!(
                "lock {:#018x} (instance {:#018x}, reason: {})",
                self.lock_id, self.instance_id, self.reason
            )
        }
    }
}

/// Storage-backed mutual exclusion between sweep and backup.
pub trait PersistentLockService: Send + Sync {
    /// Takes the lock, recording `reason` with the holder entry.
    ///
    /// # Errors
    ///
    /// `PersistentLockHeld` when someone else holds it; storage errors
    /// otherwise.
    fn acquire_backup_lock(&self, reason: &str) -> MeridianResult<LockEntry>;

    /// Releases the lock, which must still hold the caller's `entry`.
    ///
    /// # Errors
    ///
    /// `PersistentLockNotHeld` when the row holds something else.
    fn release_backup_lock(&self, entry: &LockEntry) -> MeridianResult<()>;

    /// Operator override: opens the lock no matter who holds it.
    ///
    /// # Errors
    ///
    /// Storage errors only.
    fn force_release(&self) -> MeridianResult<()>;
}

/// Persistent lock stored as a CAS-managed row.
pub struct KvsBackedPersistentLockService {
    kvs: Arc<dyn KeyValueService>,
    table: TableRef,
}

impl KvsBackedPersistentLockService {
    /// Creates the service, seeding the open entry on first use.
    ///
    /// # Errors
    ///
    /// Fails when the lock table cannot be created or seeded.
    pub fn create(kvs: Arc<dyn KeyValueService>) -> MeridianResult<Self> {
        let table = TableRef::system(PERSISTED_LOCKS_TABLE);
        kvs.create_table(&table, &TableSchema::system())?;
        let service = Self { kvs, table };

        let request =
            CheckAndSetRequest::new_cell(service.table.clone(), &Self::cell(), LockEntry::open().encode()?);
        match service.kvs.check_and_set(&request) {
            // Lost to an earlier seeding or a current holder; the row
            // exists, which is all that matters here.
            Ok(()) | Err(MeridianError::CheckAndSetFailed { .. }) => Ok(service),
            Err(err) => Err(err),
        }
    }

    fn cell() -> Cell {
        Cell::new(&b"backup"[..], &b"l"[..])
    }

    fn current(&self) -> MeridianResult<LockEntry> {
        let read = self
            .kvs
            .get(&self.table, &Self::cell(), Timestamp::MAX)?
            .ok_or_else(|| MeridianError::internal("persistent lock row is missing"))?;
        LockEntry::decode(&read.value)
    }
}

impl PersistentLockService for KvsBackedPersistentLockService {
    fn acquire_backup_lock(&self, reason: &str) -> MeridianResult<LockEntry> {
        let entry = LockEntry::fresh(reason);
        let request = CheckAndSetRequest::update_cell(
            self.table.clone(),
            &Self::cell(),
            LockEntry::open().encode()?,
            entry.encode()?,
        );
        match self.kvs.check_and_set(&request) {
            Ok(()) => {
                info!(reason, "persistent lock acquired");
                Ok(entry)
            }
            Err(MeridianError::CheckAndSetFailed { .. }) => Err(MeridianError::PersistentLockHeld {
                holder: self.current()?.describe(),
            }),
            Err(err) => Err(err),
        }
    }

    fn release_backup_lock(&self, entry: &LockEntry) -> MeridianResult<()> {
        let request = CheckAndSetRequest::update_cell(
            self.table.clone(),
            &Self::cell(),
            entry.encode()?,
            LockEntry::open().encode()?,
        );
        match self.kvs.check_and_set(&request) {
            Ok(()) => Ok(()),
            Err(MeridianError::CheckAndSetFailed { .. }) => {
                let details = self.current()?.describe();
                warn!(details = %details, "persistent lock release refused");
                Err(MeridianError::PersistentLockNotHeld { details })
            }
            Err(err) => Err(err),
        }
    }

    fn force_release(&self) -> MeridianResult<()> {
        warn!("persistent lock force-released by operator override");
        self.kvs.put(
            &self.table,
            &[(Self::cell(), LockEntry::open().encode()?)],
            Timestamp::new(CAS_CELL_TIMESTAMP),
        )
    }
}

/// Stand-in for stores without check-and-set: every acquisition
/// succeeds.
///
/// Used only where the backend cannot express the real lock; the
/// mutual exclusion it provides is nothing, and the substitution is
/// logged when chosen.
pub struct NoOpPersistentLockService;

impl PersistentLockService for NoOpPersistentLockService {
    fn acquire_backup_lock(&self, reason: &str) -> MeridianResult<LockEntry> {
        let mut entry = LockEntry::fresh(reason);
        entry.reason = format!("no-op: {reason}");
        Ok(entry)
    }

    fn release_backup_lock(&self, _entry: &LockEntry) -> MeridianResult<()> {
        Ok(())
    }

    fn force_release(&self) -> MeridianResult<()> {
        Ok(())
    }
}

/// Picks the lock implementation the store can support.
///
/// # Errors
///
/// Fails when the KVS-backed service cannot be created.
pub fn create_persistent_lock_service(
    kvs: Arc<dyn KeyValueService>,
) -> MeridianResult<Arc<dyn PersistentLockService>> {
    if kvs.supports_check_and_set() {
        Ok(Arc::new(KvsBackedPersistentLockService::create(kvs)?))
    } else {
        warn!("store has no check-and-set; persistent locking is disabled");
        Ok(Arc::new(NoOpPersistentLockService))
    }
}

/// The sweeper's view of the persistent lock: single non-blocking
/// attempts, with the held entry kept inside.
pub struct PersistentLockManager {
    service: Arc<dyn PersistentLockService>,
    reason: String,
    held: Mutex<Option<LockEntry>>,
}

impl PersistentLockManager {
    /// Creates a manager acquiring under the given reason.
    #[must_use]
    pub fn new(service: Arc<dyn PersistentLockService>, reason: impl Into<String>) -> Self {
        Self {
            service,
            reason: reason.into(),
            held: Mutex::new(None),
        }
    }

    /// One acquisition attempt. `false` means someone else holds the
    /// lock and the caller should try again later.
    ///
    /// # Errors
    ///
    /// Storage errors; "already held" is not an error here.
    pub fn try_acquire(&self) -> MeridianResult<bool> {
        let mut held = self.held.lock();
        if held.is_some() {
            return Ok(true);
        }
        match self.service.acquire_backup_lock(&self.reason) {
            Ok(entry) => {
                *held = Some(entry);
                Ok(true)
            }
            Err(MeridianError::PersistentLockHeld { holder }) => {
                info!(holder = %holder, "persistent lock busy, will retry later");
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    /// Releases the lock if held.
    ///
    /// # Errors
    ///
    /// `PersistentLockNotHeld` when the row changed under us.
    pub fn release(&self) -> MeridianResult<()> {
        let entry = self.held.lock().take();
        match entry {
            Some(entry) => self.service.release_backup_lock(&entry),
            None => Ok(()),
        }
    }

    /// Whether this manager currently holds the lock.
    #[must_use]
    pub fn is_held(&self) -> bool {
        self.held.lock().is_some()
    }
}
