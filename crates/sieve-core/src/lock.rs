//! Distributed lock over a strongly-consistent record store.
//!
//! The lock is optimistic: there is no queue of waiters, only conditional
//! writes against one record per resource key.
//!
//! # How It Works
//!
//! 1. Read the lock record with strong consistency.
//! 2. Absent: create it with a create-if-absent write. Only one writer wins.
//! 3. Present and expired: overwrite it with an update conditioned on the
//!    holder field still being the holder just observed, so two callers that
//!    both saw the same expired lease cannot both take it over.
//! 4. Present, unexpired and ours (same holder token): already held.
//! 5. Otherwise sleep for a fixed interval and start again.
//!
//! Release is a delete conditioned on the holder field. A caller whose lease
//! was taken over gets [`Error::LockNotHeld`] instead of deleting the new
//! holder's record.
//!
//! There is no fairness guarantee; heavy contention can starve a waiter.
//!
//! # Example
//!
//! ```rust,ignore
//! let lock = DistributedLock::new(store.clone(), "req/data/3");
//!
//! let guard = lock.acquire().await?;
//! // ... read-modify-write the chunk ...
//! guard.release().await?;
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::id::HolderToken;
use crate::record::{from_record, to_record, Condition, RecordStore, WriteOutcome};

/// Default table holding lock records.
pub const DEFAULT_LOCK_TABLE: &str = "locks";

/// Default lease (60 seconds).
pub const DEFAULT_LEASE: Duration = Duration::from_secs(60);

/// Default fixed wait between acquisition attempts.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Name of the holder attribute; release and takeover are conditioned on it.
const HOLDER_FIELD: &str = "LockHolder";

/// Lock record contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LockRecord {
    /// The resource this lock protects.
    pub lock_key: String,

    /// Token of the current holder.
    pub lock_holder: String,

    /// When the lease lapses. `None` means the lock never expires.
    pub expiration_time: Option<DateTime<Utc>>,

    /// When the current holder acquired the lock.
    pub acquired_at: DateTime<Utc>,
}

impl LockRecord {
    /// Creates a record for `holder` with the given lease.
    #[must_use]
    pub fn new(lock_key: impl Into<String>, holder: &HolderToken, lease: Option<Duration>) -> Self {
        let now = Utc::now();
        Self {
            lock_key: lock_key.into(),
            lock_holder: holder.as_str().to_string(),
            // A lease too large to represent behaves like no expiry.
            expiration_time: lease
                .and_then(|lease| chrono::Duration::from_std(lease).ok())
                .and_then(|lease| now.checked_add_signed(lease)),
            acquired_at: now,
        }
    }

    /// Returns whether the lease has lapsed.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expiration_time
            .is_some_and(|expires_at| Utc::now() >= expires_at)
    }

    /// Returns the remaining lease, `None` for a lock without expiry.
    #[must_use]
    pub fn remaining_lease(&self) -> Option<Duration> {
        self.expiration_time.map(|expires_at| {
            let millis = (expires_at - Utc::now()).num_milliseconds();
            u64::try_from(millis).map_or(Duration::ZERO, Duration::from_millis)
        })
    }
}

/// Lease and polling settings for a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    /// Lease granted on acquisition. `None` disables expiry.
    pub lease: Option<Duration>,
    /// Fixed wait between acquisition attempts.
    pub poll_interval: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            lease: Some(DEFAULT_LEASE),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Outcome of a single acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireAttempt {
    /// The caller now holds the lock.
    Acquired,
    /// Another holder has the lock (or won the race for it).
    Contended {
        /// The holder observed, if known.
        holder: Option<String>,
    },
}

/// A distributed lock on one resource key.
pub struct DistributedLock<R: RecordStore + ?Sized> {
    store: Arc<R>,
    table: String,
    key: String,
    holder: HolderToken,
    options: LockOptions,
}

// Manual Clone implementation to avoid requiring R: Clone
impl<R: RecordStore + ?Sized> Clone for DistributedLock<R> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            table: self.table.clone(),
            key: self.key.clone(),
            holder: self.holder.clone(),
            options: self.options,
        }
    }
}

impl<R: RecordStore + ?Sized> DistributedLock<R> {
    /// Creates a lock handle with a fresh holder token and default options.
    #[must_use]
    pub fn new(store: Arc<R>, key: impl Into<String>) -> Self {
        Self {
            store,
            table: DEFAULT_LOCK_TABLE.to_string(),
            key: key.into(),
            holder: HolderToken::generate(),
            options: LockOptions::default(),
        }
    }

    /// Uses an explicit holder token (handles sharing a token are reentrant).
    #[must_use]
    pub fn with_holder(mut self, holder: HolderToken) -> Self {
        self.holder = holder;
        self
    }

    /// Stores lock records in `table`.
    #[must_use]
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    /// Overrides lease and polling settings.
    #[must_use]
    pub const fn with_options(mut self, options: LockOptions) -> Self {
        self.options = options;
        self
    }

    /// Returns the holder token for this handle.
    #[must_use]
    pub fn holder(&self) -> &HolderToken {
        &self.holder
    }

    /// Returns the resource key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Makes one acquisition attempt.
    ///
    /// # Errors
    ///
    /// Returns an error only if the record store fails; losing a race is
    /// reported as [`AcquireAttempt::Contended`].
    pub async fn try_acquire(&self) -> Result<AcquireAttempt> {
        let Some(current) = self.read().await? else {
            let record = to_record(&LockRecord::new(
                &self.key,
                &self.holder,
                self.options.lease,
            ))?;
            return Ok(
                match self
                    .store
                    .put(&self.table, &self.key, record, Condition::NotExists)
                    .await?
                {
                    WriteOutcome::Applied => AcquireAttempt::Acquired,
                    WriteOutcome::ConditionFailed => AcquireAttempt::Contended { holder: None },
                },
            );
        };

        if current.is_expired() {
            let record = to_record(&LockRecord::new(
                &self.key,
                &self.holder,
                self.options.lease,
            ))?;
            let outcome = self
                .store
                .update(
                    &self.table,
                    &self.key,
                    record,
                    Condition::field_equals(HOLDER_FIELD, current.lock_holder.clone()),
                )
                .await?;
            return Ok(match outcome {
                WriteOutcome::Applied => {
                    if current.lock_holder != self.holder.as_str() {
                        tracing::warn!(
                            lock_key = %self.key,
                            previous_holder = %current.lock_holder,
                            holder = %self.holder,
                            "took over expired lock"
                        );
                    }
                    AcquireAttempt::Acquired
                }
                WriteOutcome::ConditionFailed => AcquireAttempt::Contended { holder: None },
            });
        }

        if current.lock_holder == self.holder.as_str() {
            return Ok(AcquireAttempt::Acquired);
        }

        Ok(AcquireAttempt::Contended {
            holder: Some(current.lock_holder),
        })
    }

    /// Busy-polls until the lock is held.
    ///
    /// # Errors
    ///
    /// Returns an error if the record store fails. Contention is never an
    /// error; this call waits for as long as it takes.
    pub async fn acquire(&self) -> Result<LockGuard<R>> {
        self.acquire_inner(None).await
    }

    /// Busy-polls until the lock is held or `max_wait` has elapsed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockTimeout`] when the wait is exhausted, or a store error.
    pub async fn acquire_timeout(&self, max_wait: Duration) -> Result<LockGuard<R>> {
        self.acquire_inner(Some(max_wait)).await
    }

    async fn acquire_inner(&self, max_wait: Option<Duration>) -> Result<LockGuard<R>> {
        let started = Instant::now();
        let mut attempts: u64 = 0;

        loop {
            attempts += 1;
            match self.try_acquire().await? {
                AcquireAttempt::Acquired => {
                    tracing::debug!(
                        lock_key = %self.key,
                        holder = %self.holder,
                        attempts,
                        "lock acquired"
                    );
                    return Ok(LockGuard {
                        lock: self.clone(),
                        released: false,
                    });
                }
                AcquireAttempt::Contended { holder } => {
                    let waited = started.elapsed();
                    if max_wait.is_some_and(|max| waited >= max) {
                        return Err(Error::LockTimeout {
                            key: self.key.clone(),
                            waited,
                        });
                    }
                    tracing::trace!(
                        lock_key = %self.key,
                        current_holder = ?holder,
                        attempts,
                        "waiting to acquire lock"
                    );
                    tokio::time::sleep(self.options.poll_interval).await;
                }
            }
        }
    }

    /// Releases the lock if this handle's token holds it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockNotHeld`] if the record is missing or held by a
    /// different token. The record is left untouched in that case.
    pub async fn release(&self) -> Result<()> {
        let outcome = self
            .store
            .delete(
                &self.table,
                &self.key,
                Condition::field_equals(HOLDER_FIELD, self.holder.as_str()),
            )
            .await?;

        match outcome {
            WriteOutcome::Applied => {
                tracing::debug!(lock_key = %self.key, holder = %self.holder, "lock released");
                Ok(())
            }
            WriteOutcome::ConditionFailed => Err(Error::LockNotHeld {
                key: self.key.clone(),
                holder: self.holder.to_string(),
            }),
        }
    }

    /// Reads the current lock record without acquiring the lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be read or parsed.
    pub async fn read(&self) -> Result<Option<LockRecord>> {
        self.store
            .get(&self.table, &self.key)
            .await?
            .map(from_record)
            .transpose()
    }

    /// Checks if the lock is currently held by anyone with a live lease.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock state could not be read.
    pub async fn is_locked(&self) -> Result<bool> {
        Ok(self.read().await?.is_some_and(|record| !record.is_expired()))
    }
}

/// RAII guard for a held lock.
///
/// Prefer [`LockGuard::release`]; dropping an unreleased guard spawns a
/// best-effort release and relies on the lease if no runtime is available.
pub struct LockGuard<R: RecordStore + ?Sized> {
    lock: DistributedLock<R>,
    released: bool,
}

impl<R: RecordStore + ?Sized> LockGuard<R> {
    /// Returns the holder token.
    #[must_use]
    pub fn holder(&self) -> &HolderToken {
        self.lock.holder()
    }

    /// Returns the resource key.
    #[must_use]
    pub fn key(&self) -> &str {
        self.lock.key()
    }

    /// Explicitly releases the lock.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockNotHeld`] if the lease was taken over meanwhile.
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        self.lock.release().await
    }
}

impl<R: RecordStore + ?Sized> Drop for LockGuard<R> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let lock = self.lock.clone();
        handle.spawn(async move {
            if let Err(err) = lock.release().await {
                tracing::warn!(lock_key = %lock.key(), error = %err, "background lock release failed");
            }
        });
    }
}
