//! Per-account mutual exclusion on top of the shared store
//!
//! A lease is a store entry keyed by the lower-cased sender address holding a
//! random owner token. Whoever creates the entry owns the account until the
//! lease is released or its TTL runs out. Waiters poll with exponential
//! backoff; there is no queue and no fairness.

use crate::contracts::format_address;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::store::SharedStore;

use ethers::types::Address;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Backoff for the `attempt`-th retry: doubles from `initial`, capped at `max`,
/// with up to 10% jitter
pub fn lock_backoff(attempt: u32, initial: Duration, max: Duration) -> Duration {
    let base_ms = initial.as_millis() as u64;
    let max_ms = max.as_millis() as u64;

    let exponential = 2u64.saturating_pow(attempt.saturating_sub(1));
    let delay_ms = base_ms.saturating_mul(exponential).min(max_ms);

    let jitter_range = delay_ms / 10;
    let jitter = if jitter_range > 0 {
        rand::thread_rng().gen_range(0..jitter_range)
    } else {
        0
    };

    Duration::from_millis((delay_ms + jitter).min(max_ms))
}

/// Acquires account leases
pub struct AccountLock {
    store: Arc<dyn SharedStore>,
    poll_initial: Duration,
    poll_max: Duration,
}

impl AccountLock {
    pub fn new(store: Arc<dyn SharedStore>, poll_initial: Duration, poll_max: Duration) -> Self {
        Self {
            store,
            poll_initial,
            poll_max,
        }
    }

    /// Store key guarding `address`
    pub fn key(address: &Address) -> String {
        format_address(address)
    }

    /// Wait up to `max_wait` for exclusive use of `address`
    pub async fn acquire(
        &self,
        address: &Address,
        ttl: Duration,
        max_wait: Duration,
    ) -> CoordinatorResult<LockLease> {
        let key = Self::key(address);
        let token = uuid::Uuid::new_v4().to_string();
        let started = Instant::now();
        let deadline = started + max_wait;
        let mut attempt = 0u32;

        loop {
            if self.store.put_if_absent(&key, &token, ttl).await? {
                let waited = started.elapsed();
                crate::metrics::record_lock_wait(waited.as_secs_f64());
                debug!("Locked {} after {:?} ({} retries)", key, waited, attempt);
                return Ok(LockLease {
                    store: self.store.clone(),
                    key,
                    token,
                    released: AtomicBool::new(false),
                });
            }

            let now = Instant::now();
            if now >= deadline {
                crate::metrics::record_lock_timeout();
                warn!("Gave up waiting for lock on {} after {:?}", key, max_wait);
                return Err(CoordinatorError::LockTimeout {
                    address: key,
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }

            attempt += 1;
            let delay = lock_backoff(attempt, self.poll_initial, self.poll_max).min(deadline - now);
            tokio::time::sleep(delay).await;
        }
    }
}

/// Ownership of one account; release it as soon as the transaction is submitted
pub struct LockLease {
    store: Arc<dyn SharedStore>,
    key: String,
    token: String,
    released: AtomicBool,
}

impl LockLease {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Release the lease; only the first call touches the store
    ///
    /// Returns false when the lease had already expired and someone else owns
    /// the account now, in which case their entry is left alone.
    pub async fn release(&self) -> CoordinatorResult<bool> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }

        let removed = self.store.remove_if(&self.key, &self.token).await?;
        if removed {
            debug!("Released lock on {}", self.key);
        } else {
            warn!("Lock on {} expired before release", self.key);
        }
        Ok(removed)
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

impl Drop for LockLease {
    fn drop(&mut self) {
        if self.is_released() {
            return;
        }

        let store = self.store.clone();
        let key = std::mem::take(&mut self.key);
        let token = std::mem::take(&mut self.token);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = store.remove_if(&key, &token).await {
                        warn!("Deferred release of lock on {} failed: {}", key, e);
                    }
                });
            }
            Err(_) => warn!("Lock on {} dropped outside a runtime; it will expire", key),
        }
    }
}
