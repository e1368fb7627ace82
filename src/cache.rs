use crate::verdict::SpfVerdict;
use std::collections::hash_map::RandomState;
use std::hash::BuildHasher;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Bucket count used by the daemon.
pub const DEFAULT_BUCKETS: usize = 1 << 16;

#[derive(Debug, Clone)]
struct CacheEntry {
    key: String,
    verdict: SpfVerdict,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Time-bounded memory of SPF verdicts keyed by `client|domain`.
///
/// The bucket table is allocated once and never resized. Expired entries are
/// not swept; they stay in place until a later `put` into the same bucket
/// reuses the slot.
pub struct ResultCache {
    buckets: Mutex<Vec<Vec<CacheEntry>>>,
    mask: usize,
    ttl: Duration,
    hasher: RandomState,
}

impl ResultCache {
    pub fn new(ttl: Duration) -> Self {
        Self::with_buckets(ttl, DEFAULT_BUCKETS)
    }

    /// `buckets` is rounded up to the next power of two.
    pub fn with_buckets(ttl: Duration, buckets: usize) -> Self {
        let size = buckets.max(1).next_power_of_two();
        ResultCache {
            buckets: Mutex::new(vec![Vec::new(); size]),
            mask: size - 1,
            ttl,
            hasher: RandomState::new(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn get(&self, key: &str) -> Option<SpfVerdict> {
        self.get_at(key, Instant::now())
    }

    pub fn put(&self, key: &str, verdict: SpfVerdict) {
        self.put_at(key, verdict, Instant::now())
    }

    /// Look up `key` as of `now`. Never modifies the table.
    pub fn get_at(&self, key: &str, now: Instant) -> Option<SpfVerdict> {
        let index = self.bucket_index(key);
        let buckets = self.lock();
        buckets[index]
            .iter()
            .find(|entry| entry.is_live(now) && entry.key == key)
            .map(|entry| entry.verdict)
    }

    /// Remember `verdict` for `key` until `now + ttl`.
    ///
    /// A live entry for the same key is left untouched. Otherwise the first
    /// expired slot in the bucket is overwritten, and only when none exists
    /// does the bucket grow.
    pub fn put_at(&self, key: &str, verdict: SpfVerdict, now: Instant) {
        if !verdict.is_cacheable() {
            return;
        }

        let Some(expires_at) = now.checked_add(self.ttl) else {
            log::warn!("Cache TTL {:?} out of range, not caching {key}", self.ttl);
            return;
        };
        let index = self.bucket_index(key);
        let mut buckets = self.lock();
        let bucket = &mut buckets[index];

        if bucket.iter().any(|entry| entry.is_live(now) && entry.key == key) {
            return;
        }

        if let Some(slot) = bucket.iter_mut().find(|entry| !entry.is_live(now)) {
            slot.key.clear();
            slot.key.push_str(key);
            slot.verdict = verdict;
            slot.expires_at = expires_at;
            return;
        }

        if let Err(e) = bucket.try_reserve(1) {
            log::error!("Cache entry allocation failed, not caching {key}: {e}");
            return;
        }
        bucket.push(CacheEntry {
            key: key.to_string(),
            verdict,
            expires_at,
        });
    }

    /// Number of stored entries, live or expired.
    pub fn len(&self) -> usize {
        self.lock().iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Release every entry. Called once at shutdown.
    pub fn teardown(&self) {
        let mut buckets = self.lock();
        let released: usize = buckets.iter().map(Vec::len).sum();
        for bucket in buckets.iter_mut() {
            *bucket = Vec::new();
        }
        log::debug!("Cache torn down, {released} entries released");
    }

    #[cfg(test)]
    fn bucket_len(&self, key: &str) -> usize {
        let index = self.bucket_index(key);
        self.lock()[index].len()
    }

    fn bucket_index(&self, key: &str) -> usize {
        (self.hasher.hash_one(key) as usize) & self.mask
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Vec<CacheEntry>>> {
        match self.buckets.lock() {
            Ok(guard) => guard,
            Err(_) => {
                // A panic while holding the lock leaves the table in an unknown state
                log::error!("Result cache mutex poisoned, terminating");
                std::process::abort();
            }
        }
    }
}
