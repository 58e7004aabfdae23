//! Bounded in-memory response cache.
//!
//! # Data Flow
//! ```text
//! Request handler
//!     → lookup_and_pin(uri)   hit: PinnedEntry (promoted to MRU)
//!     → stream entry bytes to the client (no lock held)
//!     → drop / release()      pin count decremented, waiters notified
//!
//! Origin fetch completed
//!     → insert(uri, bytes)    evict LRU unpinned entries until it fits
//!                             all remaining entries pinned: wait, retry
//! ```
//!
//! # Design Decisions
//! - One structural lock (`parking_lot::Mutex`) serializes every recency and
//!   size mutation, so promotion and eviction order is total
//! - The lock is never held across I/O or an `.await`
//! - Entry bytes are immutable `Bytes`; a handle keeps its bytes alive even if
//!   the entry is detached, so reclamation is deferred to the last reader
//! - Pinned entries are never chosen for eviction; an insert that cannot make
//!   room waits on a `Notify` registered under the lock and awaited outside it
//! - First write for a key wins; a duplicate insert is a no-op

mod lru;

use std::fmt;

use bytes::Bytes;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;

use crate::config::CacheConfig;
use crate::observability::metrics;

use self::lru::{LruIndex, SlotId};

/// Default total cache budget in bytes.
pub const MAX_CACHE_SIZE: usize = 1024 * 1024;

/// Default per-response caching ceiling in bytes.
pub const MAX_OBJECT_SIZE: usize = 100 * 1024;

/// Errors surfaced by cache mutations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The value can never fit under the configured object ceiling.
    #[error("object of {len} bytes exceeds the {max} byte object limit")]
    TooLarge { len: usize, max: usize },

    /// Bookkeeping storage could not be allocated.
    #[error("cache allocation failed: {0}")]
    OutOfMemory(#[from] std::collections::TryReserveError),
}

/// Result of a successful [`ResponseCache::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The entry was added at the most-recently-used position.
    Inserted,
    /// An entry for the key already existed and was left untouched.
    AlreadyPresent,
}

/// Point-in-time view of the cache, taken under the structural lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub total_size: usize,
    pub pinned_entries: usize,
    pub max_cache_size: usize,
    pub max_object_size: usize,
}

/// Bounded LRU store mapping request URI to raw response bytes.
///
/// Constructed once and shared (usually through an `Arc`) with every
/// connection handler.
pub struct ResponseCache {
    index: Mutex<LruIndex>,
    released: Notify,
    max_cache_size: usize,
    max_object_size: usize,
}

impl ResponseCache {
    /// Create an empty cache with the given limits.
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            index: Mutex::new(LruIndex::new()),
            released: Notify::new(),
            max_cache_size: config.max_cache_size,
            max_object_size: config.max_object_size,
        }
    }

    pub fn max_cache_size(&self) -> usize {
        self.max_cache_size
    }

    pub fn max_object_size(&self) -> usize {
        self.max_object_size
    }

    /// Find the entry for `key`, pin it and promote it to most recently used.
    ///
    /// Returns `None` on a miss. The returned handle releases its pin when
    /// dropped.
    pub fn lookup_and_pin(&self, key: &str) -> Option<PinnedEntry<'_>> {
        let mut index = self.index.lock();
        let Some(slot) = index.find(key) else {
            drop(index);
            metrics::record_cache_lookup(false);
            return None;
        };
        let bytes = index.pin_and_promote(slot)?;
        drop(index);

        metrics::record_cache_lookup(true);
        tracing::trace!(uri = %key, bytes = bytes.len(), "Cache entry pinned");
        Some(PinnedEntry {
            cache: self,
            slot,
            bytes,
            released: false,
        })
    }

    /// Release a pin obtained from [`lookup_and_pin`](Self::lookup_and_pin).
    ///
    /// Equivalent to dropping the handle.
    pub fn release(&self, entry: PinnedEntry<'_>) {
        drop(entry);
    }

    fn unpin(&self, slot: SlotId) {
        let remaining = self.index.lock().unpin(slot);
        match remaining {
            Some(0) => self.released.notify_waiters(),
            Some(_) => {}
            // Detached while pinned; the handle's bytes are reclaimed when it
            // is dropped.
            None => tracing::trace!("Released pin on detached cache entry"),
        }
    }

    /// Insert `value` under `key` unless an entry for `key` already exists.
    ///
    /// Evicts least-recently-used unpinned entries until the value fits under
    /// the cache budget. When only pinned entries remain, waits for a pin to
    /// be released and retries; the structural lock is never held while
    /// waiting.
    pub async fn insert(&self, key: &str, value: Bytes) -> Result<InsertOutcome, CacheError> {
        let len = value.len();
        if len > self.max_object_size || len > self.max_cache_size {
            return Err(CacheError::TooLarge {
                len,
                max: self.max_object_size.min(self.max_cache_size),
            });
        }

        loop {
            let released = {
                let mut index = self.index.lock();
                if index.find(key).is_some() {
                    tracing::trace!(uri = %key, "Cache entry already present");
                    return Ok(InsertOutcome::AlreadyPresent);
                }

                while index.total_size() + len > self.max_cache_size {
                    let Some(victim) = index.lru_unpinned() else {
                        break;
                    };
                    if let Some(evicted) = index.remove(victim) {
                        metrics::record_cache_eviction();
                        tracing::debug!(
                            uri = %evicted.key,
                            bytes = evicted.value.len(),
                            "Evicted cache entry"
                        );
                    }
                }

                if index.total_size() + len <= self.max_cache_size {
                    index.push_front(key.to_owned(), value.clone())?;
                    metrics::record_cache_size(index.len(), index.total_size());
                    tracing::debug!(
                        uri = %key,
                        bytes = len,
                        total_size = index.total_size(),
                        "Cached response"
                    );
                    return Ok(InsertOutcome::Inserted);
                }

                tracing::debug!(
                    uri = %key,
                    bytes = len,
                    pinned_entries = index.pinned(),
                    "Cache full of pinned entries, waiting for a release"
                );
                // Registered before the lock drops, so a release that
                // happens in between still wakes us.
                self.released.notified()
            };
            released.await;
        }
    }

    /// Drop every entry.
    ///
    /// Handles still held by readers keep their bytes valid until they are
    /// dropped; their later release is a no-op.
    pub fn shutdown(&self) {
        let (entries, pinned) = {
            let mut index = self.index.lock();
            let entries = index.len();
            (entries, index.clear())
        };
        self.released.notify_waiters();
        metrics::record_cache_size(0, 0);
        tracing::info!(entries, pinned, "Response cache released");
    }

    pub fn len(&self) -> usize {
        self.index.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sum of the sizes of all resident entries.
    pub fn total_size(&self) -> usize {
        self.index.lock().total_size()
    }

    /// Whether `key` is resident. Does not affect recency.
    pub fn contains(&self, key: &str) -> bool {
        self.index.lock().find(key).is_some()
    }

    /// Size of the entry for `key`. Does not affect recency.
    pub fn size_of(&self, key: &str) -> Option<usize> {
        let index = self.index.lock();
        let slot = index.find(key)?;
        index.value(slot).map(Bytes::len)
    }

    /// Keys ordered from most to least recently used.
    pub fn keys_by_recency(&self) -> Vec<String> {
        self.index.lock().keys()
    }

    pub fn stats(&self) -> CacheStats {
        let index = self.index.lock();
        CacheStats {
            entries: index.len(),
            total_size: index.total_size(),
            pinned_entries: index.pinned(),
            max_cache_size: self.max_cache_size,
            max_object_size: self.max_object_size,
        }
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new(&CacheConfig::default())
    }
}

impl fmt::Debug for ResponseCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseCache")
            .field("stats", &self.stats())
            .finish()
    }
}

/// A pinned, read-only view of a cached response.
///
/// While it exists the entry cannot be chosen for eviction. Dropping it
/// releases the pin exactly once.
pub struct PinnedEntry<'a> {
    cache: &'a ResponseCache,
    slot: SlotId,
    bytes: Bytes,
    released: bool,
}

impl PinnedEntry<'_> {
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Release the pin now instead of at scope end.
    pub fn release(mut self) {
        self.release_pin();
    }

    fn release_pin(&mut self) {
        if !self.released {
            self.released = true;
            self.cache.unpin(self.slot);
        }
    }
}

impl std::ops::Deref for PinnedEntry<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Debug for PinnedEntry<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PinnedEntry")
            .field("len", &self.bytes.len())
            .finish()
    }
}

impl Drop for PinnedEntry<'_> {
    fn drop(&mut self) {
        self.release_pin();
    }
}
