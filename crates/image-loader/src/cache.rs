//! Sliding-expiration cache of decoded full-resolution images
//!
//! The cache holds the only guaranteed strong reference to a full image. Each
//! access re-arms the entry's time to live; once it lapses the entry is dropped
//! and the image survives only while somebody else (a viewer, an export) still
//! holds its `Arc`. Records keep a `Weak` and ask it, so the cache is never the
//! authority on residency.
//!
//! Entries are ordered by recency with [`lru::LruCache`]. When a byte budget is
//! set the least recently used images are evicted first, but the newest entry
//! is always kept even if it alone is over budget.

use crate::SharedImage;
use lru::LruCache;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Counters since the cache was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub expirations: u64,
    pub evictions: u64,
}

struct Entry {
    image: SharedImage,
    bytes: usize,
    expires_at: Instant,
}

struct Inner {
    entries: LruCache<PathBuf, Entry>,
    total_bytes: usize,
    stats: CacheStats,
}

impl Inner {
    fn take(&mut self, path: &Path) -> Option<Entry> {
        let entry = self.entries.pop(path)?;
        self.total_bytes = self.total_bytes.saturating_sub(entry.bytes);
        Some(entry)
    }
}

/// Thread-safe, path-keyed image cache with a sliding time to live.
pub struct ImageCache {
    inner: Mutex<Inner>,
    ttl: Duration,
    max_bytes: usize,
}

impl ImageCache {
    /// `max_bytes == 0` disables the byte budget.
    pub fn new(ttl: Duration, max_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::unbounded(),
                total_bytes: 0,
                stats: CacheStats::default(),
            }),
            ttl,
            max_bytes,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn insert(&self, path: &Path, image: SharedImage) {
        self.insert_at(path, image, Instant::now());
    }

    pub fn insert_at(&self, path: &Path, image: SharedImage, now: Instant) {
        let bytes = image.as_bytes().len();
        let mut inner = self.inner.lock();
        inner.take(path);
        inner.entries.put(
            path.to_path_buf(),
            Entry {
                image,
                bytes,
                expires_at: now + self.ttl,
            },
        );
        inner.total_bytes += bytes;

        while self.max_bytes > 0 && inner.total_bytes > self.max_bytes && inner.entries.len() > 1 {
            match inner.entries.pop_lru() {
                Some((evicted, entry)) => {
                    inner.total_bytes = inner.total_bytes.saturating_sub(entry.bytes);
                    inner.stats.evictions += 1;
                    debug!(path = %evicted.display(), bytes = entry.bytes, "Evicted full image over budget");
                }
                None => break,
            }
        }
    }

    /// The cached image, re-arming its expiration.
    pub fn get(&self, path: &Path) -> Option<SharedImage> {
        self.get_at(path, Instant::now())
    }

    pub fn get_at(&self, path: &Path, now: Instant) -> Option<SharedImage> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let expired = match inner.entries.get_mut(path) {
            Some(entry) if entry.expires_at > now => {
                entry.expires_at = now + self.ttl;
                inner.stats.hits += 1;
                return Some(Arc::clone(&entry.image));
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            inner.take(path);
            inner.stats.expirations += 1;
        }
        inner.stats.misses += 1;
        None
    }

    /// Re-arm an entry's expiration without handing out the image.
    pub fn touch(&self, path: &Path) -> bool {
        self.get(path).is_some()
    }

    pub fn remove(&self, path: &Path) -> Option<SharedImage> {
        self.inner.lock().take(path).map(|entry| entry.image)
    }

    /// Whether a live entry exists. Does not affect recency or expiration.
    pub fn contains(&self, path: &Path) -> bool {
        self.contains_at(path, Instant::now())
    }

    pub fn contains_at(&self, path: &Path, now: Instant) -> bool {
        self.inner
            .lock()
            .entries
            .peek(path)
            .is_some_and(|entry| entry.expires_at > now)
    }

    /// Drop every expired entry. Returns how many were dropped.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    pub fn sweep_at(&self, now: Instant) -> usize {
        let mut inner = self.inner.lock();
        let expired: Vec<PathBuf> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(path, _)| path.clone())
            .collect();
        for path in &expired {
            inner.take(path);
        }
        inner.stats.expirations += expired.len() as u64;
        if !expired.is_empty() {
            debug!(count = expired.len(), "Swept expired full images");
        }
        expired.len()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.total_bytes = 0;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_bytes(&self) -> usize {
        self.inner.lock().total_bytes
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.lock().stats
    }
}

impl std::fmt::Debug for ImageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ImageCache")
            .field("len", &inner.entries.len())
            .field("total_bytes", &inner.total_bytes)
            .field("max_bytes", &self.max_bytes)
            .field("ttl", &self.ttl)
            .finish()
    }
}
