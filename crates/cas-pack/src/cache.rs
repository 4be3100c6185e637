//! The base-object cache (component D): a bounded LRU of recently
//! inflated, fully-resolved base objects, keyed by `(pack_id, offset)`.
//!
//! A delta chain that shares a common tail across many targets would
//! otherwise re-inflate and re-apply that tail once per target. Caching
//! the terminal object of a chain (or any intermediate base consulted
//! more than once) avoids that. Admission is bounded by total bytes
//! held, not entry count, since object sizes vary by orders of
//! magnitude; eviction is strict LRU.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use cas_object::ObjectType;
use lru::LruCache;

/// Default byte budget for the base-object cache.
pub const DEFAULT_CAPACITY_BYTES: u64 = 96 * 1024 * 1024;

/// Key identifying a decoded object within a specific pack: the pack's
/// assigned id (see [`next_pack_id`]) plus the byte offset of its
/// record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub pack_id: u64,
    pub offset: u64,
}

/// Process-wide counter handing out distinct ids to opened packs, so
/// cache keys don't collide across packs that happen to share an
/// offset. Every [`crate::pack::PackFile`] is assigned one at open time.
static NEXT_PACK_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_pack_id() -> u64 {
    NEXT_PACK_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Clone)]
struct CachedObject {
    obj_type: ObjectType,
    data: std::sync::Arc<[u8]>,
}

/// Bounded-size LRU cache of inflated, delta-resolved objects.
///
/// Mutation is serialized behind a single mutex; this is a deliberately
/// simple design (the pack reader's hot path is I/O and inflate, not
/// cache bookkeeping) matching the "non-fatal, throughput-only" status
/// the design gives every reader-side cache.
pub struct BaseObjectCache {
    inner: Mutex<Inner>,
    capacity_bytes: u64,
}

struct Inner {
    entries: LruCache<CacheKey, CachedObject>,
    bytes: u64,
}

impl BaseObjectCache {
    pub fn new(capacity_bytes: u64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                // Entry count is unbounded; eviction is driven by `bytes`
                // against `capacity_bytes` instead.
                entries: LruCache::new(NonZeroUsize::new(usize::MAX).unwrap()),
                bytes: 0,
            }),
            capacity_bytes,
        }
    }

    pub fn get(&self, key: CacheKey) -> Option<(ObjectType, std::sync::Arc<[u8]>)> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .entries
            .get(&key)
            .map(|c| (c.obj_type, c.data.clone()))
    }

    /// Insert a decoded object, evicting least-recently-used entries
    /// until it fits. An object larger than the entire cache capacity is
    /// never admitted (matches the "admitted only if there is room"
    /// clause: a single oversized object must not evict everything else
    /// just to be cached once).
    pub fn insert(&self, key: CacheKey, obj_type: ObjectType, data: std::sync::Arc<[u8]>) {
        if self.capacity_bytes == 0 {
            return;
        }
        let size = data.len() as u64;
        if size > self.capacity_bytes {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.entries.contains(&key) {
            return;
        }
        while inner.bytes + size > self.capacity_bytes {
            match inner.entries.pop_lru() {
                Some((_, evicted)) => inner.bytes -= evicted.data.len() as u64,
                None => break,
            }
        }
        inner.bytes += size;
        inner.entries.put(key, CachedObject { obj_type, data });
    }

    pub fn bytes_held(&self) -> u64 {
        self.inner.lock().unwrap().bytes
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for BaseObjectCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY_BYTES)
    }
}
