//! Bounded cache of decoded tiles, slices and files

use crate::error::Result;
use crate::volume::VolumeBuffer;
use lru::LruCache;
use parking_lot::Mutex;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::trace;

type Slot = Arc<Mutex<Option<Arc<VolumeBuffer>>>>;

/// LRU cache of decoded source units keyed by `K`.
///
/// Each unit is decoded at most once while it stays cached; concurrent
/// requests for a unit being decoded wait for that decode.
pub struct TileCache<K: Hash + Eq> {
    slots: Mutex<LruCache<K, Slot>>,
}

impl<K: Hash + Eq + Clone + std::fmt::Debug> TileCache<K> {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            slots: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Return the cached unit for `key`, decoding it with `load` on a miss
    pub fn get_or_load<F>(&self, key: &K, load: F) -> Result<Arc<VolumeBuffer>>
    where
        F: FnOnce() -> Result<VolumeBuffer>,
    {
        let slot = {
            let mut slots = self.slots.lock();
            match slots.get(key) {
                Some(slot) => Arc::clone(slot),
                None => {
                    let slot: Slot = Arc::new(Mutex::new(None));
                    slots.put(key.clone(), Arc::clone(&slot));
                    slot
                }
            }
        };

        let mut entry = slot.lock();
        if let Some(buffer) = entry.as_ref() {
            return Ok(Arc::clone(buffer));
        }
        trace!(?key, "decoding source unit");
        let buffer = Arc::new(load()?);
        *entry = Some(Arc::clone(&buffer));
        Ok(buffer)
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.lock().cap().get()
    }
}
