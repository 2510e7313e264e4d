//! Constant-argument cache: a small table of immutable kernel parameters kept on a GPU.

use std::hash::{Hash, Hasher};

use derive_more::Display;
use rustc_hash::{FxHashMap as HashMap, FxHasher};
use thiserror::Error;

use crate::loom::{ErrorKind, device::Ticket};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("all {0} constant slots are referenced")]
    LimitExceeded(usize),
    #[error("key {0} is not cached")]
    NotCached(CacheKey),
    #[error("key {0} has no outstanding references")]
    Unreferenced(CacheKey),
}

impl CacheError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CacheError::LimitExceeded(_) => ErrorKind::LimitExceeded,
            CacheError::NotCached(_) => ErrorKind::ObjectIsEmpty,
            CacheError::Unreferenced(_) => ErrorKind::NotAllowed,
        }
    }
}

/// Content hash of a constant argument.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
#[display("{_0:016x}")]
pub struct CacheKey(pub u64);

impl CacheKey {
    pub fn of(contents: impl Hash) -> Self {
        let mut hasher = FxHasher::default();
        contents.hash(&mut hasher);
        Self(hasher.finish())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub slot: usize,
    pub refs: usize,
    /// Logical time of the last `get_entry`.
    pub last_use: u64,
    /// Upload populating the slot, if one was issued.
    pub upload: Option<Ticket>,
}

/// Outcome of [`ConstCache::get_entry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    /// The key is resident in `slot`.
    Hit(usize),
    /// The key was assigned to `slot`, whose contents must be uploaded.
    Miss {
        slot: usize,
        evicted: Option<CacheEntry>,
    },
}

impl Lookup {
    #[inline]
    pub fn slot(&self) -> usize {
        match *self {
            Lookup::Hit(slot) | Lookup::Miss { slot, .. } => slot,
        }
    }
}

#[derive(Debug)]
pub struct ConstCache {
    slots: Vec<Option<CacheEntry>>,
    index: HashMap<CacheKey, usize>,
    clock: u64,
}

impl ConstCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity],
            index: HashMap::default(),
            clock: 0,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn entry(&self, key: CacheKey) -> Option<&CacheEntry> {
        self.index.get(&key).and_then(|&slot| self.slots[slot].as_ref())
    }

    /// References `key`, assigning it a slot if needed. Evicts the least recently used
    /// unreferenced entry when the table is full.
    pub fn get_entry(&mut self, key: CacheKey) -> Result<Lookup, CacheError> {
        self.clock += 1;
        let clock = self.clock;

        if let Some(&slot) = self.index.get(&key) {
            if let Some(entry) = self.slots[slot].as_mut() {
                entry.refs += 1;
                entry.last_use = clock;
                return Ok(Lookup::Hit(slot));
            }
        }

        let (slot, evicted) = match self.slots.iter().position(Option::is_none) {
            Some(slot) => (slot, None),
            None => {
                let (slot, victim) = self
                    .slots
                    .iter()
                    .enumerate()
                    .filter_map(|(slot, entry)| entry.as_ref().map(|&entry| (slot, entry)))
                    .filter(|(_, entry)| entry.refs == 0)
                    .min_by_key(|(_, entry)| entry.last_use)
                    .ok_or(CacheError::LimitExceeded(self.slots.len()))?;
                self.index.remove(&victim.key);
                log::trace!("constant {} evicted from slot {slot}", victim.key);
                (slot, Some(victim))
            }
        };

        self.slots[slot] = Some(CacheEntry {
            key,
            slot,
            refs: 1,
            last_use: clock,
            upload: None,
        });
        self.index.insert(key, slot);
        Ok(Lookup::Miss { slot, evicted })
    }

    /// Records the upload that populates the slot of `key`.
    pub fn set_upload(&mut self, key: CacheKey, ticket: Ticket) -> Result<(), CacheError> {
        let slot = *self.index.get(&key).ok_or(CacheError::NotCached(key))?;
        if let Some(entry) = self.slots[slot].as_mut() {
            entry.upload = Some(ticket);
        }
        Ok(())
    }

    /// Drops an assignment whose upload could not be issued.
    pub fn forget(&mut self, key: CacheKey) {
        if let Some(slot) = self.index.remove(&key) {
            self.slots[slot] = None;
        }
    }

    /// Dereferences `key`. At zero references the entry becomes evictable but stays resident.
    pub fn release_entry(&mut self, key: CacheKey) -> Result<(), CacheError> {
        let slot = *self.index.get(&key).ok_or(CacheError::NotCached(key))?;
        let entry = self.slots[slot].as_mut().ok_or(CacheError::NotCached(key))?;
        if entry.refs == 0 {
            return Err(CacheError::Unreferenced(key));
        }
        entry.refs -= 1;
        Ok(())
    }

    pub fn resident(&self) -> usize {
        self.index.len()
    }

    pub fn referenced(&self) -> usize {
        self.slots.iter().flatten().filter(|x| x.refs > 0).count()
    }
}

#[cfg(test)]
mod tests {
    use super::{CacheError, CacheKey, ConstCache, Lookup};

    #[test]
    fn test_hit_and_miss() {
        let mut cache = ConstCache::new(2);
        let key = CacheKey::of("D(a,b)+=L(a,c)*R(c,b)");
        assert_eq!(key, CacheKey::of("D(a,b)+=L(a,c)*R(c,b)"));

        let slot = match cache.get_entry(key).unwrap() {
            Lookup::Miss { slot, evicted: None } => slot,
            lookup => panic!("unexpected lookup: {lookup:?}"),
        };
        assert_eq!(cache.get_entry(key).unwrap(), Lookup::Hit(slot));
        assert_eq!(cache.entry(key).unwrap().refs, 2);
    }

    #[test]
    fn test_lru_eviction() {
        let mut cache = ConstCache::new(2);
        let [a, b, c] = [CacheKey(1), CacheKey(2), CacheKey(3)];

        let slot_a = cache.get_entry(a).unwrap().slot();
        let slot_b = cache.get_entry(b).unwrap().slot();
        assert_eq!(cache.get_entry(c), Err(CacheError::LimitExceeded(2)));

        cache.release_entry(b).unwrap();
        cache.release_entry(a).unwrap();
        // `a` is released last but was used first
        match cache.get_entry(c).unwrap() {
            Lookup::Miss {
                slot,
                evicted: Some(victim),
            } => {
                assert_eq!(slot, slot_a);
                assert_eq!(victim.key, a);
            }
            lookup => panic!("unexpected lookup: {lookup:?}"),
        }
        assert!(cache.entry(a).is_none());

        // released entries stay resident for reuse
        assert_eq!(cache.get_entry(b).unwrap(), Lookup::Hit(slot_b));
        assert_eq!(cache.resident(), 2);
        assert_eq!(cache.referenced(), 2);
    }

    #[test]
    fn test_release_errors() {
        let mut cache = ConstCache::new(1);
        let key = CacheKey(9);
        assert_eq!(cache.release_entry(key), Err(CacheError::NotCached(key)));
        cache.get_entry(key).unwrap();
        cache.release_entry(key).unwrap();
        assert_eq!(cache.release_entry(key), Err(CacheError::Unreferenced(key)));
    }
}
