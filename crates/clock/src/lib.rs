//! Clock (second-chance) replacement cache.
//!
//! A fixed number of slots is allocated up front and recycled in place.
//! Each slot carries a recency bit and a reference count; the reference
//! count is the strong count of the slot's [`Arc`], so a value handed out by
//! [`Clock::get()`] keeps its slot from being recycled until it is dropped.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::{sync::Arc, vec::Vec};
use core::convert::Infallible;

use mutex_api::Mutex;

/// Clock (second-chance) replacement cache.
#[derive(Debug)]
pub struct Clock<ClockMutex>(ClockMutex);

impl<ClockMutex, K, V> Clock<ClockMutex>
where
    ClockMutex: Mutex<Data = ClockMap<K, V>>,
{
    /// Creates a new clock cache with the given number of slots.
    ///
    /// # Panics
    ///
    /// Panics if `size` is `0`.
    #[must_use]
    pub fn new(size: usize) -> Self
    where
        V: Default,
    {
        Self(ClockMutex::new(ClockMap::new(size)))
    }

    /// Returns a reference to the cached value associated with the key.
    ///
    /// If the value is cached, marks it recently used and returns it.
    /// Otherwise takes a never-used slot, or sweeps the clock hand to find an
    /// unreferenced slot whose recency bit is clear. Before such a victim is
    /// rekeyed, `on_evict` is called with its old key and value while the
    /// structure lock is held; if it fails, the victim is left untouched and
    /// the error is returned.
    ///
    /// Returns `Ok(None)` if every slot is referenced.
    pub fn get<F, E>(&self, key: K, on_evict: F) -> Result<Option<ClockValue<K, V>>, E>
    where
        K: PartialEq + Clone,
        F: FnOnce(&K, &V) -> Result<(), E>,
    {
        self.0.lock().get(key, on_evict)
    }

    /// Same as [`Self::get()`], for values that need no work on eviction.
    pub fn get_or_recycle(&self, key: K) -> Option<ClockValue<K, V>>
    where
        K: PartialEq + Clone,
    {
        let Ok(value) = self.get(key, |_, _| Ok::<_, Infallible>(()));
        value
    }

    /// Returns a reference to the value held in the `index`th slot, if that
    /// slot has ever been populated.
    ///
    /// The recency bit is left as is.
    pub fn slot(&self, index: usize) -> Option<ClockValue<K, V>>
    where
        K: Clone,
    {
        self.0.lock().slot(index)
    }

    /// Returns the number of slots.
    pub fn capacity(&self) -> usize {
        self.0.lock().slots.len()
    }

    /// Returns the keys of all populated slots, in slot order.
    pub fn keys(&self) -> Vec<K>
    where
        K: Clone,
    {
        self.0.lock().keys().cloned().collect()
    }
}

/// How a [`ClockValue`] was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// The key was already cached.
    Hit,
    /// The key was placed in a never-used slot.
    Filled,
    /// The key replaced the key of a recycled slot.
    Evicted,
}

struct Slot<K, V> {
    key: Option<K>,
    referenced: bool,
    value: Arc<V>,
}

impl<K, V> Slot<K, V> {
    fn in_use(&self) -> bool {
        Arc::strong_count(&self.value) > 1
    }
}

/// Slots and clock hand of a [`Clock`].
pub struct ClockMap<K, V> {
    slots: Vec<Slot<K, V>>,
    /// Number of slots that have ever been populated.
    ///
    /// Slots are populated in order, so `slots[..len]` are the only ones
    /// carrying a key.
    len: usize,
    hand: usize,
}

impl<K, V> ClockMap<K, V> {
    fn new(size: usize) -> Self
    where
        V: Default,
    {
        assert!(size > 0, "size must be greater than 0");

        let mut slots = Vec::with_capacity(size);
        slots.resize_with(size, || Slot {
            key: None,
            referenced: false,
            value: Arc::new(V::default()),
        });
        Self {
            slots,
            len: 0,
            hand: 0,
        }
    }

    fn keys(&self) -> impl Iterator<Item = &K> + '_ {
        self.slots[..self.len].iter().filter_map(|s| s.key.as_ref())
    }

    fn slot(&self, index: usize) -> Option<ClockValue<K, V>>
    where
        K: Clone,
    {
        let slot = self.slots[..self.len].get(index)?;
        Some(ClockValue {
            key: slot.key.clone()?,
            access: Access::Hit,
            value: Arc::clone(&slot.value),
        })
    }

    fn get<F, E>(&mut self, key: K, on_evict: F) -> Result<Option<ClockValue<K, V>>, E>
    where
        K: PartialEq + Clone,
        F: FnOnce(&K, &V) -> Result<(), E>,
    {
        // Find the value with the key
        if let Some(slot) = self.slots[..self.len]
            .iter_mut()
            .find(|s| s.key.as_ref() == Some(&key))
        {
            slot.referenced = true;
            return Ok(Some(ClockValue {
                key,
                access: Access::Hit,
                value: Arc::clone(&slot.value),
            }));
        }

        // Not cached.
        // Use a never-used slot while there is one.
        if self.len < self.slots.len() {
            let slot = &mut self.slots[self.len];
            self.len += 1;
            slot.key = Some(key.clone());
            slot.referenced = true;
            return Ok(Some(ClockValue {
                key,
                access: Access::Filled,
                value: Arc::clone(&slot.value),
            }));
        }

        // Sweep the hand. The first sweep clears every recency bit it passes,
        // so the second one stops at the first unreferenced slot.
        let size = self.slots.len();
        for _ in 0..2 * size {
            let i = self.hand;
            self.hand = (i + 1) % size;

            let slot = &mut self.slots[i];
            if slot.in_use() {
                continue;
            }
            if slot.referenced {
                slot.referenced = false;
                continue;
            }

            if let Some(old) = &slot.key {
                if let Err(e) = on_evict(old, &slot.value) {
                    self.hand = i;
                    return Err(e);
                }
            }
            slot.key = Some(key.clone());
            slot.referenced = true;
            return Ok(Some(ClockValue {
                key,
                access: Access::Evicted,
                value: Arc::clone(&slot.value),
            }));
        }

        Ok(None)
    }
}

/// A reference to the cached value associated with the key.
///
/// The slot holding the value is not recycled while any `ClockValue`
/// referring to it is alive.
#[derive(Debug)]
pub struct ClockValue<K, V> {
    key: K,
    access: Access,
    value: Arc<V>,
}

impl<K, V> ClockValue<K, V> {
    /// Returns the cache key.
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Returns how this value was obtained.
    pub fn access(&self) -> Access {
        self.access
    }

    /// Returns a reference to the cached value.
    pub fn value(&self) -> &V {
        &self.value
    }
}

impl<K, V> Clone for ClockValue<K, V>
where
    K: Clone,
{
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            access: Access::Hit,
            value: Arc::clone(&self.value),
        }
    }
}
