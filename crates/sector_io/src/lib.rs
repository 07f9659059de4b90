//! Clock-replacement buffer cache for sector I/O.
//!
//! Sectors are cached in a fixed pool of slots managed by [`clock::Clock`].
//! A [`SectorRef`] pins its slot (the slot cannot be recycled while the
//! reference is alive); locking it yields a [`SectorGuard`] giving exclusive
//! access to the cached bytes.
//!
//! The cache is write-back only: modifying a guard marks the sector dirty,
//! and dirty sectors reach the device when their slot is recycled or when
//! [`SectorCache::flush_all()`] is called.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::{sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicUsize, Ordering};

use clock::{Access, Clock};
use dataview::{Pod, PodMethods as _};
use mutex_api::Mutex;

/// A trait representing a block device with a fixed sector size.
///
/// # Constants
///
/// * `SECTOR_SIZE`: The size of each sector in bytes.
pub trait BlockDevice<const SECTOR_SIZE: usize> {
    /// The error type that can be returned by the block device operations.
    type Error;

    /// Reads a sector from the device at the specified index into the
    /// provided buffer.
    fn read(&self, sector: usize, data: &mut [u8; SECTOR_SIZE]) -> Result<(), Self::Error>;

    /// Writes a sector to the device at the specified index from the
    /// provided buffer.
    fn write(&self, sector: usize, data: &[u8; SECTOR_SIZE]) -> Result<(), Self::Error>;
}

impl<D, const SECTOR_SIZE: usize> BlockDevice<SECTOR_SIZE> for &D
where
    D: BlockDevice<SECTOR_SIZE> + ?Sized,
{
    type Error = D::Error;

    fn read(&self, sector: usize, data: &mut [u8; SECTOR_SIZE]) -> Result<(), Self::Error> {
        (**self).read(sector, data)
    }

    fn write(&self, sector: usize, data: &[u8; SECTOR_SIZE]) -> Result<(), Self::Error> {
        (**self).write(sector, data)
    }
}

impl<D, const SECTOR_SIZE: usize> BlockDevice<SECTOR_SIZE> for Arc<D>
where
    D: BlockDevice<SECTOR_SIZE> + ?Sized,
{
    type Error = D::Error;

    fn read(&self, sector: usize, data: &mut [u8; SECTOR_SIZE]) -> Result<(), Self::Error> {
        (**self).read(sector, data)
    }

    fn write(&self, sector: usize, data: &[u8; SECTOR_SIZE]) -> Result<(), Self::Error> {
        (**self).write(sector, data)
    }
}

/// Errors returned by [`SectorCache::get()`].
#[derive(Debug, thiserror::Error)]
pub enum SectorCacheError<E> {
    /// Every slot is referenced.
    #[error("sector cache exhausted")]
    Exhausted,
    /// Writing back an evicted dirty sector failed.
    #[error("device I/O failed on sector {sector}")]
    Device { sector: usize, error: E },
}

/// A type alias for the clock map where the keys are sector indices.
///
/// # Type Parameters
///
/// * `SectorMutex`: The mutex type used to protect access to the sector data.
pub type ClockMap<SectorMutex> = clock::ClockMap<usize, SectorMutex>;

/// A type alias for a clock value in the cache.
pub type ClockValue<SectorMutex> = clock::ClockValue<usize, SectorMutex>;

/// Counters of cache activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups that found the sector cached.
    pub hits: usize,
    /// Lookups that had to assign a slot.
    pub misses: usize,
    /// Misses that recycled a previously used slot.
    pub evictions: usize,
    /// Sectors read from the device.
    pub device_reads: usize,
    /// Sectors written to the device.
    pub device_writes: usize,
}

#[derive(Default)]
struct Counters {
    hits: AtomicUsize,
    misses: AtomicUsize,
    evictions: AtomicUsize,
    device_reads: AtomicUsize,
    device_writes: AtomicUsize,
}

impl Counters {
    fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            device_reads: self.device_reads.load(Ordering::Relaxed),
            device_writes: self.device_writes.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        for c in [
            &self.hits,
            &self.misses,
            &self.evictions,
            &self.device_reads,
            &self.device_writes,
        ] {
            c.store(0, Ordering::Relaxed);
        }
    }
}

/// A clock-replacement buffer cache for sector I/O.
pub struct SectorCache<Device, ClockMutex> {
    device: Device,
    clock: Clock<ClockMutex>,
    counters: Counters,
}

/// Sector bytes, aligned so that they can be viewed as POD types.
#[repr(C, align(8))]
struct SectorBytes<const SECTOR_SIZE: usize>([u8; SECTOR_SIZE]);

/// A cached data of a sector.
pub struct SectorData<const SECTOR_SIZE: usize> {
    index: usize,
    valid: bool,
    dirty: bool,
    data: SectorBytes<SECTOR_SIZE>,
}

impl<const SECTOR_SIZE: usize> Default for SectorData<SECTOR_SIZE> {
    fn default() -> Self {
        Self {
            index: usize::MAX,
            valid: false,
            dirty: false,
            data: SectorBytes([0; SECTOR_SIZE]),
        }
    }
}

/// A reference to a cached sector.
///
/// The slot holding the sector is pinned until this reference is dropped.
pub struct SectorRef<'list, Device, ClockMutex, SectorMutex>
where
    ClockMutex: Mutex<Data = ClockMap<SectorMutex>>,
{
    index: usize,
    cache: &'list SectorCache<Device, ClockMutex>,
    value: ClockValue<SectorMutex>,
}

/// A lock guard of a cached sector providing exclusive access.
///
/// `VALID` is `true` once the cached bytes are known to hold the sector's
/// contents (read from the device or fully overwritten).
pub struct SectorGuard<
    'list,
    'sector,
    Device,
    ClockMutex,
    SectorMutex,
    const SECTOR_SIZE: usize,
    const VALID: bool,
> where
    ClockMutex: Mutex<Data = ClockMap<SectorMutex>>,
    SectorMutex: Mutex<Data = SectorData<SECTOR_SIZE>> + 'sector,
{
    index: usize,
    cache: &'list SectorCache<Device, ClockMutex>,
    data: SectorMutex::Guard<'sector>,
}

impl<Device, ClockMutex, SectorMutex, const SECTOR_SIZE: usize> SectorCache<Device, ClockMutex>
where
    Device: BlockDevice<SECTOR_SIZE>,
    ClockMutex: Mutex<Data = ClockMap<SectorMutex>>,
    SectorMutex: Mutex<Data = SectorData<SECTOR_SIZE>> + Default,
{
    /// Creates a new [`SectorCache`] instance with `capacity` slots.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is `0`.
    pub fn new(device: Device, capacity: usize) -> Self {
        Self {
            device,
            clock: Clock::new(capacity),
            counters: Counters::default(),
        }
    }

    /// Returns the underlying device.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Consumes the cache, returning the device.
    ///
    /// Dirty sectors are discarded; call [`Self::flush_all()`] first.
    pub fn into_device(self) -> Device {
        self.device
    }

    /// Returns the number of slots.
    pub fn capacity(&self) -> usize {
        self.clock.capacity()
    }

    /// Returns a reference to the cached sector with the given index.
    ///
    /// If the sector is cached, returns a reference to it.
    /// Otherwise recycles a slot chosen by the clock algorithm, writing its
    /// previous contents back to the device first if they are dirty.
    /// The sector itself is not read until [`SectorGuard::read()`].
    /// If all slots are referenced, returns `Ok(None)`.
    pub fn try_get(
        &self,
        index: usize,
    ) -> Result<Option<SectorRef<'_, Device, ClockMutex, SectorMutex>>, SectorCacheError<Device::Error>>
    {
        let value = self.clock.get(index, |&old, sector| {
            let mut data = sector.lock();
            if data.valid && data.dirty {
                log::trace!("sector cache: write back {old} before loading {index}");
                self.device
                    .write(old, &data.data.0)
                    .map_err(|error| SectorCacheError::Device { sector: old, error })?;
                Counters::bump(&self.counters.device_writes);
            }
            data.valid = false;
            data.dirty = false;
            Ok(())
        })?;

        let Some(value) = value else {
            return Ok(None);
        };
        match value.access() {
            Access::Hit => Counters::bump(&self.counters.hits),
            Access::Filled => Counters::bump(&self.counters.misses),
            Access::Evicted => {
                Counters::bump(&self.counters.misses);
                Counters::bump(&self.counters.evictions);
            }
        }

        Ok(Some(SectorRef {
            index,
            cache: self,
            value,
        }))
    }

    /// Returns a reference to the cached sector with the given index.
    ///
    /// Same as [`Self::try_get()`], but reports exhaustion as an error.
    pub fn get(
        &self,
        index: usize,
    ) -> Result<SectorRef<'_, Device, ClockMutex, SectorMutex>, SectorCacheError<Device::Error>>
    {
        self.try_get(index)?.ok_or(SectorCacheError::Exhausted)
    }

    /// Writes every dirty sector back to the device.
    ///
    /// Slots are pinned one at a time, so concurrent lookups still find free
    /// slots while the flush is in progress.
    pub fn flush_all(&self) -> Result<(), SectorCacheError<Device::Error>> {
        let mut flushed = 0;
        for i in 0..self.capacity() {
            let Some(value) = self.clock.slot(i) else {
                break;
            };
            let mut data = value.value().lock();
            if data.valid && data.dirty {
                let sector = data.index;
                self.device
                    .write(sector, &data.data.0)
                    .map_err(|error| SectorCacheError::Device { sector, error })?;
                Counters::bump(&self.counters.device_writes);
                data.dirty = false;
                flushed += 1;
            }
        }
        log::debug!("sector cache: flushed {flushed} dirty sectors");
        Ok(())
    }

    /// Returns the indices of all cached sectors, in slot order.
    pub fn resident_sectors(&self) -> Vec<usize> {
        self.clock.keys()
    }

    /// Returns a snapshot of the activity counters.
    pub fn stats(&self) -> CacheStats {
        self.counters.snapshot()
    }

    /// Zeroes the activity counters.
    pub fn reset_stats(&self) {
        self.counters.reset();
    }
}

impl<'list, Device, ClockMutex, SectorMutex, const SECTOR_SIZE: usize>
    SectorRef<'list, Device, ClockMutex, SectorMutex>
where
    Device: BlockDevice<SECTOR_SIZE>,
    ClockMutex: Mutex<Data = ClockMap<SectorMutex>>,
    SectorMutex: Mutex<Data = SectorData<SECTOR_SIZE>> + 'list,
{
    /// Returns the index number of the sector.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Acquires a sector's lock and provides a mutable exclusive access to it.
    pub fn lock<'b>(
        &'b mut self,
    ) -> SectorGuard<'list, 'b, Device, ClockMutex, SectorMutex, SECTOR_SIZE, false> {
        let mut data = self.value.value().lock();

        if data.index != self.index {
            // slot recycle occurred; eviction already wrote back old data
            debug_assert!(!data.valid || !data.dirty);
            data.index = self.index;
            data.valid = false;
            data.dirty = false;
        }

        SectorGuard {
            index: self.index,
            cache: self.cache,
            data,
        }
    }
}

impl<Device, ClockMutex, SectorMutex> Clone for SectorRef<'_, Device, ClockMutex, SectorMutex>
where
    ClockMutex: Mutex<Data = ClockMap<SectorMutex>>,
{
    fn clone(&self) -> Self {
        Self {
            index: self.index,
            cache: self.cache,
            value: self.value.clone(),
        }
    }
}

impl<'list, 'sector, Device, ClockMutex, SectorMutex, const SECTOR_SIZE: usize, const VALID: bool>
    SectorGuard<'list, 'sector, Device, ClockMutex, SectorMutex, SECTOR_SIZE, VALID>
where
    Device: BlockDevice<SECTOR_SIZE>,
    ClockMutex: Mutex<Data = ClockMap<SectorMutex>>,
    SectorMutex: Mutex<Data = SectorData<SECTOR_SIZE>> + 'sector,
{
    /// Returns the index number of the sector.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Reads the sector from the device if cached data is not valid.
    ///
    /// On failure the cached data stays invalid, so a later `read()` retries.
    #[expect(clippy::type_complexity)]
    pub fn read(
        mut self,
    ) -> Result<
        SectorGuard<'list, 'sector, Device, ClockMutex, SectorMutex, SECTOR_SIZE, true>,
        (Self, Device::Error),
    > {
        if !self.data.valid {
            if let Err(e) = self.cache.device.read(self.index, &mut self.data.data.0) {
                log::error!("sector cache: failed to read sector {}", self.index);
                return Err((self, e));
            }
            Counters::bump(&self.cache.counters.device_reads);
            self.data.valid = true;
            self.data.dirty = false;
        }

        Ok(self.validated())
    }

    /// Sets the whole sector data.
    ///
    /// # Panics
    ///
    /// Panics if `data` is not exactly one sector long.
    pub fn set_data(
        mut self,
        data: &[u8],
    ) -> SectorGuard<'list, 'sector, Device, ClockMutex, SectorMutex, SECTOR_SIZE, true> {
        self.data.valid = true;
        self.data.dirty = true;
        self.data.data.0.copy_from_slice(data);
        self.validated()
    }

    /// Fills the whole sector data with zero.
    pub fn zeroed(
        mut self,
    ) -> SectorGuard<'list, 'sector, Device, ClockMutex, SectorMutex, SECTOR_SIZE, true> {
        self.data.valid = true;
        self.data.dirty = true;
        self.data.data.0.fill(0);
        self.validated()
    }

    /// Returns `true` if the cached sector is dirty.
    pub fn is_dirty(&self) -> bool {
        self.data.dirty
    }

    /// Returns the validated guard if the cached data is valid.
    pub fn try_validate(
        self,
    ) -> Result<SectorGuard<'list, 'sector, Device, ClockMutex, SectorMutex, SECTOR_SIZE, true>, Self>
    {
        if self.data.valid {
            Ok(self.validated())
        } else {
            Err(self)
        }
    }

    fn validated(
        self,
    ) -> SectorGuard<'list, 'sector, Device, ClockMutex, SectorMutex, SECTOR_SIZE, true> {
        SectorGuard {
            index: self.index,
            cache: self.cache,
            data: self.data,
        }
    }
}

impl<Device, ClockMutex, SectorMutex, const SECTOR_SIZE: usize>
    SectorGuard<'_, '_, Device, ClockMutex, SectorMutex, SECTOR_SIZE, true>
where
    Device: BlockDevice<SECTOR_SIZE>,
    ClockMutex: Mutex<Data = ClockMap<SectorMutex>>,
    SectorMutex: Mutex<Data = SectorData<SECTOR_SIZE>>,
{
    /// Returns a reference to the bytes of the cached sector.
    pub fn bytes(&self) -> &[u8; SECTOR_SIZE] {
        &self.data.data.0
    }

    /// Returns a mutable reference to the bytes of the cached sector.
    ///
    /// Marks the sector dirty.
    pub fn bytes_mut(&mut self) -> &mut [u8; SECTOR_SIZE] {
        self.data.dirty = true;
        &mut self.data.data.0
    }

    /// Returns a reference to the sector data as POD.
    pub fn data<T>(&self) -> &T
    where
        T: Pod,
    {
        self.bytes().as_data_view().get(0)
    }

    /// Returns a mutable reference to the sector data as POD.
    ///
    /// Marks the sector dirty.
    pub fn data_mut<T>(&mut self) -> &mut T
    where
        T: Pod,
    {
        self.bytes_mut().as_data_view_mut().get_mut(0)
    }

    /// Writes the sector to the device now, clearing the dirty flag.
    pub fn write(&mut self) -> Result<(), Device::Error> {
        self.cache.device.write(self.index, &self.data.data.0)?;
        Counters::bump(&self.cache.counters.device_writes);
        self.data.dirty = false;
        Ok(())
    }
}
