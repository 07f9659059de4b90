//! Free sector map.
//!
//! The bitmap is kept in memory and written to the free map file when the
//! file system shuts down.

use alloc::vec::Vec;

use dataview::PodMethods as _;
use sectorfs_types::{BITS_PER_SECTOR, FreeMapBlock, SECTOR_SIZE, SectorNo};

pub(crate) struct FreeMap(spin::Mutex<Bitmap>);

struct Bitmap {
    blocks: Vec<FreeMapBlock>,
    sector_count: usize,
    free: usize,
}

impl Bitmap {
    fn is_allocated(&self, i: usize) -> bool {
        self.blocks[i / BITS_PER_SECTOR].is_allocated(i % BITS_PER_SECTOR)
    }

    fn allocate(&mut self, i: usize) {
        assert!(!self.is_allocated(i), "allocating allocated sector {i}");
        self.blocks[i / BITS_PER_SECTOR].allocate(i % BITS_PER_SECTOR);
        self.free -= 1;
    }

    fn free(&mut self, i: usize) {
        assert!(self.is_allocated(i), "freeing free sector {i}");
        self.blocks[i / BITS_PER_SECTOR].free(i % BITS_PER_SECTOR);
        self.free += 1;
    }
}

impl FreeMap {
    /// Creates a map of `sector_count` free sectors.
    ///
    /// # Panics
    ///
    /// Panics if sector numbers above `sector_count` do not fit in a pointer.
    pub(crate) fn new(sector_count: usize) -> Self {
        assert!(SectorNo::from_index(sector_count).is_some());
        let mut blocks = Vec::new();
        blocks.resize_with(sector_count.div_ceil(BITS_PER_SECTOR), FreeMapBlock::zeroed);
        Self(spin::Mutex::new(Bitmap {
            blocks,
            sector_count,
            free: sector_count,
        }))
    }

    pub(crate) fn sector_count(&self) -> usize {
        self.0.lock().sector_count
    }

    pub(crate) fn free_count(&self) -> usize {
        self.0.lock().free
    }

    /// Size in bytes of the free map file.
    pub(crate) fn file_len(&self) -> usize {
        self.0.lock().blocks.len() * SECTOR_SIZE
    }

    /// Marks a fixed sector as allocated.
    pub(crate) fn reserve(&self, sn: SectorNo) {
        self.0.lock().allocate(sn.as_index());
    }

    /// Allocates `n` sectors, first fit.
    ///
    /// Either all `n` sectors are allocated or none is.
    pub(crate) fn allocate(&self, n: usize) -> Option<Vec<SectorNo>> {
        let mut map = self.0.lock();
        if map.free < n {
            log::warn!("free map: {n} sectors requested, {} free", map.free);
            return None;
        }

        let mut sectors = Vec::with_capacity(n);
        let mut i = 0;
        while sectors.len() < n {
            if !map.is_allocated(i) {
                map.allocate(i);
                sectors.extend(SectorNo::from_index(i));
            }
            i += 1;
        }
        log::debug!("free map: allocated {n} sectors");
        Some(sectors)
    }

    /// Returns a sector to the pool.
    ///
    /// # Panics
    ///
    /// Panics if the sector is not allocated.
    pub(crate) fn release(&self, sn: SectorNo) {
        self.0.lock().free(sn.as_index());
    }

    pub(crate) fn release_all(&self, sectors: impl IntoIterator<Item = SectorNo>) {
        let mut map = self.0.lock();
        for sn in sectors {
            map.free(sn.as_index());
        }
    }

    /// Returns the contents of the free map file.
    pub(crate) fn to_bytes(&self) -> Vec<u8> {
        let map = self.0.lock();
        map.blocks
            .iter()
            .flat_map(|b| b.as_bytes().iter().copied())
            .collect()
    }

    /// Replaces the bitmap with the contents of the free map file.
    ///
    /// Returns `false` if `bytes` has the wrong size.
    pub(crate) fn load(&self, bytes: &[u8]) -> bool {
        let mut map = self.0.lock();
        if bytes.len() != map.blocks.len() * SECTOR_SIZE {
            return false;
        }
        for (block, src) in map.blocks.iter_mut().zip(bytes.chunks_exact(SECTOR_SIZE)) {
            block.as_bytes_mut().copy_from_slice(src);
        }
        let free = (0..map.sector_count)
            .filter(|&i| !map.is_allocated(i))
            .count();
        map.free = free;
        true
    }
}
