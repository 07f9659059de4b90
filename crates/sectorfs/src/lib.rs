//! Indexed inodes on a sector device, behind a clock-replacement buffer
//! cache.
//!
//! [`FileSystem`] owns the buffer cache, the free sector map and the table
//! of open inodes. Files are unnamed [`Inode`]s addressed by the sector
//! holding them; naming them is left to a directory layer on top.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::vec;

use sectorfs_params::{CACHE_CAPACITY, DEFAULT_IMAGE_SECTORS, FREE_MAP_SECTOR, ROOT_DIR_SECTOR};
use sectorfs_types::{SECTOR_SIZE, SectorNo};

use self::{block_io::SectorCache, free_map::FreeMap, inode::InodeTable};

pub use self::{
    error::FsError,
    inode::{Inode, InodeState},
};
pub use sector_io::{BlockDevice, CacheStats};
pub use sectorfs_types as types;

mod block_io;
mod error;
mod free_map;
mod inode;

/// Sector holding the root directory inode.
pub const ROOT_DIR: SectorNo = SectorNo::new(ROOT_DIR_SECTOR);

/// Sector holding the free map inode.
pub const FREE_MAP: SectorNo = SectorNo::new(FREE_MAP_SECTOR);

/// Run-time parameters of a [`FileSystem`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsConfig {
    /// Number of sectors on the device.
    pub sector_count: usize,
    /// Number of sectors held by the buffer cache.
    pub cache_capacity: usize,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            sector_count: DEFAULT_IMAGE_SECTORS,
            cache_capacity: CACHE_CAPACITY,
        }
    }
}

impl FsConfig {
    /// Returns the default configuration for a device of `sector_count`
    /// sectors.
    #[must_use]
    pub fn new(sector_count: usize) -> Self {
        Self {
            sector_count,
            ..Self::default()
        }
    }
}

/// A file system on a sector device.
pub struct FileSystem<D> {
    cache: SectorCache<D>,
    free_map: FreeMap,
    inodes: InodeTable,
}

impl<D> FileSystem<D>
where
    D: BlockDevice<SECTOR_SIZE>,
{
    fn new(device: D, config: FsConfig) -> Self {
        Self {
            cache: SectorCache::new(device, config.cache_capacity),
            free_map: FreeMap::new(config.sector_count),
            inodes: InodeTable::new(),
        }
    }

    /// Creates an empty file system on `device`.
    ///
    /// The free map file and the root directory are created and written
    /// to the device before this returns.
    ///
    /// # Panics
    ///
    /// Panics if `config.cache_capacity` is zero or `config.sector_count`
    /// does not fit in a sector pointer.
    pub fn format(device: D, config: FsConfig) -> Result<Self, FsError> {
        if config.sector_count <= FREE_MAP.as_index() {
            return Err(FsError::ImageTooSmall);
        }

        let fs = Self::new(device, config);
        fs.free_map.reserve(ROOT_DIR);
        fs.free_map.reserve(FREE_MAP);

        let too_small = |e| match e {
            FsError::NoSpace => FsError::ImageTooSmall,
            e => e,
        };
        fs.create(FREE_MAP, fs.free_map.file_len(), false)
            .map_err(too_small)?;
        fs.create(ROOT_DIR, sectorfs_params::ROOT_DIR_LENGTH, true)
            .map_err(too_small)?;
        fs.sync()?;

        log::info!(
            "formatted {} sectors, {} free",
            config.sector_count,
            fs.free_sector_count()
        );
        Ok(fs)
    }

    /// Opens the file system on a formatted `device`.
    ///
    /// # Panics
    ///
    /// Panics if `config.cache_capacity` is zero or `config.sector_count`
    /// does not fit in a sector pointer.
    pub fn mount(device: D, config: FsConfig) -> Result<Self, FsError> {
        if config.sector_count <= FREE_MAP.as_index() {
            return Err(FsError::ImageTooSmall);
        }

        let fs = Self::new(device, config);
        {
            let free_map = fs.open(FREE_MAP)?;
            let mut bytes = vec![0; free_map.length()];
            let read = free_map.read_at(&mut bytes, 0)?;
            if read != bytes.len() || !fs.free_map.load(&bytes) {
                log::error!("free map does not match a {} sector device", config.sector_count);
                return Err(FsError::Corrupted { sector: FREE_MAP });
            }
            free_map.close()?;
            fs.open_root()?.close()?;
        }

        log::info!(
            "mounted {} sectors, {} free",
            config.sector_count,
            fs.free_sector_count()
        );
        Ok(fs)
    }

    /// Writes the free map and every dirty cached sector to the device.
    pub fn sync(&self) -> Result<(), FsError> {
        let bytes = self.free_map.to_bytes();
        let free_map = self.open(FREE_MAP)?;
        free_map.write_at(&bytes, 0)?;
        free_map.close()?;
        self.flush_all()
    }

    /// Syncs the file system and returns the device.
    pub fn shutdown(self) -> Result<D, FsError> {
        self.sync()?;
        log::info!("shut down, {} sectors free", self.free_sector_count());
        Ok(self.cache.into_device())
    }

    /// Creates an inode of `length` zero bytes at `sector`.
    ///
    /// The parent is set to the root directory.
    pub fn create(&self, sector: SectorNo, length: usize, is_dir: bool) -> Result<(), FsError> {
        inode::create(self, sector, length, is_dir, ROOT_DIR)
    }

    /// Allocates a sector and creates an inode of `length` zero bytes there.
    ///
    /// Returns the new inode's sector. On failure the sector is released.
    pub fn create_inode(&self, length: usize, is_dir: bool) -> Result<SectorNo, FsError> {
        let sectors = self.free_map.allocate(1).ok_or(FsError::NoSpace)?;
        let sector = sectors[0];
        if let Err(e) = self.create(sector, length, is_dir) {
            self.free_map.release(sector);
            return Err(e);
        }
        Ok(sector)
    }

    /// Opens the inode at `sector`.
    pub fn open(&self, sector: SectorNo) -> Result<Inode<'_, D>, FsError> {
        inode::open(self, sector)
    }

    /// Opens the root directory inode.
    pub fn open_root(&self) -> Result<Inode<'_, D>, FsError> {
        self.open(ROOT_DIR)
    }

    /// Records `parent` as the containing directory of the inode at `child`.
    pub fn add_parent(&self, parent: SectorNo, child: SectorNo) -> Result<(), FsError> {
        let inode = self.open(child)?;
        inode.set_parent(parent)?;
        inode.close()
    }

    /// Writes every dirty cached sector to the device.
    pub fn flush_all(&self) -> Result<(), FsError> {
        self.cache.flush_all().map_err(FsError::from)
    }

    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn reset_cache_stats(&self) {
        self.cache.reset_stats();
    }

    /// Returns the number of unallocated sectors.
    #[must_use]
    pub fn free_sector_count(&self) -> usize {
        self.free_map.free_count()
    }

    /// Returns the number of inodes with open handles.
    #[must_use]
    pub fn open_inode_count(&self) -> usize {
        self.inodes.len()
    }

    #[must_use]
    pub fn device(&self) -> &D {
        self.cache.device()
    }
}
