#![no_std]

/// Number of sectors held by the buffer cache.
pub const CACHE_CAPACITY: usize = 64;

/// Sector holding the root directory inode.
pub const ROOT_DIR_SECTOR: u32 = 0;

/// Sector holding the free map inode.
pub const FREE_MAP_SECTOR: u32 = 1;

/// Size of a newly formatted image in sectors (4 MiB).
pub const DEFAULT_IMAGE_SECTORS: usize = 8192;

/// Initial length in bytes of the root directory (16 records of 20 bytes).
pub const ROOT_DIR_LENGTH: usize = 16 * 20;
