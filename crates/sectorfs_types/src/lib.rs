//! Data types for sectorfs.
//!
//! The data layout:
//!
//! | sector no.  | content           | type                |
//! |-------------|-------------------|---------------------|
//! | 0           | root directory    | [`InodeDisk`]       |
//! | 1           | free map          | [`InodeDisk`]       |
//! | 2..         | free, data, index or inode sectors | `[u8; SECTOR_SIZE]`, [`IndexBlock`], [`InodeDisk`] |
//!
//! Sectors after the reserved ones carry no tag; what a sector holds is known
//! only from the inode pointer that leads to it. The free map file is a
//! sequence of [`FreeMapBlock`]s.

#![cfg_attr(not(test), no_std)]

use core::fmt;

use dataview::{Pod, PodMethods as _};

/// Sector size in bytes.
pub const SECTOR_SIZE: usize = 512;

/// Number of sectors directly referenced by an inode.
pub const NUM_DIRECT: usize = 122;

/// Number of sector pointers held by an index block.
pub const NUM_INDEX_ENTRIES: usize = SECTOR_SIZE / size_of::<u32>();

/// Maximum number of data sectors a file can reference.
pub const MAX_FILE_SECTORS: usize =
    NUM_DIRECT + NUM_INDEX_ENTRIES + NUM_INDEX_ENTRIES * NUM_INDEX_ENTRIES;

/// Maximum file length in bytes.
pub const MAX_FILE_SIZE: usize = MAX_FILE_SECTORS * SECTOR_SIZE;

/// Identifies an inode sector.
pub const INODE_MAGIC: u32 = 0x494e_4f44;

/// Represents a device sector number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Pod)]
#[repr(transparent)]
pub struct SectorNo(u32);

impl fmt::Display for SectorNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SectorNo {
    /// Creates a new `SectorNo` with the given value.
    #[must_use]
    pub const fn new(n: u32) -> Self {
        Self(n)
    }

    /// Returns the value of the sector number.
    #[must_use]
    pub const fn value(&self) -> u32 {
        self.0
    }

    /// Converts the sector number to an index.
    #[must_use]
    pub const fn as_index(&self) -> usize {
        self.0 as usize
    }

    /// Converts an index to a sector number.
    ///
    /// Returns `None` if the index does not fit in a pointer.
    #[must_use]
    pub fn from_index(i: usize) -> Option<Self> {
        u32::try_from(i).ok().map(Self)
    }
}

fn to_ptr(sector: Option<SectorNo>) -> u32 {
    sector.map_or(0, |sn| {
        assert_ne!(sn.0, 0, "sector 0 cannot be used as a pointer");
        sn.0
    })
}

fn from_ptr(ptr: u32) -> Option<SectorNo> {
    (ptr != 0).then_some(SectorNo(ptr))
}

/// Returns the number of sectors needed to hold `bytes` bytes.
#[must_use]
pub const fn sectors_for(bytes: usize) -> usize {
    bytes.div_ceil(SECTOR_SIZE)
}

/// Returns the number of index blocks a file of `data_sectors` data sectors
/// needs.
///
/// The doubly-indirect block itself is counted along with the second-level
/// blocks below it.
#[must_use]
pub const fn index_sectors_for(data_sectors: usize) -> usize {
    if data_sectors <= NUM_DIRECT {
        return 0;
    }
    let rest = data_sectors - NUM_DIRECT;
    if rest <= NUM_INDEX_ENTRIES {
        return 1;
    }
    let rest = rest - NUM_INDEX_ENTRIES;
    2 + rest.div_ceil(NUM_INDEX_ENTRIES)
}

/// Position of a logical block within the inode's index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexPath {
    /// `direct[i]`
    Direct(usize),
    /// `indirect[i]`
    Indirect(usize),
    /// `doubly_indirect[outer][inner]`
    DoublyIndirect(usize, usize),
}

impl IndexPath {
    /// Classifies the logical block number `block`.
    ///
    /// Returns `None` if `block` is past [`MAX_FILE_SECTORS`].
    #[must_use]
    pub const fn of(block: usize) -> Option<Self> {
        if block < NUM_DIRECT {
            return Some(Self::Direct(block));
        }
        let block = block - NUM_DIRECT;
        if block < NUM_INDEX_ENTRIES {
            return Some(Self::Indirect(block));
        }
        let block = block - NUM_INDEX_ENTRIES;
        if block < NUM_INDEX_ENTRIES * NUM_INDEX_ENTRIES {
            return Some(Self::DoublyIndirect(
                block / NUM_INDEX_ENTRIES,
                block % NUM_INDEX_ENTRIES,
            ));
        }
        None
    }
}

/// On-disk inode. Occupies exactly one sector.
#[derive(Pod)]
#[repr(C)]
pub struct InodeDisk {
    /// File size in bytes.
    length: u32,
    /// Must be [`INODE_MAGIC`].
    magic: u32,
    is_dir: u32,
    /// Sector of the inode of the containing directory.
    parent: u32,
    direct: [u32; NUM_DIRECT],
    indirect: u32,
    doubly_indirect: u32,
}
const _: () = const { assert!(size_of::<InodeDisk>() == SECTOR_SIZE) };

impl InodeDisk {
    /// Initializes an empty inode.
    pub fn init(&mut self, is_dir: bool, parent: SectorNo) {
        *self = Self::zeroed();
        self.magic = INODE_MAGIC;
        self.is_dir = is_dir.into();
        self.parent = parent.0;
    }

    /// Returns `true` if the magic number is valid.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.magic == INODE_MAGIC
    }

    /// Returns the file size in bytes.
    #[must_use]
    pub fn length(&self) -> usize {
        self.length as usize
    }

    /// Sets the file size.
    ///
    /// # Panics
    ///
    /// Panics if `length` exceeds [`MAX_FILE_SIZE`].
    pub fn set_length(&mut self, length: usize) {
        assert!(length <= MAX_FILE_SIZE);
        self.length = u32::try_from(length).unwrap();
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.is_dir != 0
    }

    #[must_use]
    pub fn parent(&self) -> SectorNo {
        SectorNo(self.parent)
    }

    pub fn set_parent(&mut self, parent: SectorNo) {
        self.parent = parent.0;
    }

    /// Retrieves the `i`th direct pointer.
    #[must_use]
    pub fn direct(&self, i: usize) -> Option<SectorNo> {
        from_ptr(self.direct[i])
    }

    /// Sets the `i`th direct pointer.
    ///
    /// # Panics
    ///
    /// Panics if sector number of `sn` is zero.
    pub fn set_direct(&mut self, i: usize, sn: Option<SectorNo>) {
        self.direct[i] = to_ptr(sn);
    }

    #[must_use]
    pub fn indirect(&self) -> Option<SectorNo> {
        from_ptr(self.indirect)
    }

    pub fn set_indirect(&mut self, sn: Option<SectorNo>) {
        self.indirect = to_ptr(sn);
    }

    #[must_use]
    pub fn doubly_indirect(&self) -> Option<SectorNo> {
        from_ptr(self.doubly_indirect)
    }

    pub fn set_doubly_indirect(&mut self, sn: Option<SectorNo>) {
        self.doubly_indirect = to_ptr(sn);
    }
}

impl Clone for InodeDisk {
    fn clone(&self) -> Self {
        let mut new = Self::zeroed();
        new.as_bytes_mut().copy_from_slice(self.as_bytes());
        new
    }
}

/// Index block: one sector of sector pointers.
#[derive(Pod)]
#[repr(transparent)]
pub struct IndexBlock([u32; NUM_INDEX_ENTRIES]);
const _: () = const { assert!(size_of::<IndexBlock>() == SECTOR_SIZE) };

impl IndexBlock {
    /// Retrieves the `i`th pointer.
    #[must_use]
    pub fn get(&self, i: usize) -> Option<SectorNo> {
        from_ptr(self.0[i])
    }

    /// Sets the `i`th pointer.
    ///
    /// # Panics
    ///
    /// Panics if sector number of `sn` is zero.
    pub fn set(&mut self, i: usize, sn: Option<SectorNo>) {
        self.0[i] = to_ptr(sn);
    }
}

/// Bitmap bits per sector.
pub const BITS_PER_SECTOR: usize = SECTOR_SIZE * 8;

/// One sector of the free map. A set bit marks an allocated sector.
#[derive(Pod)]
#[repr(transparent)]
pub struct FreeMapBlock([u8; SECTOR_SIZE]);
const _: () = const { assert!(size_of::<FreeMapBlock>() == SECTOR_SIZE) };

impl FreeMapBlock {
    /// Returns `true` if the `n`th sector in this block is allocated.
    ///
    /// # Panics
    ///
    /// Panics if `n` is greater than or equal to `BITS_PER_SECTOR`.
    #[must_use]
    pub fn is_allocated(&self, n: usize) -> bool {
        assert!(n < BITS_PER_SECTOR);
        self.0[n / 8] & (1 << (n % 8)) != 0
    }

    /// Marks the `n`th sector in this block as allocated.
    ///
    /// # Panics
    ///
    /// Panics if `n` is greater than or equal to `BITS_PER_SECTOR`.
    pub fn allocate(&mut self, n: usize) {
        assert!(n < BITS_PER_SECTOR);
        self.0[n / 8] |= 1 << (n % 8);
    }

    /// Marks the `n`th sector in this block as free.
    ///
    /// # Panics
    ///
    /// Panics if `n` is greater than or equal to `BITS_PER_SECTOR`.
    pub fn free(&mut self, n: usize) {
        assert!(n < BITS_PER_SECTOR);
        self.0[n / 8] &= !(1 << (n % 8));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits() {
        assert_eq!(NUM_INDEX_ENTRIES, 128);
        assert_eq!(MAX_FILE_SECTORS, 16_634);
        assert_eq!(MAX_FILE_SIZE, 8_516_608);
    }

    #[test]
    fn index_path_boundaries() {
        assert_eq!(IndexPath::of(0), Some(IndexPath::Direct(0)));
        assert_eq!(IndexPath::of(121), Some(IndexPath::Direct(121)));
        assert_eq!(IndexPath::of(122), Some(IndexPath::Indirect(0)));
        assert_eq!(IndexPath::of(249), Some(IndexPath::Indirect(127)));
        assert_eq!(IndexPath::of(250), Some(IndexPath::DoublyIndirect(0, 0)));
        assert_eq!(IndexPath::of(377), Some(IndexPath::DoublyIndirect(0, 127)));
        assert_eq!(IndexPath::of(378), Some(IndexPath::DoublyIndirect(1, 0)));
        assert_eq!(
            IndexPath::of(MAX_FILE_SECTORS - 1),
            Some(IndexPath::DoublyIndirect(127, 127))
        );
        assert_eq!(IndexPath::of(MAX_FILE_SECTORS), None);
    }

    #[test]
    fn sector_counts() {
        assert_eq!(sectors_for(0), 0);
        assert_eq!(sectors_for(1), 1);
        assert_eq!(sectors_for(512), 1);
        assert_eq!(sectors_for(513), 2);
        assert_eq!(sectors_for(64_000), 125);

        assert_eq!(index_sectors_for(0), 0);
        assert_eq!(index_sectors_for(122), 0);
        assert_eq!(index_sectors_for(123), 1);
        assert_eq!(index_sectors_for(250), 1);
        assert_eq!(index_sectors_for(251), 3);
        assert_eq!(index_sectors_for(378), 3);
        assert_eq!(index_sectors_for(379), 4);
        assert_eq!(index_sectors_for(MAX_FILE_SECTORS), 2 + 128);
    }

    #[test]
    fn inode_disk_pointers() {
        let mut inode = InodeDisk::zeroed();
        assert!(!inode.is_valid());
        inode.init(true, SectorNo::new(0));
        assert!(inode.is_valid());
        assert!(inode.is_dir());
        assert_eq!(inode.length(), 0);

        inode.set_direct(3, Some(SectorNo::new(40)));
        inode.set_indirect(Some(SectorNo::new(41)));
        assert_eq!(inode.direct(3), Some(SectorNo::new(40)));
        assert_eq!(inode.direct(4), None);
        assert_eq!(inode.indirect(), Some(SectorNo::new(41)));
        assert_eq!(inode.doubly_indirect(), None);

        let copy = inode.clone();
        assert_eq!(copy.direct(3), Some(SectorNo::new(40)));
        assert_eq!(copy.as_bytes(), inode.as_bytes());
    }

    #[test]
    #[should_panic(expected = "sector 0 cannot be used as a pointer")]
    fn zero_pointer_rejected() {
        let mut block = IndexBlock::zeroed();
        block.set(0, Some(SectorNo::new(0)));
    }

    #[test]
    fn index_block_pointers() {
        let mut block = IndexBlock::zeroed();
        block.set(0, Some(SectorNo::new(7)));
        block.set(127, Some(SectorNo::new(9)));
        assert_eq!(block.get(0), Some(SectorNo::new(7)));
        assert_eq!(block.get(1), None);
        assert_eq!(block.get(127), Some(SectorNo::new(9)));
        block.set(0, None);
        assert_eq!(block.get(0), None);
    }

    #[test]
    fn free_map_bits() {
        let mut block = FreeMapBlock::zeroed();
        block.allocate(0);
        block.allocate(9);
        assert!(block.is_allocated(0));
        assert!(block.is_allocated(9));
        assert!(!block.is_allocated(8));
        block.free(9);
        assert!(!block.is_allocated(9));
    }
}
