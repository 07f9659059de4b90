//! Inodes.
//!
//! An inode describes a single unnamed file. The on-device inode
//! ([`InodeDisk`]) holds the file's length, type, parent and the block
//! index that maps file offsets to sectors.
//!
//! The file system keeps a table of open inodes so that every opener of
//! the same inode sector shares one in-memory instance. Each
//! [`Inode`] handle counts as one opener; the instance is dropped from the
//! table when the last handle is closed.
//!
//! Removing an inode only marks it. Its sectors stay allocated, and its
//! data readable through the remaining handles, until the last handle is
//! closed. The life of an in-memory inode is thus
//! [`Open`](InodeState::Open) →
//! [`MarkedForRemoval`](InodeState::MarkedForRemoval) →
//! [`Destroyed`](InodeState::Destroyed), where the last step happens
//! exactly once, on the final close.
//!
//! Each instance has two locks. `meta` guards the lifecycle counters and is
//! only held briefly. `disk` guards the cached [`InodeDisk`] and is held
//! across device I/O while the file grows. Reads work on a copy of the
//! inode taken under `disk`, so they do not block each other.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};

use dataview::PodMethods as _;
use sector_io::BlockDevice;
use sectorfs_types::{InodeDisk, MAX_FILE_SIZE, SECTOR_SIZE, SectorNo};

use crate::{FileSystem, FsError, block_io};

mod index;
mod table;

pub(crate) use self::table::InodeTable;
use self::table::Released;

/// Lifecycle state of an in-memory inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeState {
    /// Open, not removed.
    Open,
    /// Open, and its sectors will be released when the last handle closes.
    MarkedForRemoval,
    /// Last handle closed after removal; sectors released.
    Destroyed,
}

struct Meta {
    open_count: usize,
    deny_write_count: usize,
    state: InodeState,
}

pub(crate) struct InodeInner {
    sector: SectorNo,
    meta: spin::Mutex<Meta>,
    disk: spin::Mutex<InodeDisk>,
}

impl InodeInner {
    fn new(sector: SectorNo, disk: InodeDisk) -> Self {
        Self {
            sector,
            meta: spin::Mutex::new(Meta {
                open_count: 1,
                deny_write_count: 0,
                state: InodeState::Open,
            }),
            disk: spin::Mutex::new(disk),
        }
    }
}

/// Loads the inode at `sector` from the device.
fn load<D>(fs: &FileSystem<D>, sector: SectorNo) -> Result<InodeDisk, FsError>
where
    D: BlockDevice<SECTOR_SIZE>,
{
    let mut disk = InodeDisk::zeroed();
    block_io::read(&fs.cache, sector, |sg| {
        disk.as_bytes_mut().copy_from_slice(sg.bytes());
    })?;
    if !disk.is_valid() {
        log::warn!("sector {sector} does not hold an inode");
        return Err(FsError::Corrupted { sector });
    }
    Ok(disk)
}

/// Writes `disk` to the inode sector in the cache. The sector is left dirty.
fn store<D>(fs: &FileSystem<D>, sector: SectorNo, disk: &InodeDisk) -> Result<(), FsError>
where
    D: BlockDevice<SECTOR_SIZE>,
{
    block_io::write_bytes(&fs.cache, sector, 0, disk.as_bytes())
}

/// Initializes an inode of `length` bytes at `sector` and writes it to the
/// cache.
///
/// Data and index sectors are allocated from the free map and zero-filled.
/// On failure nothing stays allocated except `sector` itself, which the
/// caller owns.
pub(crate) fn create<D>(
    fs: &FileSystem<D>,
    sector: SectorNo,
    length: usize,
    is_dir: bool,
    parent: SectorNo,
) -> Result<(), FsError>
where
    D: BlockDevice<SECTOR_SIZE>,
{
    if length > MAX_FILE_SIZE {
        return Err(FsError::FileTooLarge);
    }

    let mut disk = InodeDisk::zeroed();
    disk.init(is_dir, parent);
    index::grow(fs, &mut disk, length)?;
    if let Err(e) = store(fs, sector, &disk) {
        let sectors = index::collect_sectors(fs, &mut disk)?;
        fs.free_map.release_all(sectors);
        return Err(e);
    }
    log::debug!("created inode {sector} ({length} bytes)");
    Ok(())
}

/// Opens the inode at `sector`, sharing the in-memory instance with other
/// openers.
pub(crate) fn open<D>(fs: &FileSystem<D>, sector: SectorNo) -> Result<Inode<'_, D>, FsError>
where
    D: BlockDevice<SECTOR_SIZE>,
{
    if sector.as_index() >= fs.free_map.sector_count() {
        return Err(FsError::Corrupted { sector });
    }
    let inner = fs.inodes.open(sector, || load(fs, sector))?;
    Ok(Inode {
        fs,
        inner,
        denied: AtomicBool::new(false),
        closed: false,
    })
}

/// Handle to an open inode.
///
/// Dropping the handle closes it; use [`Inode::close()`] to observe errors
/// from the close.
pub struct Inode<'fs, D>
where
    D: BlockDevice<SECTOR_SIZE>,
{
    fs: &'fs FileSystem<D>,
    inner: Arc<InodeInner>,
    denied: AtomicBool,
    closed: bool,
}

impl<'fs, D> Inode<'fs, D>
where
    D: BlockDevice<SECTOR_SIZE>,
{
    /// Returns the inode sector, which also serves as the inode number.
    #[must_use]
    pub fn sector(&self) -> SectorNo {
        self.inner.sector
    }

    /// Returns the file size in bytes.
    #[must_use]
    pub fn length(&self) -> usize {
        self.inner.disk.lock().length()
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.inner.disk.lock().is_dir()
    }

    /// Returns the sector of the containing directory's inode.
    #[must_use]
    pub fn parent(&self) -> SectorNo {
        self.inner.disk.lock().parent()
    }

    /// Records `parent` as the containing directory.
    pub fn set_parent(&self, parent: SectorNo) -> Result<(), FsError> {
        let mut disk = self.inner.disk.lock();
        disk.set_parent(parent);
        store(self.fs, self.inner.sector, &disk)
    }

    /// Returns the number of open handles to this inode.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.inner.meta.lock().open_count
    }

    #[must_use]
    pub fn state(&self) -> InodeState {
        self.inner.meta.lock().state
    }

    #[must_use]
    pub fn is_removed(&self) -> bool {
        self.state() != InodeState::Open
    }

    /// Opens another handle to the same inode.
    #[must_use]
    pub fn reopen(&self) -> Self {
        self.inner.meta.lock().open_count += 1;
        Self {
            fs: self.fs,
            inner: Arc::clone(&self.inner),
            denied: AtomicBool::new(false),
            closed: false,
        }
    }

    /// Marks the inode to be deleted when the last handle is closed.
    pub fn remove(&self) -> Result<(), FsError> {
        let mut meta = self.inner.meta.lock();
        if meta.state != InodeState::Open {
            log::warn!("inode {} removed twice", self.inner.sector);
            return Err(FsError::AlreadyRemoved);
        }
        meta.state = InodeState::MarkedForRemoval;
        Ok(())
    }

    /// Disables writes to the inode through every handle, until this handle
    /// calls [`Inode::allow_write()`] or is closed.
    ///
    /// Denying again through the same handle has no further effect.
    pub fn deny_write(&self) {
        if self.denied.swap(true, Ordering::Relaxed) {
            return;
        }
        let mut meta = self.inner.meta.lock();
        meta.deny_write_count += 1;
        debug_assert!(meta.deny_write_count <= meta.open_count);
    }

    /// Lifts the write denial of this handle.
    ///
    /// Does nothing if this handle has not denied writes.
    pub fn allow_write(&self) {
        if !self.denied.swap(false, Ordering::Relaxed) {
            return;
        }
        let mut meta = self.inner.meta.lock();
        debug_assert!(meta.deny_write_count > 0);
        meta.deny_write_count -= 1;
    }

    /// Returns the device sector holding the byte at `offset`, or `None` if
    /// `offset` is at or past the end of the file.
    pub fn resolve(&self, offset: usize) -> Result<Option<SectorNo>, FsError> {
        let disk = self.inner.disk.lock().clone();
        index::resolve(self.fs, self.inner.sector, &disk, offset)
    }

    /// Reads from the inode starting at `offset` into `buf`.
    ///
    /// Returns the number of bytes read, which is less than `buf.len()` if
    /// the end of the file is reached.
    pub fn read_at(&self, buf: &mut [u8], offset: usize) -> Result<usize, FsError> {
        let disk = self.inner.disk.lock().clone();
        let length = disk.length();
        if offset >= length {
            return Ok(0);
        }
        let n = usize::min(buf.len(), length - offset);

        let mut tot = 0;
        while tot < n {
            let off = offset + tot;
            let sector_ofs = off % SECTOR_SIZE;
            let m = usize::min(n - tot, SECTOR_SIZE - sector_ofs);
            let sn = index::resolve(self.fs, self.inner.sector, &disk, off)?
                .ok_or(FsError::Corrupted { sector: self.inner.sector })?;
            let dst = &mut buf[tot..][..m];
            block_io::read(&self.fs.cache, sn, |sg| {
                dst.copy_from_slice(&sg.bytes()[sector_ofs..][..m]);
            })?;
            tot += m;
        }
        Ok(tot)
    }

    /// Writes `buf` into the inode starting at `offset`.
    ///
    /// The file grows if the write extends past its end; a gap between the
    /// old end and `offset` reads as zeros.
    /// Returns the number of bytes written.
    pub fn write_at(&self, buf: &[u8], offset: usize) -> Result<usize, FsError> {
        if self.inner.meta.lock().deny_write_count > 0 {
            log::warn!("inode {}: write denied", self.inner.sector);
            return Err(FsError::WriteDenied);
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let end = offset
            .checked_add(buf.len())
            .filter(|end| *end <= MAX_FILE_SIZE)
            .ok_or(FsError::FileTooLarge)?;

        let disk = {
            let mut disk = self.inner.disk.lock();
            if end > disk.length() {
                index::grow(self.fs, &mut disk, end)?;
                store(self.fs, self.inner.sector, &disk)?;
            }
            disk.clone()
        };

        let mut tot = 0;
        while tot < buf.len() {
            let off = offset + tot;
            let sector_ofs = off % SECTOR_SIZE;
            let m = usize::min(buf.len() - tot, SECTOR_SIZE - sector_ofs);
            let sn = index::resolve(self.fs, self.inner.sector, &disk, off)?
                .ok_or(FsError::Corrupted { sector: self.inner.sector })?;
            block_io::write_bytes(&self.fs.cache, sn, sector_ofs, &buf[tot..][..m])?;
            tot += m;
        }
        Ok(tot)
    }

    /// Closes the handle, lifting its write denial.
    ///
    /// If this was the last handle and the inode was removed, its data
    /// sectors, index blocks and inode sector are released. If that fails
    /// the inode is left allocated on the device, as if never removed.
    pub fn close(mut self) -> Result<(), FsError> {
        self.closed = true;
        self.release()
    }

    fn release(&self) -> Result<(), FsError> {
        self.allow_write();
        match self.fs.inodes.release(&self.inner) {
            Released::StillOpen | Released::Closed => Ok(()),
            Released::Destroyed => self.reclaim(),
        }
    }

    fn reclaim(&self) -> Result<(), FsError> {
        let sector = self.inner.sector;
        let res = self.release_sectors();
        if let Err(e) = &res {
            log::error!("inode {sector}: removal failed, sectors stay allocated: {e}");
        }
        self.fs.inodes.forget(sector);
        res
    }

    fn release_sectors(&self) -> Result<(), FsError> {
        let sector = self.inner.sector;
        let mut disk = self.inner.disk.lock().clone();
        let sectors = index::collect_sectors(self.fs, &mut disk)?;
        block_io::zero(&self.fs.cache, sector)?;

        let count = sectors.len();
        self.fs.free_map.release_all(sectors);
        self.fs.free_map.release(sector);
        *self.inner.disk.lock() = disk;
        log::debug!("inode {sector} destroyed, {count} sectors released");
        Ok(())
    }
}

impl<D> Drop for Inode<'_, D>
where
    D: BlockDevice<SECTOR_SIZE>,
{
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.release() {
            log::error!("failed to close inode {}: {e}", self.inner.sector);
        }
    }
}
