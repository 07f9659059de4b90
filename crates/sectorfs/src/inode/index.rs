//! Block index.
//!
//! The data of each inode is stored in sectors on the device. The first
//! [`NUM_DIRECT`] sector numbers are listed in the inode itself. The next
//! [`NUM_INDEX_ENTRIES`] are listed in the indirect block, and the rest in
//! the second-level blocks listed in the doubly-indirect block.
//!
//! An inode of `n` data sectors always owns exactly
//! [`index_sectors_for(n)`](index_sectors_for) index blocks, so which index
//! blocks exist is decided from the length alone. Index entries at or past
//! the length are never read.

use alloc::vec::Vec;

use sector_io::BlockDevice;
use sectorfs_types::{
    IndexBlock, IndexPath, InodeDisk, MAX_FILE_SIZE, NUM_DIRECT, NUM_INDEX_ENTRIES, SECTOR_SIZE,
    SectorNo, index_sectors_for, sectors_for,
};

use crate::{FileSystem, FsError, block_io};

/// Returns the device sector holding the byte at `offset`.
///
/// Returns `None` if `offset` is at or past the end of the file.
pub(crate) fn resolve<D>(
    fs: &FileSystem<D>,
    inode: SectorNo,
    disk: &InodeDisk,
    offset: usize,
) -> Result<Option<SectorNo>, FsError>
where
    D: BlockDevice<SECTOR_SIZE>,
{
    if offset >= disk.length() {
        return Ok(None);
    }
    let Some(path) = IndexPath::of(offset / SECTOR_SIZE) else {
        return Err(FsError::Corrupted { sector: inode });
    };

    let sn = match path {
        IndexPath::Direct(i) => disk.direct(i),
        IndexPath::Indirect(i) => match disk.indirect() {
            Some(ind) => index_entry(fs, ind, i)?,
            None => None,
        },
        IndexPath::DoublyIndirect(outer, inner) => match disk.doubly_indirect() {
            Some(dind) => match index_entry(fs, dind, outer)? {
                Some(ind) => index_entry(fs, ind, inner)?,
                None => None,
            },
            None => None,
        },
    };

    match sn {
        Some(sn) if sn.as_index() < fs.free_map.sector_count() => Ok(Some(sn)),
        _ => {
            log::error!("inode {inode}: no valid sector for offset {offset}");
            Err(FsError::Corrupted { sector: inode })
        }
    }
}

fn index_entry<D>(fs: &FileSystem<D>, block: SectorNo, i: usize) -> Result<Option<SectorNo>, FsError>
where
    D: BlockDevice<SECTOR_SIZE>,
{
    block_io::read(&fs.cache, block, |sg| sg.data::<IndexBlock>().get(i))
}

fn set_index_entry<D>(
    fs: &FileSystem<D>,
    block: SectorNo,
    i: usize,
    sn: SectorNo,
) -> Result<(), FsError>
where
    D: BlockDevice<SECTOR_SIZE>,
{
    block_io::modify(&fs.cache, block, |sg| {
        sg.data_mut::<IndexBlock>().set(i, Some(sn));
    })
}

/// Grows `disk` so that it is `new_len` bytes long.
///
/// Exactly the missing data sectors and the index blocks they need are
/// allocated, zero-filled and linked in, then the length is updated. The
/// inode sector itself is not written; that is up to the caller.
///
/// On failure `disk` is left as it was and every sector claimed by this
/// call is released.
pub(crate) fn grow<D>(fs: &FileSystem<D>, disk: &mut InodeDisk, new_len: usize) -> Result<(), FsError>
where
    D: BlockDevice<SECTOR_SIZE>,
{
    let old_len = disk.length();
    if new_len <= old_len {
        return Ok(());
    }
    if new_len > MAX_FILE_SIZE {
        log::warn!("cannot grow file to {new_len} bytes");
        return Err(FsError::FileTooLarge);
    }

    let old_sectors = sectors_for(old_len);
    let new_sectors = sectors_for(new_len);
    let count = (new_sectors - old_sectors) + index_sectors_for(new_sectors)
        - index_sectors_for(old_sectors);

    let fresh = fs.free_map.allocate(count).ok_or(FsError::NoSpace)?;
    let saved = disk.clone();
    let res = fresh
        .iter()
        .try_for_each(|sn| block_io::zero(&fs.cache, *sn))
        .and_then(|()| link(fs, disk, old_sectors, new_sectors, &fresh));
    if let Err(e) = res {
        log::warn!("growing file failed, releasing {count} sectors");
        *disk = saved;
        fs.free_map.release_all(fresh);
        return Err(e);
    }

    disk.set_length(new_len);
    log::debug!("grew file from {old_len} to {new_len} bytes ({count} new sectors)");
    Ok(())
}

/// Links zero-filled `fresh` sectors in as data blocks
/// `old_sectors..new_sectors` and the index blocks they need.
fn link<D>(
    fs: &FileSystem<D>,
    disk: &mut InodeDisk,
    old_sectors: usize,
    new_sectors: usize,
    fresh: &[SectorNo],
) -> Result<(), FsError>
where
    D: BlockDevice<SECTOR_SIZE>,
{
    let mut fresh = fresh.iter().copied();
    let mut next = || fresh.next().ok_or(FsError::NoSpace);

    for block in old_sectors..new_sectors {
        let Some(path) = IndexPath::of(block) else {
            return Err(FsError::FileTooLarge);
        };
        match path {
            IndexPath::Direct(i) => disk.set_direct(i, Some(next()?)),
            IndexPath::Indirect(i) => {
                if i == 0 {
                    disk.set_indirect(Some(next()?));
                }
                let ind = disk.indirect().ok_or(FsError::NoSpace)?;
                set_index_entry(fs, ind, i, next()?)?;
            }
            IndexPath::DoublyIndirect(outer, inner) => {
                if outer == 0 && inner == 0 {
                    disk.set_doubly_indirect(Some(next()?));
                }
                let dind = disk.doubly_indirect().ok_or(FsError::NoSpace)?;
                let ind = if inner == 0 {
                    let ind = next()?;
                    set_index_entry(fs, dind, outer, ind)?;
                    ind
                } else {
                    index_entry(fs, dind, outer)?.ok_or(FsError::NoSpace)?
                };
                set_index_entry(fs, ind, inner, next()?)?;
            }
        }
    }
    Ok(())
}

/// Returns every sector owned by `disk` (data and index blocks), leaving the
/// pointers in `disk` cleared and its length zero.
pub(crate) fn collect_sectors<D>(
    fs: &FileSystem<D>,
    disk: &mut InodeDisk,
) -> Result<Vec<SectorNo>, FsError>
where
    D: BlockDevice<SECTOR_SIZE>,
{
    let n = sectors_for(disk.length());
    let mut sectors = Vec::with_capacity(n + index_sectors_for(n));

    for i in 0..usize::min(n, NUM_DIRECT) {
        sectors.extend(disk.direct(i));
    }

    if n > NUM_DIRECT {
        let count = usize::min(n - NUM_DIRECT, NUM_INDEX_ENTRIES);
        if let Some(ind) = disk.indirect() {
            collect_index(fs, ind, count, &mut sectors)?;
            sectors.push(ind);
        }
    }

    if n > NUM_DIRECT + NUM_INDEX_ENTRIES {
        let rest = n - NUM_DIRECT - NUM_INDEX_ENTRIES;
        if let Some(dind) = disk.doubly_indirect() {
            for outer in 0..rest.div_ceil(NUM_INDEX_ENTRIES) {
                let count = usize::min(rest - outer * NUM_INDEX_ENTRIES, NUM_INDEX_ENTRIES);
                if let Some(ind) = index_entry(fs, dind, outer)? {
                    collect_index(fs, ind, count, &mut sectors)?;
                    sectors.push(ind);
                }
            }
            sectors.push(dind);
        }
    }

    for i in 0..NUM_DIRECT {
        disk.set_direct(i, None);
    }
    disk.set_indirect(None);
    disk.set_doubly_indirect(None);
    disk.set_length(0);
    Ok(sectors)
}

fn collect_index<D>(
    fs: &FileSystem<D>,
    block: SectorNo,
    count: usize,
    sectors: &mut Vec<SectorNo>,
) -> Result<(), FsError>
where
    D: BlockDevice<SECTOR_SIZE>,
{
    block_io::read(&fs.cache, block, |sg| {
        let index = sg.data::<IndexBlock>();
        sectors.extend((0..count).filter_map(|i| index.get(i)));
    })
}
