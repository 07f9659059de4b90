//! Sector access through the buffer cache.
//!
//! Each helper pins one slot, runs the closure under the slot's lock and
//! unpins it again, so callers never hold two slots at once.

use sector_io::{BlockDevice, ClockMap, SectorData};
use sectorfs_types::{SECTOR_SIZE, SectorNo};

use crate::FsError;

type SectorMutex = spin::Mutex<SectorData<SECTOR_SIZE>>;
type ClockMutex = spin::Mutex<ClockMap<SectorMutex>>;

pub(crate) type SectorCache<D> = sector_io::SectorCache<D, ClockMutex>;

pub(crate) type SectorGuard<'a, 'b, D> =
    sector_io::SectorGuard<'a, 'b, D, ClockMutex, SectorMutex, SECTOR_SIZE, true>;

/// Reads the sector (from the cache if resident) and passes it to `f`.
pub(crate) fn read<D, T>(
    cache: &SectorCache<D>,
    sn: SectorNo,
    f: impl FnOnce(&SectorGuard<'_, '_, D>) -> T,
) -> Result<T, FsError>
where
    D: BlockDevice<SECTOR_SIZE>,
{
    let mut sr = cache.get(sn.as_index())?;
    let sg = sr.lock().read().map_err(|_| io_error(sn))?;
    Ok(f(&sg))
}

/// Reads the sector and lets `f` modify it. The sector is left dirty.
pub(crate) fn modify<D, T>(
    cache: &SectorCache<D>,
    sn: SectorNo,
    f: impl FnOnce(&mut SectorGuard<'_, '_, D>) -> T,
) -> Result<T, FsError>
where
    D: BlockDevice<SECTOR_SIZE>,
{
    let mut sr = cache.get(sn.as_index())?;
    let mut sg = sr.lock().read().map_err(|_| io_error(sn))?;
    Ok(f(&mut sg))
}

/// Overwrites part of the sector starting at `offset`.
///
/// A full-sector write skips reading the old contents from the device.
pub(crate) fn write_bytes<D>(
    cache: &SectorCache<D>,
    sn: SectorNo,
    offset: usize,
    src: &[u8],
) -> Result<(), FsError>
where
    D: BlockDevice<SECTOR_SIZE>,
{
    if offset == 0 && src.len() == SECTOR_SIZE {
        let mut sr = cache.get(sn.as_index())?;
        sr.lock().set_data(src);
        return Ok(());
    }
    modify(cache, sn, |sg| {
        sg.bytes_mut()[offset..][..src.len()].copy_from_slice(src);
    })
}

/// Fills the sector with zeros without reading it.
pub(crate) fn zero<D>(cache: &SectorCache<D>, sn: SectorNo) -> Result<(), FsError>
where
    D: BlockDevice<SECTOR_SIZE>,
{
    let mut sr = cache.get(sn.as_index())?;
    sr.lock().zeroed();
    Ok(())
}

fn io_error(sn: SectorNo) -> FsError {
    log::error!("failed to read sector {sn}");
    FsError::Io {
        sector: sn.as_index(),
    }
}
