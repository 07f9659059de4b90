use alloc::{collections::BTreeMap, sync::Arc};

use sectorfs_types::{InodeDisk, SectorNo};

use super::{InodeInner, InodeState};
use crate::FsError;

/// What happened to an inode when a handle was released.
pub(super) enum Released {
    /// Other handles remain.
    StillOpen,
    /// Last handle gone.
    Closed,
    /// Last handle gone and the inode was marked removed; its sectors must
    /// be reclaimed by the caller, which then calls [`InodeTable::forget()`].
    Destroyed,
}

/// Registry of open inodes, one shared instance per inode sector.
///
/// A destroyed inode stays registered until its sectors are reclaimed, so
/// it cannot be opened again while that is in progress.
pub(crate) struct InodeTable(spin::Mutex<BTreeMap<SectorNo, Arc<InodeInner>>>);

impl InodeTable {
    pub(crate) const fn new() -> Self {
        Self(spin::Mutex::new(BTreeMap::new()))
    }

    /// Returns the open inode for `sector`, counting a new opener.
    ///
    /// If the inode is not open yet, it is loaded by `load` with the table
    /// locked, so concurrent openers of one sector always share an instance.
    pub(super) fn open<F>(&self, sector: SectorNo, load: F) -> Result<Arc<InodeInner>, FsError>
    where
        F: FnOnce() -> Result<InodeDisk, FsError>,
    {
        let mut table = self.0.lock();
        if let Some(inner) = table.get(&sector) {
            let mut meta = inner.meta.lock();
            if meta.state == InodeState::Destroyed {
                log::warn!("inode {sector} is being destroyed");
                return Err(FsError::Corrupted { sector });
            }
            meta.open_count += 1;
            return Ok(Arc::clone(inner));
        }

        let inner = Arc::new(InodeInner::new(sector, load()?));
        table.insert(sector, Arc::clone(&inner));
        Ok(inner)
    }

    /// Counts one opener out.
    pub(super) fn release(&self, inner: &InodeInner) -> Released {
        let mut table = self.0.lock();
        let mut meta = inner.meta.lock();
        assert!(meta.open_count > 0);
        meta.open_count -= 1;
        if meta.open_count > 0 {
            return Released::StillOpen;
        }

        match meta.state {
            InodeState::Open => {
                table.remove(&inner.sector);
                Released::Closed
            }
            InodeState::MarkedForRemoval => {
                meta.state = InodeState::Destroyed;
                Released::Destroyed
            }
            InodeState::Destroyed => unreachable!("inode {} destroyed twice", inner.sector),
        }
    }

    /// Unregisters a destroyed inode.
    pub(super) fn forget(&self, sector: SectorNo) {
        let removed = self.0.lock().remove(&sector);
        debug_assert!(removed.is_some_and(|inner| inner.meta.lock().state == InodeState::Destroyed));
    }

    pub(crate) fn len(&self) -> usize {
        self.0.lock().len()
    }
}
