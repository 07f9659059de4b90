use sector_io::SectorCacheError;
use sectorfs_types::SectorNo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FsError {
    #[error("device I/O failed on sector {sector}")]
    Io { sector: usize },
    #[error("sector cache exhausted")]
    CacheExhausted,
    #[error("no free sectors")]
    NoSpace,
    #[error("file too large")]
    FileTooLarge,
    #[error("write denied")]
    WriteDenied,
    #[error("inode already removed")]
    AlreadyRemoved,
    #[error("corrupted sector {sector}")]
    Corrupted { sector: SectorNo },
    #[error("image too small")]
    ImageTooSmall,
}

impl<E> From<SectorCacheError<E>> for FsError {
    fn from(error: SectorCacheError<E>) -> Self {
        match error {
            SectorCacheError::Exhausted => {
                log::warn!("every cache slot is in use");
                Self::CacheExhausted
            }
            SectorCacheError::Device { sector, .. } => {
                log::error!("failed to write back sector {sector}");
                Self::Io { sector }
            }
        }
    }
}
