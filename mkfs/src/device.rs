use std::{
    fs::File,
    io::{self, Read as _, Seek as _, SeekFrom, Write as _},
    sync::Mutex,
};

use sectorfs::{BlockDevice, types::SECTOR_SIZE};

/// A disk image file accessed one sector at a time.
pub struct FileDevice {
    file: Mutex<File>,
    sector_count: usize,
}

impl FileDevice {
    /// Creates an image of `sector_count` zeroed sectors, truncating `file`.
    pub fn create(file: File, sector_count: usize) -> io::Result<Self> {
        file.set_len(offset(sector_count))?;
        Ok(Self {
            file: Mutex::new(file),
            sector_count,
        })
    }

    /// Uses an existing image; the sector count is taken from its size.
    pub fn open(file: File) -> io::Result<Self> {
        let len = file.metadata()?.len();
        let sector_count = usize::try_from(len / offset(1)).map_err(io::Error::other)?;
        Ok(Self {
            file: Mutex::new(file),
            sector_count,
        })
    }

    pub fn sector_count(&self) -> usize {
        self.sector_count
    }

    fn check(&self, sector: usize) -> io::Result<()> {
        if sector >= self.sector_count {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("sector {sector} out of range"),
            ));
        }
        Ok(())
    }
}

fn offset(sector: usize) -> u64 {
    u64::try_from(sector * SECTOR_SIZE).unwrap()
}

impl BlockDevice<SECTOR_SIZE> for FileDevice {
    type Error = io::Error;

    fn read(&self, sector: usize, data: &mut [u8; SECTOR_SIZE]) -> Result<(), Self::Error> {
        self.check(sector)?;
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        file.seek(SeekFrom::Start(offset(sector)))?;
        file.read_exact(data).inspect_err(|e| {
            log::error!("read of sector {sector} failed: {e}");
        })
    }

    fn write(&self, sector: usize, data: &[u8; SECTOR_SIZE]) -> Result<(), Self::Error> {
        self.check(sector)?;
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        file.seek(SeekFrom::Start(offset(sector)))?;
        file.write_all(data).inspect_err(|e| {
            log::error!("write of sector {sector} failed: {e}");
        })
    }
}
