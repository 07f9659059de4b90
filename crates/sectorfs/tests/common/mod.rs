#![allow(dead_code)]

use std::sync::{
    Arc, Barrier, Mutex,
    atomic::{AtomicUsize, Ordering},
};

use sectorfs::{BlockDevice, FileSystem, FsConfig, types::SECTOR_SIZE};

/// In-memory device counting reads and writes.
///
/// Accesses to sectors at or above the fault threshold fail.
pub struct MemDevice {
    sectors: Mutex<Vec<[u8; SECTOR_SIZE]>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
    fail_from: AtomicUsize,
    gate: Mutex<Option<Arc<Barrier>>>,
}

#[derive(Debug)]
pub struct DeviceError;

impl MemDevice {
    pub fn new(sector_count: usize) -> Self {
        Self {
            sectors: Mutex::new(vec![[0; SECTOR_SIZE]; sector_count]),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
            fail_from: AtomicUsize::new(usize::MAX),
            gate: Mutex::new(None),
        }
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn sector(&self, i: usize) -> [u8; SECTOR_SIZE] {
        self.sectors.lock().unwrap()[i]
    }

    pub fn fail_from(&self, sector: usize) {
        self.fail_from.store(sector, Ordering::Relaxed);
    }

    pub fn heal(&self) {
        self.fail_from(usize::MAX);
    }

    /// Makes the next read wait twice on the returned barrier: once on
    /// entry and once before it completes.
    pub fn gate_next_read(&self) -> Arc<Barrier> {
        let gate = Arc::new(Barrier::new(2));
        *self.gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    fn check(&self, sector: usize) -> Result<(), DeviceError> {
        if sector >= self.fail_from.load(Ordering::Relaxed) {
            return Err(DeviceError);
        }
        Ok(())
    }
}

impl BlockDevice<SECTOR_SIZE> for MemDevice {
    type Error = DeviceError;

    fn read(&self, sector: usize, data: &mut [u8; SECTOR_SIZE]) -> Result<(), Self::Error> {
        if let Some(gate) = self.gate.lock().unwrap().take() {
            gate.wait();
            gate.wait();
        }
        self.check(sector)?;
        self.reads.fetch_add(1, Ordering::Relaxed);
        *data = self.sectors.lock().unwrap()[sector];
        Ok(())
    }

    fn write(&self, sector: usize, data: &[u8; SECTOR_SIZE]) -> Result<(), Self::Error> {
        self.check(sector)?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.sectors.lock().unwrap()[sector] = *data;
        Ok(())
    }
}

pub type TestFs = FileSystem<Arc<MemDevice>>;

/// Formats a fresh device of `sector_count` sectors.
pub fn format(sector_count: usize) -> (Arc<MemDevice>, TestFs) {
    format_with(FsConfig::new(sector_count))
}

pub fn format_with(config: FsConfig) -> (Arc<MemDevice>, TestFs) {
    let _ = env_logger::builder().is_test(true).try_init();
    let device = Arc::new(MemDevice::new(config.sector_count));
    let fs = FileSystem::format(Arc::clone(&device), config).unwrap();
    (device, fs)
}

/// Shuts `fs` down and mounts it again with an empty cache.
pub fn remount(fs: TestFs, config: FsConfig) -> TestFs {
    let device = fs.shutdown().unwrap();
    FileSystem::mount(device, config).unwrap()
}

/// Returns `len` bytes of a recognizable pattern.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| {
            let i = u8::try_from(i % 251).unwrap();
            i.wrapping_mul(31).wrapping_add(seed)
        })
        .collect()
}
