use std::{fs::File, path::PathBuf};

use anyhow::{Context as _, bail};
use clap::Parser;
use sectorfs::{CacheStats, FileSystem, FsConfig, types::SectorNo};
use sectorfs_params::{CACHE_CAPACITY, DEFAULT_IMAGE_SECTORS};

use self::device::FileDevice;

mod device;

/// Creates a sectorfs disk image holding the given files.
#[derive(Debug, Parser)]
struct Cli {
    /// Path of the image to create
    image: PathBuf,
    /// Files to store in the image
    files: Vec<PathBuf>,
    /// Image size in sectors
    #[arg(short, long, default_value_t = DEFAULT_IMAGE_SECTORS)]
    sectors: usize,
    /// Buffer cache capacity in sectors
    #[arg(short, long, default_value_t = CACHE_CAPACITY)]
    cache: usize,
    /// Mount the image again and compare every stored file
    #[arg(long)]
    verify: bool,
}

struct Stored {
    sector: SectorNo,
    path: PathBuf,
    contents: Vec<u8>,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    if cli.cache == 0 {
        bail!("cache capacity must be at least one sector");
    }
    let config = FsConfig {
        sector_count: cli.sectors,
        cache_capacity: cli.cache,
    };

    let file = File::options()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&cli.image)
        .with_context(|| format!("cannot create {}", cli.image.display()))?;
    let device = FileDevice::create(file, cli.sectors)?;
    let fs = FileSystem::format(device, config)?;

    let mut stored = vec![];
    for path in cli.files {
        let contents =
            std::fs::read(&path).with_context(|| format!("cannot read {}", path.display()))?;
        let sector = fs.create_inode(0, false)?;
        fs.open(sector)?
            .write_at(&contents, 0)
            .with_context(|| format!("cannot store {}", path.display()))?;
        println!("{sector}\t{}\t{}", contents.len(), path.display());
        stored.push(Stored {
            sector,
            path,
            contents,
        });
    }

    let stats = fs.cache_stats();
    let free = fs.free_sector_count();
    let device = fs.shutdown()?;
    report(&stats);
    println!("{free} of {} sectors free", device.sector_count());
    drop(device);

    if cli.verify {
        let file = File::options()
            .read(true)
            .write(true)
            .open(&cli.image)
            .with_context(|| format!("cannot reopen {}", cli.image.display()))?;
        let device = FileDevice::open(file)?;
        if device.sector_count() != cli.sectors {
            bail!(
                "{} has {} sectors, expected {}",
                cli.image.display(),
                device.sector_count(),
                cli.sectors
            );
        }
        verify(device, cli.cache, &stored)?;
    }
    Ok(())
}

fn report(stats: &CacheStats) {
    println!(
        "cache: {} hits, {} misses, {} evictions, {} reads, {} writes",
        stats.hits, stats.misses, stats.evictions, stats.device_reads, stats.device_writes
    );
}

fn verify(device: FileDevice, cache_capacity: usize, stored: &[Stored]) -> anyhow::Result<()> {
    let config = FsConfig {
        sector_count: device.sector_count(),
        cache_capacity,
    };
    let fs = FileSystem::mount(device, config)?;
    for file in stored {
        let inode = fs.open(file.sector)?;
        let mut buf = vec![0; inode.length()];
        let n = inode.read_at(&mut buf, 0)?;
        if n != file.contents.len() || buf != file.contents {
            bail!("{} differs in the image", file.path.display());
        }
        log::debug!("verified {}", file.path.display());
    }
    println!("verified {} files", stored.len());
    Ok(())
}
