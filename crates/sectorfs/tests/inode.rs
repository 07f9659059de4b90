#![cfg(test)]

use std::{
    sync::{Arc, Barrier},
    thread,
};

use sectorfs::{
    FREE_MAP, FsConfig, FsError, InodeState, ROOT_DIR,
    types::{SECTOR_SIZE, index_sectors_for, sectors_for},
};

mod common;

#[test]
fn removal_waits_for_last_close() -> Result<(), anyhow::Error> {
    const LEN: usize = 70_000;
    let (_device, fs) = common::format(1024);
    let before = fs.free_sector_count();
    let sector = fs.create_inode(LEN, false)?;
    let data = common::pattern(LEN, 11);
    fs.open(sector)?.write_at(&data, 0)?;
    let used = before - fs.free_sector_count();
    assert_eq!(used, 1 + sectors_for(LEN) + index_sectors_for(sectors_for(LEN)));

    let opened = Barrier::new(2);
    let removed = Barrier::new(2);
    let first_closed = Barrier::new(2);
    thread::scope(|s| {
        // A: removes the inode, then keeps reading until B has closed
        let a = s.spawn(|| {
            let inode = fs.open(sector).unwrap();
            opened.wait();
            inode.remove().unwrap();
            removed.wait();
            first_closed.wait();
            let mut buf = vec![0; LEN];
            assert_eq!(inode.read_at(&mut buf, 0).unwrap(), LEN);
            buf == data
        });
        // B: holds the removed inode and closes first
        let b = s.spawn(|| {
            let inode = fs.open(sector).unwrap();
            opened.wait();
            removed.wait();
            assert_eq!(inode.state(), InodeState::MarkedForRemoval);
            assert_eq!(inode.open_count(), 2);
            inode.close().unwrap();
            // nothing is released while A's handle is open
            let free = fs.free_sector_count();
            first_closed.wait();
            free
        });
        assert!(a.join().unwrap());
        assert_eq!(b.join().unwrap(), before - used);
    });

    assert_eq!(fs.free_sector_count(), before);
    assert_eq!(fs.open_inode_count(), 0);
    assert!(matches!(fs.open(sector), Err(FsError::Corrupted { .. })));
    Ok(())
}

#[test]
fn removed_inode_stays_usable() -> Result<(), anyhow::Error> {
    let (_device, fs) = common::format(256);
    let before = fs.free_sector_count();
    let inode = fs.open(fs.create_inode(0, false)?)?;
    let other = inode.reopen();
    inode.remove()?;
    assert!(other.is_removed());
    assert_eq!(inode.remove(), Err(FsError::AlreadyRemoved));

    // a removed inode still grows and reads back
    other.write_at(b"still here", 1_000)?;
    let mut buf = [0; 10];
    inode.read_at(&mut buf, 1_000)?;
    assert_eq!(&buf, b"still here");

    // a new opener joins the same instance
    let third = fs.open(inode.sector())?;
    assert_eq!(third.open_count(), 3);
    assert_eq!(third.state(), InodeState::MarkedForRemoval);

    drop(third);
    other.close()?;
    assert!(fs.free_sector_count() < before);
    inode.close()?;
    assert_eq!(fs.free_sector_count(), before);
    Ok(())
}

#[test]
fn dropped_handles_close() -> Result<(), anyhow::Error> {
    let (_device, fs) = common::format(256);
    let before = fs.free_sector_count();
    let sector = fs.create_inode(2_000, false)?;
    {
        let inode = fs.open(sector)?;
        let _again = fs.open(sector)?;
        assert_eq!(fs.open_inode_count(), 1);
        inode.remove()?;
    }
    assert_eq!(fs.open_inode_count(), 0);
    assert_eq!(fs.free_sector_count(), before);
    Ok(())
}

#[test]
fn deny_write() -> Result<(), anyhow::Error> {
    let (_device, fs) = common::format(256);
    let inode = fs.open(fs.create_inode(0, false)?)?;
    let other = inode.reopen();
    inode.write_at(b"code", 0)?;

    inode.deny_write();
    assert_eq!(other.write_at(b"x", 0), Err(FsError::WriteDenied));
    assert_eq!(inode.write_at(b"x", 100), Err(FsError::WriteDenied));
    assert_eq!(inode.length(), 4);

    // reads are unaffected
    let mut buf = [0; 4];
    assert_eq!(other.read_at(&mut buf, 0)?, 4);
    assert_eq!(&buf, b"code");

    // every denier must allow again
    other.deny_write();
    inode.allow_write();
    assert_eq!(inode.write_at(b"x", 0), Err(FsError::WriteDenied));
    other.allow_write();
    assert_eq!(inode.write_at(b"C", 0)?, 1);
    Ok(())
}

#[test]
fn deny_write_is_per_handle() -> Result<(), anyhow::Error> {
    let (_device, fs) = common::format(256);
    let inode = fs.open(fs.create_inode(0, false)?)?;
    let other = inode.reopen();

    // allowing without a denial does nothing
    inode.allow_write();
    assert_eq!(other.write_at(b"x", 0)?, 1);

    // a handle denies at most once
    inode.deny_write();
    inode.deny_write();
    other.deny_write();
    inode.allow_write();
    inode.allow_write();
    assert_eq!(inode.write_at(b"x", 0), Err(FsError::WriteDenied));
    other.allow_write();
    assert_eq!(inode.write_at(b"y", 0)?, 1);
    Ok(())
}

#[test]
fn closing_a_denier_allows_writes() -> Result<(), anyhow::Error> {
    let (_device, fs) = common::format(256);
    let sector = fs.create_inode(0, false)?;
    let writer = fs.open(sector)?;

    let loader = fs.open(sector)?;
    loader.deny_write();
    assert_eq!(writer.write_at(b"x", 0), Err(FsError::WriteDenied));
    loader.close()?;
    assert_eq!(writer.write_at(b"x", 0)?, 1);

    {
        let loader = fs.open(sector)?;
        loader.deny_write();
        assert_eq!(writer.write_at(b"y", 0), Err(FsError::WriteDenied));
    }
    assert_eq!(writer.write_at(b"y", 0)?, 1);

    // the count is balanced, so every open handle may deny again
    let other = writer.reopen();
    writer.deny_write();
    other.deny_write();
    assert_eq!(writer.write_at(b"z", 0), Err(FsError::WriteDenied));
    Ok(())
}

#[test]
fn open_during_reclaim_fails() -> Result<(), anyhow::Error> {
    // past the direct pointers, so reclamation reads the indirect block
    const LEN: usize = 130 * SECTOR_SIZE;
    let config = FsConfig::new(1024);
    let (device, fs) = common::format_with(config);
    let before = fs.free_sector_count();
    let sector = fs.create_inode(LEN, false)?;

    let fs = common::remount(fs, config);
    let inode = fs.open(sector)?;
    inode.remove()?;
    let gate = device.gate_next_read();
    thread::scope(|s| {
        let closer = s.spawn(move || inode.close());
        gate.wait();
        assert_eq!(fs.open_inode_count(), 1);
        assert!(matches!(fs.open(sector), Err(FsError::Corrupted { .. })));
        gate.wait();
        closer.join().unwrap().unwrap();
    });

    assert_eq!(fs.open_inode_count(), 0);
    assert_eq!(fs.free_sector_count(), before);
    assert!(matches!(fs.open(sector), Err(FsError::Corrupted { .. })));
    Ok(())
}

#[test]
fn failed_reclaim_keeps_file() -> Result<(), anyhow::Error> {
    const LEN: usize = 130 * SECTOR_SIZE;
    let config = FsConfig::new(1024);
    let (device, fs) = common::format_with(config);
    let sector = fs.create_inode(LEN, false)?;
    let data = common::pattern(LEN, 5);
    fs.open(sector)?.write_at(&data, 0)?;

    let fs = common::remount(fs, config);
    let free = fs.free_sector_count();
    let inode = fs.open(sector)?;
    inode.remove()?;
    device.fail_from(0);
    assert!(matches!(inode.close(), Err(FsError::Io { .. })));
    device.heal();

    // nothing was released and the inode is intact
    assert_eq!(fs.free_sector_count(), free);
    assert_eq!(fs.open_inode_count(), 0);
    let inode = fs.open(sector)?;
    assert_eq!(inode.state(), InodeState::Open);
    assert_eq!(inode.length(), LEN);
    let mut buf = vec![0; LEN];
    assert_eq!(inode.read_at(&mut buf, 0)?, LEN);
    assert_eq!(buf, data);

    // removing again succeeds
    inode.remove()?;
    inode.close()?;
    assert!(fs.free_sector_count() > free);
    Ok(())
}

#[test]
fn contents_survive_remount() -> Result<(), anyhow::Error> {
    let config = FsConfig::new(2048);
    let (_device, fs) = common::format_with(config);
    let dir = fs.create_inode(0, true)?;
    let file = fs.create_inode(0, false)?;
    let gone = fs.create_inode(5_000, false)?;
    fs.add_parent(dir, file)?;

    let data = common::pattern(300_000, 13);
    fs.open(file)?.write_at(&data, 0)?;
    fs.open(gone)?.remove()?;
    let free = fs.free_sector_count();

    let fs = common::remount(fs, config);
    assert_eq!(fs.free_sector_count(), free);
    assert!(matches!(fs.open(gone), Err(FsError::Corrupted { .. })));

    let inode = fs.open(file)?;
    assert!(!inode.is_dir());
    assert_eq!(inode.parent(), dir);
    assert_eq!(inode.length(), data.len());
    let mut buf = vec![0; data.len()];
    inode.read_at(&mut buf, 0)?;
    assert_eq!(buf, data);

    let dir = fs.open(dir)?;
    assert!(dir.is_dir());
    assert_eq!(dir.parent(), ROOT_DIR);

    // allocation after remount does not hand out used sectors
    let next = fs.create_inode(SECTOR_SIZE, false)?;
    assert_ne!(next, file);
    assert_ne!(next, dir.sector());
    assert_ne!(next, FREE_MAP);
    let head = fs.open(next)?.resolve(0)?.unwrap();
    for off in (0..data.len()).step_by(SECTOR_SIZE) {
        assert_ne!(inode.resolve(off)?, Some(head));
    }
    Ok(())
}

#[test]
fn concurrent_open_and_close() -> Result<(), anyhow::Error> {
    const THREADS: usize = 8;
    let (_device, fs) = common::format(512);
    let sector = fs.create_inode(0, false)?;
    let fs = Arc::new(fs);

    let handles = (0..THREADS)
        .map(|i| {
            let fs = Arc::clone(&fs);
            thread::spawn(move || {
                for _ in 0..100 {
                    let inode = fs.open(sector).unwrap();
                    inode.write_at(&[u8::try_from(i).unwrap()], i).unwrap();
                    inode.close().unwrap();
                }
            })
        })
        .collect::<Vec<_>>();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(fs.open_inode_count(), 0);
    let inode = fs.open(sector)?;
    assert_eq!(inode.length(), THREADS);
    let mut buf = [0xff; THREADS];
    inode.read_at(&mut buf, 0)?;
    for (i, b) in buf.iter().enumerate() {
        assert_eq!(usize::from(*b), i);
    }
    Ok(())
}
