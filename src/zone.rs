//! File position to zone translation.
//!
//! Block index `i` of a file lives in `zones[i]` for the first seven blocks,
//! then in the single-indirect block, then two levels down the
//! double-indirect block. Triple indirection is not supported.

use super::*;
use blk_cch::{BlockKind, CachePolicy};
use common::*;
use device::Device;
use error::{FsError, Result};
use inode::InodeInner;

use log::trace;

enum Slot {
    Direct(usize),
    Single(usize),
    Double(usize, usize),
}

fn locate(dev: &Device, index: usize) -> Result<Slot> {
    let n = indirect_per_block(dev.geometry().block_size);
    if index < NR_DZONES {
        return Ok(Slot::Direct(index));
    }
    let index = index - NR_DZONES;
    if index < n {
        return Ok(Slot::Single(index));
    }
    let index = index - n;
    if index < n * n {
        return Ok(Slot::Double(index / n, index % n));
    }
    Err(FsError::FileTooBig)
}

fn read_entry(dev: &Device, zone: u32, slot: usize) -> Result<u32> {
    let buf = dev
        .cache()
        .get_block(dev.devno(), zone, BlockKind::Indirect, CachePolicy::Normal)?;
    let value = buf.lock().read_u32(slot * 4);
    dev.cache().put_block(buf)?;
    Ok(value)
}

fn write_entry(dev: &Device, zone: u32, slot: usize, value: u32) -> Result<()> {
    let buf = dev
        .cache()
        .get_block(dev.devno(), zone, BlockKind::Indirect, CachePolicy::Normal)?;
    buf.lock().write_u32(slot * 4, value);
    dev.cache().put_block(buf)
}

/// Allocates and zeroes a zone, returning its number.
pub fn new_zone(dev: &Device, hint: u32, kind: BlockKind) -> Result<u32> {
    let zone = dev.alloc().alloc_zone(hint)?;
    let buf = match dev
        .cache()
        .get_block(dev.devno(), zone, kind, CachePolicy::NoRead)
    {
        Ok(buf) => buf,
        Err(e) => {
            dev.alloc().free_zone(zone)?;
            return Err(e);
        }
    };
    buf.lock().zero();
    dev.cache().put_block(buf)?;
    Ok(zone)
}

/// Zone holding block `index` of the file, `NO_ZONE` for a hole.
pub fn read_map(dev: &Device, inode: &InodeInner, index: usize) -> Result<u32> {
    let zones = &inode.disk().zones;
    match locate(dev, index)? {
        Slot::Direct(i) => Ok(zones[i]),
        Slot::Single(i) => match zones[SINGLE_INDIRECT] {
            NO_ZONE => Ok(NO_ZONE),
            ind => read_entry(dev, ind, i),
        },
        Slot::Double(i, j) => match zones[DOUBLE_INDIRECT] {
            NO_ZONE => Ok(NO_ZONE),
            dbl => match read_entry(dev, dbl, i)? {
                NO_ZONE => Ok(NO_ZONE),
                ind => read_entry(dev, ind, j),
            },
        },
    }
}

/// Points block `index` of the file at `zone`, allocating indirect blocks on
/// the way. The caller marks the inode dirty.
pub fn write_map(dev: &Device, inode: &mut InodeInner, index: usize, zone: u32) -> Result<()> {
    trace!("write_map block {index} -> zone {zone}");
    match locate(dev, index)? {
        Slot::Direct(i) => {
            inode.disk_mut().zones[i] = zone;
            Ok(())
        }
        Slot::Single(i) => {
            let ind = indirect_zone(dev, inode, SINGLE_INDIRECT, zone)?;
            write_entry(dev, ind, i, zone)
        }
        Slot::Double(i, j) => {
            let dbl = indirect_zone(dev, inode, DOUBLE_INDIRECT, zone)?;
            let ind = match read_entry(dev, dbl, i)? {
                NO_ZONE => {
                    let ind = new_zone(dev, zone, BlockKind::Indirect)?;
                    write_entry(dev, dbl, i, ind)?;
                    ind
                }
                ind => ind,
            };
            write_entry(dev, ind, j, zone)
        }
    }
}

fn indirect_zone(dev: &Device, inode: &mut InodeInner, slot: usize, hint: u32) -> Result<u32> {
    match inode.disk().zones[slot] {
        NO_ZONE => {
            let ind = new_zone(dev, hint, BlockKind::Indirect)?;
            inode.disk_mut().zones[slot] = ind;
            Ok(ind)
        }
        ind => Ok(ind),
    }
}

fn free_indirect(dev: &Device, ind: u32, depth: u32) -> Result<()> {
    let n = indirect_per_block(dev.geometry().block_size);
    for slot in 0..n {
        match read_entry(dev, ind, slot)? {
            NO_ZONE => {}
            zone if depth > 1 => free_indirect(dev, zone, depth - 1)?,
            zone => dev.alloc().free_zone(zone)?,
        }
    }
    dev.alloc().free_zone(ind)
}

/// Releases every zone of the file and sets its size to 0. The caller marks
/// the inode dirty.
pub fn truncate(dev: &Device, inode: &mut InodeInner) -> Result<()> {
    let zones = inode.disk().zones;
    for &zone in &zones[..NR_DZONES] {
        if zone != NO_ZONE {
            dev.alloc().free_zone(zone)?;
        }
    }
    if zones[SINGLE_INDIRECT] != NO_ZONE {
        free_indirect(dev, zones[SINGLE_INDIRECT], 1)?;
    }
    if zones[DOUBLE_INDIRECT] != NO_ZONE {
        free_indirect(dev, zones[DOUBLE_INDIRECT], 2)?;
    }
    let disk = inode.disk_mut();
    disk.zones = [NO_ZONE; NR_TZONES];
    disk.size = 0;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitmap::Allocator;
    use blk_cch::BlockCache;
    use blk_dev::MemDisk;
    use inode::InodeCache;
    use super_blk::Geometry;
    use std::sync::Arc;

    fn setup() -> (Arc<Device>, InodeCache) {
        let disk = Arc::new(MemDisk::new(1024, 2048));
        let cache = Arc::new(BlockCache::new(64));
        cache.register_device(0, disk);
        let geo = Arc::new(Geometry::for_device(1024, 2048, 64).unwrap());
        Allocator::format(0, &geo, &cache).unwrap();
        let alloc = Allocator::load(0, geo.clone(), cache.clone()).unwrap();
        let inodes = InodeCache::new(cache.clone(), 8);
        inodes.register_device(0, geo.clone());
        (Arc::new(Device::new(0, geo, cache, alloc)), inodes)
    }

    #[test]
    fn direct_single_and_double_blocks_map_back() {
        let (dev, inodes) = setup();
        let inode = inodes.get_inode(0, 2).unwrap();
        let mut inner = inode.lock();
        let n = indirect_per_block(1024);
        let indexes = [0, NR_DZONES - 1, NR_DZONES, NR_DZONES + n - 1, NR_DZONES + n, NR_DZONES + n + 3 * n + 1];
        let mut expected = Vec::new();
        for &index in &indexes {
            let zone = new_zone(&dev, 0, BlockKind::Data).unwrap();
            write_map(&dev, &mut inner, index, zone).unwrap();
            expected.push(zone);
        }
        for (&index, &zone) in indexes.iter().zip(&expected) {
            assert_eq!(read_map(&dev, &inner, index).unwrap(), zone);
        }
        assert_eq!(read_map(&dev, &inner, 3).unwrap(), NO_ZONE);
        assert_eq!(read_map(&dev, &inner, NR_DZONES + 5).unwrap(), NO_ZONE);
        assert_ne!(inner.disk().zones[SINGLE_INDIRECT], NO_ZONE);
        assert_ne!(inner.disk().zones[DOUBLE_INDIRECT], NO_ZONE);
    }

    #[test]
    fn truncate_frees_data_and_indirect_zones() {
        let (dev, inodes) = setup();
        let inode = inodes.get_inode(0, 2).unwrap();
        let mut inner = inode.lock();
        let n = indirect_per_block(1024);
        for index in [0, 1, NR_DZONES + 2, NR_DZONES + n + 7] {
            let zone = new_zone(&dev, 0, BlockKind::Data).unwrap();
            write_map(&dev, &mut inner, index, zone).unwrap();
        }
        // 4 data + single indirect + double indirect + one second-level block
        assert_eq!(dev.alloc().allocated_zones(), 7);
        inner.disk_mut().size = 4096;
        truncate(&dev, &mut inner).unwrap();
        assert_eq!(dev.alloc().allocated_zones(), 0);
        assert_eq!(inner.disk().size, 0);
        assert!(inner.disk().zones.iter().all(|&z| z == NO_ZONE));
    }

    #[test]
    fn past_double_indirect_is_too_big() {
        let (dev, inodes) = setup();
        let inode = inodes.get_inode(0, 2).unwrap();
        let inner = inode.lock();
        let n = indirect_per_block(1024);
        assert!(matches!(
            read_map(&dev, &inner, NR_DZONES + n + n * n),
            Err(FsError::FileTooBig)
        ));
    }
}
