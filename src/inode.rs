//! In-memory inode table.
//!
//! A fixed number of slots, each naming at most one `(dev, inum)`. A slot is
//! claimed under the table lock, but the disk read happens under the inode's
//! own lock, so a slow load only stalls callers waiting for that same inode.
//!
//! Dropping the last reference pins the slot while the inode is checked and,
//! if no entry names it, freed. Lookups of that identity wait for the slot to
//! settle, so nobody picks up an inode that is going away.

use super::*;
use blk_cch::{BlockCache, BlockKind, CachePolicy};
use common::*;
use device::Device;
use error::{FsError, Result};
use super_blk::Geometry;

use log::{debug, trace, warn};
use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// inode on disk
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskInode {
    /// File type and permission bits
    pub mode: u16,
    /// Number of hard links to inode in file system
    pub nlinks: u16,
    pub uid: u16,
    pub gid: u16,
    /// Size of file (bytes)
    pub size: u32,
    pub atime: u32,
    pub mtime: u32,
    pub ctime: u32,
    /// Zone numbers: direct, single, double and triple indirect
    pub zones: [u32; NR_TZONES],
}

impl DiskInode {
    pub fn new(mode: u16) -> Self {
        let now = now();
        Self {
            mode,
            nlinks: 1,
            atime: now,
            mtime: now,
            ctime: now,
            ..Default::default()
        }
    }

    pub fn decode(raw: &[u8], block: u32) -> Result<Self> {
        bincode::deserialize(&raw[..INODE_SIZE]).map_err(|e| FsError::Corruption {
            block,
            detail: format!("inode record: {e}"),
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| FsError::Format(format!("inode record: {e}")))
    }

    pub fn is_dir(&self) -> bool {
        self.mode & I_TYPE == I_DIRECTORY
    }
}

/// Mutable part of a cached inode, behind the inode's own lock.
pub struct InodeInner {
    /// inode has been read from disk?
    valid: bool,
    /// copy of disk inode
    disk: DiskInode,
    /// something is mounted on this inode
    mounted: bool,
}

impl InodeInner {
    pub fn disk(&self) -> &DiskInode {
        &self.disk
    }

    /// Caller marks the inode dirty after changing it.
    pub fn disk_mut(&mut self) -> &mut DiskInode {
        &mut self.disk
    }

    pub fn set_mounted(&mut self, mounted: bool) {
        self.mounted = mounted;
    }
}

/// inode in memory
pub struct Inode {
    dev: u32,
    /// Inode number
    inum: u32,
    dirty: AtomicBool,
    inner: Mutex<InodeInner>,
}

impl Inode {
    fn new(dev: u32, inum: u32) -> Self {
        Self {
            dev,
            inum,
            dirty: AtomicBool::new(false),
            inner: Mutex::new(InodeInner {
                valid: false,
                disk: DiskInode::default(),
                mounted: false,
            }),
        }
    }

    pub fn dev(&self) -> u32 {
        self.dev
    }

    pub fn inum(&self) -> u32 {
        self.inum
    }

    pub fn lock(&self) -> MutexGuard<'_, InodeInner> {
        self.inner.lock()
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn is_dir(&self) -> bool {
        self.lock().disk.is_dir()
    }

    pub fn nlinks(&self) -> u16 {
        self.lock().disk.nlinks
    }

    pub fn size(&self) -> u32 {
        self.lock().disk.size
    }

    pub fn is_mounted(&self) -> bool {
        self.lock().mounted
    }
}

#[derive(Default)]
struct Slot {
    count: u32,
    /// None for a slot that has never been claimed or whose load failed
    inode: Option<Arc<Inode>>,
    /// last reference is being dropped
    closing: bool,
}

impl Slot {
    fn holds(&self, dev: u32, inum: u32) -> bool {
        self.inode
            .as_ref()
            .is_some_and(|i| i.dev == dev && i.inum == inum)
    }

    fn reusable(&self) -> bool {
        self.count == 0 && !self.closing && self.inode.as_ref().map_or(true, |i| !i.is_dirty())
    }
}

pub struct InodeCache {
    cache: Arc<BlockCache>,
    devices: RwLock<HashMap<u32, Arc<Geometry>>>,
    slots: Mutex<Vec<Slot>>,
    /// signalled when a closing slot settles
    settled: Condvar,
}

impl InodeCache {
    pub fn new(cache: Arc<BlockCache>, nr_inodes: usize) -> Self {
        let slots = (0..nr_inodes).map(|_| Slot::default()).collect();
        Self {
            cache,
            devices: RwLock::new(HashMap::new()),
            slots: Mutex::new(slots),
            settled: Condvar::new(),
        }
    }

    pub fn register_device(&self, dev: u32, geo: Arc<Geometry>) {
        self.devices.write().insert(dev, geo);
    }

    /// Forgets every cached inode of `dev`. Dirty content is dropped, so flush first.
    pub fn unregister_device(&self, dev: u32) {
        self.devices.write().remove(&dev);
        for slot in self.slots.lock().iter_mut() {
            if slot.inode.as_ref().is_some_and(|i| i.dev == dev) {
                if slot.count > 0 {
                    warn!("dev {dev}: dropping inode slot with {} references", slot.count);
                }
                *slot = Slot::default();
            }
        }
        self.settled.notify_all();
    }

    fn geometry(&self, dev: u32) -> Result<Arc<Geometry>> {
        self.devices
            .read()
            .get(&dev)
            .cloned()
            .ok_or(FsError::NotMounted(dev))
    }

    /// Returns the cached inode, loading it from disk on first reference.
    pub fn get_inode(&self, dev: u32, inum: u32) -> Result<Arc<Inode>> {
        let geo = self.geometry(dev)?;
        if inum == 0 || inum > geo.ninodes {
            return Err(FsError::BadInode { dev, inum });
        }

        let inode = self.claim(dev, inum)?;

        let mut inner = inode.inner.lock();
        if !inner.valid {
            match self.read_disk_inode(&geo, dev, inum) {
                Ok(disk) => {
                    inner.disk = disk;
                    inner.valid = true;
                }
                Err(e) => {
                    drop(inner);
                    self.release_claim(&inode);
                    return Err(e);
                }
            }
        }
        drop(inner);
        Ok(inode)
    }

    fn claim(&self, dev: u32, inum: u32) -> Result<Arc<Inode>> {
        let mut slots = self.slots.lock();
        while slots.iter().any(|s| s.closing && s.holds(dev, inum)) {
            self.settled.wait(&mut slots);
        }
        if let Some(slot) = slots.iter_mut().find(|s| s.holds(dev, inum)) {
            if let Some(inode) = slot.inode.clone() {
                slot.count += 1;
                trace!("iget dev {dev} inode {inum}: hit, count {}", slot.count);
                return Ok(inode);
            }
        }
        // never-used slots first, then clean unreferenced ones
        let free = slots
            .iter()
            .position(|s| s.inode.is_none())
            .or_else(|| slots.iter().position(Slot::reusable));
        let Some(idx) = free else {
            warn!("inode table full claiming dev {dev} inode {inum}");
            return Err(FsError::TooManyOpen);
        };
        let inode = Arc::new(Inode::new(dev, inum));
        slots[idx] = Slot {
            count: 1,
            inode: Some(inode.clone()),
            closing: false,
        };
        trace!("iget dev {dev} inode {inum}: claimed slot {idx}");
        Ok(inode)
    }

    /// Undoes a claim whose load failed.
    fn release_claim(&self, inode: &Arc<Inode>) {
        let mut slots = self.slots.lock();
        if let Some(slot) = Self::slot_of(&mut slots, inode) {
            slot.count -= 1;
            if slot.count == 0 {
                slot.inode = None;
            }
        }
    }

    fn slot_of<'a>(slots: &'a mut [Slot], inode: &Arc<Inode>) -> Option<&'a mut Slot> {
        slots
            .iter_mut()
            .find(|s| s.inode.as_ref().is_some_and(|i| Arc::ptr_eq(i, inode)))
    }

    fn read_disk_inode(&self, geo: &Geometry, dev: u32, inum: u32) -> Result<DiskInode> {
        let (block, offset) = geo.inode_location(inum);
        let buf = self
            .cache
            .get_block(dev, block, BlockKind::InodeTable, CachePolicy::Normal)?;
        let disk = DiskInode::decode(&buf.lock().data()[offset..], block);
        self.cache.put_block(buf)?;
        disk
    }

    /// Drops one reference. The slot keeps its content until it is reused.
    pub fn put_inode(&self, inode: Arc<Inode>) {
        let mut slots = self.slots.lock();
        match Self::slot_of(&mut slots, &inode) {
            Some(slot) if slot.count > 0 => {
                slot.count -= 1;
                trace!(
                    "iput dev {} inode {}: count {}",
                    inode.dev,
                    inode.inum,
                    slot.count
                );
            }
            _ => panic!(
                "putting unreferenced inode {} on device {}",
                inode.inum, inode.dev
            ),
        }
    }

    /// Drops a reference like `put_inode`, but when it is the last one and
    /// no directory entry names the inode any more, its zones and its
    /// inode number go back to `device`'s allocator first.
    pub fn release(&self, device: &Device, inode: Arc<Inode>) -> Result<()> {
        {
            let mut slots = self.slots.lock();
            match Self::slot_of(&mut slots, &inode) {
                Some(slot) if slot.count > 1 => {
                    slot.count -= 1;
                    trace!(
                        "iput dev {} inode {}: count {}",
                        inode.dev,
                        inode.inum,
                        slot.count
                    );
                    return Ok(());
                }
                Some(slot) if slot.count == 1 && !slot.closing => slot.closing = true,
                _ => panic!(
                    "releasing unreferenced inode {} on device {}",
                    inode.inum, inode.dev
                ),
            }
        }

        // ours is the only reference and no new one can be taken
        let result = if inode.nlinks() == 0 {
            self.reclaim(device, &inode).map(|()| true)
        } else {
            Ok(false)
        };
        let freed = matches!(result, Ok(true));
        {
            let mut slots = self.slots.lock();
            if let Some(slot) = Self::slot_of(&mut slots, &inode) {
                slot.count = 0;
                slot.closing = false;
                if freed {
                    slot.inode = None;
                }
            }
            trace!("iput dev {} inode {}: last", inode.dev, inode.inum);
        }
        self.settled.notify_all();
        if freed {
            // no slot names the inode any more; the number may go out again
            device.alloc().free_inode(inode.inum)?;
        }
        result.map(|_| ())
    }

    /// Gives the zones back and writes the cleared record. The inode number
    /// stays allocated until the caller lets go of the slot.
    fn reclaim(&self, device: &Device, inode: &Inode) -> Result<()> {
        debug!("dev {}: reclaiming inode {}", inode.dev, inode.inum);
        {
            let mut inner = inode.lock();
            zone::truncate(device, &mut inner)?;
            inner.disk_mut().mode = 0;
        }
        inode.mark_dirty();
        self.flush_inode(inode)
    }

    /// Takes one more reference to an inode already held.
    pub fn dup_inode(&self, inode: &Arc<Inode>) -> Arc<Inode> {
        let mut slots = self.slots.lock();
        match Self::slot_of(&mut slots, inode) {
            Some(slot) if slot.count > 0 => slot.count += 1,
            _ => panic!("dup of unreferenced inode {}", inode.inum),
        }
        inode.clone()
    }

    pub fn ref_count(&self, inode: &Arc<Inode>) -> u32 {
        let mut slots = self.slots.lock();
        Self::slot_of(&mut slots, inode).map_or(0, |s| s.count)
    }

    /// Writes the inode back if it is dirty.
    pub fn flush_inode(&self, inode: &Inode) -> Result<()> {
        if !inode.is_dirty() {
            return Ok(());
        }
        let geo = self.geometry(inode.dev)?;
        let (block, offset) = geo.inode_location(inode.inum);
        let inner = inode.inner.lock();
        let raw = inner.disk.encode()?;
        let buf = self
            .cache
            .get_block(inode.dev, block, BlockKind::InodeTable, CachePolicy::Normal)?;
        {
            let mut guard = buf.lock();
            guard.data_mut()[offset..offset + INODE_SIZE].copy_from_slice(&raw);
            guard.mark_dirty();
        }
        self.cache.put_block(buf)?;
        inode.dirty.store(false, Ordering::Release);
        trace!("iupdate dev {} inode {}", inode.dev, inode.inum);
        Ok(())
    }

    pub fn flush_device(&self, dev: u32) -> Result<()> {
        let dirty: Vec<Arc<Inode>> = self
            .slots
            .lock()
            .iter()
            .filter_map(|s| s.inode.clone())
            .filter(|i| i.dev == dev && i.is_dirty())
            .collect();
        debug!("dev {dev}: flushing {} dirty inodes", dirty.len());
        for inode in dirty {
            self.flush_inode(&inode)?;
        }
        Ok(())
    }

    /// More references on `dev` than the one held by its mount.
    pub fn is_device_busy(&self, dev: u32) -> bool {
        let total: u32 = self
            .slots
            .lock()
            .iter()
            .filter(|s| s.inode.as_ref().is_some_and(|i| i.dev == dev))
            .map(|s| s.count)
            .sum();
        total > 1
    }

    /// Slots currently holding a reference, for diagnostics.
    pub fn in_use(&self) -> usize {
        self.slots.lock().iter().filter(|s| s.count > 0).count()
    }
}
