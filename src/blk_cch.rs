//! Block store: `(dev, block)` -> shared, lockable buffer.
//!
//! Buffers are write-through on release: `put_block` persists a dirty buffer
//! before returning, so an unreferenced buffer is always clean and may be
//! evicted at any time.

use super::*;
use blk_dev::BlockDevice;
use error::{FsError, Result};

use log::{trace, warn};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

/// What a block holds. Metadata blocks are kept over data when evicting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockKind {
    Super,
    InodeMap,
    ZoneMap,
    InodeTable,
    Indirect,
    Directory,
    Data,
}

impl BlockKind {
    fn is_metadata(self) -> bool {
        !matches!(self, BlockKind::Directory | BlockKind::Data)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CachePolicy {
    /// Read the block from the device on a miss.
    Normal,
    /// The caller overwrites the whole block; a miss yields zeroes.
    NoRead,
}

pub struct Buffer {
    dev: u32,
    blockno: u32,
    kind: BlockKind,
    /// has data been read from disk?
    valid: bool,
    dirty: bool,
    data: Box<[u8]>,
}

impl Buffer {
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Mutable access; the caller marks the buffer dirty when done.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn zero(&mut self) {
        self.data.fill(0);
        self.dirty = true;
    }

    pub fn read_u32(&self, offset: usize) -> u32 {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.data[offset..offset + 4]);
        u32::from_le_bytes(raw)
    }

    pub fn write_u32(&mut self, offset: usize, value: u32) {
        self.data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
        self.dirty = true;
    }
}

pub type BufRef = Arc<Mutex<Buffer>>;

pub struct BlockCache {
    capacity: usize,
    devices: RwLock<HashMap<u32, Arc<dyn BlockDevice>>>,
    table: Mutex<HashMap<(u32 /* dev */, u32 /* blockno */), BufRef>>,
}

impl BlockCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            devices: RwLock::new(HashMap::new()),
            table: Mutex::new(HashMap::new()),
        }
    }

    pub fn register_device(&self, dev: u32, device: Arc<dyn BlockDevice>) {
        self.devices.write().insert(dev, device);
    }

    /// Drops every cached block of `dev` without writing anything back.
    pub fn unregister_device(&self, dev: u32) {
        self.invalidate(dev);
        self.devices.write().remove(&dev);
    }

    pub fn device(&self, dev: u32) -> Result<Arc<dyn BlockDevice>> {
        self.devices
            .read()
            .get(&dev)
            .cloned()
            .ok_or(FsError::NotMounted(dev))
    }

    pub fn get_block(
        &self,
        dev: u32,
        blockno: u32,
        kind: BlockKind,
        policy: CachePolicy,
    ) -> Result<BufRef> {
        let device = self.device(dev)?;
        let buf = {
            let mut table = self.table.lock();
            if let Some(buf) = table.get(&(dev, blockno)) {
                buf.clone()
            } else {
                if table.len() >= self.capacity {
                    Self::evict(&mut table, self.capacity);
                }
                let buf = Arc::new(Mutex::new(Buffer {
                    dev,
                    blockno,
                    kind,
                    valid: false,
                    dirty: false,
                    data: vec![0u8; device.block_size()].into_boxed_slice(),
                }));
                table.insert((dev, blockno), buf.clone());
                buf
            }
        };

        let mut guard = buf.lock();
        if !guard.valid {
            match policy {
                CachePolicy::NoRead => guard.valid = true,
                CachePolicy::Normal => {
                    trace!("bread dev {dev} block {blockno} ({kind:?})");
                    if let Err(e) = device.read_block(blockno as usize, &mut guard.data) {
                        drop(guard);
                        self.discard(&buf);
                        return Err(e.into());
                    }
                    guard.valid = true;
                }
            }
        }
        drop(guard);
        Ok(buf)
    }

    /// Releases a buffer obtained from `get_block`, writing it back if dirty.
    pub fn put_block(&self, buf: BufRef) -> Result<()> {
        let mut guard = buf.lock();
        if guard.dirty {
            let device = self.device(guard.dev)?;
            device.write_block(guard.blockno as usize, &guard.data)?;
            guard.dirty = false;
        }
        Ok(())
    }

    /// Writes back every dirty buffer of `dev` and flushes the device.
    pub fn flush(&self, dev: u32) -> Result<()> {
        let bufs: Vec<BufRef> = self
            .table
            .lock()
            .iter()
            .filter(|((d, _), _)| *d == dev)
            .map(|(_, buf)| buf.clone())
            .collect();
        for buf in bufs {
            self.put_block(buf)?;
        }
        self.device(dev)?.flush()?;
        Ok(())
    }

    pub fn invalidate(&self, dev: u32) {
        self.table.lock().retain(|(d, _), _| *d != dev);
    }

    pub fn cached_blocks(&self) -> usize {
        self.table.lock().len()
    }

    fn discard(&self, buf: &BufRef) {
        let mut table = self.table.lock();
        // a buffer someone else holds locked is being loaded or used; leave it
        let key = match buf.try_lock() {
            Some(guard) if !guard.valid => (guard.dev, guard.blockno),
            _ => return,
        };
        if table.get(&key).is_some_and(|b| Arc::ptr_eq(b, buf)) {
            table.remove(&key);
        }
    }

    fn evict(table: &mut HashMap<(u32, u32), BufRef>, capacity: usize) {
        for metadata in [false, true] {
            let victims: Vec<(u32, u32)> = table
                .iter()
                .filter(|(_, buf)| {
                    Arc::strong_count(buf) == 1
                        && buf
                            .try_lock()
                            .is_some_and(|b| !b.dirty && b.kind.is_metadata() == metadata)
                })
                .map(|(key, _)| *key)
                .collect();
            for key in victims {
                if table.len() < capacity {
                    return;
                }
                table.remove(&key);
            }
        }
        if table.len() >= capacity {
            warn!("block cache over capacity: {} buffers in use", table.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blk_dev::MemDisk;

    fn cache_with_disk(capacity: usize) -> (BlockCache, Arc<MemDisk>) {
        let disk = Arc::new(MemDisk::new(1024, 16));
        let cache = BlockCache::new(capacity);
        cache.register_device(0, disk.clone());
        (cache, disk)
    }

    #[test]
    fn dirty_buffer_is_written_on_put() {
        let (cache, disk) = cache_with_disk(8);
        let buf = cache
            .get_block(0, 3, BlockKind::Data, CachePolicy::Normal)
            .unwrap();
        buf.lock().write_u32(8, 0xdead_beef);
        cache.put_block(buf.clone()).unwrap();
        assert!(!buf.lock().is_dirty());

        let mut raw = [0u8; 1024];
        disk.read_block(3, &mut raw).unwrap();
        assert_eq!(&raw[8..12], &0xdead_beef_u32.to_le_bytes());
    }

    #[test]
    fn same_block_shares_one_buffer() {
        let (cache, _disk) = cache_with_disk(8);
        let a = cache
            .get_block(0, 1, BlockKind::Data, CachePolicy::Normal)
            .unwrap();
        let b = cache
            .get_block(0, 1, BlockKind::Data, CachePolicy::Normal)
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn unreferenced_buffers_are_evicted_at_capacity() {
        let (cache, _disk) = cache_with_disk(2);
        for blockno in 0..6 {
            let buf = cache
                .get_block(0, blockno, BlockKind::Data, CachePolicy::Normal)
                .unwrap();
            cache.put_block(buf).unwrap();
        }
        assert!(cache.cached_blocks() <= 2);
    }

    #[test]
    fn failed_read_leaves_nothing_cached() {
        let (cache, disk) = cache_with_disk(8);
        disk.set_fail_reads(true);
        assert!(cache
            .get_block(0, 5, BlockKind::InodeTable, CachePolicy::Normal)
            .is_err());
        assert_eq!(cache.cached_blocks(), 0);
        disk.set_fail_reads(false);
        assert!(cache
            .get_block(0, 5, BlockKind::InodeTable, CachePolicy::Normal)
            .is_ok());
    }

    #[test]
    fn no_read_skips_the_device() {
        let (cache, disk) = cache_with_disk(8);
        disk.set_fail_reads(true);
        let buf = cache
            .get_block(0, 7, BlockKind::Data, CachePolicy::NoRead)
            .unwrap();
        assert!(buf.lock().data().iter().all(|&b| b == 0));
    }

    #[test]
    fn unknown_device_is_not_mounted() {
        let cache = BlockCache::new(4);
        assert!(matches!(
            cache.get_block(9, 0, BlockKind::Super, CachePolicy::Normal),
            Err(FsError::NotMounted(9))
        ));
    }
}
