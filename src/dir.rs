//! Directories: name lookup and mutation on one directory inode.
//!
//! Lookups run side by side. A mutation first announces itself, which holds
//! back any lookup arriving after it, then waits for the lookups already in
//! flight to finish and runs alone. `lock` hands a caller the same exclusive
//! access for a sequence of operations.

use super::*;
use blk_cch::{BlockKind, CachePolicy};
use common::*;
use device::Device;
use error::{FsError, Result};
use inode::{Inode, InodeCache, InodeInner};

use log::{debug, trace, warn};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

/// One fixed-size directory record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    /// inode number, 0 for a free record
    inum: u32,
    name: [u8; DIRSIZ],
}

impl DirEntry {
    pub fn new(name: &[u8], inum: u32) -> Result<Self> {
        validate_name(name)?;
        let mut field = [0u8; DIRSIZ];
        field[..name.len()].copy_from_slice(name);
        Ok(Self { inum, name: field })
    }

    pub fn empty() -> Self {
        Self {
            inum: 0,
            name: [0u8; DIRSIZ],
        }
    }

    pub fn decode(raw: &[u8]) -> Self {
        let mut inum = [0u8; 4];
        inum.copy_from_slice(&raw[..4]);
        let mut name = [0u8; DIRSIZ];
        name.copy_from_slice(&raw[4..DIRENT_SIZE]);
        Self {
            inum: u32::from_le_bytes(inum),
            name,
        }
    }

    pub fn encode_into(&self, raw: &mut [u8]) {
        raw[..4].copy_from_slice(&self.inum.to_le_bytes());
        raw[4..DIRENT_SIZE].copy_from_slice(&self.name);
    }

    pub fn inum(&self) -> u32 {
        self.inum
    }

    pub fn is_free(&self) -> bool {
        self.inum == 0
    }

    /// name bytes up to the first NUL
    pub fn name(&self) -> &[u8] {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(DIRSIZ);
        &self.name[..len]
    }

    fn is_dot(&self) -> bool {
        matches!(self.name(), b"." | b"..")
    }
}

fn validate_name(name: &[u8]) -> Result<()> {
    if name.len() > DIRSIZ {
        return Err(FsError::NameTooLong(name.len()));
    }
    if name.is_empty() || name.iter().any(|&b| b == 0 || b == b'/') {
        return Err(FsError::InvalidName);
    }
    Ok(())
}

#[derive(Default)]
struct Gate {
    /// lookups in flight
    readers: usize,
    /// mutations announced but not yet running
    writers_waiting: usize,
    writing: bool,
    /// token of the outstanding `DirLock`
    holder: Option<u64>,
    next_token: u64,
}

struct ReadTicket<'a>(&'a Directory);

impl Drop for ReadTicket<'_> {
    fn drop(&mut self) {
        let mut gate = self.0.gate.lock();
        gate.readers -= 1;
        if gate.readers == 0 {
            self.0.wake.notify_all();
        }
    }
}

struct WriteTicket<'a>(&'a Directory);

impl Drop for WriteTicket<'_> {
    fn drop(&mut self) {
        self.0.gate.lock().writing = false;
        self.0.wake.notify_all();
    }
}

pub struct Directory {
    device: Arc<Device>,
    inodes: Arc<InodeCache>,
    /// the reference this directory holds on its inode
    inode: Arc<Inode>,
    gate: Mutex<Gate>,
    wake: Condvar,
}

impl Directory {
    /// Takes over the caller's reference on `inode`, which must be a directory.
    /// Outside the crate directories come from `FileSystem::open_dir`, which
    /// keeps one instance per inode.
    pub(crate) fn open(
        device: Arc<Device>,
        inodes: Arc<InodeCache>,
        inode: Arc<Inode>,
    ) -> Result<Self> {
        if !inode.is_dir() {
            inodes.put_inode(inode);
            return Err(FsError::NotDirectory);
        }
        trace!("open dir {}:{}", inode.dev(), inode.inum());
        Ok(Self {
            device,
            inodes,
            inode,
            gate: Mutex::new(Gate::default()),
            wake: Condvar::new(),
        })
    }

    pub fn dev(&self) -> u32 {
        self.inode.dev()
    }

    pub fn inum(&self) -> u32 {
        self.inode.inum()
    }

    pub fn inode(&self) -> &Arc<Inode> {
        &self.inode
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Directory size in bytes.
    pub fn size(&self) -> u32 {
        self.inode.size()
    }

    fn begin_read(&self) -> ReadTicket<'_> {
        let mut gate = self.gate.lock();
        while gate.writing || gate.writers_waiting > 0 || gate.holder.is_some() {
            self.wake.wait(&mut gate);
        }
        gate.readers += 1;
        ReadTicket(self)
    }

    fn begin_write(&self) -> WriteTicket<'_> {
        let mut gate = self.gate.lock();
        gate.writers_waiting += 1;
        while gate.writing || gate.readers > 0 || gate.holder.is_some() {
            self.wake.wait(&mut gate);
        }
        gate.writers_waiting -= 1;
        gate.writing = true;
        WriteTicket(self)
    }

    /// `(dev, inum)` of `name`, or None.
    pub fn lookup(&self, name: &str) -> Result<Option<(u32, u32)>> {
        let _ticket = self.begin_read();
        self.do_lookup(name.as_bytes())
    }

    /// Looks `name` up and returns its inode with a reference taken.
    pub fn lookup_get(&self, name: &str) -> Result<Arc<Inode>> {
        let _ticket = self.begin_read();
        self.do_lookup_get(name)
    }

    pub fn is_empty(&self) -> Result<bool> {
        let _ticket = self.begin_read();
        self.do_is_empty()
    }

    /// Occupied records in on-disk order.
    pub fn entries(&self) -> Result<Vec<(String, u32)>> {
        let _ticket = self.begin_read();
        self.do_entries()
    }

    pub fn link(&self, name: &str, inum: u32) -> Result<()> {
        let _ticket = self.begin_write();
        self.do_link(name.as_bytes(), inum)
    }

    pub fn unlink(&self, name: &str) -> Result<()> {
        let _ticket = self.begin_write();
        self.do_unlink(name.as_bytes())
    }

    /// Exclusive access to this directory until the returned lock is
    /// unlocked or dropped. Fails at once if a lock is already outstanding.
    pub fn lock(&self) -> Result<DirLock<'_>> {
        let mut gate = self.gate.lock();
        if gate.holder.is_some() {
            warn!("dir {}:{}: lock while locked", self.dev(), self.inum());
            return Err(FsError::LockProtocol("directory already locked"));
        }
        gate.next_token += 1;
        let token = gate.next_token;
        gate.holder = Some(token);
        while gate.readers > 0 || gate.writing {
            self.wake.wait(&mut gate);
        }
        debug!("dir {}:{}: locked", self.dev(), self.inum());
        Ok(DirLock {
            dir: self,
            token,
            released: false,
        })
    }

    pub fn unlock(&self, lock: DirLock<'_>) -> Result<()> {
        if !std::ptr::eq(lock.dir, self) {
            warn!("dir {}:{}: unlock with a foreign lock", self.dev(), self.inum());
            return Err(FsError::LockProtocol("lock not held on this directory"));
        }
        lock.release()
    }

    fn release(&self, token: u64) -> Result<()> {
        let mut gate = self.gate.lock();
        if gate.holder != Some(token) {
            warn!("dir {}:{}: unlock without lock", self.dev(), self.inum());
            return Err(FsError::LockProtocol("directory not locked"));
        }
        gate.holder = None;
        self.wake.notify_all();
        debug!("dir {}:{}: unlocked", self.dev(), self.inum());
        Ok(())
    }

    /// Walks the occupied part of the directory, stopping at the first
    /// record for which `f` returns Some. Unmapped blocks are skipped.
    fn scan<T>(&self, mut f: impl FnMut(usize, &DirEntry) -> Option<T>) -> Result<Option<T>> {
        let per_block = self.device.geometry().dirents_per_block();
        let count = self.inode.size() as usize / DIRENT_SIZE;
        for block_idx in 0..count.div_ceil(per_block) {
            let zone = {
                let inner = self.inode.lock();
                zone::read_map(&self.device, &inner, block_idx)?
            };
            if zone == NO_ZONE {
                continue;
            }
            let buf = self.device.cache().get_block(
                self.dev(),
                zone,
                BlockKind::Directory,
                CachePolicy::Normal,
            )?;
            let first = block_idx * per_block;
            let found = {
                let guard = buf.lock();
                (first..count.min(first + per_block)).find_map(|pos| {
                    let offset = (pos - first) * DIRENT_SIZE;
                    f(pos, &DirEntry::decode(&guard.data()[offset..]))
                })
            };
            self.device.cache().put_block(buf)?;
            if found.is_some() {
                return Ok(found);
            }
        }
        Ok(None)
    }

    fn find(&self, name: &[u8]) -> Result<Option<(usize, u32)>> {
        if name.len() > DIRSIZ {
            return Ok(None);
        }
        self.scan(|pos, e| (!e.is_free() && e.name() == name).then_some((pos, e.inum())))
    }

    /// Writes `entry` at record `pos`, whose block must already be mapped.
    fn store(&self, inner: &InodeInner, pos: usize, entry: &DirEntry) -> Result<()> {
        let per_block = self.device.geometry().dirents_per_block();
        let zone = zone::read_map(&self.device, inner, pos / per_block)?;
        if zone == NO_ZONE {
            return Err(FsError::Corruption {
                block: 0,
                detail: format!("dir {}: record {pos} in unmapped block", self.inum()),
            });
        }
        let buf = self.device.cache().get_block(
            self.dev(),
            zone,
            BlockKind::Directory,
            CachePolicy::Normal,
        )?;
        {
            let mut guard = buf.lock();
            let offset = (pos % per_block) * DIRENT_SIZE;
            entry.encode_into(&mut guard.data_mut()[offset..offset + DIRENT_SIZE]);
            guard.mark_dirty();
        }
        self.device.cache().put_block(buf)
    }

    fn touch(&self, inner: &mut InodeInner) {
        let now = now();
        let disk = inner.disk_mut();
        disk.mtime = now;
        disk.ctime = now;
    }

    fn do_lookup(&self, name: &[u8]) -> Result<Option<(u32, u32)>> {
        Ok(self.find(name)?.map(|(_, inum)| (self.dev(), inum)))
    }

    fn do_lookup_get(&self, name: &str) -> Result<Arc<Inode>> {
        match self.do_lookup(name.as_bytes())? {
            Some((dev, inum)) => self.inodes.get_inode(dev, inum),
            None => Err(FsError::NotFound(name.to_owned())),
        }
    }

    fn do_is_empty(&self) -> Result<bool> {
        let other = self.scan(|_, e| (!e.is_free() && !e.is_dot()).then_some(()))?;
        Ok(other.is_none())
    }

    fn do_entries(&self) -> Result<Vec<(String, u32)>> {
        let mut out = Vec::new();
        self.scan(|_, e| {
            if !e.is_free() {
                out.push((String::from_utf8_lossy(e.name()).into_owned(), e.inum()));
            }
            None::<()>
        })?;
        Ok(out)
    }

    fn do_link(&self, name: &[u8], inum: u32) -> Result<()> {
        let entry = DirEntry::new(name, inum)?;
        // removed but still open
        if self.inode.nlinks() == 0 {
            return Err(FsError::NotFound(format!("directory {}", self.inum())));
        }
        let mut free = None;
        let clash = self.scan(|pos, e| {
            if e.is_free() {
                free.get_or_insert(pos);
                None
            } else {
                (e.name() == name).then_some(())
            }
        })?;
        if clash.is_some() {
            return Err(FsError::Exists);
        }

        let per_block = self.device.geometry().dirents_per_block();
        let mut inner = self.inode.lock();
        let size = inner.disk().size as usize;
        let pos = free.unwrap_or(size / DIRENT_SIZE);
        let block_idx = pos / per_block;
        if zone::read_map(&self.device, &inner, block_idx)? == NO_ZONE {
            let hint = match block_idx {
                0 => 0,
                _ => zone::read_map(&self.device, &inner, block_idx - 1)?,
            };
            let new = zone::new_zone(&self.device, hint, BlockKind::Directory)?;
            if let Err(e) = zone::write_map(&self.device, &mut inner, block_idx, new) {
                self.device.alloc().free_zone(new)?;
                return Err(e);
            }
            debug!("dir {}: grew to block {block_idx} (zone {new})", self.inum());
        }
        self.store(&inner, pos, &entry)?;
        let end = (pos + 1) * DIRENT_SIZE;
        if end > size {
            inner.disk_mut().size = end as u32;
        }
        self.touch(&mut inner);
        drop(inner);
        self.inode.mark_dirty();
        trace!("dir {}: link {:?} -> {inum} at {pos}", self.inum(), String::from_utf8_lossy(name));
        Ok(())
    }

    fn do_unlink(&self, name: &[u8]) -> Result<()> {
        let Some((pos, inum)) = self.find(name)? else {
            return Err(FsError::NotFound(String::from_utf8_lossy(name).into_owned()));
        };
        let mut inner = self.inode.lock();
        self.store(&inner, pos, &DirEntry::empty())?;
        self.touch(&mut inner);
        drop(inner);
        self.inode.mark_dirty();
        trace!("dir {}: unlink {:?} ({inum}) at {pos}", self.inum(), String::from_utf8_lossy(name));
        Ok(())
    }
}

impl Drop for Directory {
    fn drop(&mut self) {
        if let Err(e) = self.inodes.flush_inode(&self.inode) {
            warn!("dir {}:{}: flush on close: {e}", self.dev(), self.inum());
        }
        if let Err(e) = self.inodes.release(&self.device, self.inode.clone()) {
            warn!("dir {}:{}: release on close: {e}", self.dev(), self.inum());
        }
        trace!("close dir {}:{}", self.dev(), self.inum());
    }
}

/// Exclusive hold on one directory. Operations through it bypass the
/// lookup/mutation gate; dropping it unlocks.
#[must_use]
pub struct DirLock<'a> {
    dir: &'a Directory,
    token: u64,
    released: bool,
}

impl DirLock<'_> {
    pub fn directory(&self) -> &Directory {
        self.dir
    }

    pub fn lookup(&self, name: &str) -> Result<Option<(u32, u32)>> {
        self.dir.do_lookup(name.as_bytes())
    }

    pub fn lookup_get(&self, name: &str) -> Result<Arc<Inode>> {
        self.dir.do_lookup_get(name)
    }

    pub fn is_empty(&self) -> Result<bool> {
        self.dir.do_is_empty()
    }

    pub fn entries(&self) -> Result<Vec<(String, u32)>> {
        self.dir.do_entries()
    }

    pub fn link(&mut self, name: &str, inum: u32) -> Result<()> {
        self.dir.do_link(name.as_bytes(), inum)
    }

    pub fn unlink(&mut self, name: &str) -> Result<()> {
        self.dir.do_unlink(name.as_bytes())
    }

    fn release(mut self) -> Result<()> {
        self.released = true;
        self.dir.release(self.token)
    }
}

impl Drop for DirLock<'_> {
    fn drop(&mut self) {
        if !self.released {
            let _ = self.dir.release(self.token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitmap::Allocator;
    use blk_cch::BlockCache;
    use blk_dev::MemDisk;
    use inode::DiskInode;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;
    use super_blk::Geometry;

    struct Fixture {
        device: Arc<Device>,
        inodes: Arc<InodeCache>,
    }

    fn fixture() -> Fixture {
        let _ = env_logger::builder().is_test(true).try_init();
        let disk = Arc::new(MemDisk::new(1024, 512));
        let cache = Arc::new(BlockCache::new(64));
        cache.register_device(0, disk);
        let geo = Arc::new(Geometry::for_device(1024, 512, 64).unwrap());
        Allocator::format(0, &geo, &cache).unwrap();
        let alloc = Allocator::load(0, geo.clone(), cache.clone()).unwrap();
        let inodes = Arc::new(InodeCache::new(cache.clone(), 16));
        inodes.register_device(0, geo.clone());
        Fixture {
            device: Arc::new(Device::new(0, geo, cache, alloc)),
            inodes,
        }
    }

    /// A directory holding "." and ".." and nothing else.
    fn new_dir(f: &Fixture) -> Directory {
        let inum = f.device.alloc().alloc_inode().unwrap();
        let inode = f.inodes.get_inode(0, inum).unwrap();
        {
            let mut inner = inode.lock();
            *inner.disk_mut() = DiskInode::new(I_DIRECTORY | 0o755);
        }
        inode.mark_dirty();
        let dir = Directory::open(f.device.clone(), f.inodes.clone(), inode).unwrap();
        dir.link(".", inum).unwrap();
        dir.link("..", inum).unwrap();
        dir
    }

    #[test]
    fn entry_name_stops_at_nul() {
        let e = DirEntry::new(b"abc", 9).unwrap();
        let mut raw = [0xffu8; DIRENT_SIZE];
        e.encode_into(&mut raw);
        let back = DirEntry::decode(&raw);
        assert_eq!(back.name(), b"abc");
        assert_eq!(back.inum(), 9);
        let full = DirEntry::new(&[b'x'; DIRSIZ], 3).unwrap();
        assert_eq!(full.name().len(), DIRSIZ);
    }

    #[test]
    fn link_lookup_unlink() {
        let f = fixture();
        let dir = new_dir(&f);
        dir.link("foo", 5).unwrap();
        assert_eq!(dir.lookup("foo").unwrap(), Some((0, 5)));
        dir.unlink("foo").unwrap();
        assert_eq!(dir.lookup("foo").unwrap(), None);
        assert!(matches!(dir.unlink("foo"), Err(FsError::NotFound(_))));
    }

    #[test]
    fn prefix_is_not_a_match() {
        let f = fixture();
        let dir = new_dir(&f);
        dir.link("foobar", 5).unwrap();
        assert_eq!(dir.lookup("foo").unwrap(), None);
        assert_eq!(dir.lookup("foobarbaz").unwrap(), None);
    }

    #[test]
    fn freed_record_is_reused() {
        let f = fixture();
        let dir = new_dir(&f);
        dir.link("foo", 5).unwrap();
        let size = dir.size();
        let zones = f.device.alloc().allocated_zones();
        dir.unlink("foo").unwrap();
        dir.link("bar", 7).unwrap();
        assert_eq!(dir.size(), size);
        assert_eq!(f.device.alloc().allocated_zones(), zones);
        assert_eq!(dir.entries().unwrap()[2], ("bar".to_owned(), 7));
    }

    #[test]
    fn directory_grows_by_a_zone_when_full() {
        let f = fixture();
        let dir = new_dir(&f);
        let per_block = f.device.geometry().dirents_per_block();
        let before = f.device.alloc().allocated_zones();
        for i in 0..per_block - 2 {
            dir.link(&format!("f{i}"), 10 + i as u32).unwrap();
        }
        assert_eq!(f.device.alloc().allocated_zones(), before);
        dir.link("spill", 99).unwrap();
        assert_eq!(f.device.alloc().allocated_zones(), before + 1);
        assert_eq!(dir.size() as usize, (per_block + 1) * DIRENT_SIZE);
        assert_eq!(dir.lookup("spill").unwrap(), Some((0, 99)));
        assert_eq!(dir.lookup("f0").unwrap(), Some((0, 10)));
    }

    #[test]
    fn emptiness() {
        let f = fixture();
        let dir = new_dir(&f);
        assert!(dir.is_empty().unwrap());
        dir.link("x", 4).unwrap();
        assert!(!dir.is_empty().unwrap());
        dir.unlink("x").unwrap();
        assert!(dir.is_empty().unwrap());
    }

    #[test]
    fn bad_names() {
        let f = fixture();
        let dir = new_dir(&f);
        let long = "n".repeat(DIRSIZ + 1);
        assert!(matches!(dir.link(&long, 4), Err(FsError::NameTooLong(61))));
        assert!(matches!(dir.link("", 4), Err(FsError::InvalidName)));
        assert!(matches!(dir.link("a/b", 4), Err(FsError::InvalidName)));
        assert!(matches!(dir.link("..", 4), Err(FsError::Exists)));
        dir.link(&"n".repeat(DIRSIZ), 4).unwrap();
        assert_eq!(dir.lookup(&"n".repeat(DIRSIZ)).unwrap(), Some((0, 4)));
        assert_eq!(dir.lookup(&long).unwrap(), None);
    }

    #[test]
    fn lookup_get_takes_a_reference() {
        let f = fixture();
        let dir = new_dir(&f);
        let target = f.device.alloc().alloc_inode().unwrap();
        dir.link("t", target).unwrap();
        let inode = dir.lookup_get("t").unwrap();
        assert_eq!(inode.inum(), target);
        assert_eq!(f.inodes.ref_count(&inode), 1);
        f.inodes.put_inode(inode);
        assert!(matches!(dir.lookup_get("nope"), Err(FsError::NotFound(_))));
    }

    #[test]
    fn second_lock_fails_and_foreign_unlock_fails() {
        let f = fixture();
        let a = new_dir(&f);
        let b = new_dir(&f);
        let lock = a.lock().unwrap();
        assert!(matches!(a.lock(), Err(FsError::LockProtocol(_))));
        assert!(matches!(b.unlock(lock), Err(FsError::LockProtocol(_))));
        // the rejected handle was dropped, which released `a`
        let lock = a.lock().unwrap();
        a.unlock(lock).unwrap();
    }

    #[test]
    fn locked_sequence_is_atomic_to_others() {
        let f = fixture();
        let dir = Arc::new(new_dir(&f));
        dir.link("old", 8).unwrap();
        let mut lock = dir.lock().unwrap();

        let seen = Arc::new(AtomicBool::new(false));
        let reader = {
            let dir = dir.clone();
            let seen = seen.clone();
            thread::spawn(move || {
                let got = (dir.lookup("old").unwrap(), dir.lookup("new").unwrap());
                seen.store(true, Ordering::SeqCst);
                got
            })
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!seen.load(Ordering::SeqCst));
        lock.unlink("old").unwrap();
        lock.link("new", 8).unwrap();
        assert_eq!(lock.lookup("new").unwrap(), Some((0, 8)));
        dir.unlock(lock).unwrap();
        assert_eq!(reader.join().unwrap(), (None, Some((0, 8))));
    }

    #[test]
    fn mutation_waits_for_lookups_in_flight() {
        let f = fixture();
        let dir = Arc::new(new_dir(&f));
        let ticket = dir.begin_read();

        let done = Arc::new(AtomicBool::new(false));
        let writer = {
            let dir = dir.clone();
            let done = done.clone();
            thread::spawn(move || {
                dir.link("late", 6).unwrap();
                done.store(true, Ordering::SeqCst);
            })
        };
        while dir.gate.lock().writers_waiting == 0 {
            thread::yield_now();
        }
        // arrives after the link was requested, so it must see it
        let reader = {
            let dir = dir.clone();
            thread::spawn(move || dir.lookup("late").unwrap())
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!done.load(Ordering::SeqCst));
        drop(ticket);
        writer.join().unwrap();
        assert!(done.load(Ordering::SeqCst));
        assert_eq!(reader.join().unwrap(), Some((0, 6)));
    }

    #[test]
    fn lookups_run_side_by_side() {
        let f = fixture();
        let dir = new_dir(&f);
        dir.link("a", 3).unwrap();
        let first = dir.begin_read();
        // a second lookup is not held back by the first
        assert_eq!(dir.lookup("a").unwrap(), Some((0, 3)));
        drop(first);
    }

    #[test]
    fn closing_releases_the_inode_and_persists_it() {
        let f = fixture();
        let dir = new_dir(&f);
        dir.link("kept", 12).unwrap();
        let inum = dir.inum();
        let size = dir.size();
        let inode = f.inodes.dup_inode(dir.inode());
        drop(dir);
        assert_eq!(f.inodes.ref_count(&inode), 1);
        assert!(!inode.is_dirty());
        assert_eq!(inode.size(), size);
        f.inodes.put_inode(inode);
        let again = Directory::open(
            f.device.clone(),
            f.inodes.clone(),
            f.inodes.get_inode(0, inum).unwrap(),
        )
        .unwrap();
        assert_eq!(again.lookup("kept").unwrap(), Some((0, 12)));
    }

    #[test]
    fn open_rejects_regular_files() {
        let f = fixture();
        let inum = f.device.alloc().alloc_inode().unwrap();
        let inode = f.inodes.get_inode(0, inum).unwrap();
        *inode.lock().disk_mut() = DiskInode::new(I_REGULAR | 0o644);
        let held = f.inodes.dup_inode(&inode);
        assert!(matches!(
            Directory::open(f.device.clone(), f.inodes.clone(), inode),
            Err(FsError::NotDirectory)
        ));
        assert_eq!(f.inodes.ref_count(&held), 1);
        f.inodes.put_inode(held);
    }
}
