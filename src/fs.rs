//! Mount table and the namespace operations built on top of directories.
//!
//! Operations that hold more than one directory lock (unlink, rmdir, rename)
//! run one at a time under `namespace`; plain `create` and `mkdir` only go
//! through the target directory's own gate.

use super::*;
use bitmap::Allocator;
use blk_cch::{BlockCache, BlockKind, CachePolicy};
use blk_dev::BlockDevice;
use common::*;
use device::Device;
use dir::Directory;
use error::{FsError, Result};
use inode::{DiskInode, Inode, InodeCache};
use super_blk::{Geometry, SuperBlock};

use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Weak};

/// Runtime tunables of a `FileSystem`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FsConfig {
    /// Capacity of the in-memory inode table
    pub inode_slots: usize,
    /// Blocks kept in the block cache
    pub block_cache_capacity: usize,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            inode_slots: NR_INODES,
            block_cache_capacity: NR_BUFS,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MkfsOptions {
    /// Inodes to create, derived from the device size when None
    pub ninodes: Option<u32>,
}

/// devno of the private cache mkfs works through
const MKFS_DEV: u32 = 0;

struct Mount {
    device: Arc<Device>,
    /// held with the mount flag set until unmount
    root: Arc<Inode>,
}

pub struct FileSystem {
    config: FsConfig,
    cache: Arc<BlockCache>,
    inodes: Arc<InodeCache>,
    mounts: RwLock<HashMap<u32, Mount>>,
    /// open directories; every opener of one directory shares its gate
    dirs: Mutex<HashMap<(u32, u32), Weak<Directory>>>,
    namespace: Mutex<()>,
}

/// Inode count mkfs picks when none is given: a third of the blocks,
/// rounded up to whole inode-table blocks.
fn default_inodes(block_size: usize, zones: u32) -> u32 {
    let per_block = (block_size / INODE_SIZE) as u32;
    (zones / 3).max(1).div_ceil(per_block) * per_block
}

fn read_super(cache: &BlockCache, dev: u32) -> Result<SuperBlock> {
    let (block, offset) = Geometry::super_location(cache.device(dev)?.block_size());
    let buf = cache.get_block(dev, block, BlockKind::Super, CachePolicy::Normal)?;
    let sb = SuperBlock::decode(&buf.lock().data()[offset..]);
    cache.put_block(buf)?;
    sb
}

fn write_super(cache: &BlockCache, dev: u32, sb: &SuperBlock) -> Result<()> {
    let (block, offset) = Geometry::super_location(cache.device(dev)?.block_size());
    let raw = sb.encode()?;
    let buf = cache.get_block(dev, block, BlockKind::Super, CachePolicy::Normal)?;
    {
        let mut guard = buf.lock();
        guard.data_mut()[offset..offset + raw.len()].copy_from_slice(&raw);
        guard.mark_dirty();
    }
    cache.put_block(buf)
}

fn adjust_links(inode: &Inode, delta: i32) {
    {
        let mut inner = inode.lock();
        let disk = inner.disk_mut();
        disk.nlinks = (disk.nlinks as i32 + delta).clamp(0, u16::MAX as i32) as u16;
        disk.ctime = now();
    }
    inode.mark_dirty();
}

impl FileSystem {
    pub fn new(config: FsConfig) -> Self {
        let cache = Arc::new(BlockCache::new(config.block_cache_capacity));
        let inodes = Arc::new(InodeCache::new(cache.clone(), config.inode_slots));
        Self {
            config,
            cache,
            inodes,
            mounts: RwLock::new(HashMap::new()),
            dirs: Mutex::new(HashMap::new()),
            namespace: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &FsConfig {
        &self.config
    }

    pub fn inodes(&self) -> &Arc<InodeCache> {
        &self.inodes
    }

    /// Writes an empty filesystem onto `disk`: zeroed inode table, empty
    /// maps, superblock and a root directory holding "." and "..".
    pub fn mkfs(disk: Arc<dyn BlockDevice>, opts: &MkfsOptions) -> Result<Geometry> {
        let block_size = disk.block_size();
        let zones = u32::try_from(disk.num_blocks())
            .map_err(|_| FsError::Format(format!("{} blocks is too many", disk.num_blocks())))?;
        let ninodes = opts
            .ninodes
            .unwrap_or_else(|| default_inodes(block_size, zones));
        let geo = Arc::new(Geometry::for_device(block_size, zones, ninodes)?);
        let cache = Arc::new(BlockCache::new(NR_BUFS));
        cache.register_device(MKFS_DEV, disk);

        for block in geo.inode_table_start()..geo.first_data_zone {
            let buf = cache.get_block(MKFS_DEV, block, BlockKind::InodeTable, CachePolicy::NoRead)?;
            buf.lock().zero();
            cache.put_block(buf)?;
        }
        Allocator::format(MKFS_DEV, &geo, &cache)?;
        write_super(&cache, MKFS_DEV, &geo.to_super())?;

        let alloc = Allocator::load(MKFS_DEV, geo.clone(), cache.clone())?;
        let inum = alloc.alloc_inode()?;
        if inum != ROOT_INODE {
            return Err(FsError::Format(format!("root directory got inode {inum}")));
        }
        let device = Arc::new(Device::new(MKFS_DEV, geo.clone(), cache.clone(), alloc));
        let inodes = Arc::new(InodeCache::new(cache.clone(), 2));
        inodes.register_device(MKFS_DEV, geo.clone());
        let root = inodes.get_inode(MKFS_DEV, ROOT_INODE)?;
        {
            let mut inner = root.lock();
            let disk = inner.disk_mut();
            *disk = DiskInode::new(I_DIRECTORY | 0o755);
            disk.nlinks = 2;
        }
        root.mark_dirty();
        let dir = Directory::open(device.clone(), inodes.clone(), root)?;
        dir.link(".", ROOT_INODE)?;
        dir.link("..", ROOT_INODE)?;
        drop(dir);

        inodes.flush_device(MKFS_DEV)?;
        device.alloc().shutdown();
        cache.flush(MKFS_DEV)?;
        info!(
            "mkfs: {} inodes, {} zones, first data zone {}",
            geo.ninodes, geo.zones, geo.first_data_zone
        );
        Ok(Geometry::clone(&geo))
    }

    pub fn mount(&self, devno: u32, disk: Arc<dyn BlockDevice>) -> Result<Arc<Device>> {
        let mut mounts = self.mounts.write();
        if mounts.contains_key(&devno) {
            warn!("mount: device {devno} already mounted");
            return Err(FsError::Busy);
        }
        let (block_size, num_blocks) = (disk.block_size(), disk.num_blocks());
        self.cache.register_device(devno, disk);
        match self.load(devno, block_size, num_blocks) {
            Ok(mount) => {
                let device = mount.device.clone();
                let geo = device.geometry();
                info!(
                    "mounted device {devno}: {} inodes, {} zones, {} free",
                    geo.ninodes,
                    geo.zones,
                    device.alloc().free_zones()
                );
                mounts.insert(devno, mount);
                Ok(device)
            }
            Err(e) => {
                warn!("mount of device {devno} failed: {e}");
                self.inodes.unregister_device(devno);
                self.cache.unregister_device(devno);
                Err(e)
            }
        }
    }

    fn load(&self, devno: u32, block_size: usize, num_blocks: usize) -> Result<Mount> {
        let geo = Geometry::from_super(&read_super(&self.cache, devno)?)?;
        if geo.block_size != block_size {
            return Err(FsError::Format(format!(
                "block size {} on a device of {block_size}-byte blocks",
                geo.block_size
            )));
        }
        if geo.zones as usize > num_blocks {
            return Err(FsError::Format(format!(
                "{} zones on a device of {num_blocks} blocks",
                geo.zones
            )));
        }
        let geo = Arc::new(geo);
        self.inodes.register_device(devno, geo.clone());
        let alloc = Allocator::load(devno, geo.clone(), self.cache.clone())?;
        let device = Arc::new(Device::new(devno, geo, self.cache.clone(), alloc));
        let root = self.inodes.get_inode(devno, ROOT_INODE)?;
        if !root.is_dir() {
            self.inodes.put_inode(root);
            return Err(FsError::Format("root inode is not a directory".to_owned()));
        }
        root.lock().set_mounted(true);
        Ok(Mount { device, root })
    }

    /// Fails with `Busy` while anything on the device besides its root is
    /// referenced, open directories included.
    pub fn unmount(&self, devno: u32) -> Result<()> {
        let mut mounts = self.mounts.write();
        if !mounts.contains_key(&devno) {
            return Err(FsError::NotMounted(devno));
        }
        if self.inodes.is_device_busy(devno) {
            warn!("unmount: device {devno} is busy");
            return Err(FsError::Busy);
        }
        self.inodes.flush_device(devno)?;
        self.cache.flush(devno)?;
        let mount = mounts.remove(&devno).ok_or(FsError::NotMounted(devno))?;
        drop(mounts);

        mount.root.lock().set_mounted(false);
        self.inodes.put_inode(mount.root);
        mount.device.alloc().shutdown();
        self.inodes.unregister_device(devno);
        self.cache.unregister_device(devno);
        self.dirs.lock().retain(|&(dev, _), _| dev != devno);
        info!("unmounted device {devno}");
        Ok(())
    }

    pub fn device(&self, devno: u32) -> Result<Arc<Device>> {
        self.mounts
            .read()
            .get(&devno)
            .map(|m| m.device.clone())
            .ok_or(FsError::NotMounted(devno))
    }

    /// Returns the open directory for `(devno, inum)`, opening it if nobody
    /// holds it.
    pub fn open_dir(&self, devno: u32, inum: u32) -> Result<Arc<Directory>> {
        if let Some(dir) = self.dirs.lock().get(&(devno, inum)).and_then(Weak::upgrade) {
            return Ok(dir);
        }
        let device = self.device(devno)?;
        let inode = self.inodes.get_inode(devno, inum)?;
        let dir = Arc::new(Directory::open(device, self.inodes.clone(), inode)?);

        let mut dirs = self.dirs.lock();
        if let Some(existing) = dirs.get(&(devno, inum)).and_then(Weak::upgrade) {
            // lost a race with another opener; ours closes outside the lock
            drop(dirs);
            drop(dir);
            return Ok(existing);
        }
        dirs.retain(|_, d| d.strong_count() > 0);
        dirs.insert((devno, inum), Arc::downgrade(&dir));
        Ok(dir)
    }

    pub fn root_dir(&self, devno: u32) -> Result<Arc<Directory>> {
        self.open_dir(devno, ROOT_INODE)
    }

    /// Takes a reference on an inode of a mounted device. Hand it back
    /// through `release`.
    pub fn get_inode(&self, devno: u32, inum: u32) -> Result<Arc<Inode>> {
        self.device(devno)?;
        self.inodes.get_inode(devno, inum)
    }

    fn new_inode(&self, device: &Device, mode: u16) -> Result<Arc<Inode>> {
        let inum = device.alloc().alloc_inode()?;
        let inode = match self.inodes.get_inode(device.devno(), inum) {
            Ok(inode) => inode,
            Err(e) => {
                device.alloc().free_inode(inum)?;
                return Err(e);
            }
        };
        *inode.lock().disk_mut() = DiskInode::new(mode);
        inode.mark_dirty();
        debug!("dev {}: new inode {inum} mode {mode:#o}", device.devno());
        Ok(inode)
    }

    /// Gives back an inode that never made it into a directory.
    fn abandon(&self, device: &Device, inode: Arc<Inode>) {
        inode.lock().disk_mut().nlinks = 0;
        if let Err(e) = self.inodes.release(device, inode) {
            warn!("dev {}: freeing unlinked inode: {e}", device.devno());
        }
    }

    /// Creates a file named `name` in `dir`. A mode without a type is a
    /// regular file. The returned inode is referenced.
    pub fn create(&self, dir: &Directory, name: &str, mode: u16) -> Result<Arc<Inode>> {
        let mode = match mode & I_TYPE {
            0 => mode | I_REGULAR,
            I_DIRECTORY => return Err(FsError::IsDirectory),
            _ => mode,
        };
        let inode = self.new_inode(dir.device(), mode)?;
        if let Err(e) = dir.link(name, inode.inum()) {
            self.abandon(dir.device(), inode);
            return Err(e);
        }
        Ok(inode)
    }

    /// Creates directory `name` under `parent` and returns its inode number.
    pub fn mkdir(&self, parent: &Directory, name: &str) -> Result<u32> {
        let device = parent.device().clone();
        let inode = self.new_inode(&device, I_DIRECTORY | 0o755)?;
        let inum = inode.inum();
        inode.lock().disk_mut().nlinks = 2;

        let made = self.open_dir(device.devno(), inum).and_then(|child| {
            child.link(".", inum)?;
            child.link("..", parent.inum())
        });
        if let Err(e) = made.and_then(|()| parent.link(name, inum)) {
            self.abandon(&device, inode);
            return Err(e);
        }
        adjust_links(parent.inode(), 1);
        self.inodes.put_inode(inode);
        debug!("dev {}: mkdir {name:?} -> {inum} in {}", device.devno(), parent.inum());
        Ok(inum)
    }

    /// Removes a non-directory entry. The inode goes away with its last
    /// reference.
    pub fn unlink(&self, dir: &Directory, name: &str) -> Result<()> {
        if matches!(name, "." | "..") {
            return Err(FsError::InvalidName);
        }
        let _ns = self.namespace.lock();
        let mut lock = dir.lock()?;
        let inode = lock.lookup_get(name)?;
        if inode.is_dir() {
            self.inodes.put_inode(inode);
            return Err(FsError::IsDirectory);
        }
        if let Err(e) = lock.unlink(name) {
            self.inodes.put_inode(inode);
            return Err(e);
        }
        drop(lock);
        adjust_links(&inode, -1);
        self.inodes.release(dir.device(), inode)
    }

    pub fn rmdir(&self, parent: &Directory, name: &str) -> Result<()> {
        if matches!(name, "." | "..") {
            return Err(FsError::InvalidName);
        }
        let _ns = self.namespace.lock();
        let mut parent_lock = parent.lock()?;
        let Some((dev, inum)) = parent_lock.lookup(name)? else {
            return Err(FsError::NotFound(name.to_owned()));
        };
        let child = self.open_dir(dev, inum)?;
        if child.inode().is_mounted() {
            return Err(FsError::Busy);
        }
        let mut child_lock = child.lock()?;
        if !child_lock.is_empty()? {
            return Err(FsError::NotEmpty);
        }
        parent_lock.unlink(name)?;
        child_lock.unlink(".")?;
        child_lock.unlink("..")?;
        // links queued on the child's gate must see it gone
        child.inode().lock().disk_mut().nlinks = 0;
        child.inode().mark_dirty();
        drop(child_lock);
        adjust_links(parent.inode(), -1);
        drop(parent_lock);
        debug!("dev {dev}: rmdir {name:?} ({inum}) from {}", parent.inum());
        // the directory is reclaimed when its last handle closes
        drop(child);
        Ok(())
    }

    /// Fails when `at` is `moved` or lies below it.
    fn ensure_outside(&self, devno: u32, moved: u32, mut at: u32) -> Result<()> {
        let limit = self.device(devno)?.geometry().ninodes;
        for _ in 0..limit {
            if at == moved {
                return Err(FsError::InvalidName);
            }
            if at == ROOT_INODE {
                return Ok(());
            }
            match self.open_dir(devno, at)?.lookup("..")? {
                Some((_, up)) => at = up,
                // removed while we walked
                None => return Ok(()),
            }
        }
        Err(FsError::Corruption {
            block: 0,
            detail: format!("directory {at} does not lead back to the root"),
        })
    }

    /// Moves entry `old` of `src` to `new` in `dst`. The target name must
    /// not exist.
    pub fn rename(&self, src: &Directory, old: &str, dst: &Directory, new: &str) -> Result<()> {
        if [old, new].iter().any(|n| matches!(*n, "." | "..")) {
            return Err(FsError::InvalidName);
        }
        if src.dev() != dst.dev() {
            return Err(FsError::CrossDevice);
        }
        let devno = src.dev();
        let same = src.inum() == dst.inum();
        let _ns = self.namespace.lock();

        let Some((_, inum)) = src.lookup(old)? else {
            return Err(FsError::NotFound(old.to_owned()));
        };
        let moved = self.inodes.get_inode(devno, inum)?;
        let is_dir = moved.is_dir();
        self.inodes.put_inode(moved);
        if is_dir && !same {
            self.ensure_outside(devno, inum, dst.inum())?;
        }

        let mut src_lock = src.lock()?;
        let mut dst_lock = if same { None } else { Some(dst.lock()?) };
        let taken = match &dst_lock {
            Some(lock) => lock.lookup(new)?,
            None => src_lock.lookup(new)?,
        };
        if taken.is_some() {
            return Err(FsError::Exists);
        }
        match dst_lock.as_mut() {
            Some(lock) => lock.link(new, inum)?,
            None => src_lock.link(new, inum)?,
        }
        if let Err(e) = src_lock.unlink(old) {
            let undo = match dst_lock.as_mut() {
                Some(lock) => lock.unlink(new),
                None => src_lock.unlink(new),
            };
            if let Err(u) = undo {
                warn!("dev {devno}: rename left {new:?} behind: {u}");
            }
            return Err(e);
        }

        if is_dir && !same {
            let moved = self.open_dir(devno, inum)?;
            {
                let mut moved_lock = moved.lock()?;
                moved_lock.unlink("..")?;
                moved_lock.link("..", dst.inum())?;
            }
            adjust_links(src.inode(), -1);
            adjust_links(dst.inode(), 1);
        }
        debug!(
            "dev {devno}: rename {}/{old:?} -> {}/{new:?} ({inum})",
            src.inum(),
            dst.inum()
        );
        Ok(())
    }

    /// Drops a reference taken by `create` or `get_inode`. The last
    /// reference to an inode with no links frees it.
    pub fn release(&self, inode: Arc<Inode>) -> Result<()> {
        match self.device(inode.dev()) {
            Ok(device) => self.inodes.release(&device, inode),
            Err(e) => {
                self.inodes.put_inode(inode);
                Err(e)
            }
        }
    }

    pub fn sync(&self, devno: u32) -> Result<()> {
        self.device(devno)?;
        self.inodes.flush_device(devno)?;
        self.cache.flush(devno)
    }
}

impl Drop for FileSystem {
    fn drop(&mut self) {
        let devnos: Vec<u32> = self.mounts.read().keys().copied().collect();
        for devno in devnos {
            if let Err(e) = self.sync(devno) {
                warn!("sync of device {devno} on drop: {e}");
            }
        }
    }
}
