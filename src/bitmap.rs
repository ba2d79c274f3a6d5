//! Inode and zone allocation for one device.
//!
//! Both maps are kept in memory as packed words and written through to their
//! map blocks on every change. Bit 0 of each map is reserved: inode bit `n`
//! is inode `n`, zone bit `b` is zone `b + first_data_zone - 1`.

use super::*;
use blk_cch::{BlockCache, BlockKind, CachePolicy};
use error::{FsError, Result};
use super_blk::Geometry;

use log::{debug, error, warn};
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum MapKind {
    Inode,
    Zone,
}

impl MapKind {
    fn block_kind(self) -> BlockKind {
        match self {
            MapKind::Inode => BlockKind::InodeMap,
            MapKind::Zone => BlockKind::ZoneMap,
        }
    }
}

/// One bit table plus its search cursor.
struct Bits {
    words: Vec<u64>,
    nbits: usize,
    /// lowest bit worth starting a scan from; 0 means unset
    search: usize,
}

impl Bits {
    fn from_bytes(raw: &[u8], nbits: usize) -> Self {
        let mut words = vec![0u64; nbits.div_ceil(64)];
        for (i, word) in words.iter_mut().enumerate() {
            let mut chunk = [0u8; 8];
            let start = i * 8;
            let end = (start + 8).min(raw.len());
            chunk[..end - start].copy_from_slice(&raw[start..end]);
            *word = u64::from_le_bytes(chunk);
        }
        // reserved bit
        words[0] |= 1;
        Self {
            words,
            nbits,
            search: 0,
        }
    }

    fn test(&self, bit: usize) -> bool {
        self.words[bit / 64] & (1 << (bit % 64)) != 0
    }

    fn set(&mut self, bit: usize, on: bool) {
        if on {
            self.words[bit / 64] |= 1 << (bit % 64);
        } else {
            self.words[bit / 64] &= !(1 << (bit % 64));
        }
    }

    /// first clear bit in `[from, to)`
    fn first_clear(&self, from: usize, to: usize) -> Option<usize> {
        let mut bit = from;
        while bit < to {
            // pretend the bits below `bit` in this word are taken
            let word = self.words[bit / 64] | ((1u64 << (bit % 64)) - 1);
            if word != u64::MAX {
                let found = bit / 64 * 64 + word.trailing_ones() as usize;
                return (found < to).then_some(found);
            }
            bit = (bit / 64 + 1) * 64;
        }
        None
    }

    /// first-fit from `origin`, wrapping around once; bit 0 is never returned
    fn scan(&self, origin: usize) -> Option<usize> {
        let origin = if origin == 0 || origin >= self.nbits {
            1
        } else {
            origin
        };
        self.first_clear(origin, self.nbits)
            .or_else(|| self.first_clear(1, origin))
    }

    fn count_set(&self) -> usize {
        let mut count: usize = self.words.iter().map(|w| w.count_ones() as usize).sum();
        // bits past the end of the map were never set by us, but the loaded
        // block may carry them; don't count them
        for bit in self.nbits..self.words.len() * 64 {
            if self.test(bit) {
                count -= 1;
            }
        }
        count - 1
    }
}

struct AllocState {
    imap: Bits,
    zmap: Bits,
    shut_down: bool,
}

impl AllocState {
    fn map(&mut self, kind: MapKind) -> &mut Bits {
        match kind {
            MapKind::Inode => &mut self.imap,
            MapKind::Zone => &mut self.zmap,
        }
    }
}

pub struct Allocator {
    dev: u32,
    geo: Arc<Geometry>,
    cache: Arc<BlockCache>,
    state: Mutex<AllocState>,
}

impl Allocator {
    /// Reads both maps from their blocks.
    pub fn load(dev: u32, geo: Arc<Geometry>, cache: Arc<BlockCache>) -> Result<Self> {
        let imap = Self::read_map(&cache, dev, geo.imap_start(), geo.imap_blocks, MapKind::Inode)?;
        let zmap = Self::read_map(&cache, dev, geo.zmap_start(), geo.zmap_blocks, MapKind::Zone)?;
        let state = AllocState {
            imap: Bits::from_bytes(&imap, geo.imap_bits()),
            zmap: Bits::from_bytes(&zmap, geo.zmap_bits()),
            shut_down: false,
        };
        debug!(
            "dev {dev}: {} inodes and {} zones in use",
            state.imap.count_set(),
            state.zmap.count_set()
        );
        Ok(Self {
            dev,
            geo,
            cache,
            state: Mutex::new(state),
        })
    }

    /// Writes empty maps (only the reserved bit set) for a fresh filesystem.
    pub fn format(dev: u32, geo: &Geometry, cache: &BlockCache) -> Result<()> {
        let maps = [
            (geo.imap_start(), geo.imap_blocks, MapKind::Inode),
            (geo.zmap_start(), geo.zmap_blocks, MapKind::Zone),
        ];
        for (start, blocks, kind) in maps {
            for i in 0..blocks {
                let buf = cache.get_block(dev, start + i, kind.block_kind(), CachePolicy::NoRead)?;
                {
                    let mut guard = buf.lock();
                    guard.zero();
                    if i == 0 {
                        guard.data_mut()[0] = 1;
                    }
                }
                cache.put_block(buf)?;
            }
        }
        Ok(())
    }

    fn read_map(
        cache: &BlockCache,
        dev: u32,
        start: u32,
        blocks: u32,
        kind: MapKind,
    ) -> Result<Vec<u8>> {
        let mut raw = Vec::new();
        for i in 0..blocks {
            let buf = cache.get_block(dev, start + i, kind.block_kind(), CachePolicy::Normal)?;
            raw.extend_from_slice(buf.lock().data());
            cache.put_block(buf)?;
        }
        Ok(raw)
    }

    pub fn dev(&self) -> u32 {
        self.dev
    }

    pub fn alloc_inode(&self) -> Result<u32> {
        let mut state = self.state.lock();
        if state.shut_down {
            return Err(FsError::NotMounted(self.dev));
        }
        let origin = state.imap.search;
        let Some(bit) = state.imap.scan(origin) else {
            warn!("dev {}: out of inodes", self.dev);
            return Err(FsError::NoFreeInodes(self.dev));
        };
        self.persist(MapKind::Inode, bit, true)?;
        state.imap.set(bit, true);
        state.imap.search = bit;
        debug!("dev {}: alloc inode {bit}", self.dev);
        Ok(bit as u32)
    }

    /// Allocates a zone, preferring `hint` when it lies past the metadata.
    pub fn alloc_zone(&self, hint: u32) -> Result<u32> {
        let mut state = self.state.lock();
        if state.shut_down {
            return Err(FsError::NotMounted(self.dev));
        }
        let base = self.geo.first_data_zone - 1;
        let origin = if hint <= self.geo.first_data_zone {
            state.zmap.search
        } else {
            (hint - base) as usize
        };
        let Some(bit) = state.zmap.scan(origin) else {
            warn!("dev {}: out of space", self.dev);
            return Err(FsError::NoSpace(self.dev));
        };
        self.persist(MapKind::Zone, bit, true)?;
        state.zmap.set(bit, true);
        if state.zmap.search == 0 || bit < state.zmap.search {
            state.zmap.search = bit;
        }
        let zone = bit as u32 + base;
        debug!("dev {}: alloc zone {zone}", self.dev);
        Ok(zone)
    }

    /// Out-of-range numbers are ignored. Freeing a free inode panics.
    pub fn free_inode(&self, inum: u32) -> Result<()> {
        if inum == 0 || inum > self.geo.ninodes {
            return Ok(());
        }
        self.free_bit(MapKind::Inode, inum as usize)?;
        debug!("dev {}: free inode {inum}", self.dev);
        Ok(())
    }

    /// Out-of-range numbers are ignored. Freeing a free zone panics.
    pub fn free_zone(&self, zone: u32) -> Result<()> {
        if zone < self.geo.first_data_zone || zone >= self.geo.zones {
            return Ok(());
        }
        let bit = (zone - (self.geo.first_data_zone - 1)) as usize;
        self.free_bit(MapKind::Zone, bit)?;
        debug!("dev {}: free zone {zone}", self.dev);
        Ok(())
    }

    fn free_bit(&self, kind: MapKind, bit: usize) -> Result<()> {
        let mut state = self.state.lock();
        if state.shut_down {
            return Err(FsError::NotMounted(self.dev));
        }
        if !state.map(kind).test(bit) {
            error!("dev {}: freeing free {kind:?} bit {bit}", self.dev);
            panic!("double free of {kind:?} bit {bit} on device {}", self.dev);
        }
        self.persist(kind, bit, false)?;
        let map = state.map(kind);
        map.set(bit, false);
        if bit < map.search {
            map.search = bit;
        }
        Ok(())
    }

    /// Flips `bit` in its map block and writes the block back.
    fn persist(&self, kind: MapKind, bit: usize, on: bool) -> Result<()> {
        let start = match kind {
            MapKind::Inode => self.geo.imap_start(),
            MapKind::Zone => self.geo.zmap_start(),
        };
        let block = start + (bit / self.geo.bits_per_block) as u32;
        let offset = bit % self.geo.bits_per_block;
        let buf = self
            .cache
            .get_block(self.dev, block, kind.block_kind(), CachePolicy::Normal)?;
        {
            let mut guard = buf.lock();
            let byte = &mut guard.data_mut()[offset / 8];
            if on {
                *byte |= 1 << (offset % 8);
            } else {
                *byte &= !(1 << (offset % 8));
            }
            guard.mark_dirty();
        }
        self.cache.put_block(buf)
    }

    /// Flushes the map blocks. Safe to call more than once.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        if state.shut_down {
            return;
        }
        state.shut_down = true;
        if let Err(e) = self.cache.flush(self.dev) {
            warn!("dev {}: flushing bitmaps at shutdown: {e}", self.dev);
        }
        debug!("dev {}: allocator shut down", self.dev);
    }

    pub fn allocated_inodes(&self) -> usize {
        self.state.lock().imap.count_set()
    }

    pub fn allocated_zones(&self) -> usize {
        self.state.lock().zmap.count_set()
    }

    pub fn free_zones(&self) -> usize {
        let state = self.state.lock();
        state.zmap.nbits - 1 - state.zmap.count_set()
    }

    pub fn inode_allocated(&self, inum: u32) -> bool {
        inum != 0 && inum <= self.geo.ninodes && self.state.lock().imap.test(inum as usize)
    }

    pub fn zone_allocated(&self, zone: u32) -> bool {
        zone >= self.geo.first_data_zone
            && zone < self.geo.zones
            && self
                .state
                .lock()
                .zmap
                .test((zone - (self.geo.first_data_zone - 1)) as usize)
    }
}
