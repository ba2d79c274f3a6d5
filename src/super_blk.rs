//! Disk layout:
//! [ boot block | super block | inode map | zone map | inode table | data zones ]
//!
//! The superblock sits at byte 1024 regardless of the block size; the inode
//! map always starts at block 2.

use super::*;
use common::*;
use error::{FsError, Result};

use serde::{Deserialize, Serialize};

/// on-disk superblock, Minix V3 field order
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuperBlock {
    /// Number of inodes
    pub ninodes: u32,
    pad0: u16,
    /// Blocks used by the inode map
    pub imap_blocks: u16,
    /// Blocks used by the zone map
    pub zmap_blocks: u16,
    /// First zone holding file data
    pub first_data_zone: u16,
    /// log2(zone size / block size), always 0 here
    pub log_zone_size: u16,
    pad1: u16,
    /// Largest file size in bytes
    pub max_size: u32,
    /// Number of zones on the device
    pub zones: u32,
    /// Must be SUPER_MAGIC
    pub magic: u16,
    pad2: u16,
    pub block_size: u16,
    pub disk_version: u8,
}

impl SuperBlock {
    pub fn decode(raw: &[u8]) -> Result<Self> {
        bincode::deserialize(raw).map_err(|e| FsError::Corruption {
            block: (SUPER_OFFSET / MIN_BLOCK_SIZE) as u32,
            detail: format!("superblock: {e}"),
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| FsError::Format(format!("superblock: {e}")))
    }
}

/// Device metadata derived from the superblock; immutable while mounted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Geometry {
    pub ninodes: u32,
    pub zones: u32,
    pub first_data_zone: u32,
    pub block_size: usize,
    pub inode_size: usize,
    pub inodes_per_block: usize,
    pub bits_per_block: usize,
    pub imap_blocks: u32,
    pub zmap_blocks: u32,
}

impl Geometry {
    pub fn from_super(sb: &SuperBlock) -> Result<Self> {
        if sb.magic != SUPER_MAGIC {
            return Err(FsError::Format(format!("bad magic {:#x}", sb.magic)));
        }
        let block_size = sb.block_size as usize;
        if block_size < MIN_BLOCK_SIZE || !block_size.is_power_of_two() {
            return Err(FsError::Format(format!("bad block size {block_size}")));
        }
        if sb.log_zone_size != 0 {
            return Err(FsError::Format("zones larger than blocks".to_owned()));
        }
        let geo = Self::with_maps(
            block_size,
            sb.ninodes,
            sb.zones,
            sb.imap_blocks as u32,
            sb.zmap_blocks as u32,
        );
        if geo.first_data_zone != sb.first_data_zone as u32 {
            return Err(FsError::Format(format!(
                "first data zone {} does not follow the inode table ({})",
                sb.first_data_zone, geo.first_data_zone
            )));
        }
        if geo.first_data_zone >= geo.zones
            || geo.imap_bits() > geo.imap_blocks as usize * geo.bits_per_block
            || geo.zmap_bits() > geo.zmap_blocks as usize * geo.bits_per_block
        {
            return Err(FsError::Format("bitmaps too small for device".to_owned()));
        }
        Ok(geo)
    }

    /// Lays out a fresh filesystem over `zones` blocks.
    pub fn for_device(block_size: usize, zones: u32, ninodes: u32) -> Result<Self> {
        if block_size < MIN_BLOCK_SIZE || !block_size.is_power_of_two() {
            return Err(FsError::Format(format!("bad block size {block_size}")));
        }
        if ninodes == 0 {
            return Err(FsError::Format("no inodes requested".to_owned()));
        }
        let bits_per_block = block_size * 8;
        let imap_blocks = (ninodes as usize + 1).div_ceil(bits_per_block) as u32;
        // overestimates by counting metadata zones too
        let zmap_blocks = (zones as usize).div_ceil(bits_per_block) as u32;
        let geo = Self::with_maps(block_size, ninodes, zones, imap_blocks, zmap_blocks);
        // room for at least the root directory and one more zone
        if geo.first_data_zone + 2 > zones || geo.first_data_zone > u16::MAX as u32 {
            return Err(FsError::Format(format!(
                "device of {zones} blocks too small for {ninodes} inodes"
            )));
        }
        Ok(geo)
    }

    fn with_maps(
        block_size: usize,
        ninodes: u32,
        zones: u32,
        imap_blocks: u32,
        zmap_blocks: u32,
    ) -> Self {
        let inodes_per_block = block_size / INODE_SIZE;
        let inode_blocks = (ninodes as usize).div_ceil(inodes_per_block) as u32;
        Self {
            ninodes,
            zones,
            first_data_zone: START_BLOCK + imap_blocks + zmap_blocks + inode_blocks,
            block_size,
            inode_size: INODE_SIZE,
            inodes_per_block,
            bits_per_block: block_size * 8,
            imap_blocks,
            zmap_blocks,
        }
    }

    pub fn to_super(&self) -> SuperBlock {
        let nindirect = indirect_per_block(self.block_size) as u64;
        let max_blocks = NR_DZONES as u64 + nindirect + nindirect * nindirect;
        SuperBlock {
            ninodes: self.ninodes,
            imap_blocks: self.imap_blocks as u16,
            zmap_blocks: self.zmap_blocks as u16,
            first_data_zone: self.first_data_zone as u16,
            log_zone_size: 0,
            max_size: (max_blocks * self.block_size as u64).min(u32::MAX as u64) as u32,
            zones: self.zones,
            magic: SUPER_MAGIC,
            block_size: self.block_size as u16,
            ..Default::default()
        }
    }

    pub fn imap_start(&self) -> u32 {
        START_BLOCK
    }

    pub fn zmap_start(&self) -> u32 {
        START_BLOCK + self.imap_blocks
    }

    pub fn inode_table_start(&self) -> u32 {
        START_BLOCK + self.imap_blocks + self.zmap_blocks
    }

    /// bits in the inode map, bit 0 included
    pub fn imap_bits(&self) -> usize {
        self.ninodes as usize + 1
    }

    /// bits in the zone map, bit 0 included
    pub fn zmap_bits(&self) -> usize {
        (self.zones - (self.first_data_zone - 1)) as usize
    }

    /// (block, byte offset) of inode `inum`'s on-disk record
    pub fn inode_location(&self, inum: u32) -> (u32, usize) {
        let idx = (inum - 1) as usize;
        let block = self.inode_table_start() + (idx / self.inodes_per_block) as u32;
        (block, (idx % self.inodes_per_block) * self.inode_size)
    }

    pub fn dirents_per_block(&self) -> usize {
        self.block_size / DIRENT_SIZE
    }

    /// (block, byte offset) holding the superblock
    pub fn super_location(block_size: usize) -> (u32, usize) {
        ((SUPER_OFFSET / block_size) as u32, SUPER_OFFSET % block_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn superblock_encodes_in_v3_order() {
        let geo = Geometry::for_device(1024, 512, 64).unwrap();
        let raw = geo.to_super().encode().unwrap();
        assert_eq!(raw.len(), 31);
        assert_eq!(&raw[0..4], &64u32.to_le_bytes());
        assert_eq!(&raw[24..26], &SUPER_MAGIC.to_le_bytes());
        assert_eq!(&raw[28..30], &1024u16.to_le_bytes());
        assert_eq!(Geometry::from_super(&SuperBlock::decode(&raw).unwrap()).unwrap(), geo);
    }

    #[test]
    fn layout_of_small_device() {
        let geo = Geometry::for_device(1024, 512, 64).unwrap();
        assert_eq!(geo.imap_blocks, 1);
        assert_eq!(geo.zmap_blocks, 1);
        assert_eq!(geo.inodes_per_block, 16);
        // 2 + 1 + 1 + 64 / 16
        assert_eq!(geo.first_data_zone, 8);
        assert_eq!(geo.zmap_bits(), 512 - 7);
        assert_eq!(geo.inode_location(1), (4, 0));
        assert_eq!(geo.inode_location(17), (5, 0));
        assert_eq!(geo.inode_location(18), (5, 64));
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut sb = Geometry::for_device(1024, 512, 64).unwrap().to_super();
        sb.magic = 0x137f;
        assert!(matches!(Geometry::from_super(&sb), Err(FsError::Format(_))));
    }

    #[test]
    fn too_small_device() {
        assert!(Geometry::for_device(1024, 8, 64).is_err());
    }

    #[test]
    fn superblock_location_depends_on_block_size() {
        assert_eq!(Geometry::super_location(1024), (1, 0));
        assert_eq!(Geometry::super_location(4096), (0, 1024));
    }
}
