/// root i-number
pub const ROOT_INODE: u32 = 1;

/// Minix V3 superblock magic
pub const SUPER_MAGIC: u16 = 0x4d5a;

/// superblock lives at this byte offset whatever the block size is
pub const SUPER_OFFSET: usize = 1024;

/// first inode-map block: boot block and superblock come before it
pub const START_BLOCK: u32 = 2;

pub const MIN_BLOCK_SIZE: usize = 1024;

/// size of an on-disk inode record
pub const INODE_SIZE: usize = 64;

/// zone slots in an inode
pub const NR_TZONES: usize = 10;

/// direct zone slots in an inode
pub const NR_DZONES: usize = 7;

/// index of the single-indirect zone slot
pub const SINGLE_INDIRECT: usize = NR_DZONES;

/// index of the double-indirect zone slot
pub const DOUBLE_INDIRECT: usize = NR_DZONES + 1;

/// Directory is a file containing a sequence of dirent records.
pub const DIRSIZ: usize = 60;

/// inode number + name
pub const DIRENT_SIZE: usize = 4 + DIRSIZ;

pub const NO_ZONE: u32 = 0;

/// default number of in-memory inode slots
pub const NR_INODES: usize = 64;

/// default number of cached blocks
pub const NR_BUFS: usize = 128;

pub const I_TYPE: u16 = 0o170000;
pub const I_REGULAR: u16 = 0o100000;
pub const I_DIRECTORY: u16 = 0o040000;

/// indirect zone entries per block
pub fn indirect_per_block(block_size: usize) -> usize {
    block_size / std::mem::size_of::<u32>()
}

/// seconds since the epoch, saturated into the on-disk width
pub fn now() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs().min(u32::MAX as u64) as u32)
        .unwrap_or(0)
}
