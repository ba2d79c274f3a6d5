use super::*;
use common::MIN_BLOCK_SIZE;

use parking_lot::Mutex;
use std::any::Any;
use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::sync::atomic::{AtomicBool, Ordering};

/// Raw fixed-size block access. Every call is independent; implementations
/// do their own locking.
pub trait BlockDevice: Send + Sync + Any {
    fn block_size(&self) -> usize;
    fn num_blocks(&self) -> usize;
    fn read_block(&self, block_id: usize, buf: &mut [u8]) -> io::Result<()>;
    fn write_block(&self, block_id: usize, buf: &[u8]) -> io::Result<()>;
    fn flush(&self) -> io::Result<()> {
        Ok(())
    }
}

fn out_of_range(block_id: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("block {block_id} beyond end of device"),
    )
}

/// RAM-backed device.
pub struct MemDisk {
    block_size: usize,
    blocks: usize,
    data: Mutex<Vec<u8>>,
    fail_reads: AtomicBool,
}

impl MemDisk {
    pub fn new(block_size: usize, blocks: usize) -> Self {
        Self {
            block_size,
            blocks,
            data: Mutex::new(vec![0u8; block_size * blocks]),
            fail_reads: AtomicBool::new(false),
        }
    }

    /// Make every following read fail with `EIO` until switched off.
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }
}

impl BlockDevice for MemDisk {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn num_blocks(&self) -> usize {
        self.blocks
    }

    fn read_block(&self, block_id: usize, buf: &mut [u8]) -> io::Result<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(io::Error::from_raw_os_error(libc::EIO));
        }
        if block_id >= self.blocks {
            return Err(out_of_range(block_id));
        }
        let start = block_id * self.block_size;
        let data = self.data.lock();
        buf[..self.block_size].copy_from_slice(&data[start..start + self.block_size]);
        Ok(())
    }

    fn write_block(&self, block_id: usize, buf: &[u8]) -> io::Result<()> {
        if block_id >= self.blocks {
            return Err(out_of_range(block_id));
        }
        let start = block_id * self.block_size;
        let mut data = self.data.lock();
        data[start..start + self.block_size].copy_from_slice(&buf[..self.block_size]);
        Ok(())
    }
}

/// Image file on the host filesystem.
pub struct FileDisk {
    block_size: usize,
    blocks: usize,
    file: File,
}

impl FileDisk {
    pub fn open(file: File, block_size: usize) -> io::Result<Self> {
        if block_size < MIN_BLOCK_SIZE || !block_size.is_power_of_two() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("bad block size {block_size}"),
            ));
        }
        let len = file.metadata()?.len() as usize;
        Ok(Self {
            block_size,
            blocks: len / block_size,
            file,
        })
    }
}

impl BlockDevice for FileDisk {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn num_blocks(&self) -> usize {
        self.blocks
    }

    fn read_block(&self, block_id: usize, buf: &mut [u8]) -> io::Result<()> {
        if block_id >= self.blocks {
            return Err(out_of_range(block_id));
        }
        let offset = (block_id * self.block_size) as u64;
        self.file.read_exact_at(&mut buf[..self.block_size], offset)
    }

    fn write_block(&self, block_id: usize, buf: &[u8]) -> io::Result<()> {
        if block_id >= self.blocks {
            return Err(out_of_range(block_id));
        }
        let offset = (block_id * self.block_size) as u64;
        self.file.write_all_at(&buf[..self.block_size], offset)
    }

    fn flush(&self) -> io::Result<()> {
        self.file.sync_data()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_disk_round_trips_a_block() {
        let disk = MemDisk::new(1024, 4);
        let block = [0xabu8; 1024];
        disk.write_block(2, &block).unwrap();
        let mut buf = [0u8; 1024];
        disk.read_block(2, &mut buf).unwrap();
        assert_eq!(buf, block);
        disk.read_block(1, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn mem_disk_rejects_blocks_past_the_end() {
        let disk = MemDisk::new(1024, 4);
        let mut buf = [0u8; 1024];
        assert!(disk.read_block(4, &mut buf).is_err());
    }

    #[test]
    fn injected_read_failure() {
        let disk = MemDisk::new(1024, 4);
        let mut buf = [0u8; 1024];
        disk.set_fail_reads(true);
        let err = disk.read_block(0, &mut buf).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EIO));
        disk.set_fail_reads(false);
        disk.read_block(0, &mut buf).unwrap();
    }

    #[test]
    fn file_disk_reads_what_it_wrote() {
        let path = std::env::temp_dir().join(format!("minix-core-{}.img", std::process::id()));
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        file.set_len(4 * 1024).unwrap();
        let disk = FileDisk::open(file, 1024).unwrap();
        assert_eq!(disk.num_blocks(), 4);
        disk.write_block(3, &[7u8; 1024]).unwrap();
        let mut buf = [0u8; 1024];
        disk.read_block(3, &mut buf).unwrap();
        assert_eq!(buf[1023], 7);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn file_disk_refuses_odd_block_sizes() {
        let path = std::env::temp_dir().join(format!("minix-core-bs-{}.img", std::process::id()));
        let file = std::fs::File::create(&path).unwrap();
        for size in [512, 1000] {
            let err = FileDisk::open(file.try_clone().unwrap(), size).err().unwrap();
            assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        }
        std::fs::remove_file(&path).unwrap();
    }
}
