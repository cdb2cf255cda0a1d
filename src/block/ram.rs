//! In-memory block device, purely for exercising the filesystem without a
//! real disk (§4.7 implementation note).

use super::{BlockDevice, BlockError};
use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

pub struct RamDisk {
    block_size: usize,
    blocks: Mutex<Vec<u8>>,
}

impl RamDisk {
    pub fn new(block_size: usize, num_blocks: u64) -> Self {
        RamDisk {
            block_size,
            blocks: Mutex::new(vec![0u8; block_size * num_blocks as usize]),
        }
    }
}

impl BlockDevice for RamDisk {
    fn read_block(&self, block_num: u64, buf: &mut [u8]) -> Result<(), BlockError> {
        if block_num >= self.num_blocks() {
            return Err(BlockError::OutOfBounds);
        }
        let start = block_num as usize * self.block_size;
        let data = self.blocks.lock();
        buf[..self.block_size].copy_from_slice(&data[start..start + self.block_size]);
        Ok(())
    }

    fn write_block(&self, block_num: u64, buf: &[u8]) -> Result<(), BlockError> {
        if block_num >= self.num_blocks() {
            return Err(BlockError::OutOfBounds);
        }
        let start = block_num as usize * self.block_size;
        let mut data = self.blocks.lock();
        data[start..start + self.block_size].copy_from_slice(&buf[..self.block_size]);
        Ok(())
    }

    fn block_size(&self) -> usize {
        self.block_size
    }

    fn num_blocks(&self) -> u64 {
        (self.blocks.lock().len() / self.block_size) as u64
    }

    fn flush(&self) -> Result<(), BlockError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_write_roundtrip() {
        let disk = RamDisk::new(1024, 16);
        let mut write_buf = vec![0u8; 1024];
        write_buf[0] = 0xAB;
        write_buf[1023] = 0xCD;
        disk.write_block(3, &write_buf).unwrap();

        let mut read_buf = vec![0u8; 1024];
        disk.read_block(3, &mut read_buf).unwrap();
        assert_eq!(read_buf, write_buf);
    }

    #[test]
    fn test_out_of_bounds() {
        let disk = RamDisk::new(1024, 4);
        let mut buf = vec![0u8; 1024];
        assert_eq!(disk.read_block(4, &mut buf), Err(BlockError::OutOfBounds));
        assert_eq!(disk.write_block(100, &buf), Err(BlockError::OutOfBounds));
    }
}
