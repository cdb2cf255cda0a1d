//! ext2 filesystem implementation
//!
//! The Second Extended Filesystem (ext2) is a classic Linux filesystem.
//! This module provides structures and functions for parsing ext2 filesystems.

pub mod superblock;
pub mod block_group;
pub mod dir;
pub mod inode;
pub mod file;

pub use superblock::*;
pub use block_group::*;
pub use dir::*;
pub use inode::*;
pub use file::*;

use crate::block::BlockDevice;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

/// A mounted ext2 filesystem instance
///
/// Holds the superblock, block group descriptors, and a reference to the
/// underlying block device for filesystem operations. The device is a
/// trait object: concrete storage backends (VirtIO, AHCI, NVMe, or the
/// in-memory [`crate::block::ram::RamDisk`] this core ships for its own
/// tests) are external collaborators that never need a matching generic
/// parameter threaded through every caller.
pub struct Ext2Fs {
    /// The filesystem superblock
    pub superblock: Ext2Superblock,
    /// Block group descriptors
    pub block_groups: Vec<Ext2BlockGroupDesc>,
    /// The underlying block device
    pub device: Arc<dyn BlockDevice>,
    /// Mount ID for VFS integration
    pub mount_id: usize,
}

impl Ext2Fs {
    /// Create a new ext2 filesystem instance from a block device
    ///
    /// Reads and validates the superblock and block group descriptors.
    pub fn new(device: Arc<dyn BlockDevice>, mount_id: usize) -> Result<Self, &'static str> {
        // Read the superblock
        let superblock = Ext2Superblock::read_from(device.as_ref())
            .map_err(|_| "Failed to read ext2 superblock")?;

        if !superblock.is_valid() {
            return Err("Invalid ext2 magic number");
        }

        // Read block group descriptors
        let block_groups = Ext2BlockGroupDesc::read_table(device.as_ref(), &superblock)
            .map_err(|_| "Failed to read block group descriptors")?;

        Ok(Self {
            superblock,
            block_groups,
            device,
            mount_id,
        })
    }

    /// Read an inode from the filesystem
    pub fn read_inode(&self, inode_num: u32) -> Result<Ext2Inode, &'static str> {
        Ext2Inode::read_from(
            self.device.as_ref(),
            inode_num,
            &self.superblock,
            &self.block_groups,
        )
        .map_err(|_| "Failed to read inode")
    }

    /// Read directory entries from an inode
    ///
    /// Returns the raw directory data for parsing with DirReader.
    pub fn read_directory(&self, inode: &Ext2Inode) -> Result<Vec<u8>, &'static str> {
        if !inode.is_dir() {
            return Err("Not a directory");
        }
        read_file(self.device.as_ref(), inode, &self.superblock)
            .map_err(|_| "Failed to read directory data")
    }

    /// Look up a path component in a directory
    ///
    /// Returns the inode number of the matching entry, or None if not found.
    pub fn lookup_in_dir(&self, dir_inode: &Ext2Inode, name: &str) -> Result<Option<u32>, &'static str> {
        let dir_data = self.read_directory(dir_inode)?;
        Ok(find_entry(&dir_data, name).map(|entry| entry.inode))
    }

    /// Resolve a path to an inode number
    ///
    /// Walks the directory tree from root, looking up each path component.
    /// Supports absolute paths starting with "/".
    pub fn resolve_path(&self, path: &str) -> Result<u32, &'static str> {
        // Must start with "/"
        if !path.starts_with('/') {
            return Err("Path must be absolute");
        }

        // Start at root inode (always inode 2 in ext2)
        let mut current_inode_num = EXT2_ROOT_INO;

        // Split path into components, skipping empty parts
        for component in path.split('/').filter(|s| !s.is_empty()) {
            // Read the current directory inode
            let current_inode = self.read_inode(current_inode_num)?;

            // Make sure it's a directory
            if !current_inode.is_dir() {
                return Err("Not a directory in path");
            }

            // Look up the component in this directory
            match self.lookup_in_dir(&current_inode, component)? {
                Some(inode_num) => {
                    current_inode_num = inode_num;
                }
                None => {
                    return Err("Path component not found");
                }
            }
        }

        Ok(current_inode_num)
    }

    /// Read file content from an inode
    pub fn read_file_content(&self, inode: &Ext2Inode) -> Result<Vec<u8>, &'static str> {
        read_file(self.device.as_ref(), inode, &self.superblock)
            .map_err(|_| "Failed to read file content")
    }

    /// Read a range of file content from an inode
    pub fn read_file_range(
        &self,
        inode: &Ext2Inode,
        offset: u64,
        length: usize,
    ) -> Result<Vec<u8>, &'static str> {
        read_file_range(self.device.as_ref(), inode, &self.superblock, offset, length)
            .map_err(|_| "Failed to read file range")
    }

    /// Write `data` at `offset` into an existing file, pre-allocating any
    /// logical blocks the write touches that aren't backed yet (§4.7).
    pub fn write_file(&mut self, inode_num: u32, offset: u64, data: &[u8]) -> Result<(), &'static str> {
        if data.is_empty() {
            return Ok(());
        }

        let mut inode = self.read_inode(inode_num)?;
        let block_size = self.superblock.block_size();
        let start_block = (offset / block_size as u64) as u32;
        let end_offset = offset + data.len() as u64;
        let end_block = ((end_offset + block_size as u64 - 1) / block_size as u64) as u32;

        for logical_block in start_block..end_block {
            allocate_file_block(
                self.device.as_ref(),
                &mut inode,
                &self.superblock,
                &mut self.block_groups,
                logical_block,
            )?;
        }

        write_file_range(self.device.as_ref(), &mut inode, &self.superblock, offset, data)
            .map_err(|_| "Failed to write file data")?;

        inode.update_timestamps(false, true, true);
        inode
            .write_to(self.device.as_ref(), inode_num, &self.superblock, &self.block_groups)
            .map_err(|_| "Failed to write inode")?;

        self.persist_block_groups()
    }

    /// Create a new directory entry named `name` under `parent`, allocating
    /// and initializing a fresh inode (§4.7 create_file).
    pub fn create_file(&mut self, parent: u32, name: &str, mode: u16, file_type: u8) -> Result<u32, &'static str> {
        let parent_inode = self.read_inode(parent)?;
        if !parent_inode.is_dir() {
            return Err("Parent is not a directory");
        }
        if self.lookup_in_dir(&parent_inode, name)?.is_some() {
            return Err("Entry already exists");
        }

        let inode_num = allocate_inode(self.device.as_ref(), &self.superblock, &mut self.block_groups)?;
        let is_dir = file_type == EXT2_FT_DIR;
        let mut new_inode = if is_dir {
            Ext2Inode::new_directory(mode)
        } else {
            Ext2Inode::new_regular_file(mode)
        };

        let mut reserved_data_block = None;
        if is_dir {
            let block_size = self.superblock.block_size();
            let data_block = allocate_block(self.device.as_ref(), &self.superblock, &mut self.block_groups)?;
            reserved_data_block = Some(data_block);
            let mut buf = alloc::vec![0u8; block_size];
            init_empty_block(&mut buf);
            create_entry(&mut buf, ".", inode_num, EXT2_FT_DIR);
            create_entry(&mut buf, "..", parent, EXT2_FT_DIR);
            write_ext2_block(self.device.as_ref(), data_block, block_size, &buf)
                .map_err(|_| "Failed to write directory block")?;

            let mut i_block = [0u32; 15];
            i_block[0] = data_block;
            new_inode.i_block = i_block;
            new_inode.i_size = block_size as u32;
            new_inode.i_blocks = (block_size / 512) as u32;
        }

        new_inode
            .write_to(self.device.as_ref(), inode_num, &self.superblock, &self.block_groups)
            .map_err(|_| "Failed to write new inode")?;

        if let Err(e) = self.add_directory_entry(parent, name, inode_num, file_type) {
            // Roll back the inode (and, for directories, the data block) this
            // operation reserved before returning the failure (§4.7).
            if let Some(data_block) = reserved_data_block {
                let _ = free_block(self.device.as_ref(), data_block, &self.superblock, &mut self.block_groups);
            }
            let _ = free_inode_bitmap(self.device.as_ref(), inode_num, &self.superblock, &mut self.block_groups);
            let _ = self.persist_block_groups();
            return Err(e);
        }
        self.persist_block_groups()?;
        Ok(inode_num)
    }

    /// Remove the entry named `name` from `parent`, freeing the target
    /// inode's storage once its link count reaches zero (§4.7 delete_file).
    pub fn delete_file(&mut self, parent: u32, name: &str) -> Result<(), &'static str> {
        let parent_inode = self.read_inode(parent)?;
        if !parent_inode.is_dir() {
            return Err("Parent is not a directory");
        }
        let target_num = self.lookup_in_dir(&parent_inode, name)?.ok_or("Entry not found")?;
        let target_inode = self.read_inode(target_num)?;

        if target_inode.is_dir() {
            let data = self.read_directory(&target_inode)?;
            let only_dots = parse_directory(&data).into_iter().all(|e| e.is_dot() || e.is_dotdot());
            if !only_dots {
                return Err("Directory not empty");
            }
        }

        self.remove_directory_entry(parent, name)?;

        // A directory starts with two links ("." and the parent's entry);
        // both vanish when it is deleted, so drop the count twice to reach
        // zero and trigger the free path inside decrement_inode_links.
        decrement_inode_links(self.device.as_ref(), target_num, &self.superblock, &mut self.block_groups)
            .map_err(|_| "Failed to decrement link count")?;
        if target_inode.is_dir() {
            decrement_inode_links(self.device.as_ref(), target_num, &self.superblock, &mut self.block_groups)
                .map_err(|_| "Failed to decrement link count")?;
        }

        self.persist_block_groups()
    }

    /// Insert `name -> target_inode` into `parent`'s directory data, trying
    /// each existing block before allocating a fresh one.
    fn add_directory_entry(
        &mut self,
        parent_num: u32,
        name: &str,
        target_inode: u32,
        file_type: u8,
    ) -> Result<(), &'static str> {
        let mut parent_inode = self.read_inode(parent_num)?;
        let block_size = self.superblock.block_size();
        let num_blocks = ((parent_inode.size() + block_size as u64 - 1) / block_size as u64) as u32;

        for logical_block in 0..num_blocks {
            let phys = get_block_num(self.device.as_ref(), &parent_inode, &self.superblock, logical_block)
                .map_err(|_| "I/O error reading directory block")?
                .ok_or("Directory has a sparse hole")?;
            let mut buf = alloc::vec![0u8; block_size];
            read_ext2_block(self.device.as_ref(), phys, block_size, &mut buf)
                .map_err(|_| "Failed to read directory block")?;
            if create_entry(&mut buf, name, target_inode, file_type) {
                write_ext2_block(self.device.as_ref(), phys, block_size, &buf)
                    .map_err(|_| "Failed to write directory block")?;
                parent_inode.update_timestamps(false, true, true);
                return parent_inode
                    .write_to(self.device.as_ref(), parent_num, &self.superblock, &self.block_groups)
                    .map_err(|_| "Failed to write parent inode");
            }
        }

        // No existing block had slack: grow the directory by one block.
        allocate_file_block(
            self.device.as_ref(),
            &mut parent_inode,
            &self.superblock,
            &mut self.block_groups,
            num_blocks,
        )?;
        let phys = get_block_num(self.device.as_ref(), &parent_inode, &self.superblock, num_blocks)
            .map_err(|_| "I/O error reading new directory block")?
            .ok_or("Newly allocated directory block vanished")?;

        let mut buf = alloc::vec![0u8; block_size];
        init_empty_block(&mut buf);
        create_entry(&mut buf, name, target_inode, file_type);
        write_ext2_block(self.device.as_ref(), phys, block_size, &buf)
            .map_err(|_| "Failed to write new directory block")?;

        parent_inode.i_size = (num_blocks as u64 + 1) as u32 * block_size as u32;
        parent_inode.update_timestamps(false, true, true);
        parent_inode
            .write_to(self.device.as_ref(), parent_num, &self.superblock, &self.block_groups)
            .map_err(|_| "Failed to write parent inode")
    }

    /// Merge `name`'s record out of `parent`'s directory data.
    fn remove_directory_entry(&mut self, parent_num: u32, name: &str) -> Result<(), &'static str> {
        let mut parent_inode = self.read_inode(parent_num)?;
        let block_size = self.superblock.block_size();
        let num_blocks = ((parent_inode.size() + block_size as u64 - 1) / block_size as u64) as u32;

        for logical_block in 0..num_blocks {
            let Some(phys) = get_block_num(self.device.as_ref(), &parent_inode, &self.superblock, logical_block)
                .map_err(|_| "I/O error reading directory block")?
            else {
                continue;
            };
            let mut buf = alloc::vec![0u8; block_size];
            read_ext2_block(self.device.as_ref(), phys, block_size, &mut buf)
                .map_err(|_| "Failed to read directory block")?;
            if remove_entry(&mut buf, name) {
                write_ext2_block(self.device.as_ref(), phys, block_size, &buf)
                    .map_err(|_| "Failed to write directory block")?;
                parent_inode.update_timestamps(false, true, true);
                return parent_inode
                    .write_to(self.device.as_ref(), parent_num, &self.superblock, &self.block_groups)
                    .map_err(|_| "Failed to write parent inode");
            }
        }

        Err("Entry not found in directory data")
    }

    /// Persist block group descriptors and the superblock's free-count
    /// fields, which allocate/free mutate in memory as they walk bitmaps.
    fn persist_block_groups(&mut self) -> Result<(), &'static str> {
        Ext2BlockGroupDesc::write_table(self.device.as_ref(), &self.superblock, &self.block_groups)
            .map_err(|_| "Failed to write block group descriptors")?;
        self.superblock
            .write_to(self.device.as_ref())
            .map_err(|_| "Failed to write superblock")
    }
}

/// Inodes in a freshly formatted single-group filesystem (§4.7 implementation
/// note). Small on purpose: this core only ever formats a RAM disk to host
/// the boot-time root directory, not a filesystem meant to hold many files.
const MKFS_INODES_PER_GROUP: u32 = 32;

/// One 1024-byte block bitmap addresses at most `1024 * 8` blocks; past that
/// a second block group would be needed, which `format` does not implement.
const MAX_SINGLE_GROUP_BLOCKS: u32 = 1024 * 8;

/// Format a fresh, empty single-block-group ext2 filesystem onto `device`:
/// block 0 reserved, block 1 superblock, block 2 the group descriptor
/// table, block 3 the block bitmap, block 4 the inode bitmap, blocks 5-8
/// the inode table (32 inodes x 128 bytes), block 9 the root directory's
/// sole data block, the rest free. Generalizes the layout
/// `tests::mkfs_ramdisk` hand-builds for unit tests to an arbitrary block
/// count.
pub fn format<B: BlockDevice + ?Sized>(device: &B, total_blocks: u32) -> Result<(), &'static str> {
    if total_blocks > MAX_SINGLE_GROUP_BLOCKS {
        return Err("too many blocks for a single-group filesystem");
    }
    if device.block_size() != 1024 {
        return Err("format() only supports 1024-byte blocks");
    }

    const INODE_SIZE: u32 = 128;
    const INODE_TABLE_START: u32 = 5;
    let block_size = device.block_size();
    let inode_table_blocks = (MKFS_INODES_PER_GROUP * INODE_SIZE + block_size as u32 - 1) / block_size as u32;
    let root_data_block = INODE_TABLE_START + inode_table_blocks;
    let first_free_block = root_data_block + 1;
    if first_free_block >= total_blocks {
        return Err("device too small to hold the fixed filesystem layout");
    }
    let free_blocks = total_blocks - first_free_block;
    let free_inodes = MKFS_INODES_PER_GROUP - 2; // inode 1 (bad) and inode 2 (root) are taken

    let mut sb_bytes = alloc::vec![0u8; 1024];
    sb_bytes[0..4].copy_from_slice(&MKFS_INODES_PER_GROUP.to_le_bytes()); // s_inodes_count
    sb_bytes[4..8].copy_from_slice(&total_blocks.to_le_bytes()); // s_blocks_count
    sb_bytes[12..16].copy_from_slice(&free_blocks.to_le_bytes()); // s_free_blocks_count
    sb_bytes[16..20].copy_from_slice(&free_inodes.to_le_bytes()); // s_free_inodes_count
    sb_bytes[20..24].copy_from_slice(&1u32.to_le_bytes()); // s_first_data_block
    sb_bytes[24..28].copy_from_slice(&0u32.to_le_bytes()); // s_log_block_size -> 1024
    sb_bytes[32..36].copy_from_slice(&total_blocks.to_le_bytes()); // s_blocks_per_group (single group)
    sb_bytes[40..44].copy_from_slice(&MKFS_INODES_PER_GROUP.to_le_bytes()); // s_inodes_per_group
    sb_bytes[56..58].copy_from_slice(&0xEF53u16.to_le_bytes()); // s_magic
    sb_bytes[76..80].copy_from_slice(&0u32.to_le_bytes()); // s_rev_level 0 -> 128-byte inodes
    let sb = Ext2Superblock::from_bytes(&sb_bytes).ok_or("failed to build superblock")?;
    sb.write_to(device).map_err(|_| "failed to write superblock")?;

    let mut bg_bytes = [0u8; 32];
    bg_bytes[0..4].copy_from_slice(&3u32.to_le_bytes()); // block_bitmap
    bg_bytes[4..8].copy_from_slice(&4u32.to_le_bytes()); // inode_bitmap
    bg_bytes[8..12].copy_from_slice(&INODE_TABLE_START.to_le_bytes()); // inode_table
    bg_bytes[12..14].copy_from_slice(&(free_blocks as u16).to_le_bytes());
    bg_bytes[14..16].copy_from_slice(&(free_inodes as u16).to_le_bytes());
    let groups =
        alloc::vec![unsafe { core::ptr::read_unaligned(bg_bytes.as_ptr() as *const Ext2BlockGroupDesc) }];
    Ext2BlockGroupDesc::write_table(device, &sb, &groups).map_err(|_| "failed to write block group descriptors")?;

    let mut block_bitmap = alloc::vec![0u8; block_size];
    for i in 0..first_free_block as usize {
        block_bitmap[i / 8] |= 1 << (i % 8);
    }
    device.write_block(3, &block_bitmap).map_err(|_| "failed to write block bitmap")?;

    let mut inode_bitmap = alloc::vec![0u8; block_size];
    inode_bitmap[0] = 0x03; // inode 1 (bad) and inode 2 (root)
    device.write_block(4, &inode_bitmap).map_err(|_| "failed to write inode bitmap")?;

    let mut root_inode = Ext2Inode::new_directory(0o755);
    let mut i_block = [0u32; 15];
    i_block[0] = root_data_block;
    root_inode.i_block = i_block;
    root_inode.i_size = block_size as u32;
    root_inode.i_blocks = (block_size / 512) as u32;
    root_inode
        .write_to(device, EXT2_ROOT_INO, &sb, &groups)
        .map_err(|_| "failed to write root inode")?;

    let mut root_data = alloc::vec![0u8; block_size];
    init_empty_block(&mut root_data);
    create_entry(&mut root_data, ".", EXT2_ROOT_INO, EXT2_FT_DIR);
    create_entry(&mut root_data, "..", EXT2_ROOT_INO, EXT2_FT_DIR);
    device
        .write_block(root_data_block as u64, &root_data)
        .map_err(|_| "failed to write root directory block")?;

    Ok(())
}

/// Format a fresh in-memory disk of `num_blocks` 1024-byte blocks and mount
/// it as the root filesystem. This core has no real disk driver, so boot
/// always formats a blank [`crate::block::ram::RamDisk`] rather than
/// reading a persisted image (§4.7 implementation note, §2 data-flow order).
pub fn init_ramdisk_root(num_blocks: u64) -> Result<(), &'static str> {
    let disk = crate::block::ram::RamDisk::new(1024, num_blocks);
    format(&disk, num_blocks as u32)?;
    init_root_fs(Arc::new(disk))
}

/// Global mounted ext2 root filesystem
static ROOT_EXT2: Mutex<Option<Ext2Fs>> = Mutex::new(None);

/// Initialize the root ext2 filesystem
///
/// Mounts `device` as the root filesystem. The concrete block device
/// (VirtIO, AHCI, NVMe, ...) is chosen and handed in by kernel bringup;
/// this core only needs it to implement [`BlockDevice`].
pub fn init_root_fs(device: Arc<dyn BlockDevice>) -> Result<(), &'static str> {
    // Create the ext2 filesystem instance
    let fs = Ext2Fs::new(device, 0)?;

    // Read packed struct fields safely before logging
    let blocks_count = unsafe {
        core::ptr::read_unaligned(core::ptr::addr_of!(fs.superblock.s_blocks_count))
    };
    let inodes_count = unsafe {
        core::ptr::read_unaligned(core::ptr::addr_of!(fs.superblock.s_inodes_count))
    };
    log::info!(
        "ext2: Mounted root filesystem - {} blocks, {} inodes, block size {}",
        blocks_count,
        inodes_count,
        fs.superblock.block_size()
    );

    // Store globally
    *ROOT_EXT2.lock() = Some(fs);

    Ok(())
}

/// Access the root ext2 filesystem
///
/// Returns None if the filesystem hasn't been initialized yet.
pub fn root_fs() -> spin::MutexGuard<'static, Option<Ext2Fs>> {
    ROOT_EXT2.lock()
}

/// Check if the root filesystem is mounted
pub fn is_mounted() -> bool {
    ROOT_EXT2.lock().is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::ram::RamDisk;
    use alloc::vec;

    fn make_bg(block_bitmap: u32, inode_bitmap: u32, inode_table: u32, free_blocks: u16, free_inodes: u16) -> Ext2BlockGroupDesc {
        let mut bg = [0u8; 32];
        bg[0..4].copy_from_slice(&block_bitmap.to_le_bytes());
        bg[4..8].copy_from_slice(&inode_bitmap.to_le_bytes());
        bg[8..12].copy_from_slice(&inode_table.to_le_bytes());
        bg[12..14].copy_from_slice(&free_blocks.to_le_bytes());
        bg[14..16].copy_from_slice(&free_inodes.to_le_bytes());
        unsafe { core::ptr::read_unaligned(bg.as_ptr() as *const Ext2BlockGroupDesc) }
    }

    /// Format a tiny one-group, 1024-byte-block filesystem on a `RamDisk`:
    /// block 0 reserved, block 1 superblock, block 2 the (one-entry) group
    /// descriptor table, block 3 the block bitmap, block 4 the inode
    /// bitmap, blocks 5-8 the inode table (32 inodes x 128 bytes), block 9
    /// the root directory's sole data block, blocks 10-63 free.
    fn mkfs_ramdisk() -> Ext2Fs {
        let block_size = 1024usize;
        let total_blocks = 64u32;
        let inodes_per_group = 32u32;

        let disk = RamDisk::new(block_size, total_blocks as u64);

        let mut sb_bytes = vec![0u8; 1024];
        sb_bytes[0..4].copy_from_slice(&inodes_per_group.to_le_bytes()); // s_inodes_count
        sb_bytes[4..8].copy_from_slice(&total_blocks.to_le_bytes()); // s_blocks_count
        sb_bytes[12..16].copy_from_slice(&54u32.to_le_bytes()); // s_free_blocks_count
        sb_bytes[16..20].copy_from_slice(&30u32.to_le_bytes()); // s_free_inodes_count
        sb_bytes[20..24].copy_from_slice(&1u32.to_le_bytes()); // s_first_data_block
        sb_bytes[24..28].copy_from_slice(&0u32.to_le_bytes()); // s_log_block_size -> 1024
        sb_bytes[32..36].copy_from_slice(&total_blocks.to_le_bytes()); // s_blocks_per_group
        sb_bytes[40..44].copy_from_slice(&inodes_per_group.to_le_bytes()); // s_inodes_per_group
        sb_bytes[56..58].copy_from_slice(&0xEF53u16.to_le_bytes()); // s_magic
        sb_bytes[76..80].copy_from_slice(&0u32.to_le_bytes()); // s_rev_level 0 -> 128-byte inodes
        let sb = Ext2Superblock::from_bytes(&sb_bytes).unwrap();
        sb.write_to(&disk).unwrap();

        let groups = vec![make_bg(3, 4, 5, 54, 30)];
        Ext2BlockGroupDesc::write_table(&disk, &sb, &groups).unwrap();

        let mut block_bitmap = vec![0u8; block_size];
        block_bitmap[0] = 0xFF; // blocks 0-7
        block_bitmap[1] = 0x03; // blocks 8-9
        disk.write_block(3, &block_bitmap).unwrap();

        let mut inode_bitmap = vec![0u8; block_size];
        inode_bitmap[0] = 0x03; // inode 1 (bad) and inode 2 (root)
        disk.write_block(4, &inode_bitmap).unwrap();

        let root_inode = Ext2Inode::new_directory(0o755);
        let mut i_block = [0u32; 15];
        i_block[0] = 9;
        let mut root_inode = root_inode;
        root_inode.i_block = i_block;
        root_inode.i_size = block_size as u32;
        root_inode.i_blocks = (block_size / 512) as u32;
        root_inode.write_to(&disk, EXT2_ROOT_INO, &sb, &groups).unwrap();

        let mut root_data = vec![0u8; block_size];
        init_empty_block(&mut root_data);
        create_entry(&mut root_data, ".", EXT2_ROOT_INO, EXT2_FT_DIR);
        create_entry(&mut root_data, "..", EXT2_ROOT_INO, EXT2_FT_DIR);
        disk.write_block(9, &root_data).unwrap();

        let device: Arc<dyn BlockDevice> = Arc::new(disk);
        Ext2Fs::new(device, 0).unwrap()
    }

    #[test]
    fn test_create_write_read_round_trip() {
        let mut fs = mkfs_ramdisk();
        let inode_num = fs
            .create_file(EXT2_ROOT_INO, "hello.txt", 0o644, EXT2_FT_REG_FILE)
            .unwrap();

        fs.write_file(inode_num, 0, b"hello world").unwrap();

        let inode = fs.read_inode(inode_num).unwrap();
        assert_eq!(inode.size(), 11);
        let data = fs.read_file_content(&inode).unwrap();
        assert_eq!(&data, b"hello world");
    }

    #[test]
    fn test_write_past_eof_grows_size() {
        let mut fs = mkfs_ramdisk();
        let inode_num = fs
            .create_file(EXT2_ROOT_INO, "grow.txt", 0o644, EXT2_FT_REG_FILE)
            .unwrap();

        fs.write_file(inode_num, 0, b"abc").unwrap();
        fs.write_file(inode_num, 3, b"def").unwrap();

        let inode = fs.read_inode(inode_num).unwrap();
        assert_eq!(inode.size(), 6);
        let data = fs.read_file_content(&inode).unwrap();
        assert_eq!(&data, b"abcdef");
    }

    #[test]
    fn test_write_allocates_single_indirect_block() {
        let mut fs = mkfs_ramdisk();
        let inode_num = fs
            .create_file(EXT2_ROOT_INO, "big.txt", 0o644, EXT2_FT_REG_FILE)
            .unwrap();

        // 12 direct blocks cover bytes [0, 12288); this offset lands in the
        // 13th logical block, which must come from the single indirect.
        let offset = 12 * 1024u64;
        fs.write_file(inode_num, offset, b"past direct blocks").unwrap();

        let inode = fs.read_inode(inode_num).unwrap();
        let single_indirect = unsafe { core::ptr::read_unaligned(core::ptr::addr_of!(inode.i_block[12])) };
        assert_ne!(single_indirect, 0, "single indirect pointer should be populated");
        let data = fs.read_file_range(&inode, offset, 19).unwrap();
        assert_eq!(&data, b"past direct blocks");
    }

    #[test]
    fn test_create_file_rejects_duplicate_name() {
        let mut fs = mkfs_ramdisk();
        fs.create_file(EXT2_ROOT_INO, "dup.txt", 0o644, EXT2_FT_REG_FILE).unwrap();
        assert!(fs.create_file(EXT2_ROOT_INO, "dup.txt", 0o644, EXT2_FT_REG_FILE).is_err());
    }

    #[test]
    fn test_create_and_delete_empty_directory() {
        let mut fs = mkfs_ramdisk();
        let root = fs.read_inode(EXT2_ROOT_INO).unwrap();

        let dir_num = fs.create_file(EXT2_ROOT_INO, "sub", 0o755, EXT2_FT_DIR).unwrap();
        assert!(fs.lookup_in_dir(&root, "sub").unwrap().is_some());

        fs.delete_file(EXT2_ROOT_INO, "sub").unwrap();
        let root = fs.read_inode(EXT2_ROOT_INO).unwrap();
        assert!(fs.lookup_in_dir(&root, "sub").unwrap().is_none());

        // The inode is gone: its link count hit zero and it was freed.
        assert!(fs.read_inode(dir_num).is_err() || {
            let freed = fs.read_inode(dir_num).unwrap();
            freed.i_links_count == 0
        });
    }

    #[test]
    fn test_delete_nonempty_directory_fails() {
        let mut fs = mkfs_ramdisk();
        let dir_num = fs.create_file(EXT2_ROOT_INO, "sub", 0o755, EXT2_FT_DIR).unwrap();
        fs.create_file(dir_num, "f.txt", 0o644, EXT2_FT_REG_FILE).unwrap();

        assert!(fs.delete_file(EXT2_ROOT_INO, "sub").is_err());
    }

    #[test]
    fn test_format_produces_mountable_root_with_empty_directory() {
        let disk = RamDisk::new(1024, 128);
        format(&disk, 128).unwrap();
        let device: Arc<dyn BlockDevice> = Arc::new(disk);
        let fs = Ext2Fs::new(device, 0).unwrap();

        let root = fs.read_inode(EXT2_ROOT_INO).unwrap();
        assert!(root.is_dir());
        let entries = parse_directory(&fs.read_directory(&root).unwrap());
        assert_eq!(entries.len(), 2); // "." and ".."
    }

    #[test]
    fn test_format_rejects_device_too_small() {
        let disk = RamDisk::new(1024, 8);
        assert!(format(&disk, 8).is_err());
    }

    #[test]
    fn test_format_rejects_too_many_blocks_for_single_group() {
        let disk = RamDisk::new(1024, 64);
        assert!(format(&disk, MAX_SINGLE_GROUP_BLOCKS + 1).is_err());
    }

    #[test]
    fn test_delete_file_removes_entry_and_frees_inode() {
        let mut fs = mkfs_ramdisk();
        let file_num = fs
            .create_file(EXT2_ROOT_INO, "gone.txt", 0o644, EXT2_FT_REG_FILE)
            .unwrap();
        fs.write_file(file_num, 0, b"data").unwrap();

        fs.delete_file(EXT2_ROOT_INO, "gone.txt").unwrap();

        let root = fs.read_inode(EXT2_ROOT_INO).unwrap();
        assert!(fs.lookup_in_dir(&root, "gone.txt").unwrap().is_none());
    }
}
