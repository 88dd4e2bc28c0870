//! 测试用 FAT32 卷镜像构造器

use crate::block::mock::MockDevice;
use crate::block::RamDisk;
use crate::consts::*;
use crate::types::{BiosParameterBlock, FatDirEntry};
use alloc::vec;
use alloc::vec::Vec;
use byteorder::{ByteOrder, LittleEndian};

pub(crate) const RESERVED_SECTORS: u16 = 32;
pub(crate) const SECTORS_PER_FAT: u32 = 8;
pub(crate) const ROOT_CLUSTER: u32 = 2;

/// 内存中的 FAT32 卷：每簇 1 扇区，两个 FAT，根目录在簇 2
pub(crate) struct VolumeImage {
    pub bytes: Vec<u8>,
    pub part_start: u64,
    pub bpb: BiosParameterBlock,
}

impl VolumeImage {
    /// `disk_sectors` 是整个磁盘的大小，卷占据 `part_start` 之后的所有扇区
    pub fn new(part_start: u64, disk_sectors: u32) -> Self {
        let volume_sectors = disk_sectors - part_start as u32;
        let bpb = BiosParameterBlock {
            bytes_per_sector: SECTOR_SIZE as u16,
            sectors_per_cluster: 1,
            reserved_sectors: RESERVED_SECTORS,
            fat_count: 2,
            media_descriptor: 0xF8,
            hidden_sectors: part_start as u32,
            total_sectors_32: volume_sectors,
            sectors_per_fat_32: SECTORS_PER_FAT,
            root_cluster: ROOT_CLUSTER,
            signature: 0x29,
            volume_label: *b"NANOSHELL  ",
            system_id: *b"FAT32   ",
            ..BiosParameterBlock::default()
        };

        let mut image = Self {
            bytes: vec![0u8; disk_sectors as usize * SECTOR_SIZE],
            part_start,
            bpb,
        };
        let boot = part_start as usize * SECTOR_SIZE;
        bpb.write_to(&mut image.bytes[boot..boot + SECTOR_SIZE]).unwrap();
        image.set_fat(0, 0x0FFF_FFF8);
        image.set_fat(1, FAT_END_OF_CHAIN_MARK);
        image.set_fat(ROOT_CLUSTER, FAT_END_OF_CHAIN_MARK);
        image
    }

    pub fn fat_begin(&self) -> u64 {
        self.part_start + RESERVED_SECTORS as u64
    }

    pub fn data_lba(&self, cluster: u32) -> u64 {
        self.fat_begin() + 2 * SECTORS_PER_FAT as u64 + (cluster - 2) as u64
    }

    pub fn set_fat(&mut self, cluster: u32, value: u32) {
        let off = self.fat_begin() as usize * SECTOR_SIZE + cluster as usize * 4;
        LittleEndian::write_u32(&mut self.bytes[off..], value);
    }

    pub fn fat(&self, cluster: u32) -> u32 {
        let off = self.fat_begin() as usize * SECTOR_SIZE + cluster as usize * 4;
        LittleEndian::read_u32(&self.bytes[off..])
    }

    /// 把簇链 `clusters` 写入 FAT
    pub fn link(&mut self, clusters: &[u32]) {
        for pair in clusters.windows(2) {
            self.set_fat(pair[0], pair[1]);
        }
        if let Some(&last) = clusters.last() {
            self.set_fat(last, FAT_END_OF_CHAIN_MARK);
        }
    }

    /// 在目录簇 `dir_cluster` 的第 `index` 项写入目录项
    pub fn put_entry(&mut self, dir_cluster: u32, index: usize, entry: &FatDirEntry) {
        let off = self.data_lba(dir_cluster) as usize * SECTOR_SIZE + index * FAT_DIR_ENTRY_SIZE;
        self.bytes[off..off + FAT_DIR_ENTRY_SIZE].copy_from_slice(&entry.to_bytes());
    }

    pub fn entry(&self, dir_cluster: u32, index: usize) -> FatDirEntry {
        let off = self.data_lba(dir_cluster) as usize * SECTOR_SIZE + index * FAT_DIR_ENTRY_SIZE;
        let mut raw = [0u8; FAT_DIR_ENTRY_SIZE];
        raw.copy_from_slice(&self.bytes[off..off + FAT_DIR_ENTRY_SIZE]);
        FatDirEntry::from_bytes(&raw)
    }

    pub fn fill_cluster(&mut self, cluster: u32, byte: u8) {
        let off = self.data_lba(cluster) as usize * SECTOR_SIZE;
        self.bytes[off..off + SECTOR_SIZE].fill(byte);
    }

    pub fn into_device(self) -> MockDevice {
        MockDevice::from_disk(RamDisk::from_image(self.bytes))
    }
}

/// 一个常用的小卷：
///
/// ```text
/// /            簇 2
/// ├── HELLO.TXT  簇 3 -> 4，700 字节（簇 3 全是 'a'，簇 4 全是 'b'）
/// ├── EMPTY.DAT  无簇，0 字节
/// └── SUB/       簇 5
///     ├── .      簇 5
///     ├── ..     簇 0（根目录）
///     └── note.txt 簇 6，5 字节（名称小写标志）
/// ```
pub(crate) fn sample_volume(part_start: u64, disk_sectors: u32) -> VolumeImage {
    use crate::types::FatAttributes;

    let mut image = VolumeImage::new(part_start, disk_sectors);

    let mut hello = FatDirEntry::synthetic("HELLO.TXT", FatAttributes::ARCHIVE, 3);
    hello.file_size = 700;
    image.put_entry(ROOT_CLUSTER, 0, &FatDirEntry::synthetic("NANOSHELL", FatAttributes::VOLUME_ID, 0));
    image.put_entry(ROOT_CLUSTER, 1, &hello);
    image.put_entry(ROOT_CLUSTER, 2, &FatDirEntry::synthetic("EMPTY.DAT", FatAttributes::ARCHIVE, 0));
    image.put_entry(ROOT_CLUSTER, 3, &FatDirEntry::synthetic("SUB", FatAttributes::DIRECTORY, 5));
    image.link(&[3, 4]);
    image.fill_cluster(3, b'a');
    image.fill_cluster(4, b'b');

    let mut dot = FatDirEntry::synthetic("X", FatAttributes::DIRECTORY, 5);
    dot.name = *b".       ";
    let mut dotdot = FatDirEntry::synthetic("X", FatAttributes::DIRECTORY, 0);
    dotdot.name = *b"..      ";
    let mut note = FatDirEntry::synthetic("NOTE.TXT", FatAttributes::ARCHIVE, 6);
    note.nt_flags = FAT_MSFLAGS_NAMELOWER | FAT_MSFLAGS_EXTLOWER;
    note.file_size = 5;
    image.put_entry(5, 0, &dot);
    image.put_entry(5, 1, &dotdot);
    image.put_entry(5, 2, &note);
    image.link(&[5]);
    image.link(&[6]);
    let off = image.data_lba(6) as usize * SECTOR_SIZE;
    image.bytes[off..off + 5].copy_from_slice(b"hello");

    image
}
