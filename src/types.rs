//! 磁盘格式数据结构
//!
//! 这个模块包含了直接对应磁盘格式的数据结构：BIOS 参数块、32 字节目录项和 MBR 分区表。
//!
//! ## 设计原则
//!
//! 1. **显式解析** - 所有字段通过 `byteorder` 按小端从字节切片读取，不做指针重解释
//! 2. **内存表示** - 解析后的结构体只保存本 crate 使用的字段
//! 3. **辅助方法** - 提供 Rust 风格的访问器和工具函数

use crate::consts::*;
use crate::error::{Error, ErrorKind, Result};
use alloc::string::String;
use bitflags::bitflags;
use byteorder::{ByteOrder, LittleEndian};

//=============================================================================
// BIOS 参数块
//=============================================================================

/// BIOS 参数块（含 FAT32 扩展引导记录）
///
/// 字段偏移与 FAT32 规范一致，位于分区第 0 扇区。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BiosParameterBlock {
    pub bytes_per_sector: u16,      // 11
    pub sectors_per_cluster: u8,    // 13
    pub reserved_sectors: u16,      // 14: FAT 之前的扇区数
    pub fat_count: u8,              // 16: 只使用第一个 FAT
    pub dir_entries: u16,           // 17
    pub total_sectors_16: u16,      // 19
    pub media_descriptor: u8,       // 21
    pub sectors_per_fat_16: u16,    // 22
    pub sectors_per_track: u16,     // 24
    pub heads: u16,                 // 26
    pub hidden_sectors: u32,        // 28
    pub total_sectors_32: u32,      // 32

    // 扩展引导记录
    pub sectors_per_fat_32: u32,    // 36
    pub flags: u16,                 // 40
    pub fat_version: u16,           // 42
    pub root_cluster: u32,          // 44
    pub fs_info_sector: u16,        // 48
    pub backup_boot_sector: u16,    // 50
    pub drive_number: u8,           // 64
    pub windows_flags: u8,          // 65
    pub signature: u8,              // 66
    pub volume_id: u32,             // 67
    pub volume_label: [u8; 11],     // 71
    pub system_id: [u8; 8],         // 82
}

/// BPB 解析所需的最小字节数
pub const BPB_MIN_SIZE: usize = 90;

impl BiosParameterBlock {
    /// 从引导扇区解析 BPB
    ///
    /// # 错误
    ///
    /// 缓冲区不足 90 字节时返回 `InvalidInput`
    pub fn parse(sector: &[u8]) -> Result<Self> {
        if sector.len() < BPB_MIN_SIZE {
            return Err(Error::new(ErrorKind::InvalidInput, "Boot sector buffer too small"));
        }

        let mut volume_label = [0u8; 11];
        volume_label.copy_from_slice(&sector[71..82]);
        let mut system_id = [0u8; 8];
        system_id.copy_from_slice(&sector[82..90]);

        Ok(Self {
            bytes_per_sector: LittleEndian::read_u16(&sector[11..]),
            sectors_per_cluster: sector[13],
            reserved_sectors: LittleEndian::read_u16(&sector[14..]),
            fat_count: sector[16],
            dir_entries: LittleEndian::read_u16(&sector[17..]),
            total_sectors_16: LittleEndian::read_u16(&sector[19..]),
            media_descriptor: sector[21],
            sectors_per_fat_16: LittleEndian::read_u16(&sector[22..]),
            sectors_per_track: LittleEndian::read_u16(&sector[24..]),
            heads: LittleEndian::read_u16(&sector[26..]),
            hidden_sectors: LittleEndian::read_u32(&sector[28..]),
            total_sectors_32: LittleEndian::read_u32(&sector[32..]),
            sectors_per_fat_32: LittleEndian::read_u32(&sector[36..]),
            flags: LittleEndian::read_u16(&sector[40..]),
            fat_version: LittleEndian::read_u16(&sector[42..]),
            root_cluster: LittleEndian::read_u32(&sector[44..]),
            fs_info_sector: LittleEndian::read_u16(&sector[48..]),
            backup_boot_sector: LittleEndian::read_u16(&sector[50..]),
            drive_number: sector[64],
            windows_flags: sector[65],
            signature: sector[66],
            volume_id: LittleEndian::read_u32(&sector[67..]),
            volume_label,
            system_id,
        })
    }

    /// 将 BPB 写回引导扇区缓冲区（只覆盖 BPB 字段）
    pub fn write_to(&self, sector: &mut [u8]) -> Result<()> {
        if sector.len() < BPB_MIN_SIZE {
            return Err(Error::new(ErrorKind::InvalidInput, "Boot sector buffer too small"));
        }

        LittleEndian::write_u16(&mut sector[11..], self.bytes_per_sector);
        sector[13] = self.sectors_per_cluster;
        LittleEndian::write_u16(&mut sector[14..], self.reserved_sectors);
        sector[16] = self.fat_count;
        LittleEndian::write_u16(&mut sector[17..], self.dir_entries);
        LittleEndian::write_u16(&mut sector[19..], self.total_sectors_16);
        sector[21] = self.media_descriptor;
        LittleEndian::write_u16(&mut sector[22..], self.sectors_per_fat_16);
        LittleEndian::write_u16(&mut sector[24..], self.sectors_per_track);
        LittleEndian::write_u16(&mut sector[26..], self.heads);
        LittleEndian::write_u32(&mut sector[28..], self.hidden_sectors);
        LittleEndian::write_u32(&mut sector[32..], self.total_sectors_32);
        LittleEndian::write_u32(&mut sector[36..], self.sectors_per_fat_32);
        LittleEndian::write_u16(&mut sector[40..], self.flags);
        LittleEndian::write_u16(&mut sector[42..], self.fat_version);
        LittleEndian::write_u32(&mut sector[44..], self.root_cluster);
        LittleEndian::write_u16(&mut sector[48..], self.fs_info_sector);
        LittleEndian::write_u16(&mut sector[50..], self.backup_boot_sector);
        sector[64] = self.drive_number;
        sector[65] = self.windows_flags;
        sector[66] = self.signature;
        LittleEndian::write_u32(&mut sector[67..], self.volume_id);
        sector[71..82].copy_from_slice(&self.volume_label);
        sector[82..90].copy_from_slice(&self.system_id);
        Ok(())
    }

    /// 系统标识是否为 "FAT32"
    pub fn is_fat32(&self) -> bool {
        &self.system_id[..FAT32_SYSTEM_ID.len()] == FAT32_SYSTEM_ID
    }

    /// 校验 BPB 是否描述了本 crate 支持的 FAT32 卷
    pub fn validate(&self) -> Result<()> {
        if !self.is_fat32() {
            return Err(Error::new(ErrorKind::Unsupported, "Not a FAT32 volume"));
        }
        if self.bytes_per_sector as usize != SECTOR_SIZE {
            return Err(Error::new(ErrorKind::Unsupported, "Only 512-byte sectors are supported"));
        }
        if self.sectors_per_cluster == 0 || !self.sectors_per_cluster.is_power_of_two() {
            return Err(Error::new(ErrorKind::Corrupted, "Invalid sectors per cluster"));
        }
        if self.fat_count == 0 {
            return Err(Error::new(ErrorKind::Corrupted, "Volume has no FAT"));
        }
        if self.sectors_per_fat_32 == 0 {
            return Err(Error::new(ErrorKind::Corrupted, "FAT size is zero"));
        }
        if self.root_cluster < FAT_FIRST_DATA_CLUSTER {
            return Err(Error::new(ErrorKind::Corrupted, "Invalid root directory cluster"));
        }
        Ok(())
    }

    /// 卷总扇区数
    pub fn total_sectors(&self) -> u32 {
        if self.total_sectors_16 != 0 {
            self.total_sectors_16 as u32
        } else {
            self.total_sectors_32
        }
    }

    /// 簇大小（字节）
    pub fn cluster_size(&self) -> usize {
        self.sectors_per_cluster as usize * SECTOR_SIZE
    }
}

//=============================================================================
// 目录项
//=============================================================================

bitflags! {
    /// 目录项属性
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FatAttributes: u8 {
        /// 只读
        const READ_ONLY = 1 << 0;
        /// 隐藏
        const HIDDEN    = 1 << 1;
        /// 系统
        const SYSTEM    = 1 << 2;
        /// 卷标（根目录中名称等于卷 ID 的特殊文件）
        const VOLUME_ID = 1 << 3;
        /// 目录
        const DIRECTORY = 1 << 4;
        /// 归档
        const ARCHIVE   = 1 << 5;
        /// 长文件名条目
        const LFN = Self::READ_ONLY.bits() | Self::HIDDEN.bits()
                  | Self::SYSTEM.bits() | Self::VOLUME_ID.bits();
    }
}

/// 32 字节 FAT 目录项
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FatDirEntry {
    pub name: [u8; 8],              // 0
    pub ext: [u8; 3],               // 8
    pub attributes: FatAttributes,  // 11
    pub nt_flags: u8,               // 12: 名称/扩展名小写标志
    pub create_time_tenth: u8,      // 13
    pub create_time: u16,           // 14
    pub create_date: u16,           // 16
    pub access_date: u16,           // 18
    pub cluster_high: u16,          // 20
    pub mod_time: u16,              // 22
    pub mod_date: u16,              // 24
    pub cluster_low: u16,           // 26
    pub file_size: u32,             // 28
}

impl FatDirEntry {
    /// 从 32 字节解析目录项
    pub fn from_bytes(raw: &[u8; FAT_DIR_ENTRY_SIZE]) -> Self {
        let mut name = [0u8; 8];
        name.copy_from_slice(&raw[0..8]);
        let mut ext = [0u8; 3];
        ext.copy_from_slice(&raw[8..11]);

        Self {
            name,
            ext,
            attributes: FatAttributes::from_bits_retain(raw[11]),
            nt_flags: raw[12],
            create_time_tenth: raw[13],
            create_time: LittleEndian::read_u16(&raw[14..]),
            create_date: LittleEndian::read_u16(&raw[16..]),
            access_date: LittleEndian::read_u16(&raw[18..]),
            cluster_high: LittleEndian::read_u16(&raw[20..]),
            mod_time: LittleEndian::read_u16(&raw[22..]),
            mod_date: LittleEndian::read_u16(&raw[24..]),
            cluster_low: LittleEndian::read_u16(&raw[26..]),
            file_size: LittleEndian::read_u32(&raw[28..]),
        }
    }

    /// 序列化为 32 字节
    pub fn to_bytes(&self) -> [u8; FAT_DIR_ENTRY_SIZE] {
        let mut raw = [0u8; FAT_DIR_ENTRY_SIZE];
        raw[0..8].copy_from_slice(&self.name);
        raw[8..11].copy_from_slice(&self.ext);
        raw[11] = self.attributes.bits();
        raw[12] = self.nt_flags;
        raw[13] = self.create_time_tenth;
        LittleEndian::write_u16(&mut raw[14..], self.create_time);
        LittleEndian::write_u16(&mut raw[16..], self.create_date);
        LittleEndian::write_u16(&mut raw[18..], self.access_date);
        LittleEndian::write_u16(&mut raw[20..], self.cluster_high);
        LittleEndian::write_u16(&mut raw[22..], self.mod_time);
        LittleEndian::write_u16(&mut raw[24..], self.mod_date);
        LittleEndian::write_u16(&mut raw[26..], self.cluster_low);
        LittleEndian::write_u32(&mut raw[28..], self.file_size);
        raw
    }

    /// 构造一个合成目录项（用于根目录自举）
    ///
    /// `name` 按 8.3 规则截断并以空格填充，全部转为大写。
    pub fn synthetic(name: &str, attributes: FatAttributes, first_cluster: u32) -> Self {
        let mut entry = Self {
            name: [b' '; 8],
            ext: [b' '; 3],
            attributes,
            ..Self::default()
        };

        let (base, ext) = match name.rsplit_once('.') {
            Some((base, ext)) if !base.is_empty() => (base, ext),
            _ => (name, ""),
        };
        for (dst, src) in entry.name.iter_mut().zip(base.bytes()) {
            *dst = src.to_ascii_uppercase();
        }
        for (dst, src) in entry.ext.iter_mut().zip(ext.bytes()) {
            *dst = src.to_ascii_uppercase();
        }

        entry.set_first_cluster(first_cluster);
        entry
    }

    /// 起始簇号
    pub fn first_cluster(&self) -> u32 {
        ((self.cluster_high as u32) << 16 | self.cluster_low as u32) & FAT32_ENTRY_MASK
    }

    /// 设置起始簇号
    pub fn set_first_cluster(&mut self, cluster: u32) {
        self.cluster_high = (cluster >> 16) as u16;
        self.cluster_low = cluster as u16;
    }

    /// 是否为目录结束标记
    pub fn is_end(&self) -> bool {
        self.name[0] == FAT_DIR_ENTRY_END
    }

    /// 是否为已删除（空闲）目录项
    pub fn is_deleted(&self) -> bool {
        self.name[0] == FAT_DIR_ENTRY_DELETED
    }

    /// 是否为长文件名条目
    pub fn is_lfn(&self) -> bool {
        self.attributes.contains(FatAttributes::LFN)
    }

    /// 是否为卷标
    pub fn is_volume_id(&self) -> bool {
        !self.is_lfn() && self.attributes.contains(FatAttributes::VOLUME_ID)
    }

    /// 是否为目录
    pub fn is_directory(&self) -> bool {
        self.attributes.contains(FatAttributes::DIRECTORY)
    }

    /// 是否为 "." 或 ".." 条目
    pub fn is_dot_entry(&self) -> bool {
        self.name[0] == b'.'
    }

    /// 8.3 短文件名
    ///
    /// 按 NT 标志位转换大小写；首字节 0x05 表示真实首字节为 0xE5。
    pub fn short_name(&self) -> String {
        let mut name = String::new();

        let base_lower = self.nt_flags & FAT_MSFLAGS_NAMELOWER != 0;
        let ext_lower = self.nt_flags & FAT_MSFLAGS_EXTLOWER != 0;

        let base_len = self.name.iter().rposition(|&c| c != b' ').map_or(0, |p| p + 1);
        for (i, &c) in self.name[..base_len].iter().enumerate() {
            let c = if i == 0 && c == 0x05 { FAT_DIR_ENTRY_DELETED } else { c };
            name.push(decode_name_byte(c, base_lower));
        }

        let ext_len = self.ext.iter().rposition(|&c| c != b' ').map_or(0, |p| p + 1);
        if ext_len > 0 {
            name.push('.');
            for &c in &self.ext[..ext_len] {
                name.push(decode_name_byte(c, ext_lower));
            }
        }

        name
    }

    /// 与给定名称比较（不区分大小写）
    pub fn matches_name(&self, name: &str) -> bool {
        self.short_name().eq_ignore_ascii_case(name)
    }
}

fn decode_name_byte(c: u8, lower: bool) -> char {
    if lower {
        c.to_ascii_lowercase() as char
    } else {
        c as char
    }
}

//=============================================================================
// MBR
//=============================================================================

/// MBR 分区表项
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MbrPartition {
    pub boot_indicator: u8,
    pub partition_type: u8,
    pub start_lba: u32,
    pub size_sectors: u32,
}

impl MbrPartition {
    fn parse(raw: &[u8]) -> Self {
        Self {
            boot_indicator: raw[0],
            partition_type: raw[4],
            start_lba: LittleEndian::read_u32(&raw[8..]),
            size_sectors: LittleEndian::read_u32(&raw[12..]),
        }
    }

    fn write_to(&self, raw: &mut [u8]) {
        raw[0] = self.boot_indicator;
        raw[4] = self.partition_type;
        LittleEndian::write_u32(&mut raw[8..], self.start_lba);
        LittleEndian::write_u32(&mut raw[12..], self.size_sectors);
    }

    /// 是否为 FAT32 分区类型（0x0B / 0x0C）
    pub fn is_fat32(&self) -> bool {
        matches!(self.partition_type, PART_TYPE_FAT32_CHS | PART_TYPE_FAT32_LBA)
    }
}

/// 主引导记录
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MasterBootRecord {
    pub partitions: [MbrPartition; MBR_PARTITION_COUNT],
    pub signature: u16,
}

impl MasterBootRecord {
    /// 从第 0 扇区解析 MBR
    pub fn parse(sector: &[u8]) -> Result<Self> {
        if sector.len() < SECTOR_SIZE {
            return Err(Error::new(ErrorKind::InvalidInput, "MBR buffer too small"));
        }

        let mut partitions = [MbrPartition::default(); MBR_PARTITION_COUNT];
        for (i, part) in partitions.iter_mut().enumerate() {
            let offset = MBR_PARTITION_TABLE_OFFSET + i * 16;
            *part = MbrPartition::parse(&sector[offset..offset + 16]);
        }

        Ok(Self {
            partitions,
            signature: LittleEndian::read_u16(&sector[510..]),
        })
    }

    /// 写入第 0 扇区缓冲区（引导代码区不变）
    pub fn write_to(&self, sector: &mut [u8]) -> Result<()> {
        if sector.len() < SECTOR_SIZE {
            return Err(Error::new(ErrorKind::InvalidInput, "MBR buffer too small"));
        }
        for (i, part) in self.partitions.iter().enumerate() {
            let offset = MBR_PARTITION_TABLE_OFFSET + i * 16;
            part.write_to(&mut sector[offset..offset + 16]);
        }
        LittleEndian::write_u16(&mut sector[510..], self.signature);
        Ok(())
    }

    /// 引导签名是否有效
    pub fn has_valid_signature(&self) -> bool {
        self.signature == MBR_SIGNATURE
    }
}
