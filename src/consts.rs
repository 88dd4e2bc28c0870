//! 常量定义
//!
//! 这个模块包含了块缓存、哈希表和 FAT32 的所有常量定义，包括：
//! - 扇区与页面布局
//! - 哈希表调优参数
//! - FAT32 表项哨兵值与目录项属性
//! - MBR 分区类型

//=============================================================================
// 基础常量
//=============================================================================

/// 扇区大小（字节）
pub const SECTOR_SIZE: usize = 512;

/// 页面大小（字节），一个缓存单元恰好占一页
pub const PAGE_SIZE: usize = 4096;

/// 每页扇区数
pub const SECTORS_PER_PAGE: u64 = (PAGE_SIZE / SECTOR_SIZE) as u64;

/// LBA 页对齐掩码：缓存键总是 `lba & LBA_PAGE_MASK`
pub const LBA_PAGE_MASK: u64 = !(SECTORS_PER_PAGE - 1);

/// 将 LBA 规范化到 8 扇区边界
#[inline]
pub const fn normalize_lba(lba: u64) -> u64 {
    lba & LBA_PAGE_MASK
}

//=============================================================================
// 哈希表
//=============================================================================

/// 初始桶数
pub const HT_INITIAL_CAPACITY: usize = 16;

/// 最小桶数
pub const HT_MIN_CAPACITY: usize = 4;

/// 桶内元素数达到该值时，插入前先扩容
pub const HT_MAX_BEFORE_RESIZE: usize = 2;

/// 桶数上限，防止退化哈希函数导致无限倍增
pub const HT_MAX_CAPACITY: usize = 1 << 20;

//=============================================================================
// 块缓存
//=============================================================================

/// 默认缓存单元上限
pub const DEFAULT_CACHE_SIZE: usize = 256;

/// 达到上限时默认一次驱逐的单元数
pub const DEFAULT_EVICT_BATCH: usize = 16;

//=============================================================================
// FAT32
//=============================================================================

/// 每个 FAT 扇区组包含的扇区数
pub const FAT_SECTORS_PER_GROUP: u32 = 8;

/// 每个 FAT 扇区组包含的 32 位表项数
pub const FAT_ENTRIES_PER_GROUP: u32 = (FAT_SECTORS_PER_GROUP as usize * SECTOR_SIZE / 4) as u32;

/// FAT32 表项有效位（高 4 位保留）
pub const FAT32_ENTRY_MASK: u32 = 0x0FFF_FFFF;

/// 链尾标记：表项 >= 此值表示文件结束
pub const FAT_END_OF_CHAIN: u32 = 0x0FFF_FFF8;

/// 写入新链尾时使用的值
pub const FAT_END_OF_CHAIN_MARK: u32 = 0x0FFF_FFFF;

/// 坏簇标记
pub const FAT_BAD_CLUSTER: u32 = 0x0FFF_FFF7;

/// 空闲簇
pub const FAT_FREE_CLUSTER: u32 = 0;

/// 第一个数据簇编号
pub const FAT_FIRST_DATA_CLUSTER: u32 = 2;

/// 目录项大小（字节）
pub const FAT_DIR_ENTRY_SIZE: usize = 32;

/// 已删除目录项的首字节
pub const FAT_DIR_ENTRY_DELETED: u8 = 0xE5;

/// 目录结束标记（首字节）
pub const FAT_DIR_ENTRY_END: u8 = 0x00;

/// 名称小写标志（NT 保留字节）
pub const FAT_MSFLAGS_NAMELOWER: u8 = 1 << 3;

/// 扩展名小写标志（NT 保留字节）
pub const FAT_MSFLAGS_EXTLOWER: u8 = 1 << 4;

/// BPB 中系统标识字符串
pub const FAT32_SYSTEM_ID: &[u8; 5] = b"FAT32";

/// 根目录合成目录项的名称
pub const FAT_ROOT_NAME: &str = "FATX";

/// 最多同时挂载的 FAT32 文件系统数
pub const MAX_FAT32_FILE_SYSTEMS: usize = 16;

/// FAT32 文件系统 ID 的基值
pub const FAT32_FS_ID_BASE: u32 = 0x20_0000;

//=============================================================================
// MBR
//=============================================================================

/// MBR 引导签名
pub const MBR_SIGNATURE: u16 = 0xAA55;

/// MBR 分区表偏移
pub const MBR_PARTITION_TABLE_OFFSET: usize = 446;

/// MBR 分区表项数
pub const MBR_PARTITION_COUNT: usize = 4;

/// FAT32 (CHS) 分区类型
pub const PART_TYPE_FAT32_CHS: u8 = 0x0B;

/// FAT32 (LBA) 分区类型
pub const PART_TYPE_FAT32_LBA: u8 = 0x0C;
