//! VFS 集成所需的类型定义
//!
//! 这个模块定义了文件系统与内核其余部分之间的接口类型：
//! 系统硬件抽象层、配置、文件节点和文件操作回调表。

use crate::cache::DmaPage;
use crate::consts::{DEFAULT_CACHE_SIZE, DEFAULT_EVICT_BATCH};
use crate::error::{Error, ErrorKind, Result};
use alloc::string::String;
use alloc::sync::Arc;
use bitflags::bitflags;
use core::num::NonZeroUsize;
use core::sync::atomic::{AtomicU32, Ordering};

/// 系统硬件抽象层 trait
///
/// 提供缓存所需的系统级功能：单调时钟和可 DMA 的页分配。
pub trait SystemHal {
    /// 获取单调递增的时钟计数
    ///
    /// 缓存单元以此作为 LRU 时间戳。
    ///
    /// # 示例
    ///
    /// ```ignore
    /// struct PitHal;
    /// impl SystemHal for PitHal {
    ///     fn tick_count(&self) -> u32 {
    ///         pit::ticks_since_boot()
    ///     }
    /// }
    /// ```
    fn tick_count(&self) -> u32;

    /// 分配一页可用于 DMA 的内存
    ///
    /// 默认从堆上分配。内核可以覆盖此方法返回物理页。
    fn allocate_page(&self) -> Result<DmaPage> {
        DmaPage::allocate()
    }
}

impl<H: SystemHal + ?Sized> SystemHal for Arc<H> {
    fn tick_count(&self) -> u32 {
        (**self).tick_count()
    }

    fn allocate_page(&self) -> Result<DmaPage> {
        (**self).allocate_page()
    }
}

/// 逻辑时钟
///
/// 每次读取时加一的计数器，适合没有硬件时钟的环境和测试。
#[derive(Debug, Default)]
pub struct LogicalClock {
    ticks: AtomicU32,
}

impl LogicalClock {
    /// 从 0 开始计数
    pub const fn new() -> Self {
        Self {
            ticks: AtomicU32::new(0),
        }
    }
}

impl SystemHal for LogicalClock {
    fn tick_count(&self) -> u32 {
        self.ticks.fetch_add(1, Ordering::Relaxed)
    }
}

/// 文件系统配置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsConfig {
    /// 块缓存单元上限（页数）
    pub max_cache_units: usize,
    /// 达到上限时一次驱逐的单元数
    pub evict_batch: usize,
    /// 缓存命中时是否刷新 LRU 时间戳
    pub refresh_on_hit: bool,
    /// FAT 扇区组缓存上限，`None` 表示不限
    pub max_fat_groups: Option<NonZeroUsize>,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            max_cache_units: DEFAULT_CACHE_SIZE,
            evict_batch: DEFAULT_EVICT_BATCH,
            refresh_on_hit: false,
            max_fat_groups: None,
        }
    }
}

impl FsConfig {
    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        if self.max_cache_units == 0 {
            return Err(Error::new(ErrorKind::InvalidInput, "Cache must hold at least one unit"));
        }
        if self.evict_batch == 0 {
            return Err(Error::new(ErrorKind::InvalidInput, "Eviction batch must be non-zero"));
        }
        Ok(())
    }
}

bitflags! {
    /// 文件节点类型
    ///
    /// 低 3 位是互斥的基本类型，其余位可以叠加。
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FileType: u32 {
        /// 普通文件
        const FILE         = 1;
        /// 字符设备
        const CHAR_DEVICE  = 2;
        /// 块设备
        const BLOCK_DEVICE = 3;
        /// 目录
        const DIRECTORY    = 8;
        /// 挂载点
        const MOUNTPOINT   = 16;
        /// 常驻节点（永不驱逐，不参与引用计数）
        const PERMANENT    = 32;
    }
}

bitflags! {
    /// 访问权限
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Permissions: u32 {
        /// 可读
        const READ  = 1;
        /// 可写
        const WRITE = 2;
        /// 可执行
        const EXEC  = 4;
    }
}

/// 文件节点
///
/// 由文件系统填充，供 VFS 以统一方式访问各文件系统的文件。
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FileNode {
    /// 名称
    pub name: String,
    /// 所属文件系统 ID
    pub fs_id: u32,
    /// inode 号（文件系统内唯一）
    pub inode: u32,
    /// 类型
    pub node_type: FileType,
    /// 权限
    pub perms: Permissions,
    /// 长度（字节）
    pub length: u32,
    /// 打开计数
    pub ref_count: u32,
}

impl FileNode {
    /// 是否为目录
    pub fn is_directory(&self) -> bool {
        self.node_type.contains(FileType::DIRECTORY)
    }

    /// 是否为常驻节点
    pub fn is_permanent(&self) -> bool {
        self.node_type.contains(FileType::PERMANENT)
    }
}

/// 目录项（`read_dir` 的结果）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEnt {
    /// 名称
    pub name: String,
    /// inode 号
    pub inode: u32,
    /// 类型
    pub node_type: FileType,
}

/// 文件操作回调表
///
/// 每个文件系统实现一次，所有节点共享。
pub trait FileOps {
    /// 从 `offset` 处读取
    ///
    /// # 返回
    ///
    /// 实际读取的字节数，到达文件末尾时小于 `buf.len()`
    fn read(&self, node: &FileNode, offset: u32, buf: &mut [u8]) -> Result<usize>;

    /// 在 `offset` 处写入，必要时扩展文件
    fn write(&self, node: &FileNode, offset: u32, buf: &[u8]) -> Result<usize>;

    /// 打开节点（增加打开计数）
    fn open(&self, node: &FileNode) -> Result<()>;

    /// 关闭节点（减少打开计数）
    fn close(&self, node: &FileNode) -> Result<()>;

    /// 读取目录的第 `index` 个子项
    ///
    /// 没有更多子项时返回 `Ok(None)`。
    fn read_dir(&self, node: &FileNode, index: usize) -> Result<Option<DirEnt>>;

    /// 在目录中按名称查找子项
    fn find_dir(&self, node: &FileNode, name: &str) -> Result<Option<FileNode>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logical_clock_is_monotonic() {
        let clock = LogicalClock::new();
        let a = clock.tick_count();
        let b = clock.tick_count();
        let c = clock.tick_count();
        assert!(a < b && b < c);
    }

    #[test]
    fn test_shared_hal() {
        let clock = Arc::new(LogicalClock::new());
        let other = clock.clone();
        assert_eq!(clock.tick_count(), 0);
        assert_eq!(other.tick_count(), 1);
        assert!(other.allocate_page().is_ok());
    }

    #[test]
    fn test_fs_config_default() {
        let config = FsConfig::default();
        assert_eq!(config.max_cache_units, 256);
        assert_eq!(config.evict_batch, 16);
        assert!(!config.refresh_on_hit);
        assert!(config.max_fat_groups.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_fs_config_validation() {
        let config = FsConfig {
            evict_batch: 0,
            ..FsConfig::default()
        };
        assert_eq!(config.validate().unwrap_err().kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn test_node_type_flags() {
        let node = FileNode {
            node_type: FileType::DIRECTORY | FileType::MOUNTPOINT | FileType::PERMANENT,
            ..FileNode::default()
        };
        assert!(node.is_directory());
        assert!(node.is_permanent());
        assert!(!FileNode::default().is_directory());
    }
}
