//! FAT32 模块
//!
//! 把目录项和簇链映射成内存中的文件节点树。
//!
//! # 主要组件
//!
//! - [`FaTable`] - 按扇区组分页载入的 FAT 视图，负责簇链遍历和簇分配
//! - [`InodeCache`] - 以起始簇号为 inode 号的目录项缓存
//! - [`DirScanner`] - 32 字节目录项扫描
//! - [`Fat32FileSystem`] - 一个已挂载分区，实现 [`FileOps`](crate::fs::FileOps)
//!
//! # 数据流
//!
//! ```text
//! find_dir / read ──> InodeCache ──(未命中: 扫描父目录)──> read_inode
//!        │
//!        └──> FaTable::chain ──> CacheRegister::read_sectors ──> BlockDevice
//! ```
//!
//! 只读写第一个 FAT；长文件名项被跳过，名称总是 8.3 短名。

mod dir;
mod filesystem;
mod inode;
mod table;

#[cfg(test)]
pub(crate) mod test_image;

pub use dir::{DirScanner, DirSlot, ScanState};
pub use filesystem::{Fat32FileSystem, SharedDrive};
pub use inode::{Fat32InodeCacheUnit, InodeCache, InodeHash, SYNTHETIC_INODE_BIT};
pub use table::{FaTable, FatSectorGroup};
