//! nanofat_core: 块缓存与 FAT32 inode/簇链子系统
//!
//! 这个库实现了一个小型内核存储栈的核心部分：
//! - **块缓存**：按 LBA 缓存 4 KiB 页，写回式驱逐
//! - **FAT32**：按需分页的 FAT、簇链遍历、以簇号为 inode 号的 inode 缓存
//! - **哈希表**：两种缓存共用的链式哈希表，自动扩容，删除前回调
//!
//! # 示例
//!
//! ```rust,ignore
//! use nanofat_core::{FsConfig, LogicalClock, MountTable, FileOps};
//! use alloc::sync::Arc;
//!
//! let mut mounts = MountTable::new(FsConfig::default())?;
//! mounts.register_drive(0, my_device, Arc::new(LogicalClock::new()))?;
//! mounts.probe_drive(0)?;
//!
//! let root = mounts.global_root().unwrap();
//! let fs = mounts.filesystem_of(&root).unwrap();
//! let mut index = 0;
//! while let Some(ent) = fs.read_dir(&root, index)? {
//!     log::info!("{} ({})", ent.name, ent.inode);
//!     index += 1;
//! }
//!
//! mounts.shutdown()?;
//! ```
//!
//! # 模块结构
//!
//! - [`error`] - 错误类型定义
//! - [`consts`] - 常量定义
//! - [`types`] - 磁盘格式数据结构
//! - [`hash`] - 链式哈希表
//! - [`block`] - 块设备抽象
//! - [`cache`] - 块缓存
//! - [`fat`] - FAT32 簇链与 inode 缓存
//! - [`fs`] - VFS 接口与挂载表

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

#[cfg(feature = "std")]
extern crate std;

// ===== 核心模块 =====

/// 错误处理
pub mod error;

/// 常量定义
pub mod consts;

/// 磁盘格式数据结构
pub mod types;

/// 哈希表
pub mod hash;

/// 块设备抽象
pub mod block;

/// 块缓存
pub mod cache;

/// FAT32
pub mod fat;

/// VFS 接口
pub mod fs;

// ===== 公共导出 =====

// 错误处理
pub use error::{Error, ErrorKind, Result};

// 块设备
pub use block::{BlockDevice, DriveId, DriveStatus, RamDisk};

// 哈希表
pub use hash::{ForEachOp, HashCallbacks, HashTable};

// 缓存
pub use cache::{CacheFlags, CacheRegister, CacheStats, CacheUnit, DmaPage};

// FAT32
pub use fat::{FaTable, Fat32FileSystem, Fat32InodeCacheUnit, InodeCache};

// 磁盘格式
pub use types::{BiosParameterBlock, FatAttributes, FatDirEntry, MasterBootRecord, MbrPartition};

// VFS
pub use fs::{DirEnt, FileNode, FileOps, FileType, FsConfig, LogicalClock, MountTable, Permissions, SystemHal};
