//! VFS 集成
//!
//! 这个模块提供文件系统与内核其余部分之间的接口：硬件抽象层、配置、
//! 文件节点与回调表，以及管理驱动器和已挂载文件系统的挂载表。

mod mount;
mod types;

pub use mount::{fat32_fs_id, MountTable};
pub use types::{
    DirEnt, FileNode, FileOps, FileType, FsConfig, LogicalClock, Permissions, SystemHal,
};
