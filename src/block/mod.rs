//! 块设备抽象
//!
//! 提供底层块设备接口，缓存和文件系统都只通过这里访问设备。
//! block/device.rs 定义设备 trait 和设备状态码，
//! block/ramdisk.rs 提供基于内存的设备实现（测试和内存盘使用）。

mod device;
mod ramdisk;

pub use device::{BlockDevice, DriveId, DriveStatus};
pub use ramdisk::RamDisk;

#[cfg(test)]
pub(crate) mod mock;
