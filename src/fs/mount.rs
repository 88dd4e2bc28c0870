//! 挂载表
//!
//! 持有每个驱动器的缓存寄存器和所有已挂载的 FAT32 文件系统。

use super::types::{FileNode, FsConfig, SystemHal};
use crate::{
    block::{BlockDevice, DriveId},
    cache::CacheRegister,
    consts::*,
    error::{Error, ErrorKind, Result},
    fat::{Fat32FileSystem, SharedDrive},
    types::{BiosParameterBlock, MasterBootRecord},
};
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

/// 计算文件系统 ID
///
/// 与分区所在的驱动器和分区号一一对应。
pub const fn fat32_fs_id(drive_id: DriveId, index: u8) -> u32 {
    FAT32_FS_ID_BASE | (drive_id as u32 * 4) | index as u32
}

/// 挂载表
pub struct MountTable<D, H> {
    config: FsConfig,
    drives: BTreeMap<DriveId, SharedDrive<D, H>>,
    filesystems: Vec<Arc<Fat32FileSystem<D, H>>>,
    global_root: Option<u32>,
}

impl<D: BlockDevice, H: SystemHal> MountTable<D, H> {
    /// 创建空挂载表
    ///
    /// # 错误
    ///
    /// 配置无效时返回 `InvalidInput`
    pub fn new(config: FsConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            drives: BTreeMap::new(),
            filesystems: Vec::new(),
            global_root: None,
        })
    }

    /// 注册驱动器
    ///
    /// 打开设备并为它建立缓存寄存器。
    ///
    /// # 错误
    ///
    /// - `AlreadyExists` - 驱动器已注册
    /// - 打开设备或初始化缓存时的错误
    pub fn register_drive(&mut self, drive_id: DriveId, mut device: D, hal: H) -> Result<SharedDrive<D, H>> {
        if self.drives.contains_key(&drive_id) {
            return Err(Error::new(ErrorKind::AlreadyExists, "Drive already registered"));
        }

        device.open()?;
        let mut register = CacheRegister::new();
        register.init(drive_id, device, hal)?;
        register.set_config(self.config)?;

        let shared = Arc::new(Mutex::new(register));
        self.drives.insert(drive_id, shared.clone());
        log::info!("[MOUNT] registered drive {}", drive_id);
        Ok(shared)
    }

    /// 驱动器的缓存寄存器
    pub fn drive(&self, drive_id: DriveId) -> Option<&SharedDrive<D, H>> {
        self.drives.get(&drive_id)
    }

    /// 探测驱动器上的 FAT32 分区并挂载
    ///
    /// 先按 MBR 挂载类型为 0x0B/0x0C 的分区；没有这样的分区而第 0 扇区本身是
    /// FAT32 引导扇区时，把整个磁盘作为一个卷挂载。单个分区挂载失败只记录日志。
    ///
    /// # 返回
    ///
    /// 成功挂载的文件系统 ID
    pub fn probe_drive(&mut self, drive_id: DriveId) -> Result<Vec<u32>> {
        let drive = self
            .drives
            .get(&drive_id)
            .ok_or(Error::new(ErrorKind::NotFound, "Drive not registered"))?;

        let mut sector = [0u8; SECTOR_SIZE];
        let total = {
            let mut reg = drive.lock();
            reg.read_sectors(0, &mut sector)?;
            reg.device().map_or(0, |d| d.total_sectors())
        };

        let mbr = MasterBootRecord::parse(&sector)?;
        let candidates: Vec<(u8, u64, u64)> = if mbr.has_valid_signature() {
            mbr.partitions
                .iter()
                .enumerate()
                .filter(|(_, part)| part.is_fat32())
                .map(|(i, part)| (i as u8, part.start_lba as u64, part.size_sectors as u64))
                .collect()
        } else {
            Vec::new()
        };

        let mut mounted = Vec::new();
        if candidates.is_empty() {
            let whole_disk = BiosParameterBlock::parse(&sector).is_ok_and(|bpb| bpb.is_fat32());
            if whole_disk {
                mounted.push(self.mount_partition(drive_id, 0, 0, total)?);
            } else {
                log::debug!("[MOUNT] drive {}: no FAT32 volume found", drive_id);
            }
            return Ok(mounted);
        }

        for (index, start, size) in candidates {
            match self.mount_partition(drive_id, index, start, size) {
                Ok(fs_id) => mounted.push(fs_id),
                Err(e) => log::warn!(
                    "[MOUNT] could not mount FAT32 partition {} on drive {}: {}",
                    index,
                    drive_id,
                    e
                ),
            }
        }
        Ok(mounted)
    }

    /// 挂载一个分区
    ///
    /// 第一个挂载的文件系统成为全局根。
    ///
    /// # 参数
    ///
    /// * `drive_id` - 驱动器
    /// * `index` - 分区号（0-3）
    /// * `start` - 分区起始扇区
    /// * `size` - 分区扇区数
    ///
    /// # 错误
    ///
    /// - `NotFound` - 驱动器未注册
    /// - `InvalidInput` - 分区号超过 3
    /// - `AlreadyExists` - 该分区已挂载
    /// - `NoSpace` - 已挂载 16 个文件系统
    pub fn mount_partition(&mut self, drive_id: DriveId, index: u8, start: u64, size: u64) -> Result<u32> {
        if index as usize >= MBR_PARTITION_COUNT {
            return Err(Error::new(ErrorKind::InvalidInput, "Partition index out of range"));
        }
        let drive = self
            .drives
            .get(&drive_id)
            .ok_or(Error::new(ErrorKind::NotFound, "Drive not registered"))?;

        let fs_id = fat32_fs_id(drive_id, index);
        if self.filesystem(fs_id).is_some() {
            return Err(Error::new(ErrorKind::AlreadyExists, "Partition already mounted"));
        }
        if self.filesystems.len() >= MAX_FAT32_FILE_SYSTEMS {
            return Err(Error::new(ErrorKind::NoSpace, "Too many mounted file systems"));
        }

        let fs = Fat32FileSystem::mount(fs_id, drive.clone(), start, size, &self.config)?;
        self.filesystems.try_reserve(1)?;
        self.filesystems.push(Arc::new(fs));

        if self.global_root.is_none() {
            self.global_root = Some(fs_id);
            log::info!("[MOUNT] fs {:#x} is the global root", fs_id);
        }
        log::info!("[MOUNT] drive {} partition {} mounted as fs {:#x}", drive_id, index, fs_id);
        Ok(fs_id)
    }

    /// 卸载文件系统
    ///
    /// 卸载全局根时，下一个已挂载的文件系统成为全局根。
    pub fn unmount(&mut self, fs_id: u32) -> Result<()> {
        let pos = self
            .filesystems
            .iter()
            .position(|fs| fs.fs_id() == fs_id)
            .ok_or(Error::new(ErrorKind::NotFound, "File system not mounted"))?;

        self.filesystems[pos].unmount()?;
        self.filesystems.remove(pos);

        if self.global_root == Some(fs_id) {
            self.global_root = self.filesystems.first().map(|fs| fs.fs_id());
        }
        log::info!("[MOUNT] fs {:#x} unmounted", fs_id);
        Ok(())
    }

    /// 按 ID 查找文件系统
    pub fn filesystem(&self, fs_id: u32) -> Option<Arc<Fat32FileSystem<D, H>>> {
        self.filesystems.iter().find(|fs| fs.fs_id() == fs_id).cloned()
    }

    /// 节点所属的文件系统
    pub fn filesystem_of(&self, node: &FileNode) -> Option<Arc<Fat32FileSystem<D, H>>> {
        self.filesystem(node.fs_id)
    }

    /// 已挂载的文件系统 ID
    pub fn mounted(&self) -> impl Iterator<Item = u32> + '_ {
        self.filesystems.iter().map(|fs| fs.fs_id())
    }

    /// 全局根目录节点
    pub fn global_root(&self) -> Option<FileNode> {
        self.filesystem(self.global_root?)?.root_node().ok()
    }

    /// 关闭：卸载所有文件系统并释放所有驱动器
    ///
    /// 出错时继续处理其余对象，最后返回第一个错误。
    ///
    /// # 返回
    ///
    /// 释放出来的设备
    pub fn shutdown(&mut self) -> Result<Vec<(DriveId, D)>> {
        let mut first_err = None;

        for fs in self.filesystems.drain(..) {
            if let Err(e) = fs.unmount() {
                log::error!("[MOUNT] fs {:#x} failed to unmount: {}", fs.fs_id(), e);
                first_err.get_or_insert(e);
            }
        }
        self.global_root = None;

        let mut devices = Vec::new();
        for (drive_id, drive) in core::mem::take(&mut self.drives) {
            match drive.lock().release() {
                Ok(device) => devices.push((drive_id, device)),
                Err(e) => {
                    log::error!("[MOUNT] drive {} failed to release: {}", drive_id, e);
                    first_err.get_or_insert(e);
                }
            }
        }

        log::info!("[MOUNT] shut down, {} drives released", devices.len());
        match first_err {
            Some(e) => Err(e),
            None => Ok(devices),
        }
    }
}

impl<D, H> core::fmt::Debug for MountTable<D, H> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MountTable")
            .field("drives", &self.drives.keys().collect::<Vec<_>>())
            .field("filesystems", &self.filesystems.len())
            .field("global_root", &self.global_root)
            .finish()
    }
}
