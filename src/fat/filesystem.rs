//! FAT32 文件系统实例
//!
//! 一个已挂载的 FAT32 分区。持有 FAT 视图和 inode 缓存，通过共享的驱动器缓存寄存器访问磁盘，
//! 并实现 [`FileOps`] 供 VFS 使用。
//!
//! 锁顺序固定为 inode 缓存 → FAT → 驱动器，任何路径都不会反向加锁。

use super::dir::{DirScanner, DirSlot, ScanState};
use super::inode::{Fat32InodeCacheUnit, InodeCache};
use super::table::FaTable;
use crate::{
    block::BlockDevice,
    cache::CacheRegister,
    consts::*,
    error::{Error, ErrorKind, Result},
    fs::{DirEnt, FileNode, FileOps, FileType, FsConfig, Permissions, SystemHal},
    types::{BiosParameterBlock, FatAttributes, FatDirEntry},
};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ops::ControlFlow;
use spin::Mutex;

/// 多个分区共享的驱动器缓存寄存器
pub type SharedDrive<D, H> = Arc<Mutex<CacheRegister<D, H>>>;

const NOT_CACHED: Error = Error::new(ErrorKind::NotFound, "Inode not cached");

fn cluster_buffer(len: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)?;
    buf.resize(len, 0);
    Ok(buf)
}

fn entry_type(entry: &FatDirEntry) -> FileType {
    if entry.is_directory() {
        FileType::DIRECTORY
    } else {
        FileType::FILE
    }
}

/// FAT32 文件系统
pub struct Fat32FileSystem<D, H> {
    fs_id: u32,
    drive: SharedDrive<D, H>,
    bpb: BiosParameterBlock,
    partition_start: u64,
    /// 第一个 FAT 的起始扇区
    fat_begin: u64,
    /// 簇 2 的起始扇区
    lba_start: u64,
    sectors_per_cluster: u32,
    cluster_count: u32,
    fat: Mutex<FaTable>,
    inodes: Mutex<InodeCache>,
}

impl<D: BlockDevice, H: SystemHal> Fat32FileSystem<D, H> {
    /// 挂载 FAT32 分区
    ///
    /// 读取并校验分区第 0 扇区的 BPB，计算布局，然后把根目录作为常驻挂载点放入 inode 缓存。
    ///
    /// # 参数
    ///
    /// * `fs_id` - 文件系统 ID
    /// * `drive` - 分区所在驱动器的缓存寄存器
    /// * `partition_start` - 分区起始扇区
    /// * `partition_size` - 分区扇区数，0 表示以 BPB 为准
    /// * `config` - 配置
    ///
    /// # 错误
    ///
    /// - `Unsupported` - 不是 FAT32 卷或扇区大小不是 512
    /// - `Corrupted` - BPB 描述的布局无效
    /// - 读取引导扇区时的设备错误
    pub fn mount(
        fs_id: u32,
        drive: SharedDrive<D, H>,
        partition_start: u64,
        partition_size: u64,
        config: &FsConfig,
    ) -> Result<Self> {
        config.validate()?;

        let mut sector = [0u8; SECTOR_SIZE];
        drive.lock().read_sectors(partition_start, &mut sector)?;
        let bpb = BiosParameterBlock::parse(&sector)?;
        bpb.validate()?;

        let sectors_per_cluster = bpb.sectors_per_cluster as u32;
        let fat_begin = partition_start + bpb.reserved_sectors as u64;
        let lba_start = fat_begin + bpb.fat_count as u64 * bpb.sectors_per_fat_32 as u64;

        let mut total = bpb.total_sectors() as u64;
        if partition_size != 0 {
            total = total.min(partition_size);
        }
        let metadata = lba_start - partition_start;
        if total <= metadata {
            return Err(Error::new(ErrorKind::Corrupted, "Volume smaller than its metadata"));
        }
        let cluster_count =
            ((total - metadata) / sectors_per_cluster as u64).min((FAT_BAD_CLUSTER - FAT_FIRST_DATA_CLUSTER) as u64) as u32;
        if bpb.root_cluster >= cluster_count + FAT_FIRST_DATA_CLUSTER {
            return Err(Error::new(ErrorKind::Corrupted, "Root cluster outside the data area"));
        }

        let fat = FaTable::new(fat_begin, bpb.sectors_per_fat_32, cluster_count, config.max_fat_groups);

        let mut inodes = InodeCache::new(fs_id)?;
        let root = FatDirEntry::synthetic(
            FAT_ROOT_NAME,
            FatAttributes::SYSTEM | FatAttributes::DIRECTORY,
            bpb.root_cluster,
        );
        inodes.read_inode(bpb.root_cluster, &root, 0, 0, FAT_ROOT_NAME, false)?;
        inodes.make_permanent(bpb.root_cluster)?;

        log::info!(
            "[FAT] mounted fs {:#x}: partition at {}, fat_begin={}, lba_start={}, {} clusters of {} sectors, root cluster {}",
            fs_id,
            partition_start,
            fat_begin,
            lba_start,
            cluster_count,
            sectors_per_cluster,
            bpb.root_cluster
        );

        Ok(Self {
            fs_id,
            drive,
            bpb,
            partition_start,
            fat_begin,
            lba_start,
            sectors_per_cluster,
            cluster_count,
            fat: Mutex::new(fat),
            inodes: Mutex::new(inodes),
        })
    }

    /// 文件系统 ID
    pub fn fs_id(&self) -> u32 {
        self.fs_id
    }

    /// BIOS 参数块
    pub fn bpb(&self) -> &BiosParameterBlock {
        &self.bpb
    }

    /// 驱动器缓存寄存器
    pub fn drive(&self) -> &SharedDrive<D, H> {
        &self.drive
    }

    /// 分区起始扇区
    pub fn partition_start(&self) -> u64 {
        self.partition_start
    }

    /// 第一个 FAT 的起始扇区
    pub fn fat_begin(&self) -> u64 {
        self.fat_begin
    }

    /// 数据区起始扇区（簇 2）
    pub fn lba_start(&self) -> u64 {
        self.lba_start
    }

    /// 数据簇数量
    pub fn cluster_count(&self) -> u32 {
        self.cluster_count
    }

    /// 簇大小（字节）
    pub fn cluster_size(&self) -> usize {
        self.sectors_per_cluster as usize * SECTOR_SIZE
    }

    /// 根目录 inode 号
    pub fn root_inode(&self) -> u32 {
        self.bpb.root_cluster
    }

    /// 簇号转换为起始扇区
    ///
    /// # 错误
    ///
    /// 簇号不在数据区（小于 2 或超出簇数）时返回 `InvalidInput`
    pub fn cluster_to_lba(&self, cluster: u32) -> Result<u64> {
        self.cluster_range_lba(cluster, 1)
    }

    fn cluster_range_lba(&self, cluster: u32, count: u32) -> Result<u64> {
        let end = cluster as u64 + count as u64;
        match cluster.checked_sub(FAT_FIRST_DATA_CLUSTER) {
            Some(index) if end <= self.cluster_count as u64 + FAT_FIRST_DATA_CLUSTER as u64 => {
                Ok(self.lba_start + index as u64 * self.sectors_per_cluster as u64)
            }
            _ => Err(Error::new(ErrorKind::InvalidInput, "Cluster range outside the data area")),
        }
    }

    fn check_cluster_buffer(&self, count: u32, buf_len: usize) -> Result<()> {
        if buf_len != count as usize * self.cluster_size() {
            return Err(Error::new(ErrorKind::InvalidInput, "Buffer does not match cluster count"));
        }
        Ok(())
    }

    /// 读取连续的簇
    ///
    /// # 参数
    ///
    /// * `cluster` - 起始簇号
    /// * `count` - 簇数
    /// * `buf` - 长度必须等于 `count * cluster_size()`
    pub fn read_clusters(&self, cluster: u32, count: u32, buf: &mut [u8]) -> Result<usize> {
        let lba = self.cluster_range_lba(cluster, count)?;
        self.check_cluster_buffer(count, buf.len())?;
        self.drive.lock().read_sectors(lba, buf)
    }

    /// 写入连续的簇
    pub fn write_clusters(&self, cluster: u32, count: u32, buf: &[u8]) -> Result<usize> {
        let lba = self.cluster_range_lba(cluster, count)?;
        self.check_cluster_buffer(count, buf.len())?;
        self.drive.lock().write_sectors(lba, buf)
    }

    /// 获取下一个簇号
    pub fn get_next_cluster(&self, cluster: u32) -> Result<u32> {
        let mut fat = self.fat.lock();
        let mut drive = self.drive.lock();
        fat.get_next_cluster(&mut *drive, cluster)
    }

    /// 簇链长度
    pub fn count_clusters(&self, first: u32) -> Result<u32> {
        let mut fat = self.fat.lock();
        let mut drive = self.drive.lock();
        fat.count_clusters(&mut *drive, first)
    }

    /// 读取 inode，返回其文件节点
    ///
    /// 语义同 [`InodeCache::read_inode`]。
    pub fn read_inode(
        &self,
        inode: u32,
        entry: &FatDirEntry,
        parent_dir_inode: u32,
        parent_dir_offset: u32,
        name: &str,
        force_reload: bool,
    ) -> Result<FileNode> {
        let mut inodes = self.inodes.lock();
        let unit = inodes.read_inode(inode, entry, parent_dir_inode, parent_dir_offset, name, force_reload)?;
        Ok(unit.node.clone())
    }

    /// 把目录项加入 inode 缓存
    pub fn add_inode(
        &self,
        inode: u32,
        entry: &FatDirEntry,
        parent_dir_inode: u32,
        parent_dir_offset: u32,
        name: &str,
    ) -> Result<FileNode> {
        let mut inodes = self.inodes.lock();
        let unit = inodes.add(inode, entry, parent_dir_inode, parent_dir_offset, name)?;
        Ok(unit.node.clone())
    }

    /// 查找已缓存的 inode
    pub fn lookup_inode(&self, inode: u32) -> Option<FileNode> {
        self.inodes.lock().lookup(inode).map(|unit| unit.node.clone())
    }

    /// 已缓存 inode 单元的副本
    pub fn inode_unit(&self, inode: u32) -> Option<Fat32InodeCacheUnit> {
        self.inodes.lock().lookup(inode).cloned()
    }

    /// 缓存的 inode 数
    pub fn cached_inodes(&self) -> usize {
        self.inodes.lock().len()
    }

    /// 清除等待删除的 inode
    pub fn purge_inodes(&self) -> Result<usize> {
        self.inodes.lock().purge()
    }

    /// 根目录节点
    pub fn root_node(&self) -> Result<FileNode> {
        self.lookup_inode(self.root_inode()).ok_or(NOT_CACHED)
    }

    /// 把 FAT 和脏缓存页写回设备
    pub fn sync(&self) -> Result<()> {
        let mut fat = self.fat.lock();
        let mut drive = self.drive.lock();
        fat.flush(&mut *drive)?;
        drive.sync()?;
        Ok(())
    }

    /// 卸载前清理：写回并清空 inode 缓存
    pub fn unmount(&self) -> Result<()> {
        let mut inodes = self.inodes.lock();
        self.sync()?;
        let dropped = inodes.clear()?;
        log::info!("[FAT] unmounted fs {:#x} ({} inodes dropped)", self.fs_id, dropped);
        Ok(())
    }

    fn check_node(&self, node: &FileNode) -> Result<()> {
        if node.fs_id != self.fs_id {
            return Err(Error::new(ErrorKind::InvalidInput, "Node belongs to another file system"));
        }
        Ok(())
    }

    /// 目录节点的起始簇
    fn directory_cluster(&self, node: &FileNode) -> Result<u32> {
        self.check_node(node)?;
        let inodes = self.inodes.lock();
        let unit = inodes.lookup(node.inode).ok_or(NOT_CACHED)?;
        if !unit.is_directory() {
            return Err(Error::new(ErrorKind::NotADirectory, "Not a directory"));
        }
        Ok(unit.first_cluster())
    }

    /// 按起始簇找到目录节点
    ///
    /// 未缓存时读取该目录的 `..` 找到父目录，再在父目录中找到它自己的目录项，
    /// 这样缓存单元记录的是真实名称和位置，而不是点目录项。
    fn resolve_directory(&self, cluster: u32) -> Result<FileNode> {
        if cluster == FAT_FREE_CLUSTER || cluster == self.root_inode() {
            return self.root_node();
        }
        if let Some(node) = self.lookup_inode(cluster) {
            return Ok(node);
        }

        let mut own = None;
        let parent = {
            let mut fat = self.fat.lock();
            let mut drive = self.drive.lock();
            let mut dotdot = None;
            self.scan_directory(&mut fat, &mut drive, cluster, DirScanner::with_dots(), |slot| {
                if slot.entry.is_dot_entry() && slot.entry.matches_name("..") {
                    dotdot = Some(slot.entry.first_cluster());
                    return ControlFlow::Break(());
                }
                ControlFlow::Continue(())
            })?;
            let parent = match dotdot {
                Some(FAT_FREE_CLUSTER) => self.root_inode(),
                Some(parent) => parent,
                None => return Err(Error::new(ErrorKind::Corrupted, "Directory has no '..' entry")),
            };

            self.scan_directory(&mut fat, &mut drive, parent, DirScanner::new(), |slot| {
                if slot.entry.is_directory() && slot.entry.first_cluster() == cluster {
                    own = Some(slot);
                    return ControlFlow::Break(());
                }
                ControlFlow::Continue(())
            })?;
            parent
        };

        let slot = own.ok_or(Error::new(ErrorKind::Corrupted, "Directory is not listed in its parent"))?;
        let name = slot.entry.short_name();
        log::debug!("[FAT] resolved directory {} as '{}' in {}", cluster, name, parent);
        self.read_inode(cluster, &slot.entry, parent, slot.offset, &name, false)
    }

    fn scan_directory<F>(
        &self,
        fat: &mut FaTable,
        drive: &mut CacheRegister<D, H>,
        first: u32,
        scanner: DirScanner,
        mut visit: F,
    ) -> Result<()>
    where
        F: FnMut(DirSlot) -> ControlFlow<()>,
    {
        let cs = self.cluster_size();
        let chain = fat.chain(drive, first)?;
        let mut raw = cluster_buffer(cs)?;

        for (i, &cluster) in chain.iter().enumerate() {
            drive.read_sectors(self.cluster_to_lba(cluster)?, &mut raw)?;
            match scanner.scan(&raw, (i * cs) as u32, &mut visit) {
                ScanState::More => {}
                ScanState::End | ScanState::Stopped => break,
            }
        }
        Ok(())
    }

    /// 改写父目录中的目录项
    fn rewrite_dir_entry(
        &self,
        fat: &mut FaTable,
        drive: &mut CacheRegister<D, H>,
        dir_inode: u32,
        offset: u32,
        entry: &FatDirEntry,
    ) -> Result<()> {
        let cs = self.cluster_size();
        let chain = fat.chain(drive, dir_inode)?;
        let cluster = *chain
            .get(offset as usize / cs)
            .ok_or(Error::new(ErrorKind::Corrupted, "Directory entry past the end of its directory"))?;

        let in_cluster = offset as usize % cs;
        let lba = self.cluster_to_lba(cluster)? + (in_cluster / SECTOR_SIZE) as u64;
        let at = in_cluster % SECTOR_SIZE;

        let mut sector = [0u8; SECTOR_SIZE];
        drive.read_sectors(lba, &mut sector)?;
        sector[at..at + FAT_DIR_ENTRY_SIZE].copy_from_slice(&entry.to_bytes());
        drive.write_sectors(lba, &sector)?;
        log::debug!("[FAT] rewrote entry at dir {} offset {}", dir_inode, offset);
        Ok(())
    }
}

impl<D: BlockDevice, H: SystemHal> FileOps for Fat32FileSystem<D, H> {
    fn read(&self, node: &FileNode, offset: u32, buf: &mut [u8]) -> Result<usize> {
        self.check_node(node)?;
        let (first, size, is_dir) = {
            let inodes = self.inodes.lock();
            let unit = inodes.lookup(node.inode).ok_or(NOT_CACHED)?;
            (unit.first_cluster(), unit.dir_entry.file_size as usize, unit.is_directory())
        };
        if first == FAT_FREE_CLUSTER || buf.is_empty() {
            return Ok(0);
        }

        let mut fat = self.fat.lock();
        let mut drive = self.drive.lock();
        let cs = self.cluster_size();
        let chain = fat.chain(&mut *drive, first)?;

        // 目录项中的目录大小总是 0，以簇链长度为准
        let length = if is_dir { chain.len() * cs } else { size };
        let offset = offset as usize;
        if offset >= length {
            return Ok(0);
        }

        let want = buf.len().min(length - offset);
        let mut raw = cluster_buffer(cs)?;
        let mut done = 0;
        while done < want {
            let pos = offset + done;
            let cluster = *chain
                .get(pos / cs)
                .ok_or(Error::new(ErrorKind::Corrupted, "Cluster chain shorter than file size"))?;
            let in_cluster = pos % cs;
            let n = (cs - in_cluster).min(want - done);

            drive.read_sectors(self.cluster_to_lba(cluster)?, &mut raw)?;
            buf[done..done + n].copy_from_slice(&raw[in_cluster..in_cluster + n]);
            done += n;
        }

        log::trace!("[FAT] read {} bytes of inode {} at {}", done, node.inode, offset);
        Ok(done)
    }

    fn write(&self, node: &FileNode, offset: u32, buf: &[u8]) -> Result<usize> {
        self.check_node(node)?;
        if buf.is_empty() {
            return Ok(0);
        }

        let mut inodes = self.inodes.lock();
        let (first, old_size, parent, parent_offset, mut entry) = {
            let unit = inodes.lookup(node.inode).ok_or(NOT_CACHED)?;
            if unit.is_directory() {
                return Err(Error::new(ErrorKind::IsADirectory, "Cannot write to a directory"));
            }
            if !unit.node.perms.contains(Permissions::WRITE) {
                return Err(Error::new(ErrorKind::ReadOnly, "File is read-only"));
            }
            (
                unit.first_cluster(),
                unit.dir_entry.file_size,
                unit.parent_dir_inode,
                unit.parent_dir_offset,
                unit.dir_entry,
            )
        };
        if first == FAT_FREE_CLUSTER {
            return Err(Error::new(ErrorKind::Unsupported, "File has no cluster chain"));
        }
        let end = u32::try_from(buf.len())
            .ok()
            .and_then(|len| offset.checked_add(len))
            .ok_or(Error::new(ErrorKind::NoSpace, "File would exceed 4 GiB"))?;

        let mut fat = self.fat.lock();
        let mut drive = self.drive.lock();
        let cs = self.cluster_size();

        let mut chain = fat.chain(&mut *drive, first)?;
        let needed = (end as usize).div_ceil(cs);
        if chain.len() < needed {
            let zero = cluster_buffer(cs)?;
            chain.try_reserve(needed - chain.len())?;
            while chain.len() < needed {
                let last = chain.last().copied().unwrap_or(first);
                let cluster = fat.allocate_cluster(&mut *drive, Some(last))?;
                drive.write_sectors(self.cluster_to_lba(cluster)?, &zero)?;
                chain.push(cluster);
            }
            log::debug!("[FAT] inode {} grown to {} clusters", node.inode, chain.len());
        }

        let mut raw = cluster_buffer(cs)?;
        let mut done = 0;
        while done < buf.len() {
            let pos = offset as usize + done;
            let lba = self.cluster_to_lba(chain[pos / cs])?;
            let in_cluster = pos % cs;
            let n = (cs - in_cluster).min(buf.len() - done);

            if n == cs {
                drive.write_sectors(lba, &buf[done..done + n])?;
            } else {
                drive.read_sectors(lba, &mut raw)?;
                raw[in_cluster..in_cluster + n].copy_from_slice(&buf[done..done + n]);
                drive.write_sectors(lba, &raw)?;
            }
            done += n;
        }

        fat.flush(&mut *drive)?;

        if end > old_size {
            entry.file_size = end;
            if parent != 0 {
                self.rewrite_dir_entry(&mut fat, &mut drive, parent, parent_offset, &entry)?;
            }
            let unit = inodes.lookup_mut(node.inode).ok_or(NOT_CACHED)?;
            unit.dir_entry.file_size = end;
            unit.node.length = end;
        }

        log::trace!("[FAT] wrote {} bytes of inode {} at {}", done, node.inode, offset);
        Ok(done)
    }

    fn open(&self, node: &FileNode) -> Result<()> {
        self.check_node(node)?;
        let mut inodes = self.inodes.lock();
        let unit = inodes.lookup_mut(node.inode).ok_or(NOT_CACHED)?;
        if !unit.node.is_permanent() {
            unit.node.ref_count += 1;
        }
        Ok(())
    }

    fn close(&self, node: &FileNode) -> Result<()> {
        self.check_node(node)?;
        let mut inodes = self.inodes.lock();
        let unit = inodes.lookup_mut(node.inode).ok_or(NOT_CACHED)?;
        if unit.node.is_permanent() {
            return Ok(());
        }
        if unit.node.ref_count == 0 {
            return Err(Error::new(ErrorKind::InvalidState, "Node is not open"));
        }
        unit.node.ref_count -= 1;
        Ok(())
    }

    fn read_dir(&self, node: &FileNode, index: usize) -> Result<Option<DirEnt>> {
        let dir_cluster = self.directory_cluster(node)?;

        let mut found = None;
        {
            let mut fat = self.fat.lock();
            let mut drive = self.drive.lock();
            let mut seen = 0;
            self.scan_directory(&mut fat, &mut drive, dir_cluster, DirScanner::new(), |slot| {
                if seen == index {
                    found = Some(slot);
                    return ControlFlow::Break(());
                }
                seen += 1;
                ControlFlow::Continue(())
            })?;
        }

        let Some(slot) = found else {
            return Ok(None);
        };
        let inode = self.inodes.lock().entry_inode(&slot.entry, dir_cluster, slot.offset)?;
        Ok(Some(DirEnt {
            name: slot.entry.short_name(),
            inode,
            node_type: entry_type(&slot.entry),
        }))
    }

    fn find_dir(&self, node: &FileNode, name: &str) -> Result<Option<FileNode>> {
        let dir_cluster = self.directory_cluster(node)?;
        if name == "." {
            return Ok(self.lookup_inode(node.inode));
        }

        let mut found = None;
        {
            let mut fat = self.fat.lock();
            let mut drive = self.drive.lock();
            self.scan_directory(&mut fat, &mut drive, dir_cluster, DirScanner::with_dots(), |slot| {
                if slot.entry.matches_name(name) {
                    found = Some(slot);
                    return ControlFlow::Break(());
                }
                ControlFlow::Continue(())
            })?;
        }

        let Some(slot) = found else {
            return Ok(None);
        };
        // 点目录项不是目标目录自己的目录项，不能用来建立缓存单元；
        // ".." 指向簇 0 表示父目录是根目录
        if slot.entry.is_dot_entry() {
            return self.resolve_directory(slot.entry.first_cluster()).map(Some);
        }

        let short_name = slot.entry.short_name();
        let mut inodes = self.inodes.lock();
        let inode = inodes.entry_inode(&slot.entry, dir_cluster, slot.offset)?;
        let unit = inodes.read_inode(inode, &slot.entry, dir_cluster, slot.offset, &short_name, false)?;
        Ok(Some(unit.node.clone()))
    }
}

impl<D, H> core::fmt::Debug for Fat32FileSystem<D, H> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Fat32FileSystem")
            .field("fs_id", &self.fs_id)
            .field("partition_start", &self.partition_start)
            .field("fat_begin", &self.fat_begin)
            .field("lba_start", &self.lba_start)
            .field("sectors_per_cluster", &self.sectors_per_cluster)
            .field("cluster_count", &self.cluster_count)
            .finish()
    }
}
