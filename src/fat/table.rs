//! FAT 表的按需分页视图
//!
//! FAT 按扇区组（8 个扇区，1024 个 32 位表项）分页载入，
//! 载入和写回都经过驱动器的缓存寄存器。只读写第一个 FAT。

use crate::{
    block::BlockDevice,
    cache::CacheRegister,
    consts::*,
    error::{Error, ErrorKind, Result},
    fs::SystemHal,
};
use alloc::vec;
use alloc::vec::Vec;
use byteorder::{ByteOrder, LittleEndian};
use core::num::NonZeroUsize;
use lru::LruCache;

const GROUP_BYTES: usize = FAT_SECTORS_PER_GROUP as usize * SECTOR_SIZE;

/// 一个 FAT 扇区组
#[derive(Debug, Clone)]
pub struct FatSectorGroup {
    entries: Vec<u32>,
    modified: bool,
}

impl FatSectorGroup {
    fn from_bytes(raw: &[u8]) -> Result<Self> {
        let mut entries = Vec::new();
        entries.try_reserve_exact(FAT_ENTRIES_PER_GROUP as usize)?;
        entries.resize(FAT_ENTRIES_PER_GROUP as usize, 0);
        LittleEndian::read_u32_into(&raw[..GROUP_BYTES], &mut entries);
        Ok(Self {
            entries,
            modified: false,
        })
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut raw = vec![0u8; GROUP_BYTES];
        LittleEndian::write_u32_into(&self.entries, &mut raw);
        raw
    }

    /// 组内第 `offset` 个原始表项（含保留的高 4 位）
    pub fn raw_entry(&self, offset: usize) -> u32 {
        self.entries[offset]
    }

    /// 是否有未写回的修改
    pub fn is_modified(&self) -> bool {
        self.modified
    }
}

/// FAT 表
pub struct FaTable {
    /// 第一个 FAT 的起始扇区（绝对 LBA）
    fat_begin: u64,
    /// 每个 FAT 的扇区数
    sectors_per_fat: u32,
    /// 第一个无效簇号
    cluster_limit: u32,
    /// 已载入的扇区组
    groups: LruCache<u32, FatSectorGroup>,
    /// 下一次分配的起始搜索位置
    alloc_hint: u32,
}

impl FaTable {
    /// 创建 FAT 视图
    ///
    /// # 参数
    ///
    /// * `fat_begin` - 第一个 FAT 的起始扇区（绝对 LBA）
    /// * `sectors_per_fat` - 每个 FAT 的扇区数
    /// * `cluster_count` - 数据簇数量（簇号从 2 开始）
    /// * `max_groups` - 同时缓存的扇区组上限，`None` 表示不限
    pub fn new(
        fat_begin: u64,
        sectors_per_fat: u32,
        cluster_count: u32,
        max_groups: Option<NonZeroUsize>,
    ) -> Self {
        let fat_entries = sectors_per_fat.saturating_mul((SECTOR_SIZE / 4) as u32);
        let cluster_limit = cluster_count
            .saturating_add(FAT_FIRST_DATA_CLUSTER)
            .min(fat_entries);

        Self {
            fat_begin,
            sectors_per_fat,
            cluster_limit,
            groups: match max_groups {
                Some(cap) => LruCache::new(cap),
                None => LruCache::unbounded(),
            },
            alloc_hint: FAT_FIRST_DATA_CLUSTER,
        }
    }

    /// 第一个无效簇号
    pub fn cluster_limit(&self) -> u32 {
        self.cluster_limit
    }

    /// 已载入的扇区组数
    pub fn loaded_groups(&self) -> usize {
        self.groups.len()
    }

    fn check_cluster(&self, cluster: u32) -> Result<()> {
        if cluster >= self.cluster_limit {
            log::warn!("[FAT] cluster {} out of range (limit {})", cluster, self.cluster_limit);
            return Err(Error::new(ErrorKind::InvalidInput, "Cluster number out of range"));
        }
        Ok(())
    }

    /// 获取下一个簇号
    ///
    /// 扇区组未载入时先通过缓存寄存器载入。返回值已去掉保留的高 4 位，
    /// 可能是下一个簇号、0（空闲）或大于等于 `FAT_END_OF_CHAIN` 的链尾标记。
    ///
    /// # 错误
    ///
    /// - `InvalidInput` - 簇号超出 FAT 范围
    /// - 载入扇区组时的设备错误
    pub fn get_next_cluster<D: BlockDevice, H: SystemHal>(
        &mut self,
        drive: &mut CacheRegister<D, H>,
        cluster: u32,
    ) -> Result<u32> {
        self.check_cluster(cluster)?;
        let group = self.load_group(drive, cluster / FAT_ENTRIES_PER_GROUP)?;
        Ok(group.entries[(cluster % FAT_ENTRIES_PER_GROUP) as usize] & FAT32_ENTRY_MASK)
    }

    /// 设置簇的下一个簇号
    ///
    /// 保留原表项的高 4 位。修改只在 [`flush`](Self::flush) 时写入缓存。
    pub fn set_next_cluster<D: BlockDevice, H: SystemHal>(
        &mut self,
        drive: &mut CacheRegister<D, H>,
        cluster: u32,
        value: u32,
    ) -> Result<()> {
        self.check_cluster(cluster)?;
        let group = self.load_group(drive, cluster / FAT_ENTRIES_PER_GROUP)?;
        let entry = &mut group.entries[(cluster % FAT_ENTRIES_PER_GROUP) as usize];
        *entry = (*entry & !FAT32_ENTRY_MASK) | (value & FAT32_ENTRY_MASK);
        group.modified = true;
        log::trace!("[FAT] cluster {} -> {:#x}", cluster, value);
        Ok(())
    }

    /// 把所有修改过的扇区组写入缓存寄存器
    ///
    /// # 返回
    ///
    /// 写入的扇区组数
    pub fn flush<D: BlockDevice, H: SystemHal>(&mut self, drive: &mut CacheRegister<D, H>) -> Result<usize> {
        let mut written = 0;
        for (&index, group) in self.groups.iter_mut() {
            if group.modified {
                store_group(drive, self.fat_begin, self.sectors_per_fat, index, group)?;
                group.modified = false;
                written += 1;
            }
        }
        if written > 0 {
            log::debug!("[FAT] flushed {} sector groups", written);
        }
        Ok(written)
    }

    /// 遍历簇链
    ///
    /// # 错误
    ///
    /// 链中出现 0、1、坏簇、越界簇号或长度超过簇总数（环）时返回 `Corrupted`
    pub fn chain<D: BlockDevice, H: SystemHal>(
        &mut self,
        drive: &mut CacheRegister<D, H>,
        first: u32,
    ) -> Result<Vec<u32>> {
        let mut chain = Vec::new();
        self.walk(drive, first, |cluster| {
            chain.try_reserve(1)?;
            chain.push(cluster);
            Ok(())
        })?;
        Ok(chain)
    }

    /// 簇链长度
    pub fn count_clusters<D: BlockDevice, H: SystemHal>(
        &mut self,
        drive: &mut CacheRegister<D, H>,
        first: u32,
    ) -> Result<u32> {
        let mut count = 0;
        self.walk(drive, first, |_| {
            count += 1;
            Ok(())
        })?;
        Ok(count)
    }

    fn walk<D, H, F>(&mut self, drive: &mut CacheRegister<D, H>, first: u32, mut visit: F) -> Result<()>
    where
        D: BlockDevice,
        H: SystemHal,
        F: FnMut(u32) -> Result<()>,
    {
        let max_len = self.cluster_limit.saturating_sub(FAT_FIRST_DATA_CLUSTER);
        let mut visited = 0u32;
        let mut cluster = first;

        loop {
            if cluster < FAT_FIRST_DATA_CLUSTER || cluster == FAT_BAD_CLUSTER || cluster >= self.cluster_limit {
                log::error!("[FAT] chain from {} hits invalid cluster {:#x}", first, cluster);
                return Err(Error::new(ErrorKind::Corrupted, "Invalid cluster in chain"));
            }
            if visited >= max_len {
                log::error!("[FAT] chain from {} loops", first);
                return Err(Error::new(ErrorKind::Corrupted, "Cluster chain loops"));
            }

            visit(cluster)?;
            visited += 1;

            let next = self.get_next_cluster(drive, cluster)?;
            if next >= FAT_END_OF_CHAIN {
                return Ok(());
            }
            cluster = next;
        }
    }

    /// 分配一个空闲簇并标记为链尾
    ///
    /// # 参数
    ///
    /// * `prev` - 若给出，把新簇链接到它之后
    ///
    /// # 错误
    ///
    /// 没有空闲簇时返回 `NoSpace`
    pub fn allocate_cluster<D: BlockDevice, H: SystemHal>(
        &mut self,
        drive: &mut CacheRegister<D, H>,
        prev: Option<u32>,
    ) -> Result<u32> {
        let start = self.alloc_hint.clamp(FAT_FIRST_DATA_CLUSTER, self.cluster_limit.max(FAT_FIRST_DATA_CLUSTER + 1) - 1);
        let span = self.cluster_limit.saturating_sub(FAT_FIRST_DATA_CLUSTER);

        for i in 0..span {
            let cluster = FAT_FIRST_DATA_CLUSTER + (start - FAT_FIRST_DATA_CLUSTER + i) % span;
            if self.get_next_cluster(drive, cluster)? != FAT_FREE_CLUSTER {
                continue;
            }

            self.set_next_cluster(drive, cluster, FAT_END_OF_CHAIN_MARK)?;
            if let Some(prev) = prev {
                self.set_next_cluster(drive, prev, cluster)?;
            }
            self.alloc_hint = cluster + 1;
            log::debug!("[FAT] allocated cluster {} (prev {:?})", cluster, prev);
            return Ok(cluster);
        }

        Err(Error::new(ErrorKind::NoSpace, "No free clusters"))
    }

    fn load_group<D: BlockDevice, H: SystemHal>(
        &mut self,
        drive: &mut CacheRegister<D, H>,
        index: u32,
    ) -> Result<&mut FatSectorGroup> {
        if !self.groups.contains(&index) {
            let group = self.read_group(drive, index)?;
            self.make_room(drive)?;
            self.groups.put(index, group);
        }
        self.groups
            .get_mut(&index)
            .ok_or(Error::new(ErrorKind::InvalidState, "FAT sector group vanished"))
    }

    fn read_group<D: BlockDevice, H: SystemHal>(
        &self,
        drive: &mut CacheRegister<D, H>,
        index: u32,
    ) -> Result<FatSectorGroup> {
        let mut raw = vec![0u8; GROUP_BYTES];
        let sectors = group_sectors(self.sectors_per_fat, index);
        // FAT 末尾之后的部分保持为 0
        if sectors > 0 {
            let lba = self.fat_begin + (index * FAT_SECTORS_PER_GROUP) as u64;
            drive.read_sectors(lba, &mut raw[..sectors * SECTOR_SIZE])?;
        }
        log::debug!("[FAT] loaded sector group {} ({} sectors)", index, sectors);
        FatSectorGroup::from_bytes(&raw)
    }

    fn make_room<D: BlockDevice, H: SystemHal>(&mut self, drive: &mut CacheRegister<D, H>) -> Result<()> {
        if self.groups.len() < self.groups.cap().get() {
            return Ok(());
        }
        let Some((index, group)) = self.groups.pop_lru() else {
            return Ok(());
        };
        if group.modified {
            if let Err(e) = store_group(drive, self.fat_begin, self.sectors_per_fat, index, &group) {
                self.groups.put(index, group);
                return Err(e);
            }
        }
        log::debug!("[FAT] dropped sector group {}", index);
        Ok(())
    }
}

impl core::fmt::Debug for FaTable {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FaTable")
            .field("fat_begin", &self.fat_begin)
            .field("sectors_per_fat", &self.sectors_per_fat)
            .field("cluster_limit", &self.cluster_limit)
            .field("loaded_groups", &self.groups.len())
            .finish()
    }
}

/// 扇区组中实际属于 FAT 的扇区数
fn group_sectors(sectors_per_fat: u32, index: u32) -> usize {
    let first = index.saturating_mul(FAT_SECTORS_PER_GROUP);
    sectors_per_fat.saturating_sub(first).min(FAT_SECTORS_PER_GROUP) as usize
}

fn store_group<D: BlockDevice, H: SystemHal>(
    drive: &mut CacheRegister<D, H>,
    fat_begin: u64,
    sectors_per_fat: u32,
    index: u32,
    group: &FatSectorGroup,
) -> Result<()> {
    let sectors = group_sectors(sectors_per_fat, index);
    if sectors == 0 {
        return Ok(());
    }
    let raw = group.to_bytes();
    let lba = fat_begin + (index * FAT_SECTORS_PER_GROUP) as u64;
    drive.write_sectors(lba, &raw[..sectors * SECTOR_SIZE])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::mock::MockDevice;
    use crate::fs::LogicalClock;

    const FAT_BEGIN: u64 = 32;
    const SECTORS_PER_FAT: u32 = 12;

    fn drive_with_fat(entries: &[(u32, u32)]) -> CacheRegister<MockDevice, LogicalClock> {
        let mut device = MockDevice::new(128);
        let bytes = device.disk.as_bytes_mut();
        for &(cluster, value) in entries {
            let off = FAT_BEGIN as usize * SECTOR_SIZE + cluster as usize * 4;
            LittleEndian::write_u32(&mut bytes[off..], value);
        }
        CacheRegister::with_device(0, device, LogicalClock::new()).unwrap()
    }

    fn table() -> FaTable {
        FaTable::new(FAT_BEGIN, SECTORS_PER_FAT, 1500, None)
    }

    #[test]
    fn test_chain_termination() {
        let mut drive = drive_with_fat(&[(5, 9), (9, FAT_END_OF_CHAIN)]);
        let mut fat = table();

        assert_eq!(fat.get_next_cluster(&mut drive, 5).unwrap(), 9);
        assert!(fat.get_next_cluster(&mut drive, 9).unwrap() >= FAT_END_OF_CHAIN);
        assert_eq!(fat.chain(&mut drive, 5).unwrap(), vec![5, 9]);
        assert_eq!(fat.count_clusters(&mut drive, 5).unwrap(), 2);
    }

    #[test]
    fn test_group_loaded_once() {
        let mut drive = drive_with_fat(&[(2, FAT_END_OF_CHAIN_MARK)]);
        let mut fat = table();

        fat.get_next_cluster(&mut drive, 2).unwrap();
        fat.get_next_cluster(&mut drive, 3).unwrap();
        assert_eq!(fat.loaded_groups(), 1);
        assert_eq!(drive.device().unwrap().reads, vec![(32u64, 8u32)]);
    }

    #[test]
    fn test_entry_masked_to_28_bits() {
        let mut drive = drive_with_fat(&[(7, 0xF000_0010)]);
        let mut fat = table();
        assert_eq!(fat.get_next_cluster(&mut drive, 7).unwrap(), 0x10);
    }

    #[test]
    fn test_sparse_tail_group_is_zero_filled() {
        // 第二组只有 4 个扇区属于 FAT，其余部分视为 0
        let mut drive = drive_with_fat(&[]);
        drive.device_mut().unwrap().disk.as_bytes_mut()[(FAT_BEGIN as usize + 12) * SECTOR_SIZE] = 0xFF;
        let mut fat = FaTable::new(FAT_BEGIN, SECTORS_PER_FAT, 2000, None);
        assert_eq!(fat.cluster_limit(), 12 * 128);

        assert_eq!(fat.get_next_cluster(&mut drive, 1535).unwrap(), 0);
        // 表项 1536 落在 FAT 之外的扇区上
        assert_eq!(fat.group_raw(1, 1536 % FAT_ENTRIES_PER_GROUP), 0);
    }

    #[test]
    fn test_out_of_range() {
        let mut drive = drive_with_fat(&[]);
        let mut fat = table();
        let err = fat.get_next_cluster(&mut drive, 1502).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn test_corrupted_chains() {
        let mut drive = drive_with_fat(&[(3, 4), (4, 0), (10, 11), (11, 10), (20, FAT_BAD_CLUSTER)]);
        let mut fat = table();

        assert_eq!(fat.chain(&mut drive, 3).unwrap_err().kind(), ErrorKind::Corrupted);
        assert_eq!(fat.chain(&mut drive, 10).unwrap_err().kind(), ErrorKind::Corrupted);
        assert_eq!(fat.chain(&mut drive, 20).unwrap_err().kind(), ErrorKind::Corrupted);
        assert_eq!(fat.chain(&mut drive, 0).unwrap_err().kind(), ErrorKind::Corrupted);
    }

    #[test]
    fn test_set_keeps_reserved_bits_and_flushes() {
        let mut drive = drive_with_fat(&[(6, 0xA000_0000)]);
        let mut fat = table();

        fat.set_next_cluster(&mut drive, 6, 0x1234).unwrap();
        assert_eq!(fat.get_next_cluster(&mut drive, 6).unwrap(), 0x1234);
        assert_eq!(fat.flush(&mut drive).unwrap(), 1);
        assert_eq!(fat.flush(&mut drive).unwrap(), 0);

        drive.flush_all().unwrap();
        let off = FAT_BEGIN as usize * SECTOR_SIZE + 6 * 4;
        let raw = LittleEndian::read_u32(&drive.device().unwrap().disk.as_bytes()[off..]);
        assert_eq!(raw, 0xA000_1234);
    }

    #[test]
    fn test_bounded_groups_write_back_on_drop() {
        let mut drive = drive_with_fat(&[]);
        let mut fat = FaTable::new(FAT_BEGIN, SECTORS_PER_FAT, 1500, NonZeroUsize::new(1));

        fat.set_next_cluster(&mut drive, 2, FAT_END_OF_CHAIN_MARK).unwrap();
        // 载入第二组会挤掉第一组，第一组的修改先写回
        fat.get_next_cluster(&mut drive, 1100).unwrap();
        assert_eq!(fat.loaded_groups(), 1);

        assert_eq!(fat.get_next_cluster(&mut drive, 2).unwrap(), FAT_END_OF_CHAIN_MARK);
    }

    #[test]
    fn test_allocate_cluster_links_prev() {
        let mut drive = drive_with_fat(&[(2, FAT_END_OF_CHAIN_MARK), (3, FAT_END_OF_CHAIN_MARK)]);
        let mut fat = table();

        let new = fat.allocate_cluster(&mut drive, Some(3)).unwrap();
        assert_eq!(new, 4);
        assert_eq!(fat.chain(&mut drive, 3).unwrap(), vec![3, 4]);

        let next = fat.allocate_cluster(&mut drive, None).unwrap();
        assert_eq!(next, 5);
    }

    #[test]
    fn test_allocate_when_full() {
        let mut drive = drive_with_fat(&[(2, FAT_END_OF_CHAIN_MARK), (3, FAT_END_OF_CHAIN_MARK)]);
        let mut fat = FaTable::new(FAT_BEGIN, SECTORS_PER_FAT, 2, None);
        assert_eq!(fat.allocate_cluster(&mut drive, None).unwrap_err().kind(), ErrorKind::NoSpace);
    }

    impl FaTable {
        fn group_raw(&mut self, index: u32, offset: u32) -> u32 {
            self.groups.peek(&index).map_or(u32::MAX, |g| g.raw_entry(offset as usize))
        }
    }
}
