//! 缓存寄存器实现
//!
//! 每个驱动器一个 [`CacheRegister`]，以规范化后的 LBA 为键，
//! 通过 [`HashTable`] 索引该驱动器的所有缓存单元。
//!
//! # 写回
//!
//! 缓存单元只能通过从哈希表删除来销毁，删除前 [`WriteBackPolicy::on_erase`]
//! 会把已修改的页写回设备；写回失败时单元保留在缓存中并保持脏状态。
//!
//! # 驱逐
//!
//! [`CacheRegister::evict_least_used`] 不维护额外的 LRU 链表：
//! 第一遍找到 `last_access` 最小的单元，第二遍删除地址与之相同的单元。

use crate::{
    block::{BlockDevice, DriveId},
    consts::{normalize_lba, PAGE_SIZE, SECTORS_PER_PAGE},
    error::{Error, ErrorKind, Result},
    fs::{FsConfig, SystemHal},
    hash::{ForEachOp, HashCallbacks, HashTable},
};

use super::buffer::CacheUnit;
use alloc::boxed::Box;
use core::ptr;

const NOT_INITIALISED: Error = Error::new(ErrorKind::InvalidState, "Cache register is not initialised");

/// 以 `lba` 开始的页在设备上实际存在的扇区数
///
/// 设备大小不是 8 扇区的整数倍时最后一页只有前几个扇区，其余部分在缓存中保持为零。
///
/// # 错误
///
/// `lba` 不在设备范围内时返回 `InvalidInput`
fn page_span(total_sectors: u64, lba: u64) -> Result<u32> {
    match total_sectors.checked_sub(lba) {
        Some(left) if left > 0 => Ok(left.min(SECTORS_PER_PAGE) as u32),
        _ => Err(Error::new(ErrorKind::InvalidInput, "Page lies beyond the end of the device")),
    }
}

/// 缓存统计信息
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// 缓存命中次数
    pub hits: u64,
    /// 缓存未命中次数（新建缓存单元）
    pub misses: u64,
    /// 脏页写回次数
    pub writebacks: u64,
    /// LRU 驱逐次数
    pub evictions: u64,
}

impl CacheStats {
    /// 计算命中率
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// 缓存单元的哈希回调，持有设备以便在删除前写回
pub struct WriteBackPolicy<D> {
    device: D,
    drive_id: DriveId,
    writebacks: u64,
}

impl<D: BlockDevice> WriteBackPolicy<D> {
    /// 如果单元已修改，把整页写回设备并标记为干净
    ///
    /// # 返回
    ///
    /// 是否执行了写回
    fn write_back(&mut self, unit: &mut CacheUnit) -> Result<bool> {
        if !unit.is_modified() {
            return Ok(false);
        }

        let count = page_span(self.device.total_sectors(), unit.lba)?;
        self.device
            .write_blocks(unit.lba, count, unit.data())
            .map_err(|e| {
                log::error!(
                    "[CACHE] drive {} write-back of LBA={:#x} failed: {}",
                    self.drive_id,
                    unit.lba,
                    e
                );
                e
            })?;

        unit.mark_clean();
        self.writebacks += 1;
        log::debug!("[CACHE] drive {} wrote back LBA={:#x}", self.drive_id, unit.lba);
        Ok(true)
    }
}

impl<D: BlockDevice> HashCallbacks<u64, Box<CacheUnit>> for WriteBackPolicy<D> {
    fn hash(&self, lba: &u64) -> u32 {
        let page = *lba / SECTORS_PER_PAGE;
        (page as u32) ^ ((page >> 32) as u32)
    }

    fn equals(&self, a: &u64, b: &u64) -> bool {
        a == b
    }

    fn on_erase(&mut self, _lba: &u64, unit: &mut Box<CacheUnit>) -> Result<()> {
        self.write_back(unit).map(|_| ())
    }
}

type UnitTable<D> = HashTable<u64, Box<CacheUnit>, WriteBackPolicy<D>>;

/// 缓存寄存器
///
/// 一个驱动器的页缓存。未初始化的寄存器不持有设备，所有查找都返回空。
pub struct CacheRegister<D, H> {
    pub(super) table: Option<UnitTable<D>>,
    pub(super) hal: Option<H>,
    pub(super) drive_id: DriveId,
    pub(super) config: FsConfig,
    pub(super) stats: CacheStats,
}

impl<D, H> Default for CacheRegister<D, H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D, H> CacheRegister<D, H> {
    /// 创建一个未使用的寄存器
    pub const fn new() -> Self {
        Self {
            table: None,
            hal: None,
            drive_id: 0,
            config: FsConfig {
                max_cache_units: crate::consts::DEFAULT_CACHE_SIZE,
                evict_batch: crate::consts::DEFAULT_EVICT_BATCH,
                refresh_on_hit: false,
                max_fat_groups: None,
            },
            stats: CacheStats {
                hits: 0,
                misses: 0,
                writebacks: 0,
                evictions: 0,
            },
        }
    }

    /// 寄存器是否已初始化
    pub fn is_used(&self) -> bool {
        self.table.is_some()
    }

    /// 驱动器 ID
    pub fn drive_id(&self) -> DriveId {
        self.drive_id
    }

    /// 当前缓存单元数
    pub fn len(&self) -> usize {
        self.table.as_ref().map_or(0, |t| t.len())
    }

    /// 是否没有缓存单元
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 当前配置
    pub fn config(&self) -> &FsConfig {
        &self.config
    }

    /// 底层设备
    pub fn device(&self) -> Option<&D> {
        self.table.as_ref().map(|t| &t.callbacks().device)
    }

    /// 底层设备（可变）
    ///
    /// 直接修改设备内容会绕过缓存。
    pub fn device_mut(&mut self) -> Option<&mut D> {
        self.table.as_mut().map(|t| &mut t.callbacks_mut().device)
    }
}

impl<D: BlockDevice, H: SystemHal> CacheRegister<D, H> {
    /// 创建并初始化寄存器
    pub fn with_device(drive_id: DriveId, device: D, hal: H) -> Result<Self> {
        let mut reg = Self::new();
        reg.init(drive_id, device, hal)?;
        Ok(reg)
    }

    /// 激活寄存器
    ///
    /// # 错误
    ///
    /// - `InvalidState` - 寄存器已经初始化过
    /// - `NoMemory` - 哈希表分配失败
    pub fn init(&mut self, drive_id: DriveId, device: D, hal: H) -> Result<()> {
        if self.is_used() {
            return Err(Error::new(ErrorKind::InvalidState, "Cache register already initialised"));
        }

        let table = HashTable::create(WriteBackPolicy {
            device,
            drive_id,
            writebacks: 0,
        })?;

        self.table = Some(table);
        self.hal = Some(hal);
        self.drive_id = drive_id;
        self.stats = CacheStats::default();
        log::debug!("[CACHE] register for drive {} initialised", drive_id);
        Ok(())
    }

    /// 设置缓存策略
    pub fn set_config(&mut self, config: FsConfig) -> Result<()> {
        config.validate()?;
        self.config = config;
        Ok(())
    }

    /// 查找缓存单元
    ///
    /// `lba` 会被规范化到 8 扇区边界。不更新 `last_access`。
    pub fn lookup(&self, lba: u64) -> Option<&CacheUnit> {
        self.table.as_ref()?.lookup(&normalize_lba(lba)).map(|unit| &**unit)
    }

    /// 查找缓存单元（可变）
    ///
    /// 不更新 `last_access`。
    pub fn lookup_mut(&mut self, lba: u64) -> Option<&mut CacheUnit> {
        self.table
            .as_mut()?
            .lookup_mut(&normalize_lba(lba))
            .map(|unit| &mut **unit)
    }

    /// 添加缓存单元
    ///
    /// # 参数
    ///
    /// * `lba` - 扇区号，会被规范化到 8 扇区边界
    /// * `data` - 初始页内容；为 `None` 时从设备读取 8 个扇区（设备末尾不足一页时只读存在的扇区）
    ///
    /// # 错误
    ///
    /// - `AlreadyExists` - 该页已在缓存中
    /// - `InvalidInput` - `data` 不足一页，或页起点超出设备
    /// - `NoMemory` - 页或表分配失败
    /// - 设备读取错误原样返回
    pub fn add(&mut self, lba: u64, data: Option<&[u8]>) -> Result<&mut CacheUnit> {
        let Self {
            table,
            hal,
            drive_id,
            stats,
            ..
        } = self;
        let table = table.as_mut().ok_or(NOT_INITIALISED)?;
        let hal = hal.as_ref().ok_or(NOT_INITIALISED)?;
        let lba = normalize_lba(lba);

        if table.lookup(&lba).is_some() {
            return Err(Error::new(ErrorKind::AlreadyExists, "LBA already cached"));
        }
        let span = page_span(table.callbacks().device.total_sectors(), lba)?;

        let mut page = hal.allocate_page()?;
        match data {
            Some(src) => {
                if src.len() < PAGE_SIZE {
                    return Err(Error::new(ErrorKind::InvalidInput, "Seed data is shorter than a page"));
                }
                page.as_mut_slice().copy_from_slice(&src[..PAGE_SIZE]);
            }
            None => {
                table
                    .callbacks_mut()
                    .device
                    .read_blocks(lba, span, page.as_mut_slice())
                    .map_err(|e| {
                        log::error!("[CACHE] drive {} read of LBA={:#x} failed: {}", drive_id, lba, e);
                        e
                    })?;
            }
        }

        let unit = Box::new(CacheUnit::new(lba, page, *drive_id, hal.tick_count()));
        table.set(lba, unit)?;
        stats.misses += 1;
        log::debug!(
            "[CACHE] drive {} added LBA={:#x} ({}), {} units",
            drive_id,
            lba,
            if data.is_some() { "seeded" } else { "read" },
            table.len()
        );

        table
            .lookup_mut(&lba)
            .map(|unit| &mut **unit)
            .ok_or(Error::new(ErrorKind::InvalidState, "Inserted unit not found"))
    }

    /// 驱逐 `last_access` 最小的缓存单元
    ///
    /// # 返回
    ///
    /// 缓存为空时返回 `Ok(false)`
    ///
    /// # 错误
    ///
    /// 脏页写回失败时返回错误，该单元保留
    pub fn evict_least_used(&mut self) -> Result<bool> {
        let Some(table) = self.table.as_mut() else {
            return Ok(false);
        };

        let mut oldest: Option<(*const CacheUnit, u32, u64)> = None;
        for (_, unit) in table.iter() {
            if oldest.map_or(true, |(_, tick, _)| unit.last_access < tick) {
                oldest = Some((&**unit as *const CacheUnit, unit.last_access, unit.lba));
            }
        }
        let Some((target, tick, lba)) = oldest else {
            return Ok(false);
        };

        let mut erased = false;
        table.for_each(|_, unit| {
            if !erased && ptr::eq(&**unit, target) {
                erased = true;
                ForEachOp::Erase
            } else {
                ForEachOp::NoOp
            }
        })?;

        if erased {
            self.stats.evictions += 1;
            log::debug!("[CACHE] drive {} evicted LBA={:#x} (last_access={})", self.drive_id, lba, tick);
        }
        Ok(erased)
    }

    /// 删除所有缓存单元，脏页先写回
    ///
    /// # 返回
    ///
    /// 删除的单元数
    pub fn flush_all(&mut self) -> Result<usize> {
        let Some(table) = self.table.as_mut() else {
            return Ok(0);
        };
        let count = table.clear()?;
        log::debug!("[CACHE] drive {} flushed {} units", self.drive_id, count);
        Ok(count)
    }

    /// 写回所有脏页，不驱逐
    ///
    /// # 返回
    ///
    /// 写回的页数
    pub fn sync(&mut self) -> Result<usize> {
        let Some(table) = self.table.as_mut() else {
            return Ok(0);
        };

        let mut written = 0;
        table.for_each_with_callbacks(|policy, _, unit| {
            if policy.write_back(unit)? {
                written += 1;
            }
            Ok(())
        })?;
        table.callbacks_mut().device.flush()?;
        Ok(written)
    }

    /// 释放寄存器并取回设备
    ///
    /// 先删除所有单元（脏页写回），然后关闭设备。失败时寄存器保持不变。
    pub fn release(&mut self) -> Result<D> {
        self.flush_all()?;

        let table = self.table.take().ok_or(NOT_INITIALISED)?;
        self.hal = None;
        let mut device = table.into_callbacks()?.device;
        device.flush()?;
        device.close()?;
        log::debug!("[CACHE] register for drive {} released", self.drive_id);
        Ok(device)
    }

    /// 绕过缓存读取扇区
    pub fn read_no_cache(&mut self, lba: u64, count: u32, buf: &mut [u8]) -> Result<usize> {
        let table = self.table.as_mut().ok_or(NOT_INITIALISED)?;
        table.callbacks_mut().device.read_blocks(lba, count, buf)
    }

    /// 绕过缓存写入扇区
    ///
    /// 调用者负责保证写入范围不在缓存中，否则会被缓存中的旧页覆盖。
    pub fn write_no_cache(&mut self, lba: u64, count: u32, buf: &[u8]) -> Result<usize> {
        let table = self.table.as_mut().ok_or(NOT_INITIALISED)?;
        table.callbacks_mut().device.write_blocks(lba, count, buf)
    }

    /// 统计信息
    pub fn stats(&self) -> CacheStats {
        let mut stats = self.stats;
        stats.writebacks = self.table.as_ref().map_or(0, |t| t.callbacks().writebacks);
        stats
    }

    /// 当前时钟计数
    pub(super) fn tick(&self) -> u32 {
        self.hal.as_ref().map_or(0, |hal| hal.tick_count())
    }

    /// 输出缓存内容到日志
    pub fn debug_dump(&self) {
        let Some(table) = self.table.as_ref() else {
            log::info!("[CACHE] drive {}: register not in use", self.drive_id);
            return;
        };

        log::info!(
            "[CACHE] drive {}: {} units, {} buckets, ~{} bytes of index",
            self.drive_id,
            table.len(),
            table.bucket_count(),
            table.estimated_mem_used()
        );
        for (_, unit) in table.iter() {
            log::info!(
                "[CACHE]   {{lba={:#x}: modified={}, last_access={}}}",
                unit.lba,
                unit.is_modified(),
                unit.last_access
            );
        }
    }
}

impl<D, H> core::fmt::Debug for CacheRegister<D, H> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CacheRegister")
            .field("drive_id", &self.drive_id)
            .field("used", &self.is_used())
            .field("len", &self.len())
            .field("stats", &self.stats)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::mock::MockDevice;
    use crate::block::DriveStatus;
    use crate::fs::LogicalClock;
    use alloc::vec;

    fn register(sectors: u64) -> CacheRegister<MockDevice, LogicalClock> {
        CacheRegister::with_device(0, MockDevice::new(sectors), LogicalClock::new()).unwrap()
    }

    #[test]
    fn test_unused_register() {
        let mut reg: CacheRegister<MockDevice, LogicalClock> = CacheRegister::new();
        assert!(!reg.is_used());
        assert!(reg.lookup(0).is_none());
        assert_eq!(reg.flush_all().unwrap(), 0);
        assert!(!reg.evict_least_used().unwrap());
        assert_eq!(reg.add(0, None).unwrap_err().kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn test_accessors_need_no_device_bounds() {
        let mut reg: CacheRegister<(), ()> = CacheRegister::new();
        assert_eq!(reg.len(), 0);
        assert!(reg.is_empty());
        assert!(reg.device().is_none());
        assert!(reg.device_mut().is_none());
        assert!(alloc::format!("{:?}", reg).contains("len: 0"));
    }

    #[test]
    fn test_double_init_rejected() {
        let mut reg = register(64);
        let err = reg.init(1, MockDevice::new(8), LogicalClock::new()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert_eq!(reg.drive_id(), 0);
    }

    #[test]
    fn test_add_reads_one_page() {
        let mut reg = register(64);
        reg.device_mut().unwrap().disk.as_bytes_mut()[16 * 512] = 0x5A;

        let unit = reg.add(16, None).unwrap();
        assert_eq!(unit.lba, 16);
        assert_eq!(unit.data()[0], 0x5A);
        assert!(!unit.is_modified());

        assert_eq!(reg.device().unwrap().reads, vec![(16u64, 8u32)]);
        assert_eq!(reg.stats().misses, 1);
    }

    #[test]
    fn test_add_with_seed_skips_device() {
        let mut reg = register(64);
        let seed = vec![7u8; PAGE_SIZE];
        let unit = reg.add(8, Some(&seed)).unwrap();
        assert!(unit.data().iter().all(|&b| b == 7));
        assert!(reg.device().unwrap().reads.is_empty());

        let short = [0u8; 512];
        assert_eq!(reg.add(24, Some(&short)).unwrap_err().kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn test_add_clamps_tail_page() {
        let mut reg = register(20);
        reg.add(19, None).unwrap().write_at(3 * 512, &[0x66]);
        assert_eq!(reg.device().unwrap().reads, vec![(16u64, 4u32)]);

        let seed = vec![0u8; PAGE_SIZE];
        assert_eq!(reg.add(24, None).unwrap_err().kind(), ErrorKind::InvalidInput);
        assert_eq!(reg.add(24, Some(&seed)).unwrap_err().kind(), ErrorKind::InvalidInput);

        assert_eq!(reg.flush_all().unwrap(), 1);
        assert_eq!(reg.device().unwrap().writes[0].1, 4);
        assert_eq!(reg.device().unwrap().disk.as_bytes()[19 * 512], 0x66);
    }

    #[test]
    fn test_normalization() {
        let mut reg = register(64);
        reg.add(21, None).unwrap();
        for k in 0..8 {
            let unit = reg.lookup(16 + k).unwrap();
            assert_eq!(unit.lba, 16);
        }
        assert!(reg.lookup(24).is_none());
        assert_eq!(reg.add(23, None).unwrap_err().kind(), ErrorKind::AlreadyExists);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_lookup_is_idempotent() {
        let mut reg = register(64);
        reg.add(0, None).unwrap();

        let (first, access, modified) = {
            let unit = reg.lookup(3).unwrap();
            (unit as *const CacheUnit, unit.last_access, unit.is_modified())
        };
        let unit = reg.lookup(3).unwrap();
        assert!(ptr::eq(first, unit));
        assert_eq!(unit.last_access, access);
        assert_eq!(unit.is_modified(), modified);
    }

    #[test]
    fn test_device_read_failure_is_error() {
        let mut reg = register(64);
        reg.device_mut().unwrap().disk.set_status(DriveStatus::HardwareError);
        assert_eq!(reg.add(0, None).unwrap_err().kind(), ErrorKind::Io);
        assert!(reg.is_empty());
    }

    #[test]
    fn test_write_back_before_free() {
        let mut reg = register(64);
        let unit = reg.add(32, None).unwrap();
        unit.write_at(10, &[1, 2, 3]);
        let expected = unit.data().to_vec();

        reg.add(40, None).unwrap();
        assert_eq!(reg.flush_all().unwrap(), 2);

        let writes = &reg.device().unwrap().writes;
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].0, 32);
        assert_eq!(writes[0].1, 8);
        assert_eq!(writes[0].2, expected);
        assert_eq!(&reg.device().unwrap().disk.as_bytes()[32 * 512 + 10..32 * 512 + 13], &[1, 2, 3]);
        assert_eq!(reg.stats().writebacks, 1);
    }

    #[test]
    fn test_failed_write_back_keeps_unit() {
        let mut reg = register(64);
        reg.add(0, None).unwrap().write_at(0, &[9]);
        reg.device_mut().unwrap().disk.set_status(DriveStatus::HardwareError);

        assert_eq!(reg.flush_all().unwrap_err().kind(), ErrorKind::Io);
        let unit = reg.lookup(0).unwrap();
        assert!(unit.is_modified());
        assert_eq!(unit.data()[0], 9);

        reg.device_mut().unwrap().disk.set_status(DriveStatus::Success);
        assert_eq!(reg.flush_all().unwrap(), 1);
        assert_eq!(reg.device().unwrap().disk.as_bytes()[0], 9);
    }

    #[test]
    fn test_evict_picks_global_minimum() {
        let mut reg = register(256);
        for (lba, tick) in [(0u64, 50u32), (8, 10), (16, 30), (24, 20), (32, 40)] {
            reg.add(lba, None).unwrap().touch(tick);
        }

        assert!(reg.evict_least_used().unwrap());
        assert_eq!(reg.len(), 4);
        assert!(reg.lookup(8).is_none());
        for lba in [0, 16, 24, 32] {
            assert!(reg.lookup(lba).is_some());
        }
        assert_eq!(reg.stats().evictions, 1);

        assert!(reg.evict_least_used().unwrap());
        assert!(reg.lookup(24).is_none());
    }

    #[test]
    fn test_evict_empty() {
        let mut reg = register(8);
        assert!(!reg.evict_least_used().unwrap());
    }

    #[test]
    fn test_evict_writes_back_dirty_unit() {
        let mut reg = register(64);
        reg.add(0, None).unwrap().write_at(0, &[0xEE]);
        reg.add(8, None).unwrap();

        assert!(reg.evict_least_used().unwrap());
        assert!(reg.lookup(0).is_none());
        assert_eq!(reg.device().unwrap().writes.len(), 1);
        assert_eq!(reg.device().unwrap().writes[0].0, 0);
    }

    #[test]
    fn test_sync_keeps_units() {
        let mut reg = register(64);
        reg.add(0, None).unwrap().write_at(0, &[1]);
        reg.add(8, None).unwrap().write_at(0, &[2]);
        reg.add(16, None).unwrap();

        assert_eq!(reg.sync().unwrap(), 2);
        assert_eq!(reg.len(), 3);
        assert!(!reg.lookup(0).unwrap().is_modified());
        assert_eq!(reg.sync().unwrap(), 0);
    }

    #[test]
    fn test_release_returns_device() {
        let mut reg = register(64);
        reg.add(0, None).unwrap().write_at(5, &[0x42]);

        let device = reg.release().unwrap();
        assert!(!reg.is_used());
        assert_eq!(device.disk.as_bytes()[5], 0x42);

        reg.init(3, device, LogicalClock::new()).unwrap();
        assert_eq!(reg.drive_id(), 3);
    }

    #[test]
    fn test_no_cache_pass_through() {
        let mut reg = register(64);
        let data = vec![0x11u8; 512];
        reg.write_no_cache(5, 1, &data).unwrap();
        let mut buf = vec![0u8; 512];
        reg.read_no_cache(5, 1, &mut buf).unwrap();
        assert_eq!(buf, data);
        assert!(reg.is_empty());
    }

    #[test]
    fn test_debug_dump_does_not_mutate() {
        let mut reg = register(64);
        reg.add(0, None).unwrap();
        reg.debug_dump();
        assert_eq!(reg.len(), 1);
    }
}
