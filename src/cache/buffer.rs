//! 缓存单元结构
//!
//! 一个缓存单元恰好缓存一页（8 个扇区）的磁盘数据。

use crate::block::DriveId;
use crate::consts::{normalize_lba, PAGE_SIZE};
use crate::error::{Error, ErrorKind, Result};
use alloc::boxed::Box;
use alloc::vec::Vec;
use bitflags::bitflags;

bitflags! {
    /// 缓存单元标志
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CacheFlags: u8 {
        /// 数据已修改（脏），释放前必须写回设备
        const MODIFIED = 0x01;
    }
}

/// 可用于 DMA 的一页内存
///
/// 记录页的虚拟映射和物理地址。释放即 `Drop`。
pub struct DmaPage {
    data: Box<[u8]>,
    phys: u64,
}

impl DmaPage {
    /// 从堆上分配一页（恒等映射，物理地址即虚拟地址）
    ///
    /// # 错误
    ///
    /// 分配失败时返回 `NoMemory`
    pub fn allocate() -> Result<Self> {
        let mut data = Vec::new();
        data.try_reserve_exact(PAGE_SIZE)?;
        data.resize(PAGE_SIZE, 0);
        let data = data.into_boxed_slice();
        let phys = data.as_ptr() as u64;
        Ok(Self { data, phys })
    }

    /// 使用外部提供的页（例如物理页分配器给出的映射）
    ///
    /// # 参数
    ///
    /// * `data` - 页的虚拟映射，长度必须为一页
    /// * `phys` - 页的物理地址
    pub fn from_parts(data: Box<[u8]>, phys: u64) -> Result<Self> {
        if data.len() != PAGE_SIZE {
            return Err(Error::new(ErrorKind::InvalidInput, "DMA page must be exactly one page"));
        }
        Ok(Self { data, phys })
    }

    /// 物理地址
    pub fn phys_addr(&self) -> u64 {
        self.phys
    }

    /// 页内容
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// 页内容（可变）
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl core::fmt::Debug for DmaPage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DmaPage")
            .field("phys", &format_args!("{:#x}", self.phys))
            .field("len", &self.data.len())
            .finish()
    }
}

/// 缓存单元
///
/// # 字段说明
///
/// - `lba`: 起始扇区，总是 8 扇区对齐
/// - `page`: 缓存的一页数据
/// - `flags`: 状态标志
/// - `last_access`: 创建或最近一次写入时的时钟计数，LRU 排序依据
/// - `drive_id`: 所属驱动器（非拥有的反向引用）
#[derive(Debug)]
pub struct CacheUnit {
    /// 起始扇区（8 扇区对齐）
    pub lba: u64,

    /// 数据页
    pub page: DmaPage,

    /// 状态标志
    pub flags: CacheFlags,

    /// LRU 时间戳
    pub last_access: u32,

    /// 所属驱动器
    pub drive_id: DriveId,
}

impl CacheUnit {
    /// 创建缓存单元
    ///
    /// `lba` 会被规范化到 8 扇区边界。
    pub fn new(lba: u64, page: DmaPage, drive_id: DriveId, tick: u32) -> Self {
        Self {
            lba: normalize_lba(lba),
            page,
            flags: CacheFlags::empty(),
            last_access: tick,
            drive_id,
        }
    }

    /// 页数据
    pub fn data(&self) -> &[u8] {
        self.page.as_slice()
    }

    /// 页数据（可变，不设置修改标志）
    pub fn data_mut(&mut self) -> &mut [u8] {
        self.page.as_mut_slice()
    }

    /// 从页内偏移处读取
    ///
    /// # 返回
    ///
    /// 实际读取的字节数（不超过页尾）
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> usize {
        let data = self.data();
        if offset >= data.len() {
            return 0;
        }
        let len = buf.len().min(data.len() - offset);
        buf[..len].copy_from_slice(&data[offset..offset + len]);
        len
    }

    /// 写入页内偏移处并标记为已修改
    ///
    /// # 返回
    ///
    /// 实际写入的字节数（不超过页尾）
    pub fn write_at(&mut self, offset: usize, src: &[u8]) -> usize {
        let data = self.page.as_mut_slice();
        if offset >= data.len() {
            return 0;
        }
        let len = src.len().min(data.len() - offset);
        data[offset..offset + len].copy_from_slice(&src[..len]);
        self.mark_modified();
        len
    }

    /// 标记为已修改
    pub fn mark_modified(&mut self) {
        self.flags.insert(CacheFlags::MODIFIED);
    }

    /// 标记为干净（已写回）
    pub fn mark_clean(&mut self) {
        self.flags.remove(CacheFlags::MODIFIED);
    }

    /// 是否已修改
    pub fn is_modified(&self) -> bool {
        self.flags.contains(CacheFlags::MODIFIED)
    }

    /// 更新 LRU 时间戳
    pub fn touch(&mut self, tick: u32) {
        self.last_access = tick;
    }
}
