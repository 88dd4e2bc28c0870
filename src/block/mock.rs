//! 测试用的记录设备

use super::{BlockDevice, RamDisk};
use crate::error::Result;
use alloc::vec::Vec;

/// 记录所有读写请求的内存设备
pub(crate) struct MockDevice {
    pub disk: RamDisk,
    pub reads: Vec<(u64, u32)>,
    pub writes: Vec<(u64, u32, Vec<u8>)>,
}

impl MockDevice {
    pub(crate) fn new(sectors: u64) -> Self {
        Self::from_disk(RamDisk::new(sectors).unwrap())
    }

    pub(crate) fn from_disk(disk: RamDisk) -> Self {
        Self {
            disk,
            reads: Vec::new(),
            writes: Vec::new(),
        }
    }

    /// 清空记录
    pub(crate) fn reset_log(&mut self) {
        self.reads.clear();
        self.writes.clear();
    }
}

impl BlockDevice for MockDevice {
    fn total_sectors(&self) -> u64 {
        self.disk.total_sectors()
    }

    fn read_blocks(&mut self, lba: u64, count: u32, buf: &mut [u8]) -> Result<usize> {
        self.reads.push((lba, count));
        self.disk.read_blocks(lba, count, buf)
    }

    fn write_blocks(&mut self, lba: u64, count: u32, buf: &[u8]) -> Result<usize> {
        let len = self.disk.write_blocks(lba, count, buf)?;
        self.writes.push((lba, count, buf[..len].to_vec()));
        Ok(len)
    }

    fn is_read_only(&self) -> bool {
        self.disk.is_read_only()
    }
}
