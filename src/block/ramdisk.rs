//! 内存块设备

use super::device::{check_transfer, BlockDevice, DriveStatus};
use crate::consts::SECTOR_SIZE;
use crate::error::{Error, ErrorKind, Result};
use alloc::vec::Vec;

/// 基于 `Vec<u8>` 的块设备
///
/// 可以设置只读，也可以注入一个驱动状态码模拟设备故障。
#[derive(Debug, Clone)]
pub struct RamDisk {
    data: Vec<u8>,
    read_only: bool,
    status: DriveStatus,
}

impl RamDisk {
    /// 创建全零内存盘
    ///
    /// # 参数
    ///
    /// * `sectors` - 扇区数
    pub fn new(sectors: u64) -> Result<Self> {
        let len = usize::try_from(sectors)
            .ok()
            .and_then(|s| s.checked_mul(SECTOR_SIZE))
            .ok_or(Error::new(ErrorKind::InvalidInput, "RAM disk too large"))?;

        let mut data = Vec::new();
        data.try_reserve_exact(len)?;
        data.resize(len, 0);
        Ok(Self::from_image(data))
    }

    /// 从现有镜像创建（长度向下取整到扇区）
    pub fn from_image(mut data: Vec<u8>) -> Self {
        let len = data.len() - data.len() % SECTOR_SIZE;
        data.truncate(len);
        Self {
            data,
            read_only: false,
            status: DriveStatus::Success,
        }
    }

    /// 设置只读
    pub fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
    }

    /// 注入后续所有读写返回的状态码
    pub fn set_status(&mut self, status: DriveStatus) {
        self.status = status;
    }

    /// 镜像内容
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// 镜像内容（可变），不经过设备状态检查
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// 取回镜像
    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
}

impl BlockDevice for RamDisk {
    fn total_sectors(&self) -> u64 {
        (self.data.len() / SECTOR_SIZE) as u64
    }

    fn read_blocks(&mut self, lba: u64, count: u32, buf: &mut [u8]) -> Result<usize> {
        self.status.into_result()?;
        let len = check_transfer(self.total_sectors(), lba, count, buf.len())?;
        let start = lba as usize * SECTOR_SIZE;
        buf[..len].copy_from_slice(&self.data[start..start + len]);
        Ok(len)
    }

    fn write_blocks(&mut self, lba: u64, count: u32, buf: &[u8]) -> Result<usize> {
        if self.read_only {
            return DriveStatus::NoWrite.into_result().map(|_| 0);
        }
        self.status.into_result()?;
        let len = check_transfer(self.total_sectors(), lba, count, buf.len())?;
        let start = lba as usize * SECTOR_SIZE;
        self.data[start..start + len].copy_from_slice(&buf[..len]);
        Ok(len)
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn test_read_write() {
        let mut disk = RamDisk::new(16).unwrap();
        assert_eq!(disk.total_sectors(), 16);

        let data = vec![0xA5u8; 1024];
        assert_eq!(disk.write_blocks(3, 2, &data).unwrap(), 1024);

        let mut buf = vec![0u8; 1024];
        assert_eq!(disk.read_blocks(3, 2, &mut buf).unwrap(), 1024);
        assert_eq!(buf, data);
        assert_eq!(disk.as_bytes()[3 * 512], 0xA5);
        assert_eq!(disk.as_bytes()[3 * 512 - 1], 0);
    }

    #[test]
    fn test_out_of_bounds() {
        let mut disk = RamDisk::new(8).unwrap();
        let mut buf = vec![0u8; 512];
        assert_eq!(disk.read_blocks(8, 1, &mut buf).unwrap_err().kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn test_read_only() {
        let mut disk = RamDisk::new(8).unwrap();
        disk.set_read_only(true);
        let buf = vec![0u8; 512];
        assert_eq!(disk.write_blocks(0, 1, &buf).unwrap_err().kind(), ErrorKind::ReadOnly);
    }

    #[test]
    fn test_injected_failure() {
        let mut disk = RamDisk::new(8).unwrap();
        disk.set_status(DriveStatus::HardwareError);
        let mut buf = vec![0u8; 512];
        assert_eq!(disk.read_blocks(0, 1, &mut buf).unwrap_err().kind(), ErrorKind::Io);

        disk.set_status(DriveStatus::Success);
        assert!(disk.read_blocks(0, 1, &mut buf).is_ok());
    }

    #[test]
    fn test_from_image_truncates() {
        let disk = RamDisk::from_image(vec![1u8; 1000]);
        assert_eq!(disk.total_sectors(), 1);
        assert_eq!(disk.into_inner().len(), 512);
    }
}
