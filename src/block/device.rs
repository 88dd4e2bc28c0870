//! 块设备核心类型

use crate::consts::SECTOR_SIZE;
use crate::error::{Error, ErrorKind, Result};
use alloc::boxed::Box;

/// 驱动器标识
pub type DriveId = u8;

/// 设备驱动返回的状态码
///
/// 驱动层通常以状态码报告结果，通过 [`DriveStatus::into_result`] 转换为 `Result`。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DriveStatus {
    /// 成功
    #[default]
    Success,
    /// 设备不存在
    NotFound,
    /// 设备禁止写入
    NoWrite,
    /// 硬件错误
    HardwareError,
}

impl DriveStatus {
    /// 转换为 `Result`
    pub fn into_result(self) -> Result<()> {
        match self {
            DriveStatus::Success => Ok(()),
            DriveStatus::NotFound => Err(Error::new(ErrorKind::NotFound, "Drive not found")),
            DriveStatus::NoWrite => Err(Error::new(ErrorKind::ReadOnly, "Drive is write protected")),
            DriveStatus::HardwareError => Err(Error::new(ErrorKind::Io, "Drive hardware error")),
        }
    }
}

/// 块设备接口
///
/// 实现此 trait 以提供底层扇区访问。扇区大小固定为 512 字节，
/// 所有读写都绕过缓存直接作用于设备。
///
/// # 示例
///
/// ```rust,ignore
/// use nanofat_core::{BlockDevice, Result};
///
/// struct AtaDrive {
///     // ...
/// }
///
/// impl BlockDevice for AtaDrive {
///     fn total_sectors(&self) -> u64 {
///         self.sector_count
///     }
///
///     fn read_blocks(&mut self, lba: u64, count: u32, buf: &mut [u8]) -> Result<usize> {
///         self.pio_read(lba, count, buf)?.into_result()?;
///         Ok(count as usize * 512)
///     }
///
///     fn write_blocks(&mut self, lba: u64, count: u32, buf: &[u8]) -> Result<usize> {
///         self.pio_write(lba, count, buf)?.into_result()?;
///         Ok(count as usize * 512)
///     }
/// }
/// ```
pub trait BlockDevice {
    /// 总扇区数
    fn total_sectors(&self) -> u64;

    /// 读取扇区
    ///
    /// # 参数
    ///
    /// * `lba` - 起始扇区号
    /// * `count` - 要读取的扇区数
    /// * `buf` - 目标缓冲区（大小至少为 count * 512）
    ///
    /// # 返回
    ///
    /// 成功返回实际读取的字节数
    fn read_blocks(&mut self, lba: u64, count: u32, buf: &mut [u8]) -> Result<usize>;

    /// 写入扇区
    ///
    /// # 参数
    ///
    /// * `lba` - 起始扇区号
    /// * `count` - 要写入的扇区数
    /// * `buf` - 源缓冲区（大小至少为 count * 512）
    ///
    /// # 返回
    ///
    /// 成功返回实际写入的字节数
    fn write_blocks(&mut self, lba: u64, count: u32, buf: &[u8]) -> Result<usize>;

    /// 刷新设备自身的写缓存
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    /// 是否只读
    fn is_read_only(&self) -> bool {
        false
    }

    /// 打开设备
    ///
    /// 注册到挂载表时调用。默认实现什么都不做。
    fn open(&mut self) -> Result<()> {
        Ok(())
    }

    /// 关闭设备
    ///
    /// 缓存寄存器释放设备时调用。默认实现什么都不做。
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<D: BlockDevice + ?Sized> BlockDevice for Box<D> {
    fn total_sectors(&self) -> u64 {
        (**self).total_sectors()
    }

    fn read_blocks(&mut self, lba: u64, count: u32, buf: &mut [u8]) -> Result<usize> {
        (**self).read_blocks(lba, count, buf)
    }

    fn write_blocks(&mut self, lba: u64, count: u32, buf: &[u8]) -> Result<usize> {
        (**self).write_blocks(lba, count, buf)
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }

    fn is_read_only(&self) -> bool {
        (**self).is_read_only()
    }

    fn open(&mut self) -> Result<()> {
        (**self).open()
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}

/// 检查一次扇区传输的参数
///
/// 设备实现可以复用这个检查。
pub(crate) fn check_transfer(total_sectors: u64, lba: u64, count: u32, buf_len: usize) -> Result<usize> {
    let len = count as usize * SECTOR_SIZE;
    if buf_len < len {
        return Err(Error::new(ErrorKind::InvalidInput, "Buffer too small for sector transfer"));
    }
    match lba.checked_add(count as u64) {
        Some(end) if end <= total_sectors => Ok(len),
        _ => Err(Error::new(ErrorKind::InvalidInput, "Sector range out of device bounds")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drive_status_mapping() {
        assert!(DriveStatus::Success.into_result().is_ok());
        assert_eq!(DriveStatus::NotFound.into_result().unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(DriveStatus::NoWrite.into_result().unwrap_err().kind(), ErrorKind::ReadOnly);
        assert_eq!(DriveStatus::HardwareError.into_result().unwrap_err().kind(), ErrorKind::Io);
    }

    #[test]
    fn test_check_transfer() {
        assert_eq!(check_transfer(16, 8, 8, 4096).unwrap(), 4096);
        assert_eq!(check_transfer(16, 9, 8, 4096).unwrap_err().kind(), ErrorKind::InvalidInput);
        assert_eq!(check_transfer(16, 0, 8, 512).unwrap_err().kind(), ErrorKind::InvalidInput);
        assert_eq!(check_transfer(16, u64::MAX, 1, 512).unwrap_err().kind(), ErrorKind::InvalidInput);
    }
}
