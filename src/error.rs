//! 错误类型定义
//!
//! 提供块缓存、哈希表和 FAT32 操作的错误类型。

use alloc::collections::TryReserveError;
use core::fmt;

/// 存储子系统错误
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    kind: ErrorKind,
    message: &'static str,
}

/// 错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// I/O 错误（设备硬件错误）
    Io,
    /// 无效参数
    InvalidInput,
    /// 文件系统损坏
    Corrupted,
    /// 不存在（包括设备不存在）
    NotFound,
    /// 已存在
    AlreadyExists,
    /// 内存分配失败
    NoMemory,
    /// 空间不足
    NoSpace,
    /// 设备或文件系统只读
    ReadOnly,
    /// 不支持的操作
    Unsupported,
    /// 无效状态
    InvalidState,
    /// 不是目录
    NotADirectory,
    /// 是目录
    IsADirectory,
}

impl Error {
    /// 创建新错误
    pub const fn new(kind: ErrorKind, message: &'static str) -> Self {
        Self { kind, message }
    }

    /// 获取错误类型
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// 获取错误消息
    pub const fn message(&self) -> &'static str {
        self.message
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

impl From<TryReserveError> for Error {
    fn from(_: TryReserveError) -> Self {
        Error::new(ErrorKind::NoMemory, "Memory allocation failed")
    }
}

/// Result 类型别名
pub type Result<T> = core::result::Result<T, Error>;
