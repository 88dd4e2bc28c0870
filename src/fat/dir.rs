//! 目录扫描
//!
//! 目录内容是连续的 32 字节目录项。扫描按簇进行，调用者把每个簇的数据和
//! 它在目录中的起始偏移交给 [`DirScanner`]，扫描器负责跳过空闲项、
//! 长文件名项和卷标，并在遇到结束标记时停止。

use crate::consts::FAT_DIR_ENTRY_SIZE;
use crate::types::FatDirEntry;
use core::ops::ControlFlow;

/// 一个可见的目录项及其位置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirSlot {
    /// 在目录中的字节偏移
    pub offset: u32,
    /// 目录项
    pub entry: FatDirEntry,
}

/// 扫描一个簇后的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    /// 需要下一个簇
    More,
    /// 遇到结束标记
    End,
    /// 访问者要求停止
    Stopped,
}

/// 目录扫描器
#[derive(Debug, Clone, Copy, Default)]
pub struct DirScanner {
    include_dots: bool,
}

impl DirScanner {
    /// 跳过 "." 和 ".." 的扫描器（列目录用）
    pub const fn new() -> Self {
        Self { include_dots: false }
    }

    /// 保留 "." 和 ".." 的扫描器（解析 ".." 用）
    pub const fn with_dots() -> Self {
        Self { include_dots: true }
    }

    fn is_visible(&self, entry: &FatDirEntry) -> bool {
        if entry.is_deleted() || entry.is_lfn() || entry.is_volume_id() {
            return false;
        }
        self.include_dots || !entry.is_dot_entry()
    }

    /// 扫描一段目录数据
    ///
    /// # 参数
    ///
    /// * `raw` - 目录数据（通常是一个簇）
    /// * `base` - `raw` 在目录中的起始字节偏移
    /// * `visit` - 对每个可见目录项调用，返回 `Break` 时停止
    pub fn scan<F>(&self, raw: &[u8], base: u32, mut visit: F) -> ScanState
    where
        F: FnMut(DirSlot) -> ControlFlow<()>,
    {
        for (i, chunk) in raw.chunks_exact(FAT_DIR_ENTRY_SIZE).enumerate() {
            let mut bytes = [0u8; FAT_DIR_ENTRY_SIZE];
            bytes.copy_from_slice(chunk);
            let entry = FatDirEntry::from_bytes(&bytes);

            if entry.is_end() {
                return ScanState::End;
            }
            if !self.is_visible(&entry) {
                continue;
            }

            let slot = DirSlot {
                offset: base + (i * FAT_DIR_ENTRY_SIZE) as u32,
                entry,
            };
            if visit(slot).is_break() {
                return ScanState::Stopped;
            }
        }
        ScanState::More
    }
}
