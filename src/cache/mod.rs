//! 块缓存模块
//!
//! 每个驱动器一个缓存寄存器，按页（8 个扇区）缓存磁盘数据。
//!
//! # 主要组件
//!
//! - [`CacheUnit`] - 单个缓存页，包含数据、脏标志和 LRU 时间戳
//! - [`CacheRegister`] - 一个驱动器的缓存，用 [`HashTable`](crate::hash::HashTable) 按 LBA 索引
//! - [`CacheFlags`] - 缓存单元状态标志
//! - [`DmaPage`] - 带物理地址的一页内存
//! - [`CacheStats`] - 缓存统计信息
//!
//! # 设计原理
//!
//! 1. **页粒度**：所有键都是 `lba & !7`，同一页内的任意扇区都映射到同一个缓存单元，
//!    缓存页可以直接交给 DMA
//! 2. **写回**：缓存单元只能通过从哈希表删除来销毁，删除前脏页一定先写回设备
//! 3. **驱逐**：不维护 LRU 链表，驱逐时两遍扫描找出 `last_access` 最小的单元
//! 4. **错误**：设备错误以 `Result` 返回，由调用者决定重试或放弃
//!
//! # 使用示例
//!
//! ```rust,ignore
//! use nanofat_core::cache::CacheRegister;
//! use nanofat_core::fs::LogicalClock;
//!
//! let mut reg = CacheRegister::with_device(0, device, LogicalClock::new())?;
//!
//! // 读取 LBA 16 所在的页（一次设备读取 8 个扇区）
//! let unit = reg.add(16, None)?;
//! unit.write_at(0, b"hello");
//!
//! // 卸载前写回所有脏页
//! reg.flush_all()?;
//! ```
//!
//! # 内存分配要求
//!
//! 本模块依赖 `alloc` crate，需要用户提供全局分配器。

mod block_cache;
mod buffer;
mod io;

pub use block_cache::{CacheRegister, CacheStats, WriteBackPolicy};
pub use buffer::{CacheFlags, CacheUnit, DmaPage};
