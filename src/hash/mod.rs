//! 通用链式哈希表
//!
//! 块缓存和 inode 缓存共用的索引结构。
//!
//! # 主要组件
//!
//! - [`HashTable`] - 链式哈希表，桶内元素超过阈值时自动倍增
//! - [`HashCallbacks`] - 调用者提供的哈希、相等和删除回调
//! - [`ForEachOp`] - 遍历回调的返回值，决定是否删除当前元素
//!
//! # 设计原理
//!
//! 表本身从不检查键的内容，只通过回调计算哈希和比较相等。
//! 删除元素（单个删除、遍历删除、清空）时总会先调用 `on_erase`，
//! 只有 `on_erase` 成功后元素才会被释放；块缓存依赖这一点保证脏页先写回再释放。
//!
//! 扩容时先为新桶数组预留全部容量，然后把所有元素移动过去并替换旧数组。
//! 预留失败时表保持不变。

mod table;

pub use table::{ForEachOp, HashCallbacks, HashTable};
