//! 哈希表实现

use crate::consts::{HT_INITIAL_CAPACITY, HT_MAX_BEFORE_RESIZE, HT_MAX_CAPACITY, HT_MIN_CAPACITY};
use crate::error::{Error, ErrorKind, Result};
use alloc::vec::Vec;
use core::mem;

/// 哈希表回调
///
/// 键对表来说是不透明的，所有对键的解释都通过这里完成。
pub trait HashCallbacks<K, V> {
    /// 计算键的哈希值
    fn hash(&self, key: &K) -> u32;

    /// 判断两个键是否相等
    fn equals(&self, a: &K, b: &K) -> bool;

    /// 元素被移出表之前调用
    ///
    /// 返回错误时元素保留在表中。
    fn on_erase(&mut self, _key: &K, _data: &mut V) -> Result<()> {
        Ok(())
    }
}

/// `for_each` 回调的返回值
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForEachOp {
    /// 保留当前元素
    NoOp,
    /// 删除当前元素（会调用 `on_erase`）
    Erase,
}

struct BucketItem<K, V> {
    key: K,
    data: V,
}

type Bucket<K, V> = Vec<BucketItem<K, V>>;

/// 链式哈希表
///
/// 元素 `(key, data)` 总是位于第 `hash(key) % bucket_count` 个桶中。
pub struct HashTable<K, V, C> {
    buckets: Vec<Bucket<K, V>>,
    callbacks: C,
    len: usize,
}

impl<K, V, C: HashCallbacks<K, V>> HashTable<K, V, C> {
    /// 创建哈希表（初始 16 个桶）
    ///
    /// # 错误
    ///
    /// 仅在内存分配失败时返回 `NoMemory`
    pub fn create(callbacks: C) -> Result<Self> {
        let buckets = Self::alloc_buckets(HT_INITIAL_CAPACITY.max(HT_MIN_CAPACITY))?;
        Ok(Self {
            buckets,
            callbacks,
            len: 0,
        })
    }

    fn alloc_buckets(count: usize) -> Result<Vec<Bucket<K, V>>> {
        let mut buckets = Vec::new();
        buckets.try_reserve_exact(count)?;
        buckets.resize_with(count, Vec::new);
        Ok(buckets)
    }

    #[inline]
    fn bucket_index(&self, key: &K) -> usize {
        self.callbacks.hash(key) as usize % self.buckets.len()
    }

    /// 插入元素，不检查重复键
    ///
    /// 目标桶已有 2 个元素时先把桶数翻倍并重新散列。
    /// 扩容失败只记录警告，元素仍然插入原来的桶。
    ///
    /// # 错误
    ///
    /// 插入本身的内存分配失败时返回 `NoMemory`，表保持不变
    pub fn set_unchecked(&mut self, key: K, data: V) -> Result<()> {
        let mut index = self.bucket_index(&key);

        if self.buckets[index].len() >= HT_MAX_BEFORE_RESIZE {
            let new_count = self.buckets.len().saturating_mul(2);
            if new_count <= HT_MAX_CAPACITY {
                match self.resize(new_count) {
                    Ok(()) => index = self.bucket_index(&key),
                    Err(e) => {
                        log::warn!("[HT] resize to {} buckets failed: {}", new_count, e);
                    }
                }
            }
        }

        let bucket = &mut self.buckets[index];
        bucket.try_reserve(1)?;
        bucket.push(BucketItem { key, data });
        self.len += 1;
        Ok(())
    }

    /// 插入元素
    ///
    /// # 错误
    ///
    /// - `AlreadyExists` - 已存在相等的键，不插入
    /// - `NoMemory` - 内存分配失败
    pub fn set(&mut self, key: K, data: V) -> Result<()> {
        if self.lookup(&key).is_some() {
            return Err(Error::new(ErrorKind::AlreadyExists, "Key already present in hash table"));
        }
        self.set_unchecked(key, data)
    }

    /// 查找元素
    ///
    /// 存在重复键时返回其中任意一个。
    pub fn lookup(&self, key: &K) -> Option<&V> {
        let callbacks = &self.callbacks;
        self.buckets[self.bucket_index(key)]
            .iter()
            .find(|item| callbacks.equals(&item.key, key))
            .map(|item| &item.data)
    }

    /// 查找元素（可变）
    pub fn lookup_mut(&mut self, key: &K) -> Option<&mut V> {
        let index = self.bucket_index(key);
        let callbacks = &self.callbacks;
        self.buckets[index]
            .iter_mut()
            .find(|item| callbacks.equals(&item.key, key))
            .map(|item| &mut item.data)
    }

    /// 删除第一个匹配的元素
    ///
    /// 先调用 `on_erase`，成功后才移除并释放元素。
    ///
    /// # 返回
    ///
    /// 是否删除了元素
    ///
    /// # 错误
    ///
    /// `on_erase` 的错误原样返回，元素保留在表中
    pub fn erase(&mut self, key: &K) -> Result<bool> {
        let index = self.bucket_index(key);
        let callbacks = &self.callbacks;
        let Some(pos) = self.buckets[index]
            .iter()
            .position(|item| callbacks.equals(&item.key, key))
        else {
            return Ok(false);
        };

        let BucketItem { key, data } = &mut self.buckets[index][pos];
        self.callbacks.on_erase(key, data)?;

        self.buckets[index].remove(pos);
        self.len -= 1;
        Ok(true)
    }

    /// 遍历所有元素
    ///
    /// 回调返回 [`ForEachOp::Erase`] 时在同一轮遍历中删除当前元素。
    /// `on_erase` 失败的元素保留，遍历继续，结束后返回第一个错误。
    pub fn for_each<F>(&mut self, mut f: F) -> Result<()>
    where
        F: FnMut(&K, &mut V) -> ForEachOp,
    {
        let mut first_error = None;

        for bucket in self.buckets.iter_mut() {
            let mut i = 0;
            while i < bucket.len() {
                let BucketItem { key, data } = &mut bucket[i];
                if f(&*key, &mut *data) == ForEachOp::NoOp {
                    i += 1;
                    continue;
                }

                match self.callbacks.on_erase(key, data) {
                    Ok(()) => {
                        bucket.remove(i);
                        self.len -= 1;
                    }
                    Err(e) => {
                        first_error.get_or_insert(e);
                        i += 1;
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// 删除所有元素
    ///
    /// # 返回
    ///
    /// 删除的元素数
    pub fn clear(&mut self) -> Result<usize> {
        let before = self.len;
        self.for_each(|_, _| ForEachOp::Erase)?;
        Ok(before - self.len)
    }

    /// 带回调对象遍历所有元素，不删除
    ///
    /// 遇到第一个错误即停止。
    pub fn for_each_with_callbacks<F>(&mut self, mut f: F) -> Result<()>
    where
        F: FnMut(&mut C, &K, &mut V) -> Result<()>,
    {
        for item in self.buckets.iter_mut().flatten() {
            f(&mut self.callbacks, &item.key, &mut item.data)?;
        }
        Ok(())
    }

    /// 删除所有元素并释放表
    ///
    /// 有元素的 `on_erase` 失败时返回错误，剩余元素随表一起被直接释放。
    /// 需要保留这些元素的调用者应先调用 [`clear`](Self::clear)。
    pub fn delete(self) -> Result<()> {
        self.into_callbacks().map(|_| ())
    }

    /// 删除所有元素，释放表并取回回调对象
    pub fn into_callbacks(mut self) -> Result<C> {
        self.clear()?;
        Ok(self.callbacks)
    }

    fn resize(&mut self, new_count: usize) -> Result<()> {
        // 预先统计每个新桶的元素数，保证移动阶段不会再分配内存
        let mut counts: Vec<usize> = Vec::new();
        counts.try_reserve_exact(new_count)?;
        counts.resize(new_count, 0);
        for item in self.buckets.iter().flatten() {
            counts[self.callbacks.hash(&item.key) as usize % new_count] += 1;
        }

        let mut new_buckets: Vec<Bucket<K, V>> = Vec::new();
        new_buckets.try_reserve_exact(new_count)?;
        for count in counts {
            let mut bucket = Vec::new();
            bucket.try_reserve_exact(count)?;
            new_buckets.push(bucket);
        }

        let old_buckets = mem::replace(&mut self.buckets, new_buckets);
        for item in old_buckets.into_iter().flatten() {
            let index = self.callbacks.hash(&item.key) as usize % new_count;
            self.buckets[index].push(item);
        }

        log::debug!("[HT] resized to {} buckets ({} items)", new_count, self.len);
        Ok(())
    }
}

impl<K, V, C> HashTable<K, V, C> {
    /// 元素数
    pub fn len(&self) -> usize {
        self.len
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// 当前桶数
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// 迭代所有元素（顺序不确定）
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.buckets
            .iter()
            .flat_map(|bucket| bucket.iter().map(|item| (&item.key, &item.data)))
    }

    /// 回调对象
    pub fn callbacks(&self) -> &C {
        &self.callbacks
    }

    /// 回调对象（可变）
    pub fn callbacks_mut(&mut self) -> &mut C {
        &mut self.callbacks
    }

    /// 估算表占用的堆内存（字节），不含元素自身指向的堆内存
    pub fn estimated_mem_used(&self) -> usize {
        let items: usize = self
            .buckets
            .iter()
            .map(|bucket| bucket.capacity() * mem::size_of::<BucketItem<K, V>>())
            .sum();
        mem::size_of::<Self>() + self.buckets.capacity() * mem::size_of::<Bucket<K, V>>() + items
    }
}

impl<K, V, C> core::fmt::Debug for HashTable<K, V, C> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HashTable")
            .field("len", &self.len)
            .field("bucket_count", &self.buckets.len())
            .finish()
    }
}
