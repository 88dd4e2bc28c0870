//! FAT32 inode 缓存
//!
//! inode 号就是文件的起始簇号。缓存单元保存目录项的副本和它在父目录中的位置，
//! 之后更新文件大小时可以直接改写目录项而不必重新扫描父目录。

use crate::{
    consts::FAT32_ENTRY_MASK,
    error::{Error, ErrorKind, Result},
    fs::{FileNode, FileType, Permissions},
    hash::{ForEachOp, HashCallbacks, HashTable},
    types::{FatAttributes, FatDirEntry},
};
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::String;

/// 没有簇链的目录项使用的合成 inode 号基值
///
/// 簇号只有 28 位，带这一位的编号不会与真实簇号冲突。
pub const SYNTHETIC_INODE_BIT: u32 = 0x1000_0000;

/// inode 缓存单元
#[derive(Debug, Clone, Default)]
pub struct Fat32InodeCacheUnit {
    /// inode 号（起始簇号）
    pub inode_number: u32,
    /// 目录项副本
    pub dir_entry: FatDirEntry,
    /// 父目录 inode 号
    pub parent_dir_inode: u32,
    /// 目录项在父目录中的字节偏移
    pub parent_dir_offset: u32,
    /// 名称
    pub name: String,
    /// 交给 VFS 的文件节点
    pub node: FileNode,
    /// 常驻（不会被 purge）
    pub permanent: bool,
    /// 等待删除
    pub about_to_be_deleted: bool,
}

impl Fat32InodeCacheUnit {
    /// 起始簇号
    pub fn first_cluster(&self) -> u32 {
        self.dir_entry.first_cluster()
    }

    /// 是否为目录
    pub fn is_directory(&self) -> bool {
        self.node.is_directory()
    }
}

/// inode 缓存的哈希回调
#[derive(Debug, Default, Clone, Copy)]
pub struct InodeHash;

impl HashCallbacks<u32, Box<Fat32InodeCacheUnit>> for InodeHash {
    fn hash(&self, key: &u32) -> u32 {
        *key
    }

    fn equals(&self, a: &u32, b: &u32) -> bool {
        a == b
    }
}

/// 按目录项填充文件节点
fn node_from_entry(fs_id: u32, inode: u32, entry: &FatDirEntry, name: &str) -> FileNode {
    let node_type = if entry.is_directory() {
        FileType::DIRECTORY
    } else {
        FileType::FILE
    };

    let mut perms = Permissions::READ | Permissions::WRITE | Permissions::EXEC;
    if entry.attributes.contains(FatAttributes::READ_ONLY) {
        perms.remove(Permissions::WRITE);
    }

    FileNode {
        name: String::from(name),
        fs_id,
        inode,
        node_type,
        perms,
        length: entry.file_size,
        ref_count: 0,
    }
}

/// inode 缓存
pub struct InodeCache {
    fs_id: u32,
    table: HashTable<u32, Box<Fat32InodeCacheUnit>, InodeHash>,
    /// (父目录 inode, 目录项偏移) -> 合成 inode 号
    synthetic: BTreeMap<(u32, u32), u32>,
}

impl InodeCache {
    /// 创建空缓存
    ///
    /// # 参数
    ///
    /// * `fs_id` - 所属文件系统 ID，写入每个文件节点
    pub fn new(fs_id: u32) -> Result<Self> {
        Ok(Self {
            fs_id,
            table: HashTable::create(InodeHash)?,
            synthetic: BTreeMap::new(),
        })
    }

    /// 目录项对应的 inode 号
    ///
    /// 有簇链时就是起始簇号；否则按目录项在父目录中的位置分配合成 inode 号，
    /// 同一位置总是得到同一个编号，不同位置的编号互不相同。
    ///
    /// # 错误
    ///
    /// 合成编号用尽时返回 `NoSpace`
    pub fn entry_inode(&mut self, entry: &FatDirEntry, parent_dir_inode: u32, parent_dir_offset: u32) -> Result<u32> {
        match entry.first_cluster() {
            0 => self.synthetic_inode(parent_dir_inode, parent_dir_offset),
            cluster => Ok(cluster),
        }
    }

    /// 为没有簇链的目录项分配合成 inode 号
    pub fn synthetic_inode(&mut self, parent_dir_inode: u32, parent_dir_offset: u32) -> Result<u32> {
        let location = (parent_dir_inode, parent_dir_offset);
        if let Some(&inode) = self.synthetic.get(&location) {
            return Ok(inode);
        }

        let serial = self.synthetic.len() as u32;
        if serial > FAT32_ENTRY_MASK {
            return Err(Error::new(ErrorKind::NoSpace, "Synthetic inode numbers exhausted"));
        }
        let inode = SYNTHETIC_INODE_BIT | serial;
        self.synthetic.insert(location, inode);
        log::trace!(
            "[INODE] fs {:#x}: synthetic inode {:#x} for {}@{}",
            self.fs_id,
            inode,
            parent_dir_inode,
            parent_dir_offset
        );
        Ok(inode)
    }

    /// 缓存的 inode 数
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// 缓存是否为空
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// 查找 inode（不载入）
    pub fn lookup(&self, inode: u32) -> Option<&Fat32InodeCacheUnit> {
        self.table.lookup(&inode).map(|unit| &**unit)
    }

    /// 查找 inode（可变）
    pub fn lookup_mut(&mut self, inode: u32) -> Option<&mut Fat32InodeCacheUnit> {
        self.table.lookup_mut(&inode).map(|unit| &mut **unit)
    }

    /// 把目录项加入缓存
    ///
    /// 新单元保存目录项的副本，父目录位置原样记录。
    ///
    /// # 错误
    ///
    /// - `AlreadyExists` - inode 已在缓存中
    /// - `NoMemory` - 内存分配失败
    pub fn add(
        &mut self,
        inode: u32,
        entry: &FatDirEntry,
        parent_dir_inode: u32,
        parent_dir_offset: u32,
        name: &str,
    ) -> Result<&mut Fat32InodeCacheUnit> {
        let unit = Box::new(Fat32InodeCacheUnit {
            inode_number: inode,
            dir_entry: *entry,
            parent_dir_inode,
            parent_dir_offset,
            name: String::from(name),
            node: node_from_entry(self.fs_id, inode, entry, name),
            ..Fat32InodeCacheUnit::default()
        });

        self.table.set(inode, unit)?;
        log::debug!(
            "[INODE] fs {:#x}: cached inode {} '{}' (parent {}@{})",
            self.fs_id,
            inode,
            name,
            parent_dir_inode,
            parent_dir_offset
        );

        self.lookup_mut(inode)
            .ok_or(Error::new(ErrorKind::InvalidState, "Inode vanished after insert"))
    }

    /// 读取 inode
    ///
    /// 命中时直接返回缓存单元，忽略传入的目录项；未命中或 `force_reload` 时
    /// 用传入的目录项新建单元。强制重载保留原单元的常驻、挂载点标志和打开计数。
    pub fn read_inode(
        &mut self,
        inode: u32,
        entry: &FatDirEntry,
        parent_dir_inode: u32,
        parent_dir_offset: u32,
        name: &str,
        force_reload: bool,
    ) -> Result<&mut Fat32InodeCacheUnit> {
        if !force_reload && self.lookup(inode).is_some() {
            log::trace!("[INODE] fs {:#x}: hit inode {}", self.fs_id, inode);
            return self
                .lookup_mut(inode)
                .ok_or(Error::new(ErrorKind::InvalidState, "Inode vanished"));
        }

        let carried = match self.lookup(inode) {
            Some(old) => {
                let sticky = old.node.node_type & (FileType::MOUNTPOINT | FileType::PERMANENT);
                Some((old.permanent, sticky, old.node.ref_count))
            }
            None => None,
        };
        if carried.is_some() {
            self.table.erase(&inode)?;
            log::debug!("[INODE] fs {:#x}: reloading inode {}", self.fs_id, inode);
        }

        let unit = self.add(inode, entry, parent_dir_inode, parent_dir_offset, name)?;
        if let Some((permanent, sticky, ref_count)) = carried {
            unit.permanent = permanent;
            unit.node.node_type |= sticky;
            unit.node.ref_count = ref_count;
        }
        Ok(unit)
    }

    /// 把 inode 标记为常驻挂载点
    pub fn make_permanent(&mut self, inode: u32) -> Result<()> {
        let unit = self
            .lookup_mut(inode)
            .ok_or(Error::new(ErrorKind::NotFound, "Inode not cached"))?;
        unit.permanent = true;
        unit.node.node_type |= FileType::MOUNTPOINT | FileType::PERMANENT;
        Ok(())
    }

    /// 标记 inode 等待删除
    ///
    /// 常驻 inode 不会被标记。
    ///
    /// # 返回
    ///
    /// 是否设置了标记
    pub fn mark_for_deletion(&mut self, inode: u32) -> Result<bool> {
        let unit = self
            .lookup_mut(inode)
            .ok_or(Error::new(ErrorKind::NotFound, "Inode not cached"))?;
        if unit.permanent {
            return Ok(false);
        }
        unit.about_to_be_deleted = true;
        Ok(true)
    }

    /// 清除所有等待删除且未打开的非常驻 inode
    ///
    /// # 返回
    ///
    /// 清除的 inode 数
    pub fn purge(&mut self) -> Result<usize> {
        let mut purged = 0;
        self.table.for_each(|_, unit| {
            if unit.about_to_be_deleted && !unit.permanent && unit.node.ref_count == 0 {
                purged += 1;
                ForEachOp::Erase
            } else {
                ForEachOp::NoOp
            }
        })?;
        if purged > 0 {
            log::debug!("[INODE] fs {:#x}: purged {} inodes", self.fs_id, purged);
        }
        Ok(purged)
    }

    /// 清空缓存（包括常驻 inode），用于卸载
    pub fn clear(&mut self) -> Result<usize> {
        self.table.clear()
    }
}

impl core::fmt::Debug for InodeCache {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InodeCache")
            .field("fs_id", &self.fs_id)
            .field("len", &self.table.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, attrs: FatAttributes, cluster: u32, size: u32) -> FatDirEntry {
        let mut e = FatDirEntry::synthetic(name, attrs, cluster);
        e.file_size = size;
        e
    }

    #[test]
    fn test_add_populates_node() {
        let mut cache = InodeCache::new(0x20_0000).unwrap();
        let e = entry("README.TXT", FatAttributes::ARCHIVE | FatAttributes::READ_ONLY, 7, 1234);

        let unit = cache.add(7, &e, 2, 64, "README.TXT").unwrap();
        assert_eq!(unit.inode_number, 7);
        assert_eq!(unit.parent_dir_inode, 2);
        assert_eq!(unit.parent_dir_offset, 64);
        assert_eq!(unit.node.fs_id, 0x20_0000);
        assert_eq!(unit.node.node_type, FileType::FILE);
        assert_eq!(unit.node.perms, Permissions::READ | Permissions::EXEC);
        assert_eq!(unit.node.length, 1234);
        assert!(!unit.permanent);
        assert!(!unit.about_to_be_deleted);

        assert_eq!(cache.add(7, &e, 2, 64, "README.TXT").unwrap_err().kind(), ErrorKind::AlreadyExists);
    }

    #[test]
    fn test_directory_node_type() {
        let mut cache = InodeCache::new(1).unwrap();
        let e = entry("SUB", FatAttributes::DIRECTORY, 9, 0);
        let unit = cache.add(9, &e, 2, 0, "SUB").unwrap();
        assert_eq!(unit.node.node_type, FileType::DIRECTORY);
        assert!(unit.node.perms.contains(Permissions::WRITE));
    }

    #[test]
    fn test_identity_stability() {
        let mut cache = InodeCache::new(1).unwrap();
        let first = entry("A.TXT", FatAttributes::ARCHIVE, 5, 10);
        let second = entry("B.TXT", FatAttributes::ARCHIVE, 5, 99);

        let a: *const Fat32InodeCacheUnit = &*cache.read_inode(5, &first, 2, 0, "A.TXT", false).unwrap();
        let unit = cache.read_inode(5, &second, 3, 32, "B.TXT", false).unwrap();
        let b: *const Fat32InodeCacheUnit = &*unit;
        assert_eq!(a, b);
        assert_eq!(unit.name, "A.TXT");
        assert_eq!(unit.node.length, 10);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_force_reload_keeps_sticky_flags() {
        let mut cache = InodeCache::new(1).unwrap();
        let root = entry("FATX", FatAttributes::SYSTEM | FatAttributes::DIRECTORY, 2, 0);
        cache.read_inode(2, &root, 0, 0, "FATX", false).unwrap();
        cache.make_permanent(2).unwrap();

        let mut updated = root;
        updated.file_size = 4096;
        let unit = cache.read_inode(2, &updated, 0, 0, "FATX", true).unwrap();
        assert_eq!(unit.node.length, 4096);
        assert!(unit.permanent);
        assert_eq!(
            unit.node.node_type,
            FileType::DIRECTORY | FileType::MOUNTPOINT | FileType::PERMANENT
        );
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_purge() {
        let mut cache = InodeCache::new(1).unwrap();
        let e = entry("X", FatAttributes::ARCHIVE, 0, 0);
        for ino in 10..14 {
            cache.add(ino, &e, 2, 0, "X").unwrap();
        }
        cache.make_permanent(13).unwrap();

        assert!(cache.mark_for_deletion(10).unwrap());
        assert!(cache.mark_for_deletion(11).unwrap());
        assert!(!cache.mark_for_deletion(13).unwrap());
        cache.lookup_mut(11).unwrap().node.ref_count = 1;

        assert_eq!(cache.purge().unwrap(), 1);
        assert!(cache.lookup(10).is_none());
        assert!(cache.lookup(11).is_some());
        assert!(cache.lookup(13).is_some());
        assert_eq!(cache.mark_for_deletion(10).unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_synthetic_inode_never_a_cluster() {
        let mut cache = InodeCache::new(1).unwrap();
        let a = cache.synthetic_inode(2, 64).unwrap();
        let b = cache.synthetic_inode(2, 96).unwrap();
        assert_ne!(a, b);
        assert!(a & SYNTHETIC_INODE_BIT != 0);
        assert!(a > FAT32_ENTRY_MASK);
        assert_eq!(cache.synthetic_inode(2, 64).unwrap(), a);

        let empty = entry("E", FatAttributes::ARCHIVE, 0, 0);
        assert_eq!(cache.entry_inode(&empty, 2, 96).unwrap(), b);
        let file = entry("F", FatAttributes::ARCHIVE, 40, 1);
        assert_eq!(cache.entry_inode(&file, 2, 128).unwrap(), 40);
    }

    #[test]
    fn test_synthetic_inodes_are_unique_per_location() {
        // 簇号相差 2898、项序号相差 27214 的两个位置
        let mut cache = InodeCache::new(1).unwrap();
        let a = cache.synthetic_inode(2, 27214 * 32).unwrap();
        let b = cache.synthetic_inode(2 + 2898, 0).unwrap();
        assert_ne!(a, b);

        let mut seen = alloc::collections::BTreeSet::new();
        for parent in 2..40u32 {
            for index in 0..40u32 {
                assert!(seen.insert(cache.synthetic_inode(parent, index * 32).unwrap()));
            }
        }

        let empty = entry("E", FatAttributes::ARCHIVE, 0, 0);
        cache.add(a, &empty, 2, 27214 * 32, "A").unwrap();
        cache.add(b, &empty, 2900, 0, "B").unwrap();
        assert_eq!(cache.lookup(b).unwrap().name, "B");
    }
}
