//! 经过缓存的扇区读写
//!
//! 读写都先操作缓存，页不在缓存中时调用 [`CacheRegister::add`] 载入。
//! 插入新页前如果单元数达到上限，先按配置驱逐一批 `last_access` 最小的页。

use super::block_cache::CacheRegister;
use super::buffer::CacheUnit;
use crate::{
    block::BlockDevice,
    consts::{normalize_lba, PAGE_SIZE, SECTORS_PER_PAGE, SECTOR_SIZE},
    error::{Error, ErrorKind, Result},
    fs::SystemHal,
};

impl<D: BlockDevice, H: SystemHal> CacheRegister<D, H> {
    /// 经过缓存读取扇区
    ///
    /// # 参数
    ///
    /// * `lba` - 起始扇区号（不要求对齐）
    /// * `buf` - 目标缓冲区，长度必须是扇区大小的整数倍
    ///
    /// # 返回
    ///
    /// 读取的字节数
    pub fn read_sectors(&mut self, lba: u64, buf: &mut [u8]) -> Result<usize> {
        check_len(buf.len())?;
        self.check_range(lba, buf.len())?;

        let mut done = 0;
        let mut cur = lba;
        while done < buf.len() {
            let page = normalize_lba(cur);
            let offset = (cur - page) as usize * SECTOR_SIZE;
            let len = (PAGE_SIZE - offset).min(buf.len() - done);

            let unit = self.cached_unit(page, None)?;
            unit.read_at(offset, &mut buf[done..done + len]);

            done += len;
            cur += (len / SECTOR_SIZE) as u64;
        }

        log::trace!("[CACHE] read {} sectors at LBA={:#x}", buf.len() / SECTOR_SIZE, lba);
        Ok(done)
    }

    /// 经过缓存写入扇区
    ///
    /// 写入的页被标记为已修改。`last_access` 只在建立缓存单元时设置，
    /// 除非配置了 `refresh_on_hit`。
    /// 整页写入且页不在缓存中时直接用写入数据建立缓存单元，不读设备。
    pub fn write_sectors(&mut self, lba: u64, buf: &[u8]) -> Result<usize> {
        check_len(buf.len())?;
        if self.device().is_some_and(|d| d.is_read_only()) {
            return Err(Error::new(ErrorKind::ReadOnly, "Drive is read-only"));
        }
        self.check_range(lba, buf.len())?;

        let mut done = 0;
        let mut cur = lba;
        while done < buf.len() {
            let page = normalize_lba(cur);
            let offset = (cur - page) as usize * SECTOR_SIZE;
            let len = (PAGE_SIZE - offset).min(buf.len() - done);
            let chunk = &buf[done..done + len];

            let seed = (len == PAGE_SIZE).then_some(chunk);
            let unit = self.cached_unit(page, seed)?;
            unit.write_at(offset, chunk);

            done += len;
            cur += (len / SECTOR_SIZE) as u64;
        }

        log::trace!("[CACHE] wrote {} sectors at LBA={:#x}", buf.len() / SECTOR_SIZE, lba);
        Ok(done)
    }

    /// 请求的扇区必须全部在设备内；末尾不足一页的部分由 `add` 处理
    fn check_range(&self, lba: u64, len: usize) -> Result<()> {
        let Some(device) = self.device() else {
            return Ok(());
        };
        match lba.checked_add((len / SECTOR_SIZE) as u64) {
            Some(end) if end <= device.total_sectors() => Ok(()),
            _ => Err(Error::new(ErrorKind::InvalidInput, "Sector range out of device bounds")),
        }
    }

    /// 取得页对应的缓存单元，不在缓存中时载入
    fn cached_unit(&mut self, page: u64, seed: Option<&[u8]>) -> Result<&mut CacheUnit> {
        if self.lookup(page).is_some() {
            self.stats.hits += 1;
            let tick = self.config.refresh_on_hit.then(|| self.tick());
            let unit = self
                .lookup_mut(page)
                .ok_or(Error::new(ErrorKind::InvalidState, "Cache unit vanished"))?;
            if let Some(tick) = tick {
                unit.touch(tick);
            }
            return Ok(unit);
        }

        self.make_room()?;
        self.add(page, seed)
    }

    /// 单元数达到上限时驱逐一批
    fn make_room(&mut self) -> Result<()> {
        if self.len() < self.config.max_cache_units {
            return Ok(());
        }

        log::debug!(
            "[CACHE] drive {} at capacity ({} units), evicting up to {}",
            self.drive_id,
            self.len(),
            self.config.evict_batch
        );
        for _ in 0..self.config.evict_batch {
            if !self.evict_least_used()? {
                break;
            }
        }
        Ok(())
    }
}

fn check_len(len: usize) -> Result<()> {
    if len % SECTOR_SIZE != 0 {
        return Err(Error::new(ErrorKind::InvalidInput, "Buffer length must be a multiple of the sector size"));
    }
    Ok(())
}

// 一页覆盖的扇区数必须与页大小一致
const _: () = assert!(SECTORS_PER_PAGE as usize * SECTOR_SIZE == PAGE_SIZE);
