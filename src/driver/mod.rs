//! 设备驱动模块，包含块设备接口与内存盘驱动

use crate::fs::BufData;

pub mod ramdisk;

/// 块设备驱动接口。
///
/// 缓存层通过该接口读写磁盘块。两个方法都是同步的：`write` 返回时数据已经持久化，
/// 日志层正是依赖这一点来确定提交点。驱动内部可以阻塞，但调用者不会持有自旋锁。
pub trait BlockDevice: Sync {
    /// 将设备 `dev` 上第 `blockno` 块读入 `data`。
    fn read(&self, dev: u32, blockno: u32, data: &mut BufData);

    /// 将 `data` 持久化写入设备 `dev` 上第 `blockno` 块。
    fn write(&self, dev: u32, blockno: u32, data: &BufData);
}

impl<D: BlockDevice + ?Sized> BlockDevice for &D {
    fn read(&self, dev: u32, blockno: u32, data: &mut BufData) {
        (**self).read(dev, blockno, data)
    }

    fn write(&self, dev: u32, blockno: u32, data: &BufData) {
        (**self).write(dev, blockno, data)
    }
}
