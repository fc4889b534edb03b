//! 内存盘驱动
//!
//! 以内存数组模拟一块磁盘，所有写入立即“持久化”。
//! 支持断电注入：[`RamDisk::cut_power_after`] 之后，超出额度的写入会被静默丢弃，
//! 用于模拟写到一半时的系统崩溃。

use crate::fs::BufData;
use crate::spinlock::SpinLock;
use super::BlockDevice;

pub struct RamDisk<const N: usize> {
    inner: SpinLock<RamDiskInner<N>>,
}

struct RamDiskInner<const N: usize> {
    blocks: [BufData; N],
    /// 断电前还允许完成的写入次数，`None` 表示不断电
    budget: Option<usize>,
    /// 已经真正落盘的写入次数
    writes: usize,
}

impl<const N: usize> RamDisk<N> {
    /// 创建一块全零的内存盘。
    pub fn new() -> Self {
        Self::from_image([BufData::ZERO; N])
    }

    /// 以给定的磁盘映像创建内存盘，常用于“重启”后重新挂载崩溃前的映像。
    pub fn from_image(blocks: [BufData; N]) -> Self {
        Self {
            inner: SpinLock::new(RamDiskInner { blocks, budget: None, writes: 0 }, "ramdisk"),
        }
    }

    /// 复制当前磁盘映像。
    pub fn snapshot(&self) -> [BufData; N] {
        self.inner.lock().blocks.clone()
    }

    /// 允许再完成 `writes` 次写入，之后的写入全部丢弃。
    pub fn cut_power_after(&self, writes: usize) {
        self.inner.lock().budget = Some(writes);
    }

    /// 是否已经断电。
    pub fn powered_off(&self) -> bool {
        self.inner.lock().budget == Some(0)
    }

    /// 已经落盘的写入次数。
    pub fn writes(&self) -> usize {
        self.inner.lock().writes
    }

    /// 读出第 `blockno` 块的内容副本。
    pub fn block(&self, blockno: u32) -> BufData {
        self.inner.lock().blocks[Self::index(blockno)].clone()
    }

    /// 绕过缓存直接写入一块（用于格式化）。
    pub fn put_block(&self, blockno: u32, data: &BufData) {
        self.inner.lock().blocks[Self::index(blockno)] = data.clone();
    }

    fn index(blockno: u32) -> usize {
        let index = blockno as usize;
        if index >= N {
            panic!("ramdisk: blockno {} out of range {}", blockno, N);
        }
        index
    }
}

impl<const N: usize> Default for RamDisk<N> {
    fn default() -> Self {
        Self::new()
    }
}

// 内存盘只模拟单个设备，忽略设备号。
impl<const N: usize> BlockDevice for RamDisk<N> {
    fn read(&self, _dev: u32, blockno: u32, data: &mut BufData) {
        let index = Self::index(blockno);
        let inner = self.inner.lock();
        data.copy_from_slice(&inner.blocks[index]);
    }

    fn write(&self, _dev: u32, blockno: u32, data: &BufData) {
        let index = Self::index(blockno);
        let mut inner = self.inner.lock();
        if let Some(left) = inner.budget.as_mut() {
            if *left == 0 {
                return;
            }
            *left -= 1;
        }
        inner.blocks[index] = data.clone();
        inner.writes += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(byte: u8) -> BufData {
        let mut data = BufData::new();
        data.fill(byte);
        data
    }

    #[test]
    fn read_back_written_block() {
        let disk: RamDisk<4> = RamDisk::new();
        disk.write(0, 2, &filled(0xab));
        let mut out = BufData::new();
        disk.read(0, 2, &mut out);
        assert!(out.iter().all(|&b| b == 0xab));
        assert_eq!(disk.writes(), 1);
    }

    #[test]
    fn writes_after_power_cut_are_lost() {
        let disk: RamDisk<4> = RamDisk::new();
        disk.cut_power_after(1);
        disk.write(0, 1, &filled(1));
        assert!(disk.powered_off());
        disk.write(0, 2, &filled(2));
        assert_eq!(disk.block(1)[0], 1);
        assert_eq!(disk.block(2)[0], 0);
        assert_eq!(disk.writes(), 1);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn out_of_range_block_panics() {
        let disk: RamDisk<2> = RamDisk::new();
        disk.block(2);
    }
}
