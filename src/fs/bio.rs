//! 缓存层

use array_macro::array;

use core::any::type_name;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

use crate::condvar::WaitQueue;
use crate::consts::fs::{BSIZE, NBUF};
use crate::driver::BlockDevice;
use crate::sleeplock::{SleepLock, SleepLockGuard};
use crate::spinlock::SpinLock;
use zerocopy::{FromBytes, Immutable, IntoBytes};

/// 缓冲区缓存（Buffer Cache），位于块设备驱动与文件系统之间。
///
/// `Bcache` 提供了一个固定大小的内存缓冲区池，用于缓存磁盘块数据，
/// 以减少重复的磁盘访问。它结合 LRU（最近最少使用）替换策略
/// 维护块缓冲的使用顺序，并通过自旋锁与睡眠锁实现线程安全的数据访问。
///
/// 引用计数同时承担“钉住”的语义：日志层在提交前会通过 [`Buf::pin`]
/// 额外持有一份引用，使该块在提交完成之前不会被回收。
pub struct Bcache<D: BlockDevice, Q: WaitQueue> {
    /// 底层块设备
    device: D,

    /// 控制 LRU 缓存元信息的自旋锁。
    ///
    /// 该字段保护 `BufLru`，后者维护所有缓冲块的 LRU 链表结构、
    /// 引用计数、块号与设备号等元数据。
    ctrl: SpinLock<BufLru>,

    /// 缓冲块数组，长度为固定值 `NBUF`。
    ///
    /// 每个缓冲块包含块数据和一个睡眠锁，
    /// 以支持对缓冲区数据的细粒度同步访问。
    bufs: [BufInner<Q>; NBUF],
}

impl<D: BlockDevice, Q: WaitQueue> Bcache<D, Q> {
    /// 在 `device` 之上创建缓存，并把全部缓冲块串成 LRU 链表。
    pub fn new(device: D) -> Self {
        Self {
            device,
            ctrl: SpinLock::new(BufLru::new(), "BufLru"),
            bufs: array![_ => BufInner::new(); NBUF],
        }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    /// 查找或分配一个缓冲块，并返回已加锁的 [`Buf`]。
    ///
    /// # 功能说明
    /// 首先在 LRU 链表中查找 `(dev, blockno)` 对应的缓存块；若命中则增加引用计数。
    /// 未命中时从链表尾部回收一个引用计数为 0 的缓冲块，改写其身份并标记为无效，
    /// 由 [`Bcache::bread`] 负责随后从磁盘读入。
    ///
    /// # 可能的错误
    /// 所有缓冲块都被占用时触发 panic：`"no usable buffer"`。
    ///
    /// # 安全性
    /// 控制信息的修改全程持有 `ctrl` 自旋锁；获取数据睡眠锁之前已释放自旋锁，
    /// 因为数据锁可能需要睡眠。
    fn bget(&self, dev: u32, blockno: u32) -> Buf<'_, D, Q> {
        let mut ctrl = self.ctrl.lock();

        let index = match ctrl.find_cached(dev, blockno) {
            Some(index) => index,
            None => match ctrl.recycle(dev, blockno) {
                Some(index) => {
                    self.bufs[index].valid.store(false, Ordering::Relaxed);
                    index
                }
                None => panic!("no usable buffer"),
            },
        };
        drop(ctrl);

        Buf {
            cache: self,
            index,
            dev,
            blockno,
            data: Some(self.bufs[index].data.lock()),
        }
    }

    /// 读取设备 `dev` 上第 `blockno` 块，返回持有该块数据锁的 [`Buf`]。
    ///
    /// 缓存未命中时会同步访问磁盘，调用者不得持有任何自旋锁。
    pub fn bread(&self, dev: u32, blockno: u32) -> Buf<'_, D, Q> {
        let mut b = self.bget(dev, blockno);
        if !self.bufs[b.index].valid.load(Ordering::Relaxed) {
            self.device.read(dev, blockno, &mut b);
            self.bufs[b.index].valid.store(true, Ordering::Relaxed);
        }
        b
    }

    /// 查询某块当前的引用计数；该块不在缓存中时返回 `None`。
    pub fn ref_count(&self, dev: u32, blockno: u32) -> Option<usize> {
        let ctrl = self.ctrl.lock();
        ctrl.inner
            .iter()
            .find(|b| b.id == Some((dev, blockno)))
            .map(|b| b.refcnt)
    }

    fn brelse(&self, index: usize) {
        self.ctrl.lock().move_if_no_ref(index);
    }

    fn pin(&self, index: usize) {
        self.ctrl.lock().inner[index].refcnt += 1;
    }
}

/// 已加锁的缓冲块。
///
/// 持有期间独占该块数据；析构时释放数据锁并归还一次引用计数。
pub struct Buf<'a, D: BlockDevice, Q: WaitQueue> {
    cache: &'a Bcache<D, Q>,

    /// 缓冲块在缓存数组中的索引
    index: usize,

    dev: u32,

    blockno: u32,

    /// 数据的睡眠锁守卫；仅在析构时被取出
    data: Option<SleepLockGuard<'a, BufData, Q>>,
}

impl<'a, D: BlockDevice, Q: WaitQueue> Buf<'a, D, Q> {
    pub fn read_blockno(&self) -> u32 {
        self.blockno
    }

    pub fn read_dev(&self) -> u32 {
        self.dev
    }

    /// 将缓冲块内容同步写回磁盘。
    pub fn bwrite(&mut self) {
        let data = self.data.as_ref().unwrap();
        self.cache.device.write(self.dev, self.blockno, data);
    }

    /// 钉住该缓冲块：额外持有一份引用，直到返回的 [`BufPin`] 被丢弃。
    ///
    /// 被钉住的块不会被 LRU 回收，其缓存内容（包括尚未写回磁盘的修改）得以保留。
    pub fn pin(&self) -> BufPin<'a, D, Q> {
        self.cache.pin(self.index);
        BufPin {
            cache: self.cache,
            index: self.index,
            blockno: self.blockno,
        }
    }
}

impl<'a, D: BlockDevice, Q: WaitQueue> Deref for Buf<'a, D, Q> {
    type Target = BufData;

    fn deref(&self) -> &BufData {
        self.data.as_ref().unwrap()
    }
}

impl<'a, D: BlockDevice, Q: WaitQueue> DerefMut for Buf<'a, D, Q> {
    fn deref_mut(&mut self) -> &mut BufData {
        self.data.as_mut().unwrap()
    }
}

impl<'a, D: BlockDevice, Q: WaitQueue> Drop for Buf<'a, D, Q> {
    fn drop(&mut self) {
        drop(self.data.take());
        self.cache.brelse(self.index);
    }
}

/// 缓冲块上的一次“钉住”。丢弃即解除钉住。
pub struct BufPin<'a, D: BlockDevice, Q: WaitQueue> {
    cache: &'a Bcache<D, Q>,
    index: usize,
    blockno: u32,
}

impl<'a, D: BlockDevice, Q: WaitQueue> BufPin<'a, D, Q> {
    pub fn read_blockno(&self) -> u32 {
        self.blockno
    }
}

impl<'a, D: BlockDevice, Q: WaitQueue> Drop for BufPin<'a, D, Q> {
    fn drop(&mut self) {
        self.cache.brelse(self.index);
    }
}

/// LRU 链表，头部为最近使用的块，尾部为最久未使用的块。
struct BufLru {
    inner: [BufCtrl; NBUF],

    head: Option<usize>,

    tail: Option<usize>,
}

impl BufLru {
    fn new() -> Self {
        let mut lru = Self {
            inner: array![_ => BufCtrl::new(); NBUF],
            head: None,
            tail: None,
        };
        for i in 0..NBUF {
            lru.push_front(i);
        }
        lru
    }

    /// 查找已缓存的块，命中时增加引用计数。
    fn find_cached(&mut self, dev: u32, blockno: u32) -> Option<usize> {
        let mut b = self.head;
        while let Some(index) = b {
            let bref = &mut self.inner[index];
            if bref.id == Some((dev, blockno)) {
                bref.refcnt += 1;
                return Some(index);
            }
            b = bref.next;
        }
        None
    }

    /// 从尾部开始回收一个未被引用的缓冲块，并改写为新的身份。
    fn recycle(&mut self, dev: u32, blockno: u32) -> Option<usize> {
        let mut b = self.tail;
        while let Some(index) = b {
            let bref = &mut self.inner[index];
            if bref.refcnt == 0 {
                bref.id = Some((dev, blockno));
                bref.refcnt += 1;
                return Some(index);
            }
            b = bref.prev;
        }
        None
    }

    /// 归还一次引用；引用计数归零时把该块移到链表头部。
    fn move_if_no_ref(&mut self, index: usize) {
        let b = &mut self.inner[index];
        if b.refcnt == 0 {
            panic!("buf unpin not match");
        }
        b.refcnt -= 1;
        if b.refcnt == 0 && self.head != Some(index) {
            self.detach(index);
            self.push_front(index);
        }
    }

    fn detach(&mut self, index: usize) {
        let (prev, next) = (self.inner[index].prev, self.inner[index].next);
        match prev {
            Some(p) => self.inner[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.inner[n].prev = prev,
            None => self.tail = prev,
        }
    }

    fn push_front(&mut self, index: usize) {
        self.inner[index].prev = None;
        self.inner[index].next = self.head;
        match self.head {
            Some(old_head) => self.inner[old_head].prev = Some(index),
            None => self.tail = Some(index),
        }
        self.head = Some(index);
    }
}

struct BufCtrl {
    /// 缓存的 `(设备号, 块号)`；从未使用过的缓冲块为 `None`
    id: Option<(u32, u32)>,

    prev: Option<usize>,

    next: Option<usize>,

    refcnt: usize,
}

impl BufCtrl {
    const fn new() -> Self {
        Self {
            id: None,
            prev: None,
            next: None,
            refcnt: 0,
        }
    }
}

struct BufInner<Q: WaitQueue> {
    /// 数据是否已经从磁盘读入
    valid: AtomicBool,

    data: SleepLock<BufData, Q>,
}

impl<Q: WaitQueue> BufInner<Q> {
    fn new() -> Self {
        Self {
            valid: AtomicBool::new(false),
            data: SleepLock::new(BufData::new(), "BufData"),
        }
    }
}

/// 一个磁盘块大小的数据区，按 8 字节对齐以便按结构体解释。
#[derive(Clone)]
#[repr(C, align(8))]
pub struct BufData([u8; BSIZE]);

impl BufData {
    /// 全零的数据块
    pub const ZERO: BufData = BufData::new();

    pub const fn new() -> Self {
        Self([0; BSIZE])
    }

    /// 把块开头的字节解释为 `T` 并复制出来。
    pub fn read_prefix<T: FromBytes>(&self) -> T {
        match T::read_from_prefix(&self.0) {
            Ok((value, _)) => value,
            Err(_) => panic!("{} does not fit in a block", type_name::<T>()),
        }
    }

    /// 将 `value` 序列化到块开头，块内其余字节保持不变。
    pub fn write_prefix<T: IntoBytes + Immutable>(&mut self, value: &T) {
        if value.write_to_prefix(&mut self.0).is_err() {
            panic!("{} does not fit in a block", type_name::<T>());
        }
    }
}

impl Default for BufData {
    fn default() -> Self {
        Self::new()
    }
}

impl Deref for BufData {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl DerefMut for BufData {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condvar::SpinQueue;
    use crate::driver::ramdisk::RamDisk;
    use std::vec::Vec;

    const DEV: u32 = 1;

    type TestCache<'d> = Bcache<&'d RamDisk<64>, SpinQueue>;

    #[test]
    fn bread_hits_cache_before_bwrite() {
        let disk = RamDisk::<64>::new();
        let cache: TestCache<'_> = Bcache::new(&disk);

        let mut buf = cache.bread(DEV, 10);
        buf[0] = 42;
        drop(buf);

        assert_eq!(cache.bread(DEV, 10)[0], 42);
        assert_eq!(disk.block(10)[0], 0);
        assert_eq!(disk.writes(), 0);
    }

    #[test]
    fn bwrite_reaches_disk() {
        let disk = RamDisk::<64>::new();
        let cache: TestCache<'_> = Bcache::new(&disk);

        let mut buf = cache.bread(DEV, 3);
        buf.fill(7);
        buf.bwrite();
        drop(buf);

        assert!(disk.block(3).iter().all(|&b| b == 7));
    }

    #[test]
    fn released_buffer_gets_recycled() {
        let disk = RamDisk::<64>::new();
        let cache: TestCache<'_> = Bcache::new(&disk);

        for blockno in 0..NBUF as u32 {
            drop(cache.bread(DEV, blockno));
        }
        assert_eq!(cache.ref_count(DEV, 0), Some(0));

        // 块 0 最久未使用，会被最先回收。
        drop(cache.bread(DEV, 50));
        assert_eq!(cache.ref_count(DEV, 0), None);
        assert_eq!(cache.ref_count(DEV, 50), Some(0));
    }

    #[test]
    fn pinned_buffer_survives_recycling() {
        let disk = RamDisk::<64>::new();
        let cache: TestCache<'_> = Bcache::new(&disk);

        let mut buf = cache.bread(DEV, 5);
        buf[0] = 9;
        let pin = buf.pin();
        drop(buf);
        assert_eq!(cache.ref_count(DEV, 5), Some(1));

        // 其余缓冲块被反复回收，块 5 仍驻留在缓存中。
        for blockno in 20..64 {
            drop(cache.bread(DEV, blockno));
        }

        assert_eq!(cache.bread(DEV, 5)[0], 9);
        assert_eq!(pin.read_blockno(), 5);
        drop(pin);
        assert_eq!(cache.ref_count(DEV, 5), Some(0));
    }

    #[test]
    #[should_panic(expected = "no usable buffer")]
    fn exhausting_every_buffer_panics() {
        let disk = RamDisk::<64>::new();
        let cache: TestCache<'_> = Bcache::new(&disk);

        let held: Vec<_> = (0..NBUF as u32).map(|b| cache.bread(DEV, b)).collect();
        let _extra = cache.bread(DEV, 60);
        drop(held);
    }
}
