//! 睡眠锁模块
//! 提供基于睡眠/唤醒机制的同步原语，适用于可能长时间持有的锁。
//!
//! 当锁被占用时，尝试获取锁的执行流会在条件变量上睡眠，避免忙等待。
//! 缓冲块的数据在磁盘 I/O 期间一直被持有，因此使用睡眠锁而非自旋锁保护。

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut, Drop};

use crate::condvar::{Condvar, WaitQueue};
use crate::spinlock::SpinLock;

pub struct SleepLock<T: ?Sized, Q: WaitQueue> {
    /// 保护 `locked` 状态的自旋锁
    locked: SpinLock<bool>,
    cond: Condvar<Q>,
    name: &'static str,
    data: UnsafeCell<T>,
}

// 为SleepLock实现Sync，允许跨线程共享（要求T是Send）
unsafe impl<T: ?Sized + Send, Q: WaitQueue> Sync for SleepLock<T, Q> {}

impl<T, Q: WaitQueue> SleepLock<T, Q> {
    pub fn new(data: T, name: &'static str) -> Self {
        Self {
            locked: SpinLock::new(false, "sleeplock"),
            cond: Condvar::new(),
            name,
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized, Q: WaitQueue> SleepLock<T, Q> {
    pub fn lock(&self) -> SleepLockGuard<'_, T, Q> {
        // 获取内部自旋锁（保护locked状态）
        let mut guard = self.locked.lock();

        // 当锁已被占用时循环等待
        while *guard {
            guard = self.cond.wait(guard);
        }

        // 成功获取锁，设置状态
        *guard = true;
        drop(guard);

        SleepLockGuard {
            lock: self,
            data: unsafe { &mut *self.data.get() },
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn unlock(&self) {
        let mut guard = self.locked.lock();
        if !*guard {
            panic!("sleeplock {} release", self.name);
        }
        *guard = false;
        self.cond.notify_all();
        drop(guard);
    }
}

pub struct SleepLockGuard<'a, T: ?Sized, Q: WaitQueue> {
    lock: &'a SleepLock<T, Q>,
    data: &'a mut T,
}

impl<'a, T: ?Sized, Q: WaitQueue> Deref for SleepLockGuard<'a, T, Q> {
    type Target = T;
    fn deref(&self) -> &T {
        &*self.data
    }
}

impl<'a, T: ?Sized, Q: WaitQueue> DerefMut for SleepLockGuard<'a, T, Q> {
    fn deref_mut(&mut self) -> &mut T {
        &mut *self.data
    }
}

impl<'a, T: ?Sized, Q: WaitQueue> Drop for SleepLockGuard<'a, T, Q> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condvar::ThreadQueue;
    use std::thread;

    #[test]
    fn holders_are_serialized() {
        let lock: SleepLock<u64, ThreadQueue> = SleepLock::new(0, "sleep");
        thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..200 {
                        let mut guard = lock.lock();
                        let seen = *guard;
                        thread::yield_now();
                        *guard = seen + 1;
                    }
                });
            }
        });
        assert_eq!(*lock.lock(), 800);
    }
}
