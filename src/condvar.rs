//! 条件变量模块
//!
//! 内核原本以任意地址作为睡眠“通道”，调用 `sleep(chan, guard)` / `wakeup(chan)`。
//! 这里改为由使用者自己持有的 [`Condvar`]：等待方在持有自旋锁时登记，
//! 随后原子地释放锁并睡眠，被唤醒后重新获取锁。
//!
//! 唤醒总是广播式的，等待方必须在循环中重新检查条件。

use core::hint::spin_loop;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::spinlock::SpinLockGuard;

/// 由调度器提供的等待队列原语。
///
/// 队列维护一个单调递增的唤醒代数（epoch）。等待方先在持锁状态下读取代数，
/// 释放锁后调用 [`WaitQueue::wait_past`] 阻塞到代数发生变化为止；
/// 唤醒方通过 [`WaitQueue::notify_all`] 推进代数并唤醒全部等待者。
/// 只要唤醒方对共享状态的修改发生在持锁期间，这一协议就不会丢失唤醒。
pub trait WaitQueue: Default + Sync {
    /// 读取当前唤醒代数。
    fn epoch(&self) -> u64;

    /// 阻塞当前执行流，直到唤醒代数不再等于 `seen`。
    /// 允许在代数变化后因无关原因返回（虚假唤醒）。
    fn wait_past(&self, seen: u64);

    /// 推进唤醒代数并唤醒所有等待者。
    fn notify_all(&self);
}

/// 与某个自旋锁配合使用的条件变量。
#[derive(Default)]
pub struct Condvar<Q: WaitQueue> {
    queue: Q,
}

impl<Q: WaitQueue> Condvar<Q> {
    pub fn new() -> Self {
        Self { queue: Q::default() }
    }

    /// 释放 `guard` 对应的自旋锁并睡眠，被唤醒后重新获取同一把锁。
    ///
    /// # 功能说明
    /// 相当于内核中的 `sleep(chan, lock)`：释放锁与进入睡眠之间不会丢失唤醒，
    /// 因为唤醒代数是在持锁期间读取的。返回的守卫与传入的守卫保护同一份数据。
    ///
    /// # 可能的错误
    /// 唤醒可能是虚假的，调用者需要在循环中重新判断等待条件。
    pub fn wait<'a, T: ?Sized>(&self, guard: SpinLockGuard<'a, T>) -> SpinLockGuard<'a, T> {
        let seen = self.queue.epoch();
        let lock = guard.spinlock();
        drop(guard);
        self.queue.wait_past(seen);
        lock.lock()
    }

    /// 唤醒所有等待者。
    pub fn notify_all(&self) {
        self.queue.notify_all();
    }
}

/// 不依赖调度器的忙等待队列，适用于启动早期或单元测试。
#[derive(Default)]
pub struct SpinQueue {
    epoch: AtomicU64,
}

impl WaitQueue for SpinQueue {
    fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    fn wait_past(&self, seen: u64) {
        while self.epoch.load(Ordering::Acquire) == seen {
            spin_loop();
        }
    }

    fn notify_all(&self) {
        self.epoch.fetch_add(1, Ordering::Release);
    }
}

#[cfg(any(test, feature = "std"))]
pub use self::thread_queue::ThreadQueue;

#[cfg(any(test, feature = "std"))]
mod thread_queue {
    use std::sync::{Condvar, Mutex, PoisonError};

    use super::WaitQueue;

    /// 基于宿主线程的等待队列，线程在 `std::sync::Condvar` 上真正挂起。
    #[derive(Default)]
    pub struct ThreadQueue {
        epoch: Mutex<u64>,
        cond: Condvar,
    }

    impl WaitQueue for ThreadQueue {
        fn epoch(&self) -> u64 {
            *self.epoch.lock().unwrap_or_else(PoisonError::into_inner)
        }

        fn wait_past(&self, seen: u64) {
            let mut epoch = self.epoch.lock().unwrap_or_else(PoisonError::into_inner);
            while *epoch == seen {
                epoch = self.cond.wait(epoch).unwrap_or_else(PoisonError::into_inner);
            }
        }

        fn notify_all(&self) {
            let mut epoch = self.epoch.lock().unwrap_or_else(PoisonError::into_inner);
            *epoch = epoch.wrapping_add(1);
            self.cond.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spinlock::SpinLock;
    use std::thread;

    fn handoff<Q: WaitQueue>() {
        let state = SpinLock::new(false, "ready");
        let cond: Condvar<Q> = Condvar::new();
        thread::scope(|s| {
            s.spawn(|| {
                let mut guard = state.lock();
                while !*guard {
                    guard = cond.wait(guard);
                }
            });
            s.spawn(|| {
                *state.lock() = true;
                cond.notify_all();
            });
        });
        assert!(*state.lock());
    }

    #[test]
    fn spin_queue_handoff() {
        handoff::<SpinQueue>();
    }

    #[test]
    fn thread_queue_handoff() {
        handoff::<ThreadQueue>();
    }

    #[test]
    fn broadcast_wakes_every_waiter() {
        let state = SpinLock::new(0u32, "gate");
        let cond: Condvar<ThreadQueue> = Condvar::new();
        thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    let mut guard = state.lock();
                    while *guard == 0 {
                        guard = cond.wait(guard);
                    }
                    *guard += 1;
                });
            }
            let mut guard = state.lock();
            *guard = 1;
            cond.notify_all();
        });
        assert_eq!(*state.lock(), 5);
    }
}
